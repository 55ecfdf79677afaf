// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of fanline.
//
// fanline is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// fanline is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with fanline.  If not,
// see <http://www.gnu.org/licenses/>.

//! # dynamodb
//!
//! [TimelineStore], [SocialGraph], [PostStore] & [Transport] implementations for DynamoDB.
//!
//! Tables:
//!
//! - `timelines`: partition key `user_id`, sort key `tweet_id`, with a local secondary index
//!   `timelines_by_created_at` sorting on `created_at` (milliseconds since the epoch)
//! - `follows`: partition key `follower_id`, sort key `followed_id`, with a global secondary index
//!   `followed_id-index` keyed on `followed_id`
//! - `tweets`: partition key `id`, with a global secondary index `user_id-created_at-index`
//! - `messages`: partition key `queue`, sort key `id` (a v7, so time-ordered, UUID)
//!
//! Queue messages carry a lease: `lease_expires` (milliseconds since the epoch; zero for a message
//! nobody holds) & `lease_token`. Receiving a message means winning a conditional update on
//! `lease_expires`; deleting one is conditional on still holding the lease.

use std::{collections::HashMap, num::NonZero, time::Duration};

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, meta::region::RegionProviderChain};
use aws_sdk_dynamodb::{
    config::Credentials,
    error::SdkError,
    primitives::Blob,
    types::{AttributeValue, DeleteRequest, PutRequest, WriteRequest},
};
use chrono::{DateTime, Utc};
use either::Either;
use itertools::Itertools;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_dynamo::aws_sdk_dynamodb_1::{from_items, to_item};
use snafu::{Backtrace, prelude::*};
use tracing::{debug, trace, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    entities::{Post, TimelineEntry, TweetId, UserId},
    storage::{self, PostStore, SocialGraph, TimelineStore},
    transport::{self, Delivery, Queue, Receipt, Transport},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to build a {what} request: {source}"))]
    Build {
        what: &'static str,
        source: aws_sdk_dynamodb::error::BuildError,
        backtrace: Backtrace,
    },
    #[snafu(display("{millis} is not a representable timestamp"))]
    BadMillis { millis: i64, backtrace: Backtrace },
    #[snafu(display("A message item was missing (or had the wrong type for) {name}"))]
    MessageAttribute {
        name: &'static str,
        backtrace: Backtrace,
    },
    #[snafu(display("No endpoint URLs specified"))]
    NoEndpoints { backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

/// Where to find DynamoDB: a region name, or explicit endpoints
pub type Location = Either<String, Vec<Url>>;

/// DynamoDB's limit on the number of requests in one `BatchWriteItem`
const MAX_BATCH_WRITE: usize = 25;

const TIMELINES: &str = "timelines";
const FOLLOWS: &str = "follows";
const TWEETS: &str = "tweets";
const MESSAGES: &str = "messages";

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         table items                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A [TimelineEntry], as stored in `timelines`
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
struct TimelineItem {
    user_id: UserId,
    tweet_id: TweetId,
    author_id: UserId,
    content: String,
    /// Milliseconds since the epoch
    created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ttl: Option<i64>,
}

impl TimelineItem {
    fn new(user: &UserId, entry: &TimelineEntry) -> TimelineItem {
        TimelineItem {
            user_id: user.clone(),
            tweet_id: entry.tweet_id.clone(),
            author_id: entry.author_id.clone(),
            content: entry.content.clone(),
            created_at: entry.created_at.timestamp_millis(),
            ttl: entry.ttl,
        }
    }
}

impl TryFrom<TimelineItem> for TimelineEntry {
    type Error = Error;

    fn try_from(item: TimelineItem) -> Result<TimelineEntry> {
        Ok(TimelineEntry {
            tweet_id: item.tweet_id,
            author_id: item.author_id,
            content: item.content,
            created_at: DateTime::<Utc>::from_timestamp_millis(item.created_at).context(
                BadMillisSnafu {
                    millis: item.created_at,
                },
            )?,
            ttl: item.ttl,
        })
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
struct FollowItem {
    follower_id: UserId,
    followed_id: UserId,
}

/// A [Post], as stored in `tweets`
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
struct PostItem {
    id: TweetId,
    user_id: UserId,
    content: String,
    #[serde(default)]
    created_at: String,
}

impl From<PostItem> for Post {
    fn from(item: PostItem) -> Post {
        Post {
            id: item.id,
            author: item.user_id,
            content: item.content,
            created_at: item.created_at,
        }
    }
}

fn millis(dt: &DateTime<Utc>) -> AttributeValue {
    AttributeValue::N(dt.timestamp_millis().to_string())
}

/// Pull the ID, body & receive count out of a `messages` item, along with the `lease_expires`
/// value we observed
fn message_from_item(item: &HashMap<String, AttributeValue>) -> Result<(String, Vec<u8>, u32, i64)> {
    let id = item
        .get("id")
        .and_then(|av| av.as_s().ok())
        .context(MessageAttributeSnafu { name: "id" })?
        .clone();
    let body = item
        .get("body")
        .and_then(|av| av.as_b().ok())
        .context(MessageAttributeSnafu { name: "body" })?
        .clone()
        .into_inner();
    let receive_count = item
        .get("receive_count")
        .and_then(|av| av.as_n().ok())
        .and_then(|n| n.parse::<u32>().ok())
        .unwrap_or(0);
    let lease_expires = item
        .get("lease_expires")
        .and_then(|av| av.as_n().ok())
        .and_then(|n| n.parse::<i64>().ok())
        .context(MessageAttributeSnafu {
            name: "lease_expires",
        })?;
    Ok((id, body, receive_count, lease_expires))
}

/// Decode the candidate messages a receive turned up, skipping any we can't make sense of
fn leasable(items: &[HashMap<String, AttributeValue>]) -> Vec<(String, Vec<u8>, u32, i64)> {
    items
        .iter()
        .filter_map(|item| match message_from_item(item) {
            Ok(message) => Some(message),
            Err(err) => {
                warn!("Skipping an undecodable message: {err}");
                None
            }
        })
        .collect()
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Client                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub struct Client {
    client: ::aws_sdk_dynamodb::Client,
}

impl Client {
    pub async fn new(
        location: &Location,
        credentials: &Option<(SecretString, SecretString)>,
    ) -> Result<Client> {
        use secrecy::ExposeSecret;
        let creds = credentials.as_ref().map(|(id, secret)| {
            Credentials::new(
                id.expose_secret(),
                secret.expose_secret(),
                None,
                None,
                "fanline",
            )
        });

        let config = match location {
            Either::Left(region) => {
                let region_provider =
                    RegionProviderChain::first_try(Some(Region::new(region.clone())))
                        .or_default_provider()
                        .or_else(Region::new("us-west-2"));
                let mut loader = aws_config::from_env().region(region_provider);
                if let Some(creds) = creds {
                    loader = loader.credentials_provider(creds);
                }
                loader.load().await
            }
            Either::Right(endpoints) => {
                let ep_url = endpoints.first().context(NoEndpointsSnafu)?;
                let mut loader =
                    aws_config::defaults(BehaviorVersion::latest()).endpoint_url(ep_url.as_str());
                if let Some(creds) = creds {
                    loader = loader.credentials_provider(creds);
                }
                loader.load().await
            }
        };
        Ok(Client {
            client: ::aws_sdk_dynamodb::Client::new(&config),
        })
    }

    /// Send `requests` to `table` in batches, resubmitting whatever DynamoDB leaves unprocessed
    async fn batch_write(
        &self,
        table: &str,
        requests: Vec<WriteRequest>,
    ) -> std::result::Result<(), storage::Error> {
        let batches = requests
            .into_iter()
            .chunks(MAX_BATCH_WRITE)
            .into_iter()
            .map(|chunk| chunk.collect::<Vec<_>>())
            .collect::<Vec<_>>();
        for batch in batches {
            let mut pending = HashMap::from([(table.to_owned(), batch)]);
            while !pending.is_empty() {
                let output = self
                    .client
                    .batch_write_item()
                    .set_request_items(Some(pending))
                    .send()
                    .await
                    .map_err(storage::Error::new)?;
                pending = output
                    .unprocessed_items
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|(_, requests)| !requests.is_empty())
                    .collect();
                if !pending.is_empty() {
                    debug!("{table}: resubmitting unprocessed items");
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TimelineStore for Client {
    async fn append(
        &self,
        user: &UserId,
        entry: &TimelineEntry,
    ) -> std::result::Result<bool, storage::Error> {
        let item = to_item(TimelineItem::new(user, entry)).map_err(storage::Error::new)?;

        use aws_sdk_dynamodb::operation::put_item::PutItemError::ConditionalCheckFailedException;
        match self
            .client
            .put_item()
            .table_name(TIMELINES)
            .set_item(Some(item))
            .condition_expression("attribute_not_exists(tweet_id)")
            .send()
            .await
        {
            Ok(_) => Ok(true),
            // The entry's already there; first write wins
            Err(SdkError::ServiceError(ref inner))
                if matches!(inner.err(), ConditionalCheckFailedException(_)) =>
            {
                Ok(false)
            }
            Err(err) => Err(storage::Error::new(err)),
        }
    }

    async fn query(
        &self,
        user: &UserId,
        limit: NonZero<usize>,
    ) -> std::result::Result<Vec<TimelineEntry>, storage::Error> {
        let output = self
            .client
            .query()
            .table_name(TIMELINES)
            .index_name("timelines_by_created_at")
            .key_condition_expression("user_id = :u")
            .expression_attribute_values(":u", AttributeValue::S(user.to_string()))
            .scan_index_forward(false)
            .limit(i32::try_from(limit.get()).unwrap_or(i32::MAX))
            .send()
            .await
            .map_err(storage::Error::new)?;
        let items: Vec<TimelineItem> =
            from_items(output.items.unwrap_or_default()).map_err(storage::Error::new)?;
        items
            .into_iter()
            .map(|item| TimelineEntry::try_from(item).map_err(storage::Error::new))
            .collect()
    }

    async fn bulk_replace(
        &self,
        user: &UserId,
        entries: &[TimelineEntry],
    ) -> std::result::Result<(), storage::Error> {
        let existing = self
            .client
            .query()
            .table_name(TIMELINES)
            .key_condition_expression("user_id = :u")
            .expression_attribute_values(":u", AttributeValue::S(user.to_string()))
            .projection_expression("user_id, tweet_id")
            .into_paginator()
            .items()
            .send()
            .try_collect()
            .await
            .map_err(storage::Error::new)?;
        debug!("Replacing {} entries with {}", existing.len(), entries.len());

        let deletes = existing
            .into_iter()
            .map(|key| {
                DeleteRequest::builder()
                    .set_key(Some(key))
                    .build()
                    .context(BuildSnafu { what: "delete" })
                    .map(|req| WriteRequest::builder().delete_request(req).build())
            })
            .collect::<Result<Vec<_>>>()
            .map_err(storage::Error::new)?;
        self.batch_write(TIMELINES, deletes).await?;

        let puts = entries
            .iter()
            .map(|entry| {
                let item = to_item(TimelineItem::new(user, entry)).map_err(storage::Error::new)?;
                PutRequest::builder()
                    .set_item(Some(item))
                    .build()
                    .context(BuildSnafu { what: "put" })
                    .map(|req| WriteRequest::builder().put_request(req).build())
                    .map_err(storage::Error::new)
            })
            .collect::<std::result::Result<Vec<_>, storage::Error>>()?;
        self.batch_write(TIMELINES, puts).await
    }
}

#[async_trait]
impl SocialGraph for Client {
    async fn followers_of(&self, user: &UserId) -> std::result::Result<Vec<UserId>, storage::Error> {
        let items = self
            .client
            .query()
            .table_name(FOLLOWS)
            .index_name("followed_id-index")
            .key_condition_expression("followed_id = :u")
            .expression_attribute_values(":u", AttributeValue::S(user.to_string()))
            .into_paginator()
            .items()
            .send()
            .try_collect()
            .await
            .map_err(storage::Error::new)?;
        let follows: Vec<FollowItem> = from_items(items).map_err(storage::Error::new)?;
        Ok(follows
            .into_iter()
            .map(|follow| follow.follower_id)
            .collect())
    }

    async fn following_of(&self, user: &UserId) -> std::result::Result<Vec<UserId>, storage::Error> {
        let items = self
            .client
            .query()
            .table_name(FOLLOWS)
            .key_condition_expression("follower_id = :u")
            .expression_attribute_values(":u", AttributeValue::S(user.to_string()))
            .into_paginator()
            .items()
            .send()
            .try_collect()
            .await
            .map_err(storage::Error::new)?;
        let follows: Vec<FollowItem> = from_items(items).map_err(storage::Error::new)?;
        Ok(follows
            .into_iter()
            .map(|follow| follow.followed_id)
            .collect())
    }
}

#[async_trait]
impl PostStore for Client {
    async fn recent_posts_by(
        &self,
        user: &UserId,
        limit: NonZero<usize>,
    ) -> std::result::Result<Vec<Post>, storage::Error> {
        let output = self
            .client
            .query()
            .table_name(TWEETS)
            .index_name("user_id-created_at-index")
            .key_condition_expression("user_id = :u")
            .expression_attribute_values(":u", AttributeValue::S(user.to_string()))
            .scan_index_forward(false)
            .limit(i32::try_from(limit.get()).unwrap_or(i32::MAX))
            .send()
            .await
            .map_err(storage::Error::new)?;
        let posts: Vec<PostItem> =
            from_items(output.items.unwrap_or_default()).map_err(storage::Error::new)?;
        Ok(posts.into_iter().map(Post::from).collect())
    }
}

#[async_trait]
impl Transport for Client {
    async fn publish(
        &self,
        queue: Queue,
        payload: Vec<u8>,
    ) -> std::result::Result<(), transport::Error> {
        self.client
            .put_item()
            .table_name(MESSAGES)
            .item("queue", AttributeValue::S(queue.name().to_owned()))
            .item("id", AttributeValue::S(Uuid::now_v7().to_string()))
            .item("body", AttributeValue::B(Blob::new(payload)))
            .item("lease_expires", AttributeValue::N("0".to_owned()))
            .item("receive_count", AttributeValue::N("0".to_owned()))
            .send()
            .await
            .map_err(transport::Error::new)?;
        Ok(())
    }

    async fn receive(
        &self,
        queue: Queue,
        max: NonZero<usize>,
        visibility: Duration,
    ) -> std::result::Result<Vec<Delivery>, transport::Error> {
        let now = Utc::now();
        let until = now
            + chrono::Duration::from_std(visibility).map_err(transport::Error::new)?;
        // `Limit` applies before the filter, so we can't ask for just `max` items
        let candidates = self
            .client
            .query()
            .table_name(MESSAGES)
            .key_condition_expression("#q = :q")
            .filter_expression("lease_expires < :now")
            .expression_attribute_names("#q", "queue")
            .expression_attribute_values(":q", AttributeValue::S(queue.name().to_owned()))
            .expression_attribute_values(":now", millis(&now))
            .send()
            .await
            .map_err(transport::Error::new)?
            .items
            .unwrap_or_default();

        use aws_sdk_dynamodb::operation::update_item::UpdateItemError::ConditionalCheckFailedException;
        let mut deliveries = Vec::new();
        for (id, body, receive_count, seen) in leasable(&candidates) {
            if deliveries.len() >= max.get() {
                break;
            }
            let token = Uuid::new_v4();
            match self
                .client
                .update_item()
                .table_name(MESSAGES)
                .key("queue", AttributeValue::S(queue.name().to_owned()))
                .key("id", AttributeValue::S(id.clone()))
                .update_expression(
                    "SET lease_expires = :until, lease_token = :token, receive_count = :count",
                )
                .condition_expression("lease_expires = :seen")
                .expression_attribute_values(":until", millis(&until))
                .expression_attribute_values(":token", AttributeValue::S(token.to_string()))
                .expression_attribute_values(
                    ":count",
                    AttributeValue::N((receive_count + 1).to_string()),
                )
                .expression_attribute_values(":seen", AttributeValue::N(seen.to_string()))
                .send()
                .await
            {
                Ok(_) => deliveries.push(Delivery {
                    receipt: Receipt::new(id, token),
                    body,
                    receive_count: receive_count + 1,
                }),
                Err(SdkError::ServiceError(ref inner))
                    if matches!(inner.err(), ConditionalCheckFailedException(_)) =>
                {
                    trace!("Lost the race for {id}");
                }
                Err(err) => return Err(transport::Error::new(err)),
            }
        }
        Ok(deliveries)
    }

    async fn delete(
        &self,
        queue: Queue,
        receipt: &Receipt,
    ) -> std::result::Result<(), transport::Error> {
        use aws_sdk_dynamodb::operation::delete_item::DeleteItemError::ConditionalCheckFailedException;
        match self
            .client
            .delete_item()
            .table_name(MESSAGES)
            .key("queue", AttributeValue::S(queue.name().to_owned()))
            .key("id", AttributeValue::S(receipt.id().to_owned()))
            .condition_expression("lease_token = :token")
            .expression_attribute_values(":token", AttributeValue::S(receipt.token().to_string()))
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(SdkError::ServiceError(ref inner))
                if matches!(inner.err(), ConditionalCheckFailedException(_)) =>
            {
                debug!(%queue, "Lease on {} has passed to another consumer", receipt.id());
                Ok(())
            }
            Err(err) => Err(transport::Error::new(err)),
        }
    }
}
