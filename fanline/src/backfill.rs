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

//! # New-follow backfill
//!
//! When someone follows someone new, seed the follower's timeline with the followee's recent posts
//! by publishing a [FanoutMessage] for each of them, addressed to the follower. The appender does
//! the rest.

use std::{num::NonZero, sync::Arc};

use async_trait::async_trait;
use snafu::{Backtrace, prelude::*};
use tracing::debug;

use crate::{
    ErrorKind,
    consumer::{Handler, HandlerError, MalformedSnafu},
    counter_add,
    entities::UserId,
    messages::{FanoutMessage, Follow, decode_follow_created},
    metrics::{self, Instruments, Sort},
    storage::{self, PostStore},
    transport::{self, Queue, Transport, publish_json},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to fetch {followee}'s recent posts: {source}"))]
    LookupFailed {
        followee: UserId,
        source: storage::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to publish a backfill message for {follower}: {source}"))]
    PublishFailed {
        follower: UserId,
        source: transport::Error,
        backtrace: Backtrace,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::LookupFailed { .. } => ErrorKind::LookupFailed,
            Error::PublishFailed { .. } => ErrorKind::PublishFailed,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub const DEFAULT_PAGE_SIZE: NonZero<usize> = NonZero::new(10).unwrap();

inventory::submit! {
    metrics::Registration::new(
        "backfill.messages.published",
        Sort::IntegralCounter,
        "Fan-out messages published on a new follow"
    )
}

pub struct Backfill {
    posts: Arc<dyn PostStore + Send + Sync>,
    transport: Arc<dyn Transport + Send + Sync>,
    instruments: Arc<Instruments>,
    page_size: NonZero<usize>,
}

impl Backfill {
    pub fn new(
        posts: Arc<dyn PostStore + Send + Sync>,
        transport: Arc<dyn Transport + Send + Sync>,
        instruments: Arc<Instruments>,
        page_size: Option<NonZero<usize>>,
    ) -> Backfill {
        Backfill {
            posts,
            transport,
            instruments,
            page_size: page_size.unwrap_or(DEFAULT_PAGE_SIZE),
        }
    }

    /// Publish the followee's recent posts to the follower's timeline; returns the number published
    #[tracing::instrument(skip(self, follow), fields(follower = %follow.follower, followee = %follow.followed))]
    pub async fn backfill(&self, follow: &Follow) -> Result<usize> {
        let posts = self
            .posts
            .recent_posts_by(&follow.followed, self.page_size)
            .await
            .context(LookupFailedSnafu {
                followee: follow.followed.clone(),
            })?;
        let count = posts.len();
        for tweet in posts {
            let message = FanoutMessage {
                tweet,
                user_id: follow.follower.clone(),
            };
            publish_json(self.transport.as_ref(), Queue::UpdateTimeline, &message)
                .await
                .context(PublishFailedSnafu {
                    follower: follow.follower.clone(),
                })?;
            counter_add!(self.instruments, "backfill.messages.published", 1, &[]);
        }
        debug!("Backfilled {count} posts.");
        Ok(count)
    }
}

#[async_trait]
impl Handler for Backfill {
    fn queue(&self) -> Queue {
        Queue::ProcessNewFollow
    }
    async fn handle(&self, body: &[u8]) -> std::result::Result<(), HandlerError> {
        let event = decode_follow_created(body).context(MalformedSnafu)?;
        self.backfill(&event.follow)
            .await
            .map_err(|err| HandlerError::failed(err.kind(), err))?;
        Ok(())
    }
}
