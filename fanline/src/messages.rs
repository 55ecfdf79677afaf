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

//! # Queue payloads
//!
//! The JSON shapes that cross the queue boundary. Producers & consumers on either side of a queue
//! (some of them not written in Rust) have to agree on these, so field names are pinned with
//! `#[serde(rename)]` rather than left to follow the Rust field names.
//!
//! The two upstream events, "post created" & "follow created", may arrive either bare or wrapped
//! in a notification envelope: `{"Type": "Notification", "Message": "<the event, as a JSON
//! string>"}`. [decode_post_created] & [decode_follow_created] accept both.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use snafu::{Backtrace, prelude::*};

use crate::entities::{Post, TweetId, UserId};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to deserialize a message: {source}"))]
    De {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Post {id} has no content"))]
    EmptyContent { id: TweetId, backtrace: Backtrace },
    #[snafu(display("Expected a Notification envelope; got {kind:?}"))]
    EnvelopeType {
        kind: Option<String>,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Ask the appender to add `tweet` to `user_id`'s timeline
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FanoutMessage {
    pub tweet: Post,
    /// The follower whose timeline is to receive `tweet`
    pub user_id: UserId,
}

/// Ask the rebuilder to reconstruct a user's timeline
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RebuildRequest {
    #[serde(alias = "userId")]
    pub user_id: UserId,
}

/// Ask the populator to refresh a user's cached timeline
///
/// Producers publish an entire [Timeline](crate::entities::Timeline); anything other than the
/// user ID is ignored, since the populator always re-reads the store.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PopulateCache {
    pub user_id: UserId,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Follow {
    pub id: String,
    #[serde(rename = "followerId")]
    pub follower: UserId,
    #[serde(rename = "followedId")]
    pub followed: UserId,
    #[serde(rename = "createdAt", default)]
    pub created_at: String,
}

/// `follower` has just started following `followed`
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FollowCreated {
    #[serde(rename = "Follow")]
    pub follow: Follow,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "Type")]
    kind: Option<String>,
    #[serde(rename = "Message")]
    message: Option<String>,
}

/// If `body` is a notification envelope, return the message inside it; else return `body`.
fn open_envelope(body: &[u8]) -> Result<Cow<'_, [u8]>> {
    match serde_json::from_slice::<Envelope>(body) {
        Ok(Envelope {
            kind,
            message: Some(message),
        }) => {
            ensure!(
                kind.as_deref() == Some("Notification"),
                EnvelopeTypeSnafu { kind }
            );
            Ok(Cow::Owned(message.into_bytes()))
        }
        _ => Ok(Cow::Borrowed(body)),
    }
}

/// Decode a "post created" event
///
/// The event may be a bare [Post] or `{"tweet": Post}`, either optionally inside an envelope.
pub fn decode_post_created(body: &[u8]) -> Result<Post> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PostCreated {
        Wrapped { tweet: Post },
        Bare(Post),
    }

    let body = open_envelope(body)?;
    let post = match serde_json::from_slice::<PostCreated>(&body).context(DeSnafu)? {
        PostCreated::Wrapped { tweet } => tweet,
        PostCreated::Bare(post) => post,
    };
    ensure!(
        !post.content.is_empty(),
        EmptyContentSnafu {
            id: post.id.clone()
        }
    );
    Ok(post)
}

/// Decode a "follow created" event, optionally inside an envelope
pub fn decode_follow_created(body: &[u8]) -> Result<FollowCreated> {
    let body = open_envelope(body)?;
    serde_json::from_slice::<FollowCreated>(&body).context(DeSnafu)
}

/// Decode any other queue payload
pub fn decode<'de, T: Deserialize<'de>>(body: &'de [u8]) -> Result<T> {
    serde_json::from_slice::<T>(body).context(DeSnafu)
}
