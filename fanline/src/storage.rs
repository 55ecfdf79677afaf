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

//! # storage
//!
//! Abstractions for the durable collaborators of the pipeline: the per-user [TimelineStore], the
//! [SocialGraph] and the [PostStore].
//!
//! All three are object-safe so that the pipeline components can hold them as
//! `Arc<dyn Trait + Send + Sync>` & have the concrete implementation chosen at startup. The
//! [memory] module provides an in-process implementation of all three; [dynamodb] a durable one.
//!
//! [memory]: crate::memory
//! [dynamodb]: crate::dynamodb

use std::num::NonZero;

use async_trait::async_trait;

use crate::entities::{Post, TimelineEntry, UserId};

#[derive(Debug)]
pub struct Error {
    source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl std::error::Error for Error {}

impl Error {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error {
            source: Box::new(err),
        }
    }
}

/// Durable, per-user timeline storage
#[async_trait]
pub trait TimelineStore {
    /// Write `entry` into `user`'s timeline
    ///
    /// Writes are keyed by `(user, entry.tweet_id)` & the first write wins: if the entry is already
    /// present the call succeeds & the stored entry is left as-is, even when the new payload
    /// differs. This is not last-write-wins; a post's content is fixed once published, so a later
    /// write with the same key can only be a redelivery. Returns true if the entry was newly
    /// written.
    async fn append(&self, user: &UserId, entry: &TimelineEntry) -> Result<bool, Error>;
    /// Retrieve the `limit` most recent entries in `user`'s timeline, newest first
    async fn query(&self, user: &UserId, limit: NonZero<usize>)
    -> Result<Vec<TimelineEntry>, Error>;
    /// Replace the entirety of `user`'s timeline with `entries`
    async fn bulk_replace(&self, user: &UserId, entries: &[TimelineEntry]) -> Result<(), Error>;
}

/// Who follows whom
#[async_trait]
pub trait SocialGraph {
    /// All users following `user`
    async fn followers_of(&self, user: &UserId) -> Result<Vec<UserId>, Error>;
    /// All users `user` follows
    async fn following_of(&self, user: &UserId) -> Result<Vec<UserId>, Error>;
}

/// Read access to the upstream post service's data
#[async_trait]
pub trait PostStore {
    /// The `limit` most recent posts authored by `user`, newest first
    async fn recent_posts_by(&self, user: &UserId, limit: NonZero<usize>)
    -> Result<Vec<Post>, Error>;
}
