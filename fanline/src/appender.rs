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

//! # The timeline appender
//!
//! Writes one entry into one follower's timeline. The cache is left alone; it catches up the next
//! time the reader misses.

use std::sync::Arc;

use async_trait::async_trait;
use snafu::{Backtrace, prelude::*};
use tracing::debug;

use crate::{
    ErrorKind,
    consumer::{Handler, HandlerError, MalformedSnafu},
    counter_add,
    entities::{TimelineEntry, TweetId, UserId},
    messages::{FanoutMessage, decode},
    metrics::{self, Instruments, Sort},
    storage::{self, TimelineStore},
    transport::Queue,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to append {tweet_id} to {user}'s timeline: {source}"))]
    StoreFailed {
        user: UserId,
        tweet_id: TweetId,
        source: storage::Error,
        backtrace: Backtrace,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::StoreFailed { .. } => ErrorKind::StoreFailed,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

inventory::submit! {
    metrics::Registration::new(
        "appender.entries.written",
        Sort::IntegralCounter,
        "Timeline entries written"
    )
}
inventory::submit! {
    metrics::Registration::new(
        "appender.entries.duplicate",
        Sort::IntegralCounter,
        "Redelivered timeline entries that were already present"
    )
}

pub struct Appender {
    store: Arc<dyn TimelineStore + Send + Sync>,
    instruments: Arc<Instruments>,
}

impl Appender {
    pub fn new(
        store: Arc<dyn TimelineStore + Send + Sync>,
        instruments: Arc<Instruments>,
    ) -> Appender {
        Appender { store, instruments }
    }
    /// Write `entry` into `user`'s timeline; writing the same tweet twice is harmless
    ///
    /// Returns true if the entry was new.
    #[tracing::instrument(skip(self, entry), fields(tweet_id = %entry.tweet_id))]
    pub async fn append(&self, entry: &TimelineEntry, user: &UserId) -> Result<bool> {
        let written = self
            .store
            .append(user, entry)
            .await
            .context(StoreFailedSnafu {
                user: user.clone(),
                tweet_id: entry.tweet_id.clone(),
            })?;
        if written {
            counter_add!(self.instruments, "appender.entries.written", 1, &[]);
        } else {
            debug!("Duplicate delivery.");
            counter_add!(self.instruments, "appender.entries.duplicate", 1, &[]);
        }
        Ok(written)
    }
}

#[async_trait]
impl Handler for Appender {
    fn queue(&self) -> Queue {
        Queue::UpdateTimeline
    }
    async fn handle(&self, body: &[u8]) -> std::result::Result<(), HandlerError> {
        let message = decode::<FanoutMessage>(body).context(MalformedSnafu)?;
        self.append(&TimelineEntry::from_post(&message.tweet), &message.user_id)
            .await
            .map_err(|err| HandlerError::failed(err.kind(), err))?;
        Ok(())
    }
}
