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

//! # The cache populator
//!
//! Refreshes one user's cached timeline from the timeline store. Whatever the triggering message
//! carried, the populator re-reads the store: the store is the source of truth.

use std::{num::NonZero, sync::Arc, time::Duration};

use async_trait::async_trait;
use snafu::{Backtrace, prelude::*};
use tracing::debug;

use crate::{
    ErrorKind,
    cache::{self, TimelineCache, timeline_key},
    consumer::{Handler, HandlerError, MalformedSnafu},
    counter_add,
    entities::{Timeline, UserId},
    messages::{PopulateCache, decode},
    metrics::{self, Instruments, Sort},
    storage::{self, TimelineStore},
    transport::Queue,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to write {user}'s timeline to the cache: {source}"))]
    CacheFailed {
        user: UserId,
        source: cache::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to serialize {user}'s timeline: {source}"))]
    Ser {
        user: UserId,
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to read {user}'s timeline: {source}"))]
    StoreFailed {
        user: UserId,
        source: storage::Error,
        backtrace: Backtrace,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::CacheFailed { .. } | Error::Ser { .. } => ErrorKind::CacheFailed,
            Error::StoreFailed { .. } => ErrorKind::StoreFailed,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// The number of entries cached per user
pub const DEFAULT_WINDOW: NonZero<usize> = NonZero::new(100).unwrap();

/// How long a cached timeline lives
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

inventory::submit! {
    metrics::Registration::new(
        "populator.timelines.cached",
        Sort::IntegralCounter,
        "Timelines written to the cache"
    )
}

pub struct Populator {
    store: Arc<dyn TimelineStore + Send + Sync>,
    cache: Arc<dyn TimelineCache + Send + Sync>,
    instruments: Arc<Instruments>,
    window: NonZero<usize>,
    ttl: Duration,
}

impl Populator {
    pub fn new(
        store: Arc<dyn TimelineStore + Send + Sync>,
        cache: Arc<dyn TimelineCache + Send + Sync>,
        instruments: Arc<Instruments>,
        window: Option<NonZero<usize>>,
        ttl: Option<Duration>,
    ) -> Populator {
        Populator {
            store,
            cache,
            instruments,
            window: window.unwrap_or(DEFAULT_WINDOW),
            ttl: ttl.unwrap_or(DEFAULT_TTL),
        }
    }

    /// Cache the most recent entries of `user`'s timeline
    ///
    /// An empty timeline is cached as such; the reader treats it as a miss.
    #[tracing::instrument(skip(self))]
    pub async fn populate(&self, user: &UserId) -> Result<()> {
        let entries = self
            .store
            .query(user, self.window)
            .await
            .context(StoreFailedSnafu { user: user.clone() })?;
        let timeline = Timeline::new(user.clone(), entries);
        let bytes = serde_json::to_vec(&timeline).context(SerSnafu { user: user.clone() })?;
        self.cache
            .set(&timeline_key(user), bytes, self.ttl)
            .await
            .context(CacheFailedSnafu { user: user.clone() })?;
        debug!("Cached {} entries.", timeline.len());
        counter_add!(self.instruments, "populator.timelines.cached", 1, &[]);
        Ok(())
    }
}

#[async_trait]
impl Handler for Populator {
    fn queue(&self) -> Queue {
        Queue::PopulateCache
    }
    async fn handle(&self, body: &[u8]) -> std::result::Result<(), HandlerError> {
        let request = decode::<PopulateCache>(body).context(MalformedSnafu)?;
        self.populate(&request.user_id)
            .await
            .map_err(|err| HandlerError::failed(err.kind(), err))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::{
        cache::InMemory as InMemoryCache,
        memory::Store,
        testing::{Broken, entry, ids, instruments, user},
    };

    #[tokio::test]
    async fn caches_the_window() {
        let store = Arc::new(Store::new());
        let cache = Arc::new(InMemoryCache::new(&cache::Config::default()));
        let bob = user("bob");
        for i in 0..5 {
            store
                .append(&bob, &entry(&format!("t{i}"), "alice", i))
                .await
                .unwrap();
        }
        let populator = Populator::new(
            store,
            cache.clone(),
            instruments(),
            NonZero::new(3),
            None,
        );
        // The handler accepts an entire timeline, too
        populator
            .handle(br#"{"user_id":"bob","entries":[]}"#)
            .await
            .unwrap();

        let bytes = cache.get("timeline:bob").await.unwrap().unwrap();
        let timeline = serde_json::from_slice::<Timeline>(&bytes).unwrap();
        assert_eq!(timeline.user_id, bob);
        assert_eq!(ids(&timeline.entries), vec!["t4", "t3", "t2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire() {
        let store = Arc::new(Store::new());
        let cache = Arc::new(InMemoryCache::new(&cache::Config::default()));
        let bob = user("bob");
        store.append(&bob, &entry("t1", "alice", 1)).await.unwrap();
        let populator = Populator::new(store, cache.clone(), instruments(), None, None);
        populator.populate(&bob).await.unwrap();
        assert!(cache.get("timeline:bob").await.unwrap().is_some());
        tokio::time::advance(DEFAULT_TTL + Duration::from_secs(1)).await;
        assert!(cache.get("timeline:bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failures() {
        let cache = Arc::new(InMemoryCache::new(&cache::Config::default()));
        let populator = Populator::new(Arc::new(Broken), cache, instruments(), None, None);
        assert_eq!(
            populator.populate(&user("bob")).await.unwrap_err().kind(),
            ErrorKind::StoreFailed
        );

        let populator = Populator::new(
            Arc::new(Store::new()),
            Arc::new(Broken),
            instruments(),
            None,
            None,
        );
        assert_eq!(
            populator.populate(&user("bob")).await.unwrap_err().kind(),
            ErrorKind::CacheFailed
        );
        assert!(matches!(
            populator.handle(b"not json").await,
            Err(HandlerError::Malformed { .. })
        ));
    }
}
