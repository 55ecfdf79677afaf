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

//! # The timeline reader
//!
//! Serves timeline reads, cache-aside:
//!
//! 1. look in the cache; a hit with at least one entry is returned as-is (well, truncated to the
//!    page size) & that's the end of it
//!
//! 2. otherwise (a miss, an empty cached timeline, bytes we can't decode, or a cache that's
//!    down) read the timeline store for the most recent `limit` entries
//!
//! 3. if the store has nothing either, there's no materialized timeline for this user: ask the
//!    rebuilder to make one & tell the caller to come back later ([Error::EmptyTimeline])
//!
//! 4. else return what the store gave us, after asking the populator to warm the cache
//!
//! The "asking" in steps 3 & 4 is a publish to a queue, & it's best-effort: failure is logged &
//! otherwise ignored. A read never waits on cache maintenance or a rebuild.

use std::{num::NonZero, sync::Arc};

use snafu::{Backtrace, prelude::*};
use tracing::{debug, warn};

use crate::{
    ErrorKind,
    cache::{TimelineCache, timeline_key},
    counter_add,
    entities::{Timeline, UserId},
    messages::RebuildRequest,
    metrics::{self, Instruments, Sort},
    storage::{self, TimelineStore},
    transport::{Queue, Transport, publish_json},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{user} has no materialized timeline yet"))]
    EmptyTimeline { user: UserId },
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
            Error::EmptyTimeline { .. } => ErrorKind::EmptyTimeline,
            Error::StoreFailed { .. } => ErrorKind::StoreFailed,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// The number of entries returned when the caller doesn't say
pub const DEFAULT_PAGE_SIZE: NonZero<usize> = NonZero::new(30).unwrap();

/// A successful read
#[derive(Clone, Debug)]
pub struct TimelineRead {
    pub timeline: Timeline,
    /// True if `timeline` came from the cache
    pub cache_hit: bool,
}

inventory::submit! {
    metrics::Registration::new(
        "reader.cache.hits",
        Sort::IntegralCounter,
        "Reads served from the cache"
    )
}
inventory::submit! {
    metrics::Registration::new(
        "reader.cache.misses",
        Sort::IntegralCounter,
        "Reads that fell through to the timeline store"
    )
}
inventory::submit! {
    metrics::Registration::new(
        "reader.timelines.empty",
        Sort::IntegralCounter,
        "Reads that found no materialized timeline"
    )
}

pub struct Reader {
    store: Arc<dyn TimelineStore + Send + Sync>,
    cache: Arc<dyn TimelineCache + Send + Sync>,
    transport: Arc<dyn Transport + Send + Sync>,
    instruments: Arc<Instruments>,
    default_page_size: NonZero<usize>,
}

impl Reader {
    pub fn new(
        store: Arc<dyn TimelineStore + Send + Sync>,
        cache: Arc<dyn TimelineCache + Send + Sync>,
        transport: Arc<dyn Transport + Send + Sync>,
        instruments: Arc<Instruments>,
        default_page_size: Option<NonZero<usize>>,
    ) -> Reader {
        Reader {
            store,
            cache,
            transport,
            instruments,
            default_page_size: default_page_size.unwrap_or(DEFAULT_PAGE_SIZE),
        }
    }

    /// Look for a usable timeline in the cache; any problem at all is just a miss
    async fn cached(&self, user: &UserId) -> Option<Timeline> {
        let bytes = match self.cache.get(&timeline_key(user)).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(err) => {
                warn!("Cache lookup failed; falling back to the store: {err}");
                return None;
            }
        };
        match serde_json::from_slice::<Timeline>(&bytes) {
            Ok(timeline) if !timeline.is_empty() => Some(timeline),
            Ok(_) => {
                debug!("Cached timeline is empty.");
                None
            }
            Err(err) => {
                warn!("Failed to decode the cached timeline: {err}");
                None
            }
        }
    }

    /// Read the `limit` most recent entries of `user`'s timeline
    ///
    /// If `limit` is `None`, the reader's default page size is used.
    #[tracing::instrument(skip(self))]
    pub async fn read(&self, user: &UserId, limit: Option<NonZero<usize>>) -> Result<TimelineRead> {
        let limit = limit.unwrap_or(self.default_page_size);

        if let Some(mut timeline) = self.cached(user).await {
            counter_add!(self.instruments, "reader.cache.hits", 1, &[]);
            timeline.truncate(limit.get());
            return Ok(TimelineRead {
                timeline,
                cache_hit: true,
            });
        }
        counter_add!(self.instruments, "reader.cache.misses", 1, &[]);

        let entries = self
            .store
            .query(user, limit)
            .await
            .context(StoreFailedSnafu { user: user.clone() })?;

        if entries.is_empty() {
            counter_add!(self.instruments, "reader.timelines.empty", 1, &[]);
            let request = RebuildRequest {
                user_id: user.clone(),
            };
            if let Err(err) =
                publish_json(self.transport.as_ref(), Queue::RebuildTimeline, &request).await
            {
                warn!("Failed to request a rebuild: {err}");
            }
            return EmptyTimelineSnafu { user: user.clone() }.fail();
        }

        let timeline = Timeline::new(user.clone(), entries);
        if let Err(err) =
            publish_json(self.transport.as_ref(), Queue::PopulateCache, &timeline).await
        {
            warn!("Failed to request cache population: {err}");
        }
        Ok(TimelineRead {
            timeline,
            cache_hit: false,
        })
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    use crate::{
        cache::{self, InMemory as InMemoryCache},
        memory::Store,
        messages::{PopulateCache, decode},
        testing::{Broken, FlakyTransport, entry, ids, instruments, user},
    };

    struct Fixture {
        store: Arc<Store>,
        cache: Arc<InMemoryCache>,
        transport: Arc<FlakyTransport>,
        reader: Reader,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(Store::new());
        let cache = Arc::new(InMemoryCache::new(&cache::Config::default()));
        let transport = Arc::new(FlakyTransport::new());
        let reader = Reader::new(
            store.clone(),
            cache.clone(),
            transport.clone(),
            instruments(),
            None,
        );
        Fixture {
            store,
            cache,
            transport,
            reader,
        }
    }

    fn publishes(transport: &FlakyTransport) -> usize {
        Queue::ALL.iter().map(|q| transport.depth(*q)).sum()
    }

    #[tokio::test]
    async fn cold_cache() {
        let f = fixture();
        let bob = user("bob");
        for (id, secs) in [("a", 1), ("b", 2), ("c", 3)] {
            f.store.append(&bob, &entry(id, "alice", secs)).await.unwrap();
        }
        let read = f.reader.read(&bob, NonZero::new(2)).await.unwrap();
        assert!(!read.cache_hit);
        assert_eq!(ids(&read.timeline.entries), vec!["c", "b"]);

        // Exactly one populate-cache publish, naming bob
        assert_eq!(publishes(&f.transport), 1);
        let bodies = f.transport.peek(Queue::PopulateCache);
        assert_eq!(
            decode::<PopulateCache>(&bodies[0]).unwrap().user_id,
            bob
        );
    }

    #[tokio::test]
    async fn warm_cache() {
        let f = fixture();
        let bob = user("bob");
        let timeline = Timeline::new(
            bob.clone(),
            vec![entry("a", "alice", 1), entry("b", "alice", 2), entry("c", "alice", 3)],
        );
        f.cache
            .set(
                &timeline_key(&bob),
                serde_json::to_vec(&timeline).unwrap(),
                Duration::from_secs(300),
            )
            .await
            .unwrap();
        let read = f.reader.read(&bob, NonZero::new(2)).await.unwrap();
        assert!(read.cache_hit);
        assert_eq!(ids(&read.timeline.entries), vec!["c", "b"]);
        assert_eq!(publishes(&f.transport), 0);
    }

    #[tokio::test]
    async fn empty_timelines() {
        let f = fixture();
        let bob = user("bob");
        // An empty cached timeline counts as a miss
        f.cache
            .set(
                &timeline_key(&bob),
                serde_json::to_vec(&Timeline::new(bob.clone(), vec![])).unwrap(),
                Duration::from_secs(300),
            )
            .await
            .unwrap();
        let err = f.reader.read(&bob, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmptyTimeline);
        assert_eq!(err.kind().user_message(), "timeline not ready yet, retry shortly");
        // Exactly one rebuild request
        assert_eq!(publishes(&f.transport), 1);
        assert_eq!(
            decode::<RebuildRequest>(&f.transport.peek(Queue::RebuildTimeline)[0])
                .unwrap()
                .user_id,
            bob
        );
    }

    #[tokio::test]
    async fn triggers_are_best_effort() {
        let f = fixture();
        f.transport.break_();
        let bob = user("bob");
        assert_eq!(
            f.reader.read(&bob, None).await.unwrap_err().kind(),
            ErrorKind::EmptyTimeline
        );
        f.store.append(&bob, &entry("a", "alice", 1)).await.unwrap();
        let read = f.reader.read(&bob, None).await.unwrap();
        assert_eq!(read.timeline.len(), 1);
    }

    #[tokio::test]
    async fn cache_failures_fall_back() {
        let store = Arc::new(Store::new());
        let bob = user("bob");
        store.append(&bob, &entry("a", "alice", 1)).await.unwrap();
        let reader = Reader::new(
            store,
            Arc::new(Broken),
            Arc::new(FlakyTransport::new()),
            instruments(),
            None,
        );
        let read = reader.read(&bob, None).await.unwrap();
        assert!(!read.cache_hit);
        assert_eq!(read.timeline.len(), 1);

        // Garbage in the cache is a miss, too
        let f = fixture();
        f.store.append(&bob, &entry("a", "alice", 1)).await.unwrap();
        f.cache
            .set(&timeline_key(&bob), b"garbage".to_vec(), Duration::from_secs(300))
            .await
            .unwrap();
        assert!(!f.reader.read(&bob, None).await.unwrap().cache_hit);
    }

    #[tokio::test]
    async fn store_failures_escalate() {
        let reader = Reader::new(
            Arc::new(Broken),
            Arc::new(InMemoryCache::new(&cache::Config::default())),
            Arc::new(FlakyTransport::new()),
            instruments(),
            None,
        );
        assert_eq!(
            reader.read(&user("bob"), None).await.unwrap_err().kind(),
            ErrorKind::StoreFailed
        );
    }
}
