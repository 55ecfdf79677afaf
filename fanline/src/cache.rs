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

//! # The timeline cache
//!
//! The cache is a derived, time-bounded & non-authoritative replica of the timeline store: a map
//! from string keys to opaque serialized timelines, each with a time-to-live. Nothing in the
//! pipeline may depend on a value being present, & cache failures on the read path are never
//! surfaced to callers.
//!
//! [InMemory] is a bounded LRU whose entries also expire; it uses [tokio::time::Instant] so that
//! tests can pause & advance the clock.

use std::{num::NonZero, time::Duration};

use async_trait::async_trait;
use lru::LruCache;
use serde::Deserialize;
use tokio::{sync::Mutex, time::Instant};
use tracing::trace;

use crate::entities::UserId;

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

/// A key-value cache with per-entry expiry
#[async_trait]
pub trait TimelineCache {
    /// Retrieve the value stored under `key`, if any (& if it hasn't expired)
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error>;
    /// Store `value` under `key` for `ttl`
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), Error>;
    async fn delete(&self, key: &str) -> Result<(), Error>;
}

/// The cache key under which `user`'s timeline is stored
pub fn timeline_key(user: &UserId) -> String {
    format!("timeline:{}", user)
}

/// [InMemory] configuration
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum number of timelines held; the least-recently used is evicted beyond this
    pub capacity: NonZero<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            capacity: NonZero::new(10_000).unwrap(/* known good */),
        }
    }
}

const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

struct Cached {
    value: Vec<u8>,
    expires: Instant,
}

/// An in-process [TimelineCache]
pub struct InMemory {
    entries: Mutex<LruCache<String, Cached>>,
}

impl InMemory {
    pub fn new(config: &Config) -> InMemory {
        InMemory {
            entries: Mutex::new(LruCache::new(config.capacity)),
        }
    }
}

#[async_trait]
impl TimelineCache for InMemory {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let mut entries = self.entries.lock().await;
        let expired = match entries.get(key) {
            Some(cached) if cached.expires > Instant::now() => return Ok(Some(cached.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            trace!("{key} has expired");
            entries.pop(key);
        }
        Ok(None)
    }
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), Error> {
        let now = Instant::now();
        // A TTL too large to represent never expires
        let expires = now.checked_add(ttl).unwrap_or(now + FAR_FUTURE);
        self.entries
            .lock()
            .await
            .put(key.to_owned(), Cached { value, expires });
        Ok(())
    }
    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.entries.lock().await.pop(key);
        Ok(())
    }
}
