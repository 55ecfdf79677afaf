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

//! Fixtures shared by the unit tests.

use std::{
    num::NonZero,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use crate::{
    cache::{self, TimelineCache},
    entities::{Post, TimelineEntry, TweetId, UserId},
    metrics::Instruments,
    storage::{self, PostStore, SocialGraph, TimelineStore},
    transport::{self, Delivery, InMemory, Queue, Receipt, Transport},
};

#[derive(Debug)]
pub struct Flaky;

impl std::fmt::Display for Flaky {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "injected failure")
    }
}

impl std::error::Error for Flaky {}

pub fn user(s: &str) -> UserId {
    UserId::new(s).unwrap()
}

pub fn post(id: &str, author: &str, secs: i64) -> Post {
    Post::new(
        TweetId::new(id).unwrap(),
        user(author),
        &format!("post {id}"),
        &Utc.timestamp_opt(secs, 0).unwrap(),
    )
}

pub fn entry(id: &str, author: &str, secs: i64) -> TimelineEntry {
    TimelineEntry::from_post(&post(id, author, secs))
}

pub fn instruments() -> Arc<Instruments> {
    Arc::new(Instruments::new("fanline"))
}

pub fn ids(entries: &[TimelineEntry]) -> Vec<String> {
    entries.iter().map(|e| e.tweet_id.to_string()).collect()
}

/// An [InMemory] transport that can be told to fail
///
/// Publishes fail outright when `broken` is set, or when the payload contains any of the strings
/// in `poisoned`.
#[derive(Default)]
pub struct FlakyTransport {
    pub inner: InMemory,
    pub broken: AtomicBool,
    pub poisoned: Mutex<Vec<String>>,
}

impl FlakyTransport {
    pub fn new() -> FlakyTransport {
        FlakyTransport::default()
    }
    pub fn break_(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }
    pub fn poison(&self, needle: &str) {
        self.poisoned.lock().unwrap().push(needle.to_owned());
    }
    pub fn depth(&self, queue: Queue) -> usize {
        self.inner.depth(queue)
    }
    pub fn peek(&self, queue: Queue) -> Vec<Vec<u8>> {
        self.inner.peek(queue)
    }
}

#[async_trait]
impl Transport for FlakyTransport {
    async fn publish(&self, queue: Queue, payload: Vec<u8>) -> Result<(), transport::Error> {
        let text = String::from_utf8_lossy(&payload).to_string();
        if self.broken.load(Ordering::SeqCst)
            || self
                .poisoned
                .lock()
                .unwrap()
                .iter()
                .any(|needle| text.contains(needle.as_str()))
        {
            return Err(transport::Error::new(Flaky));
        }
        self.inner.publish(queue, payload).await
    }
    async fn receive(
        &self,
        queue: Queue,
        max: NonZero<usize>,
        visibility: Duration,
    ) -> Result<Vec<Delivery>, transport::Error> {
        self.inner.receive(queue, max, visibility).await
    }
    async fn delete(&self, queue: Queue, receipt: &Receipt) -> Result<(), transport::Error> {
        self.inner.delete(queue, receipt).await
    }
}

/// Storage, cache & transport that fail on every call
pub struct Broken;

#[async_trait]
impl TimelineStore for Broken {
    async fn append(&self, _: &UserId, _: &TimelineEntry) -> Result<bool, storage::Error> {
        Err(storage::Error::new(Flaky))
    }
    async fn query(
        &self,
        _: &UserId,
        _: NonZero<usize>,
    ) -> Result<Vec<TimelineEntry>, storage::Error> {
        Err(storage::Error::new(Flaky))
    }
    async fn bulk_replace(&self, _: &UserId, _: &[TimelineEntry]) -> Result<(), storage::Error> {
        Err(storage::Error::new(Flaky))
    }
}

#[async_trait]
impl SocialGraph for Broken {
    async fn followers_of(&self, _: &UserId) -> Result<Vec<UserId>, storage::Error> {
        Err(storage::Error::new(Flaky))
    }
    async fn following_of(&self, _: &UserId) -> Result<Vec<UserId>, storage::Error> {
        Err(storage::Error::new(Flaky))
    }
}

#[async_trait]
impl PostStore for Broken {
    async fn recent_posts_by(
        &self,
        _: &UserId,
        _: NonZero<usize>,
    ) -> Result<Vec<Post>, storage::Error> {
        Err(storage::Error::new(Flaky))
    }
}

#[async_trait]
impl TimelineCache for Broken {
    async fn get(&self, _: &str) -> Result<Option<Vec<u8>>, cache::Error> {
        Err(cache::Error::new(Flaky))
    }
    async fn set(&self, _: &str, _: Vec<u8>, _: Duration) -> Result<(), cache::Error> {
        Err(cache::Error::new(Flaky))
    }
    async fn delete(&self, _: &str) -> Result<(), cache::Error> {
        Err(cache::Error::new(Flaky))
    }
}

#[async_trait]
impl Transport for Broken {
    async fn publish(&self, _: Queue, _: Vec<u8>) -> Result<(), transport::Error> {
        Err(transport::Error::new(Flaky))
    }
    async fn receive(
        &self,
        _: Queue,
        _: NonZero<usize>,
        _: Duration,
    ) -> Result<Vec<Delivery>, transport::Error> {
        Err(transport::Error::new(Flaky))
    }
    async fn delete(&self, _: Queue, _: &Receipt) -> Result<(), transport::Error> {
        Err(transport::Error::new(Flaky))
    }
}
