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

//! # Message transport
//!
//! # Introduction
//!
//! The pipeline stages talk to one another only through named queues. Each stage owns exactly one
//! inbound [Queue] and publishes to zero or more others. The [Transport] trait is the contract the
//! stages rely upon: `publish()` on the producing side; `receive()` & `delete()` on the consuming
//! side.
//!
//! # Delivery semantics
//!
//! Delivery is at-least-once. A received message is "leased" to the receiver for a visibility
//! timeout, during which no one else will see it. If the receiver deletes it before the lease
//! expires, it's gone for good; if not (because processing failed, or the process died), the lease
//! lapses & the message will be delivered again. Every consumer must therefore tolerate seeing the
//! same message more than once.
//!
//! [InMemory] implements exactly this in-process; the [dynamodb] module implements it on top of a
//! DynamoDB table so that several `fanlined` instances can share the work.
//!
//! [dynamodb]: crate::dynamodb

use std::{
    collections::{HashMap, VecDeque},
    fmt::Display,
    num::NonZero,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

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

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             queues                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The queues connecting the pipeline stages
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Queue {
    /// "post created" events, consumed by the fan-out orchestrator
    OrchestrateFanout,
    /// one message per (post, follower), consumed by the timeline appender
    UpdateTimeline,
    /// consumed by the cache populator
    PopulateCache,
    /// rebuild requests, consumed by the timeline rebuilder
    RebuildTimeline,
    /// rebuilt timelines, consumed by the timeline persister
    PersistTimeline,
    /// "follow created" events, consumed by the follow backfill
    ProcessNewFollow,
}

impl Queue {
    pub const ALL: [Queue; 6] = [
        Queue::OrchestrateFanout,
        Queue::UpdateTimeline,
        Queue::PopulateCache,
        Queue::RebuildTimeline,
        Queue::PersistTimeline,
        Queue::ProcessNewFollow,
    ];
    pub fn name(&self) -> &'static str {
        match self {
            Queue::OrchestrateFanout => "orchestrate-fanout",
            Queue::UpdateTimeline => "update-timeline",
            Queue::PopulateCache => "populate-cache",
            Queue::RebuildTimeline => "rebuild-timeline",
            Queue::PersistTimeline => "persist-timeline",
            Queue::ProcessNewFollow => "process-new-follow",
        }
    }
}

impl Display for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Transport                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Opaque handle identifying one lease on one message
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Receipt {
    id: String,
    token: Uuid,
}

impl Receipt {
    pub fn new(id: String, token: Uuid) -> Receipt {
        Receipt { id, token }
    }
    /// The ID of the leased message
    pub fn id(&self) -> &str {
        &self.id
    }
    /// The lease token
    pub fn token(&self) -> &Uuid {
        &self.token
    }
}

/// A received message
#[derive(Clone, Debug)]
pub struct Delivery {
    pub receipt: Receipt,
    pub body: Vec<u8>,
    /// How many times this message has been received, this delivery included
    pub receive_count: u32,
}

#[async_trait]
pub trait Transport {
    /// Enqueue `payload` on `queue`
    async fn publish(&self, queue: Queue, payload: Vec<u8>) -> Result<(), Error>;
    /// Lease up to `max` visible messages from `queue` for `visibility`
    async fn receive(
        &self,
        queue: Queue,
        max: NonZero<usize>,
        visibility: Duration,
    ) -> Result<Vec<Delivery>, Error>;
    /// Remove a message for good
    ///
    /// Deleting with a receipt whose lease has lapsed & been handed to someone else is a no-op.
    async fn delete(&self, queue: Queue, receipt: &Receipt) -> Result<(), Error>;
}

/// Serialize `message` to JSON & publish it to `queue`
pub async fn publish_json<T: Serialize + Sync>(
    transport: &(dyn Transport + Send + Sync),
    queue: Queue,
    message: &T,
) -> Result<(), Error> {
    let payload = serde_json::to_vec(message).map_err(Error::new)?;
    transport.publish(queue, payload).await
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            InMemory                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug)]
struct Message {
    id: Uuid,
    body: Vec<u8>,
    lease: Option<(Uuid, Instant)>,
    receive_count: u32,
}

/// An in-process [Transport]
#[derive(Debug, Default)]
pub struct InMemory {
    queues: Mutex<HashMap<Queue, VecDeque<Message>>>,
}

impl InMemory {
    pub fn new() -> InMemory {
        InMemory::default()
    }
    fn queues(&self) -> MutexGuard<'_, HashMap<Queue, VecDeque<Message>>> {
        self.queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
    /// The number of messages on `queue`, leased or not
    pub fn depth(&self, queue: Queue) -> usize {
        self.queues().get(&queue).map(|q| q.len()).unwrap_or(0)
    }
    /// The bodies of all messages on `queue`, oldest first
    pub fn peek(&self, queue: Queue) -> Vec<Vec<u8>> {
        self.queues()
            .get(&queue)
            .map(|q| q.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for InMemory {
    async fn publish(&self, queue: Queue, payload: Vec<u8>) -> Result<(), Error> {
        self.queues().entry(queue).or_default().push_back(Message {
            id: Uuid::now_v7(),
            body: payload,
            lease: None,
            receive_count: 0,
        });
        Ok(())
    }
    async fn receive(
        &self,
        queue: Queue,
        max: NonZero<usize>,
        visibility: Duration,
    ) -> Result<Vec<Delivery>, Error> {
        let now = Instant::now();
        Ok(self
            .queues()
            .entry(queue)
            .or_default()
            .iter_mut()
            .filter(|m| m.lease.is_none_or(|(_, expires)| expires <= now))
            .take(max.get())
            .map(|m| {
                let token = Uuid::new_v4();
                m.lease = Some((token, now + visibility));
                m.receive_count += 1;
                Delivery {
                    receipt: Receipt::new(m.id.to_string(), token),
                    body: m.body.clone(),
                    receive_count: m.receive_count,
                }
            })
            .collect())
    }
    async fn delete(&self, queue: Queue, receipt: &Receipt) -> Result<(), Error> {
        let mut queues = self.queues();
        if let Some(q) = queues.get_mut(&queue) {
            match q.iter().position(|m| {
                m.id.to_string() == receipt.id()
                    && matches!(m.lease, Some((token, _)) if token == *receipt.token())
            }) {
                Some(idx) => {
                    q.remove(idx);
                }
                None => debug!("{} on {queue} is no longer leased under this receipt", receipt.id()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn queue_names() {
        assert_eq!(Queue::UpdateTimeline.name(), "update-timeline");
        assert_eq!(
            serde_json::from_str::<Queue>("\"process-new-follow\"").unwrap(),
            Queue::ProcessNewFollow
        );
        assert!(
            Queue::ALL
                .iter()
                .all(|q| serde_json::to_string(q).unwrap() == format!("\"{}\"", q.name()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn leases() {
        let transport = InMemory::new();
        let max = NonZero::new(10).unwrap();
        let visibility = Duration::from_secs(30);
        transport
            .publish(Queue::RebuildTimeline, b"one".to_vec())
            .await
            .unwrap();
        transport
            .publish(Queue::RebuildTimeline, b"two".to_vec())
            .await
            .unwrap();

        let batch = transport
            .receive(Queue::RebuildTimeline, max, visibility)
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].body, b"one");
        assert_eq!(batch[0].receive_count, 1);

        // Both are leased, so invisible...
        assert!(
            transport
                .receive(Queue::RebuildTimeline, max, visibility)
                .await
                .unwrap()
                .is_empty()
        );
        // delete the first...
        transport
            .delete(Queue::RebuildTimeline, &batch[0].receipt)
            .await
            .unwrap();
        assert_eq!(transport.depth(Queue::RebuildTimeline), 1);

        // & let the lease on the second lapse:
        tokio::time::advance(Duration::from_secs(31)).await;
        let again = transport
            .receive(Queue::RebuildTimeline, max, visibility)
            .await
            .unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].body, b"two");
        assert_eq!(again[0].receive_count, 2);

        // The stale receipt no longer removes the message:
        transport
            .delete(Queue::RebuildTimeline, &batch[1].receipt)
            .await
            .unwrap();
        assert_eq!(transport.depth(Queue::RebuildTimeline), 1);
        transport
            .delete(Queue::RebuildTimeline, &again[0].receipt)
            .await
            .unwrap();
        assert_eq!(transport.depth(Queue::RebuildTimeline), 0);
    }

    #[tokio::test]
    async fn batches_are_bounded() {
        let transport = InMemory::new();
        for i in 0..5u8 {
            publish_json(&transport, Queue::UpdateTimeline, &i)
                .await
                .unwrap();
        }
        let batch = transport
            .receive(
                Queue::UpdateTimeline,
                NonZero::new(3).unwrap(),
                Duration::from_secs(30),
            )
            .await
            .unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(transport.peek(Queue::UpdateTimeline)[4], b"4");
    }
}
