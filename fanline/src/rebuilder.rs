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

//! # Timeline rebuilds
//!
//! The pull-based fallback for users with no materialized timeline. A rebuild happens in two
//! steps, each behind its own queue:
//!
//! 1. the [Rebuilder] recomputes the timeline from the recent posts of everyone the user follows,
//!    and publishes the result to [persist-timeline](Queue::PersistTimeline)
//!
//! 2. the [Persister] replaces the user's stored timeline with that result, then asks the
//!    populator to refresh the cache
//!
//! Neither step touches the cache directly.

use std::{num::NonZero, sync::Arc};

use async_trait::async_trait;
use snafu::{Backtrace, prelude::*};
use tracing::{debug, info, warn};

use crate::{
    ErrorKind,
    consumer::{Handler, HandlerError, MalformedSnafu},
    counter_add,
    entities::{Timeline, TimelineEntry, UserId, sort_newest_first},
    messages::{PopulateCache, RebuildRequest, decode},
    metrics::{self, Instruments, Sort},
    storage::{self, PostStore, SocialGraph, TimelineStore},
    transport::{self, Queue, Transport, publish_json},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to look up the users {user} follows: {source}"))]
    Following {
        user: UserId,
        source: storage::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to fetch {followee}'s recent posts: {source}"))]
    RecentPosts {
        followee: UserId,
        source: storage::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to publish {user}'s rebuilt timeline: {source}"))]
    PublishFailed {
        user: UserId,
        source: transport::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to replace {user}'s timeline: {source}"))]
    StoreFailed {
        user: UserId,
        source: storage::Error,
        backtrace: Backtrace,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Following { .. } | Error::RecentPosts { .. } => ErrorKind::LookupFailed,
            Error::PublishFailed { .. } => ErrorKind::PublishFailed,
            Error::StoreFailed { .. } => ErrorKind::StoreFailed,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// The number of recent posts taken from each followee
pub const DEFAULT_PAGE_SIZE: NonZero<usize> = NonZero::new(10).unwrap();

inventory::submit! {
    metrics::Registration::new(
        "rebuilder.timelines.published",
        Sort::IntegralCounter,
        "Rebuilt timelines handed off for persistence"
    )
}
inventory::submit! {
    metrics::Registration::new(
        "rebuilder.timelines.persisted",
        Sort::IntegralCounter,
        "Rebuilt timelines written to the store"
    )
}

/// How a successful rebuild turned out
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Rebuilt {
    /// The user follows no one; nothing was published
    NoFollowing,
    /// No one the user follows has posted anything; nothing was published
    NoPosts,
    /// A timeline of this many entries was published for persistence
    Published(usize),
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Rebuilder                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub struct Rebuilder {
    graph: Arc<dyn SocialGraph + Send + Sync>,
    posts: Arc<dyn PostStore + Send + Sync>,
    transport: Arc<dyn Transport + Send + Sync>,
    instruments: Arc<Instruments>,
    page_size: NonZero<usize>,
}

impl Rebuilder {
    pub fn new(
        graph: Arc<dyn SocialGraph + Send + Sync>,
        posts: Arc<dyn PostStore + Send + Sync>,
        transport: Arc<dyn Transport + Send + Sync>,
        instruments: Arc<Instruments>,
        page_size: Option<NonZero<usize>>,
    ) -> Rebuilder {
        Rebuilder {
            graph,
            posts,
            transport,
            instruments,
            page_size: page_size.unwrap_or(DEFAULT_PAGE_SIZE),
        }
    }

    /// Recompute `user`'s timeline from their followees' recent posts & publish it for persistence
    #[tracing::instrument(skip(self))]
    pub async fn rebuild(&self, user: &UserId) -> Result<Rebuilt> {
        let following = self
            .graph
            .following_of(user)
            .await
            .context(FollowingSnafu { user: user.clone() })?;
        if following.is_empty() {
            debug!("{user} follows no one; nothing to rebuild.");
            return Ok(Rebuilt::NoFollowing);
        }

        let mut entries: Vec<TimelineEntry> = Vec::new();
        for followee in following {
            let posts = self
                .posts
                .recent_posts_by(&followee, self.page_size)
                .await
                .context(RecentPostsSnafu {
                    followee: followee.clone(),
                })?;
            entries.extend(posts.iter().map(TimelineEntry::from_post));
        }
        if entries.is_empty() {
            debug!("No recent posts; nothing to rebuild.");
            return Ok(Rebuilt::NoPosts);
        }

        sort_newest_first(&mut entries);
        let count = entries.len();
        let timeline = Timeline {
            user_id: user.clone(),
            entries,
        };
        publish_json(self.transport.as_ref(), Queue::PersistTimeline, &timeline)
            .await
            .context(PublishFailedSnafu { user: user.clone() })?;
        counter_add!(self.instruments, "rebuilder.timelines.published", 1, &[]);
        info!("Rebuilt a timeline of {count} entries.");
        Ok(Rebuilt::Published(count))
    }
}

#[async_trait]
impl Handler for Rebuilder {
    fn queue(&self) -> Queue {
        Queue::RebuildTimeline
    }
    async fn handle(&self, body: &[u8]) -> std::result::Result<(), HandlerError> {
        let request = decode::<RebuildRequest>(body).context(MalformedSnafu)?;
        self.rebuild(&request.user_id)
            .await
            .map_err(|err| HandlerError::failed(err.kind(), err))?;
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Persister                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub struct Persister {
    store: Arc<dyn TimelineStore + Send + Sync>,
    transport: Arc<dyn Transport + Send + Sync>,
    instruments: Arc<Instruments>,
}

impl Persister {
    pub fn new(
        store: Arc<dyn TimelineStore + Send + Sync>,
        transport: Arc<dyn Transport + Send + Sync>,
        instruments: Arc<Instruments>,
    ) -> Persister {
        Persister {
            store,
            transport,
            instruments,
        }
    }

    /// Replace the stored timeline with `timeline`, then ask for the cache to be refreshed
    #[tracing::instrument(skip(self, timeline), fields(user = %timeline.user_id, entries = timeline.len()))]
    pub async fn persist(&self, timeline: &Timeline) -> Result<()> {
        self.store
            .bulk_replace(&timeline.user_id, &timeline.entries)
            .await
            .context(StoreFailedSnafu {
                user: timeline.user_id.clone(),
            })?;
        counter_add!(self.instruments, "rebuilder.timelines.persisted", 1, &[]);
        let request = PopulateCache {
            user_id: timeline.user_id.clone(),
        };
        if let Err(err) = publish_json(self.transport.as_ref(), Queue::PopulateCache, &request).await
        {
            warn!("Failed to request cache population: {err}");
        }
        Ok(())
    }
}

#[async_trait]
impl Handler for Persister {
    fn queue(&self) -> Queue {
        Queue::PersistTimeline
    }
    async fn handle(&self, body: &[u8]) -> std::result::Result<(), HandlerError> {
        let timeline = decode::<Timeline>(body).context(MalformedSnafu)?;
        self.persist(&timeline)
            .await
            .map_err(|err| HandlerError::failed(err.kind(), err))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::{
        entities::{Post, TweetId},
        memory::Store,
        testing::{Broken, FlakyTransport, entry, ids, instruments, post, user},
    };

    fn rebuilder(store: &Arc<Store>, transport: &Arc<FlakyTransport>) -> Rebuilder {
        Rebuilder::new(
            store.clone(),
            store.clone(),
            transport.clone(),
            instruments(),
            None,
        )
    }

    #[tokio::test]
    async fn merges_followees() {
        let store = Arc::new(Store::new());
        let transport = Arc::new(FlakyTransport::new());
        let (bob, alice, carol) = (user("bob"), user("alice"), user("carol"));
        store.follow(&bob, &alice);
        store.follow(&bob, &carol);
        store.add_post(post("a10", "alice", 10));
        store.add_post(post("a5", "alice", 5));
        store.add_post(post("c8", "carol", 8));

        assert_eq!(
            rebuilder(&store, &transport).rebuild(&bob).await.unwrap(),
            Rebuilt::Published(3)
        );
        let bodies = transport.peek(Queue::PersistTimeline);
        assert_eq!(bodies.len(), 1);
        let timeline = decode::<Timeline>(&bodies[0]).unwrap();
        assert_eq!(timeline.user_id, bob);
        assert_eq!(ids(&timeline.entries), vec!["a10", "c8", "a5"]);

        // Persist it & the store has exactly that
        let persister = Persister::new(store.clone(), transport.clone(), instruments());
        persister.handle(&bodies[0]).await.unwrap();
        let stored = store.query(&bob, NonZero::new(10).unwrap()).await.unwrap();
        assert_eq!(ids(&stored), vec!["a10", "c8", "a5"]);
        assert_eq!(
            decode::<PopulateCache>(&transport.peek(Queue::PopulateCache)[0])
                .unwrap()
                .user_id,
            bob
        );
    }

    #[tokio::test]
    async fn nothing_to_rebuild() {
        let store = Arc::new(Store::new());
        let transport = Arc::new(FlakyTransport::new());
        let bob = user("bob");
        assert_eq!(
            rebuilder(&store, &transport).rebuild(&bob).await.unwrap(),
            Rebuilt::NoFollowing
        );
        store.follow(&bob, &user("alice"));
        assert_eq!(
            rebuilder(&store, &transport).rebuild(&bob).await.unwrap(),
            Rebuilt::NoPosts
        );
        assert!(Queue::ALL.iter().all(|q| transport.depth(*q) == 0));
        assert_eq!(store.timeline_mutations(), 0);
    }

    #[tokio::test]
    async fn bad_timestamps_become_now() {
        let store = Arc::new(Store::new());
        let transport = Arc::new(FlakyTransport::new());
        let bob = user("bob");
        store.follow(&bob, &user("alice"));
        store.add_post(post("old", "alice", 10));
        store.add_post(Post {
            id: TweetId::new("garbled").unwrap(),
            author: user("alice"),
            content: "hi".to_owned(),
            created_at: "last tuesday".to_owned(),
        });
        rebuilder(&store, &transport).rebuild(&bob).await.unwrap();
        let timeline = decode::<Timeline>(&transport.peek(Queue::PersistTimeline)[0]).unwrap();
        assert_eq!(ids(&timeline.entries), vec!["garbled", "old"]);
        assert!(timeline.entries[0].created_at > chrono::Utc::now() - chrono::Duration::minutes(1));
    }

    // A full page of good posts mustn't crowd out one whose timestamp won't parse
    #[tokio::test]
    async fn bad_timestamps_survive_a_full_page() {
        let store = Arc::new(Store::new());
        let transport = Arc::new(FlakyTransport::new());
        let bob = user("bob");
        store.follow(&bob, &user("alice"));
        for i in 0..DEFAULT_PAGE_SIZE.get() {
            store.add_post(post(&format!("p{i}"), "alice", 100 + i as i64));
        }
        store.add_post(Post {
            id: TweetId::new("garbled").unwrap(),
            author: user("alice"),
            content: "hi".to_owned(),
            created_at: "last tuesday".to_owned(),
        });
        assert_eq!(
            rebuilder(&store, &transport).rebuild(&bob).await.unwrap(),
            Rebuilt::Published(DEFAULT_PAGE_SIZE.get())
        );
        let timeline = decode::<Timeline>(&transport.peek(Queue::PersistTimeline)[0]).unwrap();
        assert_eq!(
            ids(&timeline.entries),
            vec!["garbled", "p9", "p8", "p7", "p6", "p5", "p4", "p3", "p2", "p1"]
        );
    }

    #[tokio::test]
    async fn failures() {
        let transport = Arc::new(FlakyTransport::new());
        let broken = Rebuilder::new(
            Arc::new(Broken),
            Arc::new(Broken),
            transport.clone(),
            instruments(),
            None,
        );
        assert_eq!(
            broken.rebuild(&user("bob")).await.unwrap_err().kind(),
            ErrorKind::LookupFailed
        );

        let store = Arc::new(Store::new());
        store.follow(&user("bob"), &user("alice"));
        store.add_post(post("a1", "alice", 1));
        transport.break_();
        assert_eq!(
            rebuilder(&store, &transport)
                .rebuild(&user("bob"))
                .await
                .unwrap_err()
                .kind(),
            ErrorKind::PublishFailed
        );

        let persister = Persister::new(Arc::new(Broken), transport, instruments());
        let timeline = Timeline::new(user("bob"), vec![entry("a1", "alice", 1)]);
        assert_eq!(
            persister.persist(&timeline).await.unwrap_err().kind(),
            ErrorKind::StoreFailed
        );
    }

    // A cache-population publish failure doesn't fail the persist
    #[tokio::test]
    async fn persist_is_best_effort_downstream() {
        let store = Arc::new(Store::new());
        let transport = Arc::new(FlakyTransport::new());
        transport.break_();
        let persister = Persister::new(store.clone(), transport, instruments());
        let timeline = Timeline::new(user("bob"), vec![entry("a1", "alice", 1)]);
        persister.persist(&timeline).await.unwrap();
        assert_eq!(store.timeline_len(&user("bob")), 1);
    }
}
