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

//! # memory
//!
//! In-process implementations of the [storage] traits.
//!
//! [storage]: crate::storage
//!
//! Nothing here is durable; it exists for tests & for running `fanlined` on a laptop. Each user's
//! timeline is held in a [BTreeMap] keyed on [EntryKey], which sorts newest first, so queries are
//! just a walk from the front. A side index from tweet ID to key gives us the first-write-wins
//! semantics [TimelineStore::append] promises.

use std::{
    cmp::Reverse,
    collections::{BTreeMap, BTreeSet, HashMap},
    num::NonZero,
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::{
    entities::{EntryKey, Post, TimelineEntry, TweetId, UserId, parse_created_at},
    storage::{Error, PostStore, SocialGraph, TimelineStore},
};

#[derive(Debug, Default)]
struct UserTimeline {
    entries: BTreeMap<EntryKey, TimelineEntry>,
    keys: HashMap<TweetId, EntryKey>,
}

impl UserTimeline {
    fn insert(&mut self, entry: &TimelineEntry) -> bool {
        if self.keys.contains_key(&entry.tweet_id) {
            return false;
        }
        let key = entry.key();
        self.keys.insert(entry.tweet_id.clone(), key.clone());
        self.entries.insert(key, entry.clone());
        true
    }
}

#[derive(Debug, Default)]
struct State {
    timelines: HashMap<UserId, UserTimeline>,
    // (follower, followed)
    follows: BTreeSet<(UserId, UserId)>,
    posts: HashMap<UserId, Vec<Post>>,
    mutations: usize,
}

/// An in-memory [TimelineStore], [SocialGraph] & [PostStore]
#[derive(Debug, Default)]
pub struct Store {
    state: Mutex<State>,
}

impl Store {
    pub fn new() -> Store {
        Store::default()
    }
    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
    /// Record that `follower` follows `followed`
    pub fn follow(&self, follower: &UserId, followed: &UserId) {
        self.state()
            .follows
            .insert((follower.clone(), followed.clone()));
    }
    /// Record a post in the post store
    pub fn add_post(&self, post: Post) {
        self.state()
            .posts
            .entry(post.author.clone())
            .or_default()
            .push(post);
    }
    /// The number of successful writes made to the timeline store, ever
    pub fn timeline_mutations(&self) -> usize {
        self.state().mutations
    }
    /// The number of entries in `user`'s timeline
    pub fn timeline_len(&self, user: &UserId) -> usize {
        self.state()
            .timelines
            .get(user)
            .map(|t| t.entries.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl TimelineStore for Store {
    async fn append(&self, user: &UserId, entry: &TimelineEntry) -> Result<bool, Error> {
        let mut state = self.state();
        let inserted = state
            .timelines
            .entry(user.clone())
            .or_default()
            .insert(entry);
        if inserted {
            state.mutations += 1;
        } else {
            debug!(user = %user, tweet_id = %entry.tweet_id, "entry already present");
        }
        Ok(inserted)
    }
    async fn query(
        &self,
        user: &UserId,
        limit: NonZero<usize>,
    ) -> Result<Vec<TimelineEntry>, Error> {
        Ok(self
            .state()
            .timelines
            .get(user)
            .map(|t| t.entries.values().take(limit.get()).cloned().collect())
            .unwrap_or_default())
    }
    async fn bulk_replace(&self, user: &UserId, entries: &[TimelineEntry]) -> Result<(), Error> {
        let mut timeline = UserTimeline::default();
        entries.iter().for_each(|entry| {
            timeline.insert(entry);
        });
        let mut state = self.state();
        state.timelines.insert(user.clone(), timeline);
        state.mutations += 1;
        Ok(())
    }
}

#[async_trait]
impl SocialGraph for Store {
    async fn followers_of(&self, user: &UserId) -> Result<Vec<UserId>, Error> {
        Ok(self
            .state()
            .follows
            .iter()
            .filter(|(_, followed)| followed == user)
            .map(|(follower, _)| follower.clone())
            .collect())
    }
    async fn following_of(&self, user: &UserId) -> Result<Vec<UserId>, Error> {
        Ok(self
            .state()
            .follows
            .iter()
            .filter(|(follower, _)| follower == user)
            .map(|(_, followed)| followed.clone())
            .collect())
    }
}

#[async_trait]
impl PostStore for Store {
    async fn recent_posts_by(
        &self,
        user: &UserId,
        limit: NonZero<usize>,
    ) -> Result<Vec<Post>, Error> {
        let mut posts = self.state().posts.get(user).cloned().unwrap_or_default();
        // Posts whose timestamps won't parse sort first, so a page never cuts them off
        posts.sort_by_cached_key(|post| {
            Reverse(parse_created_at(&post.created_at).unwrap_or(DateTime::<Utc>::MAX_UTC))
        });
        posts.truncate(limit.get());
        Ok(posts)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use chrono::{TimeZone, Utc};

    fn user(s: &str) -> UserId {
        UserId::new(s).unwrap()
    }

    fn entry(id: &str, secs: i64) -> TimelineEntry {
        TimelineEntry {
            tweet_id: TweetId::new(id).unwrap(),
            author_id: user("author"),
            content: format!("post {id}"),
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
            ttl: None,
        }
    }

    #[tokio::test]
    async fn timelines() {
        let store = Store::new();
        let alice = user("alice");
        assert!(store.append(&alice, &entry("a", 1)).await.unwrap());
        assert!(store.append(&alice, &entry("c", 3)).await.unwrap());
        assert!(store.append(&alice, &entry("b", 2)).await.unwrap());
        // Re-delivery is a no-op, even if the payload differs; the first write wins
        assert!(!store.append(&alice, &entry("b", 20)).await.unwrap());
        assert_eq!(store.timeline_len(&alice), 3);
        assert_eq!(store.timeline_mutations(), 3);

        let got = store
            .query(&alice, NonZero::new(2).unwrap())
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.tweet_id.to_string())
            .collect::<Vec<_>>();
        assert_eq!(got, vec!["c", "b"]);

        store
            .bulk_replace(&alice, &[entry("x", 7), entry("y", 9)])
            .await
            .unwrap();
        let got = store
            .query(&alice, NonZero::new(10).unwrap())
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.tweet_id.to_string())
            .collect::<Vec<_>>();
        assert_eq!(got, vec!["y", "x"]);

        assert!(
            store
                .query(&user("nobody"), NonZero::new(10).unwrap())
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn graph_and_posts() {
        let store = Store::new();
        store.follow(&user("bob"), &user("alice"));
        store.follow(&user("carol"), &user("alice"));
        store.follow(&user("bob"), &user("dave"));
        assert_eq!(
            store.followers_of(&user("alice")).await.unwrap(),
            vec![user("bob"), user("carol")]
        );
        assert_eq!(
            store.following_of(&user("bob")).await.unwrap(),
            vec![user("alice"), user("dave")]
        );
        assert!(store.following_of(&user("alice")).await.unwrap().is_empty());

        for (id, secs) in [("p1", 5), ("p2", 10), ("p3", 7)] {
            store.add_post(Post::new(
                TweetId::new(id).unwrap(),
                user("alice"),
                "hello",
                &Utc.timestamp_opt(secs, 0).unwrap(),
            ));
        }
        let got = store
            .recent_posts_by(&user("alice"), NonZero::new(2).unwrap())
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id.to_string())
            .collect::<Vec<_>>();
        assert_eq!(got, vec!["p2", "p3"]);
    }
}
