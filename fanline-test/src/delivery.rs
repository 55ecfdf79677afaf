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

//! End-to-end timeline delivery tests.

use std::{num::NonZero, time::Duration};

use chrono::{TimeZone, Utc};
use libtest_mimic::Failed;
use tracing::debug;

use fanline::{
    ErrorKind,
    consumer,
    entities::{Post, TweetId, UserId},
    pipeline,
    transport::{Queue, Transport},
};

use crate::{Fixture, check};

fn post(id: &str, author: &str, secs: i64) -> std::result::Result<Post, Failed> {
    Ok(Post::new(
        TweetId::new(id)?,
        UserId::new(author)?,
        &format!("post {id}"),
        &Utc.timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| Failed::from("bad timestamp"))?,
    ))
}

async fn publish_post(fixture: &Fixture, post: &Post) -> std::result::Result<(), Failed> {
    let body = serde_json::json!({ "tweet": post }).to_string();
    fixture
        .transport
        .publish(Queue::OrchestrateFanout, body.into_bytes())
        .await?;
    Ok(())
}

fn tweet_ids(timeline: &fanline::entities::Timeline) -> Vec<&str> {
    timeline
        .entries
        .iter()
        .map(|entry| entry.tweet_id.as_str())
        .collect()
}

/// A post fans out to every follower; a cold read falls through to the store & warms the cache,
/// after which reads are served from the cache
pub async fn fanout_then_read() -> std::result::Result<(), Failed> {
    let fixture = Fixture::new(&pipeline::Config::default());
    let (alice, bob, carol) = (UserId::new("alice")?, UserId::new("bob")?, UserId::new("carol")?);
    fixture.store.follow(&bob, &alice);
    fixture.store.follow(&carol, &alice);

    publish_post(&fixture, &post("t1", "alice", 100)?).await?;
    publish_post(&fixture, &post("t2", "alice", 200)?).await?;
    fixture.drain().await?;

    for follower in [&bob, &carol] {
        let read = fixture.pipeline.reader.read(follower, None).await?;
        check(!read.cache_hit, "first read should miss the cache")?;
        check(
            tweet_ids(&read.timeline) == vec!["t2", "t1"],
            format!("{follower}'s timeline was {:?}", tweet_ids(&read.timeline)),
        )?;
    }
    // Alice follows no one
    check(
        fixture.store.timeline_len(&alice) == 0,
        "the author shouldn't receive her own post",
    )?;

    // Let the populator run...
    fixture.drain().await?;
    let read = fixture.pipeline.reader.read(&bob, NonZero::new(1)).await?;
    check(read.cache_hit, "second read should hit the cache")?;
    check(
        tweet_ids(&read.timeline) == vec!["t2"],
        "cache hits are truncated to the requested page",
    )?;
    check(fixture.backlog() == 0, "a cache hit publishes nothing")?;
    Ok(())
}

/// At-least-once delivery means the same post can arrive twice; the timeline mustn't show it
/// twice
pub async fn redelivery_is_harmless() -> std::result::Result<(), Failed> {
    let fixture = Fixture::new(&pipeline::Config::default());
    let (alice, bob) = (UserId::new("alice")?, UserId::new("bob")?);
    fixture.store.follow(&bob, &alice);

    let t1 = post("t1", "alice", 100)?;
    publish_post(&fixture, &t1).await?;
    publish_post(&fixture, &t1).await?;
    fixture.drain().await?;

    check(
        fixture.store.timeline_len(&bob) == 1,
        "a redelivered post was appended twice",
    )?;
    check(
        fixture.store.timeline_mutations() == 1,
        "a redelivered post mutated the store",
    )?;
    Ok(())
}

/// Reading a timeline that was never materialized fails with "not ready", triggers a rebuild from
/// the followees' recent posts, & the rebuilt timeline winds up in both store & cache
pub async fn empty_read_rebuilds() -> std::result::Result<(), Failed> {
    let fixture = Fixture::new(&pipeline::Config::default());
    let bob = UserId::new("bob")?;
    fixture.store.follow(&bob, &UserId::new("alice")?);
    fixture.store.follow(&bob, &UserId::new("carol")?);
    fixture.store.add_post(post("a10", "alice", 10)?);
    fixture.store.add_post(post("a5", "alice", 5)?);
    fixture.store.add_post(post("c8", "carol", 8)?);

    match fixture.pipeline.reader.read(&bob, None).await {
        Err(err) => check(
            err.kind() == ErrorKind::EmptyTimeline,
            format!("expected an empty timeline; got {err}"),
        )?,
        Ok(read) => return Err(format!("expected an error; got {read:?}").into()),
    }
    check(
        fixture.transport.depth(Queue::RebuildTimeline) == 1,
        "expected exactly one rebuild request",
    )?;

    // rebuild -> persist -> populate
    let handled = fixture.drain().await?;
    debug!("handled {handled} messages");
    check(handled == 3, format!("expected three hops; got {handled}"))?;

    let read = fixture.pipeline.reader.read(&bob, None).await?;
    check(read.cache_hit, "the rebuilt timeline should have been cached")?;
    check(
        tweet_ids(&read.timeline) == vec!["a10", "c8", "a5"],
        format!("rebuilt timeline was {:?}", tweet_ids(&read.timeline)),
    )?;
    check(
        fixture.store.timeline_len(&bob) == 3,
        "the rebuilt timeline should have been persisted",
    )?;
    Ok(())
}

/// Following someone seeds one's timeline with their recent posts
pub async fn new_follow_backfills() -> std::result::Result<(), Failed> {
    let config = pipeline::Config {
        backfill_page: NonZero::new(2).ok_or("zero")?,
        ..Default::default()
    };
    let fixture = Fixture::new(&config);
    for (id, secs) in [("a1", 1), ("a2", 2), ("a3", 3)] {
        fixture.store.add_post(post(id, "alice", secs)?);
    }
    let event = serde_json::json!({
        "Follow": {
            "id": "f1",
            "followerId": "bob",
            "followedId": "alice",
            "createdAt": "2025-01-01T00:00:00Z"
        }
    })
    .to_string();
    let envelope = serde_json::json!({ "Type": "Notification", "Message": event }).to_string();
    fixture
        .transport
        .publish(Queue::ProcessNewFollow, envelope.into_bytes())
        .await?;
    fixture.drain().await?;

    let read = fixture
        .pipeline
        .reader
        .read(&UserId::new("bob")?, None)
        .await?;
    check(
        tweet_ids(&read.timeline) == vec!["a3", "a2"],
        format!("backfilled timeline was {:?}", tweet_ids(&read.timeline)),
    )?;
    Ok(())
}

/// Malformed messages are dropped, not retried forever, & the rest of the queue keeps moving
pub async fn poison_messages_are_dropped() -> std::result::Result<(), Failed> {
    let fixture = Fixture::new(&pipeline::Config::default());
    let (alice, bob) = (UserId::new("alice")?, UserId::new("bob")?);
    fixture.store.follow(&bob, &alice);
    fixture
        .transport
        .publish(Queue::OrchestrateFanout, b"not json".to_vec())
        .await?;
    fixture
        .transport
        .publish(
            Queue::UpdateTimeline,
            br#"{"tweet":{"id":"t1","userId":"alice","content":"hi"},"user_id":""}"#.to_vec(),
        )
        .await?;
    publish_post(&fixture, &post("t2", "alice", 200)?).await?;

    fixture.drain().await?;
    check(fixture.backlog() == 0, "poison messages should be discarded")?;
    check(
        fixture.store.timeline_len(&bob) == 1,
        "the well-formed post should still have been delivered",
    )?;
    Ok(())
}

/// The same flow as [fanout_then_read], but driven by real consumer loops
pub async fn consumer_loops_deliver() -> std::result::Result<(), Failed> {
    let fixture = Fixture::new(&pipeline::Config::default());
    let (alice, bob) = (UserId::new("alice")?, UserId::new("bob")?);
    fixture.store.follow(&bob, &alice);

    let config = consumer::Config {
        sleep_duration: Duration::from_millis(10),
        ..Default::default()
    };
    let processors = fixture.pipeline.spawn(&Queue::ALL, &config);
    publish_post(&fixture, &post("t1", "alice", 100)?).await?;

    let mut delivered = false;
    for _ in 0..200 {
        if fixture.store.timeline_len(&bob) == 1 {
            delivered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for processor in processors {
        processor.shutdown(Duration::from_secs(5)).await?;
    }
    check(delivered, "the consumer loops never delivered the post")?;
    Ok(())
}
