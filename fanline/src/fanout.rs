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

//! # The fan-out orchestrator
//!
//! Turns one "post created" event into one [FanoutMessage] per follower of the post's author,
//! published to the [update-timeline](Queue::UpdateTimeline) queue.
//!
//! Fan-out is best-effort. A failure to publish for one follower is logged & skipped; it neither
//! aborts the remaining followers nor fails the operation. Rather than leave that to be inferred
//! from the logs, [Orchestrator::distribute] returns a [Report] carrying the outcome for each
//! follower. Followers are handled sequentially.

use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use snafu::{Backtrace, prelude::*};
use tracing::{debug, info, warn};

use crate::{
    ErrorKind,
    consumer::{Handler, HandlerError, MalformedSnafu},
    counter_add,
    entities::{Post, TweetId, UserId},
    messages::{FanoutMessage, decode_post_created},
    metrics::{self, Instruments, Sort},
    storage::{self, SocialGraph},
    transport::{self, Queue, Transport, publish_json},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to look up the followers of {author}: {source}"))]
    LookupFailed {
        author: UserId,
        source: storage::Error,
        backtrace: Backtrace,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::LookupFailed { .. } => ErrorKind::LookupFailed,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// What became of the fan-out message for one follower
#[derive(Debug)]
pub enum Outcome {
    Published,
    Failed(transport::Error),
}

#[derive(Debug)]
pub struct FollowerOutcome {
    pub follower: UserId,
    pub outcome: Outcome,
}

/// The result of distributing one post
#[derive(Debug)]
pub struct Report {
    pub post: TweetId,
    pub outcomes: Vec<FollowerOutcome>,
}

impl Report {
    /// The followers whose messages were published
    pub fn published(&self) -> impl Iterator<Item = &UserId> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.outcome, Outcome::Published))
            .map(|o| &o.follower)
    }
    /// The followers whose messages could not be published
    pub fn failed(&self) -> impl Iterator<Item = &UserId> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.outcome, Outcome::Failed(_)))
            .map(|o| &o.follower)
    }
}

inventory::submit! {
    metrics::Registration::new(
        "fanout.messages.published",
        Sort::IntegralCounter,
        "Fan-out messages published"
    )
}
inventory::submit! {
    metrics::Registration::new(
        "fanout.messages.failed",
        Sort::IntegralCounter,
        "Fan-out messages that could not be published"
    )
}

pub struct Orchestrator {
    graph: Arc<dyn SocialGraph + Send + Sync>,
    transport: Arc<dyn Transport + Send + Sync>,
    instruments: Arc<Instruments>,
}

impl Orchestrator {
    pub fn new(
        graph: Arc<dyn SocialGraph + Send + Sync>,
        transport: Arc<dyn Transport + Send + Sync>,
        instruments: Arc<Instruments>,
    ) -> Orchestrator {
        Orchestrator {
            graph,
            transport,
            instruments,
        }
    }

    /// Emit one append message per follower of `post`'s author
    #[tracing::instrument(skip(self, post), fields(post = %post.id, author = %post.author))]
    pub async fn distribute(&self, post: &Post) -> Result<Report> {
        let followers = self
            .graph
            .followers_of(&post.author)
            .await
            .context(LookupFailedSnafu {
                author: post.author.clone(),
            })?;

        if followers.is_empty() {
            debug!("No followers; nothing to do.");
        }

        let mut outcomes = Vec::with_capacity(followers.len());
        for follower in followers {
            let message = FanoutMessage {
                tweet: post.clone(),
                user_id: follower.clone(),
            };
            let outcome =
                match publish_json(self.transport.as_ref(), Queue::UpdateTimeline, &message).await
                {
                    Ok(()) => {
                        counter_add!(self.instruments, "fanout.messages.published", 1, &[]);
                        Outcome::Published
                    }
                    Err(err) => {
                        warn!(follower = %follower, "Failed to publish a fan-out message: {err}");
                        counter_add!(
                            self.instruments,
                            "fanout.messages.failed",
                            1,
                            &[KeyValue::new("queue", Queue::UpdateTimeline.name())]
                        );
                        Outcome::Failed(err)
                    }
                };
            outcomes.push(FollowerOutcome { follower, outcome });
        }

        let report = Report {
            post: post.id.clone(),
            outcomes,
        };
        info!(
            "Fanned out to {} followers ({} failed).",
            report.published().count(),
            report.failed().count()
        );
        Ok(report)
    }
}

#[async_trait]
impl Handler for Orchestrator {
    fn queue(&self) -> Queue {
        Queue::OrchestrateFanout
    }
    async fn handle(&self, body: &[u8]) -> std::result::Result<(), HandlerError> {
        let post = decode_post_created(body).context(MalformedSnafu)?;
        self.distribute(&post)
            .await
            .map_err(|err| HandlerError::failed(err.kind(), err))?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::{
        memory::Store,
        messages::decode,
        testing::{Broken, FlakyTransport, instruments, post, user},
    };

    fn setup(followers: &[&str]) -> (Arc<Store>, Arc<FlakyTransport>, Orchestrator) {
        let store = Arc::new(Store::new());
        followers
            .iter()
            .for_each(|f| store.follow(&user(f), &user("alice")));
        let transport = Arc::new(FlakyTransport::new());
        let orchestrator = Orchestrator::new(store.clone(), transport.clone(), instruments());
        (store, transport, orchestrator)
    }

    #[tokio::test]
    async fn one_message_per_follower() {
        let (_, transport, orchestrator) = setup(&["bob", "carol", "dave"]);
        let report = orchestrator
            .distribute(&post("t1", "alice", 100))
            .await
            .unwrap();
        assert_eq!(report.published().count(), 3);
        assert_eq!(report.failed().count(), 0);

        let mut recipients = transport
            .peek(Queue::UpdateTimeline)
            .iter()
            .map(|body| {
                let msg = decode::<FanoutMessage>(body).unwrap();
                assert_eq!(msg.tweet.id.as_str(), "t1");
                msg.user_id.to_string()
            })
            .collect::<Vec<_>>();
        recipients.sort();
        assert_eq!(recipients, vec!["bob", "carol", "dave"]);
    }

    #[tokio::test]
    async fn no_followers() {
        let (_, transport, orchestrator) = setup(&[]);
        let report = orchestrator
            .distribute(&post("t1", "alice", 100))
            .await
            .unwrap();
        assert!(report.outcomes.is_empty());
        assert_eq!(transport.depth(Queue::UpdateTimeline), 0);
    }

    // A failure for one follower mustn't stop the rest
    #[tokio::test]
    async fn partial_failure() {
        let (_, transport, orchestrator) = setup(&["bob", "carol", "dave"]);
        transport.poison("\"user_id\":\"carol\"");
        let report = orchestrator
            .distribute(&post("t1", "alice", 100))
            .await
            .unwrap();
        assert_eq!(report.outcomes.len(), 3);
        assert_eq!(report.failed().collect::<Vec<_>>(), vec![&user("carol")]);
        assert_eq!(
            report.published().collect::<Vec<_>>(),
            vec![&user("bob"), &user("dave")]
        );
        assert_eq!(transport.depth(Queue::UpdateTimeline), 2);

        // Even if *everything* fails, distribution "succeeds"
        transport.break_();
        let report = orchestrator
            .distribute(&post("t2", "alice", 100))
            .await
            .unwrap();
        assert_eq!(report.failed().count(), 3);
    }

    #[tokio::test]
    async fn lookup_failure() {
        let orchestrator = Orchestrator::new(
            Arc::new(Broken),
            Arc::new(FlakyTransport::new()),
            instruments(),
        );
        let err = orchestrator
            .distribute(&post("t1", "alice", 100))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LookupFailed);
    }

    #[tokio::test]
    async fn handler() {
        let (_, transport, orchestrator) = setup(&["bob"]);
        orchestrator
            .handle(br#"{"tweet":{"id":"t1","userId":"alice","content":"hi","createdAt":"2025-01-01T00:00:00Z"}}"#)
            .await
            .unwrap();
        assert_eq!(transport.depth(Queue::UpdateTimeline), 1);
        assert!(matches!(
            orchestrator.handle(b"{}").await,
            Err(HandlerError::Malformed { .. })
        ));
    }
}
