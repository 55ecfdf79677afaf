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

//! # fanline
//!
//! Timeline delivery for a social feed.
//!
//! # Introduction
//!
//! Every user has a *timeline*: the posts of the people they follow, newest first. fanline keeps
//! those timelines materialized by combining three strategies:
//!
//! 1. write-time fan-out: when someone posts, the [fanout] orchestrator emits one "append" message
//!    per follower & the [appender] writes each into that follower's timeline
//!
//! 2. read-time cache-aside: the [reader] serves timelines from a cache, falling back to the
//!    timeline store on a miss & asking the [populator] to warm the cache afterwards
//!
//! 3. pull-based rebuild: when a user has no materialized timeline at all, the [rebuilder]
//!    recomputes it from their followees' recent posts & hands it off to be persisted & cached
//!
//! A fourth, smaller path, the [backfill], seeds a timeline with the recent posts of someone the
//! user has just followed.
//!
//! # Architecture
//!
//! Each stage is a plain struct holding its collaborators (storage, cache, transport, metrics) as
//! trait objects; each exposes its operation as an async method & implements
//! [consumer::Handler] so that a [consumer] loop can drive it from its inbound queue. The stages
//! never call one another directly; they communicate only by publishing to one another's queues.
//! The [pipeline] module wires everything together.
//!
//! Delivery is at-least-once throughout, so every write is idempotent: appends are upserts keyed on
//! `(user, tweet)`, rebuilds replace a timeline wholesale & cache population just overwrites.

use std::fmt::Display;

pub mod appender;
pub mod backfill;
pub mod cache;
pub mod consumer;
pub mod dynamodb;
pub mod entities;
pub mod fanout;
pub mod memory;
pub mod messages;
pub mod metrics;
pub mod pipeline;
pub mod populator;
pub mod reader;
pub mod rebuilder;
pub mod storage;
pub mod transport;

#[cfg(test)]
mod testing;

/// The broad classes of failure a pipeline operation can report
///
/// Each component has its own error type; all of them can say which of these they are, which is
/// what callers need to decide whether to retry & what to tell a user.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorKind {
    /// The social graph or post store failed
    LookupFailed,
    /// The timeline store failed
    StoreFailed,
    /// The cache failed
    CacheFailed,
    /// The message transport failed
    PublishFailed,
    /// There is no materialized timeline for this user (yet)
    EmptyTimeline,
    /// A post carried a creation time we couldn't parse
    MalformedTimestamp,
    /// A queue payload couldn't be decoded
    MalformedMessage,
}

impl ErrorKind {
    /// True if trying again later may succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorKind::MalformedMessage)
    }
    /// What to tell an end user
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorKind::EmptyTimeline => "timeline not ready yet, retry shortly",
            ErrorKind::MalformedMessage => "bad request",
            _ => "server error, please retry",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ErrorKind::LookupFailed => "lookup failed",
                ErrorKind::StoreFailed => "store failed",
                ErrorKind::CacheFailed => "cache failed",
                ErrorKind::PublishFailed => "publish failed",
                ErrorKind::EmptyTimeline => "empty timeline",
                ErrorKind::MalformedTimestamp => "malformed timestamp",
                ErrorKind::MalformedMessage => "malformed message",
            }
        )
    }
}
