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

//! # fanline entities
//!
//! The things the pipeline moves around: user & post identifiers, [Post]s as they arrive from the
//! upstream post service, [TimelineEntry]s as they appear in a viewer's feed, and [Timeline]s.
//!
//! Identifiers are opaque strings minted elsewhere; all we insist upon is that they're non-empty.
//! Timestamps on incoming posts are carried as text, since the upstream producer may omit them or
//! send something we can't parse. Converting a [Post] into a [TimelineEntry] is where that gets
//! resolved, and it is resolved leniently: a bad timestamp becomes "now" rather than an error.

use std::{
    cmp::Ordering,
    fmt::Display,
    ops::Deref,
    result::Result as StdResult,
    str::FromStr,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use snafu::{Backtrace, prelude::*};
use tracing::debug;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("A {kind} may not be empty"))]
    EmptyId {
        kind: &'static str,
        backtrace: Backtrace,
    },
    #[snafu(display("'{text}' is not an RFC 3339 timestamp: {source}"))]
    MalformedTimestamp {
        text: String,
        source: chrono::ParseError,
        backtrace: Backtrace,
    },
    #[snafu(display("No creation time was given"))]
    MissingTimestamp { backtrace: Backtrace },
}

impl Error {
    pub fn kind(&self) -> crate::ErrorKind {
        match self {
            Error::EmptyId { .. } => crate::ErrorKind::MalformedMessage,
            Error::MalformedTimestamp { .. } | Error::MissingTimestamp { .. } => {
                crate::ErrorKind::MalformedTimestamp
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

fn mk_serde_de_err<'de, D: Deserializer<'de>>(err: Error) -> D::Error {
    <D::Error as serde::de::Error>::custom(format!("{:?}", err))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          identifiers                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Define a string-valued identifier type; the only validation is that it be non-empty
macro_rules! define_id {
    ($type_name:ident, $kind:expr) => {
        #[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
        #[serde(transparent)]
        pub struct $type_name(String);
        impl $type_name {
            pub fn new(s: &str) -> Result<$type_name> {
                ensure!(!s.is_empty(), EmptyIdSnafu { kind: $kind });
                Ok($type_name(s.to_owned()))
            }
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }
        impl Display for $type_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
        impl FromStr for $type_name {
            type Err = Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                $type_name::new(s)
            }
        }
        impl TryFrom<String> for $type_name {
            type Error = Error;

            fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
                ensure!(!s.is_empty(), EmptyIdSnafu { kind: $kind });
                Ok($type_name(s))
            }
        }
        impl Deref for $type_name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }
        impl From<$type_name> for String {
            fn from(value: $type_name) -> Self {
                value.0
            }
        }
        // Deserialize by hand so that an empty string fails at the wire boundary
        impl<'de> Deserialize<'de> for $type_name {
            fn deserialize<D>(deserializer: D) -> StdResult<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let s = <String as serde::Deserialize>::deserialize(deserializer)?;
                $type_name::try_from(s).map_err(mk_serde_de_err::<'de, D>)
            }
        }
    };
}

define_id!(UserId, "user ID");
define_id!(TweetId, "tweet ID");

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           timestamps                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Parse a post's creation time
///
/// Returns `MissingTimestamp` for an empty string & `MalformedTimestamp` for anything that isn't
/// RFC 3339. Callers building timeline entries should use [TimelineEntry::from_post], which
/// recovers from both.
pub fn parse_created_at(text: &str) -> Result<DateTime<Utc>> {
    ensure!(!text.is_empty(), MissingTimestampSnafu);
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .context(MalformedTimestampSnafu {
            text: text.to_owned(),
        })
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             Post                                               //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A post ("tweet") as produced by the upstream post service
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Post {
    pub id: TweetId,
    #[serde(rename = "userId")]
    pub author: UserId,
    pub content: String,
    /// RFC 3339 text; kept as-is because it may be absent or garbage
    #[serde(rename = "createdAt", default)]
    pub created_at: String,
}

impl Post {
    pub fn new(id: TweetId, author: UserId, content: &str, created_at: &DateTime<Utc>) -> Post {
        Post {
            id,
            author,
            content: content.to_owned(),
            created_at: created_at.to_rfc3339(),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         TimelineEntry                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// One post as it appears in a viewer's timeline
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TimelineEntry {
    pub tweet_id: TweetId,
    pub author_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Absolute expiry, in seconds since the epoch. Persisted, but nothing evicts on it yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
}

impl TimelineEntry {
    /// Build an entry from an incoming [Post]
    ///
    /// If the post's creation time is missing or malformed, the entry is stamped with the current
    /// time: one bad post shouldn't keep it (or the timeline it's part of) from being delivered.
    pub fn from_post(post: &Post) -> TimelineEntry {
        let created_at = parse_created_at(&post.created_at).unwrap_or_else(|err| {
            debug!(tweet_id = %post.id, "{err}; stamping the entry with the current time");
            Utc::now()
        });
        TimelineEntry {
            tweet_id: post.id.clone(),
            author_id: post.author.clone(),
            content: post.content.clone(),
            created_at,
            ttl: None,
        }
    }
    pub fn key(&self) -> EntryKey {
        EntryKey {
            created_at: self.created_at,
            tweet_id: self.tweet_id.clone(),
        }
    }
}

/// Newest-first ordering key for [TimelineEntry]s
///
/// Timestamps alone won't impose a total order (two followees can post at the same instant), so
/// the tweet ID breaks ties. Deriving [Ord] would sort ascending; we want descending.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct EntryKey {
    created_at: DateTime<Utc>,
    tweet_id: TweetId,
}

impl Ord for EntryKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .created_at
            .cmp(&self.created_at)
            .then_with(|| other.tweet_id.cmp(&self.tweet_id))
    }
}

impl PartialOrd for EntryKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Sort `entries` newest first
///
/// The sort is stable; entries with equal creation times keep their relative order.
pub fn sort_newest_first(entries: &mut [TimelineEntry]) {
    entries.sort_by(|lhs, rhs| rhs.created_at.cmp(&lhs.created_at));
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Timeline                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A user's timeline: their entries, newest first
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Timeline {
    pub user_id: UserId,
    pub entries: Vec<TimelineEntry>,
}

impl Timeline {
    /// Build a [Timeline], sorting `entries` newest first
    pub fn new(user_id: UserId, mut entries: Vec<TimelineEntry>) -> Timeline {
        sort_newest_first(&mut entries);
        Timeline { user_id, entries }
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    /// Keep only the `limit` most recent entries
    pub fn truncate(&mut self, limit: usize) {
        self.entries.truncate(limit)
    }
}
