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

//! # The fanline Integration Tests
//!
//! # Introduction
//!
//! The unit tests in the `fanline` crate exercise each stage in isolation. The tests here wire the
//! stages together into a [Pipeline] & check that messages flow between them the way they
//! should: a post fans out & lands in timelines, a cold read warms the cache, an empty read
//! triggers a rebuild that ends up in the store & the cache, and so on.
//!
//! # Project Structure
//!
//! Like any crate, this one produces a library (this one) & one or more integration test programs
//! under `tests`. Each test program opts-out of the default test harness (`harness = false` in
//! Cargo.toml) & uses [libtest-mimic] instead, which lets it build its own fixtures & register
//! tests via [inventory]. The test bodies live here; the harness in `tests/common`.
//!
//! [libtest-mimic]: https://docs.rs/libtest-mimic/latest/libtest_mimic/index.html
//!
//! [Pipeline]: fanline::pipeline::Pipeline

use std::{num::NonZero, sync::Arc, time::Duration};

use libtest_mimic::Failed;
use snafu::prelude::*;
use tracing::debug;

use fanline::{
    cache,
    consumer::{Handler, HandlerError},
    memory,
    metrics::Instruments,
    pipeline::{self, Backends, Pipeline},
    transport::{self, Queue, Transport},
};

pub mod delivery;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Handling a message from {queue} failed: {source}"))]
    Handle { queue: Queue, source: HandlerError },
    #[snafu(display("The queues didn't drain after {rounds} rounds"))]
    NoQuiescence { rounds: usize },
    #[snafu(display("Transport failure on {queue}: {source}"))]
    Transport {
        queue: Queue,
        source: transport::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Everything a pipeline test needs: the pipeline itself along with concrete handles on its
/// in-memory backends, so tests can seed & inspect them
pub struct Fixture {
    pub store: Arc<memory::Store>,
    pub cache: Arc<cache::InMemory>,
    pub transport: Arc<transport::InMemory>,
    pub pipeline: Pipeline,
}

impl Fixture {
    pub fn new(config: &pipeline::Config) -> Fixture {
        let store = Arc::new(memory::Store::new());
        let cache = Arc::new(cache::InMemory::new(&cache::Config::default()));
        let transport = Arc::new(transport::InMemory::new());
        let pipeline = Pipeline::new(
            Backends {
                timelines: store.clone(),
                graph: store.clone(),
                posts: store.clone(),
                cache: cache.clone(),
                transport: transport.clone(),
            },
            config,
            Arc::new(Instruments::new("fanline")),
        );
        Fixture {
            store,
            cache,
            transport,
            pipeline,
        }
    }

    /// Run every stage over its queue, in turn, until there's nothing left to do
    ///
    /// This is the consumer loop with the concurrency taken out: handle, then delete (or, for a
    /// malformed message, just delete). Any other failure ends the drain.
    pub async fn drain(&self) -> Result<usize> {
        const MAX_ROUNDS: usize = 16;
        let batch = NonZero::new(10).unwrap(/* known good */);
        let mut handled = 0;
        for _ in 0..MAX_ROUNDS {
            let mut this_round = 0;
            for handler in self.pipeline.handlers() {
                let queue = handler.queue();
                let deliveries = self
                    .transport
                    .receive(queue, batch, Duration::from_secs(30))
                    .await
                    .context(TransportSnafu { queue })?;
                for delivery in deliveries {
                    match handler.handle(&delivery.body).await {
                        Ok(()) => (),
                        Err(HandlerError::Malformed { .. }) => debug!("discarding poison message"),
                        Err(err) => return Err(err).context(HandleSnafu { queue }),
                    }
                    self.transport
                        .delete(queue, &delivery.receipt)
                        .await
                        .context(TransportSnafu { queue })?;
                    this_round += 1;
                }
            }
            if this_round == 0 {
                return Ok(handled);
            }
            handled += this_round;
        }
        NoQuiescenceSnafu { rounds: MAX_ROUNDS }.fail()
    }

    /// The number of messages waiting on any queue
    pub fn backlog(&self) -> usize {
        Queue::ALL.iter().map(|q| self.transport.depth(*q)).sum()
    }
}

/// Turn a failed check into a libtest-mimic failure
pub fn check(cond: bool, msg: impl Into<String>) -> std::result::Result<(), Failed> {
    if cond {
        Ok(())
    } else {
        Err(Failed::from(msg.into()))
    }
}
