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

//! # Queue consumers
//!
//! Every pipeline stage runs as an independent loop pulling batches from its own inbound queue.
//! This module provides that loop, generic over the stage (a [Handler]) & the [Transport].
//!
//! # Design
//!
//! The loop receives a batch of at most `batch-size` messages, leasing them for
//! `visibility-timeout`, then hands them to the handler one at a time. What happens next depends
//! on the outcome:
//!
//! - success: the message is deleted
//! - [HandlerError::Malformed]: the message can never succeed, so it's logged & deleted
//! - [HandlerError::Failed]: the message is left alone; once its lease lapses the transport will
//!   deliver it again
//!
//! An empty queue puts the loop to sleep for `sleep-duration`; a failure to receive backs off for
//! `error-backoff`. Either way the loop keeps an ear open for its shutdown notification. The batch
//! in hand is always finished before the loop exits.
//!
//! Spawning the loop yields a [Processor], which can be awaited, told to shut down, or split into
//! its join handle & shutdown [Notify] for use in a `tokio::select!`.

use std::{future::Future, num::NonZero, pin::Pin, sync::Arc, task::Poll, time::Duration};

use async_trait::async_trait;
use opentelemetry::KeyValue;
use pin_project::pin_project;
use serde::Deserialize;
use snafu::{Backtrace, prelude::*};
use tokio::{
    sync::Notify,
    task::{JoinError, JoinHandle},
};
use tracing::{debug, error, info, warn};

use crate::{
    ErrorKind, counter_add, gauge_setu,
    metrics::{self, Instruments, Sort},
    messages,
    transport::{Delivery, Queue, Transport},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("The consumer loop failed to run to completion: {source}"))]
    Join {
        source: JoinError,
        backtrace: Backtrace,
    },
    #[snafu(display("Timeout shutting-down the consumer loop: {source}"))]
    ShutdownTimeout {
        source: tokio::time::error::Elapsed,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// The ways in which handling a single message can fail
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum HandlerError {
    #[snafu(display("Malformed message: {source}"))]
    Malformed { source: messages::Error },
    #[snafu(display("{kind}: {source}"))]
    Failed {
        kind: ErrorKind,
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

impl HandlerError {
    pub fn failed(
        kind: ErrorKind,
        err: impl std::error::Error + Send + Sync + 'static,
    ) -> HandlerError {
        HandlerError::Failed {
            kind,
            source: Box::new(err),
        }
    }
    pub fn kind(&self) -> ErrorKind {
        match self {
            HandlerError::Malformed { .. } => ErrorKind::MalformedMessage,
            HandlerError::Failed { kind, .. } => *kind,
        }
    }
}

/// A pipeline stage, as seen by its consumer loop
#[async_trait]
pub trait Handler {
    /// The queue from which this stage consumes
    fn queue(&self) -> Queue;
    /// Process one message
    async fn handle(&self, body: &[u8]) -> std::result::Result<(), HandlerError>;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Processor                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A running consumer loop
///
/// Awaiting it resolves to the loop's result; `shutdown()` asks the loop to exit & waits for it.
#[pin_project]
pub struct Processor {
    #[pin]
    processor: JoinHandle<Result<()>>,
    shutdown: Arc<Notify>,
}

impl Future for Processor {
    type Output = std::result::Result<Result<()>, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        this.processor.poll(cx)
    }
}

impl Processor {
    /// Signal the loop to exit & wait up to `timeout` for it to do so
    pub async fn shutdown(self, timeout: Duration) -> Result<()> {
        self.shutdown.notify_one();
        tokio::time::timeout(timeout, self.processor)
            .await
            .context(ShutdownTimeoutSnafu)?
            .context(JoinSnafu)?
    }
    /// Split the instance back into it's parts
    pub fn into_parts(self) -> (JoinHandle<Result<()>>, Arc<Notify>) {
        (self.processor, self.shutdown)
    }
}

/// Configuration parameters for consumer loops
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The maximum number of messages to receive at once
    #[serde(rename = "batch-size")]
    pub batch_size: NonZero<usize>,
    /// How long received messages stay invisible to other consumers
    #[serde(rename = "visibility-timeout")]
    pub visibility_timeout: Duration,
    /// Amount of time to sleep when the queue is empty
    #[serde(rename = "sleep-duration")]
    pub sleep_duration: Duration,
    /// Amount of time to wait after failing to receive
    #[serde(rename = "error-backoff")]
    pub error_backoff: Duration,
    /// Amount of time to wait for the batch in hand on shutdown
    #[serde(rename = "shutdown-timeout")]
    pub shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            batch_size: NonZero::new(10).unwrap(/* known good */),
            visibility_timeout: Duration::from_secs(30),
            sleep_duration: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

inventory::submit! {
    metrics::Registration::new(
        "consumer.messages.completed",
        Sort::IntegralCounter,
        "Messages handled & deleted"
    )
}
inventory::submit! {
    metrics::Registration::new(
        "consumer.messages.failed",
        Sort::IntegralCounter,
        "Messages left for redelivery"
    )
}
inventory::submit! {
    metrics::Registration::new(
        "consumer.messages.discarded",
        Sort::IntegralCounter,
        "Malformed messages deleted unhandled"
    )
}
inventory::submit! {
    metrics::Registration::new(
        "consumer.batch.size",
        Sort::IntegralGauge,
        "Size of the most recently received batch"
    )
}

/// Sleep for `duration`, or until `shutdown` is notified; return true in the latter case
async fn pause(duration: Duration, shutdown: &Notify) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.notified() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

async fn handle_one(
    handler: &(dyn Handler + Send + Sync),
    transport: &(dyn Transport + Send + Sync),
    queue: Queue,
    delivery: Delivery,
    instruments: &Instruments,
) {
    let attrs = [KeyValue::new("queue", queue.name())];
    let delete = match handler.handle(&delivery.body).await {
        Ok(()) => {
            counter_add!(instruments, "consumer.messages.completed", 1, &attrs);
            true
        }
        Err(err @ HandlerError::Malformed { .. }) => {
            warn!(%queue, receipt = delivery.receipt.id(), "Discarding message: {err}");
            counter_add!(instruments, "consumer.messages.discarded", 1, &attrs);
            true
        }
        Err(err) => {
            // Leave it to be redelivered
            error!(
                %queue,
                receipt = delivery.receipt.id(),
                receive_count = delivery.receive_count,
                "{err}"
            );
            counter_add!(instruments, "consumer.messages.failed", 1, &attrs);
            false
        }
    };
    if delete {
        if let Err(err) = transport.delete(queue, &delivery.receipt).await {
            // The message will be redelivered & handled again; handlers are idempotent.
            error!(%queue, receipt = delivery.receipt.id(), "Failed to delete a message: {err}");
        }
    }
}

/// Consume `handler`'s queue until `shutdown` is notified
async fn process(
    handler: Arc<dyn Handler + Send + Sync>,
    transport: Arc<dyn Transport + Send + Sync>,
    config: Config,
    shutdown: Arc<Notify>,
    instruments: Arc<Instruments>,
) -> Result<()> {
    let queue = handler.queue();
    info!(%queue, "Consumer starting.");
    let mut done = false;
    while !done {
        tokio::select! {
            biased;
            // A shutdown requested while the last batch was in hand wins over another receive
            _ = shutdown.notified() => {
                done = true;
            },
            result = transport.receive(queue, config.batch_size, config.visibility_timeout) => {
                match result {
                    Ok(batch) if batch.is_empty() => {
                        done = pause(config.sleep_duration, &shutdown).await;
                    }
                    Ok(batch) => {
                        debug!(%queue, "Received {} messages.", batch.len());
                        gauge_setu!(
                            instruments,
                            "consumer.batch.size",
                            batch.len() as u64,
                            &[KeyValue::new("queue", queue.name())]
                        );
                        // No mid-batch cancellation; a pending shutdown is noticed on the next pass
                        for delivery in batch {
                            handle_one(
                                handler.as_ref(),
                                transport.as_ref(),
                                queue,
                                delivery,
                                &instruments,
                            )
                            .await;
                        }
                    }
                    Err(err) => {
                        error!(%queue, "Failed to receive messages: {err}");
                        done = pause(config.error_backoff, &shutdown).await;
                    }
                }
            }
        }
    }
    info!(%queue, "Consumer exiting.");
    Ok(())
}

/// Spawn a consumer loop driving `handler` from its queue on `transport`
pub fn spawn(
    handler: Arc<dyn Handler + Send + Sync>,
    transport: Arc<dyn Transport + Send + Sync>,
    config: Option<Config>,
    instruments: Arc<Instruments>,
) -> Processor {
    let shutdown = Arc::new(Notify::new());
    let processor = tokio::spawn(process(
        handler,
        transport,
        config.unwrap_or_default(),
        shutdown.clone(),
        instruments,
    ));
    Processor {
        processor,
        shutdown,
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    use crate::{
        testing::{Broken, Flaky},
        transport::InMemory,
    };

    // Records everything it sees; fails on "fail" & rejects "poison"
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Handler for Recorder {
        fn queue(&self) -> Queue {
            Queue::UpdateTimeline
        }
        async fn handle(&self, body: &[u8]) -> std::result::Result<(), HandlerError> {
            let body = String::from_utf8_lossy(body).to_string();
            self.seen.lock().unwrap().push(body.clone());
            match body.as_str() {
                "fail" => Err(HandlerError::failed(ErrorKind::StoreFailed, Flaky)),
                "poison" => Err(HandlerError::Malformed {
                    source: messages::decode::<u32>(b"poison").unwrap_err(),
                }),
                _ => Ok(()),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledgement() {
        let transport = Arc::new(InMemory::new());
        for body in ["ok", "fail", "poison"] {
            transport
                .publish(Queue::UpdateTimeline, body.as_bytes().to_vec())
                .await
                .unwrap();
        }
        let recorder = Arc::new(Recorder::default());
        let processor = spawn(
            recorder.clone(),
            transport.clone(),
            None,
            Arc::new(Instruments::new("fanline")),
        );

        tokio::time::sleep(Duration::from_secs(5)).await;
        // "ok" & "poison" are gone; "fail" remains, leased
        assert_eq!(transport.depth(Queue::UpdateTimeline), 1);
        assert_eq!(
            transport.peek(Queue::UpdateTimeline),
            vec![b"fail".to_vec()]
        );
        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec!["ok".to_owned(), "fail".to_owned(), "poison".to_owned()]
        );

        // Once the lease lapses, "fail" is seen again
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(recorder.seen.lock().unwrap().len() >= 4);
        assert_eq!(recorder.seen.lock().unwrap()[3], "fail");

        assert!(processor.shutdown(Duration::from_secs(5)).await.is_ok());
    }

    // A broken transport mustn't keep the loop from shutting down
    #[tokio::test(start_paused = true)]
    async fn shutdown_while_backing_off() {
        let processor = spawn(
            Arc::new(Recorder::default()),
            Arc::new(Broken),
            None,
            Arc::new(Instruments::new("fanline")),
        );
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(processor.shutdown(Duration::from_secs(1)).await.is_ok());
    }

    // Asks for shutdown from inside the handler, so the request lands mid-batch
    struct Stopper {
        shutdown: Arc<Notify>,
        handled: AtomicUsize,
    }

    #[async_trait]
    impl Handler for Stopper {
        fn queue(&self) -> Queue {
            Queue::UpdateTimeline
        }
        async fn handle(&self, _body: &[u8]) -> std::result::Result<(), HandlerError> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            self.shutdown.notify_one();
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_mid_batch_takes_no_further_batches() {
        for _ in 0..32 {
            let transport = Arc::new(InMemory::new());
            for i in 0..5 {
                transport
                    .publish(Queue::UpdateTimeline, format!("m{i}").into_bytes())
                    .await
                    .unwrap();
            }
            let shutdown = Arc::new(Notify::new());
            let stopper = Arc::new(Stopper {
                shutdown: shutdown.clone(),
                handled: AtomicUsize::new(0),
            });
            let config = Config {
                batch_size: NonZero::new(1).unwrap(),
                ..Default::default()
            };
            process(
                stopper.clone(),
                transport.clone(),
                config,
                shutdown,
                Arc::new(Instruments::new("fanline")),
            )
            .await
            .unwrap();
            assert_eq!(stopper.handled.load(Ordering::SeqCst), 1);
            assert_eq!(transport.depth(Queue::UpdateTimeline), 4);
        }
    }
}
