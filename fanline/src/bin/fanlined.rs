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

//! # fanlined
//!
//! The fanline pipeline daemon.
//!
//! # Introduction
//!
//! `fanlined` runs the consumer loops for some or all of the fanline pipeline stages (see the
//! `stages` configuration item) against the configured storage, cache & transport. It runs in the
//! foreground (the expectation is that it will be run inside a container, or under a supervisor),
//! logging to stdout.
//!
//! `SIGHUP` causes the process to re-read its configuration file & restart its consumer loops;
//! `SIGTERM` or `SIGINT` shut it down gracefully.

use std::{
    env,
    fmt::Display,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::{Arg, ArgAction, Command, crate_authors, crate_version, value_parser};
use futures::future::select_all;
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use secrecy::SecretString;
use serde::Deserialize;
use snafu::prelude::*;
use tokio::{
    signal::unix::{SignalKind, signal},
    task::JoinHandle,
};
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::{Layer, Registry, filter::EnvFilter, fmt, layer::SubscriberExt};
use url::Url;
use uuid::Uuid;

use fanline::{
    cache::{self, TimelineCache},
    consumer,
    dynamodb::{self, Location as DynamoLocation},
    memory,
    metrics::{Instruments, check_metric_registrations},
    pipeline::{self, Backends, Pipeline},
    transport::{self, Queue, Transport},
};

/// The fanlined application error type
///
/// `Debug` is implemented by hand, in terms of `Display`: `main()` returns `Result<(), Error>` &
/// the runtime prints the `Debug` representation of any error so returned.
#[derive(Snafu)]
pub enum Error {
    #[snafu(display("Unable to read configuration file {pth:?}: {source}"))]
    ConfigRead {
        pth: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Error parsing configuration file {pth:?}: {source}"))]
    ConfigParse {
        pth: PathBuf,
        source: toml::de::Error,
    },
    #[snafu(display("Couldn't resolve the present working directory: {source}"))]
    CurrentDir { source: std::io::Error },
    #[snafu(display("Failed to connect to DynamoDB: {source}"))]
    Dynamo { source: dynamodb::Error },
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    EnvFilter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("While building the OTLP exporter, {source}"))]
    OtlpExporter {
        source: opentelemetry_otlp::ExporterBuildError,
    },
    #[snafu(display("Failed to install a handler for {signal}: {source}"))]
    Signal {
        signal: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("Failed to set the tracing subscriber: {source}"))]
    Subscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
    #[snafu(display("Failed to instantiate a Tokio runtime: {source}"))]
    TokioRuntime { source: std::io::Error },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self::Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

/// Options read from the command line (or the environment)
struct CliOpts {
    instance_id: Uuid,
    /// Log in human-readable form rather than JSON
    plain: bool,
    level: Level,
    cfg: Option<PathBuf>,
}

impl TryFrom<clap::ArgMatches> for CliOpts {
    type Error = Error;

    fn try_from(matches: clap::ArgMatches) -> Result<CliOpts> {
        // The most verbose flag given wins
        let level = [
            ("debug", Level::TRACE),
            ("verbose", Level::DEBUG),
            ("quiet", Level::ERROR),
        ]
        .into_iter()
        .find_map(|(flag, level)| matches.get_flag(flag).then_some(level))
        .unwrap_or(Level::INFO);
        let cfg = match matches.get_one::<PathBuf>("config") {
            Some(pth) => Some(env::current_dir().context(CurrentDirSnafu)?.join(pth)),
            None => None,
        };
        Ok(CliOpts {
            instance_id: matches
                .get_one::<Uuid>("instance-id")
                .copied()
                .unwrap_or_else(Uuid::new_v4),
            plain: matches.get_flag("plain"),
            level,
            cfg,
        })
    }
}

/// Where timelines, follows & posts live
// Deserialize only; the credentials are secrets
#[derive(Clone, Debug, Default, Deserialize)]
pub enum StorageConfig {
    /// In-process; for development & testing. Survives a `SIGHUP`, but not a restart.
    #[default]
    Memory,
    /// DynamoDB, or anything speaking its API
    Dynamo {
        /// Key ID & secret key
        credentials: Option<(SecretString, SecretString)>,
        /// A region name, or a list of endpoint URLs (`http://localhost:8000`, e.g.)
        location: DynamoLocation,
    },
}

/// How the pipeline stages talk to one another
#[derive(Clone, Debug, Default, Deserialize)]
pub enum TransportConfig {
    /// In-process queues; only useful when this process runs every stage
    #[default]
    Memory,
    /// Queues kept in a DynamoDB `messages` table
    Dynamo {
        credentials: Option<(SecretString, SecretString)>,
        location: DynamoLocation,
    },
}

#[derive(Clone, Debug, Deserialize)]
pub struct OtelExportConfig {
    /// Endpoint that will receive metric data in OTLP format
    endpoint: Url,
    /// Interval at which metrics will be pushed to `endpoint`; defaults to 60 seconds
    interval: Option<std::time::Duration>,
}

/// fanline configuration, version one
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
struct ConfigV1 {
    /// OTLP export target; None means don't export
    #[serde(rename = "otlp-export")]
    otlp_export: Option<OtelExportConfig>,
    #[serde(rename = "storage-config")]
    storage_config: StorageConfig,
    #[serde(rename = "transport-config")]
    transport_config: TransportConfig,
    #[serde(rename = "cache-config")]
    cache_config: cache::Config,
    pipeline: pipeline::Config,
    consumer: consumer::Config,
    /// The stages this instance runs, named by their inbound queues
    stages: Vec<Queue>,
}

impl Default for ConfigV1 {
    fn default() -> Self {
        ConfigV1 {
            otlp_export: None,
            storage_config: StorageConfig::default(),
            transport_config: TransportConfig::default(),
            cache_config: cache::Config::default(),
            pipeline: pipeline::Config::default(),
            consumer: consumer::Config::default(),
            stages: Queue::ALL.to_vec(),
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "version")] // tag "internally"
enum Configuration {
    #[serde(rename = "1")]
    V1(ConfigV1),
}

const DEFAULT_CONFIG: &str = "/etc/fanline.toml";

/// Parse the fanline configuration file
///
/// If no file was named & there's nothing at [DEFAULT_CONFIG], run on defaults. A file that was
/// named had better exist.
fn parse_config(cfg: Option<&Path>) -> Result<ConfigV1> {
    let pth = cfg.unwrap_or(Path::new(DEFAULT_CONFIG));
    let text = match std::fs::read_to_string(pth) {
        Ok(text) => text,
        Err(err) if cfg.is_none() && err.kind() == io::ErrorKind::NotFound => {
            return Ok(ConfigV1::default());
        }
        Err(err) => return Err(err).context(ConfigReadSnafu { pth }),
    };
    toml::from_str::<Configuration>(&text)
        .context(ConfigParseSnafu { pth })
        .map(|Configuration::V1(cfg)| cfg)
}

/// Configure fanline logging
///
/// Logs go to stdout, as JSON unless `--plain` was given. This can only be invoked once (as it, in
/// turn, calls tracing's [set_global_default](tracing::subscriber::set_global_default)).
fn configure_logging(opts: &CliOpts) -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(opts.level.into())
        .from_env()
        .context(EnvFilterSnafu)?;

    // `json()` & `compact()` produce layers of different types; `Box<dyn Layer<S> + Send + Sync>`
    // implements `Layer`
    let formatter: Box<dyn Layer<Registry> + Send + Sync> = if opts.plain {
        Box::new(fmt::Layer::default().compact().with_writer(io::stdout))
    } else {
        Box::new(
            fmt::Layer::default()
                .json()
                .with_current_span(true)
                .with_writer(io::stdout),
        )
    };

    tracing::subscriber::set_global_default(Registry::default().with(formatter).with(filter))
        .context(SubscriberSnafu)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        backend selection                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// In-process backends, kept across configuration reloads
#[derive(Default)]
struct InProcess {
    store: Arc<memory::Store>,
    transport: Arc<transport::InMemory>,
}

async fn select_backends(cfg: &ConfigV1, in_process: &InProcess) -> Result<Backends> {
    let (timelines, graph, posts): (
        Arc<dyn fanline::storage::TimelineStore + Send + Sync>,
        Arc<dyn fanline::storage::SocialGraph + Send + Sync>,
        Arc<dyn fanline::storage::PostStore + Send + Sync>,
    ) = match &cfg.storage_config {
        StorageConfig::Memory => (
            in_process.store.clone(),
            in_process.store.clone(),
            in_process.store.clone(),
        ),
        StorageConfig::Dynamo {
            credentials,
            location,
        } => {
            let x = Arc::new(
                dynamodb::Client::new(location, credentials)
                    .await
                    .context(DynamoSnafu)?,
            );
            (x.clone(), x.clone(), x)
        }
    };
    let transport: Arc<dyn Transport + Send + Sync> = match &cfg.transport_config {
        TransportConfig::Memory => in_process.transport.clone(),
        TransportConfig::Dynamo {
            credentials,
            location,
        } => Arc::new(
            dynamodb::Client::new(location, credentials)
                .await
                .context(DynamoSnafu)?,
        ),
    };
    let cache: Arc<dyn TimelineCache + Send + Sync> =
        Arc::new(cache::InMemory::new(&cfg.cache_config));
    Ok(Backends {
        timelines,
        graph,
        posts,
        cache,
        transport,
    })
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             serve                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

type ConsumerHandle = JoinHandle<consumer::Result<()>>;

/// Resolve when the first of `handles` completes; never, if there are none
async fn first_exit(handles: &mut [ConsumerHandle]) -> usize {
    if handles.is_empty() {
        std::future::pending::<()>().await;
    }
    let (result, index, _) = select_all(handles.iter_mut()).await;
    error!("Consumer loop {index} exited early with {result:?}");
    index
}

/// Ask every consumer loop to stop, & wait (a bounded time) for each to do so
async fn shutdown(
    processors: Vec<(ConsumerHandle, Arc<tokio::sync::Notify>)>,
    timeout: std::time::Duration,
) {
    processors.iter().for_each(|(_, nfy)| nfy.notify_one());
    for (handle, _) in processors {
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(Ok(()))) => (),
            Ok(Ok(Err(err))) => error!("A consumer loop failed: {err}"),
            Ok(Err(err)) => error!("Failed to join a consumer loop: {err}"),
            Err(_) => warn!("Timed out waiting for a consumer loop to exit"),
        }
    }
}

/// Run the configured consumer loops until asked to stop
#[tracing::instrument(skip(opts, cfg), fields(instance_id = %opts.instance_id))]
async fn serve(opts: CliOpts, mut cfg: ConfigV1) -> Result<()> {
    let mut sighup = signal(SignalKind::hangup()).context(SignalSnafu { signal: "SIGHUP" })?;
    let mut sigterm = signal(SignalKind::terminate()).context(SignalSnafu { signal: "SIGTERM" })?;
    let mut sigint = signal(SignalKind::interrupt()).context(SignalSnafu { signal: "SIGINT" })?;

    let provider = init_telemetry(cfg.otlp_export.as_ref())?;
    let instruments = Arc::new(Instruments::new("fanline"));
    let in_process = InProcess::default();

    // Loop, handling SIGHUPs, until asked to terminate:
    loop {
        let backends = select_backends(&cfg, &in_process).await?;
        let pipeline = Pipeline::new(backends, &cfg.pipeline, instruments.clone());
        let (mut handles, notifies): (Vec<_>, Vec<_>) = pipeline
            .spawn(&cfg.stages, &cfg.consumer)
            .into_iter()
            .map(|processor| processor.into_parts())
            .unzip();
        info!("Running {} consumer loops.", handles.len());

        let shutdown_timeout = cfg.consumer.shutdown_timeout;
        let done = tokio::select! {
            _ = sighup.recv() => {
                info!("Received SIGHUP; re-reading configuration.");
                cfg = match parse_config(opts.cfg.as_deref()) {
                    Ok(cfg) => cfg,
                    Err(err) => {
                        warn!("{err}; keeping the current configuration");
                        cfg
                    }
                };
                false
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM; terminating.");
                true
            }
            _ = sigint.recv() => {
                info!("Received SIGINT; terminating.");
                true
            }
            index = first_exit(&mut handles) => {
                // This shouldn't happen
                handles.remove(index);
                let mut notifies = notifies;
                notifies.remove(index);
                shutdown(handles.into_iter().zip(notifies).collect(), shutdown_timeout).await;
                break;
            }
        };
        shutdown(handles.into_iter().zip(notifies).collect(), shutdown_timeout).await;
        if done {
            break;
        }
    }

    if let Err(err) = provider.shutdown() {
        debug!("Failed to shut down the meter provider: {err}");
    }
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                    main() & process startup                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Initialize telemetry
///
/// Must be invoked from inside the Tokio runtime, but before [Instruments] are built: instruments
/// are created from the global meter provider, so one created earlier will go nowhere.
fn init_telemetry(collector_config: Option<&OtelExportConfig>) -> Result<SdkMeterProvider> {
    check_metric_registrations();

    let mut provider = SdkMeterProvider::builder().with_resource(
        opentelemetry_sdk::Resource::builder_empty()
            .with_attribute(KeyValue::new("service.name", "fanline"))
            .build(),
    );

    if let Some(config) = collector_config {
        let otlp_exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_http()
            .with_endpoint(config.endpoint.as_str())
            .with_protocol(opentelemetry_otlp::Protocol::HttpBinary)
            .build()
            .context(OtlpExporterSnafu)?;

        let mut reader = opentelemetry_sdk::metrics::PeriodicReader::builder(otlp_exporter);
        if let Some(interval) = config.interval {
            reader = reader.with_interval(interval);
        }
        provider = provider.with_reader(reader.build());
    }

    let provider = provider.build();
    global::set_meter_provider(provider.clone());
    Ok(provider)
}

async fn go_async(
    opts: CliOpts,
    bootstrap_logging_guard: tracing::dispatcher::DefaultGuard,
) -> Result<()> {
    // Configure logging *before* calling `serve()`, since it's instrumented. Failure to parse at
    // this point is fatal; on SIGHUP, `serve()` falls back to the last known-good configuration.
    let cfg = match parse_config(opts.cfg.as_deref()).and_then(|cfg| {
        configure_logging(&opts)?;
        Ok(cfg)
    }) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("While configuring logging: {err:?}");
            return Err(err);
        }
    };
    // Drop the guard, cleaning-up the bootstrap logger
    drop(bootstrap_logging_guard);

    info!(
        "fanline version {}, instance {} starting.",
        crate_version!(),
        opts.instance_id
    );

    serve(opts, cfg).await
}

fn main() -> Result<()> {
    // Most configuration is read from file; the command line says where to find that file & how to
    // log. Every option has an environment variable, for convenience in containers.
    let opts = CliOpts::try_from(
        Command::new("fanlined")
            .version(crate_version!())
            .author(crate_authors!())
            .about("Timeline delivery for a social feed")
            .long_about(
                "`fanlined` runs the fanline pipeline stages: fan-out, timeline appends, \
                 cache population, rebuilds & new-follow backfill.",
            )
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .num_args(1)
                    .value_parser(value_parser!(PathBuf))
                    .env("FANLINE_CONFIG")
                    .help(
                        "path (absolute or relative to the process' current directory) to a \
                         configuration file",
                    ),
            )
            .arg(
                Arg::new("debug")
                    .short('D')
                    .long("debug")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("FANLINE_DEBUG")
                    .help("produce debug output"),
            )
            .arg(
                Arg::new("instance-id")
                    .short('I')
                    .long("instance-id")
                    .num_args(1)
                    .value_parser(value_parser!(Uuid))
                    .env("FANLINE_INSTANCE_ID")
                    .help("Instance ID (only salient when running several instances)")
                    .long_help(
                        "Instance ID
A UUID identifying this fanlined instance in logs. If not given, a random UUID will be used.",
                    ),
            )
            .arg(
                Arg::new("plain")
                    .short('p')
                    .long("plain")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("FANLINE_PLAIN")
                    .help("log in human-readable format, not JSON/structured logging"),
            )
            .arg(
                Arg::new("quiet")
                    .short('q')
                    .long("quiet")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("FANLINE_QUIET")
                    .help("produce only error output"),
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("FANLINE_VERBOSE")
                    .help("produce prolix output"),
            )
            .get_matches(),
    )?;

    // Things can go wrong before the global subscriber is installed; log to stderr until then.
    let bootstrap_subscriber = tracing_subscriber::registry::Registry::default()
        .with(tracing_subscriber::fmt::Layer::default().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(opts.level.into())
                .from_env()
                .context(EnvFilterSnafu)?,
        );
    let bootstrap_logging_guard = tracing::subscriber::set_default(bootstrap_subscriber);
    debug!("Temporarily logging to stderr while initializing.");

    tokio::runtime::Runtime::new()
        .context(TokioRuntimeSnafu)?
        .block_on(go_async(opts, bootstrap_logging_guard))
}
