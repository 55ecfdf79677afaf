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

//! # Pipeline assembly
//!
//! Builds every stage from one set of [Backends] & one [Config], and hands back the consumer
//! [Handler]s for whichever stages a given process is meant to run.

use std::{num::NonZero, sync::Arc, time::Duration};

use serde::Deserialize;

use crate::{
    appender::Appender,
    backfill::{self, Backfill},
    cache::TimelineCache,
    consumer::{self, Handler, Processor},
    fanout::Orchestrator,
    metrics::Instruments,
    populator::{self, Populator},
    reader::{self, Reader},
    rebuilder::{self, Persister, Rebuilder},
    storage::{PostStore, SocialGraph, TimelineStore},
    transport::{Queue, Transport},
};

/// Tunables for the pipeline stages
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of entries a read returns when the caller doesn't say
    #[serde(rename = "reader-page")]
    pub reader_page: NonZero<usize>,
    /// Number of entries cached per user
    #[serde(rename = "populator-window")]
    pub populator_window: NonZero<usize>,
    /// Lifetime of a cached timeline
    #[serde(rename = "cache-ttl")]
    pub cache_ttl: Duration,
    /// Number of recent posts taken from each followee on rebuild
    #[serde(rename = "rebuild-page")]
    pub rebuild_page: NonZero<usize>,
    /// Number of recent posts backfilled on a new follow
    #[serde(rename = "backfill-page")]
    pub backfill_page: NonZero<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            reader_page: reader::DEFAULT_PAGE_SIZE,
            populator_window: populator::DEFAULT_WINDOW,
            cache_ttl: populator::DEFAULT_TTL,
            rebuild_page: rebuilder::DEFAULT_PAGE_SIZE,
            backfill_page: backfill::DEFAULT_PAGE_SIZE,
        }
    }
}

/// Everything the stages talk to
#[derive(Clone)]
pub struct Backends {
    pub timelines: Arc<dyn TimelineStore + Send + Sync>,
    pub graph: Arc<dyn SocialGraph + Send + Sync>,
    pub posts: Arc<dyn PostStore + Send + Sync>,
    pub cache: Arc<dyn TimelineCache + Send + Sync>,
    pub transport: Arc<dyn Transport + Send + Sync>,
}

/// All the stages, assembled
pub struct Pipeline {
    pub orchestrator: Arc<Orchestrator>,
    pub appender: Arc<Appender>,
    pub reader: Arc<Reader>,
    pub populator: Arc<Populator>,
    pub rebuilder: Arc<Rebuilder>,
    pub persister: Arc<Persister>,
    pub backfill: Arc<Backfill>,
    transport: Arc<dyn Transport + Send + Sync>,
    instruments: Arc<Instruments>,
}

impl Pipeline {
    pub fn new(backends: Backends, config: &Config, instruments: Arc<Instruments>) -> Pipeline {
        let Backends {
            timelines,
            graph,
            posts,
            cache,
            transport,
        } = backends;
        Pipeline {
            orchestrator: Arc::new(Orchestrator::new(
                graph.clone(),
                transport.clone(),
                instruments.clone(),
            )),
            appender: Arc::new(Appender::new(timelines.clone(), instruments.clone())),
            reader: Arc::new(Reader::new(
                timelines.clone(),
                cache.clone(),
                transport.clone(),
                instruments.clone(),
                Some(config.reader_page),
            )),
            populator: Arc::new(Populator::new(
                timelines.clone(),
                cache,
                instruments.clone(),
                Some(config.populator_window),
                Some(config.cache_ttl),
            )),
            rebuilder: Arc::new(Rebuilder::new(
                graph,
                posts.clone(),
                transport.clone(),
                instruments.clone(),
                Some(config.rebuild_page),
            )),
            persister: Arc::new(Persister::new(
                timelines,
                transport.clone(),
                instruments.clone(),
            )),
            backfill: Arc::new(Backfill::new(
                posts,
                transport.clone(),
                instruments.clone(),
                Some(config.backfill_page),
            )),
            transport,
            instruments,
        }
    }

    /// The consumer-side stages, one per queue
    pub fn handlers(&self) -> Vec<Arc<dyn Handler + Send + Sync>> {
        vec![
            self.orchestrator.clone() as Arc<dyn Handler + Send + Sync>,
            self.appender.clone() as Arc<dyn Handler + Send + Sync>,
            self.populator.clone() as Arc<dyn Handler + Send + Sync>,
            self.rebuilder.clone() as Arc<dyn Handler + Send + Sync>,
            self.persister.clone() as Arc<dyn Handler + Send + Sync>,
            self.backfill.clone() as Arc<dyn Handler + Send + Sync>,
        ]
    }

    /// Spawn a consumer loop for each stage whose queue is in `stages`
    pub fn spawn(&self, stages: &[Queue], config: &consumer::Config) -> Vec<Processor> {
        self.handlers()
            .into_iter()
            .filter(|handler| stages.contains(&handler.queue()))
            .map(|handler| {
                consumer::spawn(
                    handler,
                    self.transport.clone(),
                    Some(config.clone()),
                    self.instruments.clone(),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::{
        cache::{self, InMemory as InMemoryCache},
        memory::Store,
        testing::instruments,
        transport::InMemory,
    };

    fn pipeline() -> Pipeline {
        let store = Arc::new(Store::new());
        Pipeline::new(
            Backends {
                timelines: store.clone(),
                graph: store.clone(),
                posts: store,
                cache: Arc::new(InMemoryCache::new(&cache::Config::default())),
                transport: Arc::new(InMemory::new()),
            },
            &Config::default(),
            instruments(),
        )
    }

    #[test]
    fn one_handler_per_queue() {
        let mut queues = pipeline()
            .handlers()
            .iter()
            .map(|h| h.queue())
            .collect::<Vec<_>>();
        queues.sort();
        let mut all = Queue::ALL.to_vec();
        all.sort();
        assert_eq!(queues, all);
    }

    #[test]
    fn config() {
        let config = toml::from_str::<Config>(
            r#"
reader-page = 5
backfill-page = 3
"#,
        )
        .unwrap();
        assert_eq!(config.reader_page.get(), 5);
        assert_eq!(config.backfill_page.get(), 3);
        assert_eq!(config.populator_window.get(), 100);
        assert_eq!(config.cache_ttl, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn spawn_selected_stages() {
        let pipeline = pipeline();
        let processors = pipeline.spawn(
            &[Queue::UpdateTimeline, Queue::PopulateCache],
            &consumer::Config::default(),
        );
        assert_eq!(processors.len(), 2);
        for processor in processors {
            processor.shutdown(Duration::from_secs(5)).await.unwrap();
        }
    }
}
