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

//! # fanline metrics
//!
//! fanline uses [OpenTelemetry] to collect & export metrics. OTel wants instruments ("counters",
//! "gauges" & so forth) created once & re-used, which raises the question of where to keep them.
//! Rather than give every pipeline component a field per instrument, each metric is registered by
//! name at the site that uses it, via David Tolnay's [inventory] crate:
//!
//! [OpenTelemetry]: https://docs.rs/opentelemetry/latest/opentelemetry/index.html
//!
//! ```ignore
//! inventory::submit! {
//!     metrics::Registration::new("reader.cache.hits", Sort::IntegralCounter, "Reads served from the cache")
//! }
//! // ...
//! counter_add!(self.instruments, "reader.cache.hits", 1, &[]);
//! ```
//!
//! A single [Instruments] instance, built at startup & shared by [Arc](std::sync::Arc), pre-builds
//! every registered instrument & the macros look them up by name.
//!
//! Looking up a name that was never registered, or that names an instrument of the wrong sort, is
//! a logic error & panics.

use std::collections::HashMap;

use itertools::Itertools;
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Gauge},
};

/// Instrument type
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Sort {
    /// A monotonic `Counter<u64>`
    IntegralCounter,
    /// A `Gauge<u64>`
    IntegralGauge,
}

/// One metric, as registered at the site that records it
///
/// ```ignore
/// inventory::submit! {
///     metrics::Registration::new("fanout.messages.published", Sort::IntegralCounter,
///                                "Fan-out messages published")
/// }
/// ```
#[derive(Clone, Debug)]
pub struct Registration {
    pub name: &'static str,
    pub sort: Sort,
    pub description: &'static str,
}

impl Registration {
    pub const fn new(name: &'static str, sort: Sort, description: &'static str) -> Registration {
        Registration {
            name,
            sort,
            description,
        }
    }
}

inventory::collect!(Registration);

/// Panic if any metric name has been registered twice
pub fn check_metric_registrations() {
    if let Some(name) = inventory::iter::<Registration>
        .into_iter()
        .map(|reg| reg.name)
        .duplicates()
        .next()
    {
        panic!("The metric name {name} was registered twice");
    }
}

/// Every registered instrument, built against one [Meter](opentelemetry::metrics::Meter)
pub struct Instruments {
    counters: HashMap<&'static str, Counter<u64>>,
    gauges: HashMap<&'static str, Gauge<u64>>,
}

impl Instruments {
    pub fn new(meter_name: &'static str) -> Instruments {
        let meter = global::meter(meter_name);
        let (mut counters, mut gauges) = (HashMap::new(), HashMap::new());
        for reg in inventory::iter::<Registration> {
            match reg.sort {
                Sort::IntegralCounter => {
                    counters.insert(
                        reg.name,
                        meter
                            .u64_counter(reg.name)
                            .with_description(reg.description)
                            .build(),
                    );
                }
                Sort::IntegralGauge => {
                    gauges.insert(
                        reg.name,
                        meter
                            .u64_gauge(reg.name)
                            .with_description(reg.description)
                            .build(),
                    );
                }
            }
        }
        Instruments { counters, gauges }
    }
    /// Add `count` to the counter `name`; panics if there's no such counter
    pub fn add(&self, name: &str, count: u64, attributes: &[KeyValue]) {
        match self.counters.get(name) {
            Some(counter) => counter.add(count, attributes),
            None => panic!("{name} is not a registered counter"),
        }
    }
    /// Set the gauge `name` to `value`; panics if there's no such gauge
    pub fn recordu(&self, name: &str, value: u64, attributes: &[KeyValue]) {
        match self.gauges.get(name) {
            Some(gauge) => gauge.record(value, attributes),
            None => panic!("{name} is not a registered gauge"),
        }
    }
}

#[macro_export]
macro_rules! counter_add {
    ($instr:expr, $name:expr, $count:expr, $attrs:expr) => {
        $instr.add($name, $count, $attrs)
    };
}

#[macro_export]
macro_rules! gauge_setu {
    ($instr:expr, $name:expr, $value:expr, $attrs:expr) => {
        $instr.recordu($name, $value, $attrs)
    };
}
