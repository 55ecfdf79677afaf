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

use std::{env, fs, str::FromStr};

use futures::future::BoxFuture;
use libtest_mimic::Failed;
use serde::{Deserialize, Deserializer, de::Error as DeError};
use snafu::{IntoError, prelude::*};
use tap::Pipe;
use tracing::level_filters::LevelFilter;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to parse {pth}: {source}"))]
    De {
        pth: String,
        source: toml::de::Error,
    },
    #[snafu(display("Failed to read FANLINE_TEST_CONFIG: {source}"))]
    Env { source: std::env::VarError },
    #[snafu(display("Failed to read {pth}: {source}"))]
    Read { pth: String, source: std::io::Error },
}

type Result<T> = std::result::Result<T, Error>;

fn de_level_filter<'de, D>(deserializer: D) -> std::result::Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    LevelFilter::from_str(&s).map_err(D::Error::custom)
}

/// Common test configuration
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub logging: bool,
    #[serde(rename = "log-level", deserialize_with = "de_level_filter")]
    pub log_level: LevelFilter,
}

impl Configuration {
    /// Obtain a [Configuration]
    ///
    /// Check the `FANLINE_TEST_CONFIG` environment variable; if defined, attempt to parse a
    /// [Configuration] from the file named therein; else return a default instance.
    pub fn new() -> Result<Configuration> {
        match env::var("FANLINE_TEST_CONFIG") {
            Ok(f) => fs::read_to_string(&f)
                .context(ReadSnafu { pth: f.clone() })?
                .pipe(|s| toml::from_str::<Configuration>(&s))
                .context(DeSnafu { pth: f.clone() }),
            Err(env::VarError::NotPresent) => Ok(Configuration::default()),
            Err(err) => Err(EnvSnafu.into_error(err)),
        }
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            logging: false,
            log_level: LevelFilter::INFO,
        }
    }
}

pub struct Test {
    pub name: &'static str,
    pub test_fn: fn(cfg: Configuration) -> BoxFuture<'static, std::result::Result<(), Failed>>,
}

inventory::collect!(Test);
