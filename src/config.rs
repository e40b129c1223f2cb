//! Runtime options. Defaults, overridden by `MEMTRACE_*` environment
//! variables (`MEMTRACE_SHOW_ALLOCS=true`, `MEMTRACE_LEAK_LOG=/tmp/leaks.log`,
//! ...).

use std::path::PathBuf;

use figment::{
    providers::{Env, Serialized},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::TrackError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log every tracked allocation at `debug`
    pub show_allocs: bool,
    /// Log every tracked deallocation at `debug`, with the record's type and
    /// call site
    pub show_deallocs: bool,
    /// Write the shutdown leak report to `leak_log`
    pub dump_leaks: bool,
    pub leak_log: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            show_allocs: false,
            show_deallocs: false,
            dump_leaks: false,
            leak_log: PathBuf::from("memleaks.log"),
        }
    }
}

impl Config {
    pub const ENV_PREFIX: &'static str = "MEMTRACE_";

    /// Defaults merged with the environment
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default())).merge(Env::prefixed(Self::ENV_PREFIX))
    }

    pub fn load() -> Result<Self, TrackError> {
        Self::from_figment(Self::figment())
    }

    pub fn from_figment(figment: Figment) -> Result<Self, TrackError> {
        Ok(figment.extract()?)
    }
}
