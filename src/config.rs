use crate::graph_builder::Method;
use crate::pool::PoolTimeouts;
use crate::reducers::ReducerSettings;
use crate::threshold_search::SearchSettings;
use crate::{ReduceError, ReduceResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

pub const DEFAULT_INITIAL_THRESHOLD: f64 = 0.01;
pub const DEFAULT_AUTO_MULTIPLIER: f64 = 0.01;
pub const DEFAULT_AUTO_ATTEMPTS: usize = 3;
pub const DEFAULT_MAX_ASCENT_STEPS: usize = 1000;

/// One less than the number of cores, at least one.
pub fn default_threads() -> usize {
    thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

fn default_multiplier() -> f64 {
    DEFAULT_AUTO_MULTIPLIER
}

fn default_attempts() -> usize {
    DEFAULT_AUTO_ATTEMPTS
}

fn default_max_ascent_steps() -> usize {
    DEFAULT_MAX_ASCENT_STEPS
}

/// Reduction task, read from a JSON file with kebab-case keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ReducingTaskConfig {
    pub model: PathBuf,
    pub target_species: Vec<String>,
    #[serde(default)]
    pub retained_species: Vec<String>,
    pub method: Method,
    /// Percent.
    pub max_error: f64,
    /// Pinned when given; auto-discovered from the default otherwise.
    #[serde(default)]
    pub initial_threshold: Option<f64>,
    #[serde(default)]
    pub threshold_increment: Option<f64>,
    #[serde(default = "default_multiplier")]
    pub initial_threshold_auto_retrieving_multiplier: f64,
    #[serde(default = "default_attempts")]
    pub initial_threshold_auto_retrieving_attempts: usize,
    #[serde(default = "default_max_ascent_steps")]
    pub max_ascent_steps: usize,
}

impl ReducingTaskConfig {
    pub fn load(path: &Path) -> ReduceResult<Self> {
        let json = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ReduceResult<()> {
        if self.target_species.is_empty() {
            return Err(ReduceError::Config("target-species must not be empty".to_string()));
        }
        if !(self.max_error > 0.0 && self.max_error < 100.0) {
            return Err(ReduceError::Config(format!(
                "max-error must be between 0 and 100 percent, got {}",
                self.max_error
            )));
        }
        if self.initial_threshold_auto_retrieving_attempts <= 1 {
            return Err(ReduceError::Config(
                "initial-threshold-auto-retrieving-attempts must be greater than 1".to_string(),
            ));
        }
        self.search_settings().validate()
    }

    pub fn max_error_fraction(&self) -> f64 {
        self.max_error / 100.0
    }

    pub fn search_settings(&self) -> SearchSettings {
        SearchSettings {
            initial_threshold: self.initial_threshold.unwrap_or(DEFAULT_INITIAL_THRESHOLD),
            pinned: self.initial_threshold.is_some(),
            increment: self.threshold_increment,
            multiplier: self.initial_threshold_auto_retrieving_multiplier,
            attempts: self.initial_threshold_auto_retrieving_attempts,
            max_error: self.max_error_fraction(),
            max_ascent_steps: self.max_ascent_steps,
        }
    }

    /// Every target and retained species must exist in the model.
    pub fn check_species_exist(&self, species: &[String]) -> ReduceResult<()> {
        for name in self.target_species.iter().chain(&self.retained_species) {
            if !species.contains(name) {
                return Err(ReduceError::Config(format!("No such species `{}` in model", name)));
            }
        }
        Ok(())
    }

    /// Indices of target and retained species, in that order.
    pub fn species_indices(&self, species: &[String]) -> ReduceResult<(Vec<usize>, Vec<usize>)> {
        self.check_species_exist(species)?;
        let lookup = |names: &[String]| -> Vec<usize> {
            names
                .iter()
                .filter_map(|name| species.iter().position(|s| s == name))
                .collect()
        };
        Ok((lookup(&self.target_species), lookup(&self.retained_species)))
    }
}

/// Process-level settings, mostly from the command line.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// 0 picks [`default_threads`].
    pub build_threads: usize,
    pub reduce_threads: usize,
    pub verbosity: u8,
    pub colorized: bool,
    pub timeouts: PoolTimeouts,
    pub build_timeout: Option<Duration>,
    pub reduce_timeout: Option<Duration>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            build_threads: 0,
            reduce_threads: 0,
            verbosity: 0,
            colorized: true,
            timeouts: PoolTimeouts::default(),
            build_timeout: None,
            reduce_timeout: None,
        }
    }
}

impl RunConfig {
    pub fn reducer_settings(&self) -> ReducerSettings {
        let resolve = |threads: usize| if threads == 0 { default_threads() } else { threads };
        ReducerSettings {
            build_threads: resolve(self.build_threads),
            reduce_threads: resolve(self.reduce_threads),
            timeouts: self.timeouts,
            build_timeout: self.build_timeout,
            reduce_timeout: self.reduce_timeout,
        }
    }
}
