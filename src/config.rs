use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{Result, WargameError};
use crate::monte_carlo::{SimulationOptions, DEFAULT_INVALID_THRESHOLD};

/// Run parameters for a wargame or comparison. Every field is optional in
/// TOML; missing ones take the defaults below.
///
/// ```toml
/// iterations = 20000
/// seed = 42
/// antithetic = true
/// include_sensitivity = true
/// timeout_ms = 30000
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WargameConfig {
    pub iterations: usize,
    pub seed: Option<u64>,
    pub antithetic: bool,
    pub include_sensitivity: bool,
    pub include_decision_tree: bool,
    /// Keep raw outcomes on the simulation result (for histograms).
    pub keep_outcomes: bool,
    pub parallel: bool,
    pub chunk_size: usize,
    /// Invalid-iteration fraction above which results are flagged degraded.
    pub invalid_threshold: f64,
    /// Overall budget; exceeding it discards the whole run.
    pub timeout_ms: Option<u64>,
}

impl Default for WargameConfig {
    fn default() -> Self {
        WargameConfig {
            iterations: 10_000,
            seed: None,
            antithetic: false,
            include_sensitivity: false,
            include_decision_tree: false,
            keep_outcomes: false,
            parallel: true,
            chunk_size: 2048,
            invalid_threshold: DEFAULT_INVALID_THRESHOLD,
            timeout_ms: None,
        }
    }
}

impl WargameConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: WargameConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            WargameError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        self.simulation_options(None).validate()?;
        if self.timeout_ms == Some(0) {
            return Err(WargameError::validation("timeout_ms must be > 0"));
        }
        Ok(())
    }

    /// Deadline measured from now, if a timeout is configured.
    pub fn deadline(&self) -> Option<Instant> {
        self.timeout_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms))
    }

    pub fn simulation_options(&self, deadline: Option<Instant>) -> SimulationOptions {
        SimulationOptions {
            iterations: self.iterations,
            seed: self.seed,
            antithetic: self.antithetic,
            keep_outcomes: self.keep_outcomes,
            parallel: self.parallel,
            chunk_size: self.chunk_size,
            invalid_threshold: self.invalid_threshold,
            deadline,
        }
    }
}
