//! Competitive-scenario wargaming engine: Monte Carlo simulation over
//! uncertain business variables, one-at-a-time sensitivity analysis,
//! decision trees over strategic options and multi-scenario comparison.
//!
//! The library performs no I/O apart from the helpers in [`output`] and the
//! `load` constructors used by the CLI.

pub mod comparison;
pub mod config;
pub mod decision_tree;
pub mod distribution;
pub mod error;
pub mod formula;
pub mod monte_carlo;
pub mod output;
pub mod scenario;
pub mod sensitivity;
pub mod stats;
pub mod wargame;

pub use comparison::{ScenarioComparator, ScenarioComparison};
pub use config::WargameConfig;
pub use decision_tree::DecisionTree;
pub use distribution::Distribution;
pub use error::{Result, WargameError};
pub use monte_carlo::{simulate, MonteCarloEngine, SimulationOptions, SimulationResult};
pub use scenario::{CompetitorAction, Scenario};
pub use sensitivity::{SensitivityAnalysis, SensitivityAnalyzer};
pub use wargame::{WargameResult, WargameRunner};
