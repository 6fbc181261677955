use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::formula::Formula;
use crate::monte_carlo::{MonteCarloEngine, SimulationResult};
use crate::scenario::Scenario;

/// Slack before a summed contribution above 1.0 counts as interaction.
const NONLINEARITY_TOLERANCE: f64 = 1e-9;

/// Variance attribution for one variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSensitivity {
    /// Baseline variance minus variance with this variable pinned.
    pub variance_reduction: f64,
    /// `variance_reduction / baseline variance`.
    pub variance_contribution: f64,
    /// Contribution in percent.
    pub impact_score: f64,
}

/// One-at-a-time variance decomposition of a scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensitivityAnalysis {
    pub variables: BTreeMap<String, VariableSensitivity>,
    /// Variable names by contribution, largest first.
    pub rank_order: Vec<String>,
    /// Sum of contributions, capped at 1.0.
    pub total_variance_explained: f64,
    /// Uncapped sum. Exceeds 1.0 when variables interact.
    pub raw_total_variance_explained: f64,
    pub nonlinearity_detected: bool,
    pub baseline_variance: f64,
}

impl SensitivityAnalysis {
    /// Largest driver of outcome variance.
    pub fn top_driver(&self) -> Option<(&str, &VariableSensitivity)> {
        let name = self.rank_order.first()?;
        self.variables.get(name).map(|s| (name.as_str(), s))
    }

    fn from_variances(baseline_variance: f64, pinned: Vec<(String, f64)>) -> Self {
        let variables: BTreeMap<String, VariableSensitivity> = pinned
            .into_iter()
            .map(|(name, variance)| {
                let reduction = baseline_variance - variance;
                let contribution = if baseline_variance > 0.0 {
                    reduction / baseline_variance
                } else {
                    0.0
                };
                (
                    name,
                    VariableSensitivity {
                        variance_reduction: reduction,
                        variance_contribution: contribution,
                        impact_score: contribution * 100.0,
                    },
                )
            })
            .collect();

        let mut rank_order: Vec<String> = variables.keys().cloned().collect();
        rank_order.sort_by(|a, b| {
            variables[b]
                .variance_contribution
                .total_cmp(&variables[a].variance_contribution)
                .then_with(|| a.cmp(b))
        });

        let raw: f64 = variables.values().map(|s| s.variance_contribution).sum();
        SensitivityAnalysis {
            variables,
            rank_order,
            total_variance_explained: raw.min(1.0),
            raw_total_variance_explained: raw,
            nonlinearity_detected: raw > 1.0 + NONLINEARITY_TOLERANCE,
            baseline_variance,
        }
    }
}

/// Re-runs the engine with each variable pinned at its central value.
#[derive(Debug, Clone)]
pub struct SensitivityAnalyzer {
    engine: MonteCarloEngine,
}

impl SensitivityAnalyzer {
    /// All runs share one seed; an unseeded engine gets one drawn here so
    /// the baseline and pinned runs see the same draws.
    pub fn new(engine: &MonteCarloEngine) -> Self {
        SensitivityAnalyzer {
            engine: MonteCarloEngine::new(engine.options.with_fixed_seed()),
        }
    }

    pub fn engine(&self) -> &MonteCarloEngine {
        &self.engine
    }

    /// Baseline plus one pinned run per variable: N+1 independent runs on
    /// the rayon pool, combined after all finish.
    pub fn analyze(&self, scenario: &Scenario) -> Result<SensitivityAnalysis> {
        let formula = scenario.compile_formula()?;
        let mut jobs: Vec<Option<&String>> = vec![None];
        jobs.extend(scenario.variables.keys().map(Some));

        info!(
            scenario = %scenario.name,
            runs = jobs.len(),
            "starting sensitivity analysis"
        );

        let variances: Vec<(Option<&String>, f64)> = jobs
            .into_par_iter()
            .map(|job| -> Result<(Option<&String>, f64)> {
                let result = match job {
                    None => self.engine.simulate_compiled(&scenario.variables, &formula)?,
                    Some(name) => self.run_pinned(scenario, &formula, name)?,
                };
                Ok((job, result.variance()))
            })
            .collect::<Result<_>>()?;

        let baseline_variance = variances[0].1;
        let pinned = variances
            .into_iter()
            .filter_map(|(job, v)| job.map(|name| (name.clone(), v)))
            .collect();
        Ok(self.finish(scenario, baseline_variance, pinned))
    }

    /// Pinned runs only, against a baseline produced by this analyzer's
    /// engine (same seed and iteration count).
    pub fn analyze_against(
        &self,
        scenario: &Scenario,
        baseline: &SimulationResult,
    ) -> Result<SensitivityAnalysis> {
        let formula = scenario.compile_formula()?;
        let names: Vec<&String> = scenario.variables.keys().collect();

        let pinned: Vec<(String, f64)> = names
            .into_par_iter()
            .map(|name| -> Result<(String, f64)> {
                let result = self.run_pinned(scenario, &formula, name)?;
                Ok((name.clone(), result.variance()))
            })
            .collect::<Result<_>>()?;

        Ok(self.finish(scenario, baseline.variance(), pinned))
    }

    fn run_pinned(
        &self,
        scenario: &Scenario,
        formula: &Formula,
        name: &str,
    ) -> Result<SimulationResult> {
        let pinned = scenario.with_pinned(name)?;
        let result = self.engine.simulate_compiled(&pinned.variables, formula)?;
        debug!(variable = name, variance = result.variance(), "pinned run done");
        Ok(result)
    }

    fn finish(
        &self,
        scenario: &Scenario,
        baseline_variance: f64,
        pinned: Vec<(String, f64)>,
    ) -> SensitivityAnalysis {
        let analysis = SensitivityAnalysis::from_variances(baseline_variance, pinned);
        if analysis.nonlinearity_detected {
            warn!(
                scenario = %scenario.name,
                raw_total = analysis.raw_total_variance_explained,
                "variance contributions exceed 1.0; variables interact"
            );
        }
        analysis
    }
}
