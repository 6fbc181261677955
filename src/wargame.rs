use std::collections::BTreeMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::WargameConfig;
use crate::decision_tree::{options_from_scenario, DecisionTree};
use crate::error::Result;
use crate::monte_carlo::{MonteCarloEngine, SimulationResult};
use crate::scenario::Scenario;
use crate::sensitivity::{SensitivityAnalysis, SensitivityAnalyzer};

/// z-score of a two-sided 95% interval.
const Z_95: f64 = 1.96;

/// Everything computed for one scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WargameResult {
    pub scenario: Scenario,
    pub simulation: SimulationResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensitivity: Option<SensitivityAnalysis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_tree: Option<DecisionTree>,
    pub win_probability: f64,
    pub expected_value: f64,
    pub risk_metrics: BTreeMap<String, f64>,
    pub recommendations: Vec<String>,
    pub confidence_score: f64,
    pub competitor_response_probabilities: BTreeMap<String, f64>,
}

/// Runs simulation, sensitivity and decision tree for one scenario.
#[derive(Debug, Clone, Default)]
pub struct WargameRunner {
    pub config: WargameConfig,
}

impl WargameRunner {
    pub fn new(config: WargameConfig) -> Self {
        WargameRunner { config }
    }

    pub fn run(&self, scenario: &Scenario) -> Result<WargameResult> {
        self.config.validate()?;
        self.run_until(scenario, self.config.deadline())
    }

    /// Run against an externally fixed deadline (shared across scenarios by
    /// the comparator).
    pub fn run_until(&self, scenario: &Scenario, deadline: Option<Instant>) -> Result<WargameResult> {
        let formula = scenario.compile_formula()?;
        let options = self.config.simulation_options(deadline).with_fixed_seed();
        let engine = MonteCarloEngine::new(options);

        info!(scenario = %scenario.name, "running wargame");
        let simulation = engine.simulate_compiled(&scenario.variables, &formula)?;

        let sensitivity = if self.config.include_sensitivity {
            Some(SensitivityAnalyzer::new(&engine).analyze_against(scenario, &simulation)?)
        } else {
            None
        };

        let decision_tree = if self.config.include_decision_tree {
            if scenario.our_actions.is_empty() {
                warn!(
                    scenario = %scenario.name,
                    "decision tree requested but scenario has no strategic options"
                );
                None
            } else {
                let options = options_from_scenario(scenario, simulation.mean);
                Some(DecisionTree::build(&options)?)
            }
        } else {
            None
        };

        let recommendations =
            recommendations(&simulation, sensitivity.as_ref(), decision_tree.as_ref());

        Ok(WargameResult {
            win_probability: simulation.prob_positive,
            expected_value: simulation.mean,
            risk_metrics: risk_metrics(&simulation),
            confidence_score: confidence_score(&simulation),
            competitor_response_probabilities: scenario.competitor_response_probabilities(),
            recommendations,
            scenario: scenario.clone(),
            simulation,
            sensitivity,
            decision_tree,
        })
    }
}

/// Risk figures passed verbatim to downstream consumers.
pub fn risk_metrics(sim: &SimulationResult) -> BTreeMap<String, f64> {
    let p = |key: &str| sim.percentile(key).unwrap_or(sim.median);
    let cv = if sim.mean != 0.0 {
        sim.std_dev / sim.mean.abs()
    } else {
        0.0
    };

    let mut m = BTreeMap::new();
    m.insert("var_95".to_string(), sim.var_95);
    m.insert("cvar_95".to_string(), sim.cvar_95);
    m.insert("volatility".to_string(), sim.std_dev);
    m.insert("prob_loss".to_string(), 1.0 - sim.prob_positive);
    m.insert("coefficient_of_variation".to_string(), cv);
    m.insert("interquartile_range".to_string(), p("p75") - p("p25"));
    m.insert("range".to_string(), sim.max - sim.min);
    m
}

/// Share of valid iterations times the relative precision of the mean:
/// `valid_fraction * (1 - min(1, 1.96 * std_err / |mean|))`.
pub fn confidence_score(sim: &SimulationResult) -> f64 {
    let n = sim.valid_iterations.max(1) as f64;
    let half_width = Z_95 * sim.std_dev / n.sqrt();
    let relative = if sim.mean != 0.0 {
        half_width / sim.mean.abs()
    } else if half_width == 0.0 {
        0.0
    } else {
        1.0
    };
    (sim.valid_fraction() * (1.0 - relative.min(1.0))).clamp(0.0, 1.0)
}

/// Metric-derived statements; no narrative.
pub fn recommendations(
    sim: &SimulationResult,
    sensitivity: Option<&SensitivityAnalysis>,
    tree: Option<&DecisionTree>,
) -> Vec<String> {
    let mut out = vec![
        format!(
            "Win probability {:.1}% with expected value {:.2}",
            sim.prob_positive * 100.0,
            sim.mean
        ),
        format!(
            "Downside risk: 5% of outcomes fall below {:.2} (CVaR {:.2})",
            sim.var_95, sim.cvar_95
        ),
    ];

    if let Some(s) = sensitivity {
        if let Some((name, driver)) = s.top_driver() {
            out.push(format!(
                "Largest driver of outcome variance: {} ({:.1}% of variance)",
                name, driver.impact_score
            ));
        }
        if s.nonlinearity_detected {
            out.push(format!(
                "Variables interact: one-at-a-time contributions sum to {:.1}% of variance",
                s.raw_total_variance_explained * 100.0
            ));
        }
    }

    if let Some((action, ev)) = tree.and_then(|t| t.best_option()) {
        out.push(format!(
            "Best strategic option by expected value: {} ({:.2})",
            action, ev
        ));
    }

    if sim.degraded {
        out.push(format!(
            "Result quality degraded: {} of {} iterations were invalid",
            sim.invalid_iterations, sim.iterations
        ));
    }
    out
}
