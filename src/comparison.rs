use std::collections::{BTreeMap, BTreeSet};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::WargameConfig;
use crate::error::{Result, WargameError};
use crate::scenario::Scenario;
use crate::wargame::{WargameResult, WargameRunner};

/// Risk/return profile of one scenario.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskReturn {
    pub expected_return: f64,
    pub volatility: f64,
    /// `expected_return / volatility`, 0 when volatility is 0.
    pub sharpe_ratio: f64,
    pub win_probability: f64,
}

impl RiskReturn {
    pub fn new(expected_return: f64, volatility: f64, win_probability: f64) -> Self {
        let sharpe_ratio = if volatility == 0.0 {
            0.0
        } else {
            expected_return / volatility
        };
        RiskReturn {
            expected_return,
            volatility,
            sharpe_ratio,
            win_probability,
        }
    }

    pub fn of(result: &WargameResult) -> Self {
        Self::new(
            result.expected_value,
            result.simulation.std_dev,
            result.win_probability,
        )
    }

    /// At least as much return for no more volatility.
    pub fn dominates(&self, other: &RiskReturn) -> bool {
        self.expected_return >= other.expected_return && self.volatility <= other.volatility
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioComparison {
    pub scenario_ids: Vec<String>,
    pub results: BTreeMap<String, WargameResult>,
    /// (id, expected value), best first.
    pub ranking: Vec<(String, f64)>,
    pub risk_return_analysis: BTreeMap<String, RiskReturn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dominant_strategy: Option<String>,
    pub recommendations: Vec<String>,
}

impl ScenarioComparison {
    /// Assemble a comparison from per-scenario results, in input order.
    pub fn from_results(results: Vec<WargameResult>) -> Result<ScenarioComparison> {
        let scenario_ids: Vec<String> = results.iter().map(|r| r.scenario.key().to_string()).collect();
        check_unique(&scenario_ids)?;

        let profiles: Vec<(String, RiskReturn)> = scenario_ids
            .iter()
            .cloned()
            .zip(results.iter().map(RiskReturn::of))
            .collect();

        let ranking = rank(&profiles);
        let dominant_strategy = find_dominant(&profiles);
        let recommendations = comparison_recommendations(&profiles);

        Ok(ScenarioComparison {
            results: scenario_ids.iter().cloned().zip(results).collect(),
            risk_return_analysis: profiles.into_iter().collect(),
            scenario_ids,
            ranking,
            dominant_strategy,
            recommendations,
        })
    }
}

/// Runs every scenario and compares them.
#[derive(Debug, Clone, Default)]
pub struct ScenarioComparator {
    runner: WargameRunner,
}

impl ScenarioComparator {
    pub fn new(config: WargameConfig) -> Self {
        ScenarioComparator {
            runner: WargameRunner::new(config),
        }
    }

    /// Scenarios run in parallel under one shared deadline. Any failure,
    /// including a timeout, fails the whole comparison.
    pub fn compare(&self, scenarios: &[Scenario]) -> Result<ScenarioComparison> {
        if scenarios.len() < 2 {
            return Err(WargameError::validation(format!(
                "comparison needs at least 2 scenarios, got {}",
                scenarios.len()
            )));
        }
        let ids: Vec<String> = scenarios.iter().map(|s| s.key().to_string()).collect();
        check_unique(&ids)?;

        self.runner.config.validate()?;
        let deadline = self.runner.config.deadline();
        info!(scenarios = scenarios.len(), "comparing scenarios");

        let results: Vec<WargameResult> = scenarios
            .par_iter()
            .map(|s| self.runner.run_until(s, deadline))
            .collect::<Result<_>>()?;

        ScenarioComparison::from_results(results)
    }
}

fn check_unique(ids: &[String]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for id in ids {
        if !seen.insert(id.as_str()) {
            return Err(WargameError::validation(format!(
                "duplicate scenario id '{}'",
                id
            )));
        }
    }
    Ok(())
}

/// (id, expected return) sorted descending; ties keep input order.
pub fn rank(profiles: &[(String, RiskReturn)]) -> Vec<(String, f64)> {
    let mut ranking: Vec<(String, f64)> = profiles
        .iter()
        .map(|(id, rr)| (id.clone(), rr.expected_return))
        .collect();
    ranking.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranking
}

/// First profile, in input order, that dominates every other one.
pub fn find_dominant(profiles: &[(String, RiskReturn)]) -> Option<String> {
    profiles
        .iter()
        .enumerate()
        .find(|(i, (_, a))| {
            profiles
                .iter()
                .enumerate()
                .all(|(j, (_, b))| *i == j || a.dominates(b))
        })
        .map(|(_, (id, _))| id.clone())
}

/// Winners on expected value, Sharpe ratio and win probability.
pub fn comparison_recommendations(profiles: &[(String, RiskReturn)]) -> Vec<String> {
    let best_by = |metric: fn(&RiskReturn) -> f64| {
        profiles.iter().fold(None, |best: Option<&(String, RiskReturn)>, p| match best {
            Some(b) if metric(&b.1) >= metric(&p.1) => Some(b),
            _ => Some(p),
        })
    };

    let mut out = Vec::new();
    if let Some((id, rr)) = best_by(|r| r.expected_return) {
        out.push(format!(
            "Highest expected value: {} ({:.2})",
            id, rr.expected_return
        ));
    }
    if let Some((id, rr)) = best_by(|r| r.sharpe_ratio) {
        out.push(format!(
            "Best risk-adjusted return: {} (Sharpe ratio {:.2})",
            id, rr.sharpe_ratio
        ));
    }
    if let Some((id, rr)) = best_by(|r| r.win_probability) {
        out.push(format!(
            "Highest win probability: {} ({:.1}%)",
            id,
            rr.win_probability * 100.0
        ));
    }
    out
}
