use std::collections::BTreeSet;
use std::path::Path;

use serde::Serialize;

use crate::comparison::ScenarioComparison;
use crate::error::Result;
use crate::monte_carlo::SimulationResult;
use crate::sensitivity::SensitivityAnalysis;
use crate::wargame::WargameResult;

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Pretty-printed JSON.
pub fn save_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    ensure_parent(path)?;
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Summary statistics and percentiles as `metric,value` rows (CDF plots).
pub fn save_percentiles_csv(sim: &SimulationResult, path: &Path) -> Result<()> {
    ensure_parent(path)?;
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record(["metric", "value"])?;

    let mut rows: Vec<(String, f64)> = vec![
        ("mean".into(), sim.mean),
        ("median".into(), sim.median),
        ("std_dev".into(), sim.std_dev),
        ("min".into(), sim.min),
        ("max".into(), sim.max),
        ("prob_positive".into(), sim.prob_positive),
        ("var_95".into(), sim.var_95),
        ("cvar_95".into(), sim.cvar_95),
    ];
    let mut pcts: Vec<(&String, &f64)> = sim.percentiles.iter().collect();
    pcts.sort_by_key(|(k, _)| k[1..].parse::<u32>().unwrap_or(u32::MAX));
    rows.extend(pcts.into_iter().map(|(k, v)| (k.clone(), *v)));
    for (key, (lo, hi)) in &sim.confidence_intervals {
        rows.push((format!("{}_lower", key), *lo));
        rows.push((format!("{}_upper", key), *hi));
    }

    for (metric, value) in rows {
        wtr.write_record(&[metric, format!("{:.6}", value)])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Raw outcomes, one per row (histograms).
pub fn save_outcomes_csv(outcomes: &[f64], path: &Path) -> Result<()> {
    ensure_parent(path)?;
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record(["iteration", "outcome"])?;
    for (i, v) in outcomes.iter().enumerate() {
        wtr.write_record(&[i.to_string(), format!("{:.6}", v)])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Tornado-diagram rows in `rank_order`.
pub fn save_sensitivity_csv(analysis: &SensitivityAnalysis, path: &Path) -> Result<()> {
    ensure_parent(path)?;
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record([
        "rank",
        "variable",
        "impact_score",
        "variance_contribution",
        "variance_reduction",
    ])?;
    for (rank, name) in analysis.rank_order.iter().enumerate() {
        if let Some(s) = analysis.variables.get(name) {
            wtr.write_record(&[
                (rank + 1).to_string(),
                name.clone(),
                format!("{:.4}", s.impact_score),
                format!("{:.6}", s.variance_contribution),
                format!("{:.6}", s.variance_reduction),
            ])?;
        }
    }
    wtr.flush()?;
    Ok(())
}

/// Ranking joined with the risk/return profile of each scenario.
pub fn save_ranking_csv(comparison: &ScenarioComparison, path: &Path) -> Result<()> {
    ensure_parent(path)?;
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record([
        "rank",
        "scenario",
        "expected_return",
        "volatility",
        "sharpe_ratio",
        "win_probability",
        "dominant",
    ])?;
    for (rank, (id, _)) in comparison.ranking.iter().enumerate() {
        if let Some(rr) = comparison.risk_return_analysis.get(id) {
            let dominant = comparison.dominant_strategy.as_deref() == Some(id.as_str());
            wtr.write_record(&[
                (rank + 1).to_string(),
                id.clone(),
                format!("{:.6}", rr.expected_return),
                format!("{:.6}", rr.volatility),
                format!("{:.6}", rr.sharpe_ratio),
                format!("{:.6}", rr.win_probability),
                dominant.to_string(),
            ])?;
        }
    }
    wtr.flush()?;
    Ok(())
}

/// Write every table for one wargame result into `output_dir`.
pub fn save_all(result: &WargameResult, output_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(output_dir)?;

    save_json(result, &output_dir.join("result.json"))?;
    save_percentiles_csv(&result.simulation, &output_dir.join("percentiles.csv"))?;
    if let Some(outcomes) = &result.simulation.outcomes {
        save_outcomes_csv(outcomes, &output_dir.join("outcomes.csv"))?;
    }
    if let Some(analysis) = &result.sensitivity {
        save_sensitivity_csv(analysis, &output_dir.join("sensitivity.csv"))?;
    }
    if let Some(tree) = &result.decision_tree {
        save_json(tree, &output_dir.join("decision_tree.json"))?;
    }
    Ok(())
}

/// Write the comparison JSON, the ranking table and each scenario's tables.
pub fn save_comparison(comparison: &ScenarioComparison, output_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(output_dir)?;

    save_json(comparison, &output_dir.join("comparison.json"))?;
    save_ranking_csv(comparison, &output_dir.join("ranking.csv"))?;
    let dirs = scenario_dir_names(&comparison.scenario_ids);
    for (id, dir) in comparison.scenario_ids.iter().zip(dirs) {
        if let Some(result) = comparison.results.get(id) {
            save_all(result, &output_dir.join(dir))?;
        }
    }
    Ok(())
}

/// One directory name per scenario id, in order. Ids that sanitize to the
/// same name get a numeric suffix (`a_b`, `a_b_2`).
pub fn scenario_dir_names(ids: &[String]) -> Vec<String> {
    let mut taken = BTreeSet::new();
    ids.iter()
        .map(|id| {
            let base = sanitize(id);
            let mut name = base.clone();
            let mut n = 2;
            while !taken.insert(name.clone()) {
                name = format!("{}_{}", base, n);
                n += 1;
            }
            name
        })
        .collect()
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colliding_ids_get_distinct_dirs() {
        let ids = vec!["a b".to_string(), "a_b".to_string(), "a/b".to_string()];
        assert_eq!(scenario_dir_names(&ids), vec!["a_b", "a_b_2", "a_b_3"]);
    }
}
