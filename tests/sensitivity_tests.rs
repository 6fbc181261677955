use approx::assert_relative_eq;
use wargame_sim::monte_carlo::{MonteCarloEngine, SimulationOptions};
use wargame_sim::{Distribution, Scenario, SensitivityAnalyzer};

fn analyzer(iterations: usize, seed: u64) -> SensitivityAnalyzer {
    SensitivityAnalyzer::new(&MonteCarloEngine::new(SimulationOptions {
        iterations,
        seed: Some(seed),
        ..SimulationOptions::default()
    }))
}

fn normal(mean: f64, std: f64) -> Distribution {
    Distribution::normal(mean, std).unwrap()
}

#[test]
fn test_linear_formula_ranks_dominant_variable_first() {
    let scenario = Scenario::new("linear", "3 * x + y")
        .with_variable("x", normal(0.0, 10.0))
        .with_variable("y", normal(0.0, 10.0));
    let a = analyzer(5000, 42).analyze(&scenario).unwrap();

    assert_eq!(a.rank_order, vec!["x".to_string(), "y".to_string()]);
    let x = &a.variables["x"];
    let y = &a.variables["y"];
    assert!(
        (x.variance_contribution - 0.9).abs() < 0.05,
        "x contribution {}",
        x.variance_contribution
    );
    assert!(
        (y.variance_contribution - 0.1).abs() < 0.05,
        "y contribution {}",
        y.variance_contribution
    );
    assert_relative_eq!(x.impact_score, x.variance_contribution * 100.0);
    assert!((a.raw_total_variance_explained - 1.0).abs() < 0.05);
    assert!(a.total_variance_explained <= 1.0);
    assert_eq!(a.top_driver().map(|(n, _)| n), Some("x"));
}

#[test]
fn test_multiplicative_interaction_is_flagged_and_capped() {
    let scenario = Scenario::new("product", "x * y")
        .with_variable("x", normal(0.0, 1.0))
        .with_variable("y", normal(0.0, 1.0));
    let a = analyzer(5000, 7).analyze(&scenario).unwrap();

    // Pinning either factor at zero removes nearly all variance.
    assert!(a.variables["x"].variance_contribution > 0.99);
    assert!(a.variables["y"].variance_contribution > 0.99);
    assert!(a.nonlinearity_detected);
    assert!(a.raw_total_variance_explained > 1.9);
    assert_eq!(a.total_variance_explained, 1.0);
}

#[test]
fn test_unreferenced_variable_contributes_nothing() {
    let scenario = Scenario::new("unused", "revenue - costs")
        .with_variable("revenue", normal(1000.0, 100.0))
        .with_variable("costs", normal(600.0, 80.0))
        .with_variable("weather", normal(20.0, 5.0));
    let a = analyzer(3000, 42).analyze(&scenario).unwrap();

    assert_eq!(a.variables["weather"].variance_contribution, 0.0);
    assert_eq!(a.rank_order.last().map(String::as_str), Some("weather"));
    assert_eq!(a.rank_order[0], "revenue");
}

#[test]
fn test_analyze_against_matches_full_analysis() {
    let scenario = Scenario::new("linear", "2 * a - b")
        .with_variable("a", Distribution::uniform(0.0, 10.0).unwrap())
        .with_variable("b", Distribution::triangular(0.0, 5.0, 20.0).unwrap());
    let analyzer = analyzer(4000, 11);
    let full = analyzer.analyze(&scenario).unwrap();

    let baseline = analyzer
        .engine()
        .simulate(&scenario.variables, &scenario.formula)
        .unwrap();
    let against = analyzer.analyze_against(&scenario, &baseline).unwrap();
    assert_eq!(full, against);
}

#[test]
fn test_unseeded_analysis_shares_one_seed() {
    let analyzer = SensitivityAnalyzer::new(&MonteCarloEngine::new(SimulationOptions {
        iterations: 2000,
        seed: None,
        ..SimulationOptions::default()
    }));
    assert!(analyzer.engine().options.seed.is_some());

    let scenario = Scenario::new("unused", "x")
        .with_variable("x", normal(0.0, 1.0))
        .with_variable("z", normal(0.0, 1.0));
    let a = analyzer.analyze(&scenario).unwrap();
    assert_eq!(a.variables["z"].variance_contribution, 0.0);
}

#[test]
fn test_invalid_scenario_is_rejected() {
    let scenario = Scenario::new("bad", "x + missing").with_variable("x", normal(0.0, 1.0));
    assert!(analyzer(100, 1).analyze(&scenario).is_err());
}
