use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use approx::assert_relative_eq;
use proptest::prelude::*;
use wargame_sim::distribution::Distribution;
use wargame_sim::monte_carlo::{simulate, MonteCarloEngine, SimulationOptions, PERCENTILE_LEVELS};
use wargame_sim::{SimulationResult, WargameError};

const SEED: u64 = 42;

fn vars(entries: &[(&str, Distribution)]) -> BTreeMap<String, Distribution> {
    entries
        .iter()
        .map(|(n, d)| (n.to_string(), d.clone()))
        .collect()
}

fn profit_vars() -> BTreeMap<String, Distribution> {
    vars(&[
        ("revenue", Distribution::normal(1000.0, 100.0).unwrap()),
        ("costs", Distribution::normal(600.0, 80.0).unwrap()),
    ])
}

fn engine(iterations: usize, seed: u64) -> MonteCarloEngine {
    MonteCarloEngine::new(SimulationOptions {
        iterations,
        seed: Some(seed),
        ..SimulationOptions::default()
    })
}

fn assert_percentiles_monotone(r: &SimulationResult) {
    let values: Vec<f64> = PERCENTILE_LEVELS
        .iter()
        .map(|(k, _)| r.percentile(k).unwrap())
        .collect();
    for w in values.windows(2) {
        assert!(w[0] <= w[1], "percentiles not monotone: {:?}", values);
    }
}

#[test]
fn test_revenue_minus_costs_end_to_end() {
    let r = simulate(&profit_vars(), "revenue - costs", 5000, Some(SEED), false).unwrap();
    let expected_std = (100.0f64.powi(2) + 80.0f64.powi(2)).sqrt();

    assert_eq!(r.iterations, 5000);
    assert_eq!(r.valid_iterations, 5000);
    assert!(!r.degraded);
    assert!((350.0..=450.0).contains(&r.mean), "mean {}", r.mean);
    assert!(
        (expected_std - 20.0..=expected_std + 20.0).contains(&r.std_dev),
        "std {}",
        r.std_dev
    );
    assert!(r.prob_positive > 0.99);
    assert!(r.min <= r.percentile("p5").unwrap());
    assert!(r.max >= r.percentile("p99").unwrap());
    assert_relative_eq!(r.median, r.percentile("p50").unwrap());
    assert!(r.outcomes.is_none());
}

#[test]
fn test_result_shape() {
    let r = simulate(&profit_vars(), "revenue - costs", 1000, Some(SEED), false).unwrap();
    let keys: Vec<&str> = r.percentiles.keys().map(String::as_str).collect();
    let mut expected = vec!["p5", "p10", "p25", "p50", "p75", "p90", "p95", "p99"];
    expected.sort();
    assert_eq!(keys, expected);

    let ci_keys: Vec<&str> = r.confidence_intervals.keys().map(String::as_str).collect();
    assert_eq!(ci_keys, vec!["ci_90", "ci_95", "ci_99"]);
    let (lo90, hi90) = r.confidence_intervals["ci_90"];
    let (lo99, hi99) = r.confidence_intervals["ci_99"];
    assert!(lo99 <= lo90 && hi90 <= hi99);
    assert_relative_eq!(lo90, r.percentile("p5").unwrap());
    assert_relative_eq!(hi90, r.percentile("p95").unwrap());
}

#[test]
fn test_var_and_cvar() {
    let r = simulate(&profit_vars(), "revenue - costs", 5000, Some(SEED), false).unwrap();
    assert_relative_eq!(r.var_95, r.percentile("p5").unwrap());
    assert!(r.cvar_95 <= r.var_95);
    assert!(r.cvar_95 >= r.min);
}

#[test]
fn test_constant_outcome_cvar_equals_var() {
    let v = vars(&[("x", Distribution::uniform(0.0, 1.0).unwrap())]);
    let r = simulate(&v, "len(x) * 7", 100, Some(SEED), false).unwrap();
    assert_eq!(r.std_dev, 0.0);
    assert_eq!(r.var_95, 7.0);
    assert_eq!(r.cvar_95, 7.0);
    assert_eq!(r.prob_positive, 1.0);
}

#[test]
fn test_seeded_runs_are_identical() {
    let e = engine(3000, SEED);
    let a = e.simulate(&profit_vars(), "revenue - costs").unwrap();
    let b = e.simulate(&profit_vars(), "revenue - costs").unwrap();
    assert_eq!(a.mean, b.mean);
    assert_eq!(a.percentiles, b.percentiles);

    let c = engine(3000, SEED + 1)
        .simulate(&profit_vars(), "revenue - costs")
        .unwrap();
    assert_ne!(a.mean, c.mean);
}

#[test]
fn test_parallel_matches_sequential() {
    let opts = SimulationOptions {
        iterations: 10_000,
        seed: Some(SEED),
        chunk_size: 512,
        keep_outcomes: true,
        ..SimulationOptions::default()
    };
    let parallel = MonteCarloEngine::new(SimulationOptions {
        parallel: true,
        ..opts.clone()
    })
    .simulate(&profit_vars(), "revenue - costs")
    .unwrap();
    let sequential = MonteCarloEngine::new(SimulationOptions {
        parallel: false,
        ..opts
    })
    .simulate(&profit_vars(), "revenue - costs")
    .unwrap();
    assert_eq!(parallel, sequential);
    assert_eq!(parallel.outcomes.as_ref().map(Vec::len), Some(10_000));
}

#[test]
fn test_antithetic_linear_formula_hits_exact_mean() {
    let r = MonteCarloEngine::new(SimulationOptions {
        iterations: 4096,
        seed: Some(SEED),
        antithetic: true,
        chunk_size: 1024,
        ..SimulationOptions::default()
    })
    .simulate(&profit_vars(), "revenue - costs")
    .unwrap();
    // Every draw is paired with its mirror, so the linear outcome averages
    // to the exact mean.
    assert_relative_eq!(r.mean, 400.0, epsilon = 1e-6);
    assert!((r.std_dev - 128.06).abs() < 15.0);
}

#[test]
fn test_antithetic_reduces_estimator_spread() {
    let v = vars(&[("u", Distribution::uniform(0.0, 10.0).unwrap())]);
    let spread = |antithetic: bool| {
        let means: Vec<f64> = (0..30)
            .map(|s| {
                simulate(&v, "u ** 2", 200, Some(1000 + s), antithetic)
                    .unwrap()
                    .mean
            })
            .collect();
        wargame_sim::stats::std_dev(&means)
    };
    assert!(spread(true) < spread(false));
}

#[test]
fn test_antithetic_odd_iterations_and_unreflectable_laws() {
    let v = vars(&[
        ("a", Distribution::normal(0.0, 1.0).unwrap()),
        ("b", Distribution::triangular(0.0, 1.0, 2.0).unwrap()),
        ("c", Distribution::lognormal(0.0, 0.25).unwrap()),
    ]);
    let r = simulate(&v, "a + b + c", 1001, Some(SEED), true).unwrap();
    assert_eq!(r.iterations, 1001);
    assert_eq!(r.valid_iterations, 1001);
}

// ═══════════════════════════════════════════════════════════════════════
// Invalid iterations, errors and deadlines
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn test_invalid_iterations_are_excluded_and_flagged() {
    let v = vars(&[("x", Distribution::normal(0.0, 1.0).unwrap())]);
    // Division by zero whenever x <= 0, roughly half the iterations.
    let r = simulate(&v, "1 / max(x, 0)", 4000, Some(SEED), false).unwrap();
    assert!(r.degraded);
    assert!(r.invalid_iterations > 1600 && r.invalid_iterations < 2400);
    assert_eq!(r.valid_iterations + r.invalid_iterations, 4000);
    assert!(r.min > 0.0);
    assert_eq!(r.prob_positive, 1.0);
}

#[test]
fn test_few_invalid_iterations_not_degraded() {
    let v = vars(&[("x", Distribution::normal(3.0, 1.0).unwrap())]);
    // x <= 0 is a 3-sigma event.
    let r = simulate(&v, "1 / max(x, 0)", 4000, Some(SEED), false).unwrap();
    assert!(r.invalid_iterations < 200);
    assert!(!r.degraded);
}

#[test]
fn test_all_invalid_is_numeric_failure() {
    let v = vars(&[("x", Distribution::normal(0.0, 1.0).unwrap())]);
    let err = simulate(&v, "x / (x - x)", 100, Some(SEED), false).unwrap_err();
    assert!(matches!(
        err,
        WargameError::NumericFailure {
            invalid: 100,
            total: 100
        }
    ));
}

#[test]
fn test_formula_errors_surface_before_sampling() {
    let err = simulate(&profit_vars(), "revenue - tax", 100, Some(SEED), false).unwrap_err();
    assert!(matches!(err, WargameError::Evaluation { .. }));
}

#[test]
fn test_zero_iterations_rejected() {
    let err = simulate(&profit_vars(), "revenue", 0, Some(SEED), false).unwrap_err();
    assert!(matches!(err, WargameError::Validation(_)));
}

#[test]
fn test_expired_deadline_returns_no_result() {
    let e = MonteCarloEngine::new(SimulationOptions {
        iterations: 10_000,
        seed: Some(SEED),
        deadline: Some(Instant::now()),
        ..SimulationOptions::default()
    });
    let err = e.simulate(&profit_vars(), "revenue - costs").unwrap_err();
    assert!(matches!(err, WargameError::IncompleteSimulation { .. }));
}

#[test]
fn test_generous_deadline_completes() {
    let e = MonteCarloEngine::new(SimulationOptions {
        iterations: 1000,
        seed: Some(SEED),
        deadline: Some(Instant::now() + Duration::from_secs(60)),
        ..SimulationOptions::default()
    });
    assert!(e.simulate(&profit_vars(), "revenue - costs").is_ok());
}

#[test]
fn test_from_outcomes_known_values() {
    let outcomes: Vec<f64> = (1..=100).map(|i| i as f64 - 50.0).collect();
    let r = SimulationResult::from_outcomes(outcomes, 0, 0.05, false).unwrap();
    assert_relative_eq!(r.mean, 0.5);
    assert_relative_eq!(r.median, 0.5);
    assert_relative_eq!(r.var_95, -44.05, epsilon = 1e-9);
    // -49 ..= -45 lie at or below -44.05
    assert_relative_eq!(r.cvar_95, -47.0);
    assert_relative_eq!(r.prob_positive, 0.5);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_percentiles_monotone_and_cvar_below_var(
        mean in -500.0f64..500.0,
        std in 0.1f64..200.0,
        lo in -100.0f64..0.0,
        width in 0.5f64..100.0,
        seed in any::<u64>(),
    ) {
        let v = vars(&[
            ("a", Distribution::normal(mean, std).unwrap()),
            ("b", Distribution::uniform(lo, lo + width).unwrap()),
        ]);
        let r = simulate(&v, "a * b - abs(a)", 500, Some(seed), false).unwrap();
        assert_percentiles_monotone(&r);
        prop_assert!(r.cvar_95 <= r.var_95);
        prop_assert!(r.min <= r.median && r.median <= r.max);
        prop_assert!((0.0..=1.0).contains(&r.prob_positive));
    }
}
