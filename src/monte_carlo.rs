use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::distribution::{Distribution, Sampler};
use crate::error::{Result, WargameError};
use crate::formula::Formula;
use crate::stats;

/// Reported percentile keys and their levels.
pub const PERCENTILE_LEVELS: [(&str, f64); 8] = [
    ("p5", 5.0),
    ("p10", 10.0),
    ("p25", 25.0),
    ("p50", 50.0),
    ("p75", 75.0),
    ("p90", 90.0),
    ("p95", 95.0),
    ("p99", 99.0),
];

/// Reported confidence interval keys and their coverage in percent.
pub const CONFIDENCE_LEVELS: [(&str, f64); 3] = [("ci_90", 90.0), ("ci_95", 95.0), ("ci_99", 99.0)];

/// Fraction of invalid iterations above which a result is flagged degraded.
pub const DEFAULT_INVALID_THRESHOLD: f64 = 0.05;

/// Run parameters for one Monte Carlo run.
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub iterations: usize,
    /// Base seed. `None` draws one from the thread RNG.
    pub seed: Option<u64>,
    /// Pair each draw with its reflection for normal and uniform variables.
    pub antithetic: bool,
    /// Retain the valid outcomes on the result.
    pub keep_outcomes: bool,
    /// Spread chunks over the rayon pool. Results are identical either way.
    pub parallel: bool,
    /// Iterations per chunk. Each chunk owns its RNG streams, so changing
    /// this changes the draws for a given seed.
    pub chunk_size: usize,
    pub invalid_threshold: f64,
    /// Abandon the run (no partial result) once this instant has passed.
    pub deadline: Option<Instant>,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        SimulationOptions {
            iterations: 10_000,
            seed: None,
            antithetic: false,
            keep_outcomes: false,
            parallel: true,
            chunk_size: 2048,
            invalid_threshold: DEFAULT_INVALID_THRESHOLD,
            deadline: None,
        }
    }
}

impl SimulationOptions {
    pub fn validate(&self) -> Result<()> {
        if self.iterations == 0 {
            return Err(WargameError::validation("iterations must be >= 1"));
        }
        if self.chunk_size == 0 {
            return Err(WargameError::validation("chunk_size must be >= 1"));
        }
        if !(0.0..=1.0).contains(&self.invalid_threshold) {
            return Err(WargameError::validation(format!(
                "invalid_threshold must be in [0, 1], got {}",
                self.invalid_threshold
            )));
        }
        Ok(())
    }

    /// Copy of these options with the seed fixed, drawing one if unset.
    pub fn with_fixed_seed(&self) -> SimulationOptions {
        SimulationOptions {
            seed: Some(self.seed.unwrap_or_else(|| rand::thread_rng().gen())),
            ..self.clone()
        }
    }
}

/// Summary of the outcome distribution of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationResult {
    pub iterations: usize,
    pub valid_iterations: usize,
    pub invalid_iterations: usize,
    /// More than the allowed fraction of iterations faulted.
    pub degraded: bool,
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub percentiles: BTreeMap<String, f64>,
    pub prob_positive: f64,
    pub var_95: f64,
    pub cvar_95: f64,
    pub confidence_intervals: BTreeMap<String, (f64, f64)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcomes: Option<Vec<f64>>,
}

impl SimulationResult {
    /// Aggregate valid outcomes. `invalid` iterations were already dropped.
    pub fn from_outcomes(
        outcomes: Vec<f64>,
        invalid: usize,
        invalid_threshold: f64,
        keep_outcomes: bool,
    ) -> Result<SimulationResult> {
        let valid = outcomes.len();
        let total = valid + invalid;
        if valid == 0 {
            return Err(WargameError::NumericFailure { invalid, total });
        }

        let sorted = stats::sorted(&outcomes);
        let mean = stats::mean(&outcomes);
        let std_dev = stats::std_dev(&outcomes);

        let percentiles: BTreeMap<String, f64> = PERCENTILE_LEVELS
            .iter()
            .map(|(key, p)| (key.to_string(), stats::percentile(&sorted, *p)))
            .collect();

        let confidence_intervals: BTreeMap<String, (f64, f64)> = CONFIDENCE_LEVELS
            .iter()
            .map(|(key, level)| {
                let tail = (100.0 - level) / 2.0;
                (
                    key.to_string(),
                    (
                        stats::percentile(&sorted, tail),
                        stats::percentile(&sorted, 100.0 - tail),
                    ),
                )
            })
            .collect();

        let var_95 = stats::percentile(&sorted, 5.0);
        let tail: Vec<f64> = sorted.iter().copied().take_while(|&x| x <= var_95).collect();
        let cvar_95 = if tail.is_empty() {
            var_95
        } else {
            stats::mean(&tail)
        };

        let positive = outcomes.iter().filter(|&&x| x > 0.0).count();
        let degraded = invalid as f64 / total as f64 > invalid_threshold;

        Ok(SimulationResult {
            iterations: total,
            valid_iterations: valid,
            invalid_iterations: invalid,
            degraded,
            mean,
            median: stats::percentile(&sorted, 50.0),
            std_dev,
            min: sorted[0],
            max: sorted[valid - 1],
            percentiles,
            prob_positive: positive as f64 / valid as f64,
            var_95,
            cvar_95,
            confidence_intervals,
            outcomes: keep_outcomes.then_some(outcomes),
        })
    }

    /// Percentile by key (`"p5"` .. `"p99"`).
    pub fn percentile(&self, key: &str) -> Option<f64> {
        self.percentiles.get(key).copied()
    }

    pub fn variance(&self) -> f64 {
        self.std_dev * self.std_dev
    }

    pub fn valid_fraction(&self) -> f64 {
        if self.iterations == 0 {
            return 0.0;
        }
        self.valid_iterations as f64 / self.iterations as f64
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════

/// Per-chunk output, merged in chunk order.
struct ChunkOutcome {
    outcomes: Vec<f64>,
    invalid: usize,
}

/// Samples every variable, evaluates the formula per iteration and
/// aggregates the outcomes.
#[derive(Debug, Clone, Default)]
pub struct MonteCarloEngine {
    pub options: SimulationOptions,
}

impl MonteCarloEngine {
    pub fn new(options: SimulationOptions) -> Self {
        MonteCarloEngine { options }
    }

    /// Compile `formula` against the variable names, then run.
    pub fn simulate(
        &self,
        variables: &BTreeMap<String, Distribution>,
        formula: &str,
    ) -> Result<SimulationResult> {
        let names: Vec<&String> = variables.keys().collect();
        let compiled = Formula::compile(formula, &names)?;
        self.simulate_compiled(variables, &compiled)
    }

    /// Run with a formula compiled against `variables.keys()` in order.
    pub fn simulate_compiled(
        &self,
        variables: &BTreeMap<String, Distribution>,
        formula: &Formula,
    ) -> Result<SimulationResult> {
        let opts = &self.options;
        opts.validate()?;

        if !formula.variables().iter().eq(variables.keys()) {
            return Err(WargameError::validation(
                "formula was compiled against a different variable set",
            ));
        }

        let laws: Vec<(&Distribution, Sampler)> = variables
            .values()
            .map(|d| d.sampler().map(|s| (d, s)))
            .collect::<Result<_>>()?;

        let base_seed = opts.seed.unwrap_or_else(|| rand::thread_rng().gen());
        let n_chunks = opts.iterations.div_ceil(opts.chunk_size);
        let completed = AtomicUsize::new(0);

        info!(
            iterations = opts.iterations,
            variables = laws.len(),
            chunks = n_chunks,
            antithetic = opts.antithetic,
            parallel = opts.parallel,
            "starting monte carlo run"
        );

        let run_chunk = |chunk: usize| -> Result<ChunkOutcome> {
            if let Some(deadline) = opts.deadline {
                if Instant::now() >= deadline {
                    return Err(WargameError::IncompleteSimulation {
                        completed: completed.load(Ordering::SeqCst),
                        total: n_chunks,
                    });
                }
            }
            let start = chunk * opts.chunk_size;
            let len = opts.chunk_size.min(opts.iterations - start);
            let out = simulate_chunk(&laws, formula, base_seed, chunk, len, opts.antithetic);
            completed.fetch_add(1, Ordering::SeqCst);
            debug!(chunk, len, invalid = out.invalid, "chunk done");
            Ok(out)
        };

        let chunks: Vec<ChunkOutcome> = if opts.parallel {
            (0..n_chunks)
                .into_par_iter()
                .map(run_chunk)
                .collect::<Result<_>>()?
        } else {
            (0..n_chunks).map(run_chunk).collect::<Result<_>>()?
        };

        let invalid: usize = chunks.iter().map(|c| c.invalid).sum();
        let mut outcomes = Vec::with_capacity(opts.iterations - invalid);
        for c in chunks {
            outcomes.extend(c.outcomes);
        }

        let result = SimulationResult::from_outcomes(
            outcomes,
            invalid,
            opts.invalid_threshold,
            opts.keep_outcomes,
        )?;

        if result.degraded {
            warn!(
                invalid = result.invalid_iterations,
                iterations = result.iterations,
                threshold = opts.invalid_threshold,
                "simulation quality degraded: too many invalid iterations"
            );
        }
        info!(
            mean = result.mean,
            std_dev = result.std_dev,
            invalid = result.invalid_iterations,
            "monte carlo run complete"
        );
        Ok(result)
    }
}

/// Convenience wrapper with the common parameters.
pub fn simulate(
    variables: &BTreeMap<String, Distribution>,
    formula: &str,
    iterations: usize,
    seed: Option<u64>,
    antithetic: bool,
) -> Result<SimulationResult> {
    MonteCarloEngine::new(SimulationOptions {
        iterations,
        seed,
        antithetic,
        ..SimulationOptions::default()
    })
    .simulate(variables, formula)
}

fn simulate_chunk(
    laws: &[(&Distribution, Sampler)],
    formula: &Formula,
    base_seed: u64,
    chunk: usize,
    len: usize,
    antithetic: bool,
) -> ChunkOutcome {
    let columns: Vec<Vec<f64>> = laws
        .iter()
        .enumerate()
        .map(|(var, (dist, sampler))| {
            let mut rng = StdRng::seed_from_u64(stream_seed(base_seed, chunk, var));
            draw_column(dist, sampler, len, antithetic, &mut rng)
        })
        .collect();

    let mut outcomes = Vec::with_capacity(len);
    let mut invalid = 0;
    let mut slots = vec![0.0; laws.len()];
    for i in 0..len {
        for (slot, column) in slots.iter_mut().zip(&columns) {
            *slot = column[i];
        }
        match formula.evaluate(&slots) {
            Ok(v) => outcomes.push(v),
            Err(_) => invalid += 1,
        }
    }
    ChunkOutcome { outcomes, invalid }
}

/// Draw `len` values for one variable. With antithetic pairing, the first
/// ⌈len/2⌉ are drawn and the rest reflect them; laws without a reflection
/// draw the second half independently.
fn draw_column(
    dist: &Distribution,
    sampler: &Sampler,
    len: usize,
    antithetic: bool,
    rng: &mut StdRng,
) -> Vec<f64> {
    if !antithetic || !dist.has_reflection() {
        return sampler.sample_n(len, rng);
    }
    let half = len / 2;
    let mut column = sampler.sample_n(len - half, rng);
    for i in 0..half {
        let mirrored = dist.reflect(column[i]).unwrap_or(column[i]);
        column.push(mirrored);
    }
    column
}

/// Independent RNG stream per (chunk, variable).
fn stream_seed(base: u64, chunk: usize, var: usize) -> u64 {
    splitmix64(splitmix64(base ^ (chunk as u64).wrapping_mul(0xA24B_AED4_963E_E407)) ^ var as u64)
}

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
