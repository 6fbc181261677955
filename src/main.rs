use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use wargame_sim::output;
use wargame_sim::{Result, Scenario, ScenarioComparator, WargameConfig, WargameRunner};

#[derive(Parser)]
#[command(
    name = "wargame-sim",
    about = "Monte Carlo wargaming over competitive business scenarios"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate a single scenario
    Simulate {
        /// Scenario JSON file
        #[arg(long)]
        scenario: PathBuf,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Compare two or more scenarios
    Compare {
        /// Scenario JSON files (repeat the flag)
        #[arg(long = "scenario", required = true, num_args = 1..)]
        scenarios: Vec<PathBuf>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Check a scenario file and its formula without simulating
    Validate {
        /// Scenario JSON file
        #[arg(long)]
        scenario: PathBuf,
    },
}

/// Run parameters; flags override the TOML config file.
#[derive(Args)]
struct RunArgs {
    /// TOML run config
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of Monte Carlo iterations
    #[arg(long)]
    iterations: Option<usize>,

    /// Random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Use antithetic variates
    #[arg(long)]
    antithetic: bool,

    /// Run one-at-a-time sensitivity analysis
    #[arg(long)]
    sensitivity: bool,

    /// Build the decision tree over our actions
    #[arg(long)]
    tree: bool,

    /// Keep raw outcomes (written to outcomes.csv)
    #[arg(long)]
    keep_outcomes: bool,

    /// Disable the parallel worker pool
    #[arg(long)]
    sequential: bool,

    /// Abort if the run takes longer than this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Write JSON and CSV tables here instead of printing JSON to stdout
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

impl RunArgs {
    fn resolve(&self) -> Result<WargameConfig> {
        let mut config = match &self.config {
            Some(path) => WargameConfig::load(path)?,
            None => WargameConfig::default(),
        };
        if let Some(n) = self.iterations {
            config.iterations = n;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        if self.timeout_ms.is_some() {
            config.timeout_ms = self.timeout_ms;
        }
        config.antithetic |= self.antithetic;
        config.include_sensitivity |= self.sensitivity;
        config.include_decision_tree |= self.tree;
        config.keep_outcomes |= self.keep_outcomes;
        if self.sequential {
            config.parallel = false;
        }
        config.validate()?;
        Ok(config)
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Simulate { scenario, run } => {
            let config = run.resolve()?;
            let scenario = Scenario::load(&scenario)?;
            let result = WargameRunner::new(config).run(&scenario)?;

            match &run.output_dir {
                Some(dir) => {
                    output::save_all(&result, dir)?;
                    info!(dir = %dir.display(), "saved wargame result");
                }
                None => println!("{}", serde_json::to_string_pretty(&result)?),
            }
        }

        Commands::Compare { scenarios, run } => {
            let config = run.resolve()?;
            let scenarios = scenarios
                .iter()
                .map(|p| Scenario::load(p))
                .collect::<Result<Vec<_>>>()?;
            let comparison = ScenarioComparator::new(config).compare(&scenarios)?;

            match &run.output_dir {
                Some(dir) => {
                    output::save_comparison(&comparison, dir)?;
                    info!(dir = %dir.display(), "saved comparison");
                }
                None => println!("{}", serde_json::to_string_pretty(&comparison)?),
            }
        }

        Commands::Validate { scenario } => {
            let scenario = Scenario::load(&scenario)?;
            let formula = scenario.compile_formula()?;
            let referenced = formula.referenced_variables();
            let unused: Vec<&String> = scenario
                .variables
                .keys()
                .filter(|k| !referenced.contains(k.as_str()))
                .collect();
            println!(
                "OK: '{}' ({} variables, {} strategic options, {} competitor actions)",
                scenario.name,
                scenario.variables.len(),
                scenario.our_actions.len(),
                scenario.competitor_actions.len()
            );
            if !unused.is_empty() {
                println!("  unused variables: {:?}", unused);
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
