use flipper_core::config::{ConfigInputDelivery, FlipperConfig};
use flipper_core::executor::CommandExecutor;
use flipper_core::fuzzer::{FuzzLoop, LogReporter, Verdict};
use flipper_core::mutator::MutationMode;

use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;

const DEFAULT_CONFIG_FILE: &str = "flipper.toml";

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Target executable to fuzz (overrides `target.command[0]`)
    target: Option<String>,
    /// Number of iterations (positive)
    #[clap(value_parser = clap::value_parser!(u64).range(1..))]
    iterations: Option<u64>,
    /// Same as the positional target
    #[clap(long = "target", value_name = "TARGET", conflicts_with = "target")]
    target_flag: Option<String>,
    /// Same as the positional iteration count
    #[clap(
        long = "iterations",
        value_name = "ITERATIONS",
        conflicts_with = "iterations",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    iterations_flag: Option<u64>,
    /// TOML configuration file, defaults to `flipper.toml` when present
    #[clap(short, long, value_parser)]
    config: Option<PathBuf>,
    /// Seed for the mutation generator, to replay a previous run
    #[clap(long)]
    seed: Option<u64>,
    /// Deliver the input through stdin instead of as the last argument
    #[clap(long)]
    stdin: bool,
    /// Mutate a fresh copy of the seed every iteration
    #[clap(long)]
    seed_relative: bool,
    /// Per-iteration deadline in milliseconds, 0 disables it
    #[clap(long)]
    timeout_ms: Option<u64>,
    /// Fixed arguments passed to the target before the fuzzed input
    #[clap(last = true)]
    target_args: Vec<String>,
}

fn init_logger() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_env(
            env_logger::Env::default()
                .filter("FLIPPER_LOG")
                .write_style("FLIPPER_LOG_STYLE"),
        )
        .init();
}

fn load_config(path: Option<PathBuf>) -> Result<FlipperConfig, anyhow::Error> {
    match path {
        Some(config_path) => {
            info!("Loading configuration from specified path: {config_path:?}");
            FlipperConfig::load_from_file(&config_path)
        }
        None => {
            let default_config_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default_config_path.exists() {
                info!("No config file specified, loading default: {default_config_path:?}");
                FlipperConfig::load_from_file(&default_config_path)
            } else {
                info!("No config file found, using built-in defaults.");
                Ok(FlipperConfig::default())
            }
        }
    }
}

fn apply_overrides(config: &mut FlipperConfig, cli: Cli) {
    if let Some(iterations) = cli.iterations.or(cli.iterations_flag) {
        config.fuzzer.iterations = iterations;
    }
    if let Some(seed) = cli.seed {
        config.fuzzer.rng_seed = Some(seed);
    }
    if cli.seed_relative {
        config.fuzzer.mutation_mode = MutationMode::SeedRelative;
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.target.timeout_ms = timeout_ms;
    }
    if cli.stdin {
        config.target.input_delivery = ConfigInputDelivery::Stdin;
    }

    let command = &mut config.target.command;
    if let Some(target) = cli.target.or(cli.target_flag) {
        if command.is_empty() {
            command.push(target);
        } else {
            command[0] = target;
        }
    }
    if !cli.target_args.is_empty() {
        command.truncate(1);
        command.extend(cli.target_args);
    }
}

fn main() -> Result<(), anyhow::Error> {
    init_logger();
    let mut cli = Cli::parse();

    let mut config = load_config(cli.config.take())?;
    apply_overrides(&mut config, cli);
    log::debug!("Effective configuration: {config:#?}");

    let seed = config.fuzzer.load_seed()?;
    let mut fuzz_loop = FuzzLoop::new(
        config.target.target_spec(),
        seed,
        config.fuzzer.fuzz_options(),
    )?;
    let mut executor = CommandExecutor::new(config.target.executor_config());
    let mut reporter = LogReporter;

    info!("Replay this run with --seed {}", fuzz_loop.rng_seed());
    let stats = fuzz_loop.run(&mut executor, &mut reporter);

    info!(
        "Total executions: {}, sanitizer findings: {}, signaled: {}, timed out: {}, non-zero exits: {}",
        stats.iterations,
        stats.count(Verdict::SanitizerDetected),
        stats.count(Verdict::Signaled),
        stats.count(Verdict::TimedOut),
        stats.count(Verdict::NonZeroExit),
    );
    let harness_errors = stats.count(Verdict::HarnessFailure) + stats.count(Verdict::ExecFailure);
    if harness_errors > 0 {
        warn!("{harness_errors} iterations could not run the target");
    }
    Ok(())
}
