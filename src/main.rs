use anyhow::Context;
use gmine::config::Config;
use gmine::error::Error;
use gmine::miner::Miner;
use gmine::oracle::Oracle;
use gmine::tracer::Tracer;
use gmine::tree::{Annotator, Seed, Trace};
use itertools::Itertools;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

/// mine an input grammar from a parser binary under gdb
#[derive(argh::FromArgs)]
struct Arguments {
    /// path to the configuration file
    #[argh(option, short = 'c')]
    config: PathBuf,
}

/// Whole-trace retries on backend trouble; one extra attempt for an
/// inconsistent tree.
const TRACE_ATTEMPTS: usize = 3;

fn main() -> ExitCode {
    let Arguments { config } = argh::from_env();

    let config = match Config::load(&config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(1);
        }
    };

    let filter = config.tracing_filter().expect("validated at load");
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(format!(
            "gmine={}",
            filter
        )))
        .init();

    match run(&config) {
        Ok(traced) if traced > 0 => ExitCode::SUCCESS,
        Ok(_) => {
            error!("no seed could be traced");
            ExitCode::from(2)
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(1)
        }
    }
}

fn run(config: &Config) -> anyhow::Result<usize> {
    let oracle = Oracle::new(config)?;
    std::fs::create_dir_all(&config.output_directory)?;

    info!(
        instance = ?config.instance,
        delay_wp = config.delay_wp,
        original_mimid = config.original_mimid,
        "run configured"
    );
    if let Some(size) = config.precision_set_size {
        info!(size, "precision_set_size recorded for the evaluator");
    }

    let mut seed_paths: Vec<PathBuf> = std::fs::read_dir(&config.seed_directory)
        .with_context(|| format!("reading {}", config.seed_directory.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    seed_paths.sort();
    if let Some(cap) = config.number_of_seeds {
        seed_paths.truncate(cap);
    }
    if seed_paths.is_empty() {
        anyhow::bail!("no seeds in {}", config.seed_directory.display());
    }

    let tracer = Tracer::new(config, &oracle);
    let annotator = Annotator::new(Some(oracle.ignore_regex()));

    let mut miner = Miner::new(oracle.start_symbol());
    let mut traced = 0usize;
    let mut failed: Vec<(String, String)> = Vec::new();

    for path in &seed_paths {
        let seed = Seed::from_file(path)?;
        match trace_with_retries(&tracer, &annotator, &seed, path) {
            Ok(trace) => {
                let trace_file = config
                    .output_directory
                    .join(format!("{}.trace", seed.name));
                trace.write_to(&trace_file)?;
                info!(seed = %seed.name, file = %trace_file.display(), "trace written");
                miner.ingest(&trace, &seed.bytes);
                traced += 1;
            }
            // a scheduler invariant violation poisons the whole run
            Err(e @ Error::WatchpointBudgetExceeded { .. }) => return Err(e.into()),
            Err(e) => {
                warn!(seed = %seed.name, error = %e, "seed failed, continuing");
                failed.push((seed.name.clone(), e.to_string()));
            }
        }
    }

    if traced > 0 {
        let grammar = miner.finish()?;
        let grammar_file = config.output_directory.join("parsing_g.json");
        grammar.write_atomic(&grammar_file)?;
        info!(
            file = %grammar_file.display(),
            nonterminals = grammar.len(),
            "grammar written"
        );
    }

    if !failed.is_empty() {
        warn!(
            "{} of {} seeds failed: {}",
            failed.len(),
            seed_paths.len(),
            failed
                .iter()
                .map(|(name, why)| format!("{} ({})", name, why))
                .join(", ")
        );
    }

    Ok(traced)
}

fn trace_with_retries(
    tracer: &Tracer,
    annotator: &Annotator,
    seed: &Seed,
    path: &std::path::Path,
) -> Result<Trace, Error> {
    let mut inconsistent_retried = false;
    let mut attempts = 0;

    loop {
        attempts += 1;
        let result = tracer
            .trace_seed(seed, path)
            .and_then(|raw| annotator.annotate(raw));

        match result {
            Ok(trace) => return Ok(trace),
            Err(e @ (Error::BackendUnresponsive(_) | Error::DebuggerProtocolError(_)))
                if attempts < TRACE_ATTEMPTS =>
            {
                warn!(seed = %seed.name, attempt = attempts, error = %e, "retrying trace");
            }
            Err(e @ Error::InconsistentTree(_, _)) if !inconsistent_retried => {
                inconsistent_retried = true;
                warn!(seed = %seed.name, error = %e, "inconsistent tree, one fresh retry");
            }
            Err(e) => return Err(e),
        }
    }
}
