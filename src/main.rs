//! Entry point for the active-learning round loop.

use std::path::PathBuf;

use tracklab::config::PipelineConfig;
use tracklab::logging;
use tracklab::round::RoundController;
use tracklab::selector::{CancelToken, HttpSelector, PollPolicy, SystemClock};
use tracklab::trainer::CommandTrainer;

const SELECTOR_URL_ENV: &str = "TRACKLAB_SELECTOR_URL";
const SELECTOR_TOKEN_ENV: &str = "TRACKLAB_SELECTOR_TOKEN";
const SELECTOR_DATASET_ENV: &str = "TRACKLAB_SELECTOR_DATASET";

fn main() {
    if let Err(err) = logging::init() {
        eprintln!("Logging disabled: {err}");
    }
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let options = parse_args(std::env::args().skip(1).collect())?;
    let mut config = match options.config_path {
        Some(path) => PipelineConfig::from_toml_path(&path).map_err(|err| err.to_string())?,
        None => PipelineConfig::default(),
    };
    if let Some(data_dir) = options.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(max_rounds) = options.max_rounds {
        config.max_rounds = Some(max_rounds);
    }
    config.validate().map_err(|err| err.to_string())?;

    let trainer_command = config
        .trainer_command
        .clone()
        .ok_or_else(|| "No trainer_command configured".to_string())?;
    let mut trainer = CommandTrainer::new(trainer_command, config.model_dir());

    let selector = HttpSelector::new(
        &require_env(SELECTOR_URL_ENV)?,
        require_env(SELECTOR_TOKEN_ENV)?,
        require_env(SELECTOR_DATASET_ENV)?,
    )
    .map_err(|err| err.to_string())?;

    let clock = SystemClock;
    let poll_policy = PollPolicy {
        interval: config.poll_interval(),
        timeout: None,
    };
    let mut controller = RoundController::new(
        &config,
        &selector,
        &mut trainer,
        &clock,
        poll_policy,
        CancelToken::new(),
    )
    .map_err(|err| err.to_string())?;

    let stop = controller.run().map_err(|err| err.to_string())?;
    println!(
        "stopped after round {}: {:?}",
        controller.round_index(),
        stop
    );
    Ok(())
}

#[derive(Debug, Default)]
struct CliOptions {
    config_path: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    max_rounds: Option<u32>,
}

fn parse_args(args: Vec<String>) -> Result<CliOptions, String> {
    let mut options = CliOptions::default();
    let mut idx = 0usize;
    while idx < args.len() {
        match args[idx].as_str() {
            "-h" | "--help" => return Err(help_text()),
            "--config" => {
                idx += 1;
                let value = args
                    .get(idx)
                    .ok_or_else(|| "--config requires a value".to_string())?;
                options.config_path = Some(PathBuf::from(value));
            }
            "--data-dir" => {
                idx += 1;
                let value = args
                    .get(idx)
                    .ok_or_else(|| "--data-dir requires a value".to_string())?;
                options.data_dir = Some(PathBuf::from(value));
            }
            "--max-rounds" => {
                idx += 1;
                let value = args
                    .get(idx)
                    .ok_or_else(|| "--max-rounds requires a value".to_string())?;
                options.max_rounds = Some(
                    value
                        .parse::<u32>()
                        .map_err(|_| format!("Invalid --max-rounds value: {value}"))?,
                );
            }
            unknown => return Err(format!("Unknown argument: {unknown}\n\n{}", help_text())),
        }
        idx += 1;
    }
    Ok(options)
}

fn require_env(name: &str) -> Result<String, String> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(format!("Missing required environment variable {name}")),
    }
}

fn help_text() -> String {
    [
        "tracklab",
        "",
        "Runs the active-learning labeling loop: select, label, train, predict.",
        "",
        "Usage:",
        "  tracklab [--config pipeline.toml] [--data-dir <dir>] [--max-rounds <n>]",
        "",
        "Options:",
        "  --config <file>     Pipeline configuration TOML.",
        "  --data-dir <dir>    Override the configured data directory.",
        "  --max-rounds <n>    Stop after n rounds.",
        "",
        "Environment:",
        "  TRACKLAB_SELECTOR_URL      Base URL of the selection service.",
        "  TRACKLAB_SELECTOR_TOKEN    API token for the selection service.",
        "  TRACKLAB_SELECTOR_DATASET  Dataset identifier at the selection service.",
    ]
    .join("\n")
}
