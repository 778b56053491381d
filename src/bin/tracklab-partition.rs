//! One-time data setup: split a raw image pool into train/validation sets.

use std::path::PathBuf;

use tracklab::partition::{PartitionOptions, partition_pool};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let options = parse_args(std::env::args().skip(1).collect())?;
    if !options.data_dir.is_dir() {
        return Err(format!(
            "Data path is not a directory: {}",
            options.data_dir.display()
        ));
    }
    let summary = partition_pool(
        &options.data_dir,
        &PartitionOptions {
            val_fraction: options.val_fraction,
            seed: options.seed,
        },
    )
    .map_err(|err| err.to_string())?;

    println!(
        "moved {} pairs to train, {} to val",
        summary.moved_train, summary.moved_val
    );
    println!(
        "manifests: {} train entries, {} val entries",
        summary.train_total, summary.val_total
    );
    Ok(())
}

#[derive(Debug, Clone)]
struct CliOptions {
    data_dir: PathBuf,
    val_fraction: f64,
    seed: String,
}

fn parse_args(args: Vec<String>) -> Result<CliOptions, String> {
    let mut data_dir: Option<PathBuf> = None;
    let mut val_fraction = 0.01f64;
    let mut seed = "tracklab-partition-v1".to_string();

    let mut idx = 0usize;
    while idx < args.len() {
        match args[idx].as_str() {
            "-h" | "--help" => return Err(help_text()),
            "--data-dir" => {
                idx += 1;
                let value = args
                    .get(idx)
                    .ok_or_else(|| "--data-dir requires a value".to_string())?;
                data_dir = Some(PathBuf::from(value));
            }
            "--val-fraction" => {
                idx += 1;
                let value = args
                    .get(idx)
                    .ok_or_else(|| "--val-fraction requires a value".to_string())?;
                val_fraction = value
                    .parse::<f64>()
                    .map_err(|_| format!("Invalid --val-fraction value: {value}"))?;
            }
            "--seed" => {
                idx += 1;
                let value = args
                    .get(idx)
                    .ok_or_else(|| "--seed requires a value".to_string())?;
                seed = value.clone();
            }
            unknown => return Err(format!("Unknown argument: {unknown}\n\n{}", help_text())),
        }
        idx += 1;
    }

    let data_dir = data_dir.ok_or_else(help_text)?;
    Ok(CliOptions {
        data_dir,
        val_fraction,
        seed,
    })
}

fn help_text() -> String {
    [
        "tracklab-partition",
        "",
        "Splits a raw image pool into train/validation sets and writes manifests.",
        "Every image must have a matching <stem>.json metadata sidecar.",
        "",
        "Usage:",
        "  tracklab-partition --data-dir <dir> [--val-fraction 0.01] [--seed <s>]",
        "",
        "Options:",
        "  --data-dir <dir>       Directory holding the raw .jpg pool (required).",
        "  --val-fraction <f64>   Per-item validation probability (default: 0.01).",
        "  --seed <string>        Seed for the deterministic draw.",
    ]
    .join("\n")
}
