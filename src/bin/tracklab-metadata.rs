//! Generates the selector metadata schema and per-sample sidecar files.

use std::path::PathBuf;

use tracklab::metadata::{read_entries, write_schema, write_sidecars};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let options = parse_args(std::env::args().skip(1).collect())?;
    std::fs::create_dir_all(&options.out_dir)
        .map_err(|err| format!("Failed to create {}: {err}", options.out_dir.display()))?;

    let schema_path = write_schema(&options.out_dir).map_err(|err| err.to_string())?;
    println!("wrote schema to {}", schema_path.display());

    if let Some(entries_path) = options.entries_path {
        let entries = read_entries(&entries_path).map_err(|err| err.to_string())?;
        let written = write_sidecars(&options.out_dir, &entries).map_err(|err| err.to_string())?;
        println!("wrote {written} metadata sidecars to {}", options.out_dir.display());
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct CliOptions {
    out_dir: PathBuf,
    entries_path: Option<PathBuf>,
}

fn parse_args(args: Vec<String>) -> Result<CliOptions, String> {
    let mut out_dir: Option<PathBuf> = None;
    let mut entries_path: Option<PathBuf> = None;

    let mut idx = 0usize;
    while idx < args.len() {
        match args[idx].as_str() {
            "-h" | "--help" => return Err(help_text()),
            "--out" => {
                idx += 1;
                let value = args
                    .get(idx)
                    .ok_or_else(|| "--out requires a value".to_string())?;
                out_dir = Some(PathBuf::from(value));
            }
            "--entries" => {
                idx += 1;
                let value = args
                    .get(idx)
                    .ok_or_else(|| "--entries requires a value".to_string())?;
                entries_path = Some(PathBuf::from(value));
            }
            unknown => return Err(format!("Unknown argument: {unknown}\n\n{}", help_text())),
        }
        idx += 1;
    }

    let out_dir = out_dir.ok_or_else(help_text)?;
    Ok(CliOptions {
        out_dir,
        entries_path,
    })
}

fn help_text() -> String {
    [
        "tracklab-metadata",
        "",
        "Writes the selector metadata schema, and optionally one sidecar JSON",
        "per sample from a JSON array of entries.",
        "",
        "Usage:",
        "  tracklab-metadata --out <dir> [--entries entries.json]",
        "",
        "Options:",
        "  --out <dir>        Output directory for schema.json and sidecars (required).",
        "  --entries <file>   JSON array of sidecar entries to write.",
    ]
    .join("\n")
}
