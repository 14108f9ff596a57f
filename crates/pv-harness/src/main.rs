#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use pv_harness::{run_scenario, ScenarioConfig};
use pv_verify::ReportLog;
use std::env;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str);

    match cmd {
        Some("run") => run_cmd(&args[1..]),
        Some("config") => {
            println!("{}", serde_json::to_string_pretty(&pv_verify::VerifyConfig::default())?);
            Ok(())
        }
        Some("--help" | "-h" | "help") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            bail!("unknown command: {other}")
        }
    }
}

fn run_cmd(args: &[String]) -> Result<()> {
    let Some(path) = args.first() else {
        bail!("usage: pv-harness run <scenario.json> [--reports <out.jsonl>]");
    };
    let reports_path = match args.get(1).map(String::as_str) {
        Some("--reports") => Some(Path::new(
            args.get(2).context("--reports requires a path")?,
        )),
        Some(other) => bail!("unexpected argument: {other}"),
        None => None,
    };

    let path = Path::new(path);
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let config = ScenarioConfig::from_json(&text)?;
    let result = run_scenario(&config)?;

    if let Some(out) = reports_path {
        let file =
            File::create(out).with_context(|| format!("failed to create {}", out.display()))?;
        let mut log = ReportLog::new(BufWriter::new(file));
        for report in &result.reports {
            log.append(report)?;
        }
        eprintln!("wrote {} reports to {}", log.written(), out.display());
    }

    println!("{}", serde_json::to_string_pretty(&result)?);
    if result.ops.iter().any(|op| op.fault.is_some()) {
        bail!("one or more operations faulted");
    }
    Ok(())
}

fn print_usage() {
    eprintln!("pv-harness: run verify scenarios against a simulated redundant group");
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("  pv-harness run <scenario.json> [--reports <out.jsonl>]");
    eprintln!("      Run every operation of the scenario and print the result as JSON");
    eprintln!("  pv-harness config");
    eprintln!("      Print the default verify configuration");
}
