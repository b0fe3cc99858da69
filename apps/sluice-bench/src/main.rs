use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{error, info};

mod config;
mod flood;
mod sink;

use crate::config::BenchConfig;
use crate::flood::{run_flood, BenchError, BenchReport};
use crate::sink::{build_corpus, BenchSink};

fn parse_duration(raw: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(raw).map_err(|err| err.to_string())
}

/// Floods the SLUICE fetcher with costly-to-validate items and reports how
/// much validation work the flooders bought.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (.toml/.json/.yaml, or .env)
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// How long to flood, e.g. "30s"
    #[arg(long, value_parser = parse_duration)]
    duration: Option<Duration>,
    /// Number of concurrent flooding peers
    #[arg(long)]
    peers: Option<usize>,
    /// Items per delivery
    #[arg(long)]
    items: Option<usize>,
    /// BLAKE3 rounds per validated item
    #[arg(long)]
    rounds: Option<u32>,
    /// Write the JSON report here instead of stdout
    #[arg(long)]
    report: Option<PathBuf>,
    /// Validate a single corpus item, print its timing and exit
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn apply(&self, config: &mut BenchConfig) {
        if let Some(duration) = self.duration {
            config.duration = duration;
        }
        if let Some(peers) = self.peers {
            config.peers = peers;
        }
        if let Some(items) = self.items {
            config.items_per_delivery = items;
        }
        if let Some(rounds) = self.rounds {
            config.validation_rounds = rounds;
        }
        if let Some(report) = &self.report {
            config.report_path = Some(report.clone());
        }
    }
}

fn emit_report(report: &BenchReport, path: Option<&PathBuf>) -> Result<(), BenchError> {
    for line in report.summary_lines() {
        println!("{line}");
    }
    let json = serde_json::to_string_pretty(report)?;
    match path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            fs::write(path, json)?;
            info!("bench: report written to {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn debug_single(config: &BenchConfig) {
    let sink = BenchSink::new(config.validation_rounds);
    let corpus = build_corpus(config);
    let Some(tx) = corpus.first() else {
        println!("corpus is empty");
        return;
    };
    let start = Instant::now();
    let passed = sink.validate(tx);
    println!(
        "item_kind={} item_size={} invalid={}",
        tx.kind.0, tx.size, tx.invalid
    );
    println!("validate_passed={passed}");
    println!("validate_took={:?}", start.elapsed());
}

#[tokio::main]
async fn main() {
    let filter = std::env::var("SLUICE_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    let mut config = match BenchConfig::new(cli.config.clone()) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("failed to load config: {err}");
            std::process::exit(1);
        }
    };
    cli.apply(&mut config);

    if config.peers == 0 || config.items_per_delivery == 0 {
        error!("peers and items per delivery must be > 0");
        std::process::exit(2);
    }

    if cli.debug {
        debug_single(&config);
        return;
    }

    let report = match run_flood(&config).await {
        Ok(report) => report,
        Err(err) => {
            error!("flood failed: {err}");
            std::process::exit(1);
        }
    };
    if let Err(err) = emit_report(&report, config.report_path.as_ref()) {
        error!("failed to emit report: {err}");
        std::process::exit(1);
    }
    if report.disconnects == 0 && report.failures > 0 {
        info!("bench: no flooder was disconnected");
    }
}
