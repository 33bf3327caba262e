use anyhow::{Context, Result};
use bench_core::{
    fetch_once, run_benchmark, BenchmarkReport, Config, FcgiDialer, LatencySummary, Network,
    RequestParams,
};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "fpm-bench")]
#[command(about = "Benchmark a FastCGI responder such as php-fpm, or fetch a single response")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Optional TOML configuration file; flags override its values
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Script to execute [default: index.php]
    #[arg(long, global = true)]
    script: Option<String>,

    /// Directory the script is resolved against [default: /opt/omegaup/frontend/www]
    #[arg(long, global = true)]
    document_root: Option<String>,

    /// Network to dial: tcp or unix [default: tcp]
    #[arg(long, global = true)]
    network: Option<Network>,

    /// Address to dial [default: localhost:9000]
    #[arg(long, global = true)]
    address: Option<String>,

    /// Number of concurrent workers [default: 4]
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Requests per second across all workers [default: 10]
    #[arg(long, global = true)]
    rate: Option<f64>,

    /// Duration of the measurement, e.g. 30s or 1m, rounded up to whole
    /// milliseconds [default: 30s]
    #[arg(long, global = true, value_parser = humantime::parse_duration)]
    duration: Option<Duration>,

    /// Print the status line and headers to stderr (get only)
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send requests at a fixed rate and report latency percentiles
    Benchmark {
        /// Also write the results as JSON to this file
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Send a single request and write the response body to stdout
    Get,
}

#[derive(Debug, Serialize, Deserialize)]
struct BenchmarkResult {
    timestamp: String,
    network: String,
    address: String,
    script_filename: String,
    workers: usize,
    rate: f64,
    duration_ms: u64,
    elapsed_ms: u64,
    count: usize,
    failed_workers: usize,
    latency_us: Option<LatencyMicros>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LatencyMicros {
    mean: u64,
    min: u64,
    p50: u64,
    p90: u64,
    p95: u64,
    p99: u64,
    max: u64,
}

impl From<&LatencySummary> for LatencyMicros {
    fn from(s: &LatencySummary) -> Self {
        let us = |d: Duration| d.as_micros() as u64;
        Self {
            mean: us(s.mean),
            min: us(s.min),
            p50: us(s.p50),
            p90: us(s.p90),
            p95: us(s.p95),
            p99: us(s.p99),
            max: us(s.max),
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // stdout carries response bodies in `get` mode, so logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return Ok(if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            });
        }
    };

    let config = load_config(&args)?;
    let dialer = FcgiDialer::new(config.target.network, config.target.address.clone());
    let params = Arc::new(RequestParams::for_script(
        &config.request.document_root,
        &config.request.script,
    ));

    match args.command {
        Command::Benchmark { output } => {
            let report = run_benchmark(&config.load, Arc::new(dialer), params.clone()).await?;
            print_summary(&report);

            if let Some(path) = output {
                let result = benchmark_result(&config, &params, &report);
                let result_json = serde_json::to_string_pretty(&result)?;
                std::fs::write(&path, result_json)
                    .with_context(|| format!("Failed to write results to {:?}", path))?;
                info!("Results written to {:?}", path);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Get => {
            let fetched = fetch_once(&dialer, &params).await.with_context(|| {
                format!(
                    "Request to {} {} failed",
                    config.target.network, config.target.address
                )
            })?;

            let success = fetched.write_response(
                args.verbose,
                &mut std::io::stderr().lock(),
                &mut std::io::stdout().lock(),
            )?;

            if success {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => Config::default(),
    };

    if let Some(script) = &args.script {
        config.request.script = script.clone();
    }
    if let Some(root) = &args.document_root {
        config.request.document_root = root.clone();
    }
    if let Some(network) = args.network {
        config.target.network = network;
    }
    if let Some(address) = &args.address {
        config.target.address = address.clone();
    }
    if let Some(workers) = args.workers {
        config.load.workers = workers;
    }
    if let Some(rate) = args.rate {
        config.load.rate = rate;
    }
    if let Some(duration) = args.duration {
        config.load.duration_ms = duration_to_ms(duration);
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Whole milliseconds, rounded up so a short but non-zero duration stays non-zero.
fn duration_to_ms(duration: Duration) -> u64 {
    duration.as_nanos().div_ceil(1_000_000) as u64
}

fn print_summary(report: &BenchmarkReport) {
    let failed = report.failed_workers();
    if failed > 0 {
        warn!(
            "{} of {} workers stopped early; statistics cover the samples that arrived",
            failed,
            report.workers.len()
        );
    }

    let Some(summary) = &report.latency else {
        return;
    };
    for (label, value) in summary.rows() {
        info!("{} latency: {:?}", label, value);
    }
}

fn benchmark_result(
    config: &Config,
    params: &RequestParams,
    report: &BenchmarkReport,
) -> BenchmarkResult {
    BenchmarkResult {
        timestamp: chrono::Utc::now().to_rfc3339(),
        network: config.target.network.to_string(),
        address: config.target.address.clone(),
        script_filename: params.get("SCRIPT_FILENAME").unwrap_or_default().to_string(),
        workers: config.load.workers,
        rate: config.load.rate,
        duration_ms: config.load.duration_ms,
        elapsed_ms: report.elapsed.as_millis() as u64,
        count: report.count(),
        failed_workers: report.failed_workers(),
        latency_us: report.latency.as_ref().map(LatencyMicros::from),
    }
}
