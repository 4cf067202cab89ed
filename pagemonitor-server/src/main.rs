use std::io::{BufRead, BufReader};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use pagemonitor::{
    BatchProcessor, Config, MemoryStore, ReportEngine, StatType, TrackingRecord,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Replay newline-delimited tracking events through the batch pipeline and
/// print the resulting report as JSON.
#[derive(Parser)]
#[command(name = "pagemonitor")]
struct Cli {
    /// Tracking events, one JSON object per line. `-` reads stdin.
    #[arg(long, env = "PAGEMONITOR_EVENTS", default_value = "-")]
    events: String,

    #[arg(long, env = "PAGEMONITOR_SYSTEM", default_value = "default")]
    system: String,

    /// pageViews, downloads, events or duration.
    #[arg(long = "type", env = "PAGEMONITOR_REPORT_TYPE", default_value = "pageViews")]
    stat_type: StatType,

    /// First day of the report, YYYY-MM-DD.
    #[arg(long)]
    start: Option<String>,

    /// Last day of the report, YYYY-MM-DD.
    #[arg(long)]
    end: Option<String>,

    #[arg(long, default_value_t = pagemonitor::analytics::DEFAULT_LIMIT)]
    limit: usize,

    /// Overrides PAGEMONITOR_BATCH_SIZE.
    #[arg(long)]
    batch_size: Option<usize>,

    /// Overrides PAGEMONITOR_BATCH_INTERVAL_SECS.
    #[arg(long)]
    flush_interval_ms: Option<u64>,

    /// Print compact JSON instead of pretty-printed.
    #[arg(long)]
    compact: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // stdout carries the report, logs go to stderr
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("ERROR: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::from_env()?;
    if let Some(size) = cli.batch_size {
        config.batch.flush_size = size;
    }
    if let Some(ms) = cli.flush_interval_ms {
        config.batch.flush_interval = Duration::from_millis(ms);
    }
    config.validate()?;

    let store = Arc::new(MemoryStore::new());
    let processor = BatchProcessor::new(store.clone(), config.batch.clone())?;
    let engine = ReportEngine::new(store.clone(), config.report.clone());
    processor.start();

    let reader: Box<dyn BufRead> = if cli.events == "-" {
        Box::new(BufReader::new(std::io::stdin()))
    } else {
        Box::new(BufReader::new(std::fs::File::open(&cli.events)?))
    };
    let replayed = replay(&processor, reader).await;
    processor.stop().await;
    let summary = replayed?;

    let metrics = processor.metrics();
    tracing::info!(
        "Replayed {} events ({} skipped, {} rejected), {} batches, {} dropped after retries, {} dropped on shutdown",
        summary.accepted,
        summary.skipped,
        summary.rejected,
        metrics.total_batches,
        metrics.dropped_after_max_retries,
        metrics.dropped_on_shutdown
    );

    let report = engine
        .query_aggregate(
            &cli.system,
            cli.start.as_deref(),
            cli.end.as_deref(),
            cli.stat_type,
            cli.limit,
        )
        .await?;
    let out = if cli.compact {
        serde_json::to_string(&*report)?
    } else {
        serde_json::to_string_pretty(&*report)?
    };
    println!("{}", out);
    Ok(())
}

#[derive(Default)]
struct ReplaySummary {
    accepted: usize,
    skipped: usize,
    rejected: usize,
}

async fn replay(
    processor: &BatchProcessor,
    reader: Box<dyn BufRead>,
) -> Result<ReplaySummary, std::io::Error> {
    let mut summary = ReplaySummary::default();
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str::<serde_json::Value>(&line)
            .map_err(pagemonitor::PageMonitorError::from)
            .and_then(|value| TrackingRecord::from_json(&value, chrono::Utc::now()));
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("Skipping line {}: {}", n + 1, e);
                summary.skipped += 1;
                continue;
            }
        };
        if processor.track(&record).await {
            summary.accepted += 1;
        } else {
            summary.rejected += 1;
        }
    }
    Ok(summary)
}
