//! Pointstore Daemon
//!
//! Reads samples from stdin, one per line, and feeds them to the history
//! engine until EOF, then flushes everything still queued for the archive.
//!
//! ```text
//! <source.name> <value> [<time>]
//! siteA.temp 21.5
//! siteA.temp dbl:21.75 0x5f5e100
//! siteA.door str:open
//! ```
//!
//! A value may carry an archive type tag (`int:5`, `abst:0x10`); untagged
//! values are read as numbers, then booleans, then strings. Time is 0x-hex or
//! decimal microseconds and defaults to now.

use clap::Parser;
use pointstore::config::Config;
use pointstore::storage::record::{decode_timestamp, decode_value, TYPE_TAGS};
use pointstore::storage::{now_micros, HistoryEngine, PointId, Sample, StorageResult, Value};
use std::io::BufRead;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pointstore")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Point-history engine: ingest samples from stdin")]
struct Args {
    /// Config file (default: standard locations, then environment)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Keep samples in memory only, never archive them
    #[arg(long)]
    no_archive: bool,

    /// Log engine statistics every N ingested samples (0 disables)
    #[arg(long, default_value = "10000")]
    stats_every: u64,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    pointstore::logging::init(&config.logging)?;

    tracing::info!("Pointstore v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Archive directory: {:?}", config.archive.archive_dir());

    // A backend that cannot be built is fatal
    let engine = HistoryEngine::open(&config)?;
    engine.start()?;

    let stdin = std::io::stdin();
    let mut ingested = 0u64;
    for (index, line) in stdin.lock().lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match parse_line(line) {
            Ok((point, sample)) => {
                engine.ingest(&point, sample, !args.no_archive);
                ingested += 1;
                if args.stats_every > 0 && ingested % args.stats_every == 0 {
                    tracing::info!("Engine stats: {}", engine.stats());
                }
            }
            Err(e) => tracing::warn!("Skipping input line {}: {}", index + 1, e),
        }
    }

    tracing::info!("Input closed after {} samples, shutting down...", ingested);
    engine.shutdown()?;
    tracing::info!("Pointstore shutdown complete");
    Ok(())
}

/// Parse `<point> <value> [<time>]`
fn parse_line(line: &str) -> anyhow::Result<(PointId, Sample)> {
    let mut fields = line.split_whitespace();
    let point = fields
        .next()
        .ok_or_else(|| anyhow::anyhow!("missing point"))?;
    let value = fields
        .next()
        .ok_or_else(|| anyhow::anyhow!("missing value"))?;
    let timestamp = match fields.next() {
        Some(field) if field.starts_with("0x") => decode_timestamp(field)?,
        Some(field) => field
            .parse::<i64>()
            .map_err(|_| anyhow::anyhow!("bad time {:?}", field))?,
        None => now_micros(),
    };
    if fields.next().is_some() {
        anyhow::bail!("trailing fields");
    }

    let point = PointId::parse(point)?;
    point.validate()?;
    Ok((point, Sample::new(timestamp, parse_value(value)?)))
}

fn parse_value(text: &str) -> StorageResult<Value> {
    if let Some((tag, rest)) = text.split_once(':') {
        if TYPE_TAGS.contains(&tag) {
            return decode_value(tag, rest);
        }
    }

    if let Ok(number) = text.parse::<f64>() {
        return Ok(Value::Double(number));
    }
    Ok(match text {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::Str(text.to_string()),
    })
}
