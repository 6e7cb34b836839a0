//! Pointstore CLI
//!
//! Offline inspection and maintenance of an archive:
//! - List a point's segments
//! - Extract samples, or the neighbours of an instant
//! - Apply retention by hand
//! - Compress / decompress individual segments
//! - Generate a config file

use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, SecondsFormat, Utc};
use clap::{Parser, Subcommand};
use pointstore::config::{generate_default_config, BackendKind, Config};
use pointstore::query::decimate;
use pointstore::storage::record::{encode_value, type_tag};
use pointstore::storage::{
    now_micros, open_backend, FlatFileArchive, FlatFileConfig, PointId, Sample, SegmentFile,
    TimeRange, Timestamp,
};
use regex::Regex;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "pointstore-cli")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Inspect and maintain a pointstore archive")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: standard locations, then environment)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Archive directory, overriding the config
    #[arg(long, global = true)]
    pub archive_dir: Option<PathBuf>,

    /// Archive backend, overriding the config (flatfile, sqlite, memory, none)
    #[arg(long, global = true)]
    pub backend: Option<BackendKind>,

    /// Output format (table, json, csv)
    #[arg(short, long, default_value = "table", global = true)]
    pub format: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List the segment files of a point
    Segments {
        /// Point name, e.g. siteA.temp
        point: String,
    },

    /// Print archived samples in a time range
    Extract {
        point: String,
        /// Range start. Supports: "now", "now-7d", RFC 3339, 0x-hex or decimal microseconds
        #[arg(long, default_value = "now-1d")]
        from: String,
        /// Range end
        #[arg(long, default_value = "now")]
        to: String,
        /// Decimate to at most this many samples
        #[arg(short, long, default_value = "0")]
        max_samples: usize,
    },

    /// Print the last archived sample at or before a time
    Preceding { point: String, time: String },

    /// Print the first archived sample at or after a time
    Following { point: String, time: String },

    /// Remove archived data older than a given age
    Purge {
        point: String,
        /// Age to keep (e.g. 12h, 7d, 4w)
        #[arg(long)]
        older_than: String,
    },

    /// Compress one plain segment of a point
    Compress { point: String, segment: String },

    /// Expand one compressed segment of a point
    Decompress { point: String, segment: String },

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    if let Some(dir) = &cli.archive_dir {
        config.archive.dir = dir.to_string_lossy().to_string();
    }
    if let Some(kind) = cli.backend {
        config.archive.backend = kind;
    }
    // The CLI keeps quiet unless RUST_LOG asks otherwise
    config.logging.level = "warn".to_string();
    if let Err(e) = pointstore::logging::init(&config.logging) {
        eprintln!("Logging disabled: {}", e);
    }

    match cli.command {
        Commands::Segments { point } => {
            let point = PointId::parse(&point)?;
            let archive = open_flatfile(&config)?;
            let catalog = archive.catalog(&point)?;
            let rows: Vec<SegmentRow> = catalog.segments().iter().map(SegmentRow::from).collect();
            print_segments(&cli.format, &rows)?;
        }

        Commands::Extract {
            point,
            from,
            to,
            max_samples,
        } => {
            let point = PointId::parse(&point)?;
            let range = TimeRange::new(parse_time(&from)?, parse_time(&to)?);
            if range.is_empty() {
                bail!("--from is after --to");
            }
            let backend = open_backend(&config.archive)?;
            let samples = backend.extract(&point, range)?;
            if samples.len() >= backend.max_records() {
                eprintln!("Result capped at {} records", backend.max_records());
            }
            print_samples(&cli.format, &decimate(samples, range, max_samples))?;
        }

        Commands::Preceding { point, time } => {
            let point = PointId::parse(&point)?;
            let backend = open_backend(&config.archive)?;
            let sample = backend.preceding_or_at(&point, parse_time(&time)?)?;
            print_samples(&cli.format, sample.as_slice())?;
        }

        Commands::Following { point, time } => {
            let point = PointId::parse(&point)?;
            let backend = open_backend(&config.archive)?;
            let sample = backend.following_or_at(&point, parse_time(&time)?)?;
            print_samples(&cli.format, sample.as_slice())?;
        }

        Commands::Purge { point, older_than } => {
            let point = PointId::parse(&point)?;
            let age = parse_duration(&older_than)?;
            let backend = open_backend(&config.archive)?;
            let removed = backend.purge_older_than(&point, age)?;
            println!(
                "Removed {} {} of {} older than {}",
                removed,
                if backend.name() == "flatfile" { "segments" } else { "samples" },
                point,
                format_duration(age.as_secs())
            );
        }

        Commands::Compress { point, segment } => {
            let point = PointId::parse(&point)?;
            let archive = open_flatfile(&config)?;
            let target = find_segment(&archive, &point, &segment)?;
            if target.is_compressed() {
                bail!("{} is already compressed", segment);
            }
            let path = archive.compress_segment(&point, &target)?;
            println!("Compressed to {}", path.display());
        }

        Commands::Decompress { point, segment } => {
            let point = PointId::parse(&point)?;
            let archive = open_flatfile(&config)?;
            let target = find_segment(&archive, &point, &segment)?;
            if !target.is_compressed() {
                bail!("{} is not compressed", segment);
            }
            let path = archive.decompress_segment(&target)?;
            println!("Expanded to {}", path.display());
        }

        Commands::Config { output } => {
            let content = generate_default_config();
            match output {
                Some(path) => {
                    std::fs::write(&path, &content)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("Config written to {}", path.display());
                }
                None => print!("{}", content),
            }
        }
    }

    Ok(())
}

fn open_flatfile(config: &Config) -> anyhow::Result<FlatFileArchive> {
    if config.archive.backend != BackendKind::Flatfile {
        bail!("segment commands need the flatfile backend");
    }
    Ok(FlatFileArchive::open(FlatFileConfig::from_archive_config(
        &config.archive,
    ))?)
}

/// Look a segment up by file name, with or without the compressed suffix
fn find_segment(
    archive: &FlatFileArchive,
    point: &PointId,
    name: &str,
) -> anyhow::Result<SegmentFile> {
    let catalog = archive.catalog(point)?;
    let wanted = name.trim_end_matches(".zip");
    catalog
        .segments()
        .iter()
        .find(|s| s.name.stem == wanted)
        .cloned()
        .ok_or_else(|| anyhow!("no segment {} for {}", name, point))
}

/// Parse a point in time into microseconds
fn parse_time(s: &str) -> anyhow::Result<Timestamp> {
    let s = s.trim();
    if s == "now" {
        return Ok(now_micros());
    }

    let relative = Regex::new(r"^now-(\d+)([smhdw])$")?;
    if let Some(caps) = relative.captures(s) {
        let amount: u64 = caps[1].parse()?;
        let back = unit_duration(amount, &caps[2])?;
        return Ok(now_micros().saturating_sub(back.as_micros() as i64));
    }

    if let Some(hex) = s.strip_prefix("0x") {
        return Ok(u64::from_str_radix(hex, 16)? as i64);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_micros());
    }
    s.parse::<i64>()
        .map_err(|_| anyhow!("Invalid time: {}. Use: now, now-7d, RFC 3339, 0x-hex or microseconds", s))
}

fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let re = Regex::new(r"^(\d+)([smhdw])$")?;
    let s = s.trim().to_lowercase();
    let caps = re
        .captures(&s)
        .ok_or_else(|| anyhow!("Invalid duration format: {}. Use: 30s, 12h, 7d, 4w", s))?;
    unit_duration(caps[1].parse()?, &caps[2])
}

fn unit_duration(amount: u64, unit: &str) -> anyhow::Result<Duration> {
    let secs = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        "w" => 7 * 86_400,
        other => bail!("unknown time unit {}", other),
    };
    Ok(Duration::from_secs(amount.saturating_mul(secs)))
}

fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else if seconds < 86400 {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    } else {
        format!("{}d {}h", seconds / 86400, (seconds % 86400) / 3600)
    }
}

fn format_time(ts: Timestamp) -> String {
    DateTime::<Utc>::from_timestamp_micros(ts)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Micros, true))
        .unwrap_or_else(|| "-".to_string())
}

#[derive(Serialize)]
struct SampleRow {
    timestamp: Timestamp,
    time: String,
    #[serde(rename = "type")]
    type_tag: &'static str,
    value: String,
    raw: String,
    alarm: bool,
}

impl From<&Sample> for SampleRow {
    fn from(sample: &Sample) -> Self {
        Self {
            timestamp: sample.timestamp,
            time: format_time(sample.timestamp),
            type_tag: type_tag(&sample.value),
            value: encode_value(&sample.value),
            raw: sample.raw.as_ref().map(encode_value).unwrap_or_default(),
            alarm: sample.alarm,
        }
    }
}

#[derive(Serialize)]
struct SegmentRow {
    name: String,
    start: String,
    compressed: bool,
    size_bytes: u64,
}

impl From<&SegmentFile> for SegmentRow {
    fn from(segment: &SegmentFile) -> Self {
        Self {
            name: segment.name.file_name(),
            start: format_time(segment.start()),
            compressed: segment.is_compressed(),
            size_bytes: segment.size(),
        }
    }
}

fn print_samples(format: &str, samples: &[Sample]) -> anyhow::Result<()> {
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(samples)?),
        "csv" => print_csv(samples.iter().map(SampleRow::from))?,
        _ => {
            if samples.is_empty() {
                println!("No data");
                return Ok(());
            }
            println!("{:<28} | {:<6} | {:<20} | {:<12} | Alarm", "Time", "Type", "Value", "Raw");
            println!("{}", "-".repeat(84));
            for row in samples.iter().map(SampleRow::from) {
                println!(
                    "{:<28} | {:<6} | {:<20} | {:<12} | {}",
                    row.time,
                    row.type_tag,
                    row.value,
                    row.raw,
                    if row.alarm { "A" } else { "" }
                );
            }
            println!("{} samples", samples.len());
        }
    }
    Ok(())
}

fn print_segments(format: &str, rows: &[SegmentRow]) -> anyhow::Result<()> {
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(rows)?),
        "csv" => print_csv(rows.iter())?,
        _ => {
            if rows.is_empty() {
                println!("No segments");
                return Ok(());
            }
            println!("{:<30} | {:<28} | {:<10} | Size", "Segment", "Start", "Compressed");
            println!("{}", "-".repeat(84));
            for row in rows {
                println!(
                    "{:<30} | {:<28} | {:<10} | {}",
                    row.name,
                    row.start,
                    if row.compressed { "yes" } else { "no" },
                    row.size_bytes
                );
            }
        }
    }
    Ok(())
}

fn print_csv<I, R>(rows: I) -> anyhow::Result<()>
where
    I: IntoIterator<Item = R>,
    R: Serialize,
{
    let mut writer = csv::Writer::from_writer(std::io::stdout());
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}
