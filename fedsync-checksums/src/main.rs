//! validate-checksums: fixity checking for a repository.
//!
//! Validates datastream checksums for the given pids, or for objects that
//! were never checked or were last checked more than `--since` days ago,
//! least recently modified first.
//!
//! # Usage
//!
//! ```bash
//! validate-checksums --fedora-root http://localhost:8080/fedora/ \
//!     --fedora-user fedoraAdmin --max-objects 500 --time-limit 60
//!
//! # check specific objects, every version, and list problems in a CSV file
//! validate-checksums --fedora-root ... --all-versions --csv-file bad.csv demo:1 demo:2
//! ```
//!
//! Ctrl-C once stops after the object in progress; twice stops right away.
//! The exit status is always 0; the summary says how the run ended.

mod cli;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use cli::ConnectionArgs;
use fedsync_core::{
    FINDINGS_CSV_HEADER, FixityFinding, FixityOptions, FixityReport, FixityValidator, WorkList, csv_line,
};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "validate-checksums")]
#[command(author = "fedsync Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Validate datastream checksums and record when each object was checked")]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Only print the summary
    #[arg(short, long)]
    quiet: bool,

    /// Stop after this many objects
    #[arg(long)]
    max_objects: Option<u64>,

    /// Check every version of each datastream, not only the current one
    #[arg(long)]
    all_versions: bool,

    /// Recheck objects last checked more than this many days ago
    #[arg(long, default_value_t = 30)]
    since: i64,

    /// Stop after this many minutes
    #[arg(long)]
    time_limit: Option<u64>,

    /// Write every invalid or missing checksum to this CSV file
    #[arg(long)]
    csv_file: Option<PathBuf>,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,

    /// Objects to check; when omitted the work list comes from the resource index
    pids: Vec<String>,
}

impl Cli {
    fn options(&self) -> FixityOptions {
        let mut options = FixityOptions::default()
            .with_all_versions(self.all_versions)
            .with_quiet(self.quiet);
        if let Some(max) = self.max_objects {
            options = options.with_max_objects(max);
        }
        if let Some(minutes) = self.time_limit {
            options = options.with_time_limit(Duration::from_secs(minutes * 60));
        }
        options
    }

    fn work_list(&self) -> WorkList {
        if self.pids.is_empty() {
            WorkList::Query {
                stale_before: Utc::now() - chrono::Duration::days(self.since),
            }
        } else {
            WorkList::Pids(self.pids.clone())
        }
    }
}

/// Findings written as CSV rows, header first
struct FindingsCsv<W: Write> {
    writer: W,
    error: Option<std::io::Error>,
}

impl FindingsCsv<BufWriter<File>> {
    fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
        Self::new(BufWriter::new(file)).with_context(|| format!("Failed to write {}", path.display()))
    }
}

impl<W: Write> FindingsCsv<W> {
    fn new(mut writer: W) -> std::io::Result<Self> {
        writeln!(writer, "{}", csv_line(&FINDINGS_CSV_HEADER))?;
        Ok(Self { writer, error: None })
    }

    /// Write errors are kept until `finish`; later rows are dropped
    fn write(&mut self, finding: &FixityFinding) {
        if self.error.is_none() {
            if let Err(e) = writeln!(self.writer, "{}", finding.csv_row()) {
                self.error = Some(e);
            }
        }
    }

    fn finish(mut self) -> std::io::Result<W> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        self.writer.flush()?;
        Ok(self.writer)
    }
}

fn print_report(report: &FixityReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report).context("Failed to encode summary")?);
    } else {
        println!();
        println!("{}", report.stats.summary());
        println!("Run ended: {} ({:.1}s)", report.termination, report.elapsed_secs);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    cli::init_logging("validate_checksums=info")?;
    let cli = Cli::parse();

    let client = cli.connection.client()?;
    info!("Validating checksums in {}", client.root());

    let mut csv = match &cli.csv_file {
        Some(path) => Some(FindingsCsv::create(path)?),
        None => None,
    };

    let validator = FixityValidator::new(Arc::new(client), cli.options());
    cli::watch_interrupts(validator.stop_token());

    let mut out = std::io::stdout();
    let report = validator
        .run_with_findings(cli.work_list(), &mut out, &mut |finding| {
            if let Some(csv) = csv.as_mut() {
                csv.write(&finding);
            }
        })
        .await;

    if let (Some(csv), Some(path)) = (csv, &cli.csv_file) {
        if let Err(e) = csv.finish() {
            warn!("Failed to write {}: {}", path.display(), e);
        }
    }
    if let Err(e) = print_report(&report, cli.json) {
        warn!("{:#}", e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedsync_core::FindingStatus;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["validate-checksums", "--fedora-root", "http://localhost:8080/fedora"]).unwrap();
        assert_eq!(cli.since, 30);
        assert!(cli.pids.is_empty());
        assert!(cli.csv_file.is_none());
        assert!(matches!(cli.work_list(), WorkList::Query { .. }));

        let options = cli.options();
        assert!(options.record_checks);
        assert!(options.max_objects.is_none());
        assert!(options.time_limit.is_none());

        let http = cli.connection.http_options();
        assert_eq!(http.read_timeout, Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_limits_and_pids() {
        let cli = Cli::try_parse_from([
            "validate-checksums",
            "--fedora-root",
            "http://localhost:8080/fedora",
            "--max-objects",
            "2",
            "--time-limit",
            "5",
            "--all-versions",
            "--csv-file",
            "findings.csv",
            "demo:1",
            "demo:2",
        ])
        .unwrap();
        let options = cli.options();
        assert_eq!(options.max_objects, Some(2));
        assert_eq!(options.time_limit, Some(Duration::from_secs(300)));
        assert!(options.all_versions);
        assert_eq!(cli.csv_file.as_deref(), Some(Path::new("findings.csv")));
        match cli.work_list() {
            WorkList::Pids(pids) => assert_eq!(pids, vec!["demo:1", "demo:2"]),
            other => panic!("unexpected work list {:?}", other),
        }
    }

    #[test]
    fn test_read_timeout_can_be_disabled() {
        let cli = Cli::try_parse_from([
            "validate-checksums",
            "--fedora-root",
            "http://localhost:8080/fedora",
            "--read-timeout",
            "0",
        ])
        .unwrap();
        assert!(cli.connection.http_options().read_timeout.is_none());
    }

    #[test]
    fn test_root_is_required() {
        assert!(Cli::try_parse_from(["validate-checksums"]).is_err());
    }

    #[test]
    fn test_findings_csv() {
        let mut csv = FindingsCsv::new(Vec::new()).unwrap();
        csv.write(&FixityFinding {
            pid: "demo:1".to_string(),
            dsid: "TEXT".to_string(),
            created: "2024-03-01T12:00:00Z".parse().unwrap(),
            status: FindingStatus::Invalid,
            mimetype: "text/plain".to_string(),
            versionable: true,
        });
        let text = String::from_utf8(csv.finish().unwrap()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("\"pid\",\"datastream id\""));
        assert!(lines[1].starts_with("\"demo:1\",\"TEXT\""));
    }
}
