//! repair-checksums: give checksums to datastreams stored without one.
//!
//! Datastreams whose checksum type is `DISABLED`, or that have no recorded
//! digest, get the requested checksum type; the repository computes the
//! digest on the resulting commit.
//!
//! # Usage
//!
//! ```bash
//! # every object in the repository
//! repair-checksums --fedora-root http://localhost:8080/fedora/ --fedora-user fedoraAdmin
//!
//! # see what would change on two objects
//! repair-checksums --fedora-root ... --dry-run demo:1 demo:2
//! ```

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::ConnectionArgs;
use fedsync_core::{ChecksumAlgorithm, ChecksumRepairer, RepairOptions, RepairReport, WorkList};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "repair-checksums")]
#[command(author = "fedsync Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Set a checksum type on datastreams that have no checksum")]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Checksum type to set (MD5, SHA-1, SHA-256, SHA-384, SHA-512)
    #[arg(long, default_value = "MD5")]
    checksum_type: ChecksumAlgorithm,

    /// Report what would change without saving anything
    #[arg(long)]
    dry_run: bool,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,

    /// Objects to repair; when omitted every object in the repository
    pids: Vec<String>,
}

impl Cli {
    fn options(&self) -> RepairOptions {
        RepairOptions::default()
            .with_checksum_type(self.checksum_type)
            .with_dry_run(self.dry_run)
    }

    fn work_list(&self) -> WorkList {
        if self.pids.is_empty() {
            WorkList::All
        } else {
            WorkList::Pids(self.pids.clone())
        }
    }
}

fn print_report(report: &RepairReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report).context("Failed to encode summary")?);
    } else {
        println!();
        if report.dry_run {
            println!("Dry run, nothing was saved");
        }
        println!("{}", report.stats.summary());
        println!("Run ended: {} ({:.1}s)", report.termination, report.elapsed_secs);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    cli::init_logging("repair_checksums=info")?;
    let cli = Cli::parse();
    if cli.checksum_type == ChecksumAlgorithm::Disabled {
        anyhow::bail!("DISABLED is not a checksum type to repair with");
    }

    let client = cli.connection.client()?;
    info!("Repairing checksums in {}", client.root());

    let repairer = ChecksumRepairer::new(Arc::new(client), cli.options());
    cli::watch_interrupts(repairer.stop_token());

    let mut out = std::io::stdout();
    let report = repairer.run(cli.work_list(), &mut out).await;
    if let Err(e) = print_report(&report, cli.json) {
        warn!("{:#}", e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["repair-checksums", "--fedora-root", "http://localhost:8080/fedora"]).unwrap();
        assert_eq!(cli.checksum_type, ChecksumAlgorithm::Md5);
        assert!(!cli.options().dry_run);
        assert!(matches!(cli.work_list(), WorkList::All));
    }

    #[test]
    fn test_checksum_type_and_pids() {
        let cli = Cli::try_parse_from([
            "repair-checksums",
            "--fedora-root",
            "http://localhost:8080/fedora",
            "--checksum-type",
            "sha-256",
            "--dry-run",
            "demo:1",
        ])
        .unwrap();
        let options = cli.options();
        assert_eq!(options.checksum_type, ChecksumAlgorithm::Sha256);
        assert!(options.dry_run);
        match cli.work_list() {
            WorkList::Pids(pids) => assert_eq!(pids, vec!["demo:1"]),
            other => panic!("unexpected work list {:?}", other),
        }
    }

    #[test]
    fn test_unknown_checksum_type() {
        let err = Cli::try_parse_from([
            "repair-checksums",
            "--fedora-root",
            "http://localhost:8080/fedora",
            "--checksum-type",
            "crc32",
        ])
        .unwrap_err();
        assert!(err.to_string().contains("Unknown checksum type"));
    }
}
