//! Checksum repair
//!
//! Finds datastreams the repository keeps without a checksum (checksum type
//! `DISABLED`, or no recorded digest) and sets a checksum type on them, so
//! the repository computes and records a digest on the resulting commit.
//! Uses the same work lists and stop handling as the fixity validator.

use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

use crate::client::RepositoryClient;
use crate::error::{RepoError, Result};
use crate::fixity::{PidSource, StopToken, TerminationReason, WorkList};
use crate::model::ChecksumAlgorithm;
use crate::object::DigitalObject;
use crate::registry::{DEFAULT_TYPE, DatastreamSpec, TypeRegistry};

#[derive(Debug, Clone)]
pub struct RepairOptions {
    /// Checksum type set on datastreams that have none
    pub checksum_type: ChecksumAlgorithm,
    /// Report what would change without saving
    pub dry_run: bool,
}

impl Default for RepairOptions {
    fn default() -> Self {
        Self {
            checksum_type: ChecksumAlgorithm::Md5,
            dry_run: false,
        }
    }
}

impl RepairOptions {
    pub fn with_checksum_type(mut self, algorithm: ChecksumAlgorithm) -> Self {
        self.checksum_type = algorithm;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairStats {
    pub objects: u64,
    pub datastreams: u64,
    /// Datastreams given a checksum type (or that would be, on a dry run)
    pub repaired: u64,
    /// Objects that could not be examined or saved
    pub errors: u64,
}

impl RepairStats {
    pub fn summary(&self) -> String {
        format!(
            "Examined {} datastream(s) on {} object(s)\n\
             Set a checksum type on {} datastream(s)\n\
             Error repairing {} object(s)",
            self.datastreams, self.objects, self.repaired, self.errors
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RepairReport {
    pub stats: RepairStats,
    pub termination: TerminationReason,
    pub dry_run: bool,
    pub elapsed_secs: f64,
}

pub struct ChecksumRepairer {
    client: Arc<dyn RepositoryClient>,
    registry: TypeRegistry,
    options: RepairOptions,
    stop: StopToken,
}

impl ChecksumRepairer {
    pub fn new(client: Arc<dyn RepositoryClient>, options: RepairOptions) -> Self {
        Self {
            client,
            registry: TypeRegistry::new(),
            options,
            stop: StopToken::new(),
        }
    }

    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    /// Repair every object on the work list; one output line per datastream
    /// that is (or would be) changed
    pub async fn run(&self, work: WorkList, out: &mut (dyn Write + Send)) -> RepairReport {
        let start = Instant::now();
        let mut stats = RepairStats::default();
        let mut source = PidSource::new(work);

        let termination = loop {
            if self.stop.stop_requested() {
                break if self.stop.aborted() {
                    TerminationReason::Aborted
                } else {
                    TerminationReason::Interrupted
                };
            }
            let pid = match source.next(self.client.as_ref()).await {
                Ok(Some(pid)) => pid,
                Ok(None) => break TerminationReason::Exhausted,
                Err(e) => {
                    error!("Failed to read work list: {}", e);
                    stats.errors += 1;
                    break TerminationReason::WorkListFailed;
                }
            };
            if let Err(e) = self.repair_object(&pid, &mut stats, out).await {
                error!("Error repairing {}: {}", pid, e);
                stats.errors += 1;
            }
        };

        info!("Checksum repair finished ({})", termination);
        RepairReport {
            stats,
            termination,
            dry_run: self.options.dry_run,
            elapsed_secs: start.elapsed().as_secs_f64(),
        }
    }

    async fn repair_object(&self, pid: &str, stats: &mut RepairStats, out: &mut (dyn Write + Send)) -> Result<()> {
        let mut obj = DigitalObject::bind(self.client.clone(), &self.registry, DEFAULT_TYPE, pid)?;
        let dsids = self.client.get_datastream_ids(pid).await?;
        stats.objects += 1;
        let algorithm = self.options.checksum_type;

        let mut changed = Vec::new();
        for dsid in dsids {
            if obj.datastream(&dsid).is_none() {
                obj.add_datastream(&DatastreamSpec::new(dsid.clone(), ""))?;
            }
            let tracker = obj
                .datastream(&dsid)
                .ok_or_else(|| RepoError::NotFound(format!("{}/{}", pid, dsid)))?;
            let no_digest = match tracker.version().await? {
                Some(v) => v.digest.as_deref().is_none_or(|d| d.eq_ignore_ascii_case("none")),
                None => continue,
            };
            stats.datastreams += 1;
            let disabled = tracker.descriptor().checksum_type == ChecksumAlgorithm::Disabled;
            if !(disabled || no_digest) {
                continue;
            }
            debug!("{}/{} has no checksum", pid, dsid);
            tracker.set_checksum_type(algorithm);
            changed.push(dsid);
        }

        if changed.is_empty() {
            return Ok(());
        }
        if !self.options.dry_run {
            obj.save(Some(&format!("Setting checksum type {}", algorithm))).await?;
        }
        stats.repaired += changed.len() as u64;
        for dsid in changed {
            if self.options.dry_run {
                writeln!(out, "{}/{}: would set checksum type {}", pid, dsid, algorithm)?;
            } else {
                writeln!(out, "{}/{}: set checksum type {}", pid, dsid, algorithm)?;
            }
        }
        Ok(())
    }
}
