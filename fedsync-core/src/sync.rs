//! Cross-repository object copy
//!
//! For each pid, in the order given:
//!
//! 1. check the destination; an existing copy is skipped unless overwriting
//! 2. open a streaming export at the source
//! 3. when overwriting, purge the destination copy
//! 4. pipe the export into a destination ingest
//!
//! If the destination rejects the ingest because a recorded digest could not
//! be reproduced, the export is requested again and piped through an
//! [`ExportRewriter`] that drops the recorded digests of the configured
//! datastreams; that retry happens once.
//!
//! In archive-xml mode every export is an archive export whose managed
//! binary content is replaced by source URLs, so the destination pulls the
//! content itself instead of receiving it base64 encoded.

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use std::collections::BTreeSet;
use std::fmt;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

use crate::client::{ByteStream, ExportContext, RepositoryClient};
use crate::error::{RepoError, Result};
use crate::foxml::{ExportRewriter, rewrite_export};
use crate::model::ControlGroup;
use crate::registry::{DC_ID, RELS_EXT_ID};

/// Datastreams whose digests are commonly not reproducible after transfer
pub const DEFAULT_STRIP_DIGESTS: [&str; 3] = [DC_ID, RELS_EXT_ID, "RELS-INT"];

/// Allowance for object properties, audit trail and markup in an export
pub const EXPORT_OVERHEAD: u64 = 250_000;

/// Snapshot handed to the progress callback
#[derive(Debug, Clone, Copy)]
pub struct TransferProgress<'a> {
    pub pid: &'a str,
    /// Bytes read from the source for the current attempt
    pub transferred: u64,
    /// Estimated export size, when it could be worked out
    pub estimated: Option<u64>,
}

pub type ProgressFn = Arc<dyn Fn(&TransferProgress<'_>) + Send + Sync>;

/// Size of `n` bytes once base64 encoded with 76-column lines
pub fn base64_size(n: u64) -> u64 {
    let padded = n.div_ceil(3) * 4;
    padded + padded / 76
}

/// Rough size of an object export: every version of every datastream plus
/// [`EXPORT_OVERHEAD`]; managed content counts base64 encoded when the
/// export inlines it
pub async fn estimate_object_size(client: &dyn RepositoryClient, pid: &str, archive: bool) -> Result<u64> {
    let mut size = EXPORT_OVERHEAD;
    for dsid in client.get_datastream_ids(pid).await? {
        let info = client.get_datastream_info(pid, &dsid).await?;
        let inlined = archive && info.descriptor.control_group == ControlGroup::Managed;
        for version in client.get_datastream_history(pid, &dsid).await? {
            size += if inlined { base64_size(version.size) } else { version.size };
        }
    }
    Ok(size)
}

/// A named repository taking part in a copy
#[derive(Clone)]
pub struct SyncEndpoint {
    pub name: String,
    pub client: Arc<dyn RepositoryClient>,
}

impl SyncEndpoint {
    pub fn new(name: impl Into<String>, client: Arc<dyn RepositoryClient>) -> Self {
        Self {
            name: name.into(),
            client,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Replace objects that already exist at the destination
    pub overwrite: bool,
    pub export_context: ExportContext,
    /// Datastream ids whose digests are dropped on a checksum-mismatch retry
    pub strip_digests: BTreeSet<String>,
    pub log_message: Option<String>,
    /// Archive export with managed content (other than `text/xml`) replaced
    /// by source URLs
    pub archive_xml: bool,
    /// Embed the source credentials in those URLs
    pub url_credentials: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            overwrite: false,
            export_context: ExportContext::Archive,
            strip_digests: DEFAULT_STRIP_DIGESTS.iter().map(|s| s.to_string()).collect(),
            log_message: None,
            archive_xml: false,
            url_credentials: false,
        }
    }
}

impl SyncOptions {
    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_export_context(mut self, context: ExportContext) -> Self {
        self.export_context = context;
        self
    }

    pub fn with_strip_digests<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.strip_digests = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_log_message(mut self, message: impl Into<String>) -> Self {
        self.log_message = Some(message.into());
        self
    }

    /// Copy in archive-xml mode; `url_credentials` embeds the source
    /// credentials in content URLs for sources that require them
    pub fn with_archive_xml(mut self, url_credentials: bool) -> Self {
        self.archive_xml = true;
        self.url_credentials = url_credentials;
        self
    }

    /// Export context actually requested from the source
    pub fn effective_export_context(&self) -> ExportContext {
        if self.archive_xml {
            ExportContext::Archive
        } else {
            self.export_context
        }
    }
}

/// One pid being copied
#[derive(Debug, Clone)]
pub struct SyncTask {
    pub pid: String,
    pub source: String,
    pub destination: String,
    pub destination_exists: bool,
    pub overwrite: bool,
    /// Estimated export size, worked out when progress is reported
    pub estimated_size: Option<u64>,
}

#[derive(Debug)]
pub enum SyncOutcome {
    Copied {
        /// Bytes read from the source for the ingest that succeeded
        bytes: u64,
        /// Digests had to be stripped for the destination to accept it
        repaired: bool,
    },
    Skipped {
        reason: String,
    },
    Failed {
        reason: String,
        error: RepoError,
    },
}

#[derive(Debug)]
pub struct SyncResult {
    pub task: SyncTask,
    pub outcome: SyncOutcome,
}

impl fmt::Display for SyncResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pid = &self.task.pid;
        match &self.outcome {
            SyncOutcome::Copied { bytes, repaired } => {
                write!(
                    f,
                    "{} copied from {} to {} ({})",
                    pid,
                    self.task.source,
                    self.task.destination,
                    format_size(*bytes)
                )?;
                if *repaired {
                    write!(f, " after removing unreproducible checksums")?;
                }
                Ok(())
            }
            SyncOutcome::Skipped { reason } => write!(f, "{} {}", pid, reason),
            SyncOutcome::Failed { reason, error } => write!(f, "Error copying {}: {} ({})", pid, reason, error),
        }
    }
}

/// Per-pid results of a run
#[derive(Debug, Default)]
pub struct SyncReport {
    pub results: Vec<SyncResult>,
    /// Bytes read from the source across all attempts
    pub bytes_transferred: u64,
}

impl SyncReport {
    fn count(&self, pred: fn(&SyncOutcome) -> bool) -> usize {
        self.results.iter().filter(|r| pred(&r.outcome)).count()
    }

    pub fn copied(&self) -> usize {
        self.count(|o| matches!(o, SyncOutcome::Copied { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, SyncOutcome::Skipped { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, SyncOutcome::Failed { .. }))
    }

    pub fn summary(&self) -> String {
        format!(
            "Copied {}, skipped {}, failed {} object(s); {} transferred",
            self.copied(),
            self.skipped(),
            self.failed(),
            format_size(self.bytes_transferred)
        )
    }
}

/// Streams objects from one repository into another
pub struct SyncEngine {
    source: SyncEndpoint,
    destination: SyncEndpoint,
    options: SyncOptions,
    progress: Option<ProgressFn>,
}

impl SyncEngine {
    pub fn new(source: SyncEndpoint, destination: SyncEndpoint, options: SyncOptions) -> Self {
        Self {
            source,
            destination,
            options,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Copy every pid in order, writing one outcome line per pid to `out`
    pub async fn run(&self, pids: &[String], out: &mut (dyn Write + Send)) -> SyncReport {
        let mut report = SyncReport::default();
        for pid in pids {
            let (result, bytes) = self.sync_one(pid).await;
            report.bytes_transferred += bytes;
            if let Err(e) = writeln!(out, "{}", result) {
                warn!("Failed to write outcome for {}: {}", pid, e);
            }
            report.results.push(result);
        }
        info!("{}", report.summary());
        report
    }

    /// Copy one pid; returns the result and the bytes read from the source
    pub async fn sync_one(&self, pid: &str) -> (SyncResult, u64) {
        let mut task = SyncTask {
            pid: pid.to_string(),
            source: self.source.name.clone(),
            destination: self.destination.name.clone(),
            destination_exists: false,
            overwrite: self.options.overwrite,
            estimated_size: None,
        };
        let counter = Arc::new(AtomicU64::new(0));
        let outcome = self.copy(&mut task, &counter).await;
        if let SyncOutcome::Failed { reason, error } = &outcome {
            error!("Error copying {}: {}: {}", pid, reason, error);
        }
        (SyncResult { task, outcome }, counter.load(Ordering::SeqCst))
    }

    fn failed(reason: &str, error: RepoError) -> SyncOutcome {
        SyncOutcome::Failed {
            reason: reason.to_string(),
            error,
        }
    }

    async fn copy(&self, task: &mut SyncTask, counter: &Arc<AtomicU64>) -> SyncOutcome {
        let pid = task.pid.as_str();
        let dest = self.destination.client.as_ref();
        let log_message = self.options.log_message.as_deref();

        task.destination_exists = match dest.object_exists(pid).await {
            Ok(exists) => exists,
            Err(e) => return Self::failed("could not check destination", e),
        };
        if task.destination_exists && !task.overwrite {
            return SyncOutcome::Skipped {
                reason: format!("already exists in {}, skipping", task.destination),
            };
        }

        if self.progress.is_some() {
            task.estimated_size = self.estimate(pid).await;
        }
        let estimated = task.estimated_size;

        let export = match self.open_export(pid, counter, estimated, false).await {
            Ok(s) => s,
            Err(e) => return Self::failed("export from source failed", e),
        };

        if task.destination_exists {
            debug!("Purging existing copy of {} at {}", pid, task.destination);
            if let Err(e) = dest.purge_object(pid, log_message).await {
                return Self::failed("could not purge existing copy at destination", e);
            }
        }

        let first_start = counter.load(Ordering::SeqCst);
        match dest.ingest(Some(pid), export, log_message).await {
            Ok(_) => {
                return SyncOutcome::Copied {
                    bytes: counter.load(Ordering::SeqCst) - first_start,
                    repaired: false,
                };
            }
            Err(e) if e.is_checksum_mismatch() && !self.options.strip_digests.is_empty() => {
                info!(
                    "{}: {}; retrying without recorded digests for {:?}",
                    pid, e, self.options.strip_digests
                );
            }
            Err(e) => return Self::failed("ingest at destination failed", e),
        }

        let retry_start = counter.load(Ordering::SeqCst);
        let export = match self.open_export(pid, counter, estimated, true).await {
            Ok(s) => s,
            Err(e) => return Self::failed("export from source failed on retry", e),
        };
        match dest.ingest(Some(pid), export, log_message).await {
            Ok(_) => SyncOutcome::Copied {
                bytes: counter.load(Ordering::SeqCst) - retry_start,
                repaired: true,
            },
            Err(e) => Self::failed("ingest failed after removing checksums", e),
        }
    }

    async fn estimate(&self, pid: &str) -> Option<u64> {
        let archive = self.options.effective_export_context() == ExportContext::Archive && !self.options.archive_xml;
        match estimate_object_size(self.source.client.as_ref(), pid, archive).await {
            Ok(size) => Some(size),
            Err(e) => {
                debug!("Could not estimate the size of {}: {}", pid, e);
                None
            }
        }
    }

    /// Open a source export wrapped in a byte counter, rewritten as the
    /// options (and `strip` for the repair retry) require
    async fn open_export(
        &self,
        pid: &str,
        counter: &Arc<AtomicU64>,
        estimated: Option<u64>,
        strip: bool,
    ) -> Result<ByteStream> {
        let stream = self
            .source
            .client
            .export(pid, self.options.effective_export_context())
            .await?;
        let counter = counter.clone();
        let progress = self.progress.clone();
        let owned_pid = pid.to_string();
        let base = counter.load(Ordering::SeqCst);
        let counted: ByteStream = Box::pin(stream.inspect_ok(move |chunk| {
            let total = counter.fetch_add(chunk.len() as u64, Ordering::SeqCst) + chunk.len() as u64;
            if let Some(progress) = &progress {
                progress(&TransferProgress {
                    pid: &owned_pid,
                    transferred: total - base,
                    estimated,
                });
            }
        }));

        if !strip && !self.options.archive_xml {
            return Ok(counted);
        }
        let stripped = if strip {
            self.options.strip_digests.clone()
        } else {
            BTreeSet::new()
        };
        let mut rewriter = ExportRewriter::new(stripped);
        if self.options.archive_xml {
            let source = self.source.client.clone();
            let credentials = self.options.url_credentials;
            rewriter = rewriter.with_locator(Box::new(
                move |pid: &str, dsid: &str, created: Option<DateTime<Utc>>| {
                    source.content_url(pid, dsid, created, credentials)
                },
            ));
        }
        Ok(rewrite_export(counted, rewriter))
    }
}

/// Humanize a byte count
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.2} GiB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MiB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KiB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
