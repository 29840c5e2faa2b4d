//! Fixity validation
//!
//! Walks a work list of objects, recomputes datastream digests and compares
//! them to what the repository recorded. Runs are bounded by an object count
//! and a wall-clock budget and can be stopped from outside through a
//! [`StopToken`]. After each object the time of the check is written back to
//! the object's RELS-EXT (best effort), so query-derived work lists pick the
//! least recently checked objects first.
//!
//! Every invalid or missing checksum is also handed to the caller as a
//! [`FixityFinding`], which can be written out as a CSV row.

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::checksum::{ChecksumVerdict, is_checkable};
use crate::client::{RepositoryClient, RowStream};
use crate::error::{RepoError, Result};
use crate::model::{DatastreamVersion, format_fedora_time, parse_fedora_time};
use crate::object::DigitalObject;
use crate::profile::uri_to_pid;
use crate::registry::{DEFAULT_TYPE, DatastreamSpec, RELS_EXT_ID, TypeRegistry};
use crate::rels::{self, RelsObject, Statement};

/// Namespace of the last-fixity-check relation
pub const FIXITY_NS: &str = "http://fedsync.dev/ns/fixity#";
const FIXITY_PREFIX: &str = "fedsync";
const FIXITY_PREDICATE: &str = "lastFixityCheck";

/// Marker comment identifying the never-checked work-list query
pub const UNCHECKED_MARKER: &str = "# fedsync:unchecked";
/// Marker comment identifying the every-object work-list query
pub const ALL_OBJECTS_MARKER: &str = "# fedsync:all";
/// Marker comment prefix identifying the stale work-list query; followed by a timestamp
pub const STALE_MARKER: &str = "# fedsync:stale-before ";

/// Last fixity check recorded in a RELS-EXT document
pub fn read_fixity_date(rels: &[u8]) -> Option<DateTime<Utc>> {
    rels::statement_values(rels, FIXITY_PREDICATE)
        .iter()
        .filter_map(|v| parse_fedora_time(v).ok())
        .max()
}

/// Objects never checked, least recently modified first
pub fn unchecked_query() -> String {
    format!(
        "{}\n\
         SELECT ?pid WHERE {{\n\
         \x20 ?pid <info:fedora/fedora-system:def/model#hasModel> <info:fedora/fedora-system:FedoraObject-3.0> ;\n\
         \x20      <info:fedora/fedora-system:def/view#lastModifiedDate> ?modified .\n\
         \x20 OPTIONAL {{ ?pid <{}{}> ?checked }}\n\
         \x20 FILTER(!bound(?checked))\n\
         }} ORDER BY ASC(?modified)",
        UNCHECKED_MARKER, FIXITY_NS, FIXITY_PREDICATE
    )
}

/// Every object in the repository, least recently modified first
pub fn all_objects_query() -> String {
    format!(
        "{}\n\
         SELECT ?pid WHERE {{\n\
         \x20 ?pid <info:fedora/fedora-system:def/model#hasModel> <info:fedora/fedora-system:FedoraObject-3.0> ;\n\
         \x20      <info:fedora/fedora-system:def/view#lastModifiedDate> ?modified .\n\
         }} ORDER BY ASC(?modified)",
        ALL_OBJECTS_MARKER
    )
}

/// Objects last checked before `before`, least recently modified first
pub fn stale_query(before: DateTime<Utc>) -> String {
    let ts = format_fedora_time(&before);
    format!(
        "{}{}\n\
         SELECT ?pid WHERE {{\n\
         \x20 ?pid <{}{}> ?checked ;\n\
         \x20      <info:fedora/fedora-system:def/view#lastModifiedDate> ?modified .\n\
         \x20 FILTER(?checked < xsd:dateTime('{}'))\n\
         }} ORDER BY ASC(?modified)",
        STALE_MARKER, ts, FIXITY_NS, FIXITY_PREDICATE, ts
    )
}

/// Cooperative stop signal shared between a run and whatever hosts it.
///
/// The first [`signal`](StopToken::signal) asks the run to stop after the
/// object in progress; the second asks it to stop between datastream checks.
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicUsize>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the stop level; returns how many times it has been signalled
    pub fn signal(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst) >= 1
    }

    pub fn aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst) >= 2
    }
}

/// Objects to validate
#[derive(Debug, Clone)]
pub enum WorkList {
    /// Exactly these pids, in this order
    Pids(Vec<String>),
    /// Never-checked objects, then objects last checked before the threshold
    Query { stale_before: DateTime<Utc> },
    /// Every object in the repository
    All,
}

/// Lazily yields pids; each query runs once, when the previous one is used up
pub(crate) struct PidSource {
    explicit: VecDeque<String>,
    queries: VecDeque<String>,
    rows: Option<RowStream>,
    seen: HashSet<String>,
}

impl PidSource {
    pub(crate) fn new(work: WorkList) -> Self {
        match work {
            WorkList::Pids(pids) => Self {
                explicit: pids.into(),
                queries: VecDeque::new(),
                rows: None,
                seen: HashSet::new(),
            },
            WorkList::Query { stale_before } => Self::queries(vec![unchecked_query(), stale_query(stale_before)]),
            WorkList::All => Self::queries(vec![all_objects_query()]),
        }
    }

    fn queries(queries: Vec<String>) -> Self {
        Self {
            explicit: VecDeque::new(),
            queries: queries.into(),
            rows: None,
            seen: HashSet::new(),
        }
    }

    pub(crate) async fn next(&mut self, client: &dyn RepositoryClient) -> Result<Option<String>> {
        if let Some(pid) = self.explicit.pop_front() {
            return Ok(Some(pid));
        }
        loop {
            if let Some(rows) = self.rows.as_mut() {
                match rows.try_next().await? {
                    Some(row) => {
                        let pid = match row.get("pid") {
                            Some(uri) => uri_to_pid(uri).to_string(),
                            None => continue,
                        };
                        if self.seen.insert(pid.clone()) {
                            return Ok(Some(pid));
                        }
                        continue;
                    }
                    None => self.rows = None,
                }
            }
            match self.queries.pop_front() {
                Some(query) => {
                    debug!("Running work-list query:\n{}", query);
                    self.rows = Some(client.query(&query).await?);
                }
                None => return Ok(None),
            }
        }
    }
}

/// Limits and behavior of a validation run
#[derive(Debug, Clone)]
pub struct FixityOptions {
    /// Check every version instead of only the current one
    pub all_versions: bool,
    pub max_objects: Option<u64>,
    pub time_limit: Option<Duration>,
    /// Write the check time back to each object
    pub record_checks: bool,
    /// Suppress per-datastream output lines
    pub quiet: bool,
}

impl Default for FixityOptions {
    fn default() -> Self {
        Self {
            all_versions: false,
            max_objects: None,
            time_limit: None,
            record_checks: true,
            quiet: false,
        }
    }
}

impl FixityOptions {
    pub fn with_all_versions(mut self, all: bool) -> Self {
        self.all_versions = all;
        self
    }

    pub fn with_max_objects(mut self, max: u64) -> Self {
        self.max_objects = Some(max);
        self
    }

    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    pub fn with_record_checks(mut self, record: bool) -> Self {
        self.record_checks = record;
        self
    }

    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }
}

/// Counters of a validation run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FixityStats {
    pub objects: u64,
    pub datastreams: u64,
    pub versions: u64,
    pub invalid: u64,
    /// Versions with no usable recorded digest
    pub missing: u64,
    /// Objects whose check time could not be recorded
    pub save_errors: u64,
    /// Objects that could not be checked
    pub errors: u64,
}

impl FixityStats {
    pub fn summary(&self) -> String {
        let mut out = format!(
            "Tested {} version(s) of {} datastream(s) on {} object(s)\n\
             Found {} invalid checksum(s)\n\
             Found {} datastream(s) with no checksum\n\
             Error saving fixity date on {} object(s)",
            self.versions, self.datastreams, self.objects, self.invalid, self.missing, self.save_errors
        );
        if self.errors > 0 {
            out.push_str(&format!("\nError checking {} object(s)", self.errors));
        }
        out
    }
}

/// Why a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// Work list used up
    Exhausted,
    Interrupted,
    MaxObjects,
    TimeLimit,
    /// Second stop signal; the object in progress was left unfinished
    Aborted,
    /// The work list could not be read further
    WorkListFailed,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            TerminationReason::Exhausted => "all objects processed",
            TerminationReason::Interrupted => "interrupted",
            TerminationReason::MaxObjects => "maximum object count reached",
            TerminationReason::TimeLimit => "time limit exceeded",
            TerminationReason::Aborted => "aborted",
            TerminationReason::WorkListFailed => "work list could not be read",
        };
        f.write_str(text)
    }
}

/// What was wrong with a datastream version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingStatus {
    Invalid,
    Missing,
}

impl FindingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingStatus::Invalid => "invalid",
            FindingStatus::Missing => "missing",
        }
    }
}

/// One datastream version with an invalid or missing checksum
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FixityFinding {
    pub pid: String,
    pub dsid: String,
    pub created: DateTime<Utc>,
    pub status: FindingStatus,
    pub mimetype: String,
    pub versionable: bool,
}

/// Column names of the findings CSV
pub const FINDINGS_CSV_HEADER: [&str; 6] = ["pid", "datastream id", "date created", "status", "mimetype", "versioned"];

impl FixityFinding {
    /// The finding as a CSV line, every field quoted
    pub fn csv_row(&self) -> String {
        csv_line(&[
            &self.pid,
            &self.dsid,
            &format_fedora_time(&self.created),
            self.status.as_str(),
            &self.mimetype,
            if self.versionable { "true" } else { "false" },
        ])
    }
}

/// Join fields into one CSV line, quoting all of them
pub fn csv_line(fields: &[&str]) -> String {
    fields
        .iter()
        .map(|f| format!("\"{}\"", f.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug, Clone, Serialize)]
pub struct FixityReport {
    pub stats: FixityStats,
    pub termination: TerminationReason,
    pub elapsed_secs: f64,
}

/// Validates datastream checksums across a work list of objects
pub struct FixityValidator {
    client: Arc<dyn RepositoryClient>,
    registry: TypeRegistry,
    options: FixityOptions,
    stop: StopToken,
}

impl FixityValidator {
    pub fn new(client: Arc<dyn RepositoryClient>, options: FixityOptions) -> Self {
        Self {
            client,
            registry: TypeRegistry::new(),
            options,
            stop: StopToken::new(),
        }
    }

    pub fn with_stop_token(mut self, stop: StopToken) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    /// Run over the work list. Per-object failures are counted and logged;
    /// the report is always returned.
    pub async fn run(&self, work: WorkList, out: &mut (dyn Write + Send)) -> FixityReport {
        self.run_with_findings(work, out, &mut |_| {}).await
    }

    /// Like [`run`](Self::run), also passing every invalid or missing
    /// checksum to `on_finding`
    pub async fn run_with_findings(
        &self,
        work: WorkList,
        out: &mut (dyn Write + Send),
        on_finding: &mut (dyn FnMut(FixityFinding) + Send),
    ) -> FixityReport {
        let start = Instant::now();
        let mut stats = FixityStats::default();
        let mut processed = 0u64;
        let mut source = PidSource::new(work);

        let termination = loop {
            let pid = match source.next(self.client.as_ref()).await {
                Ok(Some(pid)) => pid,
                Ok(None) => break TerminationReason::Exhausted,
                Err(e) => {
                    error!("Failed to read work list: {}", e);
                    stats.errors += 1;
                    break TerminationReason::WorkListFailed;
                }
            };

            let mut obj = match DigitalObject::bind(self.client.clone(), &self.registry, DEFAULT_TYPE, &pid) {
                Ok(obj) => obj,
                Err(e) => {
                    error!("Error checking {}: {}", pid, e);
                    stats.errors += 1;
                    continue;
                }
            };

            let (aborted, vanished) = match self.check_object(&mut obj, &pid, &mut stats, out, on_finding).await {
                Ok(aborted) => (aborted, false),
                Err(e) => {
                    error!("Error checking {}: {}", pid, e);
                    stats.errors += 1;
                    (false, e.is_not_found())
                }
            };
            processed += 1;
            if aborted {
                break TerminationReason::Aborted;
            }

            // nothing to record on an object that is not there
            if self.options.record_checks && !vanished {
                if let Err(e) = self.record_check(&mut obj, &pid).await {
                    warn!("{}", e);
                    stats.save_errors += 1;
                }
            }

            if self.stop.aborted() {
                break TerminationReason::Aborted;
            }
            if self.stop.stop_requested() {
                break TerminationReason::Interrupted;
            }
            if self.options.max_objects.is_some_and(|max| processed >= max) {
                break TerminationReason::MaxObjects;
            }
            if self.options.time_limit.is_some_and(|limit| start.elapsed() >= limit) {
                break TerminationReason::TimeLimit;
            }
        };

        info!("Fixity run finished ({}) after {} object(s)", termination, processed);
        FixityReport {
            stats,
            termination,
            elapsed_secs: start.elapsed().as_secs_f64(),
        }
    }

    /// Check every datastream of one object; returns true when aborted midway
    async fn check_object(
        &self,
        obj: &mut DigitalObject,
        pid: &str,
        stats: &mut FixityStats,
        out: &mut (dyn Write + Send),
        on_finding: &mut (dyn FnMut(FixityFinding) + Send),
    ) -> Result<bool> {
        let dsids = self.client.get_datastream_ids(pid).await?;
        stats.objects += 1;
        debug!("Checking {} ({} datastreams)", pid, dsids.len());

        for dsid in dsids {
            if self.stop.aborted() {
                return Ok(true);
            }
            if obj.datastream(&dsid).is_none() {
                obj.add_datastream(&DatastreamSpec::new(dsid.clone(), ""))?;
            }
            let tracker = obj
                .datastream(&dsid)
                .ok_or_else(|| RepoError::NotFound(format!("{}/{}", pid, dsid)))?;

            let versions: Vec<(DatastreamVersion, Option<DateTime<Utc>>)> = if self.options.all_versions {
                self.client
                    .get_datastream_history(pid, &dsid)
                    .await?
                    .into_iter()
                    .map(|v| {
                        let as_of = Some(v.created);
                        (v, as_of)
                    })
                    .collect()
            } else {
                match tracker.version().await? {
                    Some(v) => vec![(v.clone(), None)],
                    None => continue,
                }
            };
            stats.datastreams += 1;

            for (version, as_of) in versions {
                stats.versions += 1;
                let created = format_fedora_time(&version.created);
                let status = if !is_checkable(&version) {
                    stats.missing += 1;
                    if !self.options.quiet {
                        writeln!(out, "{}/{} has no checksum ({})", pid, dsid, created)?;
                    }
                    FindingStatus::Missing
                } else if tracker.validate_checksum(as_of).await?.verdict == ChecksumVerdict::Invalid {
                    stats.invalid += 1;
                    if !self.options.quiet {
                        writeln!(out, "{}/{} has an invalid checksum ({})", pid, dsid, created)?;
                    }
                    FindingStatus::Invalid
                } else {
                    continue;
                };
                tracker.ensure_loaded().await?;
                on_finding(FixityFinding {
                    pid: pid.to_string(),
                    dsid: dsid.clone(),
                    created: version.created,
                    status,
                    mimetype: version.mimetype.clone(),
                    versionable: tracker.descriptor().versionable,
                });
            }
        }
        Ok(false)
    }

    /// Write the check time into RELS-EXT and save
    async fn record_check(&self, obj: &mut DigitalObject, pid: &str) -> Result<()> {
        let persist = |source: RepoError| RepoError::Persistence {
            pid: pid.to_string(),
            source: Box::new(source),
        };
        let statement = Statement {
            prefix: FIXITY_PREFIX.to_string(),
            namespace: FIXITY_NS.to_string(),
            name: FIXITY_PREDICATE.to_string(),
            object: RelsObject::Literal(format_fedora_time(&Utc::now())),
        };

        let rels_ds = obj
            .datastream(RELS_EXT_ID)
            .ok_or_else(|| persist(RepoError::NotFound(RELS_EXT_ID.to_string())))?;
        let current = rels_ds.get_content().await.map_err(persist)?;
        let updated = rels::set_statement(&current, pid, &statement, true).map_err(persist)?;
        rels_ds.set_content(updated);
        obj.save(Some("Recording fixity check")).await.map_err(persist)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_stop_token_levels() {
        let token = StopToken::new();
        let shared = token.clone();
        assert!(!token.stop_requested());
        assert_eq!(shared.signal(), 1);
        assert!(token.stop_requested());
        assert!(!token.aborted());
        shared.signal();
        assert!(token.aborted());
    }

    #[test]
    fn test_queries_carry_markers() {
        assert!(unchecked_query().starts_with(UNCHECKED_MARKER));
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let q = stale_query(ts);
        let first = q.lines().next().unwrap();
        assert_eq!(first.strip_prefix(STALE_MARKER), Some("2024-01-01T00:00:00.000Z"));
    }

    #[test]
    fn test_read_fixity_date() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let statement = Statement {
            prefix: FIXITY_PREFIX.to_string(),
            namespace: FIXITY_NS.to_string(),
            name: FIXITY_PREDICATE.to_string(),
            object: RelsObject::Literal(format_fedora_time(&ts)),
        };
        let rels = rels::set_statement(b"", "test:1", &statement, true).unwrap();
        assert_eq!(read_fixity_date(rels.as_bytes()), Some(ts));
        assert_eq!(read_fixity_date(b""), None);
    }

    #[test]
    fn test_all_objects_query_carries_marker() {
        assert_eq!(all_objects_query().lines().next(), Some(ALL_OBJECTS_MARKER));
    }

    #[test]
    fn test_finding_csv_row() {
        let finding = FixityFinding {
            pid: "test:1".to_string(),
            dsid: "IMAGE".to_string(),
            created: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            status: FindingStatus::Invalid,
            mimetype: "image/tiff; name=\"a\"".to_string(),
            versionable: false,
        };
        assert_eq!(
            finding.csv_row(),
            r#""test:1","IMAGE","2024-03-01T12:00:00.000Z","invalid","image/tiff; name=""a""","false""#
        );
        assert_eq!(
            csv_line(&FINDINGS_CSV_HEADER),
            r#""pid","datastream id","date created","status","mimetype","versioned""#
        );
    }

    #[test]
    fn test_summary() {
        let stats = FixityStats {
            objects: 2,
            datastreams: 4,
            versions: 4,
            invalid: 2,
            ..Default::default()
        };
        let summary = stats.summary();
        assert!(summary.contains("on 2 object(s)"));
        assert!(summary.contains("Found 2 invalid checksum(s)"));
        assert!(!summary.contains("Error checking"));
    }
}
