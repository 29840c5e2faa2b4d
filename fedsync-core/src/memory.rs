//! In-process repository
//!
//! [`MemoryRepository`] implements [`RepositoryClient`] entirely in memory:
//! objects are kept as parsed FOXML records with full version history,
//! ingest verifies recorded digests, and exports produce real FOXML. Faults
//! can be injected per object or datastream, and every remote-style call is
//! counted so callers can assert on what was (not) sent.
//!
//! Resource-index queries are limited to the work-list queries issued by the
//! fixity validator and the checksum repairer, recognized by their leading
//! marker comment.
//!
//! Uploaded content is held under `uploaded://N` ids until an ingest or a
//! commit references it.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use std::collections::{BTreeMap, HashSet};
use tokio::sync::RwLock;

use crate::checksum::digest_bytes;
use crate::client::{
    ByteStream, ContentSource, DatastreamContent, DatastreamInfo, DatastreamUpdate, ExportContext, QueryRow,
    RepositoryClient, RowStream, collect_bytes,
};
use crate::error::{RepoError, Result};
use crate::fixity::{ALL_OBJECTS_MARKER, STALE_MARKER, UNCHECKED_MARKER, read_fixity_date};
use crate::foxml::{self, FoxmlContent, FoxmlDatastream, FoxmlDigest, FoxmlObject, FoxmlProperties, FoxmlVersion};
use crate::model::{
    ChecksumAlgorithm, ControlGroup, DatastreamDescriptor, DatastreamVersion, ObjectProfile, VersionRef,
    format_fedora_time, parse_fedora_time,
};
use crate::registry::RELS_EXT_ID;

/// Chunk size used when streaming exports and content
const CHUNK_SIZE: usize = 8 * 1024;

/// Prefix of ids handed out by `upload`
pub const UPLOAD_SCHEME: &str = "uploaded://";

/// Counters of calls received, by kind
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallCounts {
    /// `add_datastream` + `modify_datastream`
    pub commits: usize,
    pub ingests: usize,
    pub exports: usize,
    pub purges: usize,
    pub queries: usize,
    pub uploads: usize,
    /// Bytes handed out through `export`
    pub bytes_exported: u64,
}

#[derive(Debug, Clone)]
struct StoredVersion {
    version: DatastreamVersion,
    content: Bytes,
}

#[derive(Debug, Clone)]
struct StoredDatastream {
    descriptor: DatastreamDescriptor,
    /// Oldest first
    versions: Vec<StoredVersion>,
    next_version: u32,
}

impl StoredDatastream {
    fn current(&self) -> Option<&StoredVersion> {
        self.versions.last()
    }

    fn as_of(&self, ts: Option<DateTime<Utc>>) -> Option<&StoredVersion> {
        match ts {
            Some(ts) => self.versions.iter().rev().find(|v| v.version.created <= ts),
            None => self.current(),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    profile: ObjectProfile,
    datastreams: Vec<StoredDatastream>,
}

impl StoredObject {
    fn datastream(&self, dsid: &str) -> Option<&StoredDatastream> {
        self.datastreams.iter().find(|ds| ds.descriptor.id == dsid)
    }

    fn datastream_mut(&mut self, dsid: &str) -> Option<&mut StoredDatastream> {
        self.datastreams.iter_mut().find(|ds| ds.descriptor.id == dsid)
    }

    fn fixity_date(&self) -> Option<DateTime<Utc>> {
        let rels = self.datastream(RELS_EXT_ID)?.current()?;
        read_fixity_date(&rels.content)
    }
}

#[derive(Debug, Default)]
struct Faults {
    commits: HashSet<(String, String)>,
    purges: HashSet<String>,
    exports: HashSet<String>,
    queries: bool,
}

#[derive(Debug)]
struct State {
    objects: BTreeMap<String, StoredObject>,
    next_pid: u64,
    clock: DateTime<Utc>,
    faults: Faults,
    calls: CallCounts,
    uploads: BTreeMap<String, Bytes>,
    next_upload: u64,
}

impl State {
    /// Strictly increasing millisecond timestamps
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now().trunc_subsecs(3);
        let next = if now > self.clock {
            now
        } else {
            self.clock + Duration::milliseconds(1)
        };
        self.clock = next;
        next
    }

    fn object(&self, pid: &str) -> Result<&StoredObject> {
        self.objects
            .get(pid)
            .ok_or_else(|| RepoError::NotFound(format!("objects/{}", pid)))
    }

    fn object_mut(&mut self, pid: &str) -> Result<&mut StoredObject> {
        self.objects
            .get_mut(pid)
            .ok_or_else(|| RepoError::NotFound(format!("objects/{}", pid)))
    }

    /// Content staged under an upload id; `None` for ordinary URLs.
    /// An upload can be referenced once.
    fn take_upload(&mut self, reference: &str) -> Result<Option<Bytes>> {
        if !reference.starts_with(UPLOAD_SCHEME) {
            return Ok(None);
        }
        self.uploads
            .remove(reference)
            .map(Some)
            .ok_or_else(|| RepoError::RequestFailed {
                status: 400,
                detail: format!("Unknown upload id {}", reference),
            })
    }
}

/// Repository held entirely in process memory
pub struct MemoryRepository {
    name: String,
    namespace: String,
    normalize_inline_xml: bool,
    state: RwLock<State>,
}

impl MemoryRepository {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: "fedsync".to_string(),
            normalize_inline_xml: false,
            state: RwLock::new(State {
                objects: BTreeMap::new(),
                next_pid: 1,
                clock: DateTime::<Utc>::MIN_UTC,
                faults: Faults::default(),
                calls: CallCounts::default(),
                uploads: BTreeMap::new(),
                next_upload: 1,
            }),
        }
    }

    /// Namespace used for server-allocated pids
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    /// Re-serialize inline XML on store, the way some repositories reformat
    /// it; digests recorded elsewhere over the original bytes then no longer
    /// match.
    pub fn with_inline_xml_normalization(mut self) -> Self {
        self.normalize_inline_xml = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Make every commit of `dsid` on `pid` fail
    pub async fn fail_commit(&self, pid: &str, dsid: &str) {
        self.state
            .write()
            .await
            .faults
            .commits
            .insert((pid.to_string(), dsid.to_string()));
    }

    pub async fn fail_purge(&self, pid: &str) {
        self.state.write().await.faults.purges.insert(pid.to_string());
    }

    pub async fn fail_export(&self, pid: &str) {
        self.state.write().await.faults.exports.insert(pid.to_string());
    }

    /// Make every resource-index query fail
    pub async fn fail_queries(&self) {
        self.state.write().await.faults.queries = true;
    }

    pub async fn clear_faults(&self) {
        self.state.write().await.faults = Faults::default();
    }

    pub async fn calls(&self) -> CallCounts {
        self.state.read().await.calls.clone()
    }

    pub async fn contains(&self, pid: &str) -> bool {
        self.state.read().await.objects.contains_key(pid)
    }

    pub async fn pids(&self) -> Vec<String> {
        self.state.read().await.objects.keys().cloned().collect()
    }

    /// Uploads not yet referenced by an ingest or commit
    pub async fn pending_uploads(&self) -> usize {
        self.state.read().await.uploads.len()
    }

    /// Current content of a datastream, without counting as a call
    pub async fn datastream_content(&self, pid: &str, dsid: &str) -> Option<Bytes> {
        let state = self.state.read().await;
        let ds = state.objects.get(pid)?.datastream(dsid)?;
        ds.current().map(|v| v.content.clone())
    }

    /// Overwrite the digest recorded for the current version of a datastream,
    /// leaving its content alone (simulates stored content going bad)
    pub async fn set_recorded_digest(&self, pid: &str, dsid: &str, digest: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let obj = state.object_mut(pid)?;
        let version = obj
            .datastream_mut(dsid)
            .and_then(|ds| ds.versions.last_mut())
            .ok_or_else(|| RepoError::NotFound(format!("objects/{}/datastreams/{}", pid, dsid)))?;
        version.version.digest = Some(digest.to_ascii_lowercase());
        Ok(())
    }

    /// Record a datastream as unchecked: checksum type `DISABLED` and no
    /// digest on any version
    pub async fn disable_checksums(&self, pid: &str, dsid: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let ds = state
            .object_mut(pid)?
            .datastream_mut(dsid)
            .ok_or_else(|| RepoError::NotFound(format!("objects/{}/datastreams/{}", pid, dsid)))?;
        ds.descriptor.checksum_type = ChecksumAlgorithm::Disabled;
        for v in &mut ds.versions {
            v.version.algorithm = Some(ChecksumAlgorithm::Disabled);
            v.version.digest = None;
        }
        Ok(())
    }

    /// Pretend the object was last modified at `ts`
    pub async fn set_modified(&self, pid: &str, ts: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().await;
        state.object_mut(pid)?.profile.modified = Some(ts);
        Ok(())
    }

    /// Serialize an object in the requested context
    async fn serialize(&self, pid: &str, _context: ExportContext) -> Result<Vec<u8>> {
        let state = self.state.read().await;
        let obj = state.object(pid)?;
        let foxml = FoxmlObject {
            pid: Some(obj.profile.pid.clone()),
            properties: FoxmlProperties {
                state: obj.profile.state,
                label: obj.profile.label.clone(),
                owner: obj.profile.owner.clone(),
                created: obj.profile.created,
                modified: obj.profile.modified,
            },
            datastreams: obj.datastreams.iter().map(export_datastream).collect(),
        };
        foxml::write_object(&foxml)
    }

    fn store_content(&self, control_group: ControlGroup, content: Bytes) -> Bytes {
        if self.normalize_inline_xml && control_group == ControlGroup::Inline {
            normalize_xml(&content)
        } else {
            content
        }
    }

    /// Build a stored object from a parsed ingest document, verifying digests
    fn import(&self, pid: &str, doc: FoxmlObject, state: &mut State) -> Result<StoredObject> {
        let now = state.tick();
        let mut datastreams = Vec::new();
        let mut latest = now;

        for ds in doc.datastreams {
            let mut stored = StoredDatastream {
                descriptor: DatastreamDescriptor {
                    id: ds.id.clone(),
                    label: String::new(),
                    mimetype: String::new(),
                    versionable: ds.versionable,
                    control_group: ds.control_group,
                    checksum_type: ChecksumAlgorithm::Disabled,
                    format_uri: None,
                    state: ds.state,
                },
                versions: Vec::new(),
                next_version: 0,
            };

            for v in ds.versions {
                let (content, location) = match v.content {
                    FoxmlContent::Xml(xml) => (self.store_content(ds.control_group, Bytes::from(xml)), None),
                    FoxmlContent::Binary(data) => (data, None),
                    FoxmlContent::Location { reference, .. } => match state.take_upload(&reference)? {
                        Some(data) => (data, None),
                        None => (Bytes::new(), Some(reference)),
                    },
                    FoxmlContent::Empty => (Bytes::new(), None),
                };
                let (algorithm, digest) = if location.is_some() {
                    // remote content is not fetched, so the recorded digest stands
                    recorded_ingest_digest(v.digest.as_ref())
                } else {
                    verify_ingest_digest(&ds.id, v.digest.as_ref(), &content)?
                };
                let created = v.created.unwrap_or_else(|| state.tick());
                latest = latest.max(created);

                stored.descriptor.label = v.label.clone().unwrap_or_default();
                stored.descriptor.mimetype = v.mimetype.clone();
                stored.descriptor.format_uri = v.format_uri.clone();
                stored.descriptor.checksum_type = algorithm.unwrap_or(ChecksumAlgorithm::Disabled);
                stored.next_version += 1;
                stored.versions.push(StoredVersion {
                    version: DatastreamVersion {
                        dsid: ds.id.clone(),
                        version_id: v.id,
                        label: v.label.unwrap_or_default(),
                        mimetype: v.mimetype,
                        created,
                        size: content.len() as u64,
                        digest,
                        algorithm,
                        location,
                    },
                    content,
                });
            }
            datastreams.push(stored);
        }

        let mut obj = StoredObject {
            profile: ObjectProfile {
                pid: pid.to_string(),
                label: doc.properties.label,
                owner: doc.properties.owner,
                state: doc.properties.state,
                created: Some(doc.properties.created.unwrap_or(now)),
                modified: Some(doc.properties.modified.map(|m| m.max(latest)).unwrap_or(latest)),
                content_models: Vec::new(),
            },
            datastreams,
        };
        obj.profile.content_models = obj
            .datastream(RELS_EXT_ID)
            .and_then(|ds| ds.current())
            .map(|v| content_models(&v.content))
            .unwrap_or_default();
        Ok(obj)
    }

    /// Append (or, for non-versionable datastreams, replace) a version
    fn commit_version(
        &self,
        state: &mut State,
        pid: &str,
        dsid: &str,
        descriptor: Option<&DatastreamDescriptor>,
        update: DatastreamUpdate,
    ) -> Result<VersionRef> {
        state.calls.commits += 1;
        if state.faults.commits.contains(&(pid.to_string(), dsid.to_string())) {
            return Err(RepoError::RequestFailed {
                status: 500,
                detail: format!("Injected failure committing {}/{}", pid, dsid),
            });
        }
        let uploaded = match &update.content {
            Some(ContentSource::Location(url)) => state.take_upload(url)?,
            _ => None,
        };
        let created = state.tick();
        let obj = state.object_mut(pid)?;

        if let Some(descriptor) = descriptor {
            if obj.datastream(dsid).is_some() {
                return Err(RepoError::RequestFailed {
                    status: 400,
                    detail: format!("Datastream {} already exists on {}", dsid, pid),
                });
            }
            obj.datastreams.push(StoredDatastream {
                descriptor: descriptor.clone(),
                versions: Vec::new(),
                next_version: 0,
            });
        }

        let normalize = self.normalize_inline_xml;
        let ds = obj
            .datastream_mut(dsid)
            .ok_or_else(|| RepoError::NotFound(format!("objects/{}/datastreams/{}", pid, dsid)))?;

        if let Some(label) = update.label {
            ds.descriptor.label = label;
        }
        if let Some(mimetype) = update.mimetype {
            ds.descriptor.mimetype = mimetype;
        }
        if let Some(alg) = update.checksum_type {
            ds.descriptor.checksum_type = alg;
        }
        let previous = ds.current().cloned();
        let (content, location) = match update.content {
            Some(ContentSource::Bytes(data)) => {
                if normalize && ds.descriptor.control_group == ControlGroup::Inline {
                    (normalize_xml(&data), None)
                } else {
                    (data, None)
                }
            }
            Some(ContentSource::Location(url)) => match uploaded {
                Some(data) => (data, None),
                None => (Bytes::new(), Some(url)),
            },
            Some(ContentSource::Stream { .. }) => {
                return Err(RepoError::Invalid("Streamed content must be collected before commit".to_string()));
            }
            None => match &previous {
                Some(p) => (p.content.clone(), p.version.location.clone()),
                None => (Bytes::new(), None),
            },
        };

        // content pulled from a location is not held here, so nothing to digest
        let algorithm = match ds.descriptor.checksum_type {
            ChecksumAlgorithm::Disabled => None,
            _ if location.is_some() => None,
            alg => Some(alg),
        };
        let version = DatastreamVersion {
            dsid: dsid.to_string(),
            version_id: format!("{}.{}", dsid, ds.next_version),
            label: ds.descriptor.label.clone(),
            mimetype: ds.descriptor.mimetype.clone(),
            created,
            size: content.len() as u64,
            digest: algorithm.and_then(|alg| digest_bytes(alg, &content)),
            algorithm: Some(ds.descriptor.checksum_type),
            location,
        };
        ds.next_version += 1;
        let version_ref = version.version_ref();
        let stored = StoredVersion { version, content };
        if ds.descriptor.versionable || ds.versions.is_empty() {
            ds.versions.push(stored);
        } else if let Some(last) = ds.versions.last_mut() {
            *last = stored;
        }

        if dsid == RELS_EXT_ID {
            let models = ds.current().map(|v| content_models(&v.content)).unwrap_or_default();
            obj.profile.content_models = models;
        }
        obj.profile.modified = Some(created);
        Ok(version_ref)
    }
}

/// Algorithm and digest recorded for content that is not held locally
fn recorded_ingest_digest(recorded: Option<&FoxmlDigest>) -> (Option<ChecksumAlgorithm>, Option<String>) {
    match recorded {
        Some(r) => (
            ChecksumAlgorithm::from_name(&r.algorithm),
            r.digest
                .as_deref()
                .map(str::trim)
                .filter(|d| !d.eq_ignore_ascii_case("none"))
                .map(str::to_ascii_lowercase),
        ),
        None => (None, None),
    }
}

/// Check a recorded ingest digest against the content, the way the
/// repository does on ingest
fn verify_ingest_digest(
    dsid: &str,
    recorded: Option<&FoxmlDigest>,
    content: &[u8],
) -> Result<(Option<ChecksumAlgorithm>, Option<String>)> {
    let recorded = match recorded {
        Some(r) => r,
        None => return Ok((None, None)),
    };
    let algorithm = match ChecksumAlgorithm::from_name(&recorded.algorithm) {
        Some(ChecksumAlgorithm::Disabled) => return Ok((Some(ChecksumAlgorithm::Disabled), None)),
        Some(alg) => alg,
        None => {
            return Err(RepoError::RequestFailed {
                status: 400,
                detail: format!("Unknown checksum type {} on {}", recorded.algorithm, dsid),
            });
        }
    };
    let computed = digest_bytes(algorithm, content);
    if let (Some(expected), Some(actual)) = (recorded.digest.as_deref(), computed.as_deref()) {
        let expected = expected.trim();
        if !expected.eq_ignore_ascii_case("none") && !expected.eq_ignore_ascii_case(actual) {
            return Err(RepoError::checksum_mismatch(&format!(
                "org.fcrepo.server.errors.ValidationException: Checksum Mismatch: {} ({})",
                expected, dsid
            )));
        }
    }
    Ok((Some(algorithm), computed))
}

fn export_datastream(ds: &StoredDatastream) -> FoxmlDatastream {
    FoxmlDatastream {
        id: ds.descriptor.id.clone(),
        control_group: ds.descriptor.control_group,
        state: ds.descriptor.state,
        versionable: ds.descriptor.versionable,
        versions: ds
            .versions
            .iter()
            .map(|v| FoxmlVersion {
                id: v.version.version_id.clone(),
                label: Some(v.version.label.clone()),
                created: Some(v.version.created),
                mimetype: v.version.mimetype.clone(),
                format_uri: ds.descriptor.format_uri.clone(),
                size: Some(v.version.size),
                digest: v.version.algorithm.map(|alg| FoxmlDigest {
                    algorithm: alg.name().to_string(),
                    digest: v.version.digest.clone(),
                }),
                content: match (&v.version.location, ds.descriptor.control_group) {
                    (Some(reference), _) => FoxmlContent::Location {
                        reference: reference.clone(),
                        kind: "URL".to_string(),
                    },
                    (None, ControlGroup::Inline) => FoxmlContent::Xml(String::from_utf8_lossy(&v.content).into_owned()),
                    (None, _) => FoxmlContent::Binary(v.content.clone()),
                },
            })
            .collect(),
    }
}

/// Collapse inter-element whitespace and trim each line
fn normalize_xml(content: &[u8]) -> Bytes {
    let text = String::from_utf8_lossy(content);
    let joined: String = text.lines().map(str::trim).collect::<Vec<_>>().join("");
    Bytes::from(joined)
}

/// Content-model URIs asserted in RELS-EXT via `hasModel`
fn content_models(rels: &[u8]) -> Vec<String> {
    let mut reader = quick_xml::Reader::from_reader(rels);
    let mut models = Vec::new();
    loop {
        match reader.read_event() {
            Ok(quick_xml::events::Event::Start(e)) | Ok(quick_xml::events::Event::Empty(e))
                if e.local_name().as_ref() == b"hasModel" =>
            {
                for a in e.attributes().flatten() {
                    if a.key.local_name().as_ref() == b"resource" {
                        if let Ok(v) = a.unescape_value() {
                            models.push(v.into_owned());
                        }
                    }
                }
            }
            Ok(quick_xml::events::Event::Eof) | Err(_) => break,
            _ => {}
        }
    }
    models
}

/// Drain streamed content so the commit can run under the state lock
async fn collect_update(mut update: DatastreamUpdate) -> Result<DatastreamUpdate> {
    update.content = match update.content.take() {
        Some(ContentSource::Stream { stream, size }) => {
            let data = collect_bytes(stream).await?;
            check_declared_size(size, &data)?;
            Some(ContentSource::Bytes(data))
        }
        other => other,
    };
    Ok(update)
}

fn check_declared_size(size: Option<u64>, data: &[u8]) -> Result<()> {
    match size {
        Some(size) if size != data.len() as u64 => Err(RepoError::RequestFailed {
            status: 400,
            detail: format!("Content declared {} bytes but sent {}", size, data.len()),
        }),
        _ => Ok(()),
    }
}

fn chunked(data: Bytes) -> ByteStream {
    let chunks: Vec<Result<Bytes>> = (0..data.len())
        .step_by(CHUNK_SIZE)
        .map(|start| Ok(data.slice(start..(start + CHUNK_SIZE).min(data.len()))))
        .collect();
    Box::pin(futures::stream::iter(chunks))
}

#[async_trait]
impl RepositoryClient for MemoryRepository {
    async fn get_object(&self, pid: &str) -> Result<ObjectProfile> {
        Ok(self.state.read().await.object(pid)?.profile.clone())
    }

    async fn get_datastream_ids(&self, pid: &str) -> Result<Vec<String>> {
        let state = self.state.read().await;
        Ok(state
            .object(pid)?
            .datastreams
            .iter()
            .map(|ds| ds.descriptor.id.clone())
            .collect())
    }

    async fn get_datastream_info(&self, pid: &str, dsid: &str) -> Result<DatastreamInfo> {
        let state = self.state.read().await;
        let ds = state
            .object(pid)?
            .datastream(dsid)
            .ok_or_else(|| RepoError::NotFound(format!("objects/{}/datastreams/{}", pid, dsid)))?;
        let version = ds
            .current()
            .ok_or_else(|| RepoError::NotFound(format!("objects/{}/datastreams/{}", pid, dsid)))?;
        Ok(DatastreamInfo {
            descriptor: ds.descriptor.clone(),
            version: version.version.clone(),
        })
    }

    async fn get_datastream_history(&self, pid: &str, dsid: &str) -> Result<Vec<DatastreamVersion>> {
        let state = self.state.read().await;
        let ds = state
            .object(pid)?
            .datastream(dsid)
            .ok_or_else(|| RepoError::NotFound(format!("objects/{}/datastreams/{}", pid, dsid)))?;
        Ok(ds.versions.iter().map(|v| v.version.clone()).collect())
    }

    async fn get_datastream(
        &self,
        pid: &str,
        dsid: &str,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<DatastreamContent> {
        let state = self.state.read().await;
        let version = state
            .object(pid)?
            .datastream(dsid)
            .and_then(|ds| ds.as_of(as_of))
            .ok_or_else(|| RepoError::NotFound(format!("objects/{}/datastreams/{}", pid, dsid)))?;
        Ok(DatastreamContent {
            version: version.version.clone(),
            content: chunked(version.content.clone()),
        })
    }

    async fn add_datastream(
        &self,
        pid: &str,
        descriptor: &DatastreamDescriptor,
        update: DatastreamUpdate,
    ) -> Result<VersionRef> {
        let update = collect_update(update).await?;
        let mut state = self.state.write().await;
        self.commit_version(&mut state, pid, &descriptor.id, Some(descriptor), update)
    }

    async fn modify_datastream(&self, pid: &str, dsid: &str, update: DatastreamUpdate) -> Result<VersionRef> {
        let update = collect_update(update).await?;
        let mut state = self.state.write().await;
        self.commit_version(&mut state, pid, dsid, None, update)
    }

    async fn upload(&self, content: ByteStream, size: Option<u64>) -> Result<String> {
        let data = collect_bytes(content).await?;
        check_declared_size(size, &data)?;
        let mut state = self.state.write().await;
        state.calls.uploads += 1;
        let id = format!("{}{}", UPLOAD_SCHEME, state.next_upload);
        state.next_upload += 1;
        state.uploads.insert(id.clone(), data);
        Ok(id)
    }

    fn content_url(
        &self,
        pid: &str,
        dsid: &str,
        as_of: Option<DateTime<Utc>>,
        _with_credentials: bool,
    ) -> Option<String> {
        let mut url = format!("memory://{}/objects/{}/datastreams/{}/content", self.name, pid, dsid);
        if let Some(ts) = as_of {
            url.push_str("?asOfDateTime=");
            url.push_str(&format_fedora_time(&ts));
        }
        Some(url)
    }

    async fn ingest(
        &self,
        pid: Option<&str>,
        serialization: ByteStream,
        _log_message: Option<&str>,
    ) -> Result<String> {
        let data = collect_bytes(serialization).await?;
        let doc = foxml::parse_object(&data)?;

        let mut state = self.state.write().await;
        state.calls.ingests += 1;
        let pid = match pid.map(str::to_string).or_else(|| doc.pid.clone()) {
            Some(pid) => pid,
            None => {
                let n = state.next_pid;
                state.next_pid += 1;
                format!("{}:{}", self.namespace, n)
            }
        };
        if state.objects.contains_key(&pid) {
            return Err(RepoError::RequestFailed {
                status: 500,
                detail: format!("The PID '{}' already exists in the registry; the object can't be re-created", pid),
            });
        }

        let obj = self.import(&pid, doc, &mut state)?;
        state.objects.insert(pid.clone(), obj);
        tracing::debug!("[{}] ingested {}", self.name, pid);
        Ok(pid)
    }

    async fn export(&self, pid: &str, context: ExportContext) -> Result<ByteStream> {
        {
            let mut state = self.state.write().await;
            state.calls.exports += 1;
            if state.faults.exports.contains(pid) {
                return Err(RepoError::RequestFailed {
                    status: 500,
                    detail: format!("Injected failure exporting {}", pid),
                });
            }
        }
        let data = Bytes::from(self.serialize(pid, context).await?);
        self.state.write().await.calls.bytes_exported += data.len() as u64;
        Ok(chunked(data))
    }

    async fn purge_object(&self, pid: &str, _log_message: Option<&str>) -> Result<()> {
        let mut state = self.state.write().await;
        state.calls.purges += 1;
        if state.faults.purges.contains(pid) {
            return Err(RepoError::RequestFailed {
                status: 500,
                detail: format!("Injected failure purging {}", pid),
            });
        }
        state
            .objects
            .remove(pid)
            .map(|_| ())
            .ok_or_else(|| RepoError::NotFound(format!("objects/{}", pid)))
    }

    async fn query(&self, query: &str) -> Result<RowStream> {
        let mut state = self.state.write().await;
        state.calls.queries += 1;
        if state.faults.queries {
            return Err(RepoError::Transport("Injected failure running query".to_string()));
        }

        let marker = query
            .lines()
            .map(str::trim)
            .find(|l| l.starts_with("# fedsync:"))
            .ok_or_else(|| RepoError::RequestFailed {
                status: 400,
                detail: "Unsupported query".to_string(),
            })?;

        let mut matches: Vec<&StoredObject> = if marker == ALL_OBJECTS_MARKER {
            state.objects.values().collect()
        } else if marker == UNCHECKED_MARKER {
            state.objects.values().filter(|o| o.fixity_date().is_none()).collect()
        } else if let Some(ts) = marker.strip_prefix(STALE_MARKER) {
            let before = parse_fedora_time(ts)?;
            state
                .objects
                .values()
                .filter(|o| o.fixity_date().map(|d| d < before).unwrap_or(false))
                .collect()
        } else {
            return Err(RepoError::RequestFailed {
                status: 400,
                detail: format!("Unsupported query marker: {}", marker),
            });
        };
        matches.sort_by_key(|o| o.profile.modified);

        let rows: Vec<Result<QueryRow>> = matches
            .into_iter()
            .map(|o| {
                let mut row = QueryRow::new();
                row.insert("pid".to_string(), format!("info:fedora/{}", o.profile.pid));
                Ok(row)
            })
            .collect();
        Ok(Box::pin(futures::stream::iter(rows)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::bytes_stream;
    use futures::TryStreamExt;

    const DOC: &str = r#"<foxml:digitalObject VERSION="1.1" PID="test:1" xmlns:foxml="info:fedora/fedora-system:def/foxml#">
<foxml:objectProperties>
<foxml:property NAME="info:fedora/fedora-system:def/model#label" VALUE="one"/>
</foxml:objectProperties>
<foxml:datastream ID="DC" STATE="A" CONTROL_GROUP="X" VERSIONABLE="true">
<foxml:datastreamVersion ID="DC.0" MIMETYPE="text/xml">
<foxml:contentDigest TYPE="MD5"/>
<foxml:xmlContent>
  <dc>
    <title>one</title>
  </dc>
</foxml:xmlContent>
</foxml:datastreamVersion>
</foxml:datastream>
<foxml:datastream ID="TEXT" STATE="A" CONTROL_GROUP="M" VERSIONABLE="true">
<foxml:datastreamVersion ID="TEXT.0" MIMETYPE="text/plain">
<foxml:contentDigest TYPE="MD5" DIGEST="5eb63bbbe01eeed093cb22bb8f5acdc3"/>
<foxml:binaryContent>aGVsbG8gd29ybGQ=</foxml:binaryContent>
</foxml:datastreamVersion>
</foxml:datastream>
</foxml:digitalObject>"#;

    #[tokio::test]
    async fn test_ingest_and_read_back() {
        let repo = MemoryRepository::new("test");
        let pid = repo.ingest(None, bytes_stream(DOC), None).await.unwrap();
        assert_eq!(pid, "test:1");

        let ids = repo.get_datastream_ids(&pid).await.unwrap();
        assert_eq!(ids, vec!["DC", "TEXT"]);

        let info = repo.get_datastream_info(&pid, "DC").await.unwrap();
        assert_eq!(info.version.algorithm, Some(ChecksumAlgorithm::Md5));
        assert!(info.version.digest.is_some());

        let content = repo.get_datastream(&pid, "TEXT", None).await.unwrap();
        assert_eq!(collect_bytes(content.content).await.unwrap(), Bytes::from_static(b"hello world"));
    }

    #[tokio::test]
    async fn test_ingest_rejects_bad_digest() {
        let repo = MemoryRepository::new("test");
        let doc = DOC.replace("5eb63bbbe01eeed093cb22bb8f5acdc3", "00000000000000000000000000000000");
        let err = repo.ingest(None, bytes_stream(doc), None).await.unwrap_err();
        assert!(err.is_checksum_mismatch());
        assert!(!repo.contains("test:1").await);
    }

    #[tokio::test]
    async fn test_ingest_existing_pid_fails() {
        let repo = MemoryRepository::new("test");
        repo.ingest(None, bytes_stream(DOC), None).await.unwrap();
        let err = repo.ingest(None, bytes_stream(DOC), None).await.unwrap_err();
        assert!(matches!(err, RepoError::RequestFailed { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_export_reingest_elsewhere() {
        let source = MemoryRepository::new("source");
        source.ingest(None, bytes_stream(DOC), None).await.unwrap();
        let export = source.export("test:1", ExportContext::Archive).await.unwrap();

        let dest = MemoryRepository::new("dest");
        dest.ingest(None, export, None).await.unwrap();
        assert_eq!(
            dest.get_datastream_history("test:1", "TEXT").await.unwrap(),
            source.get_datastream_history("test:1", "TEXT").await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_normalizing_repository_rejects_foreign_xml_digest() {
        let source = MemoryRepository::new("source");
        source.ingest(None, bytes_stream(DOC), None).await.unwrap();
        let export = source.export("test:1", ExportContext::Archive).await.unwrap();

        let dest = MemoryRepository::new("dest").with_inline_xml_normalization();
        let err = dest.ingest(None, export, None).await.unwrap_err();
        assert!(err.is_checksum_mismatch());
    }

    #[tokio::test]
    async fn test_versions_and_as_of() {
        let repo = MemoryRepository::new("test");
        repo.ingest(None, bytes_stream(DOC), None).await.unwrap();
        let first = repo.get_datastream_info("test:1", "TEXT").await.unwrap().version;
        let update = DatastreamUpdate {
            content: Some(ContentSource::Bytes(Bytes::from_static(b"second"))),
            ..Default::default()
        };
        let second = repo.modify_datastream("test:1", "TEXT", update).await.unwrap();
        assert!(second.created > first.created);
        assert_eq!(second.version_id, "TEXT.1");

        let history = repo.get_datastream_history("test:1", "TEXT").await.unwrap();
        assert_eq!(history.len(), 2);
        let old = repo.get_datastream("test:1", "TEXT", Some(first.created)).await.unwrap();
        assert_eq!(collect_bytes(old.content).await.unwrap(), Bytes::from_static(b"hello world"));
        assert_eq!(repo.calls().await.commits, 1);
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let repo = MemoryRepository::new("test");
        repo.ingest(None, bytes_stream(DOC), None).await.unwrap();
        repo.fail_commit("test:1", "TEXT").await;
        repo.fail_purge("test:1").await;
        repo.fail_export("test:1").await;

        assert!(repo.modify_datastream("test:1", "TEXT", DatastreamUpdate::default()).await.is_err());
        assert!(repo.purge_object("test:1", None).await.is_err());
        assert!(repo.export("test:1", ExportContext::Archive).await.is_err());

        repo.clear_faults().await;
        repo.purge_object("test:1", None).await.unwrap();
        assert!(repo.get_object("test:1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_unchecked_query() {
        let repo = MemoryRepository::new("test");
        repo.ingest(None, bytes_stream(DOC), None).await.unwrap();
        let rows: Vec<QueryRow> = repo
            .query(&format!("{}\nSELECT ?pid WHERE {{}}", UNCHECKED_MARKER))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["pid"], "info:fedora/test:1");
        assert!(repo.query("SELECT ?x WHERE {}").await.is_err());
    }

    #[tokio::test]
    async fn test_upload_is_consumed_by_ingest() {
        let repo = MemoryRepository::new("test");
        let id = repo.upload(chunked(Bytes::from_static(b"hello world")), Some(11)).await.unwrap();
        assert!(id.starts_with(UPLOAD_SCHEME));
        assert_eq!(repo.pending_uploads().await, 1);

        let doc = DOC.replace(
            "<foxml:binaryContent>aGVsbG8gd29ybGQ=</foxml:binaryContent>",
            &format!("<foxml:contentLocation TYPE=\"INTERNAL_ID\" REF=\"{}\"/>", id),
        );
        repo.ingest(None, bytes_stream(doc), None).await.unwrap();
        assert_eq!(repo.pending_uploads().await, 0);
        let info = repo.get_datastream_info("test:1", "TEXT").await.unwrap();
        assert!(info.version.location.is_none());
        assert_eq!(info.version.digest.as_deref(), Some("5eb63bbbe01eeed093cb22bb8f5acdc3"));
    }

    #[tokio::test]
    async fn test_upload_size_must_match() {
        let repo = MemoryRepository::new("test");
        assert!(repo.upload(bytes_stream("abc"), Some(4)).await.is_err());
        assert_eq!(repo.pending_uploads().await, 0);
    }

    #[tokio::test]
    async fn test_remote_location_keeps_recorded_digest() {
        let repo = MemoryRepository::new("test");
        let doc = DOC.replace(
            "<foxml:binaryContent>aGVsbG8gd29ybGQ=</foxml:binaryContent>",
            "<foxml:contentLocation TYPE=\"URL\" REF=\"http://source.example.edu/text\"/>",
        );
        repo.ingest(None, bytes_stream(doc), None).await.unwrap();
        let info = repo.get_datastream_info("test:1", "TEXT").await.unwrap();
        assert_eq!(info.version.location.as_deref(), Some("http://source.example.edu/text"));
        assert_eq!(info.version.digest.as_deref(), Some("5eb63bbbe01eeed093cb22bb8f5acdc3"));
    }

    #[tokio::test]
    async fn test_stream_commit_is_digested() {
        let repo = MemoryRepository::new("test");
        repo.ingest(None, bytes_stream(DOC), None).await.unwrap();
        let update = DatastreamUpdate {
            content: Some(ContentSource::Stream {
                stream: Box::pin(futures::stream::iter(vec![
                    Ok(Bytes::from_static(b"hello ")),
                    Ok(Bytes::from_static(b"world")),
                ])),
                size: Some(11),
            }),
            ..Default::default()
        };
        repo.modify_datastream("test:1", "TEXT", update).await.unwrap();
        let info = repo.get_datastream_info("test:1", "TEXT").await.unwrap();
        assert_eq!(info.version.size, 11);
        assert_eq!(info.version.digest.as_deref(), Some("5eb63bbbe01eeed093cb22bb8f5acdc3"));
    }

    #[tokio::test]
    async fn test_checksum_type_update_recomputes_digest() {
        let repo = MemoryRepository::new("test");
        repo.ingest(None, bytes_stream(DOC), None).await.unwrap();
        repo.disable_checksums("test:1", "TEXT").await.unwrap();
        let update = DatastreamUpdate {
            checksum_type: Some(ChecksumAlgorithm::Sha1),
            ..Default::default()
        };
        repo.modify_datastream("test:1", "TEXT", update).await.unwrap();
        let info = repo.get_datastream_info("test:1", "TEXT").await.unwrap();
        assert_eq!(info.descriptor.checksum_type, ChecksumAlgorithm::Sha1);
        assert_eq!(info.version.algorithm, Some(ChecksumAlgorithm::Sha1));
        assert_eq!(
            info.version.digest.as_deref(),
            Some("2aae6c35c94fcfb415dbe95f408b9ce91ee846ed")
        );
    }

    #[tokio::test]
    async fn test_all_objects_query() {
        let repo = MemoryRepository::new("test");
        repo.ingest(None, bytes_stream(DOC), None).await.unwrap();
        repo.ingest(Some("test:2"), bytes_stream(DOC), None).await.unwrap();
        let rows: Vec<QueryRow> = repo
            .query(&format!("{}\nSELECT ?pid WHERE {{}}", ALL_OBJECTS_MARKER))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_content_models() {
        let rels = r#"<rdf:RDF xmlns:rdf="http://www.w3.org/1999/02/22-rdf-syntax-ns#">
            <rdf:Description rdf:about="info:fedora/test:1">
              <fedora-model:hasModel xmlns:fedora-model="info:fedora/fedora-system:def/model#"
                  rdf:resource="info:fedora/emory-control:Image-1.0"/>
            </rdf:Description></rdf:RDF>"#;
        assert_eq!(content_models(rels.as_bytes()), vec!["info:fedora/emory-control:Image-1.0"]);
    }
}
