//! Datastream working copy
//!
//! A [`DatastreamObject`] is the mutable front for one datastream of a
//! [`DigitalObject`](crate::DigitalObject). Metadata is loaded on first
//! access and content on first read; mutators only record pending edits and
//! set the dirty flag. The owning object commits pending edits on save.
//!
//! Content can be set from memory, a URL, a local file or a one-shot
//! stream. Streams and files are sent as chunked request bodies; for a new
//! object they are uploaded first and referenced from the ingest document.
//!
//! State machine:
//!
//! ```text
//!   clean --set_*--> dirty --commit ok--> clean
//!                      |  \--commit err--> dirty (edits kept)
//!                      \--discard_changes--> clean
//! ```

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;

use crate::checksum::{ChecksumRecord, verify_version};
use crate::client::{
    ByteStream, ContentSource, DatastreamUpdate, RepositoryClient, bytes_stream, collect_bytes, file_stream,
};
use crate::error::{RepoError, Result};
use crate::foxml::{FoxmlContent, FoxmlDatastream, FoxmlDigest, FoxmlVersion};
use crate::model::{ChecksumAlgorithm, ControlGroup, DatastreamDescriptor, DatastreamVersion, VersionRef};
use crate::registry::DatastreamSpec;

/// Pending content that is not held in memory
enum PendingStream {
    /// Consumed by the first commit or upload that sends it
    Stream { stream: ByteStream, size: Option<u64> },
    /// Reopened for every attempt
    File(PathBuf),
}

pub struct DatastreamObject {
    client: Arc<dyn RepositoryClient>,
    /// Owning object's pid once it exists remotely
    pid: Option<String>,
    descriptor: DatastreamDescriptor,
    /// Content used for new objects when nothing was set
    default_content: Option<Bytes>,

    loaded: bool,
    /// Whether the datastream exists on the server
    exists: bool,
    /// Last fetched (or committed) version
    version: Option<DatastreamVersion>,
    /// Cached remote content or pending local content
    content: Option<Bytes>,
    location: Option<String>,
    streamed: Option<PendingStream>,
    /// Upload id of streamed content staged for an ingest
    uploaded: Option<String>,

    content_dirty: bool,
    label_dirty: bool,
    mimetype_dirty: bool,
    checksum_type_dirty: bool,
    log_message: Option<String>,
    last_commit: Option<VersionRef>,
}

impl DatastreamObject {
    /// Tracker for a datastream of an object not yet ingested
    pub fn new(client: Arc<dyn RepositoryClient>, spec: &DatastreamSpec) -> Self {
        Self {
            client,
            pid: None,
            descriptor: spec.descriptor.clone(),
            default_content: spec.default_content.clone(),
            loaded: true,
            exists: false,
            version: None,
            content: None,
            location: None,
            streamed: None,
            uploaded: None,
            content_dirty: false,
            label_dirty: false,
            mimetype_dirty: false,
            checksum_type_dirty: false,
            log_message: None,
            last_commit: None,
        }
    }

    /// Tracker for a datastream of an existing object; nothing is fetched yet
    pub fn bound(client: Arc<dyn RepositoryClient>, pid: &str, spec: &DatastreamSpec) -> Self {
        let mut ds = Self::new(client, spec);
        ds.pid = Some(pid.to_string());
        ds.loaded = false;
        ds
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    /// Descriptor as currently known, including pending label/mimetype edits
    pub fn descriptor(&self) -> &DatastreamDescriptor {
        &self.descriptor
    }

    pub fn is_dirty(&self) -> bool {
        self.content_dirty || self.label_dirty || self.mimetype_dirty || self.checksum_type_dirty
    }

    /// Version reference returned by the last successful commit
    pub fn last_commit(&self) -> Option<&VersionRef> {
        self.last_commit.as_ref()
    }

    /// Fetch descriptor and current version metadata if not done yet.
    ///
    /// A datastream the object type declares but the server does not have is
    /// not an error; it is created on the next commit.
    pub async fn ensure_loaded(&mut self) -> Result<()> {
        if self.loaded {
            return Ok(());
        }
        let pid = match &self.pid {
            Some(pid) => pid.clone(),
            None => {
                self.loaded = true;
                return Ok(());
            }
        };

        match self.client.get_datastream_info(&pid, &self.descriptor.id).await {
            Ok(info) => {
                let label = std::mem::take(&mut self.descriptor.label);
                let mimetype = std::mem::take(&mut self.descriptor.mimetype);
                let checksum_type = self.descriptor.checksum_type;
                self.descriptor = info.descriptor;
                if self.label_dirty {
                    self.descriptor.label = label;
                }
                if self.mimetype_dirty {
                    self.descriptor.mimetype = mimetype;
                }
                if self.checksum_type_dirty {
                    self.descriptor.checksum_type = checksum_type;
                }
                self.version = Some(info.version);
                self.exists = true;
            }
            Err(e) if e.is_not_found() => {
                self.exists = false;
            }
            Err(e) => return Err(e),
        }
        self.loaded = true;
        Ok(())
    }

    /// Whether the datastream exists on the server
    pub async fn exists(&mut self) -> Result<bool> {
        self.ensure_loaded().await?;
        Ok(self.exists)
    }

    pub async fn label(&mut self) -> Result<&str> {
        self.ensure_loaded().await?;
        Ok(&self.descriptor.label)
    }

    pub async fn mimetype(&mut self) -> Result<&str> {
        self.ensure_loaded().await?;
        Ok(&self.descriptor.mimetype)
    }

    /// Current version metadata; `None` for datastreams not on the server
    pub async fn version(&mut self) -> Result<Option<&DatastreamVersion>> {
        self.ensure_loaded().await?;
        Ok(self.version.as_ref())
    }

    pub fn set_label(&mut self, label: impl Into<String>) {
        self.descriptor.label = label.into();
        self.label_dirty = true;
    }

    pub fn set_mimetype(&mut self, mimetype: impl Into<String>) {
        self.descriptor.mimetype = mimetype.into();
        self.mimetype_dirty = true;
    }

    /// Checksum algorithm the repository should use from the next commit on
    pub fn set_checksum_type(&mut self, algorithm: ChecksumAlgorithm) {
        self.descriptor.checksum_type = algorithm;
        self.checksum_type_dirty = true;
    }

    fn clear_pending_content(&mut self) {
        self.content = None;
        self.location = None;
        self.streamed = None;
        self.uploaded = None;
        self.content_dirty = true;
    }

    /// Replace the content; nothing is fetched
    pub fn set_content(&mut self, content: impl Into<Bytes>) {
        self.clear_pending_content();
        self.content = Some(content.into());
    }

    /// Have the repository pull new content from a URL on commit.
    /// Takes precedence over content set earlier.
    pub fn set_content_location(&mut self, url: impl Into<String>) {
        self.clear_pending_content();
        self.location = Some(url.into());
    }

    /// Send new content from a stream on commit without buffering it.
    /// The stream is consumed by the first commit attempt; if that attempt
    /// fails the content has to be set again.
    pub fn set_content_stream(&mut self, stream: ByteStream, size: Option<u64>) {
        self.clear_pending_content();
        self.streamed = Some(PendingStream::Stream { stream, size });
    }

    /// Send the contents of a local file on commit, streamed in chunks
    pub fn set_content_file(&mut self, path: impl Into<PathBuf>) {
        self.clear_pending_content();
        self.streamed = Some(PendingStream::File(path.into()));
    }

    /// Log message sent with the next commit
    pub fn set_log_message(&mut self, message: impl Into<String>) {
        self.log_message = Some(message.into());
    }

    fn has_remote_content(&self) -> bool {
        self.pid.is_some() && self.exists && !self.content_dirty
    }

    /// Pending content that was handed over to an earlier failed attempt
    fn content_consumed(&self) -> bool {
        self.content_dirty
            && self.content.is_none()
            && self.location.is_none()
            && self.streamed.is_none()
            && self.uploaded.is_none()
    }

    /// Error for pending content that cannot be read back locally
    fn unreadable_pending(&self) -> Option<RepoError> {
        let whereabouts = if self.location.is_some() || self.uploaded.is_some() {
            "at a remote location"
        } else if matches!(self.streamed, Some(PendingStream::Stream { .. })) {
            "in a one-shot stream"
        } else if self.content_consumed() {
            "in a stream consumed by a failed commit"
        } else {
            return None;
        };
        Some(RepoError::Invalid(format!(
            "Content of {} is pending {}",
            self.descriptor.id, whereabouts
        )))
    }

    /// Full content: pending edit, cached copy, or fetched once and cached
    pub async fn get_content(&mut self) -> Result<Bytes> {
        self.ensure_loaded().await?;
        if let Some(content) = &self.content {
            return Ok(content.clone());
        }
        if let Some(PendingStream::File(path)) = &self.streamed {
            return Ok(Bytes::from(tokio::fs::read(path).await?));
        }
        if let Some(err) = self.unreadable_pending() {
            return Err(err);
        }
        if !self.has_remote_content() {
            return Ok(self.default_content.clone().unwrap_or_default());
        }

        let pid = self.pid.clone().unwrap_or_default();
        let fetched = self.client.get_datastream(&pid, &self.descriptor.id, None).await?;
        let data = collect_bytes(fetched.content).await?;
        self.version = Some(fetched.version);
        self.content = Some(data.clone());
        Ok(data)
    }

    /// Content as a chunked stream; remote content is streamed without being
    /// cached
    pub async fn content_stream(&mut self) -> Result<ByteStream> {
        self.ensure_loaded().await?;
        if let Some(content) = &self.content {
            return Ok(bytes_stream(content.clone()));
        }
        if let Some(PendingStream::File(path)) = &self.streamed {
            return Ok(file_stream(path).await?.0);
        }
        if let Some(err) = self.unreadable_pending() {
            return Err(err);
        }
        if !self.has_remote_content() {
            return Ok(bytes_stream(self.default_content.clone().unwrap_or_default()));
        }
        let pid = self.pid.clone().unwrap_or_default();
        let fetched = self.client.get_datastream(&pid, &self.descriptor.id, None).await?;
        Ok(fetched.content)
    }

    /// Drop pending edits without any remote call
    pub fn discard_changes(&mut self) {
        if self.content_dirty {
            self.content = None;
            self.location = None;
            self.streamed = None;
            self.uploaded = None;
        }
        if self.label_dirty || self.mimetype_dirty || self.checksum_type_dirty {
            // reload the descriptor on next access
            self.loaded = self.pid.is_none();
        }
        self.content_dirty = false;
        self.label_dirty = false;
        self.mimetype_dirty = false;
        self.checksum_type_dirty = false;
        self.log_message = None;
    }

    fn mark_clean(&mut self) {
        self.content_dirty = false;
        self.label_dirty = false;
        self.mimetype_dirty = false;
        self.checksum_type_dirty = false;
        self.log_message = None;
        self.streamed = None;
        self.uploaded = None;
        if self.location.take().is_some() {
            self.content = None;
        }
    }

    /// Take the pending stream for sending; files are reopened each time
    async fn take_stream(&mut self) -> Result<Option<(ByteStream, Option<u64>)>> {
        match self.streamed.take() {
            Some(PendingStream::Stream { stream, size }) => Ok(Some((stream, size))),
            Some(PendingStream::File(path)) => {
                let opened = file_stream(&path).await;
                self.streamed = Some(PendingStream::File(path));
                let (stream, size) = opened?;
                Ok(Some((stream, Some(size))))
            }
            None => Ok(None),
        }
    }

    /// Commit pending edits. Only the owning object calls this, on save.
    pub(crate) async fn commit(&mut self, pid: &str) -> Result<VersionRef> {
        self.ensure_loaded().await?;
        if self.content_consumed() {
            return Err(self.unreadable_pending().unwrap_or_else(|| {
                RepoError::Invalid(format!("Content of {} is no longer available", self.descriptor.id))
            }));
        }

        let content = if let Some(url) = self.location.as_ref().or(self.uploaded.as_ref()) {
            Some(ContentSource::Location(url.clone()))
        } else if let Some((stream, size)) = self.take_stream().await? {
            Some(ContentSource::Stream { stream, size })
        } else {
            match &self.content {
                Some(data) if self.content_dirty => Some(ContentSource::Bytes(data.clone())),
                _ => None,
            }
        };
        let update = DatastreamUpdate {
            content,
            label: self.label_dirty.then(|| self.descriptor.label.clone()),
            mimetype: self.mimetype_dirty.then(|| self.descriptor.mimetype.clone()),
            checksum_type: self.checksum_type_dirty.then_some(self.descriptor.checksum_type),
            log_message: self.log_message.clone(),
        };

        let version_ref = if self.exists {
            self.client.modify_datastream(pid, &self.descriptor.id, update).await?
        } else {
            self.client.add_datastream(pid, &self.descriptor, update).await?
        };

        self.mark_clean();
        self.exists = true;
        self.pid = Some(pid.to_string());
        // version metadata is refetched on next access
        self.loaded = false;
        self.version = None;
        self.last_commit = Some(version_ref.clone());
        Ok(version_ref)
    }

    /// Stage streamed or file content on the server so the serialization of
    /// a new object can reference it; a no-op for in-memory content
    pub(crate) async fn prepare_ingest(&mut self) -> Result<()> {
        if self.uploaded.is_some() {
            return Ok(());
        }
        if self.content_consumed() {
            return Err(self.unreadable_pending().unwrap_or_else(|| {
                RepoError::Invalid(format!("Content of {} is no longer available", self.descriptor.id))
            }));
        }
        if let Some((stream, size)) = self.take_stream().await? {
            self.uploaded = Some(self.client.upload(stream, size).await?);
        }
        Ok(())
    }

    /// Serialization of this datastream for a new object; `None` when there
    /// is nothing to send
    pub(crate) fn to_foxml(&self) -> Option<FoxmlDatastream> {
        let content = match (&self.location, &self.uploaded, &self.content, &self.default_content) {
            (Some(url), _, _, _) => FoxmlContent::Location {
                reference: url.clone(),
                kind: "URL".to_string(),
            },
            (None, Some(id), _, _) => FoxmlContent::Location {
                reference: id.clone(),
                kind: "INTERNAL_ID".to_string(),
            },
            (None, None, Some(data), _) | (None, None, None, Some(data)) => match self.descriptor.control_group {
                ControlGroup::Inline => FoxmlContent::Xml(String::from_utf8_lossy(data).into_owned()),
                _ => FoxmlContent::Binary(data.clone()),
            },
            (None, None, None, None) => return None,
        };

        Some(FoxmlDatastream {
            id: self.descriptor.id.clone(),
            control_group: self.descriptor.control_group,
            state: self.descriptor.state,
            versionable: self.descriptor.versionable,
            versions: vec![FoxmlVersion {
                id: format!("{}.0", self.descriptor.id),
                label: Some(self.descriptor.label.clone()),
                created: None,
                mimetype: self.descriptor.mimetype.clone(),
                format_uri: self.descriptor.format_uri.clone(),
                size: None,
                digest: Some(FoxmlDigest {
                    algorithm: self.descriptor.checksum_type.name().to_string(),
                    digest: None,
                }),
                content,
            }],
        })
    }

    pub(crate) fn pending_or_default_content(&self) -> Bytes {
        self.content
            .clone()
            .or_else(|| self.default_content.clone())
            .unwrap_or_default()
    }

    /// The owning object was just ingested
    pub(crate) fn mark_ingested(&mut self, pid: &str, included: bool) {
        self.mark_clean();
        self.pid = Some(pid.to_string());
        self.exists = included;
        self.loaded = false;
    }

    /// Recompute the digest of a version (current, or as of a timestamp) and
    /// compare it to the recorded one
    pub async fn validate_checksum(&mut self, as_of: Option<DateTime<Utc>>) -> Result<ChecksumRecord> {
        self.ensure_loaded().await?;
        let pid = match (&self.pid, self.exists) {
            (Some(pid), true) => pid.clone(),
            _ => {
                return Err(RepoError::Invalid(format!(
                    "Datastream {} has no committed version to validate",
                    self.descriptor.id
                )));
            }
        };
        let fetched = self.client.get_datastream(&pid, &self.descriptor.id, as_of).await?;
        verify_version(&fetched.version, fetched.content).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ChecksumVerdict;
    use crate::memory::MemoryRepository;
    use crate::registry::DatastreamSpec;

    const DOC: &str = r#"<foxml:digitalObject VERSION="1.1" PID="test:1" xmlns:foxml="info:fedora/fedora-system:def/foxml#">
<foxml:datastream ID="TEXT" STATE="A" CONTROL_GROUP="M" VERSIONABLE="true">
<foxml:datastreamVersion ID="TEXT.0" LABEL="text" MIMETYPE="text/plain">
<foxml:contentDigest TYPE="MD5"/>
<foxml:binaryContent>aGVsbG8gd29ybGQ=</foxml:binaryContent>
</foxml:datastreamVersion>
</foxml:datastream>
</foxml:digitalObject>"#;

    async fn repo() -> Arc<MemoryRepository> {
        let repo = Arc::new(MemoryRepository::new("test"));
        repo.ingest(None, bytes_stream(DOC), None).await.unwrap();
        repo
    }

    fn text_spec() -> DatastreamSpec {
        DatastreamSpec::new("TEXT", "text").with_mimetype("text/plain")
    }

    #[tokio::test]
    async fn test_lazy_load() {
        let repo = repo().await;
        let mut ds = DatastreamObject::bound(repo.clone(), "test:1", &text_spec());
        assert!(!ds.is_dirty());
        assert_eq!(ds.label().await.unwrap(), "text");
        assert_eq!(ds.get_content().await.unwrap(), Bytes::from_static(b"hello world"));
    }

    #[tokio::test]
    async fn test_set_content_wins_over_remote() {
        let repo = repo().await;
        let mut ds = DatastreamObject::bound(repo.clone(), "test:1", &text_spec());
        ds.set_content("local edit");
        assert!(ds.is_dirty());
        assert_eq!(ds.get_content().await.unwrap(), Bytes::from_static(b"local edit"));
        assert_eq!(repo.calls().await.commits, 0);
    }

    #[tokio::test]
    async fn test_commit_clears_dirty() {
        let repo = repo().await;
        let mut ds = DatastreamObject::bound(repo.clone(), "test:1", &text_spec());
        ds.set_content("v2");
        ds.set_label("second");
        let version = ds.commit("test:1").await.unwrap();
        assert!(!ds.is_dirty());
        assert_eq!(version.version_id, "TEXT.1");
        assert_eq!(ds.last_commit(), Some(&version));
        assert_eq!(ds.label().await.unwrap(), "second");
        assert_eq!(repo.datastream_content("test:1", "TEXT").await.unwrap(), Bytes::from_static(b"v2"));
    }

    #[tokio::test]
    async fn test_failed_commit_keeps_edits() {
        let repo = repo().await;
        repo.fail_commit("test:1", "TEXT").await;
        let mut ds = DatastreamObject::bound(repo.clone(), "test:1", &text_spec());
        ds.set_content("v2");
        assert!(ds.commit("test:1").await.is_err());
        assert!(ds.is_dirty());
        assert_eq!(ds.get_content().await.unwrap(), Bytes::from_static(b"v2"));
    }

    #[tokio::test]
    async fn test_discard_changes() {
        let repo = repo().await;
        let mut ds = DatastreamObject::bound(repo.clone(), "test:1", &text_spec());
        ds.set_content("scratch");
        ds.set_label("scratch");
        ds.discard_changes();
        assert!(!ds.is_dirty());
        assert_eq!(ds.label().await.unwrap(), "text");
        assert_eq!(ds.get_content().await.unwrap(), Bytes::from_static(b"hello world"));
    }

    #[tokio::test]
    async fn test_missing_datastream_is_added_on_commit() {
        let repo = repo().await;
        let spec = DatastreamSpec::xml("MODS", "Descriptive metadata");
        let mut ds = DatastreamObject::bound(repo.clone(), "test:1", &spec);
        assert!(!ds.exists().await.unwrap());
        ds.set_content("<mods/>");
        ds.commit("test:1").await.unwrap();
        let info = repo.get_datastream_info("test:1", "MODS").await.unwrap();
        assert_eq!(info.descriptor.control_group, ControlGroup::Inline);
    }

    fn chunks(parts: &[&'static str]) -> ByteStream {
        let parts: Vec<Result<Bytes>> = parts.iter().map(|p| Ok(Bytes::from_static(p.as_bytes()))).collect();
        Box::pin(futures::stream::iter(parts))
    }

    #[tokio::test]
    async fn test_commit_chunked_stream() {
        let repo = repo().await;
        let mut ds = DatastreamObject::bound(repo.clone(), "test:1", &text_spec());
        ds.set_content_stream(chunks(&["hello", " ", "world", "!"]), Some(12));
        assert!(ds.is_dirty());
        ds.commit("test:1").await.unwrap();
        assert!(!ds.is_dirty());

        assert_eq!(
            repo.datastream_content("test:1", "TEXT").await.unwrap(),
            Bytes::from_static(b"hello world!")
        );
        let version = ds.version().await.unwrap().unwrap().clone();
        assert_eq!(version.size, 12);
        // md5("hello world!")
        assert_eq!(version.digest.as_deref(), Some("fc3ff98e8c6a0d3087d515c0473f8677"));
        assert_eq!(ds.validate_checksum(None).await.unwrap().verdict, ChecksumVerdict::Valid);
    }

    #[tokio::test]
    async fn test_commit_file_content() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"from disk").unwrap();

        let repo = repo().await;
        let mut ds = DatastreamObject::bound(repo.clone(), "test:1", &text_spec());
        ds.set_content_file(file.path());
        assert_eq!(ds.get_content().await.unwrap(), Bytes::from_static(b"from disk"));
        assert_eq!(collect_bytes(ds.content_stream().await.unwrap()).await.unwrap(), Bytes::from_static(b"from disk"));

        ds.commit("test:1").await.unwrap();
        assert_eq!(
            repo.datastream_content("test:1", "TEXT").await.unwrap(),
            Bytes::from_static(b"from disk")
        );
    }

    #[tokio::test]
    async fn test_failed_file_commit_can_be_retried() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"from disk").unwrap();

        let repo = repo().await;
        repo.fail_commit("test:1", "TEXT").await;
        let mut ds = DatastreamObject::bound(repo.clone(), "test:1", &text_spec());
        ds.set_content_file(file.path());
        assert!(ds.commit("test:1").await.is_err());

        repo.clear_faults().await;
        ds.commit("test:1").await.unwrap();
        assert_eq!(
            repo.datastream_content("test:1", "TEXT").await.unwrap(),
            Bytes::from_static(b"from disk")
        );
    }

    #[tokio::test]
    async fn test_stream_is_consumed_by_failed_commit() {
        let repo = repo().await;
        repo.fail_commit("test:1", "TEXT").await;
        let mut ds = DatastreamObject::bound(repo.clone(), "test:1", &text_spec());
        ds.set_content_stream(chunks(&["v2"]), None);
        assert!(ds.commit("test:1").await.is_err());
        assert!(ds.is_dirty());

        repo.clear_faults().await;
        let commits = repo.calls().await.commits;
        assert!(matches!(ds.commit("test:1").await, Err(RepoError::Invalid(_))));
        assert!(matches!(ds.get_content().await, Err(RepoError::Invalid(_))));
        assert_eq!(repo.calls().await.commits, commits);

        ds.set_content_stream(chunks(&["v2"]), None);
        ds.commit("test:1").await.unwrap();
        assert_eq!(repo.datastream_content("test:1", "TEXT").await.unwrap(), Bytes::from_static(b"v2"));
    }

    #[tokio::test]
    async fn test_pending_stream_is_not_readable() {
        let repo = repo().await;
        let mut ds = DatastreamObject::bound(repo.clone(), "test:1", &text_spec());
        ds.set_content_stream(chunks(&["v2"]), None);
        assert!(matches!(ds.get_content().await, Err(RepoError::Invalid(_))));
        assert!(matches!(ds.content_stream().await, Err(RepoError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_pending_location_is_not_streamable() {
        let repo = repo().await;
        let mut ds = DatastreamObject::bound(repo.clone(), "test:1", &text_spec());
        ds.set_content_location("http://example.org/big.tiff");
        assert!(matches!(ds.get_content().await, Err(RepoError::Invalid(_))));
        assert!(matches!(ds.content_stream().await, Err(RepoError::Invalid(_))));

        let mut fresh = DatastreamObject::new(repo.clone(), &text_spec());
        fresh.set_content_location("http://example.org/big.tiff");
        assert!(matches!(fresh.content_stream().await, Err(RepoError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_remote_stream_is_not_cached() {
        let repo = repo().await;
        let mut ds = DatastreamObject::bound(repo.clone(), "test:1", &text_spec());
        let stream = ds.content_stream().await.unwrap();
        assert_eq!(collect_bytes(stream).await.unwrap(), Bytes::from_static(b"hello world"));
        assert!(ds.content.is_none());
        assert!(!ds.is_dirty());

        // a later read goes back to the server
        repo.modify_datastream(
            "test:1",
            "TEXT",
            DatastreamUpdate {
                content: Some(ContentSource::Bytes(Bytes::from_static(b"changed"))),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let stream = ds.content_stream().await.unwrap();
        assert_eq!(collect_bytes(stream).await.unwrap(), Bytes::from_static(b"changed"));
    }

    #[tokio::test]
    async fn test_set_checksum_type() {
        let repo = repo().await;
        repo.disable_checksums("test:1", "TEXT").await.unwrap();
        let mut ds = DatastreamObject::bound(repo.clone(), "test:1", &text_spec());
        ds.set_checksum_type(ChecksumAlgorithm::Sha256);
        assert_eq!(ds.descriptor().checksum_type, ChecksumAlgorithm::Sha256);
        ds.commit("test:1").await.unwrap();

        let info = repo.get_datastream_info("test:1", "TEXT").await.unwrap();
        assert_eq!(info.descriptor.checksum_type, ChecksumAlgorithm::Sha256);
        assert_eq!(repo.datastream_content("test:1", "TEXT").await.unwrap(), Bytes::from_static(b"hello world"));
        assert_eq!(ds.validate_checksum(None).await.unwrap().verdict, ChecksumVerdict::Valid);
    }

    #[tokio::test]
    async fn test_validate_checksum_is_repeatable() {
        let repo = repo().await;
        let mut ds = DatastreamObject::bound(repo.clone(), "test:1", &text_spec());
        let first = ds.validate_checksum(None).await.unwrap();
        let second = ds.validate_checksum(None).await.unwrap();
        assert_eq!(first.verdict, ChecksumVerdict::Valid);
        assert_eq!(first.verdict, second.verdict);
    }

    #[tokio::test]
    async fn test_validate_unsaved_is_invalid_operation() {
        let repo = Arc::new(MemoryRepository::new("test"));
        let mut ds = DatastreamObject::new(repo, &text_spec());
        assert!(matches!(ds.validate_checksum(None).await, Err(RepoError::Invalid(_))));
    }
}
