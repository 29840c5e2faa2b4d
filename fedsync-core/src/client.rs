//! Repository client interface
//!
//! The remote repository is the only authority for object state. Everything
//! in this crate reaches it through the [`RepositoryClient`] trait, which has
//! an HTTP implementation ([`HttpRepository`](crate::HttpRepository)) and an
//! in-process one ([`MemoryRepository`](crate::MemoryRepository)).

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{Stream, TryStreamExt};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::pin::Pin;
use tokio::io::AsyncReadExt;

use crate::error::{RepoError, Result};
use crate::model::{ChecksumAlgorithm, DatastreamDescriptor, DatastreamVersion, ObjectProfile, VersionRef};

/// Read size used when streaming local files
const FILE_CHUNK_SIZE: usize = 64 * 1024;

/// Chunked content stream
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// One result row of a query, keyed by column name
pub type QueryRow = BTreeMap<String, String>;

/// Stream of query result rows
pub type RowStream = Pin<Box<dyn Stream<Item = Result<QueryRow>> + Send>>;

/// Wrap an in-memory buffer as a single-chunk stream
pub fn bytes_stream(data: impl Into<Bytes>) -> ByteStream {
    let data = data.into();
    Box::pin(futures::stream::once(async move { Ok(data) }))
}

/// Drain a stream into one buffer
pub async fn collect_bytes(mut stream: ByteStream) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.try_next().await? {
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// Open a local file as a chunked stream; returns the stream and the file size
pub async fn file_stream(path: &Path) -> Result<(ByteStream, u64)> {
    let file = tokio::fs::File::open(path).await?;
    let size = file.metadata().await?.len();
    let stream = futures::stream::try_unfold(file, |mut file| async move {
        let mut buf = BytesMut::with_capacity(FILE_CHUNK_SIZE);
        let read = file.read_buf(&mut buf).await?;
        if read == 0 {
            return Ok::<_, RepoError>(None);
        }
        Ok(Some((buf.freeze(), file)))
    });
    Ok((Box::pin(stream), size))
}

/// Export serialization flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportContext {
    /// Self-contained: managed content inlined as base64
    #[default]
    Archive,
    /// Managed content referenced by URL on the source
    Migrate,
    Public,
}

impl ExportContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportContext::Archive => "archive",
            ExportContext::Migrate => "migrate",
            ExportContext::Public => "public",
        }
    }
}

impl std::str::FromStr for ExportContext {
    type Err = RepoError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "archive" => Ok(ExportContext::Archive),
            "migrate" => Ok(ExportContext::Migrate),
            "public" => Ok(ExportContext::Public),
            other => Err(RepoError::Invalid(format!("Unknown export context: {}", other))),
        }
    }
}

/// Descriptor plus the current version of a datastream
#[derive(Debug, Clone)]
pub struct DatastreamInfo {
    pub descriptor: DatastreamDescriptor,
    pub version: DatastreamVersion,
}

/// A datastream version together with its content
pub struct DatastreamContent {
    pub version: DatastreamVersion,
    pub content: ByteStream,
}

/// New content for a datastream
pub enum ContentSource {
    Bytes(Bytes),
    /// URL (or upload id) the repository pulls the content from
    Location(String),
    /// Content sent as a chunked request body; consumed by the commit
    Stream { stream: ByteStream, size: Option<u64> },
}

impl fmt::Debug for ContentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentSource::Bytes(data) => f.debug_tuple("Bytes").field(&data.len()).finish(),
            ContentSource::Location(url) => f.debug_tuple("Location").field(url).finish(),
            ContentSource::Stream { size, .. } => f.debug_struct("Stream").field("size", size).finish(),
        }
    }
}

/// Changes to apply in one datastream commit
#[derive(Debug, Default)]
pub struct DatastreamUpdate {
    pub content: Option<ContentSource>,
    pub label: Option<String>,
    pub mimetype: Option<String>,
    /// New checksum algorithm; the repository recomputes the digest
    pub checksum_type: Option<ChecksumAlgorithm>,
    pub log_message: Option<String>,
}

impl DatastreamUpdate {
    pub fn is_empty(&self) -> bool {
        self.content.is_none() && self.label.is_none() && self.mimetype.is_none() && self.checksum_type.is_none()
    }
}

/// Named remote operations of a datastream-oriented object repository
#[async_trait]
pub trait RepositoryClient: Send + Sync {
    /// Fetch the object profile; `NotFound` if absent
    async fn get_object(&self, pid: &str) -> Result<ObjectProfile>;

    /// Check whether an object exists
    async fn object_exists(&self, pid: &str) -> Result<bool> {
        match self.get_object(pid).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Datastream ids of an object, in server order
    async fn get_datastream_ids(&self, pid: &str) -> Result<Vec<String>>;

    /// Descriptor and current version metadata, without content
    async fn get_datastream_info(&self, pid: &str, dsid: &str) -> Result<DatastreamInfo>;

    /// All versions of a datastream, oldest first
    async fn get_datastream_history(&self, pid: &str, dsid: &str) -> Result<Vec<DatastreamVersion>>;

    /// Version metadata and content, optionally as of a version timestamp
    async fn get_datastream(
        &self,
        pid: &str,
        dsid: &str,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<DatastreamContent>;

    /// Create a datastream on an existing object
    async fn add_datastream(
        &self,
        pid: &str,
        descriptor: &DatastreamDescriptor,
        update: DatastreamUpdate,
    ) -> Result<VersionRef>;

    /// Commit changes to an existing datastream
    async fn modify_datastream(&self, pid: &str, dsid: &str, update: DatastreamUpdate) -> Result<VersionRef>;

    /// Stage content on the server ahead of an ingest; returns the upload id
    /// to reference from the serialization
    async fn upload(&self, content: ByteStream, size: Option<u64>) -> Result<String>;

    /// URL the content of a datastream version can be fetched from, with
    /// credentials embedded when asked for; `None` when there is no such URL
    fn content_url(
        &self,
        _pid: &str,
        _dsid: &str,
        _as_of: Option<DateTime<Utc>>,
        _with_credentials: bool,
    ) -> Option<String> {
        None
    }

    /// Create an object from a serialization; returns the pid assigned
    async fn ingest(
        &self,
        pid: Option<&str>,
        serialization: ByteStream,
        log_message: Option<&str>,
    ) -> Result<String>;

    /// Stream the full serialization of an object
    async fn export(&self, pid: &str, context: ExportContext) -> Result<ByteStream>;

    async fn purge_object(&self, pid: &str, log_message: Option<&str>) -> Result<()>;

    /// Run a resource-index query; executes once, rows are streamed
    async fn query(&self, query: &str) -> Result<RowStream>;
}
