//! Directory-backed repository
//!
//! An [`AirlockRepository`] keeps each object as a FOXML file in a local
//! directory, so objects can be exported from one repository and ingested
//! into another in separate runs. Ingest writes the serialization as
//! received; reads parse the stored file. Datastream-level writes, uploads
//! and queries are not supported.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::client::{
    ByteStream, DatastreamContent, DatastreamInfo, DatastreamUpdate, ExportContext, RepositoryClient, RowStream,
    bytes_stream, file_stream,
};
use crate::error::{RepoError, Result};
use crate::foxml::{self, FoxmlContent, FoxmlDatastream, FoxmlObject, FoxmlVersion};
use crate::model::{ChecksumAlgorithm, DatastreamDescriptor, DatastreamVersion, ObjectProfile, VersionRef};
use crate::registry::RELS_EXT_ID;
use crate::rels::statement_values;

const FILE_EXTENSION: &str = "xml";

pub struct AirlockRepository {
    dir: PathBuf,
}

impl AirlockRepository {
    /// Use an existing directory
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(RepoError::Invalid(format!("{} is not a directory", dir.display())));
        }
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding an object; `:` and `%` are escaped so pids stay
    /// portable file names
    pub fn object_path(&self, pid: &str) -> PathBuf {
        let name = pid.replace('%', "%25").replace(':', "%3A");
        self.dir.join(format!("{}.{}", name, FILE_EXTENSION))
    }

    async fn load(&self, pid: &str) -> Result<FoxmlObject> {
        let path = self.object_path(pid);
        let data = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => RepoError::NotFound(format!("objects/{}", pid)),
            _ => RepoError::Io(e),
        })?;
        foxml::parse_object(&data)
    }

    fn unsupported(&self, operation: &str) -> RepoError {
        RepoError::Invalid(format!("{} is not supported by the airlock at {}", operation, self.dir.display()))
    }
}

fn find_datastream<'a>(doc: &'a FoxmlObject, pid: &str, dsid: &str) -> Result<&'a FoxmlDatastream> {
    doc.datastream(dsid)
        .filter(|ds| !ds.versions.is_empty())
        .ok_or_else(|| RepoError::NotFound(format!("objects/{}/datastreams/{}", pid, dsid)))
}

fn version_content(version: &FoxmlVersion) -> (Bytes, Option<String>) {
    match &version.content {
        FoxmlContent::Xml(xml) => (Bytes::from(xml.clone()), None),
        FoxmlContent::Binary(data) => (data.clone(), None),
        FoxmlContent::Location { reference, .. } => (Bytes::new(), Some(reference.clone())),
        FoxmlContent::Empty => (Bytes::new(), None),
    }
}

fn to_version(dsid: &str, version: &FoxmlVersion, fallback: DateTime<Utc>) -> DatastreamVersion {
    let (content, location) = version_content(version);
    let (algorithm, digest) = match &version.digest {
        Some(d) => (
            ChecksumAlgorithm::from_name(&d.algorithm),
            d.digest
                .as_deref()
                .filter(|v| !v.eq_ignore_ascii_case("none"))
                .map(str::to_ascii_lowercase),
        ),
        None => (None, None),
    };
    DatastreamVersion {
        dsid: dsid.to_string(),
        version_id: version.id.clone(),
        label: version.label.clone().unwrap_or_default(),
        mimetype: version.mimetype.clone(),
        created: version.created.unwrap_or(fallback),
        size: version.size.unwrap_or(content.len() as u64),
        digest,
        algorithm,
        location,
    }
}

fn fallback_time(doc: &FoxmlObject) -> DateTime<Utc> {
    doc.properties.modified.or(doc.properties.created).unwrap_or_default()
}

#[async_trait]
impl RepositoryClient for AirlockRepository {
    async fn get_object(&self, pid: &str) -> Result<ObjectProfile> {
        let doc = self.load(pid).await?;
        let content_models = doc
            .datastream(RELS_EXT_ID)
            .and_then(|ds| ds.versions.last())
            .map(|v| statement_values(&version_content(v).0, "hasModel"))
            .unwrap_or_default();
        Ok(ObjectProfile {
            pid: pid.to_string(),
            label: doc.properties.label,
            owner: doc.properties.owner,
            state: doc.properties.state,
            created: doc.properties.created,
            modified: doc.properties.modified,
            content_models,
        })
    }

    async fn object_exists(&self, pid: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.object_path(pid)).await?)
    }

    async fn get_datastream_ids(&self, pid: &str) -> Result<Vec<String>> {
        let doc = self.load(pid).await?;
        Ok(doc.datastreams.into_iter().map(|ds| ds.id).collect())
    }

    async fn get_datastream_info(&self, pid: &str, dsid: &str) -> Result<DatastreamInfo> {
        let doc = self.load(pid).await?;
        let ds = find_datastream(&doc, pid, dsid)?;
        let current = ds
            .versions
            .last()
            .ok_or_else(|| RepoError::NotFound(format!("objects/{}/datastreams/{}", pid, dsid)))?;
        let version = to_version(dsid, current, fallback_time(&doc));
        let descriptor = DatastreamDescriptor {
            id: ds.id.clone(),
            label: version.label.clone(),
            mimetype: version.mimetype.clone(),
            versionable: ds.versionable,
            control_group: ds.control_group,
            checksum_type: version.algorithm.unwrap_or(ChecksumAlgorithm::Disabled),
            format_uri: current.format_uri.clone(),
            state: ds.state,
        };
        Ok(DatastreamInfo { descriptor, version })
    }

    async fn get_datastream_history(&self, pid: &str, dsid: &str) -> Result<Vec<DatastreamVersion>> {
        let doc = self.load(pid).await?;
        let fallback = fallback_time(&doc);
        let ds = find_datastream(&doc, pid, dsid)?;
        Ok(ds.versions.iter().map(|v| to_version(dsid, v, fallback)).collect())
    }

    async fn get_datastream(
        &self,
        pid: &str,
        dsid: &str,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<DatastreamContent> {
        let doc = self.load(pid).await?;
        let fallback = fallback_time(&doc);
        let ds = find_datastream(&doc, pid, dsid)?;
        let selected = match as_of {
            None => ds.versions.last(),
            Some(ts) => ds
                .versions
                .iter()
                .rev()
                .find(|v| v.created.unwrap_or(fallback) <= ts),
        }
        .ok_or_else(|| RepoError::NotFound(format!("objects/{}/datastreams/{}", pid, dsid)))?;
        Ok(DatastreamContent {
            version: to_version(dsid, selected, fallback),
            content: bytes_stream(version_content(selected).0),
        })
    }

    async fn add_datastream(
        &self,
        _pid: &str,
        _descriptor: &DatastreamDescriptor,
        _update: DatastreamUpdate,
    ) -> Result<VersionRef> {
        Err(self.unsupported("Adding a datastream"))
    }

    async fn modify_datastream(&self, _pid: &str, _dsid: &str, _update: DatastreamUpdate) -> Result<VersionRef> {
        Err(self.unsupported("Modifying a datastream"))
    }

    async fn upload(&self, _content: ByteStream, _size: Option<u64>) -> Result<String> {
        Err(self.unsupported("Uploading content"))
    }

    async fn ingest(
        &self,
        pid: Option<&str>,
        mut serialization: ByteStream,
        _log_message: Option<&str>,
    ) -> Result<String> {
        let pid = pid.ok_or_else(|| RepoError::Invalid("Objects ingested into an airlock need a pid".to_string()))?;
        let path = self.object_path(pid);
        if tokio::fs::try_exists(&path).await? {
            return Err(RepoError::RequestFailed {
                status: 500,
                detail: format!("{} already exists", path.display()),
            });
        }

        let partial = path.with_extension("xml.part");
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut written = 0u64;
        let copied: Result<()> = async {
            while let Some(chunk) = serialization.try_next().await? {
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            Ok(())
        }
        .await;
        drop(file);
        if let Err(e) = copied {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }
        tokio::fs::rename(&partial, &path).await?;
        debug!("Wrote {} ({} bytes)", path.display(), written);
        Ok(pid.to_string())
    }

    async fn export(&self, pid: &str, _context: ExportContext) -> Result<ByteStream> {
        let path = self.object_path(pid);
        if !tokio::fs::try_exists(&path).await? {
            return Err(RepoError::NotFound(format!("objects/{}", pid)));
        }
        let (stream, _) = file_stream(&path).await?;
        Ok(stream)
    }

    async fn purge_object(&self, pid: &str, _log_message: Option<&str>) -> Result<()> {
        tokio::fs::remove_file(self.object_path(pid))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => RepoError::NotFound(format!("objects/{}", pid)),
                _ => RepoError::Io(e),
            })
    }

    async fn query(&self, _query: &str) -> Result<RowStream> {
        Err(self.unsupported("Querying"))
    }
}
