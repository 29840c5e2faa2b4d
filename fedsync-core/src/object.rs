//! Digital object aggregate and its save protocol
//!
//! A [`DigitalObject`] owns one [`DatastreamObject`] per declared datastream
//! (in registry declaration order) and coordinates saving them:
//!
//! - not yet ingested: one ingest call carrying every datastream that has
//!   content, all or nothing
//! - ingested: one commit per dirty datastream, in declaration order,
//!   continuing past failures; nothing is rolled back
//!
//! A failed pass reports every failed datastream with its cause together with
//! the datastreams that did commit, so callers can retry just the failures.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::client::{RepositoryClient, bytes_stream};
use crate::datastream::DatastreamObject;
use crate::error::{RepoError, Result, SaveFailure};
use crate::foxml::{self, FoxmlObject, FoxmlProperties};
use crate::model::{ObjectProfile, ObjectState};
use crate::registry::{DEFAULT_TYPE, DatastreamSpec, ObjectType, RELS_EXT_ID, TypeRegistry};
use crate::rels::{self, Statement};

pub struct DigitalObject {
    client: Arc<dyn RepositoryClient>,
    object_type: ObjectType,
    pid: Option<String>,
    ingested: bool,
    profile: ObjectProfile,
    profile_loaded: bool,
    datastreams: Vec<DatastreamObject>,
}

impl DigitalObject {
    /// New, uningested object of a registered type. Without a pid the server
    /// allocates one on save.
    pub fn new(
        client: Arc<dyn RepositoryClient>,
        registry: &TypeRegistry,
        type_id: &str,
        pid: Option<&str>,
    ) -> Result<Self> {
        let object_type = registry.resolve(type_id)?.clone();
        let datastreams = object_type
            .datastreams
            .iter()
            .map(|spec| DatastreamObject::new(client.clone(), spec))
            .collect();
        Ok(Self {
            client,
            pid: pid.map(str::to_string),
            ingested: false,
            profile: ObjectProfile {
                pid: pid.unwrap_or_default().to_string(),
                content_models: object_type.content_models.clone(),
                ..Default::default()
            },
            profile_loaded: true,
            object_type,
            datastreams,
        })
    }

    /// Existing object, without any remote call
    pub fn bind(client: Arc<dyn RepositoryClient>, registry: &TypeRegistry, type_id: &str, pid: &str) -> Result<Self> {
        let object_type = registry.resolve(type_id)?.clone();
        let datastreams = object_type
            .datastreams
            .iter()
            .map(|spec| DatastreamObject::bound(client.clone(), pid, spec))
            .collect();
        Ok(Self {
            client,
            pid: Some(pid.to_string()),
            ingested: true,
            profile: ObjectProfile {
                pid: pid.to_string(),
                ..Default::default()
            },
            profile_loaded: false,
            object_type,
            datastreams,
        })
    }

    /// Existing object, typed by its first registered content model, with a
    /// tracker for every datastream the server reports
    pub async fn load(client: Arc<dyn RepositoryClient>, registry: &TypeRegistry, pid: &str) -> Result<Self> {
        let profile = client.get_object(pid).await?;
        let type_id = profile
            .content_models
            .iter()
            .find_map(|m| registry.type_for_model(m))
            .map(|t| t.id.clone())
            .unwrap_or_else(|| DEFAULT_TYPE.to_string());

        let mut obj = Self::bind(client.clone(), registry, &type_id, pid)?;
        obj.profile = profile;
        obj.profile_loaded = true;

        for dsid in client.get_datastream_ids(pid).await? {
            if obj.datastream(&dsid).is_none() {
                obj.datastreams
                    .push(DatastreamObject::bound(client.clone(), pid, &DatastreamSpec::new(dsid, "")));
            }
        }
        Ok(obj)
    }

    pub fn pid(&self) -> Option<&str> {
        self.pid.as_deref()
    }

    pub fn is_ingested(&self) -> bool {
        self.ingested
    }

    pub fn object_type(&self) -> &ObjectType {
        &self.object_type
    }

    /// True iff any datastream has pending edits
    pub fn is_dirty(&self) -> bool {
        self.datastreams.iter().any(|ds| ds.is_dirty())
    }

    /// Ids of all tracked datastreams, in commit order
    pub fn datastream_ids(&self) -> Vec<&str> {
        self.datastreams.iter().map(|ds| ds.id()).collect()
    }

    pub fn datastream(&mut self, dsid: &str) -> Option<&mut DatastreamObject> {
        self.datastreams.iter_mut().find(|ds| ds.id() == dsid)
    }

    pub fn dirty_datastreams(&self) -> Vec<&str> {
        self.datastreams
            .iter()
            .filter(|ds| ds.is_dirty())
            .map(|ds| ds.id())
            .collect()
    }

    /// Track an additional datastream not declared by the object type; it is
    /// created on the server by the next save that finds it dirty
    pub fn add_datastream(&mut self, spec: &DatastreamSpec) -> Result<&mut DatastreamObject> {
        if self.datastreams.iter().any(|ds| ds.id() == spec.id()) {
            return Err(RepoError::Invalid(format!("Datastream {} is already tracked", spec.id())));
        }
        let tracker = match (&self.pid, self.ingested) {
            (Some(pid), true) => DatastreamObject::bound(self.client.clone(), pid, spec),
            _ => DatastreamObject::new(self.client.clone(), spec),
        };
        self.datastreams.push(tracker);
        let last = self.datastreams.len() - 1;
        Ok(&mut self.datastreams[last])
    }

    /// Object profile, fetched on first access for ingested objects
    pub async fn profile(&mut self) -> Result<&ObjectProfile> {
        if !self.profile_loaded {
            if let Some(pid) = &self.pid {
                self.profile = self.client.get_object(pid).await?;
            }
            self.profile_loaded = true;
        }
        Ok(&self.profile)
    }

    /// Last modification time as reported by the server
    pub async fn modified(&mut self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.profile().await?.modified)
    }

    fn ensure_uningested(&self, what: &str) -> Result<()> {
        if self.ingested {
            return Err(RepoError::Invalid(format!(
                "Cannot change {} of ingested object {}",
                what,
                self.pid.as_deref().unwrap_or_default()
            )));
        }
        Ok(())
    }

    pub fn set_label(&mut self, label: impl Into<String>) -> Result<()> {
        self.ensure_uningested("label")?;
        self.profile.label = Some(label.into());
        Ok(())
    }

    pub fn set_owner(&mut self, owner: impl Into<String>) -> Result<()> {
        self.ensure_uningested("owner")?;
        self.profile.owner = Some(owner.into());
        Ok(())
    }

    pub fn set_state(&mut self, state: ObjectState) -> Result<()> {
        self.ensure_uningested("state")?;
        self.profile.state = state;
        Ok(())
    }

    /// Persist pending changes.
    ///
    /// Saving a clean ingested object makes no remote call at all.
    pub async fn save(&mut self, log_message: Option<&str>) -> Result<()> {
        if self.ingested {
            self.save_datastreams(log_message).await
        } else {
            self.ingest(log_message).await
        }
    }

    /// Add `hasModel` statements for the type's content models to RELS-EXT
    fn apply_content_models(&mut self) -> Result<()> {
        if self.object_type.content_models.is_empty() {
            return Ok(());
        }
        let pid = self.pid.clone().ok_or_else(|| {
            RepoError::Invalid(format!(
                "Objects of type {} declare content models and need a pid before ingest",
                self.object_type.id
            ))
        })?;
        let models = self.object_type.content_models.clone();
        let rels_ds = self
            .datastreams
            .iter_mut()
            .find(|ds| ds.id() == RELS_EXT_ID)
            .ok_or_else(|| RepoError::Invalid(format!("Object type {} has no RELS-EXT", self.object_type.id)))?;

        let mut rels_xml = rels_ds.pending_or_default_content().to_vec();
        let existing = rels::statement_values(&rels_xml, "hasModel");
        for model in models {
            let uri = if model.starts_with("info:fedora/") {
                model
            } else {
                format!("info:fedora/{}", model)
            };
            if !existing.contains(&uri) {
                rels_xml = rels::set_statement(&rels_xml, &pid, &Statement::has_model(&uri), false)?.into_bytes();
            }
        }
        rels_ds.set_content(rels_xml);
        Ok(())
    }

    async fn ingest(&mut self, log_message: Option<&str>) -> Result<()> {
        self.apply_content_models()?;
        for ds in &mut self.datastreams {
            ds.prepare_ingest().await?;
        }

        let doc = FoxmlObject {
            pid: self.pid.clone(),
            properties: FoxmlProperties {
                state: self.profile.state,
                label: self.profile.label.clone(),
                owner: self.profile.owner.clone(),
                created: None,
                modified: None,
            },
            datastreams: self.datastreams.iter().filter_map(|ds| ds.to_foxml()).collect(),
        };
        let included: Vec<String> = doc.datastreams.iter().map(|ds| ds.id.clone()).collect();
        let serialization = foxml::write_object(&doc)?;

        let pid = self
            .client
            .ingest(self.pid.as_deref(), bytes_stream(serialization), log_message)
            .await?;
        if let Some(requested) = &self.pid {
            if *requested != pid {
                return Err(RepoError::Invalid(format!(
                    "Requested pid {} but the server created {}",
                    requested, pid
                )));
            }
        }
        info!("Ingested {} ({} datastreams)", pid, included.len());

        for ds in &mut self.datastreams {
            let was_sent = included.iter().any(|id| id == ds.id());
            ds.mark_ingested(&pid, was_sent);
        }
        self.pid = Some(pid.clone());
        self.profile.pid = pid;
        self.ingested = true;
        self.profile_loaded = false;
        Ok(())
    }

    async fn save_datastreams(&mut self, log_message: Option<&str>) -> Result<()> {
        let pid = self.pid.clone().unwrap_or_default();
        let mut saved = Vec::new();
        let mut failed = Vec::new();
        let mut latest: Option<DateTime<Utc>> = None;

        for ds in self.datastreams.iter_mut().filter(|ds| ds.is_dirty()) {
            if let Some(msg) = log_message {
                ds.set_log_message(msg);
            }
            let dsid = ds.id().to_string();
            match ds.commit(&pid).await {
                Ok(version) => {
                    debug!("Saved {}/{} as {}", pid, dsid, version.version_id);
                    latest = latest.max(Some(version.created));
                    saved.push(dsid);
                }
                Err(e) => {
                    error!("Error saving {}/{}: {}", pid, dsid, e);
                    failed.push((dsid, e));
                }
            }
        }

        if !failed.is_empty() {
            return Err(SaveFailure { pid, failed, saved }.into());
        }
        if let Some(ts) = latest {
            self.profile.modified = Some(ts);
        }
        Ok(())
    }

    /// Remove the object from the repository
    pub async fn purge(self, log_message: Option<&str>) -> Result<()> {
        match (&self.pid, self.ingested) {
            (Some(pid), true) => self.client.purge_object(pid, log_message).await,
            _ => Err(RepoError::Invalid("Cannot purge an object that was never ingested".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRepository;
    use crate::registry::{DC_ID, ObjectType};

    fn registry() -> TypeRegistry {
        let mut registry = TypeRegistry::new();
        registry.register(
            ObjectType::new("text")
                .with_content_model("info:fedora/fedsync:Text-1.0")
                .with_datastream(DatastreamSpec::new("TEXT", "Text").with_mimetype("text/plain")),
        );
        registry
    }

    #[tokio::test]
    async fn test_ingest_new_object() {
        let repo = Arc::new(MemoryRepository::new("test"));
        let mut obj = DigitalObject::new(repo.clone(), &registry(), "text", Some("test:1")).unwrap();
        obj.set_label("A text").unwrap();
        obj.datastream("TEXT").unwrap().set_content("hello world");
        assert!(obj.is_dirty());

        obj.save(Some("create")).await.unwrap();
        assert!(obj.is_ingested());
        assert!(!obj.is_dirty());
        assert_eq!(obj.profile().await.unwrap().label.as_deref(), Some("A text"));
        assert_eq!(
            obj.profile().await.unwrap().content_models,
            vec!["info:fedora/fedsync:Text-1.0"]
        );
        assert_eq!(repo.calls().await.ingests, 1);
        // DC was sent with its default content
        assert!(repo.datastream_content("test:1", DC_ID).await.is_some());
        assert!(obj.set_label("too late").is_err());
    }

    #[tokio::test]
    async fn test_server_allocated_pid() {
        let repo = Arc::new(MemoryRepository::new("test").with_namespace("auto"));
        let mut obj = DigitalObject::new(repo.clone(), &TypeRegistry::new(), DEFAULT_TYPE, None).unwrap();
        obj.save(None).await.unwrap();
        assert_eq!(obj.pid(), Some("auto:1"));
    }

    #[tokio::test]
    async fn test_content_models_need_pid() {
        let repo = Arc::new(MemoryRepository::new("test"));
        let mut obj = DigitalObject::new(repo.clone(), &registry(), "text", None).unwrap();
        assert!(matches!(obj.save(None).await, Err(RepoError::Invalid(_))));
        assert!(!obj.is_ingested());
        assert_eq!(repo.calls().await.ingests, 0);
    }

    #[tokio::test]
    async fn test_load_adds_undeclared_datastreams() {
        let repo = Arc::new(MemoryRepository::new("test"));
        let reg = registry();
        let mut obj = DigitalObject::new(repo.clone(), &reg, "text", Some("test:1")).unwrap();
        obj.add_datastream(&DatastreamSpec::xml("EXTRA", "Extra")).unwrap().set_content("<x/>");
        obj.datastream("TEXT").unwrap().set_content("hello");
        obj.save(None).await.unwrap();

        let loaded = DigitalObject::load(repo.clone(), &reg, "test:1").await.unwrap();
        assert_eq!(loaded.object_type().id, "text");
        assert_eq!(loaded.datastream_ids(), vec!["DC", "RELS-EXT", "TEXT", "EXTRA"]);
    }
}
