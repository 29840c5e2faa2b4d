//! Object type registry
//!
//! Maps an object-type identifier to the ordered list of datastreams that
//! objects of that type are expected to carry. Trackers for these datastreams
//! are created when a [`DigitalObject`](crate::DigitalObject) is constructed,
//! in declaration order, which is also the commit order on save.

use bytes::Bytes;
use std::collections::HashMap;

use crate::error::{RepoError, Result};
use crate::model::{ChecksumAlgorithm, ControlGroup, DatastreamDescriptor};

/// Identifier of the built-in type every registry starts with
pub const DEFAULT_TYPE: &str = "fedora-object";

/// Dublin Core datastream id
pub const DC_ID: &str = "DC";

/// External relations (RDF) datastream id
pub const RELS_EXT_ID: &str = "RELS-EXT";

const OAI_DC_FORMAT: &str = "http://www.openarchives.org/OAI/2.0/oai_dc/";
const RELS_EXT_FORMAT: &str = "info:fedora/fedora-system:FedoraRELSExt-1.0";

const EMPTY_DC: &str = concat!(
    r#"<oai_dc:dc xmlns:oai_dc="http://www.openarchives.org/OAI/2.0/oai_dc/" "#,
    r#"xmlns:dc="http://purl.org/dc/elements/1.1/"/>"#
);

/// Declaration of one datastream on an object type
#[derive(Debug, Clone)]
pub struct DatastreamSpec {
    pub descriptor: DatastreamDescriptor,
    /// Content used for new objects when nothing else was set
    pub default_content: Option<Bytes>,
}

impl DatastreamSpec {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            descriptor: DatastreamDescriptor::new(id, label),
            default_content: None,
        }
    }

    /// Inline XML datastream
    pub fn xml(id: impl Into<String>, label: impl Into<String>) -> Self {
        let mut spec = Self::new(id, label);
        spec.descriptor.control_group = ControlGroup::Inline;
        spec.descriptor.mimetype = "text/xml".to_string();
        spec
    }

    /// Inline RDF datastream
    pub fn rdf(id: impl Into<String>, label: impl Into<String>) -> Self {
        let mut spec = Self::xml(id, label);
        spec.descriptor.mimetype = "application/rdf+xml".to_string();
        spec
    }

    pub fn with_mimetype(mut self, mimetype: impl Into<String>) -> Self {
        self.descriptor.mimetype = mimetype.into();
        self
    }

    pub fn with_format(mut self, format_uri: impl Into<String>) -> Self {
        self.descriptor.format_uri = Some(format_uri.into());
        self
    }

    pub fn with_versionable(mut self, versionable: bool) -> Self {
        self.descriptor.versionable = versionable;
        self
    }

    pub fn with_checksum_type(mut self, algorithm: ChecksumAlgorithm) -> Self {
        self.descriptor.checksum_type = algorithm;
        self
    }

    pub fn with_control_group(mut self, control_group: ControlGroup) -> Self {
        self.descriptor.control_group = control_group;
        self
    }

    pub fn with_default_content(mut self, content: impl Into<Bytes>) -> Self {
        self.default_content = Some(content.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }
}

/// A registered object type: content models plus ordered datastream specs
#[derive(Debug, Clone)]
pub struct ObjectType {
    pub id: String,
    pub content_models: Vec<String>,
    pub datastreams: Vec<DatastreamSpec>,
}

impl ObjectType {
    /// New type carrying the standard `DC` and `RELS-EXT` datastreams
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content_models: Vec::new(),
            datastreams: vec![
                DatastreamSpec::xml(DC_ID, "Dublin Core")
                    .with_format(OAI_DC_FORMAT)
                    .with_default_content(EMPTY_DC),
                DatastreamSpec::rdf(RELS_EXT_ID, "External Relations").with_format(RELS_EXT_FORMAT),
            ],
        }
    }

    pub fn with_content_model(mut self, uri: impl Into<String>) -> Self {
        self.content_models.push(uri.into());
        self
    }

    /// Append a datastream, replacing an inherited one with the same id in place
    pub fn with_datastream(mut self, spec: DatastreamSpec) -> Self {
        match self.datastreams.iter_mut().find(|s| s.id() == spec.id()) {
            Some(existing) => *existing = spec,
            None => self.datastreams.push(spec),
        }
        self
    }

    pub fn spec(&self, dsid: &str) -> Option<&DatastreamSpec> {
        self.datastreams.iter().find(|s| s.id() == dsid)
    }
}

/// Registry of object types, resolved at object construction time
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    types: HashMap<String, ObjectType>,
}

impl TypeRegistry {
    /// Create a registry holding only [`DEFAULT_TYPE`]
    pub fn new() -> Self {
        let mut types = HashMap::new();
        types.insert(DEFAULT_TYPE.to_string(), ObjectType::new(DEFAULT_TYPE));
        Self { types }
    }

    pub fn register(&mut self, object_type: ObjectType) {
        self.types.insert(object_type.id.clone(), object_type);
    }

    pub fn get(&self, type_id: &str) -> Option<&ObjectType> {
        self.types.get(type_id)
    }

    pub fn resolve(&self, type_id: &str) -> Result<&ObjectType> {
        self.get(type_id)
            .ok_or_else(|| RepoError::Invalid(format!("Unknown object type: {}", type_id)))
    }

    /// Find the registered type declaring the given content model, if any
    pub fn type_for_model(&self, content_model: &str) -> Option<&ObjectType> {
        let mut matches: Vec<&ObjectType> = self
            .types
            .values()
            .filter(|t| t.content_models.iter().any(|m| m == content_model))
            .collect();
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        matches.into_iter().next()
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_type_has_base_datastreams() {
        let registry = TypeRegistry::new();
        let t = registry.resolve(DEFAULT_TYPE).unwrap();
        let ids: Vec<&str> = t.datastreams.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec![DC_ID, RELS_EXT_ID]);
        assert_eq!(t.spec(DC_ID).unwrap().descriptor.control_group, ControlGroup::Inline);
        assert!(t.spec(DC_ID).unwrap().default_content.is_some());
    }

    #[test]
    fn test_register_preserves_declaration_order() {
        let mut registry = TypeRegistry::new();
        registry.register(
            ObjectType::new("image")
                .with_content_model("info:fedora/emory-control:Image-1.0")
                .with_datastream(DatastreamSpec::new("IMAGE", "Master image").with_mimetype("image/tiff"))
                .with_datastream(DatastreamSpec::xml("MODS", "Descriptive metadata")),
        );
        let t = registry.resolve("image").unwrap();
        let ids: Vec<&str> = t.datastreams.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec!["DC", "RELS-EXT", "IMAGE", "MODS"]);
        assert_eq!(
            registry.type_for_model("info:fedora/emory-control:Image-1.0").unwrap().id,
            "image"
        );
    }

    #[test]
    fn test_override_inherited_datastream() {
        let t = ObjectType::new("custom").with_datastream(DatastreamSpec::xml(DC_ID, "Custom DC"));
        assert_eq!(t.datastreams.len(), 2);
        assert_eq!(t.datastreams[0].descriptor.label, "Custom DC");
    }

    #[test]
    fn test_unknown_type() {
        let registry = TypeRegistry::default();
        assert!(registry.resolve("nope").is_err());
    }
}
