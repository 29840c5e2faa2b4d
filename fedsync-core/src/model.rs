//! Core data model for repository objects
//!
//! A digital object is a container of named, independently versioned
//! datastreams. These types describe what the server reports about objects,
//! datastreams and their committed versions.

use chrono::{DateTime, Utc};
use std::fmt;

use crate::error::{RepoError, Result};

/// Object or datastream state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObjectState {
    #[default]
    Active,
    Inactive,
    Deleted,
}

impl ObjectState {
    /// Single-letter code used on the wire
    pub fn code(&self) -> &'static str {
        match self {
            ObjectState::Active => "A",
            ObjectState::Inactive => "I",
            ObjectState::Deleted => "D",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "A" | "Active" => Some(ObjectState::Active),
            "I" | "Inactive" => Some(ObjectState::Inactive),
            "D" | "Deleted" => Some(ObjectState::Deleted),
            _ => None,
        }
    }
}

/// How datastream content is stored and retrieved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlGroup {
    /// Inline XML, stored within the object serialization
    Inline,
    /// Managed content, stored by the repository
    #[default]
    Managed,
    /// Redirect to an external URL
    Redirect,
    /// External content, pulled by the repository on access
    External,
}

impl ControlGroup {
    pub fn code(&self) -> &'static str {
        match self {
            ControlGroup::Inline => "X",
            ControlGroup::Managed => "M",
            ControlGroup::Redirect => "R",
            ControlGroup::External => "E",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "X" => Some(ControlGroup::Inline),
            "M" => Some(ControlGroup::Managed),
            "R" => Some(ControlGroup::Redirect),
            "E" => Some(ControlGroup::External),
            _ => None,
        }
    }
}

/// Digest algorithm declared for a datastream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChecksumAlgorithm {
    #[default]
    Md5,
    Sha1,
    Sha256,
    Sha384,
    Sha512,
    /// Checksumming switched off for this datastream
    Disabled,
}

impl ChecksumAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Md5 => "MD5",
            ChecksumAlgorithm::Sha1 => "SHA-1",
            ChecksumAlgorithm::Sha256 => "SHA-256",
            ChecksumAlgorithm::Sha384 => "SHA-384",
            ChecksumAlgorithm::Sha512 => "SHA-512",
            ChecksumAlgorithm::Disabled => "DISABLED",
        }
    }

    /// Parse a declared algorithm name; unknown names yield `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "MD5" => Some(ChecksumAlgorithm::Md5),
            "SHA-1" | "SHA1" => Some(ChecksumAlgorithm::Sha1),
            "SHA-256" | "SHA256" => Some(ChecksumAlgorithm::Sha256),
            "SHA-384" | "SHA384" => Some(ChecksumAlgorithm::Sha384),
            "SHA-512" | "SHA512" => Some(ChecksumAlgorithm::Sha512),
            "DISABLED" => Some(ChecksumAlgorithm::Disabled),
            _ => None,
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ChecksumAlgorithm {
    type Err = RepoError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s).ok_or_else(|| RepoError::Invalid(format!("Unknown checksum type: {}", s)))
    }
}

/// Object-level profile as reported by the server
#[derive(Debug, Clone, Default)]
pub struct ObjectProfile {
    pub pid: String,
    pub label: Option<String>,
    pub owner: Option<String>,
    pub state: ObjectState,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    /// Content-model URIs the object declares
    pub content_models: Vec<String>,
}

/// Static datastream metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatastreamDescriptor {
    pub id: String,
    pub label: String,
    pub mimetype: String,
    pub versionable: bool,
    pub control_group: ControlGroup,
    pub checksum_type: ChecksumAlgorithm,
    pub format_uri: Option<String>,
    pub state: ObjectState,
}

impl DatastreamDescriptor {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            mimetype: DEFAULT_MIMETYPE.to_string(),
            versionable: true,
            control_group: ControlGroup::Managed,
            checksum_type: ChecksumAlgorithm::Md5,
            format_uri: None,
            state: ObjectState::Active,
        }
    }
}

/// Mimetype used when nothing else is declared
pub const DEFAULT_MIMETYPE: &str = "application/octet-stream";

/// One committed, immutable revision of a datastream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatastreamVersion {
    /// Datastream id this version belongs to
    pub dsid: String,
    /// Version identifier, e.g. `DC.3`
    pub version_id: String,
    pub label: String,
    pub mimetype: String,
    pub created: DateTime<Utc>,
    pub size: u64,
    /// Recorded digest (lowercase hex); `None` when the server recorded none
    pub digest: Option<String>,
    /// Recorded algorithm; `None` when the declared name is not recognized
    pub algorithm: Option<ChecksumAlgorithm>,
    /// Content location for redirect/external datastreams
    pub location: Option<String>,
}

impl DatastreamVersion {
    pub fn version_ref(&self) -> VersionRef {
        VersionRef {
            dsid: self.dsid.clone(),
            version_id: self.version_id.clone(),
            created: self.created,
        }
    }
}

/// Reference to a committed version, returned by commit operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRef {
    pub dsid: String,
    pub version_id: String,
    pub created: DateTime<Utc>,
}

/// Format a timestamp the way the server expects it (millisecond precision, UTC)
pub fn format_fedora_time(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Parse a server timestamp
pub fn parse_fedora_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepoError::Xml(format!("Invalid timestamp '{}': {}", value, e)))
}
