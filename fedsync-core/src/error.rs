//! Error taxonomy for repository operations
//!
//! Every remote call made through a [`RepositoryClient`](crate::RepositoryClient)
//! reports failures as a [`RepoError`]. Batch runs (fixity, sync) catch these at
//! the per-object boundary; a single `save()` surfaces them to its caller.

use std::fmt;

/// Result type for repository operations
pub type Result<T> = std::result::Result<T, RepoError>;

/// Errors that can occur while talking to a repository
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Digest recorded for a datastream could not be reproduced by the server.
    #[error("{detail}")]
    ChecksumMismatch { detail: String },

    #[error("Request failed ({status}): {detail}")]
    RequestFailed { status: u16, detail: String },

    #[error(transparent)]
    Save(#[from] SaveFailure),

    /// Best-effort metadata write-back failed; never fatal to a batch run.
    #[error("Failed to persist metadata on {pid}: {source}")]
    Persistence {
        pid: String,
        #[source]
        source: Box<RepoError>,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("Invalid operation: {0}")]
    Invalid(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RepoError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RepoError::NotFound(_))
    }

    pub fn is_checksum_mismatch(&self) -> bool {
        matches!(self, RepoError::ChecksumMismatch { .. })
    }

    /// Build a `ChecksumMismatch` from a raw server message, keeping only the
    /// part starting at the `Checksum Mismatch` label when present.
    pub fn checksum_mismatch(raw: &str) -> Self {
        let detail = match raw.find(CHECKSUM_MISMATCH_LABEL) {
            Some(idx) => raw[idx..].trim().to_string(),
            None => raw.trim().to_string(),
        };
        RepoError::ChecksumMismatch { detail }
    }
}

/// Label the server uses in checksum validation failures.
pub const CHECKSUM_MISMATCH_LABEL: &str = "Checksum Mismatch";

impl From<quick_xml::Error> for RepoError {
    fn from(e: quick_xml::Error) -> Self {
        RepoError::Xml(e.to_string())
    }
}

impl From<reqwest::Error> for RepoError {
    fn from(e: reqwest::Error) -> Self {
        RepoError::Transport(e.to_string())
    }
}

/// One or more datastream commits failed during a save.
///
/// Commits are individual remote calls, so datastreams listed in `saved`
/// are already applied on the server; nothing is rolled back.
#[derive(Debug)]
pub struct SaveFailure {
    pub pid: String,
    /// `(datastream id, cause)` for every commit that failed, in commit order.
    pub failed: Vec<(String, RepoError)>,
    /// Datastream ids committed successfully in the same pass.
    pub saved: Vec<String>,
}

impl SaveFailure {
    pub fn failed_ids(&self) -> Vec<&str> {
        self.failed.iter().map(|(id, _)| id.as_str()).collect()
    }
}

impl fmt::Display for SaveFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error saving {} - failed to save ", self.pid)?;
        for (i, (dsid, err)) in self.failed.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} ({})", dsid, err)?;
        }
        write!(f, "; saved {}", self.saved.join(", "))
    }
}

impl std::error::Error for SaveFailure {}
