//! Datastream checksum computation and comparison
//!
//! Digests are computed incrementally over content chunks so a datastream of
//! any size can be verified without holding it in memory.

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::Serialize;
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::client::ByteStream;
use crate::error::Result;
use crate::model::{ChecksumAlgorithm, DatastreamVersion};

/// Incremental digest over one of the supported algorithms
pub enum Digester {
    Md5(md5::Context),
    Sha1(sha1::Sha1),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl Digester {
    /// Returns `None` for [`ChecksumAlgorithm::Disabled`]
    pub fn new(algorithm: ChecksumAlgorithm) -> Option<Self> {
        match algorithm {
            ChecksumAlgorithm::Md5 => Some(Digester::Md5(md5::Context::new())),
            ChecksumAlgorithm::Sha1 => Some(Digester::Sha1(sha1::Sha1::new())),
            ChecksumAlgorithm::Sha256 => Some(Digester::Sha256(Sha256::new())),
            ChecksumAlgorithm::Sha384 => Some(Digester::Sha384(Sha384::new())),
            ChecksumAlgorithm::Sha512 => Some(Digester::Sha512(Sha512::new())),
            ChecksumAlgorithm::Disabled => None,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Digester::Md5(ctx) => ctx.consume(data),
            Digester::Sha1(h) => h.update(data),
            Digester::Sha256(h) => h.update(data),
            Digester::Sha384(h) => h.update(data),
            Digester::Sha512(h) => h.update(data),
        }
    }

    /// Finish and return the lowercase hex digest
    pub fn finalize_hex(self) -> String {
        match self {
            Digester::Md5(ctx) => format!("{:x}", ctx.compute()),
            Digester::Sha1(h) => hex::encode(h.finalize()),
            Digester::Sha256(h) => hex::encode(h.finalize()),
            Digester::Sha384(h) => hex::encode(h.finalize()),
            Digester::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

/// Digest a complete buffer
pub fn digest_bytes(algorithm: ChecksumAlgorithm, data: &[u8]) -> Option<String> {
    let mut digester = Digester::new(algorithm)?;
    digester.update(data);
    Some(digester.finalize_hex())
}

/// Digest a content stream chunk by chunk, returning the hex digest and the
/// number of bytes consumed.
pub async fn digest_stream(
    algorithm: ChecksumAlgorithm,
    mut stream: ByteStream,
) -> Result<Option<(String, u64)>> {
    let mut digester = match Digester::new(algorithm) {
        Some(d) => d,
        None => return Ok(None),
    };
    let mut size = 0u64;
    while let Some(chunk) = stream.try_next().await? {
        size += chunk.len() as u64;
        digester.update(&chunk);
    }
    Ok(Some((digester.finalize_hex(), size)))
}

/// Outcome of comparing computed against recorded digest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumVerdict {
    Valid,
    Invalid,
    /// No usable digest or algorithm recorded; nothing to compare against
    Unchecked,
}

/// Result of checking one datastream version
#[derive(Debug, Clone)]
pub struct ChecksumRecord {
    pub dsid: String,
    pub version_created: DateTime<Utc>,
    pub expected: Option<String>,
    pub computed: Option<String>,
    pub algorithm: Option<ChecksumAlgorithm>,
    pub verdict: ChecksumVerdict,
}

/// Recorded digest that can actually be compared against, if any
fn recorded_digest(version: &DatastreamVersion) -> Option<(ChecksumAlgorithm, String)> {
    let algorithm = version.algorithm?;
    if algorithm == ChecksumAlgorithm::Disabled {
        return None;
    }
    let digest = version.digest.as_deref()?.trim();
    if digest.is_empty() || digest.eq_ignore_ascii_case("none") {
        return None;
    }
    Some((algorithm, digest.to_ascii_lowercase()))
}

/// Whether a version has anything to verify
pub fn is_checkable(version: &DatastreamVersion) -> bool {
    recorded_digest(version).is_some()
}

/// Recompute the digest of `content` and compare it to what `version` records.
///
/// Content is only consumed when the version records a usable digest.
pub async fn verify_version(version: &DatastreamVersion, content: ByteStream) -> Result<ChecksumRecord> {
    let mut record = ChecksumRecord {
        dsid: version.dsid.clone(),
        version_created: version.created,
        expected: version.digest.clone(),
        computed: None,
        algorithm: version.algorithm,
        verdict: ChecksumVerdict::Unchecked,
    };

    let (algorithm, expected) = match recorded_digest(version) {
        Some(r) => r,
        None => return Ok(record),
    };

    if let Some((computed, _size)) = digest_stream(algorithm, content).await? {
        record.verdict = if computed == expected {
            ChecksumVerdict::Valid
        } else {
            ChecksumVerdict::Invalid
        };
        record.computed = Some(computed);
    }
    Ok(record)
}
