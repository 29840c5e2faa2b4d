//! fedsync Core Library
//!
//! Client-side integrity and synchronization for datastream-oriented object
//! repositories:
//! - Data model and object type registry
//! - Repository client trait with HTTP and in-memory implementations
//! - Datastream working copies and the object save protocol
//! - FOXML serialization and streaming export rewriting
//! - Fixity validation with count/time budgets and cooperative stop
//! - Checksum repair for datastreams stored without a checksum
//! - Cross-repository copy with checksum-mismatch repair
//! - Directory "airlocks" standing in for a repository

pub mod airlock;
pub mod checksum;
pub mod client;
pub mod datastream;
pub mod error;
pub mod fixity;
pub mod foxml;
pub mod http;
pub mod memory;
pub mod model;
pub mod object;
pub mod profile;
pub mod registry;
pub mod repair;
pub mod rels;
pub mod sync;

pub use airlock::AirlockRepository;
pub use checksum::{ChecksumRecord, ChecksumVerdict};
pub use client::{
    ByteStream, ContentSource, DatastreamContent, DatastreamInfo, DatastreamUpdate, ExportContext, QueryRow,
    RepositoryClient, RowStream, bytes_stream, collect_bytes, file_stream,
};
pub use datastream::DatastreamObject;
pub use error::{RepoError, Result, SaveFailure};
pub use fixity::{
    FINDINGS_CSV_HEADER, FindingStatus, FixityFinding, FixityOptions, FixityReport, FixityStats, FixityValidator,
    StopToken, TerminationReason, WorkList, csv_line,
};
pub use http::{DEFAULT_READ_TIMEOUT_SECS, HttpOptions, HttpRepository};
pub use memory::{CallCounts, MemoryRepository, UPLOAD_SCHEME};
pub use model::{
    ChecksumAlgorithm, ControlGroup, DatastreamDescriptor, DatastreamVersion, ObjectProfile, ObjectState, VersionRef,
};
pub use object::DigitalObject;
pub use registry::{DatastreamSpec, ObjectType, TypeRegistry};
pub use repair::{ChecksumRepairer, RepairOptions, RepairReport, RepairStats};
pub use sync::{
    DEFAULT_STRIP_DIGESTS, EXPORT_OVERHEAD, ProgressFn, SyncEndpoint, SyncEngine, SyncOptions, SyncOutcome,
    SyncReport, SyncResult, SyncTask, TransferProgress, base64_size, estimate_object_size, format_size,
};
