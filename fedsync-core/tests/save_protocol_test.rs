//! Save protocol integration tests against the in-memory repository

use bytes::Bytes;
use fedsync_core::{
    ByteStream, ControlGroup, DatastreamSpec, DigitalObject, MemoryRepository, ObjectType, RepoError,
    RepositoryClient, TypeRegistry,
};
use std::sync::Arc;

fn registry() -> TypeRegistry {
    let mut registry = TypeRegistry::new();
    registry.register(
        ObjectType::new("pair")
            .with_datastream(DatastreamSpec::new("A", "First").with_mimetype("text/plain"))
            .with_datastream(DatastreamSpec::new("B", "Second").with_mimetype("text/plain")),
    );
    registry
}

async fn ingested(repo: &Arc<MemoryRepository>, pid: &str) {
    let mut obj = DigitalObject::new(repo.clone(), &registry(), "pair", Some(pid)).unwrap();
    obj.set_label("pair object").unwrap();
    obj.datastream("A").unwrap().set_content("a0");
    obj.datastream("B").unwrap().set_content("b0");
    obj.save(Some("create")).await.unwrap();
}

#[tokio::test]
async fn test_save_without_changes_is_noop() {
    let repo = Arc::new(MemoryRepository::new("test"));
    ingested(&repo, "test:1").await;
    let before = repo.get_object("test:1").await.unwrap().modified;
    let calls_before = repo.calls().await;

    let mut obj = DigitalObject::bind(repo.clone(), &registry(), "pair", "test:1").unwrap();
    assert!(!obj.is_dirty());
    obj.save(None).await.unwrap();

    assert_eq!(repo.calls().await, calls_before);
    assert_eq!(repo.get_object("test:1").await.unwrap().modified, before);
}

#[tokio::test]
async fn test_partial_failure_reports_failed_and_saved() {
    let repo = Arc::new(MemoryRepository::new("test"));
    ingested(&repo, "test:1").await;
    repo.fail_commit("test:1", "B").await;

    let mut obj = DigitalObject::bind(repo.clone(), &registry(), "pair", "test:1").unwrap();
    obj.datastream("A").unwrap().set_content("a1");
    obj.datastream("B").unwrap().set_content("b1");

    match obj.save(None).await {
        Err(RepoError::Save(failure)) => {
            assert_eq!(failure.pid, "test:1");
            assert_eq!(failure.failed_ids(), vec!["B"]);
            assert_eq!(failure.saved, vec!["A".to_string()]);
        }
        other => panic!("expected save failure, got {:?}", other),
    }

    // A committed and clean, B still pending; no rollback of A
    assert_eq!(obj.dirty_datastreams(), vec!["B"]);
    assert_eq!(repo.datastream_content("test:1", "A").await.unwrap(), Bytes::from_static(b"a1"));
    assert_eq!(repo.datastream_content("test:1", "B").await.unwrap(), Bytes::from_static(b"b0"));

    // retrying commits only what failed
    repo.clear_faults().await;
    let commits = repo.calls().await.commits;
    obj.save(None).await.unwrap();
    assert_eq!(repo.calls().await.commits, commits + 1);
    assert!(!obj.is_dirty());
    assert_eq!(repo.datastream_content("test:1", "B").await.unwrap(), Bytes::from_static(b"b1"));
}

#[tokio::test]
async fn test_commits_follow_declaration_order() {
    let repo = Arc::new(MemoryRepository::new("test"));
    ingested(&repo, "test:1").await;

    let mut obj = DigitalObject::bind(repo.clone(), &registry(), "pair", "test:1").unwrap();
    // edit in reverse order
    obj.datastream("B").unwrap().set_content("b1");
    obj.datastream("A").unwrap().set_content("a1");
    obj.save(None).await.unwrap();

    let a = obj.datastream("A").unwrap().last_commit().unwrap().created;
    let b = obj.datastream("B").unwrap().last_commit().unwrap().created;
    assert!(a < b);
}

#[tokio::test]
async fn test_modified_refreshed_from_server() {
    let repo = Arc::new(MemoryRepository::new("test"));
    ingested(&repo, "test:1").await;

    let mut obj = DigitalObject::bind(repo.clone(), &registry(), "pair", "test:1").unwrap();
    let before = obj.modified().await.unwrap();
    obj.datastream("A").unwrap().set_label("renamed");
    obj.save(None).await.unwrap();

    let after = obj.modified().await.unwrap();
    assert!(after > before);
    assert_eq!(after, repo.get_object("test:1").await.unwrap().modified);
    assert_eq!(after, Some(obj.datastream("A").unwrap().last_commit().unwrap().created));
}

#[tokio::test]
async fn test_set_content_round_trips_before_commit() {
    let repo = Arc::new(MemoryRepository::new("test"));
    ingested(&repo, "test:1").await;

    let mut obj = DigitalObject::bind(repo.clone(), &registry(), "pair", "test:1").unwrap();
    let ds = obj.datastream("A").unwrap();
    ds.set_content("pending");
    assert_eq!(ds.get_content().await.unwrap(), Bytes::from_static(b"pending"));
    assert_eq!(ds.get_content().await.unwrap(), Bytes::from_static(b"pending"));
    assert_eq!(repo.datastream_content("test:1", "A").await.unwrap(), Bytes::from_static(b"a0"));
}

#[tokio::test]
async fn test_failed_ingest_leaves_object_uningested() {
    let repo = Arc::new(MemoryRepository::new("test"));
    ingested(&repo, "test:1").await;

    let mut dup = DigitalObject::new(repo.clone(), &registry(), "pair", Some("test:1")).unwrap();
    dup.datastream("A").unwrap().set_content("other");
    assert!(dup.save(None).await.is_err());
    assert!(!dup.is_ingested());
    assert!(dup.is_dirty());
}

#[tokio::test]
async fn test_content_location_takes_precedence() {
    let repo = Arc::new(MemoryRepository::new("test"));
    ingested(&repo, "test:1").await;

    let mut obj = DigitalObject::bind(repo.clone(), &registry(), "pair", "test:1").unwrap();
    let ds = obj.datastream("A").unwrap();
    ds.set_content("local bytes");
    ds.set_content_location("http://example.org/big.tiff");
    obj.save(None).await.unwrap();

    let info = repo.get_datastream_info("test:1", "A").await.unwrap();
    assert_eq!(info.version.location.as_deref(), Some("http://example.org/big.tiff"));
}

#[tokio::test]
async fn test_new_datastream_on_ingested_object() {
    let repo = Arc::new(MemoryRepository::new("test"));
    ingested(&repo, "test:1").await;

    let mut obj = DigitalObject::bind(repo.clone(), &registry(), "pair", "test:1").unwrap();
    obj.add_datastream(&DatastreamSpec::xml("MODS", "Descriptive metadata"))
        .unwrap()
        .set_content("<mods/>");
    obj.save(None).await.unwrap();

    let info = repo.get_datastream_info("test:1", "MODS").await.unwrap();
    assert_eq!(info.descriptor.control_group, ControlGroup::Inline);
    assert_eq!(info.version.version_id, "MODS.0");
}

#[tokio::test]
async fn test_purge() {
    let repo = Arc::new(MemoryRepository::new("test"));
    ingested(&repo, "test:1").await;
    let obj = DigitalObject::bind(repo.clone(), &registry(), "pair", "test:1").unwrap();
    obj.purge(Some("cleanup")).await.unwrap();
    assert!(!repo.contains("test:1").await);
}

fn chunked(parts: &[&'static str]) -> ByteStream {
    let parts: Vec<fedsync_core::Result<Bytes>> = parts.iter().map(|p| Ok(Bytes::from_static(p.as_bytes()))).collect();
    Box::pin(futures::stream::iter(parts))
}

#[tokio::test]
async fn test_streamed_content_on_ingested_object() {
    let repo = Arc::new(MemoryRepository::new("test"));
    ingested(&repo, "test:1").await;

    let mut obj = DigitalObject::bind(repo.clone(), &registry(), "pair", "test:1").unwrap();
    obj.datastream("A").unwrap().set_content_stream(chunked(&["a", "1", "-streamed"]), Some(11));
    obj.save(None).await.unwrap();

    assert_eq!(
        repo.datastream_content("test:1", "A").await.unwrap(),
        Bytes::from_static(b"a1-streamed")
    );
    let info = repo.get_datastream_info("test:1", "A").await.unwrap();
    // md5("a1-streamed")
    assert_eq!(info.version.digest.as_deref(), Some("694d090ee0e5a5a6ca6d7d7af1082d7b"));
    assert_eq!(repo.calls().await.uploads, 0);
}

#[tokio::test]
async fn test_streamed_content_is_uploaded_for_new_object() {
    let repo = Arc::new(MemoryRepository::new("test"));
    let mut obj = DigitalObject::new(repo.clone(), &registry(), "pair", Some("test:9")).unwrap();
    obj.datastream("A").unwrap().set_content_stream(chunked(&["big ", "content"]), Some(11));
    obj.datastream("B").unwrap().set_content("b0");
    obj.save(None).await.unwrap();

    assert!(obj.is_ingested());
    assert!(!obj.is_dirty());
    assert_eq!(repo.calls().await.uploads, 1);
    assert_eq!(repo.pending_uploads().await, 0);
    assert_eq!(
        repo.datastream_content("test:9", "A").await.unwrap(),
        Bytes::from_static(b"big content")
    );
    let info = repo.get_datastream_info("test:9", "A").await.unwrap();
    assert!(info.version.location.is_none());
    assert!(info.version.digest.is_some());
}
