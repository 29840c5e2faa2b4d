//! Checksum repair integration tests against the in-memory repository

use fedsync_core::{
    ChecksumAlgorithm, ChecksumRepairer, MemoryRepository, RepairOptions, RepositoryClient, TerminationReason,
    WorkList, bytes_stream,
};
use std::sync::Arc;

fn foxml(pid: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<foxml:digitalObject VERSION="1.1" PID="{pid}" xmlns:foxml="info:fedora/fedora-system:def/foxml#">
<foxml:objectProperties>
<foxml:property NAME="info:fedora/fedora-system:def/model#label" VALUE="repair fixture"/>
</foxml:objectProperties>
<foxml:datastream ID="GOOD" STATE="A" CONTROL_GROUP="M" VERSIONABLE="true">
<foxml:datastreamVersion ID="GOOD.0" LABEL="good" MIMETYPE="text/plain">
<foxml:contentDigest TYPE="MD5"/>
<foxml:binaryContent>Z29vZGJ5ZQ==</foxml:binaryContent>
</foxml:datastreamVersion>
</foxml:datastream>
<foxml:datastream ID="BARE" STATE="A" CONTROL_GROUP="M" VERSIONABLE="true">
<foxml:datastreamVersion ID="BARE.0" LABEL="bare" MIMETYPE="text/plain">
<foxml:contentDigest TYPE="MD5"/>
<foxml:binaryContent>aGVsbG8gd29ybGQ=</foxml:binaryContent>
</foxml:datastreamVersion>
</foxml:datastream>
</foxml:digitalObject>"#
    )
}

/// Repository with `count` objects whose BARE datastream has no checksum
async fn fixture(count: usize) -> Arc<MemoryRepository> {
    let repo = Arc::new(MemoryRepository::new("test"));
    for n in 1..=count {
        let pid = format!("test:{}", n);
        repo.ingest(Some(&pid), bytes_stream(foxml(&pid)), None).await.unwrap();
        repo.disable_checksums(&pid, "BARE").await.unwrap();
    }
    repo
}

#[tokio::test]
async fn test_repair_sets_checksum_type() {
    let repo = fixture(1).await;
    let repairer = ChecksumRepairer::new(repo.clone(), RepairOptions::default());

    let mut out = Vec::new();
    let report = repairer.run(WorkList::Pids(vec!["test:1".to_string()]), &mut out).await;
    assert_eq!(report.termination, TerminationReason::Exhausted);
    assert_eq!(report.stats.objects, 1);
    assert_eq!(report.stats.repaired, 1);
    assert_eq!(report.stats.errors, 0);
    assert_eq!(String::from_utf8(out).unwrap(), "test:1/BARE: set checksum type MD5\n");

    let info = repo.get_datastream_info("test:1", "BARE").await.unwrap();
    assert_eq!(info.descriptor.checksum_type, ChecksumAlgorithm::Md5);
    assert_eq!(info.version.digest.as_deref(), Some("5eb63bbbe01eeed093cb22bb8f5acdc3"));

    // a second pass finds nothing to do
    let report = repairer
        .run(WorkList::Pids(vec!["test:1".to_string()]), &mut std::io::sink())
        .await;
    assert_eq!(report.stats.repaired, 0);
}

#[tokio::test]
async fn test_repair_with_other_algorithm() {
    let repo = fixture(1).await;
    let options = RepairOptions::default().with_checksum_type(ChecksumAlgorithm::Sha1);
    let report = ChecksumRepairer::new(repo.clone(), options)
        .run(WorkList::Pids(vec!["test:1".to_string()]), &mut std::io::sink())
        .await;
    assert_eq!(report.stats.repaired, 1);

    let info = repo.get_datastream_info("test:1", "BARE").await.unwrap();
    assert_eq!(info.descriptor.checksum_type, ChecksumAlgorithm::Sha1);
    assert_eq!(info.version.digest.as_deref(), Some("2aae6c35c94fcfb415dbe95f408b9ce91ee846ed"));
}

#[tokio::test]
async fn test_dry_run_changes_nothing() {
    let repo = fixture(1).await;
    let options = RepairOptions::default().with_dry_run(true);
    let mut out = Vec::new();
    let report = ChecksumRepairer::new(repo.clone(), options)
        .run(WorkList::Pids(vec!["test:1".to_string()]), &mut out)
        .await;

    assert!(report.dry_run);
    assert_eq!(report.stats.repaired, 1);
    assert_eq!(String::from_utf8(out).unwrap(), "test:1/BARE: would set checksum type MD5\n");
    assert_eq!(repo.calls().await.commits, 0);
    let info = repo.get_datastream_info("test:1", "BARE").await.unwrap();
    assert_eq!(info.descriptor.checksum_type, ChecksumAlgorithm::Disabled);
}

#[tokio::test]
async fn test_all_objects_work_list() {
    let repo = fixture(3).await;
    let report = ChecksumRepairer::new(repo.clone(), RepairOptions::default())
        .run(WorkList::All, &mut std::io::sink())
        .await;
    assert_eq!(report.termination, TerminationReason::Exhausted);
    assert_eq!(report.stats.objects, 3);
    assert_eq!(report.stats.repaired, 3);
}

#[tokio::test]
async fn test_missing_object_is_counted() {
    let repo = fixture(1).await;
    let report = ChecksumRepairer::new(repo.clone(), RepairOptions::default())
        .run(
            WorkList::Pids(vec!["test:404".to_string(), "test:1".to_string()]),
            &mut std::io::sink(),
        )
        .await;
    assert_eq!(report.stats.errors, 1);
    assert_eq!(report.stats.objects, 1);
    assert_eq!(report.stats.repaired, 1);
}

#[tokio::test]
async fn test_work_list_failure_ends_run() {
    let repo = fixture(1).await;
    repo.fail_queries().await;
    let report = ChecksumRepairer::new(repo.clone(), RepairOptions::default())
        .run(WorkList::All, &mut std::io::sink())
        .await;
    assert_eq!(report.termination, TerminationReason::WorkListFailed);
    assert_eq!(report.stats.errors, 1);
}

#[tokio::test]
async fn test_stop_before_first_object() {
    let repo = fixture(2).await;
    let repairer = ChecksumRepairer::new(repo.clone(), RepairOptions::default());
    repairer.stop_token().signal();
    let report = repairer.run(WorkList::All, &mut std::io::sink()).await;
    assert_eq!(report.termination, TerminationReason::Interrupted);
    assert_eq!(report.stats.objects, 0);
}
