//! Behavior of the consistency kernel: generation rules, compare-and-swap
//! sentinels, windowed reads, replication, and the integrity check.

use netsy_core::KeyRange;
use netsy_index::{Error, LocalIndex, Order};
use netsy_proto::netsy::Record;

fn draft_create(revision: i64, key: &[u8], value: &[u8]) -> Record {
    Record {
        revision,
        key: key.to_vec(),
        value: value.to_vec(),
        created: true,
        leader_id: "leader-1".to_string(),
        ..Default::default()
    }
}

fn draft_update(revision: i64, key: &[u8], value: &[u8], prev_revision: i64) -> Record {
    Record {
        revision,
        key: key.to_vec(),
        value: value.to_vec(),
        prev_revision,
        leader_id: "leader-1".to_string(),
        ..Default::default()
    }
}

fn draft_delete(revision: i64, key: &[u8], prev_revision: i64) -> Record {
    Record {
        revision,
        key: key.to_vec(),
        deleted: true,
        prev_revision,
        leader_id: "leader-1".to_string(),
        ..Default::default()
    }
}

// ---------------------------------------------------------------
// insert_record: generation rules
// ---------------------------------------------------------------

#[tokio::test]
async fn create_starts_a_generation() {
    let index = LocalIndex::open_in_memory().await.unwrap();

    let inserted = index
        .insert_record(&draft_create(1, b"k", b"v1"), None)
        .await
        .unwrap();

    assert_eq!(inserted.revision, 1);
    assert_eq!(inserted.create_revision, 1);
    assert_eq!(inserted.version, 1);
    assert!(inserted.created);
    assert!(!inserted.deleted);
    assert_eq!(inserted.prev_revision, 0);
    assert!(inserted.created_at.is_some());
}

#[tokio::test]
async fn update_extends_the_generation() {
    let index = LocalIndex::open_in_memory().await.unwrap();
    index
        .insert_record(&draft_create(1, b"k", b"v1"), None)
        .await
        .unwrap();

    let updated = index
        .insert_record(&draft_update(2, b"k", b"v2", 1), None)
        .await
        .unwrap();

    assert_eq!(updated.revision, 2);
    assert_eq!(updated.create_revision, 1);
    assert_eq!(updated.version, 2);
    assert_eq!(updated.prev_revision, 1);
    assert!(!updated.created);
    assert!(!updated.deleted);
}

#[tokio::test]
async fn delete_ends_the_generation() {
    let index = LocalIndex::open_in_memory().await.unwrap();
    index
        .insert_record(&draft_create(1, b"k", b"v1"), None)
        .await
        .unwrap();

    let deleted = index
        .insert_record(&draft_delete(2, b"k", 1), None)
        .await
        .unwrap();

    assert!(deleted.deleted);
    assert_eq!(deleted.version, 0);
    assert_eq!(deleted.create_revision, 1);
    assert!(deleted.value.is_empty());
}

#[tokio::test]
async fn recreate_after_delete_starts_a_new_generation() {
    let index = LocalIndex::open_in_memory().await.unwrap();
    index
        .insert_record(&draft_create(1, b"k", b"v1"), None)
        .await
        .unwrap();
    index
        .insert_record(&draft_delete(2, b"k", 1), None)
        .await
        .unwrap();

    let recreated = index
        .insert_record(&draft_create(3, b"k", b"v2"), None)
        .await
        .unwrap();

    assert_eq!(recreated.create_revision, 3);
    assert_eq!(recreated.version, 1);
    assert!(recreated.created);
}

// ---------------------------------------------------------------
// insert_record: sentinels
// ---------------------------------------------------------------

#[tokio::test]
async fn create_over_live_key_is_create_key_exists() {
    let index = LocalIndex::open_in_memory().await.unwrap();
    index
        .insert_record(&draft_create(1, b"k", b"v1"), None)
        .await
        .unwrap();

    let err = index
        .insert_record(&draft_create(2, b"k", b"v2"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CreateKeyExists));
    assert!(err.is_conflict());
}

#[tokio::test]
async fn delete_of_missing_key_is_delete_key_not_found() {
    let index = LocalIndex::open_in_memory().await.unwrap();

    let err = index
        .insert_record(&draft_delete(1, b"missing", 5), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DeleteKeyNotFound));
}

#[tokio::test]
async fn delete_of_deleted_key_is_delete_key_not_found() {
    let index = LocalIndex::open_in_memory().await.unwrap();
    index
        .insert_record(&draft_create(1, b"k", b"v1"), None)
        .await
        .unwrap();
    index
        .insert_record(&draft_delete(2, b"k", 1), None)
        .await
        .unwrap();

    let err = index
        .insert_record(&draft_delete(3, b"k", 2), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DeleteKeyNotFound));
}

#[tokio::test]
async fn update_with_stale_revision_is_compare_failed() {
    let index = LocalIndex::open_in_memory().await.unwrap();
    index
        .insert_record(&draft_create(1, b"k", b"v1"), None)
        .await
        .unwrap();
    index
        .insert_record(&draft_update(2, b"k", b"v2", 1), None)
        .await
        .unwrap();

    let err = index
        .insert_record(&draft_update(3, b"k", b"v3", 1), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CompareRevisionFailed));
}

#[tokio::test]
async fn update_of_missing_key_is_compare_failed() {
    let index = LocalIndex::open_in_memory().await.unwrap();

    let err = index
        .insert_record(&draft_update(1, b"missing", b"v", 5), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CompareRevisionFailed));
}

#[tokio::test]
async fn delete_with_stale_revision_is_compare_failed() {
    let index = LocalIndex::open_in_memory().await.unwrap();
    index
        .insert_record(&draft_create(1, b"k", b"v1"), None)
        .await
        .unwrap();
    index
        .insert_record(&draft_update(2, b"k", b"v2", 1), None)
        .await
        .unwrap();

    let err = index
        .insert_record(&draft_delete(3, b"k", 1), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CompareRevisionFailed));
}

// ---------------------------------------------------------------
// insert_record: draft validation
// ---------------------------------------------------------------

#[tokio::test]
async fn draft_validation_rejects_bad_drafts() {
    let index = LocalIndex::open_in_memory().await.unwrap();

    let mut no_revision = draft_create(1, b"k", b"v");
    no_revision.revision = 0;
    assert!(matches!(
        index.insert_record(&no_revision, None).await.unwrap_err(),
        Error::InvalidRecord(_)
    ));

    let empty_key = draft_create(1, b"", b"v");
    assert!(matches!(
        index.insert_record(&empty_key, None).await.unwrap_err(),
        Error::InvalidRecord(_)
    ));

    let mut both_flags = draft_create(1, b"k", b"v");
    both_flags.deleted = true;
    assert!(matches!(
        index.insert_record(&both_flags, None).await.unwrap_err(),
        Error::InvalidRecord(_)
    ));

    let mut preset_version = draft_create(1, b"k", b"v");
    preset_version.version = 1;
    assert!(matches!(
        index.insert_record(&preset_version, None).await.unwrap_err(),
        Error::InvalidRecord(_)
    ));

    let mut no_leader = draft_create(1, b"k", b"v");
    no_leader.leader_id = String::new();
    assert!(matches!(
        index.insert_record(&no_leader, None).await.unwrap_err(),
        Error::InvalidRecord(_)
    ));
}

// ---------------------------------------------------------------
// transactions
// ---------------------------------------------------------------

#[tokio::test]
async fn rollback_discards_the_insert() {
    let index = LocalIndex::open_in_memory().await.unwrap();

    let mut tx = index.begin_tx().await.unwrap();
    index
        .insert_record(&draft_create(1, b"k", b"v1"), Some(&mut tx))
        .await
        .unwrap();
    tx.rollback().await.unwrap();

    assert_eq!(index.latest_revision().await.unwrap(), 0);
}

#[tokio::test]
async fn commit_persists_the_insert() {
    let index = LocalIndex::open_in_memory().await.unwrap();

    let mut tx = index.begin_tx().await.unwrap();
    index
        .insert_record(&draft_create(1, b"k", b"v1"), Some(&mut tx))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert_eq!(index.latest_revision().await.unwrap(), 1);
}

// ---------------------------------------------------------------
// replication
// ---------------------------------------------------------------

#[tokio::test]
async fn replicate_reproduces_the_row_exactly() {
    let source = LocalIndex::open_in_memory().await.unwrap();
    source
        .insert_record(&draft_create(1, b"k", b"v1"), None)
        .await
        .unwrap();
    let committed = source
        .insert_record(&draft_update(2, b"k", b"v2", 1), None)
        .await
        .unwrap();

    let replica = LocalIndex::open_in_memory().await.unwrap();
    let first = source.find_record_by_rev(1).await.unwrap().unwrap();
    replica.replicate_record(&first).await.unwrap();
    let replayed = replica.replicate_record(&committed).await.unwrap();

    assert_eq!(replayed.revision, committed.revision);
    assert_eq!(replayed.create_revision, committed.create_revision);
    assert_eq!(replayed.version, committed.version);
    assert_eq!(replayed.prev_revision, committed.prev_revision);
    assert_eq!(replayed.value, committed.value);
    assert!(replayed.replicated_at.is_some());
}

#[tokio::test]
async fn replicate_rejects_revision_zero() {
    let index = LocalIndex::open_in_memory().await.unwrap();
    let mut record = draft_create(1, b"k", b"v");
    record.revision = 0;
    assert!(index.replicate_record(&record).await.is_err());
}

// ---------------------------------------------------------------
// integrity
// ---------------------------------------------------------------

#[tokio::test]
async fn integrity_holds_for_dense_log() {
    let index = LocalIndex::open_in_memory().await.unwrap();
    index
        .insert_record(&draft_create(1, b"a", b"v"), None)
        .await
        .unwrap();
    index
        .insert_record(&draft_create(2, b"b", b"v"), None)
        .await
        .unwrap();

    index.verify_integrity().await.unwrap();
}

#[tokio::test]
async fn integrity_detects_gaps() {
    let index = LocalIndex::open_in_memory().await.unwrap();
    index
        .replicate_record(&draft_create(5, b"k", b"v"))
        .await
        .unwrap();

    let err = index.verify_integrity().await.unwrap_err();
    assert!(matches!(
        err,
        Error::Integrity {
            total: 1,
            latest: 5
        }
    ));
}

// ---------------------------------------------------------------
// reads
// ---------------------------------------------------------------

#[tokio::test]
async fn latest_revision_of_empty_store_is_zero() {
    let index = LocalIndex::open_in_memory().await.unwrap();
    assert_eq!(index.latest_revision().await.unwrap(), 0);
}

#[tokio::test]
async fn find_record_by_rev_returns_the_row() {
    let index = LocalIndex::open_in_memory().await.unwrap();
    index
        .insert_record(&draft_create(1, b"k", b"v1"), None)
        .await
        .unwrap();

    let record = index.find_record_by_rev(1).await.unwrap().unwrap();
    assert_eq!(record.revision, 1);
    assert_eq!(record.key, b"k");
    assert_eq!(record.value, b"v1");

    assert!(index.find_record_by_rev(99).await.unwrap().is_none());
}

#[tokio::test]
async fn get_revision_reports_existence() {
    let index = LocalIndex::open_in_memory().await.unwrap();
    index
        .insert_record(&draft_create(1, b"k", b"v1"), None)
        .await
        .unwrap();

    let status = index.get_revision(1).await.unwrap().unwrap();
    assert_eq!(status.revision, 1);
    assert!(!status.compacted);
    assert!(index.get_revision(2).await.unwrap().is_none());
}

#[tokio::test]
async fn find_records_by_returns_latest_live_per_key() {
    let index = LocalIndex::open_in_memory().await.unwrap();
    index
        .insert_record(&draft_create(1, b"/a", b"a1"), None)
        .await
        .unwrap();
    index
        .insert_record(&draft_update(2, b"/a", b"a2", 1), None)
        .await
        .unwrap();
    index
        .insert_record(&draft_create(3, b"/b", b"b1"), None)
        .await
        .unwrap();
    index
        .insert_record(&draft_delete(4, b"/b", 3), None)
        .await
        .unwrap();

    let result = index
        .find_records_by(&KeyRange::All, 0, 0, Order::Ascending)
        .await
        .unwrap();

    // /b is deleted; only /a's latest survives.
    assert_eq!(result.records.len(), 1);
    assert_eq!(result.records[0].key, b"/a");
    assert_eq!(result.records[0].value, b"a2");
    assert_eq!(result.total_count, 1);
    assert_eq!(result.max_revision, 4);
}

#[tokio::test]
async fn find_records_by_as_of_revision_reads_the_past() {
    let index = LocalIndex::open_in_memory().await.unwrap();
    index
        .insert_record(&draft_create(1, b"/a", b"a1"), None)
        .await
        .unwrap();
    index
        .insert_record(&draft_update(2, b"/a", b"a2", 1), None)
        .await
        .unwrap();

    let result = index
        .find_records_by(&KeyRange::Exact(b"/a".to_vec()), 1, 0, Order::Ascending)
        .await
        .unwrap();

    assert_eq!(result.records.len(), 1);
    assert_eq!(result.records[0].value, b"a1");
    // Header revision still reflects the store head.
    assert_eq!(result.max_revision, 2);
}

#[tokio::test]
async fn find_records_by_windows_and_counts() {
    let index = LocalIndex::open_in_memory().await.unwrap();
    for (i, key) in [b"/a", b"/b", b"/c"].iter().enumerate() {
        index
            .insert_record(&draft_create(i as i64 + 1, *key, b"v"), None)
            .await
            .unwrap();
    }

    let result = index
        .find_records_by(&KeyRange::Prefix(b"/".to_vec()), 0, 2, Order::Ascending)
        .await
        .unwrap();

    assert_eq!(result.records.len(), 2);
    assert_eq!(result.total_count, 3);
    assert_eq!(result.records[0].key, b"/a");
    assert_eq!(result.records[1].key, b"/b");

    let descending = index
        .find_records_by(&KeyRange::Prefix(b"/".to_vec()), 0, 2, Order::Descending)
        .await
        .unwrap();
    assert_eq!(descending.records[0].key, b"/c");
}

#[tokio::test]
async fn find_records_by_empty_result_still_reports_head() {
    let index = LocalIndex::open_in_memory().await.unwrap();
    index
        .insert_record(&draft_create(1, b"/a", b"v"), None)
        .await
        .unwrap();

    let result = index
        .find_records_by(&KeyRange::Exact(b"/zzz".to_vec()), 0, 0, Order::Ascending)
        .await
        .unwrap();

    assert!(result.records.is_empty());
    assert_eq!(result.total_count, 0);
    assert_eq!(result.max_revision, 1);
}

#[tokio::test]
async fn snapshot_scan_includes_deletes_in_revision_order() {
    let index = LocalIndex::open_in_memory().await.unwrap();
    index
        .insert_record(&draft_create(1, b"/a", b"v1"), None)
        .await
        .unwrap();
    index
        .insert_record(&draft_delete(2, b"/a", 1), None)
        .await
        .unwrap();
    index
        .insert_record(&draft_create(3, b"/b", b"v1"), None)
        .await
        .unwrap();

    let records = index.find_all_records_for_snapshot(2).await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].revision, 1);
    assert_eq!(records[1].revision, 2);
    assert!(records[1].deleted);
}

// ---------------------------------------------------------------
// log invariants
// ---------------------------------------------------------------

#[tokio::test]
async fn created_and_deleted_stay_exclusive() {
    let index = LocalIndex::open_in_memory().await.unwrap();
    index
        .insert_record(&draft_create(1, b"k", b"v1"), None)
        .await
        .unwrap();
    index
        .insert_record(&draft_update(2, b"k", b"v2", 1), None)
        .await
        .unwrap();
    index
        .insert_record(&draft_delete(3, b"k", 2), None)
        .await
        .unwrap();

    for revision in 1..=3 {
        let record = index.find_record_by_rev(revision).await.unwrap().unwrap();
        assert!(
            !(record.created && record.deleted),
            "revision {revision} has both flags"
        );
    }
}

#[tokio::test]
async fn prev_revision_chains_consecutive_records() {
    let index = LocalIndex::open_in_memory().await.unwrap();
    index
        .insert_record(&draft_create(1, b"k", b"v1"), None)
        .await
        .unwrap();
    index
        .insert_record(&draft_update(2, b"k", b"v2", 1), None)
        .await
        .unwrap();
    index
        .insert_record(&draft_update(3, b"k", b"v3", 2), None)
        .await
        .unwrap();

    for revision in 2..=3 {
        let record = index.find_record_by_rev(revision).await.unwrap().unwrap();
        assert_eq!(record.prev_revision, revision - 1);
    }
}
