//! The leader transaction engine.
//!
//! `Txn` is the only mutation path. The engine accepts the narrow shape the
//! Kubernetes etcd client emits, serializes every commit under the leader
//! commit mutex, and makes the mutation durable in S3 before the local index
//! transaction commits: a revision is observable locally only if its chunk
//! object exists.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use netsy_index::LocalIndex;
use netsy_proto::etcdserverpb::{
    compare, request_op, response_op, Compare, DeleteRangeResponse, PutResponse, RangeRequest,
    RangeResponse, RequestOp, ResponseHeader, ResponseOp, TxnRequest, TxnResponse,
};
use netsy_proto::netsy::Record;
use netsy_s3::S3Store;

use crate::error::TxnError;
use crate::range;
use crate::snapshot::SnapshotHandle;

/// What a transaction produced: the committed record (absent on a failed
/// compare) and the wire response.
pub struct TxnOutcome {
    pub committed: Option<Record>,
    pub response: TxnResponse,
}

pub struct TxnEngine {
    index: Arc<LocalIndex>,
    s3: Option<Arc<S3Store>>,
    snapshots: Option<SnapshotHandle>,
    instance_id: String,
    // Serializes every mutation; revisions are assigned under this lock, so
    // revision order equals commit order.
    commit_mutex: Mutex<()>,
    next_revision: AtomicI64,
}

impl TxnEngine {
    /// Build the engine, seeding the revision counter from the index.
    pub async fn new(
        index: Arc<LocalIndex>,
        s3: Option<Arc<S3Store>>,
        snapshots: Option<SnapshotHandle>,
        instance_id: String,
    ) -> Result<Self, netsy_index::Error> {
        let latest = index.latest_revision().await?;
        Ok(Self {
            index,
            s3,
            snapshots,
            instance_id,
            commit_mutex: Mutex::new(()),
            next_revision: AtomicI64::new(latest + 1),
        })
    }

    pub fn index(&self) -> &Arc<LocalIndex> {
        &self.index
    }

    /// Execute one transaction. Conflicts (the three index sentinels) are
    /// not errors: they roll back, skip S3, and answer with
    /// `succeeded=false` plus the result of a single-key range on the
    /// compare key.
    pub async fn txn(&self, req: &TxnRequest) -> Result<TxnOutcome, TxnError> {
        let _commit = self.commit_mutex.lock().await;

        let mut draft = parse_txn_request(req)?;
        draft.leader_id = self.instance_id.clone();
        draft.revision = self.next_revision.load(Ordering::SeqCst);

        let inserted = if let Some(s3) = &self.s3 {
            // Synchronous replication: bracket the insert and the S3 put in
            // one index transaction so local state never diverges from S3.
            let mut tx = self.index.begin_tx().await?;
            match self.index.insert_record(&draft, Some(&mut tx)).await {
                Err(err) if err.is_conflict() => {
                    tx.rollback().await?;
                    debug!(key = ?String::from_utf8_lossy(&draft.key), error = %err,
                        "record insert conflict, executing failure range");
                    let range_resp = self.failure_range(&draft.key).await?;
                    return Ok(TxnOutcome {
                        committed: None,
                        response: build_txn_response(None, Some(range_resp)),
                    });
                }
                Err(err) => {
                    tx.rollback().await?;
                    return Err(err.into());
                }
                Ok(inserted) => {
                    if let Err(err) = s3.write_record(&inserted).await {
                        tx.rollback().await?;
                        return Err(err.into());
                    }
                    tx.commit().await?;
                    inserted
                }
            }
        } else {
            // S3 disabled (development): insert with auto-commit.
            match self.index.insert_record(&draft, None).await {
                Err(err) if err.is_conflict() => {
                    debug!(key = ?String::from_utf8_lossy(&draft.key), error = %err,
                        "record insert conflict, executing failure range");
                    let range_resp = self.failure_range(&draft.key).await?;
                    return Ok(TxnOutcome {
                        committed: None,
                        response: build_txn_response(None, Some(range_resp)),
                    });
                }
                Err(err) => return Err(err.into()),
                Ok(inserted) => inserted,
            }
        };

        // Only a durable commit advances the counter.
        self.next_revision.fetch_add(1, Ordering::SeqCst);

        if let Some(snapshots) = &self.snapshots {
            snapshots.observe(inserted.revision, inserted.estimated_size());
        }

        let response = build_txn_response(Some(&inserted), None);
        Ok(TxnOutcome {
            committed: Some(inserted),
            response,
        })
    }

    async fn failure_range(&self, key: &[u8]) -> Result<RangeResponse, TxnError> {
        let req = RangeRequest {
            key: key.to_vec(),
            ..Default::default()
        };
        range::execute(&self.index, &req)
            .await
            .map_err(|status| TxnError::Internal(format!("failure range failed: {status}")))
    }
}

/// Validate a `TxnRequest` against the Kubernetes subset and derive the
/// draft record.
///
/// Accepted shapes, keyed on the compare's mod revision:
///
/// | mod | success | failure        | operation |
/// |-----|---------|----------------|-----------|
/// | 0   | put     | absent or range| create    |
/// | >0  | put     | range          | update    |
/// | >0  | delete  | range          | delete    |
///
/// Everything else is [`TxnError::Unsupported`]; shape violations are
/// [`TxnError::Invalid`].
pub fn parse_txn_request(req: &TxnRequest) -> Result<Record, TxnError> {
    if req.compare.len() != 1
        || req.success.len() != 1
        || req.failure.len() > 1
        || req.compare[0].target != compare::CompareTarget::Mod as i32
        || req.compare[0].result != compare::CompareResult::Equal as i32
    {
        return Err(TxnError::Invalid("missing required fields"));
    }

    let cmp: &Compare = &req.compare[0];
    let compare_key = cmp.key.as_slice();
    let compare_mod_revision = match cmp.target_union {
        Some(compare::TargetUnion::ModRevision(revision)) => revision,
        _ => 0,
    };

    let success_put = match &req.success[0].request {
        Some(request_op::Request::RequestPut(put)) => Some(put),
        _ => None,
    };
    let success_delete = match &req.success[0].request {
        Some(request_op::Request::RequestDeleteRange(delete)) => Some(delete),
        _ => None,
    };

    if let Some(put) = success_put {
        if put.prev_kv {
            return Err(TxnError::Invalid(
                "prev_kv not supported for success put operations",
            ));
        }
        if put.key != compare_key {
            return Err(TxnError::Invalid(
                "key mismatch between compare and success operations",
            ));
        }
    }
    if let Some(delete) = success_delete {
        if delete.prev_kv {
            return Err(TxnError::Invalid(
                "prev_kv not supported for success delete operations",
            ));
        }
        if delete.key != compare_key {
            return Err(TxnError::Invalid(
                "key mismatch between compare and success operations",
            ));
        }
    }

    let mut failure_range = None;
    if let Some(failure) = req.failure.first() {
        let range = match &failure.request {
            Some(request_op::Request::RequestRange(range)) => range,
            _ => {
                return Err(TxnError::Invalid(
                    "failure operation must contain a range request",
                ))
            }
        };
        if !range.range_end.is_empty() {
            return Err(TxnError::Invalid(
                "range_end not supported for failure range operations",
            ));
        }
        if range.key != compare_key {
            return Err(TxnError::Invalid(
                "key mismatch between compare and failure operations",
            ));
        }
        failure_range = Some(range);
    }

    let record = match (compare_mod_revision, success_put, success_delete) {
        (0, Some(put), None) => Record {
            key: put.key.clone(),
            value: put.value.clone(),
            lease: put.lease,
            created: true,
            deleted: false,
            ..Default::default()
        },
        (mod_revision, Some(put), None) if mod_revision > 0 && failure_range.is_some() => Record {
            key: put.key.clone(),
            value: put.value.clone(),
            lease: put.lease,
            created: false,
            deleted: false,
            prev_revision: mod_revision,
            ..Default::default()
        },
        (mod_revision, None, Some(delete)) if mod_revision > 0 && failure_range.is_some() => {
            Record {
                key: delete.key.clone(),
                created: false,
                deleted: true,
                prev_revision: mod_revision,
                ..Default::default()
            }
        }
        _ => return Err(TxnError::Unsupported),
    };

    Ok(record)
}

/// Assemble the wire response from either a committed record or a failure
/// range result.
pub fn build_txn_response(record: Option<&Record>, range_resp: Option<RangeResponse>) -> TxnResponse {
    if let Some(range_resp) = range_resp {
        let revision = range_resp
            .header
            .as_ref()
            .map(|h| h.revision)
            .unwrap_or_default();
        return TxnResponse {
            header: Some(ResponseHeader {
                revision,
                ..Default::default()
            }),
            succeeded: false,
            responses: vec![ResponseOp {
                response: Some(response_op::Response::ResponseRange(range_resp)),
            }],
        };
    }

    match record {
        Some(record) if record.deleted => TxnResponse {
            header: Some(ResponseHeader {
                revision: record.revision,
                ..Default::default()
            }),
            succeeded: true,
            responses: vec![ResponseOp {
                response: Some(response_op::Response::ResponseDeleteRange(
                    DeleteRangeResponse {
                        header: Some(ResponseHeader {
                            revision: record.revision,
                            ..Default::default()
                        }),
                        deleted: 1,
                        prev_kvs: vec![],
                    },
                )),
            }],
        },
        Some(record) => TxnResponse {
            header: Some(ResponseHeader {
                revision: record.revision,
                ..Default::default()
            }),
            succeeded: true,
            responses: vec![ResponseOp {
                response: Some(response_op::Response::ResponsePut(PutResponse {
                    header: Some(ResponseHeader {
                        revision: record.revision,
                        ..Default::default()
                    }),
                    prev_kv: None,
                })),
            }],
        },
        None => TxnResponse::default(),
    }
}

/// Helpers for composing the requests the Kubernetes client sends; used
/// heavily by tests.
pub mod requests {
    use super::*;
    use netsy_proto::etcdserverpb::{DeleteRangeRequest, PutRequest};

    pub fn compare_mod(key: &[u8], mod_revision: i64) -> Compare {
        Compare {
            result: compare::CompareResult::Equal as i32,
            target: compare::CompareTarget::Mod as i32,
            key: key.to_vec(),
            target_union: Some(compare::TargetUnion::ModRevision(mod_revision)),
            range_end: vec![],
        }
    }

    pub fn put_op(key: &[u8], value: &[u8], lease: i64) -> RequestOp {
        RequestOp {
            request: Some(request_op::Request::RequestPut(PutRequest {
                key: key.to_vec(),
                value: value.to_vec(),
                lease,
                ..Default::default()
            })),
        }
    }

    pub fn delete_op(key: &[u8]) -> RequestOp {
        RequestOp {
            request: Some(request_op::Request::RequestDeleteRange(
                DeleteRangeRequest {
                    key: key.to_vec(),
                    ..Default::default()
                },
            )),
        }
    }

    pub fn range_op(key: &[u8]) -> RequestOp {
        RequestOp {
            request: Some(request_op::Request::RequestRange(RangeRequest {
                key: key.to_vec(),
                ..Default::default()
            })),
        }
    }

    /// `Txn{compare: mod(key)=0, success: put}` - optimistic create.
    pub fn create(key: &[u8], value: &[u8]) -> TxnRequest {
        TxnRequest {
            compare: vec![compare_mod(key, 0)],
            success: vec![put_op(key, value, 0)],
            failure: vec![],
        }
    }

    /// `Txn{compare: mod(key)=rev, success: put, failure: range}` -
    /// optimistic update.
    pub fn update(key: &[u8], value: &[u8], mod_revision: i64) -> TxnRequest {
        TxnRequest {
            compare: vec![compare_mod(key, mod_revision)],
            success: vec![put_op(key, value, 0)],
            failure: vec![range_op(key)],
        }
    }

    /// `Txn{compare: mod(key)=rev, success: delete, failure: range}` -
    /// optimistic delete.
    pub fn delete(key: &[u8], mod_revision: i64) -> TxnRequest {
        TxnRequest {
            compare: vec![compare_mod(key, mod_revision)],
            success: vec![delete_op(key)],
            failure: vec![range_op(key)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::requests::*;
    use super::*;

    #[test]
    fn test_parse_create() {
        let record = parse_txn_request(&create(b"k", b"v")).unwrap();
        assert!(record.created);
        assert!(!record.deleted);
        assert_eq!(record.key, b"k");
        assert_eq!(record.value, b"v");
        assert_eq!(record.prev_revision, 0);
    }

    #[test]
    fn test_parse_create_with_failure_range() {
        let mut req = create(b"k", b"v");
        req.failure = vec![range_op(b"k")];
        let record = parse_txn_request(&req).unwrap();
        assert!(record.created);
    }

    #[test]
    fn test_parse_update() {
        let record = parse_txn_request(&update(b"k", b"v2", 5)).unwrap();
        assert!(!record.created);
        assert!(!record.deleted);
        assert_eq!(record.prev_revision, 5);
        assert_eq!(record.value, b"v2");
    }

    #[test]
    fn test_parse_delete() {
        let record = parse_txn_request(&delete(b"k", 3)).unwrap();
        assert!(record.deleted);
        assert!(!record.created);
        assert_eq!(record.prev_revision, 3);
        assert!(record.value.is_empty());
    }

    #[test]
    fn test_parse_lease_is_carried() {
        let mut req = create(b"k", b"v");
        req.success = vec![put_op(b"k", b"v", 123)];
        let record = parse_txn_request(&req).unwrap();
        assert_eq!(record.lease, 123);
    }

    #[test]
    fn test_delete_with_zero_mod_is_unsupported() {
        let req = TxnRequest {
            compare: vec![compare_mod(b"k", 0)],
            success: vec![delete_op(b"k")],
            failure: vec![range_op(b"k")],
        };
        assert!(matches!(
            parse_txn_request(&req),
            Err(TxnError::Unsupported)
        ));
    }

    #[test]
    fn test_update_without_failure_is_unsupported() {
        let req = TxnRequest {
            compare: vec![compare_mod(b"k", 5)],
            success: vec![put_op(b"k", b"v", 0)],
            failure: vec![],
        };
        assert!(matches!(
            parse_txn_request(&req),
            Err(TxnError::Unsupported)
        ));
    }

    #[test]
    fn test_multiple_compares_rejected() {
        let mut req = create(b"k", b"v");
        req.compare.push(compare_mod(b"k", 0));
        assert!(matches!(parse_txn_request(&req), Err(TxnError::Invalid(_))));
    }

    #[test]
    fn test_wrong_compare_target_rejected() {
        let mut req = create(b"k", b"v");
        req.compare[0].target = compare::CompareTarget::Version as i32;
        assert!(matches!(parse_txn_request(&req), Err(TxnError::Invalid(_))));
    }

    #[test]
    fn test_key_mismatch_rejected() {
        let mut req = create(b"k", b"v");
        req.success = vec![put_op(b"other", b"v", 0)];
        assert!(matches!(parse_txn_request(&req), Err(TxnError::Invalid(_))));
    }

    #[test]
    fn test_failure_with_range_end_rejected() {
        let mut req = update(b"k", b"v", 1);
        if let Some(request_op::Request::RequestRange(range)) =
            &mut req.failure[0].request
        {
            range.range_end = b"z".to_vec();
        }
        assert!(matches!(parse_txn_request(&req), Err(TxnError::Invalid(_))));
    }

    #[test]
    fn test_prev_kv_on_put_rejected() {
        let mut req = create(b"k", b"v");
        if let Some(request_op::Request::RequestPut(put)) = &mut req.success[0].request {
            put.prev_kv = true;
        }
        assert!(matches!(parse_txn_request(&req), Err(TxnError::Invalid(_))));
    }

    #[test]
    fn test_failure_with_put_rejected() {
        let mut req = update(b"k", b"v", 1);
        req.failure = vec![put_op(b"k", b"v", 0)];
        assert!(matches!(parse_txn_request(&req), Err(TxnError::Invalid(_))));
    }

    #[test]
    fn test_build_response_for_put() {
        let record = Record {
            revision: 7,
            key: b"k".to_vec(),
            ..Default::default()
        };
        let resp = build_txn_response(Some(&record), None);
        assert!(resp.succeeded);
        assert_eq!(resp.header.unwrap().revision, 7);
        assert!(matches!(
            resp.responses[0].response,
            Some(response_op::Response::ResponsePut(_))
        ));
    }

    #[test]
    fn test_build_response_for_delete() {
        let record = Record {
            revision: 9,
            deleted: true,
            ..Default::default()
        };
        let resp = build_txn_response(Some(&record), None);
        assert!(resp.succeeded);
        match &resp.responses[0].response {
            Some(response_op::Response::ResponseDeleteRange(delete)) => {
                assert_eq!(delete.deleted, 1);
                assert_eq!(delete.header.as_ref().unwrap().revision, 9);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn test_build_response_for_failed_compare() {
        let range_resp = RangeResponse {
            header: Some(ResponseHeader {
                revision: 4,
                ..Default::default()
            }),
            ..Default::default()
        };
        let resp = build_txn_response(None, Some(range_resp));
        assert!(!resp.succeeded);
        assert_eq!(resp.header.unwrap().revision, 4);
        assert!(matches!(
            resp.responses[0].response,
            Some(response_op::Response::ResponseRange(_))
        ));
    }
}
