//! The `Range` read path: a windowed query on the local index.
//!
//! Shared between the `KV.Range` handler and the transaction engine, which
//! runs a single-key range to answer failed compares.

use netsy_core::KeyRange;
use netsy_index::{LocalIndex, Order};
use netsy_proto::etcdserverpb::{
    range_request::SortOrder, RangeRequest, RangeResponse, ResponseHeader,
};
use netsy_proto::mvccpb::KeyValue;
use netsy_proto::netsy::Record;
use tonic::Status;

/// The gRPC error etcd clients expect for reads past the compaction
/// horizon.
pub fn compacted_status() -> Status {
    Status::out_of_range("etcdserver: mvcc: required revision has been compacted")
}

pub fn record_to_kv(record: &Record) -> KeyValue {
    KeyValue {
        key: record.key.clone(),
        create_revision: record.create_revision,
        mod_revision: record.revision,
        version: record.version,
        value: record.value.clone(),
        lease: record.lease,
    }
}

/// Execute a range request against the index.
pub async fn execute(index: &LocalIndex, req: &RangeRequest) -> Result<RangeResponse, Status> {
    // Reject the options outside the Kubernetes subset up front.
    if req.keys_only {
        return Err(Status::unimplemented("keys_only not supported"));
    }
    if req.max_create_revision != 0 {
        return Err(Status::unimplemented("max_create_revision not supported"));
    }
    if req.max_mod_revision != 0 {
        return Err(Status::unimplemented("max_mod_revision not supported"));
    }
    if req.min_mod_revision != 0 {
        return Err(Status::unimplemented("min_mod_revision not supported"));
    }
    if req.min_create_revision != 0 {
        return Err(Status::unimplemented("min_create_revision not supported"));
    }
    if req.serializable {
        return Err(Status::unimplemented("serializable not supported"));
    }
    if req.sort_target != 0 {
        return Err(Status::unimplemented("sort_target not supported"));
    }

    let range = KeyRange::parse(&req.key, &req.range_end);
    let order = if req.sort_order == SortOrder::Descend as i32 {
        Order::Descending
    } else {
        Order::Ascending
    };

    let result = index
        .find_records_by(&range, req.revision, req.limit, order)
        .await
        .map_err(|e| Status::internal(format!("range query failed: {e}")))?;

    let header = Some(ResponseHeader {
        revision: result.max_revision,
        ..Default::default()
    });
    let more = result.total_count > result.records.len() as i64;

    if req.count_only {
        return Ok(RangeResponse {
            header,
            kvs: vec![],
            count: result.total_count,
            more,
        });
    }

    let mut kvs = Vec::with_capacity(result.records.len());
    for record in &result.records {
        if record.compacted_at.is_some() {
            return Err(compacted_status());
        }
        kvs.push(record_to_kv(record));
    }

    Ok(RangeResponse {
        header,
        kvs,
        count: result.total_count,
        more,
    })
}
