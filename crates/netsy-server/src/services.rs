//! gRPC service implementations for the etcd v3 subset.
//!
//! One service struct backs KV, Watch, Maintenance, and Cluster. Services
//! outside the subset are simply not registered, so tonic answers
//! `Unimplemented` for them; the same goes for KV methods the Kubernetes
//! client never calls (Put, DeleteRange, Compact).

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, warn};

use netsy_index::LocalIndex;
use netsy_proto::etcdserverpb::{
    cluster_server::Cluster, kv_server::Kv, maintenance_server::Maintenance,
    watch_request::RequestUnion, watch_server::Watch, CompactionRequest, CompactionResponse,
    DeleteRangeRequest, DeleteRangeResponse, Member, MemberListRequest, MemberListResponse,
    PutRequest, PutResponse, RangeRequest, RangeResponse, ResponseHeader, StatusRequest,
    StatusResponse, TxnRequest, TxnResponse, WatchRequest, WatchResponse,
};

use crate::range;
use crate::txn::TxnEngine;
use crate::watch::{WatchHub, INBOX_CAPACITY, PROGRESS_INTERVAL, PROGRESS_JITTER_MS};

/// The etcd version string reported to clients probing compatibility.
const ETCD_VERSION: &str = "3.5.16";

pub struct EtcdService {
    engine: Arc<TxnEngine>,
    index: Arc<LocalIndex>,
    hub: Arc<WatchHub>,
    client_addr: String,
}

impl EtcdService {
    pub fn new(
        engine: Arc<TxnEngine>,
        index: Arc<LocalIndex>,
        hub: Arc<WatchHub>,
        client_addr: String,
    ) -> Self {
        Self {
            engine,
            index,
            hub,
            client_addr,
        }
    }
}

#[tonic::async_trait]
impl Kv for EtcdService {
    async fn range(
        &self,
        request: Request<RangeRequest>,
    ) -> Result<Response<RangeResponse>, Status> {
        let req = request.into_inner();
        range::execute(&self.index, &req).await.map(Response::new)
    }

    async fn txn(&self, request: Request<TxnRequest>) -> Result<Response<TxnResponse>, Status> {
        let req = request.into_inner();
        match self.engine.txn(&req).await {
            Ok(outcome) => {
                if let Some(record) = &outcome.committed {
                    let key = String::from_utf8_lossy(&record.key).into_owned();
                    if record.created {
                        debug!(key = %key, revision = record.revision, "txn created");
                    } else if record.deleted {
                        debug!(key = %key, revision = record.revision, "txn deleted");
                    } else {
                        debug!(key = %key, revision = record.revision, "txn updated");
                    }

                    // Watches want the previous record for updates and
                    // deletes; it may be gone if already compacted.
                    let prev = if !record.created && record.prev_revision > 0 {
                        self.index
                            .find_record_by_rev(record.prev_revision)
                            .await
                            .ok()
                            .flatten()
                    } else {
                        None
                    };
                    self.hub.dispatch(record, prev.as_ref()).await;
                }
                Ok(Response::new(outcome.response))
            }
            Err(err) => {
                // Best-effort context for the logs before surfacing the
                // gRPC error.
                let latest = self.index.latest_revision().await.unwrap_or(0);
                warn!(error = %err, latest_revision = latest, "txn failed");
                Err(err.into())
            }
        }
    }

    async fn put(&self, _request: Request<PutRequest>) -> Result<Response<PutResponse>, Status> {
        Err(Status::unimplemented(
            "Put is not served; use Txn as the Kubernetes client does",
        ))
    }

    async fn delete_range(
        &self,
        _request: Request<DeleteRangeRequest>,
    ) -> Result<Response<DeleteRangeResponse>, Status> {
        Err(Status::unimplemented(
            "DeleteRange is not served; use Txn as the Kubernetes client does",
        ))
    }

    async fn compact(
        &self,
        _request: Request<CompactionRequest>,
    ) -> Result<Response<CompactionResponse>, Status> {
        Err(Status::unimplemented("Compact is not served"))
    }
}

#[tonic::async_trait]
impl Watch for EtcdService {
    type WatchStream = ReceiverStream<Result<WatchResponse, Status>>;

    async fn watch(
        &self,
        request: Request<Streaming<WatchRequest>>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let watcher = self.hub.register(tx).await;

        // Per-watcher progress ticker, jittered so watchers do not tick in
        // lockstep. Stops once the inbox closes.
        {
            let watcher = Arc::clone(&watcher);
            let index = Arc::clone(&self.index);
            tokio::spawn(async move {
                let jitter = rand::thread_rng().gen_range(0..PROGRESS_JITTER_MS);
                tokio::time::sleep(Duration::from_millis(jitter)).await;
                let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let latest = match index.latest_revision().await {
                        Ok(latest) => latest,
                        Err(err) => {
                            warn!(error = %err, "failed to get latest revision for progress report");
                            continue;
                        }
                    };
                    if !watcher.report_progress(latest).await {
                        break;
                    }
                }
            });
        }

        // Request reader: create/cancel/progress until the stream ends,
        // then clean the watcher up.
        {
            let hub = Arc::clone(&self.hub);
            let index = Arc::clone(&self.index);
            tokio::spawn(async move {
                loop {
                    match inbound.message().await {
                        Ok(Some(req)) => match req.request_union {
                            Some(RequestUnion::CreateRequest(create)) => {
                                hub.create_watch(&watcher, create, &index).await;
                            }
                            Some(RequestUnion::CancelRequest(cancel)) => {
                                let revision = index.latest_revision().await.unwrap_or(0);
                                watcher.cancel_watch(cancel.watch_id, revision, None).await;
                            }
                            Some(RequestUnion::ProgressRequest(_)) => {
                                let latest = index.latest_revision().await.unwrap_or(0);
                                watcher.report_progress(latest).await;
                            }
                            None => {}
                        },
                        Ok(None) => break,
                        Err(err) => {
                            debug!(watcher = watcher.id(), error = %err, "watch stream errored");
                            break;
                        }
                    }
                }
                hub.cleanup(watcher.id()).await;
            });
        }

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

#[tonic::async_trait]
impl Maintenance for EtcdService {
    async fn status(
        &self,
        _request: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        let db_size = self
            .index
            .size()
            .await
            .map_err(|err| Status::unavailable(format!("error getting db size: {err}")))?;

        Ok(Response::new(StatusResponse {
            header: Some(ResponseHeader::default()),
            version: ETCD_VERSION.to_string(),
            db_size,
            ..Default::default()
        }))
    }
}

#[tonic::async_trait]
impl Cluster for EtcdService {
    async fn member_list(
        &self,
        _request: Request<MemberListRequest>,
    ) -> Result<Response<MemberListResponse>, Status> {
        Ok(Response::new(MemberListResponse {
            header: Some(ResponseHeader::default()),
            members: vec![Member {
                name: "netsy".to_string(),
                peer_urls: vec![self.client_addr.clone()],
                client_urls: vec![self.client_addr.clone()],
                ..Default::default()
            }],
        }))
    }
}
