//! The watch engine.
//!
//! Terminology, inherited from etcd:
//!
//! - **watcher** - one bidirectional gRPC stream (e.g. a kube-apiserver
//!   connection); the unit of connection and cleanup.
//! - **watch** - a single key-range subscription within a watcher; one
//!   stream multiplexes many (every `kubectl get -w` coalesces onto the
//!   apiserver's stream).
//!
//! Each watcher owns an inbox channel; the gRPC response stream drains it,
//! so everything a watcher ever receives (creation acks, events, progress,
//! cancellations) flows through one FIFO channel. The dispatcher is driven
//! synchronously from the commit path and pushes matching events onto
//! inboxes while holding the registry and per-watcher read locks, which is
//! the only interleaving that must be guarded against cancellation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tonic::Status;
use tracing::{debug, warn};

use netsy_core::KeyRange;
use netsy_index::LocalIndex;
use netsy_proto::etcdserverpb::{
    watch_create_request::FilterType, ResponseHeader, WatchCreateRequest, WatchResponse,
};
use netsy_proto::mvccpb::{event::EventType, Event, KeyValue};
use netsy_proto::netsy::Record;

use crate::range::record_to_kv;

/// The watch id clients pass to request server-side assignment; anything
/// else is rejected.
pub const AUTO_WATCH_ID: i64 = 0;

/// The reserved id that marks a progress message as a broadcast to every
/// watch on the stream.
pub const INVALID_WATCH_ID: i64 = -1;

/// How often each watcher's progress ticker fires.
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Jitter ceiling applied before a watcher's first tick so progress traffic
/// from many watchers does not align.
pub const PROGRESS_JITTER_MS: u64 = 500;

/// Capacity of each watcher's inbox; dispatch suspends when it fills.
pub const INBOX_CAPACITY: usize = 128;

type Inbox = mpsc::Sender<Result<WatchResponse, Status>>;

/// One key-range subscription.
struct WatchEntry {
    range: KeyRange,
    start_revision: i64,
    prev_kv: bool,
    no_put: bool,
    no_delete: bool,
}

impl WatchEntry {
    fn admits(&self, record: &Record) -> bool {
        if self.no_put && !record.deleted {
            return false;
        }
        if self.no_delete && record.deleted {
            return false;
        }
        if self.start_revision > record.revision {
            return false;
        }
        self.range.contains(&record.key)
    }
}

struct WatcherState {
    /// `None` once the watcher is cleaned up; nothing sends after that.
    inbox: Option<Inbox>,
    watches: HashMap<i64, WatchEntry>,
    progress: HashMap<i64, bool>,
}

/// Connection-level state for one stream.
pub struct Watcher {
    id: i64,
    state: RwLock<WatcherState>,
}

impl Watcher {
    pub fn id(&self) -> i64 {
        self.id
    }

    async fn send(&self, msg: WatchResponse) -> bool {
        let tx = {
            let state = self.state.read().await;
            match &state.inbox {
                Some(tx) => tx.clone(),
                None => return false,
            }
        };
        tx.send(Ok(msg)).await.is_ok()
    }

    /// Remove a watch and acknowledge the cancellation. `reason` is present
    /// when the server is cancelling (errors, unsupported requests) rather
    /// than the client.
    pub async fn cancel_watch(&self, watch_id: i64, revision: i64, reason: Option<String>) {
        {
            let mut state = self.state.write().await;
            state.watches.remove(&watch_id);
            state.progress.remove(&watch_id);
        }

        let server_initiated = reason.is_some();
        let sent = self
            .send(WatchResponse {
                header: Some(header(revision)),
                watch_id,
                canceled: true,
                cancel_reason: reason.unwrap_or_default(),
                ..Default::default()
            })
            .await;
        if !sent && server_initiated {
            warn!(watcher = self.id, watch = watch_id, "failed to deliver cancel");
        }
    }

    /// Emit progress for this watcher: one broadcast message when every
    /// watch has progress-notify enabled, otherwise one message per enabled
    /// watch. Returns false once the inbox is closed so tickers stop.
    pub async fn report_progress(&self, latest_revision: i64) -> bool {
        let (tx, targets) = {
            let state = self.state.read().await;
            let Some(tx) = state.inbox.clone() else {
                return false;
            };

            let mut broadcast = true;
            let mut ids = Vec::new();
            for (watch_id, notify) in &state.progress {
                if *notify {
                    ids.push(*watch_id);
                } else {
                    broadcast = false;
                }
            }
            (tx, if broadcast { None } else { Some(ids) })
        };

        match targets {
            None => {
                let msg = WatchResponse {
                    header: Some(header(latest_revision)),
                    watch_id: INVALID_WATCH_ID,
                    ..Default::default()
                };
                let _ = tx.send(Ok(msg)).await;
            }
            Some(ids) => {
                for watch_id in ids {
                    let msg = WatchResponse {
                        header: Some(header(latest_revision)),
                        watch_id,
                        ..Default::default()
                    };
                    let _ = tx.send(Ok(msg)).await;
                }
            }
        }
        true
    }
}

/// The registry of live watchers and the dispatch fan-out.
pub struct WatchHub {
    watchers: RwLock<HashMap<i64, Arc<Watcher>>>,
    watcher_ids: AtomicI64,
    watch_ids: AtomicI64,
}

impl Default for WatchHub {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchHub {
    pub fn new() -> Self {
        Self {
            watchers: RwLock::new(HashMap::new()),
            watcher_ids: AtomicI64::new(0),
            watch_ids: AtomicI64::new(0),
        }
    }

    /// Register a new stream and hand back its watcher handle.
    pub async fn register(&self, inbox: Inbox) -> Arc<Watcher> {
        let id = self.watcher_ids.fetch_add(1, Ordering::SeqCst) + 1;
        let watcher = Arc::new(Watcher {
            id,
            state: RwLock::new(WatcherState {
                inbox: Some(inbox),
                watches: HashMap::new(),
                progress: HashMap::new(),
            }),
        });
        self.watchers.write().await.insert(id, watcher.clone());
        debug!(watcher = id, "watcher registered");
        watcher
    }

    /// Handle a create-watch request on an established stream.
    pub async fn create_watch(
        &self,
        watcher: &Arc<Watcher>,
        req: WatchCreateRequest,
        index: &LocalIndex,
    ) {
        let latest = index.latest_revision().await.unwrap_or(0);

        // Client-supplied watch ids are not supported; acknowledge and
        // cancel immediately.
        if req.watch_id != AUTO_WATCH_ID {
            debug!(watch_id = req.watch_id, "rejecting user-provided watch id");
            watcher
                .send(WatchResponse {
                    header: Some(header(latest)),
                    watch_id: req.watch_id,
                    created: true,
                    ..Default::default()
                })
                .await;
            watcher
                .send(WatchResponse {
                    header: Some(header(latest)),
                    watch_id: req.watch_id,
                    canceled: true,
                    cancel_reason: "user-provided watch IDs are unsupported".to_string(),
                    ..Default::default()
                })
                .await;
            return;
        }

        let watch_id = self.watch_ids.fetch_add(1, Ordering::SeqCst) + 1;

        // Resolve the start revision: 0 means "now", compacted revisions
        // cancel the watch, and future revisions clamp to latest.
        let mut header_revision = latest;
        let mut cancel: Option<(String, i64)> = None;
        if req.start_revision != 0 {
            match index.get_revision(req.start_revision).await {
                Ok(Some(status)) if status.compacted => {
                    header_revision = req.start_revision;
                    cancel = Some((
                        format!("revision '{}' has been compacted", req.start_revision),
                        req.start_revision,
                    ));
                }
                Ok(Some(status)) => {
                    header_revision = status.revision;
                }
                Ok(None) | Err(_) => {
                    if req.start_revision <= latest {
                        header_revision = req.start_revision;
                        cancel = Some((
                            format!(
                                "failed to get revision '{}' for watch",
                                req.start_revision
                            ),
                            0,
                        ));
                    } else {
                        header_revision = latest;
                    }
                }
            }
        }

        if let Some((reason, compact_revision)) = cancel {
            debug!(watch = watch_id, reason = %reason, "watch create failed");
            watcher
                .send(WatchResponse {
                    header: Some(header(header_revision)),
                    watch_id,
                    created: true,
                    ..Default::default()
                })
                .await;
            watcher
                .send(WatchResponse {
                    header: Some(header(header_revision)),
                    watch_id,
                    canceled: true,
                    cancel_reason: reason,
                    compact_revision,
                    ..Default::default()
                })
                .await;
            return;
        }

        let mut entry = WatchEntry {
            range: KeyRange::parse(&req.key, &req.range_end),
            start_revision: req.start_revision,
            prev_kv: req.prev_kv,
            no_put: false,
            no_delete: false,
        };
        for filter in &req.filters {
            if *filter == FilterType::Noput as i32 {
                entry.no_put = true;
            } else if *filter == FilterType::Nodelete as i32 {
                entry.no_delete = true;
            }
        }

        {
            let mut state = watcher.state.write().await;
            if state.inbox.is_none() {
                return;
            }
            state.watches.insert(watch_id, entry);
            state.progress.insert(watch_id, req.progress_notify);
        }

        let acked = watcher
            .send(WatchResponse {
                header: Some(header(header_revision)),
                watch_id,
                created: true,
                ..Default::default()
            })
            .await;
        if !acked {
            watcher
                .cancel_watch(watch_id, header_revision, Some("failed to ack create".into()))
                .await;
        }
    }

    /// Fan one committed record out to every admitting watch, in commit
    /// order per watcher. `prev` is the previous record for the key when one
    /// exists; watches with `prev_kv` on a create get a key-only
    /// placeholder, which the kube-apiserver expects instead of a missing
    /// field.
    pub async fn dispatch(&self, record: &Record, prev: Option<&Record>) {
        let event_type = if record.deleted {
            EventType::Delete
        } else {
            EventType::Put
        };
        let kv = record_to_kv(record);
        let prev_kv = prev.map(record_to_kv);

        let watchers = self.watchers.read().await;
        for watcher in watchers.values() {
            let state = watcher.state.read().await;
            let Some(inbox) = &state.inbox else {
                continue;
            };
            for (watch_id, entry) in &state.watches {
                if !entry.admits(record) {
                    continue;
                }
                let event_prev_kv = if entry.prev_kv {
                    Some(prev_kv.clone().unwrap_or_else(|| KeyValue {
                        key: record.key.clone(),
                        ..Default::default()
                    }))
                } else {
                    None
                };
                let msg = WatchResponse {
                    header: Some(header(record.revision)),
                    watch_id: *watch_id,
                    events: vec![Event {
                        r#type: event_type as i32,
                        kv: Some(kv.clone()),
                        prev_kv: event_prev_kv,
                    }],
                    ..Default::default()
                };
                if inbox.send(Ok(msg)).await.is_err() {
                    debug!(
                        watcher = watcher.id,
                        watch = watch_id,
                        "inbox closed during dispatch"
                    );
                }
            }
        }
    }

    /// Tear a watcher down after its stream ends: close the inbox first so
    /// no dispatch can enqueue into a dead stream, then drop the watches and
    /// remove the id from the registry.
    pub async fn cleanup(&self, watcher_id: i64) {
        let watcher = self.watchers.read().await.get(&watcher_id).cloned();
        if let Some(watcher) = watcher {
            let mut state = watcher.state.write().await;
            state.inbox = None;
            state.watches.clear();
            state.progress.clear();
        }
        self.watchers.write().await.remove(&watcher_id);
        debug!(watcher = watcher_id, "watcher cleaned up");
    }

    /// Number of live watchers; used by tests and shutdown logging.
    pub async fn watcher_count(&self) -> usize {
        self.watchers.read().await.len()
    }
}

fn header(revision: i64) -> ResponseHeader {
    ResponseHeader {
        revision,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(revision: i64, key: &[u8], deleted: bool) -> Record {
        Record {
            revision,
            key: key.to_vec(),
            deleted,
            created: !deleted && revision == 1,
            value: if deleted { vec![] } else { b"v".to_vec() },
            version: if deleted { 0 } else { 1 },
            leader_id: "leader-1".to_string(),
            ..Default::default()
        }
    }

    fn create_req(key: &[u8]) -> WatchCreateRequest {
        WatchCreateRequest {
            key: key.to_vec(),
            ..Default::default()
        }
    }

    async fn hub_with_watch(
        key: &[u8],
    ) -> (
        Arc<WatchHub>,
        Arc<Watcher>,
        mpsc::Receiver<Result<WatchResponse, Status>>,
        i64,
    ) {
        let index = LocalIndex::open_in_memory().await.unwrap();
        let hub = Arc::new(WatchHub::new());
        let (tx, mut rx) = mpsc::channel(INBOX_CAPACITY);
        let watcher = hub.register(tx).await;
        hub.create_watch(&watcher, create_req(key), &index).await;
        let ack = rx.recv().await.unwrap().unwrap();
        assert!(ack.created);
        (hub, watcher, rx, ack.watch_id)
    }

    #[tokio::test]
    async fn dispatch_reaches_matching_watch() {
        let (hub, _watcher, mut rx, watch_id) = hub_with_watch(b"k").await;

        hub.dispatch(&record(1, b"k", false), None).await;

        let msg = rx.recv().await.unwrap().unwrap();
        assert_eq!(msg.watch_id, watch_id);
        assert_eq!(msg.events.len(), 1);
        assert_eq!(msg.events[0].r#type, EventType::Put as i32);
        assert_eq!(msg.header.unwrap().revision, 1);
    }

    #[tokio::test]
    async fn dispatch_skips_non_matching_key() {
        let (hub, _watcher, mut rx, _) = hub_with_watch(b"k").await;

        hub.dispatch(&record(1, b"other", false), None).await;
        hub.dispatch(&record(2, b"k", false), None).await;

        let msg = rx.recv().await.unwrap().unwrap();
        assert_eq!(msg.header.unwrap().revision, 2);
    }

    #[tokio::test]
    async fn delete_dispatches_a_delete_event() {
        let (hub, _watcher, mut rx, _) = hub_with_watch(b"k").await;

        hub.dispatch(&record(3, b"k", true), None).await;

        let msg = rx.recv().await.unwrap().unwrap();
        assert_eq!(msg.events[0].r#type, EventType::Delete as i32);
    }

    #[tokio::test]
    async fn filters_suppress_events() {
        let index = LocalIndex::open_in_memory().await.unwrap();
        let hub = WatchHub::new();
        let (tx, mut rx) = mpsc::channel(INBOX_CAPACITY);
        let watcher = hub.register(tx).await;

        let mut req = create_req(b"k");
        req.filters = vec![FilterType::Noput as i32];
        hub.create_watch(&watcher, req, &index).await;
        rx.recv().await.unwrap().unwrap(); // created ack

        hub.dispatch(&record(1, b"k", false), None).await;
        hub.dispatch(&record(2, b"k", true), None).await;

        // The put is filtered; only the delete arrives.
        let msg = rx.recv().await.unwrap().unwrap();
        assert_eq!(msg.events[0].r#type, EventType::Delete as i32);
    }

    #[tokio::test]
    async fn prev_kv_attaches_previous_record_or_placeholder() {
        let index = LocalIndex::open_in_memory().await.unwrap();
        let hub = WatchHub::new();
        let (tx, mut rx) = mpsc::channel(INBOX_CAPACITY);
        let watcher = hub.register(tx).await;

        let mut req = create_req(b"k");
        req.prev_kv = true;
        hub.create_watch(&watcher, req, &index).await;
        rx.recv().await.unwrap().unwrap();

        // Create: no previous record, placeholder with only the key.
        hub.dispatch(&record(1, b"k", false), None).await;
        let msg = rx.recv().await.unwrap().unwrap();
        let placeholder = msg.events[0].prev_kv.as_ref().unwrap();
        assert_eq!(placeholder.key, b"k");
        assert_eq!(placeholder.mod_revision, 0);

        // Update: previous record supplied.
        let prev = record(1, b"k", false);
        hub.dispatch(&record(2, b"k", false), Some(&prev)).await;
        let msg = rx.recv().await.unwrap().unwrap();
        assert_eq!(msg.events[0].prev_kv.as_ref().unwrap().mod_revision, 1);
    }

    #[tokio::test]
    async fn start_revision_excludes_older_records() {
        let index = LocalIndex::open_in_memory().await.unwrap();
        let hub = WatchHub::new();
        let (tx, mut rx) = mpsc::channel(INBOX_CAPACITY);
        let watcher = hub.register(tx).await;

        let mut req = create_req(b"k");
        req.start_revision = 5;
        hub.create_watch(&watcher, req, &index).await;
        // start_revision=5 with an empty index is a future revision; it
        // clamps to latest and the watch is created.
        let ack = rx.recv().await.unwrap().unwrap();
        assert!(ack.created);

        hub.dispatch(&record(4, b"k", false), None).await;
        hub.dispatch(&record(5, b"k", false), None).await;

        let msg = rx.recv().await.unwrap().unwrap();
        assert_eq!(msg.header.unwrap().revision, 5);
    }

    #[tokio::test]
    async fn client_supplied_watch_id_is_rejected() {
        let index = LocalIndex::open_in_memory().await.unwrap();
        let hub = WatchHub::new();
        let (tx, mut rx) = mpsc::channel(INBOX_CAPACITY);
        let watcher = hub.register(tx).await;

        let mut req = create_req(b"k");
        req.watch_id = 42;
        hub.create_watch(&watcher, req, &index).await;

        let created = rx.recv().await.unwrap().unwrap();
        assert!(created.created);
        assert_eq!(created.watch_id, 42);
        let canceled = rx.recv().await.unwrap().unwrap();
        assert!(canceled.canceled);
        assert_eq!(canceled.watch_id, 42);
    }

    #[tokio::test]
    async fn progress_broadcasts_when_all_enabled() {
        let index = LocalIndex::open_in_memory().await.unwrap();
        let hub = WatchHub::new();
        let (tx, mut rx) = mpsc::channel(INBOX_CAPACITY);
        let watcher = hub.register(tx).await;

        let mut req = create_req(b"k");
        req.progress_notify = true;
        hub.create_watch(&watcher, req, &index).await;
        rx.recv().await.unwrap().unwrap();

        assert!(watcher.report_progress(10).await);
        let msg = rx.recv().await.unwrap().unwrap();
        assert_eq!(msg.watch_id, INVALID_WATCH_ID);
        assert_eq!(msg.header.unwrap().revision, 10);
        assert!(msg.events.is_empty());
    }

    #[tokio::test]
    async fn progress_is_per_watch_when_mixed() {
        let index = LocalIndex::open_in_memory().await.unwrap();
        let hub = WatchHub::new();
        let (tx, mut rx) = mpsc::channel(INBOX_CAPACITY);
        let watcher = hub.register(tx).await;

        let mut with_notify = create_req(b"a");
        with_notify.progress_notify = true;
        hub.create_watch(&watcher, with_notify, &index).await;
        let first_ack = rx.recv().await.unwrap().unwrap();

        hub.create_watch(&watcher, create_req(b"b"), &index).await;
        rx.recv().await.unwrap().unwrap();

        assert!(watcher.report_progress(7).await);
        let msg = rx.recv().await.unwrap().unwrap();
        // Only the notify-enabled watch gets a message, addressed to it.
        assert_eq!(msg.watch_id, first_ack.watch_id);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cleanup_closes_inbox_and_unregisters() {
        let (hub, watcher, mut rx, _) = hub_with_watch(b"k").await;

        hub.cleanup(watcher.id()).await;
        assert_eq!(hub.watcher_count().await, 0);

        // Stream ends because the sender side is gone.
        assert!(rx.recv().await.is_none());

        // Dispatch and progress after cleanup are no-ops.
        hub.dispatch(&record(1, b"k", false), None).await;
        assert!(!watcher.report_progress(1).await);
    }

    #[tokio::test]
    async fn cancel_watch_stops_events_and_acks() {
        let (hub, watcher, mut rx, watch_id) = hub_with_watch(b"k").await;

        watcher.cancel_watch(watch_id, 3, None).await;
        let msg = rx.recv().await.unwrap().unwrap();
        assert!(msg.canceled);
        assert_eq!(msg.watch_id, watch_id);

        hub.dispatch(&record(4, b"k", false), None).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn watch_ids_are_unique_across_watchers() {
        let index = LocalIndex::open_in_memory().await.unwrap();
        let hub = WatchHub::new();

        let (tx1, mut rx1) = mpsc::channel(INBOX_CAPACITY);
        let w1 = hub.register(tx1).await;
        let (tx2, mut rx2) = mpsc::channel(INBOX_CAPACITY);
        let w2 = hub.register(tx2).await;

        hub.create_watch(&w1, create_req(b"a"), &index).await;
        hub.create_watch(&w2, create_req(b"b"), &index).await;

        let id1 = rx1.recv().await.unwrap().unwrap().watch_id;
        let id2 = rx2.recv().await.unwrap().unwrap().watch_id;
        assert_ne!(id1, id2);
    }
}
