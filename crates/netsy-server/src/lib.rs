//! The Netsy server.
//!
//! An etcd-compatible key/value store for the Kubernetes control plane that
//! persists every mutation to S3-compatible object storage before
//! acknowledging it. A consensus cluster is replaced by a single leader
//! whose local SQLite index is ephemeral and recoverable from object
//! storage.
//!
//! The pieces, in commit order:
//!
//! - [`txn::TxnEngine`] serializes mutations under the leader commit mutex,
//!   enforces compare-and-swap through the index insert, and uploads a
//!   one-record chunk to S3 before committing locally;
//! - [`watch::WatchHub`] fans committed records out to subscribed streams in
//!   revision order;
//! - [`snapshot::SnapshotWorker`] collapses chunk history into snapshot
//!   objects and prunes superseded chunks;
//! - [`backfill`] rebuilds the index at startup from the latest snapshot
//!   plus newer chunks;
//! - [`services::EtcdService`] exposes the whole thing over the etcd v3
//!   gRPC subset.

pub mod backfill;
pub mod config;
pub mod error;
pub mod range;
pub mod services;
pub mod snapshot;
pub mod tls;
pub mod txn;
pub mod watch;
