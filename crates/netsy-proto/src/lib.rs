//! Netsy protocol buffer definitions.
//!
//! Two families of generated types live here:
//!
//! - The etcd v3 wire subset ([`etcdserverpb`], [`mvccpb`]) served to the
//!   Kubernetes control plane. Field numbers match etcd's own proto files so
//!   unmodified etcd clients are wire-compatible.
//! - The Netsy file format ([`netsy`]): the header/record/footer messages
//!   framed into chunk and snapshot objects on S3.
//!
//! The file descriptor set is exported for the gRPC reflection service.

/// etcd RPC messages and service definitions (KV, Watch, Maintenance,
/// Cluster).
pub mod etcdserverpb {
    tonic::include_proto!("etcdserverpb");
}

/// etcd mvcc key/value and event messages.
pub mod mvccpb {
    tonic::include_proto!("mvccpb");
}

/// Netsy chunk/snapshot file format messages.
pub mod netsy {
    tonic::include_proto!("netsy");
}

/// Compiled descriptor set covering every package above, consumed by
/// `tonic-reflection`.
pub const FILE_DESCRIPTOR_SET: &[u8] =
    tonic::include_file_descriptor_set!("netsy_descriptor");

impl netsy::Record {
    /// Rough wire size of the record, used for snapshot-threshold accounting.
    pub fn estimated_size(&self) -> i64 {
        use prost::Message;
        self.encoded_len() as i64
    }
}
