//! Server configuration.
//!
//! Every option is available both as a command-line flag and as an
//! environment variable; the environment is what production deployments use.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgAction, Parser};
use object_store::aws::AmazonS3Builder;
use object_store::ObjectStore;
use tracing::{info, warn};

use crate::error::ServerError;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "netsy",
    about = "An etcd alternative implementing the Kubernetes subset of the etcd API, backed by S3"
)]
pub struct Config {
    /// Identifier of this instance, stamped as leader_id on every record.
    #[arg(long, env = "NETSY_INSTANCE_ID", default_value = "")]
    pub instance_id: String,

    /// Enable verbose output.
    #[arg(long, short = 'v', env = "NETSY_DEBUG")]
    pub verbose: bool,

    /// Address of the etcd-compatible API server for client requests.
    #[arg(long, env = "NETSY_LISTEN_CLIENTS_ADDR", default_value = "0.0.0.0:2378")]
    pub listen_clients_addr: String,

    /// Address reserved for other netsy servers to connect to.
    #[arg(long, env = "NETSY_LISTEN_PEERS_ADDR", default_value = "0.0.0.0:2381")]
    pub listen_peers_addr: String,

    /// CA certificate bundle used to verify client certificates (mTLS).
    #[arg(long, env = "NETSY_TLS_CLIENT_CA")]
    pub tls_client_ca: Option<PathBuf>,

    /// x509 certificate presented on the client listen address.
    #[arg(long, env = "NETSY_TLS_SERVER_CERT")]
    pub tls_server_cert: Option<PathBuf>,

    /// Private key for the server certificate.
    #[arg(long, env = "NETSY_TLS_SERVER_KEY")]
    pub tls_server_key: Option<PathBuf>,

    /// Directory for the local index file and temp files.
    #[arg(long, env = "NETSY_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Enable the S3 storage backend.
    #[arg(long, env = "NETSY_S3_ENABLED", default_value_t = true, action = ArgAction::Set)]
    pub s3_enabled: bool,

    /// S3 bucket name (required when S3 is enabled).
    #[arg(long, env = "NETSY_S3_BUCKET_NAME", default_value = "")]
    pub s3_bucket_name: String,

    /// S3 object key prefix.
    #[arg(long, env = "NETSY_S3_KEY_PREFIX", default_value = "")]
    pub s3_key_prefix: String,

    /// AWS region for the S3 bucket.
    #[arg(long, env = "AWS_DEFAULT_REGION", default_value = "us-east-1")]
    pub s3_region: String,

    /// Custom S3 endpoint URL (MinIO, LocalStack, ...).
    #[arg(long, env = "AWS_ENDPOINT_URL", default_value = "")]
    pub s3_endpoint: String,

    /// AWS access key ID (prefer IAM roles).
    #[arg(long, env = "AWS_ACCESS_KEY_ID", default_value = "")]
    pub s3_access_key_id: String,

    /// AWS secret access key (prefer IAM roles).
    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", default_value = "")]
    pub s3_secret_access_key: String,

    /// AWS session token for temporary credentials.
    #[arg(long, env = "AWS_SESSION_TOKEN", default_value = "")]
    pub s3_session_token: String,

    /// IAM role ARN to assume for S3 access.
    #[arg(long, env = "NETSY_S3_ROLE_ARN", default_value = "")]
    pub s3_role_arn: String,

    /// Session name when assuming an IAM role.
    #[arg(long, env = "NETSY_S3_ROLE_SESSION_NAME", default_value = "netsy-session")]
    pub s3_role_session_name: String,

    /// Use path-style S3 addressing (required for MinIO).
    #[arg(long, env = "NETSY_S3_FORCE_PATH_STYLE", default_value_t = false, action = ArgAction::Set)]
    pub s3_force_path_style: bool,

    /// S3 storage class (STANDARD, STANDARD_IA, ...).
    #[arg(long, env = "NETSY_S3_STORAGE_CLASS", default_value = "STANDARD")]
    pub s3_storage_class: String,

    /// S3 server-side encryption: AES256 or aws:kms.
    #[arg(long, env = "NETSY_S3_ENCRYPTION", default_value = "AES256")]
    pub s3_encryption: String,

    /// KMS key ID for S3 encryption (when using aws:kms).
    #[arg(long, env = "NETSY_S3_KMS_KEY_ID", default_value = "")]
    pub s3_kms_key_id: String,

    /// Replication mode; synchronous is the only supported value.
    #[arg(long, env = "NETSY_REPLICATION_MODE", default_value = "synchronous")]
    pub replication_mode: String,

    /// Create a snapshot after N records since the last one (0 = disabled).
    #[arg(long, env = "NETSY_SNAPSHOT_THRESHOLD_RECORDS", default_value_t = 10_000)]
    pub snapshot_threshold_records: i64,

    /// Create a snapshot when committed chunks exceed N MB (0 = disabled).
    #[arg(long, env = "NETSY_SNAPSHOT_THRESHOLD_SIZE_MB", default_value_t = 10_000)]
    pub snapshot_threshold_size_mb: i64,

    /// Create a snapshot after N minutes since the last one (0 = disabled).
    #[arg(long, env = "NETSY_SNAPSHOT_THRESHOLD_AGE_MINUTES", default_value_t = 0)]
    pub snapshot_threshold_age_minutes: i64,
}

impl Config {
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.instance_id.is_empty() {
            return Err(ServerError::Config("instance_id must be set".into()));
        }
        if self.replication_mode != "synchronous" {
            return Err(ServerError::Config(format!(
                "replication_mode '{}' is not supported; only 'synchronous' is",
                self.replication_mode
            )));
        }
        if self.s3_enabled && self.s3_bucket_name.is_empty() {
            return Err(ServerError::Config(
                "s3_bucket_name is required when S3 is enabled".into(),
            ));
        }
        if !matches!(self.s3_encryption.as_str(), "" | "AES256" | "aws:kms") {
            return Err(ServerError::Config(format!(
                "s3_encryption '{}' is not supported; use AES256 or aws:kms",
                self.s3_encryption
            )));
        }
        if self.s3_encryption == "aws:kms" && self.s3_kms_key_id.is_empty() {
            return Err(ServerError::Config(
                "s3_kms_key_id is required when s3_encryption is aws:kms".into(),
            ));
        }
        // Mutual TLS is mandatory: the server certificate, its key, and the
        // CA bundle that client certificates must chain to.
        if self.tls_server_cert.is_none()
            || self.tls_server_key.is_none()
            || self.tls_client_ca.is_none()
        {
            return Err(ServerError::Config(
                "tls_server_cert, tls_server_key, and tls_client_ca are all required".into(),
            ));
        }
        if self.snapshot_threshold_records < 0
            || self.snapshot_threshold_size_mb < 0
            || self.snapshot_threshold_age_minutes < 0
        {
            return Err(ServerError::Config(
                "snapshot thresholds must not be negative".into(),
            ));
        }
        Ok(())
    }

    /// Path of the local index file under the data directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db.sqlite3")
    }

    pub fn s3_key_prefix(&self) -> Option<String> {
        if self.s3_key_prefix.is_empty() {
            None
        } else {
            Some(self.s3_key_prefix.clone())
        }
    }

    /// Build the S3 object store. Starts from the ambient AWS environment so
    /// the standard credential chain (instance profiles, web identity)
    /// works, then applies explicit settings on top.
    pub fn build_object_store(&self) -> Result<Arc<dyn ObjectStore>, ServerError> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&self.s3_bucket_name)
            .with_region(&self.s3_region)
            .with_virtual_hosted_style_request(!self.s3_force_path_style);

        if !self.s3_endpoint.is_empty() {
            builder = builder.with_endpoint(&self.s3_endpoint);
            if self.s3_endpoint.starts_with("http://") {
                builder = builder.with_allow_http(true);
            }
        }
        if !self.s3_access_key_id.is_empty() && !self.s3_secret_access_key.is_empty() {
            builder = builder
                .with_access_key_id(&self.s3_access_key_id)
                .with_secret_access_key(&self.s3_secret_access_key);
            if !self.s3_session_token.is_empty() {
                builder = builder.with_token(&self.s3_session_token);
            }
            info!("using static credentials for S3 access");
        } else if !self.s3_role_arn.is_empty() {
            // Role assumption rides the ambient AWS credential chain.
            warn!(
                role = %self.s3_role_arn,
                "s3_role_arn set; relying on the ambient AWS credential chain for role assumption"
            );
        } else {
            info!("using default AWS credential chain for S3 access");
        }

        let store = builder
            .build()
            .map_err(|e| ServerError::Config(format!("failed to build S3 client: {e}")))?;
        Ok(Arc::new(store))
    }
}
