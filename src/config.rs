//! Operator supplied migration parameters
//!
//! `MigrationConfig` is built once from the command line and handed to the
//! agent by reference. Nothing in the crate mutates it after construction.
//!
//! On-disk locations written by the migration are derived from the RKE2
//! data and config directories through [`TargetPaths`]:
//!
//! - `<data-dir>/server/tls`: recovered CA and service account material
//! - `<data-dir>/server/manifests`: HelmChartConfig and addon manifests
//! - `<data-dir>/server/db`: restored etcd data and the tombstone marker
//! - `<data-dir>/agent/kubeproxy.kubeconfig`: worker-only proxy credential
//! - `<config-dir>/config.yaml.d/10-migration.yaml`: RKE2 server flags
//! - `<config-dir>/registries.yaml`: private registry credentials

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default RKE2 data directory
pub const DEFAULT_DATA_DIR: &str = "/var/lib/rancher/rke2";

/// Default RKE2 configuration directory
pub const DEFAULT_CONFIG_DIR: &str = "/etc/rancher/rke2";

/// Default S3 endpoint
pub const DEFAULT_S3_ENDPOINT: &str = "s3.amazonaws.com";

/// Default S3 region
pub const DEFAULT_S3_REGION: &str = "us-east-1";

/// Default timeout for the snapshot download
pub const DEFAULT_S3_TIMEOUT: Duration = Duration::from_secs(300);

/// Location of the RKE1 cloud provider config on the node
pub const RKE1_CLOUD_CONFIG: &str = "/etc/kubernetes/cloud-config";

/// Object storage coordinates of the snapshot archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Config {
    /// Endpoint host, optionally with scheme
    pub endpoint: String,
    /// PEM bundle used to verify the endpoint
    pub endpoint_ca: Option<PathBuf>,
    /// Disable TLS verification
    pub skip_ssl_verify: bool,
    /// Access key, anonymous access when unset
    pub access_key: Option<String>,
    /// Secret key
    pub secret_key: Option<String>,
    /// Bucket name
    pub bucket: String,
    /// Bucket region
    pub region: String,
    /// Folder prefix inside the bucket
    pub folder: Option<String>,
    /// Download timeout
    pub timeout: Duration,
}

impl S3Config {
    /// Object key of the snapshot inside the bucket
    pub fn object_key(&self, snapshot: &str) -> String {
        match self.folder.as_deref().map(|f| f.trim_matches('/')) {
            Some(folder) if !folder.is_empty() => format!("{}/{}", folder, snapshot),
            _ => snapshot.to_string(),
        }
    }
}

/// Migration parameters for a single run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationConfig {
    /// Kubeconfig for the RKE1 cluster, inferred when unset
    pub kubeconfig: Option<PathBuf>,
    /// RKE2 data directory
    pub data_dir: PathBuf,
    /// RKE2 configuration directory
    pub config_dir: PathBuf,
    /// Root under which snapshot archives are extracted
    pub work_dir: PathBuf,
    /// Snapshot archive path, or the object name when `s3` is set
    pub snapshot: String,
    /// Object storage source of the snapshot
    pub s3: Option<S3Config>,
    /// Explicit node name, address or internal address of this host
    pub node_name: Option<String>,
    /// Skip the etcd restore on etcd nodes
    pub disable_etcd_restore: bool,
    /// Skip ingress/DNS/metrics addon translation
    pub disable_addons_migrate: bool,
    /// Skip CNI chart translation
    pub disable_cni_migrate: bool,
    /// Skip user addon manifests
    pub disable_user_addons_migrate: bool,
    /// Skip the node annotation lookup against the live cluster
    pub disable_node_search: bool,
    /// Private registry TLS specs in `url,ca,cert,key` form
    pub registries_tls: Vec<String>,
}

impl MigrationConfig {
    /// Config with defaults for everything but the snapshot
    pub fn new(snapshot: impl Into<String>) -> Self {
        Self {
            kubeconfig: None,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            config_dir: PathBuf::from(DEFAULT_CONFIG_DIR),
            work_dir: std::env::temp_dir(),
            snapshot: snapshot.into(),
            s3: None,
            node_name: None,
            disable_etcd_restore: false,
            disable_addons_migrate: false,
            disable_cni_migrate: false,
            disable_user_addons_migrate: false,
            disable_node_search: false,
            registries_tls: Vec::new(),
        }
    }

    /// Paths written by the migration
    pub fn target_paths(&self) -> TargetPaths {
        TargetPaths::new(&self.data_dir, &self.config_dir)
    }

    /// Where the archive is read from once any download has happened
    pub fn local_snapshot_path(&self) -> PathBuf {
        match self.s3 {
            Some(_) => self.target_paths().snapshots_dir().join(&self.snapshot),
            None => PathBuf::from(&self.snapshot),
        }
    }

    /// Non-empty node name override
    pub fn node_name_override(&self) -> Option<&str> {
        self.node_name.as_deref().filter(|n| !n.is_empty())
    }
}

/// Fixed RKE2 destinations derived from the data and config directories
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPaths {
    data_dir: PathBuf,
    config_dir: PathBuf,
    rke1_cloud_config: PathBuf,
}

impl TargetPaths {
    /// Paths rooted at the given RKE2 data and config directories
    pub fn new(data_dir: impl AsRef<Path>, config_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            config_dir: config_dir.as_ref().to_path_buf(),
            rke1_cloud_config: PathBuf::from(RKE1_CLOUD_CONFIG),
        }
    }

    /// Override where the RKE1 cloud provider config is read from
    pub fn with_rke1_cloud_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.rke1_cloud_config = path.into();
        self
    }

    /// RKE2 data directory
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// `<data>/server`
    pub fn server_dir(&self) -> PathBuf {
        self.data_dir.join("server")
    }

    /// `<data>/server/tls`
    pub fn tls_dir(&self) -> PathBuf {
        self.server_dir().join("tls")
    }

    /// `<data>/server/db`
    pub fn db_dir(&self) -> PathBuf {
        self.server_dir().join("db")
    }

    /// `<data>/server/db/snapshots`
    pub fn snapshots_dir(&self) -> PathBuf {
        self.db_dir().join("snapshots")
    }

    /// `<data>/server/manifests`
    pub fn manifests_dir(&self) -> PathBuf {
        self.server_dir().join("manifests")
    }

    /// `<data>/agent`
    pub fn agent_dir(&self) -> PathBuf {
        self.data_dir.join("agent")
    }

    /// `<config>/config.yaml.d`
    pub fn config_drop_in_dir(&self) -> PathBuf {
        self.config_dir.join("config.yaml.d")
    }

    /// `<config>/registries.yaml`
    pub fn registries_file(&self) -> PathBuf {
        self.config_dir.join("registries.yaml")
    }

    /// `<config>/cloud.conf`
    pub fn cloud_config_file(&self) -> PathBuf {
        self.config_dir.join("cloud.conf")
    }

    /// RKE1 cloud provider config on this node
    pub fn rke1_cloud_config(&self) -> &Path {
        &self.rke1_cloud_config
    }
}

/// Write `contents` to `path`, creating parents, replacing any existing file
/// and setting `mode` on it
pub(crate) fn write_file(path: &Path, contents: &[u8], mode: u32) -> crate::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(parent) = path.parent() {
        create_dir(parent, 0o700)?;
    }
    std::fs::write(path, contents)
        .map_err(|e| crate::Error::io(format!("failed to write {}", path.display()), e))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|e| {
        crate::Error::io(format!("failed to set permissions on {}", path.display()), e)
    })
}

/// Create `dir` and any missing parents with `mode`
pub(crate) fn create_dir(dir: &Path, mode: u32) -> crate::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(dir)
        .map_err(|e| crate::Error::io(format!("failed to create {}", dir.display()), e))
}
