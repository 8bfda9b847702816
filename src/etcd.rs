//! Restoring the RKE etcd backup into the RKE2 datastore directory
//!
//! The backup is restored into `<data>/server/db/etcd` as a fresh single
//! member cluster named after this node. RKE2 finds the restored member on
//! start and the `tombstone` marker tells it the datastore was reset.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

#[cfg(test)]
use mockall::automock;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::{self, TargetPaths};
use crate::node::ResolvedIdentity;
use crate::state::{cert_names, ClusterState};
use crate::{Error, Result};

/// Port etcd peers talk on
pub const ETCD_PEER_PORT: u16 = 2380;

const SECRET_MODE: u32 = 0o600;

/// File in the restored member dir holding the SHA-256 of its backup
pub const RESTORED_FROM_FILE: &str = "restored-from";

/// Parameters of one datastore restore
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestoreRequest {
    /// etcd backup file
    pub backup: PathBuf,
    /// Directory the member data is restored into; must not exist
    pub data_dir: PathBuf,
    /// Member name
    pub name: String,
    /// Advertised peer URL of the member
    pub peer_url: String,
}

impl RestoreRequest {
    /// `--initial-cluster` value for a single member cluster
    pub fn initial_cluster(&self) -> String {
        format!("{}={}", self.name, self.peer_url)
    }
}

/// Restores an etcd backup into a data directory
#[cfg_attr(test, automock)]
pub trait DatastoreRestorer: Send + Sync {
    /// Materialize `request.backup` under `request.data_dir`
    fn restore(&self, request: &RestoreRequest) -> Result<()>;
}

/// Command output for testability
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Whether command succeeded
    pub success: bool,
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

/// [`DatastoreRestorer`] running `etcdutl snapshot restore`
#[derive(Clone, Debug)]
pub struct EtcdutlRestorer {
    binary: PathBuf,
}

impl Default for EtcdutlRestorer {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("etcdutl"),
        }
    }
}

impl EtcdutlRestorer {
    /// Restorer using the `etcdutl` at `binary`
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self, request: &RestoreRequest) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("snapshot")
            .arg("restore")
            .arg(&request.backup)
            .arg("--data-dir")
            .arg(&request.data_dir)
            .arg("--name")
            .arg(&request.name)
            .arg("--initial-cluster")
            .arg(request.initial_cluster())
            .arg("--initial-advertise-peer-urls")
            .arg(&request.peer_url);
        cmd
    }
}

impl DatastoreRestorer for EtcdutlRestorer {
    fn restore(&self, request: &RestoreRequest) -> Result<()> {
        let mut cmd = self.command(request);
        debug!(command = ?cmd, "Executing etcdutl snapshot restore");

        let output: CommandOutput = cmd
            .output()
            .map_err(|e| {
                Error::command(format!("failed to execute {}: {}", self.binary.display(), e))
            })?
            .into();

        if !output.success {
            return Err(Error::command(format!(
                "etcdutl snapshot restore failed: {}",
                output.stderr.trim()
            )));
        }
        debug!(stdout = %output.stdout.trim(), "etcdutl snapshot restore finished");
        Ok(())
    }
}

/// Peer URL for `ip`, bracketing IPv6 literals
pub fn peer_url(ip: &str) -> String {
    match ip.parse::<std::net::Ipv6Addr>() {
        Ok(v6) => format!("https://[{}]:{}", v6, ETCD_PEER_PORT),
        Err(_) => format!("https://{}:{}", ip, ETCD_PEER_PORT),
    }
}

/// Hex SHA-256 of the backup file
fn backup_digest(backup: &Path) -> Result<String> {
    let mut file = File::open(backup)
        .map_err(|e| Error::io(format!("failed to open {}", backup.display()), e))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)
        .map_err(|e| Error::io(format!("failed to read {}", backup.display()), e))?;
    Ok(hex::encode(hasher.finalize()))
}

/// Whether `etcd_dir` was restored from the backup with digest `digest`
fn restored_from(etcd_dir: &Path, digest: &str) -> bool {
    std::fs::read_to_string(etcd_dir.join(RESTORED_FROM_FILE))
        .map(|recorded| recorded.trim() == digest)
        .unwrap_or(false)
}

/// Clear `etcd_dir` ahead of a restore of the backup with digest `digest`.
///
/// Data left by an earlier restore of the same backup is removed, since the
/// restore recreates it. Anything else is moved out of the way as
/// `etcd-old-<secs>`, and that path is returned.
fn clear_data_dir(etcd_dir: &Path, digest: &str) -> Result<Option<PathBuf>> {
    if !etcd_dir.exists() {
        return Ok(None);
    }

    if restored_from(etcd_dir, digest) {
        std::fs::remove_dir_all(etcd_dir).map_err(|e| {
            Error::io(format!("failed to remove {}", etcd_dir.display()), e)
        })?;
        debug!(dir = %etcd_dir.display(), "Removed data of an earlier restore of this backup");
        return Ok(None);
    }

    move_aside(etcd_dir).map(Some)
}

/// Move `etcd_dir` out of the way as `etcd-old-<secs>`
fn move_aside(etcd_dir: &Path) -> Result<PathBuf> {
    let base = format!("etcd-old-{}", chrono::Utc::now().timestamp());
    let parent = etcd_dir.parent().unwrap_or(Path::new("."));
    let mut target = parent.join(&base);
    let mut attempt = 1;
    while target.exists() {
        target = parent.join(format!("{}.{}", base, attempt));
        attempt += 1;
    }

    std::fs::rename(etcd_dir, &target).map_err(|e| {
        Error::io(
            format!("failed to move {} aside", etcd_dir.display()),
            e,
        )
    })?;
    Ok(target)
}

/// Restore `backup` into the RKE2 datastore for this node
pub fn restore(
    paths: &TargetPaths,
    state: &ClusterState,
    identity: &ResolvedIdentity,
    backup: &Path,
    restorer: &dyn DatastoreRestorer,
) -> Result<()> {
    let api_cert = state
        .certificate(cert_names::KUBE_API)
        .ok_or_else(|| Error::validation("state has no kube-apiserver certificate"))?;
    let digest = backup_digest(backup)?;

    // etcd client credentials for the apiserver
    let etcd_tls = paths.tls_dir().join("etcd");
    config::write_file(
        &etcd_tls.join("client.crt"),
        api_cert.certificate_pem.as_bytes(),
        SECRET_MODE,
    )?;
    config::write_file(
        &etcd_tls.join("client.key"),
        api_cert.key_pem.as_bytes(),
        SECRET_MODE,
    )?;

    let db_dir = paths.db_dir();
    config::create_dir(&db_dir, 0o700)?;
    let etcd_dir = db_dir.join("etcd");
    if let Some(old) = clear_data_dir(&etcd_dir, &digest)? {
        info!(from = %etcd_dir.display(), to = %old.display(), "Moved existing etcd data aside");
    }

    let request = RestoreRequest {
        backup: backup.to_path_buf(),
        data_dir: etcd_dir.clone(),
        name: identity.node_name().to_string(),
        peer_url: peer_url(identity.peer_ip()),
    };
    info!(
        backup = %backup.display(),
        member = %request.name,
        peer_url = %request.peer_url,
        "Restoring etcd snapshot"
    );
    restorer.restore(&request)?;

    config::write_file(&etcd_dir.join("name"), request.name.as_bytes(), SECRET_MODE)?;
    config::write_file(&etcd_dir.join(RESTORED_FROM_FILE), digest.as_bytes(), SECRET_MODE)?;
    config::write_file(&db_dir.join("tombstone"), b"", SECRET_MODE)?;
    info!(dir = %etcd_dir.display(), "etcd snapshot restored");
    Ok(())
}
