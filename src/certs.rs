//! Recovery of cluster CA material from the RKE state bundle
//!
//! RKE2 generates any certificate it does not find on disk at first start, so
//! only the CAs and the service account key are carried over. Leaf
//! certificates are then re-issued by RKE2 from the same CAs and existing
//! tokens and kubeconfigs stay valid.

use tracing::{debug, info};

use crate::config::{self, TargetPaths};
use crate::state::{cert_names, CertificatePki, ClusterState};
use crate::Result;

/// Mode of every recovered file
pub const CERT_FILE_MODE: u32 = 0o600;

/// Mode of the directories holding recovered files
pub const CERT_DIR_MODE: u32 = 0o700;

/// Where a bundle entry's certificate and key are written, relative to the
/// RKE2 `server/tls` directory
struct Destinations {
    certs: &'static [&'static str],
    keys: &'static [&'static str],
}

fn destinations(name: &str) -> Option<Destinations> {
    let dest = match name {
        cert_names::CA => Destinations {
            certs: &[
                "client-ca.crt",
                "server-ca.crt",
                "etcd/peer-ca.crt",
                "etcd/server-ca.crt",
            ],
            keys: &[
                "client-ca.key",
                "server-ca.key",
                "etcd/peer-ca.key",
                "etcd/server-ca.key",
            ],
        },
        cert_names::REQUEST_HEADER_CA => Destinations {
            certs: &["request-header-ca.crt"],
            keys: &["request-header-ca.key"],
        },
        cert_names::ETCD_CLIENT_CA => Destinations {
            certs: &["etcd/server-ca.crt"],
            keys: &["etcd/server-ca.key"],
        },
        cert_names::SERVICE_ACCOUNT_TOKEN_KEY => Destinations {
            certs: &[],
            keys: &["service.key"],
        },
        _ => return None,
    };
    Some(dest)
}

/// Write CA certificates and keys from the state bundle under `server/tls`.
///
/// Entries are processed in name order, so when two entries share a
/// destination the later name wins on every run.
pub fn recover_certs(paths: &TargetPaths, state: &ClusterState) -> Result<()> {
    info!("Migrating CA certificates from RKE state file");
    let tls_dir = paths.tls_dir();
    config::create_dir(&tls_dir.join("etcd"), CERT_DIR_MODE)?;

    let mut written = 0usize;
    for (name, pki) in &state.certificates_bundle {
        let Some(dest) = destinations(name) else {
            continue;
        };
        written += write_material(&tls_dir, name, pki, &dest)?;
    }

    info!(files = written, dir = %tls_dir.display(), "CA certificates migrated");
    Ok(())
}

fn write_material(
    tls_dir: &std::path::Path,
    name: &str,
    pki: &CertificatePki,
    dest: &Destinations,
) -> Result<usize> {
    let files = dest
        .certs
        .iter()
        .map(|rel| (rel, pki.certificate_pem.as_bytes()))
        .chain(dest.keys.iter().map(|rel| (rel, pki.key_pem.as_bytes())));

    let mut count = 0;
    for (rel, contents) in files {
        let path = tls_dir.join(rel);
        config::write_file(&path, contents, CERT_FILE_MODE)?;
        debug!(certificate = name, path = %path.display(), "Wrote certificate material");
        count += 1;
    }
    Ok(count)
}
