//! kube-proxy kubeconfig for worker-only nodes
//!
//! Workers are not given RKE2 server material, but kube-proxy has to keep
//! reaching the API server between the RKE1 teardown and the RKE2 agent
//! start. The kubeconfig reuses the RKE1 kube-proxy client certificate.

use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine};
use minijinja::{context, Environment};
use serde::Deserialize;
use tracing::info;

use crate::config::{self, TargetPaths};
use crate::state::{cert_names, CertificatePki, ClusterState};
use crate::{Error, Result};

/// File name of the kube-proxy kubeconfig under the agent directory
pub const KUBE_PROXY_KUBECONFIG: &str = "kubeproxy.kubeconfig";

const KUBECONFIG_TEMPLATE: &str = include_str!("../../templates/kubeproxy.kubeconfig");

const KUBECONFIG_MODE: u32 = 0o600;

#[derive(Deserialize)]
struct Kubeconfig {
    #[serde(default)]
    clusters: Vec<NamedCluster>,
}

#[derive(Deserialize)]
struct NamedCluster {
    cluster: ClusterEndpoint,
}

#[derive(Deserialize)]
struct ClusterEndpoint {
    #[serde(default)]
    server: String,
}

/// API server URL from the first cluster of a kubeconfig document
pub fn server_url(kubeconfig: &str) -> Result<String> {
    let parsed: Kubeconfig = serde_yaml::from_str(kubeconfig)?;
    parsed
        .clusters
        .into_iter()
        .map(|c| c.cluster.server)
        .find(|s| !s.is_empty())
        .ok_or_else(|| Error::validation("kubeconfig has no cluster server"))
}

/// Server URL for kube-proxy: the embedded kubeconfig when the state carries
/// one, else the kubeconfig RKE1 left at `configPath`
fn kube_proxy_server(pki: &CertificatePki) -> Result<String> {
    if !pki.config.is_empty() {
        return server_url(&pki.config);
    }
    if pki.config_path.is_empty() {
        return Err(Error::validation(
            "kube-proxy certificate has neither an embedded config nor a config path",
        ));
    }
    let path = Path::new(&pki.config_path);
    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::io(format!("failed to read {}", path.display()), e))?;
    server_url(&contents)
}

/// Render the kube-proxy kubeconfig
pub fn render_kube_proxy_config(
    server: &str,
    ca: &CertificatePki,
    client: &CertificatePki,
) -> Result<String> {
    let mut env = Environment::new();
    env.set_keep_trailing_newline(true);
    env.add_template("kubeproxy", KUBECONFIG_TEMPLATE)
        .map_err(|e| Error::template(e.to_string()))?;

    env.get_template("kubeproxy")
        .and_then(|t| {
            t.render(context! {
                server => server,
                ca_data => STANDARD.encode(ca.certificate_pem.as_bytes()),
                client_cert_data => STANDARD.encode(client.certificate_pem.as_bytes()),
                client_key_data => STANDARD.encode(client.key_pem.as_bytes()),
            })
        })
        .map_err(|e| Error::template(e.to_string()))
}

/// Write `<data>/agent/kubeproxy.kubeconfig`, replacing any previous one
pub fn export_kube_proxy_config(paths: &TargetPaths, state: &ClusterState) -> Result<()> {
    let client = state.certificate(cert_names::KUBE_PROXY).ok_or_else(|| {
        Error::validation("state has no kube-proxy certificate")
    })?;
    let ca = state
        .certificate(cert_names::CA)
        .ok_or_else(|| Error::validation("state has no kube-ca certificate"))?;

    let server = kube_proxy_server(client)?;
    let rendered = render_kube_proxy_config(&server, ca, client)?;

    let path = paths.agent_dir().join(KUBE_PROXY_KUBECONFIG);
    config::write_file(&path, rendered.as_bytes(), KUBECONFIG_MODE)?;
    info!(path = %path.display(), server = %server, "Wrote kube-proxy kubeconfig");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMBEDDED: &str = "apiVersion: v1
kind: Config
clusters:
- cluster:
    api-version: v1
    certificate-authority: /etc/kubernetes/ssl/kube-ca.pem
    server: \"https://127.0.0.1:6443\"
  name: \"local\"
";

    fn state(config: &str, config_path: &str) -> ClusterState {
        let mut state = ClusterState::default();
        state.certificates_bundle.insert(
            cert_names::CA.to_string(),
            CertificatePki {
                certificate_pem: "CA PEM".to_string(),
                ..Default::default()
            },
        );
        state.certificates_bundle.insert(
            cert_names::KUBE_PROXY.to_string(),
            CertificatePki {
                certificate_pem: "PROXY CERT".to_string(),
                key_pem: "PROXY KEY".to_string(),
                config: config.to_string(),
                config_path: config_path.to_string(),
                ..Default::default()
            },
        );
        state
    }

    #[test]
    fn test_server_url_from_kubeconfig() {
        assert_eq!(server_url(EMBEDDED).unwrap(), "https://127.0.0.1:6443");
        assert!(server_url("clusters: []").is_err());
    }

    /// Story: a worker gets a kubeconfig built from the RKE1 proxy cert
    #[test]
    fn story_worker_kube_proxy_kubeconfig() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = TargetPaths::new(tmp.path().join("data"), tmp.path().join("etc"));

        export_kube_proxy_config(&paths, &state(EMBEDDED, "")).unwrap();

        let written =
            std::fs::read_to_string(paths.agent_dir().join(KUBE_PROXY_KUBECONFIG)).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&written).unwrap();
        let cluster = &doc["clusters"][0]["cluster"];
        assert_eq!(cluster["server"], "https://127.0.0.1:6443");
        assert_eq!(
            cluster["certificate-authority-data"],
            STANDARD.encode("CA PEM").as_str()
        );
        let user = &doc["users"][0]["user"];
        assert_eq!(
            user["client-key-data"],
            STANDARD.encode("PROXY KEY").as_str()
        );
        assert_eq!(doc["current-context"], "Default");
    }

    #[test]
    fn test_server_read_from_config_path() {
        let tmp = tempfile::tempdir().unwrap();
        let config_path = tmp.path().join("kubecfg-kube-proxy.yaml");
        std::fs::write(&config_path, EMBEDDED).unwrap();
        let paths = TargetPaths::new(tmp.path().join("data"), tmp.path().join("etc"));

        export_kube_proxy_config(&paths, &state("", &config_path.to_string_lossy())).unwrap();
        assert!(paths.agent_dir().join(KUBE_PROXY_KUBECONFIG).exists());
    }

    #[test]
    fn test_rewrites_existing_kubeconfig() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = TargetPaths::new(tmp.path().join("data"), tmp.path().join("etc"));
        let path = paths.agent_dir().join(KUBE_PROXY_KUBECONFIG);
        std::fs::create_dir_all(paths.agent_dir()).unwrap();
        std::fs::write(&path, b"stale").unwrap();

        export_kube_proxy_config(&paths, &state(EMBEDDED, "")).unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().starts_with("apiVersion: v1"));
    }

    #[test]
    fn test_missing_proxy_certificate() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = TargetPaths::new(tmp.path().join("data"), tmp.path().join("etc"));
        let err = export_kube_proxy_config(&paths, &ClusterState::default()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
