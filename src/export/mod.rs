//! RKE2 configuration derived from the RKE cluster state
//!
//! - [`export_cluster_config`] writes the server flags drop-in
//! - [`configure_private_registries`] writes `registries.yaml`
//! - [`export_kube_proxy_config`] writes the worker kube-proxy kubeconfig

mod kubeproxy;

pub use kubeproxy::{export_kube_proxy_config, KUBE_PROXY_KUBECONFIG};

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::{self, TargetPaths};
use crate::node::{ResolvedIdentity, Role};
use crate::state::ClusterState;
use crate::{Error, Result};

/// Name of the drop-in holding migrated server flags
pub const CLUSTER_CONFIG_FILE: &str = "10-migration.yaml";

const CONFIG_FILE_MODE: u32 = 0o600;

/// Default registry host when a private registry has no URL
const DEFAULT_REGISTRY: &str = "docker.io";

/// CNI plugins RKE2 does not ship
const UNSUPPORTED_CNI: &[&str] = &["weave"];

/// Number of comma separated fields in a registry TLS spec
const REGISTRY_TLS_FIELDS: usize = 4;

/// A value in the RKE2 config file
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ConfigValue {
    /// Scalar flag
    String(String),
    /// Repeatable flag
    List(Vec<String>),
    /// Boolean flag
    Bool(bool),
}

impl From<&str> for ConfigValue {
    fn from(s: &str) -> Self {
        ConfigValue::String(s.to_string())
    }
}

/// RKE2 server flags for this node, keyed by flag name
pub fn cluster_config(
    paths: &TargetPaths,
    state: &ClusterState,
    identity: &ResolvedIdentity,
) -> Result<BTreeMap<String, ConfigValue>> {
    let rke = &state.rke_config;
    let services = &rke.services;
    let mut args = BTreeMap::new();

    let scalars = [
        ("service-cidr", services.kube_api.service_cluster_ip_range.as_str()),
        ("cluster-cidr", services.kube_controller.cluster_cidr.as_str()),
        (
            "service-node-port-range",
            services.kube_api.service_node_port_range.as_str(),
        ),
        ("cluster-domain", services.kubelet.cluster_domain.as_str()),
        ("cluster-dns", services.kubelet.cluster_dns_server.as_str()),
        ("node-name", identity.node_name()),
    ];
    for (flag, value) in scalars {
        if !value.is_empty() {
            args.insert(flag.to_string(), ConfigValue::from(value));
        }
    }

    let extra_args = [
        ("kube-apiserver-arg", &services.kube_api.extra_args),
        (
            "kube-controller-manager-arg",
            &services.kube_controller.extra_args,
        ),
        ("kube-scheduler-arg", &services.scheduler.extra_args),
        ("kubelet-arg", &services.kubelet.extra_args),
    ];
    for (flag, extra) in extra_args {
        if !extra.is_empty() {
            args.insert(flag.to_string(), ConfigValue::List(flag_list(extra)));
        }
    }

    let plugin = rke.network.plugin.as_str();
    if !plugin.is_empty() && !UNSUPPORTED_CNI.contains(&plugin) {
        args.insert("cni".to_string(), ConfigValue::from(plugin));
    }

    migrate_cloud_provider(paths, state, &mut args)?;

    let roles = identity.roles;
    if roles.contains(Role::Etcd) && !roles.contains(Role::ControlPlane) {
        for flag in [
            "disable-apiserver",
            "disable-controller-manager",
            "disable-scheduler",
        ] {
            args.insert(flag.to_string(), ConfigValue::Bool(true));
        }
    }
    if roles.contains(Role::ControlPlane) && !roles.contains(Role::Etcd) {
        args.insert("disable-etcd".to_string(), ConfigValue::Bool(true));
    }

    if let Some(registry) = rke.private_registries.iter().find(|r| r.is_default) {
        let url = if registry.url.is_empty() {
            DEFAULT_REGISTRY
        } else {
            registry.url.as_str()
        };
        args.insert("system-default-registry".to_string(), ConfigValue::from(url));
    }

    Ok(args)
}

/// Write the server flags drop-in under `config.yaml.d`, replacing any
/// previous one
pub fn export_cluster_config(
    paths: &TargetPaths,
    state: &ClusterState,
    identity: &ResolvedIdentity,
) -> Result<()> {
    let args = cluster_config(paths, state, identity)?;
    let yaml = serde_yaml::to_string(&args)?;
    let path = paths.config_drop_in_dir().join(CLUSTER_CONFIG_FILE);
    config::write_file(&path, yaml.as_bytes(), CONFIG_FILE_MODE)?;
    info!(path = %path.display(), flags = args.len(), "Exported cluster configuration");
    Ok(())
}

/// `k=v` flag list in key order. An empty value yields a bare `k`.
fn flag_list(extra: &BTreeMap<String, String>) -> Vec<String> {
    extra
        .iter()
        .map(|(k, v)| {
            if v.is_empty() {
                k.clone()
            } else {
                format!("{}={}", k, v)
            }
        })
        .collect()
}

fn migrate_cloud_provider(
    paths: &TargetPaths,
    state: &ClusterState,
    args: &mut BTreeMap<String, ConfigValue>,
) -> Result<()> {
    let name = &state.rke_config.cloud_provider.name;
    if name.is_empty() {
        return Ok(());
    }

    info!(provider = %name, "Migrating RKE cloud provider config");
    args.insert(
        "cloud-provider-name".to_string(),
        ConfigValue::from(name.as_str()),
    );

    let source = paths.rke1_cloud_config();
    if source.is_file() {
        let contents = std::fs::read(source)
            .map_err(|e| Error::io(format!("failed to read {}", source.display()), e))?;
        let dest = paths.cloud_config_file();
        config::write_file(&dest, &contents, CONFIG_FILE_MODE)?;
        args.insert(
            "cloud-provider-config".to_string(),
            ConfigValue::String(dest.to_string_lossy().into_owned()),
        );
    }
    Ok(())
}

/// `registries.yaml` document
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Registries {
    /// Per-endpoint auth and TLS settings
    pub configs: BTreeMap<String, RegistryConfig>,
}

/// Settings for one registry endpoint
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RegistryConfig {
    /// Credentials
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<RegistryAuth>,
    /// Client TLS files
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<RegistryTls>,
}

/// Registry credentials
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RegistryAuth {
    /// Username
    pub username: String,
    /// Password
    pub password: String,
}

/// Registry TLS file locations
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RegistryTls {
    /// CA bundle
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ca_file: String,
    /// Client certificate
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cert_file: String,
    /// Client key
    #[serde(skip_serializing_if = "String::is_empty")]
    pub key_file: String,
}

/// Parsed `url,ca,cert,key` registry TLS spec
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryTlsSpec {
    /// Registry the files apply to
    pub endpoint: String,
    /// Files to use
    pub tls: RegistryTls,
}

impl std::str::FromStr for RegistryTlsSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        if parts.len() < REGISTRY_TLS_FIELDS {
            return Err(Error::validation(format!(
                "registry TLS spec {:?} must be url,ca,cert,key",
                s
            )));
        }

        let endpoint = parts[0];
        if endpoint.is_empty() || !is_valid_registry_url(endpoint) {
            return Err(Error::validation(format!(
                "registry url {:?} is invalid",
                endpoint
            )));
        }

        Ok(Self {
            endpoint: endpoint.to_string(),
            tls: RegistryTls {
                ca_file: parts[1].to_string(),
                cert_file: parts[2].to_string(),
                key_file: parts[3].to_string(),
            },
        })
    }
}

/// Accepts full URLs and bare `host[:port]` endpoints
fn is_valid_registry_url(endpoint: &str) -> bool {
    let candidate = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("https://{}", endpoint)
    };
    url::Url::parse(&candidate)
        .map(|u| u.host_str().is_some_and(|h| !h.is_empty()))
        .unwrap_or(false)
}

/// TLS files for `endpoint` from the operator specs. Malformed specs are
/// skipped with a warning; the last matching spec wins.
pub fn registry_tls_for(endpoint: &str, specs: &[String]) -> Option<RegistryTls> {
    specs
        .iter()
        .filter_map(|raw| match raw.parse::<RegistryTlsSpec>() {
            Ok(spec) => Some(spec),
            Err(e) => {
                warn!(spec = %raw, error = %e, "Skipping registry TLS spec");
                None
            }
        })
        .filter(|spec| spec.endpoint == endpoint)
        .last()
        .map(|spec| spec.tls)
}

/// Write `registries.yaml` for the private registries in the state.
///
/// Registries without both a user and a password carry no auth and are left
/// out. Nothing is written when the state has no private registries.
pub fn configure_private_registries(
    paths: &TargetPaths,
    state: &ClusterState,
    registries_tls: &[String],
) -> Result<()> {
    let private = &state.rke_config.private_registries;
    if private.is_empty() {
        return Ok(());
    }

    let mut registries = Registries::default();
    for registry in private {
        if registry.user.is_empty() || registry.password.is_empty() {
            continue;
        }
        let endpoint = if registry.url.is_empty() {
            DEFAULT_REGISTRY
        } else {
            registry.url.as_str()
        };
        registries.configs.insert(
            endpoint.to_string(),
            RegistryConfig {
                auth: Some(RegistryAuth {
                    username: registry.user.clone(),
                    password: registry.password.clone(),
                }),
                tls: registry_tls_for(endpoint, registries_tls),
            },
        );
    }

    let yaml = serde_yaml::to_string(&registries)?;
    let path = paths.registries_file();
    config::write_file(&path, yaml.as_bytes(), CONFIG_FILE_MODE)?;
    info!(
        path = %path.display(),
        registries = registries.configs.len(),
        "Configured private registries"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{HostIdentity, MatchSource, RoleSet};
    use crate::state::{NodeSpec, PrivateRegistry};

    fn identity(roles: &[&str]) -> ResolvedIdentity {
        let node = NodeSpec {
            address: "10.0.0.5".to_string(),
            hostname_override: "node-a".to_string(),
            role: roles.iter().map(|r| r.to_string()).collect(),
            ..Default::default()
        };
        ResolvedIdentity {
            roles: RoleSet::from_tags(&node.role),
            node,
            host: HostIdentity::new("node-a", "10.0.0.5"),
            matched_by: MatchSource::LocalIdentity,
        }
    }

    fn sample_state() -> ClusterState {
        let mut state = ClusterState::default();
        let services = &mut state.rke_config.services;
        services.kube_api.service_cluster_ip_range = "10.43.0.0/16".to_string();
        services.kube_api.service_node_port_range = "30000-32767".to_string();
        services
            .kube_api
            .extra_args
            .insert("audit-log-path".to_string(), "-".to_string());
        services
            .kube_api
            .extra_args
            .insert("anonymous-auth".to_string(), String::new());
        services.kube_controller.cluster_cidr = "10.42.0.0/16".to_string();
        services.kubelet.cluster_domain = "cluster.local".to_string();
        services.kubelet.cluster_dns_server = "10.43.0.10".to_string();
        state.rke_config.network.plugin = "canal".to_string();
        state
    }

    fn paths(tmp: &tempfile::TempDir) -> TargetPaths {
        TargetPaths::new(tmp.path().join("data"), tmp.path().join("etc"))
            .with_rke1_cloud_config(tmp.path().join("rke1/cloud-config"))
    }

    fn string(args: &BTreeMap<String, ConfigValue>, key: &str) -> Option<String> {
        match args.get(key) {
            Some(ConfigValue::String(s)) => Some(s.clone()),
            _ => None,
        }
    }

    #[test]
    fn test_cluster_config_maps_services() {
        let tmp = tempfile::tempdir().unwrap();
        let args = cluster_config(&paths(&tmp), &sample_state(), &identity(&["etcd", "controlplane"]))
            .unwrap();

        assert_eq!(string(&args, "service-cidr").as_deref(), Some("10.43.0.0/16"));
        assert_eq!(string(&args, "cluster-cidr").as_deref(), Some("10.42.0.0/16"));
        assert_eq!(string(&args, "cluster-dns").as_deref(), Some("10.43.0.10"));
        assert_eq!(string(&args, "node-name").as_deref(), Some("node-a"));
        assert_eq!(string(&args, "cni").as_deref(), Some("canal"));
        assert_eq!(
            args.get("kube-apiserver-arg"),
            Some(&ConfigValue::List(vec![
                "anonymous-auth".to_string(),
                "audit-log-path=-".to_string()
            ]))
        );
        assert!(!args.contains_key("kubelet-arg"));
        assert!(!args.contains_key("disable-etcd"));
        assert!(!args.contains_key("disable-apiserver"));
    }

    #[test]
    fn test_role_split_disables_components() {
        let tmp = tempfile::tempdir().unwrap();
        let state = sample_state();

        let etcd_only = cluster_config(&paths(&tmp), &state, &identity(&["etcd"])).unwrap();
        assert_eq!(etcd_only.get("disable-apiserver"), Some(&ConfigValue::Bool(true)));
        assert_eq!(etcd_only.get("disable-scheduler"), Some(&ConfigValue::Bool(true)));
        assert!(!etcd_only.contains_key("disable-etcd"));

        let cp_only = cluster_config(&paths(&tmp), &state, &identity(&["controlplane"])).unwrap();
        assert_eq!(cp_only.get("disable-etcd"), Some(&ConfigValue::Bool(true)));
        assert!(!cp_only.contains_key("disable-apiserver"));
    }

    #[test]
    fn test_weave_is_not_carried_over() {
        let tmp = tempfile::tempdir().unwrap();
        let mut state = sample_state();
        state.rke_config.network.plugin = "weave".to_string();

        let args = cluster_config(&paths(&tmp), &state, &identity(&["etcd"])).unwrap();
        assert!(!args.contains_key("cni"));
    }

    #[test]
    fn test_cloud_provider_config_is_copied() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = paths(&tmp);
        std::fs::create_dir_all(tmp.path().join("rke1")).unwrap();
        std::fs::write(paths.rke1_cloud_config(), b"[Global]\nzone=a\n").unwrap();

        let mut state = sample_state();
        state.rke_config.cloud_provider.name = "aws".to_string();
        let args = cluster_config(&paths, &state, &identity(&["controlplane"])).unwrap();

        assert_eq!(string(&args, "cloud-provider-name").as_deref(), Some("aws"));
        assert_eq!(
            string(&args, "cloud-provider-config"),
            Some(paths.cloud_config_file().to_string_lossy().into_owned())
        );
        assert_eq!(
            std::fs::read(paths.cloud_config_file()).unwrap(),
            b"[Global]\nzone=a\n"
        );
    }

    #[test]
    fn test_cloud_provider_without_rke1_file() {
        let tmp = tempfile::tempdir().unwrap();
        let mut state = sample_state();
        state.rke_config.cloud_provider.name = "external".to_string();

        let args = cluster_config(&paths(&tmp), &state, &identity(&["controlplane"])).unwrap();
        assert_eq!(string(&args, "cloud-provider-name").as_deref(), Some("external"));
        assert!(!args.contains_key("cloud-provider-config"));
    }

    /// Story: re-exporting produces the same file
    ///
    /// The drop-in is replaced wholesale on every run and keys are sorted, so
    /// repeated migrations converge on identical output.
    #[test]
    fn story_export_is_stable_across_runs() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = paths(&tmp);
        let state = sample_state();
        let identity = identity(&["etcd", "controlplane"]);
        let file = paths.config_drop_in_dir().join(CLUSTER_CONFIG_FILE);

        std::fs::create_dir_all(paths.config_drop_in_dir()).unwrap();
        std::fs::write(&file, b"stale: true\n").unwrap();

        export_cluster_config(&paths, &state, &identity).unwrap();
        let first = std::fs::read_to_string(&file).unwrap();
        export_cluster_config(&paths, &state, &identity).unwrap();
        let second = std::fs::read_to_string(&file).unwrap();

        assert_eq!(first, second);
        assert!(!first.contains("stale"));
        assert!(first.find("cluster-cidr").unwrap() < first.find("service-cidr").unwrap());
        assert!(first.contains("- audit-log-path=-"));
    }

    #[test]
    fn test_system_default_registry() {
        let tmp = tempfile::tempdir().unwrap();
        let mut state = sample_state();
        state.rke_config.private_registries = vec![
            PrivateRegistry {
                url: "mirror.example.com".to_string(),
                ..Default::default()
            },
            PrivateRegistry {
                url: "registry.example.com:5000".to_string(),
                is_default: true,
                ..Default::default()
            },
        ];

        let args = cluster_config(&paths(&tmp), &state, &identity(&["etcd"])).unwrap();
        assert_eq!(
            string(&args, "system-default-registry").as_deref(),
            Some("registry.example.com:5000")
        );
    }

    #[test]
    fn test_registry_tls_spec_parsing() {
        let spec: RegistryTlsSpec = "registry.example.com,/ca.pem,/cert.pem,/key.pem"
            .parse()
            .unwrap();
        assert_eq!(spec.endpoint, "registry.example.com");
        assert_eq!(spec.tls.key_file, "/key.pem");

        assert!("registry.example.com,/ca.pem".parse::<RegistryTlsSpec>().is_err());
        assert!(",/ca.pem,/cert.pem,/key.pem".parse::<RegistryTlsSpec>().is_err());
        assert!("https://registry.example.com:5000,a,b,c"
            .parse::<RegistryTlsSpec>()
            .is_ok());
    }

    #[test]
    fn test_registry_tls_lookup_skips_malformed() {
        let specs = vec![
            "bad".to_string(),
            "other.example.com,/o-ca,/o-cert,/o-key".to_string(),
            "registry.example.com,/ca,/cert,/key".to_string(),
        ];
        let tls = registry_tls_for("registry.example.com", &specs).unwrap();
        assert_eq!(tls.ca_file, "/ca");
        assert!(registry_tls_for("docker.io", &specs).is_none());
    }

    #[test]
    fn test_private_registries_written_with_auth_and_tls() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let paths = paths(&tmp);
        let mut state = ClusterState::default();
        state.rke_config.private_registries = vec![
            PrivateRegistry {
                url: "registry.example.com".to_string(),
                user: "admin".to_string(),
                password: "s3cret".to_string(),
                is_default: true,
            },
            PrivateRegistry {
                user: "hub".to_string(),
                password: "hubpass".to_string(),
                ..Default::default()
            },
            PrivateRegistry {
                url: "anonymous.example.com".to_string(),
                ..Default::default()
            },
        ];
        let specs = vec!["registry.example.com,/ca.pem,/cert.pem,/key.pem".to_string()];

        configure_private_registries(&paths, &state, &specs).unwrap();

        let written = std::fs::read_to_string(paths.registries_file()).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&written).unwrap();
        let configs = &doc["configs"];
        assert_eq!(configs["registry.example.com"]["auth"]["username"], "admin");
        assert_eq!(configs["registry.example.com"]["tls"]["ca_file"], "/ca.pem");
        assert_eq!(configs["docker.io"]["auth"]["password"], "hubpass");
        assert!(configs["docker.io"].get("tls").is_none());
        assert!(configs.get("anonymous.example.com").is_none());

        let mode = std::fs::metadata(paths.registries_file())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_no_private_registries_writes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = paths(&tmp);
        configure_private_registries(&paths, &ClusterState::default(), &[]).unwrap();
        assert!(!paths.registries_file().exists());
    }
}
