//! RKE addon removal and translation into RKE2 HelmChartConfigs
//!
//! RKE1 deploys its system addons (network, DNS, ingress, metrics) from
//! ConfigMaps in `kube-system`. RKE2 ships the same components as Helm
//! charts. Migration drops manifests into `<data>/server/manifests`, which the
//! RKE2 deploy controller applies on start:
//!
//! - a Job that deletes the RKE1 addon objects
//! - a `HelmChartConfig` per chart carrying the RKE1 customizations

pub mod cni;
pub mod user;

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::DaemonSetUpdateStrategy;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, EnvVar, PodSpec, PodTemplateSpec, ServiceAccount,
    Toleration, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{self, TargetPaths};
use crate::state::{ClusterState, DnsConfig, IngressConfig, MonitoringConfig};
use crate::Result;

/// Namespace of the RKE system addons and the RKE2 charts
pub const SYSTEM_NAMESPACE: &str = "kube-system";

/// Manifest holding the addon removal job
pub const REMOVE_ADDONS_MANIFEST: &str = "migration-agent-addons-remove.yaml";

const MIGRATION_AGENT: &str = "migration-agent";
const REMOVE_JOB_NAME: &str = "migration-agent-addons-remove";
const KUBECTL_IMAGE: &str = "bitnami/kubectl:latest";
const MANIFEST_MODE: u32 = 0o600;

const INGRESS_NGINX_CHART: &str = "rke2-ingress-nginx";
const COREDNS_CHART: &str = "rke2-coredns";
const METRICS_SERVER_CHART: &str = "rke2-metrics-server";

/// RKE1 addon ConfigMaps removed after migration: (short name, ConfigMap)
const RKE_ADDON_CONFIGMAPS: [(&str, &str); 4] = [
    ("network", "rke-network-plugin"),
    ("coredns", "rke-coredns-addon"),
    ("ingress", "rke-ingress-controller"),
    ("metrics", "rke-metrics-addon"),
];

/// `helm.cattle.io/v1` HelmChartConfig
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmChartConfig {
    /// Always `helm.cattle.io/v1`
    pub api_version: String,
    /// Always `HelmChartConfig`
    pub kind: String,
    /// Named after the chart it customizes
    pub metadata: ObjectMeta,
    /// Values override
    pub spec: HelmChartConfigSpec,
}

/// HelmChartConfig spec
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmChartConfigSpec {
    /// Values YAML merged over the chart defaults
    pub values_content: String,
}

impl HelmChartConfig {
    /// Config for `chart` in `kube-system` with `values` as its values YAML
    pub fn new(chart: &str, values: &impl Serialize) -> Result<Self> {
        Ok(Self {
            api_version: "helm.cattle.io/v1".to_string(),
            kind: "HelmChartConfig".to_string(),
            metadata: ObjectMeta {
                name: Some(chart.to_string()),
                namespace: Some(SYSTEM_NAMESPACE.to_string()),
                ..Default::default()
            },
            spec: HelmChartConfigSpec {
                values_content: serde_yaml::to_string(values)?,
            },
        })
    }
}

/// Write `<chart>-config.yaml` into the manifests directory
pub(crate) fn write_helm_chart_config(
    paths: &TargetPaths,
    chart: &str,
    values: &impl Serialize,
) -> Result<()> {
    let config = HelmChartConfig::new(chart, values)?;
    let yaml = serde_yaml::to_string(&config)?;
    let path = paths.manifests_dir().join(format!("{}-config.yaml", chart));
    config::write_file(&path, yaml.as_bytes(), MANIFEST_MODE)?;
    info!(chart, path = %path.display(), "Wrote HelmChartConfig");
    Ok(())
}

fn service_account() -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(MIGRATION_AGENT.to_string()),
            namespace: Some(SYSTEM_NAMESPACE.to_string()),
            ..Default::default()
        },
        automount_service_account_token: Some(true),
        ..Default::default()
    }
}

fn cluster_role_binding() -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(MIGRATION_AGENT.to_string()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: "cluster-admin".to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: MIGRATION_AGENT.to_string(),
            namespace: Some(SYSTEM_NAMESPACE.to_string()),
            ..Default::default()
        }]),
    }
}

fn toleration(key: &str, operator: &str, value: Option<&str>, effect: Option<&str>) -> Toleration {
    Toleration {
        key: Some(key.to_string()),
        operator: Some(operator.to_string()),
        value: value.map(str::to_string),
        effect: effect.map(str::to_string),
        ..Default::default()
    }
}

fn removal_job() -> Job {
    let volumes = RKE_ADDON_CONFIGMAPS
        .iter()
        .map(|(short, configmap)| Volume {
            name: format!("{}-config", short),
            config_map: Some(ConfigMapVolumeSource {
                name: configmap.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        })
        .collect();

    let containers = RKE_ADDON_CONFIGMAPS
        .iter()
        .map(|(short, configmap)| {
            let mount_path = format!("/etc/rke_addon/{}", short);
            Container {
                name: format!("{}-addons-remove", short),
                image: Some(KUBECTL_IMAGE.to_string()),
                image_pull_policy: Some("IfNotPresent".to_string()),
                command: Some(vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    format!("kubectl delete -f {}/{}", mount_path, configmap),
                ]),
                volume_mounts: Some(vec![VolumeMount {
                    name: format!("{}-config", short),
                    mount_path,
                    ..Default::default()
                }]),
                ..Default::default()
            }
        })
        .collect();

    Job {
        metadata: ObjectMeta {
            name: Some(REMOVE_JOB_NAME.to_string()),
            namespace: Some(SYSTEM_NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    service_account_name: Some(MIGRATION_AGENT.to_string()),
                    restart_policy: Some("OnFailure".to_string()),
                    host_network: Some(true),
                    node_selector: Some(BTreeMap::from([(
                        "node-role.kubernetes.io/control-plane".to_string(),
                        "true".to_string(),
                    )])),
                    tolerations: Some(vec![
                        toleration("node.kubernetes.io/not-ready", "Exists", None, Some("NoSchedule")),
                        toleration(
                            "node.cloudprovider.kubernetes.io/uninitialized",
                            "Equal",
                            Some("true"),
                            Some("NoSchedule"),
                        ),
                        toleration("CriticalAddonsOnly", "Exists", None, None),
                        toleration("node-role.kubernetes.io/etcd", "Exists", None, Some("NoExecute")),
                        toleration(
                            "node-role.kubernetes.io/control-plane",
                            "Exists",
                            None,
                            Some("NoSchedule"),
                        ),
                        toleration(
                            "node-role.kubernetes.io/controlplane",
                            "Exists",
                            None,
                            Some("NoSchedule"),
                        ),
                    ]),
                    volumes: Some(volumes),
                    containers,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Multi-document manifest: service account, binding and removal job
pub fn removal_manifest() -> Result<String> {
    let documents = [
        serde_yaml::to_string(&service_account())?,
        serde_yaml::to_string(&cluster_role_binding())?,
        serde_yaml::to_string(&removal_job())?,
    ];
    Ok(documents.join("---\n"))
}

/// Drop the job that deletes the RKE1 system addons once RKE2 is up
pub fn remove_old_addons(paths: &TargetPaths) -> Result<()> {
    let manifest = removal_manifest()?;
    let path = paths.manifests_dir().join(REMOVE_ADDONS_MANIFEST);
    config::write_file(&path, manifest.as_bytes(), MANIFEST_MODE)?;
    info!(path = %path.display(), "Wrote RKE addon removal manifest");
    Ok(())
}

/// rke2-ingress-nginx values
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressValues {
    /// Controller settings
    pub controller: IngressControllerValues,
    /// Default backend settings
    pub default_backend: DefaultBackendValues,
}

/// rke2-ingress-nginx `controller` values
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressControllerValues {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    config: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    node_selector: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    extra_args: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    extra_envs: Vec<EnvVar>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    extra_volumes: Vec<Volume>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    extra_volume_mounts: Vec<VolumeMount>,
    #[serde(skip_serializing_if = "String::is_empty")]
    dns_policy: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    update_strategy: Option<DaemonSetUpdateStrategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    host_port: Option<HostPortValues>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tolerations: Vec<Toleration>,
    #[serde(skip_serializing_if = "String::is_empty")]
    priority_class_name: String,
}

#[derive(Clone, Debug, Default, Serialize)]
struct HostPortValues {
    ports: HostPorts,
}

#[derive(Clone, Debug, Default, Serialize)]
struct HostPorts {
    #[serde(skip_serializing_if = "Option::is_none")]
    http: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    https: Option<i32>,
}

/// rke2-ingress-nginx `defaultBackend` values
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultBackendValues {
    enabled: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    priority_class_name: String,
}

fn non_zero(port: i32) -> Option<i32> {
    (port != 0).then_some(port)
}

/// Chart values equivalent to the RKE nginx ingress settings
pub fn ingress_values(ingress: &IngressConfig) -> IngressValues {
    let host_port = match (non_zero(ingress.http_port), non_zero(ingress.https_port)) {
        (None, None) => None,
        (http, https) => Some(HostPortValues {
            ports: HostPorts { http, https },
        }),
    };

    let update_strategy = ingress
        .update_strategy
        .as_ref()
        .map(|s| DaemonSetUpdateStrategy {
            type_: s.strategy.clone(),
            rolling_update: s.rolling_update.clone(),
        });

    IngressValues {
        controller: IngressControllerValues {
            config: ingress.options.clone(),
            node_selector: ingress.node_selector.clone(),
            extra_args: ingress.extra_args.clone(),
            extra_envs: ingress.extra_envs.clone(),
            extra_volumes: ingress.extra_volumes.clone(),
            extra_volume_mounts: ingress.extra_volume_mounts.clone(),
            dns_policy: ingress.dns_policy.clone(),
            update_strategy,
            host_port,
            tolerations: ingress.tolerations.clone(),
            priority_class_name: ingress.nginx_ingress_controller_priority_class_name.clone(),
        },
        // RKE deploys the default backend unless told otherwise
        default_backend: DefaultBackendValues {
            enabled: ingress.default_backend.unwrap_or(true),
            priority_class_name: ingress.default_http_backend_priority_class_name.clone(),
        },
    }
}

/// rke2-coredns values
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorednsValues {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    node_selector: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tolerations: Vec<Toleration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    nodelocal: Option<NodeLocalValues>,
}

#[derive(Clone, Debug, Default, Serialize)]
struct NodeLocalValues {
    enabled: bool,
    ip_address: String,
}

/// Chart values equivalent to the RKE CoreDNS settings
pub fn coredns_values(dns: &DnsConfig) -> CorednsValues {
    let nodelocal = dns
        .nodelocal
        .as_ref()
        .filter(|n| !n.ip_address.is_empty())
        .map(|n| NodeLocalValues {
            enabled: true,
            ip_address: n.ip_address.clone(),
        });

    CorednsValues {
        node_selector: dns.node_selector.clone(),
        tolerations: dns.tolerations.clone(),
        nodelocal,
    }
}

/// rke2-metrics-server values
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsServerValues {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    node_selector: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tolerations: Vec<Toleration>,
    #[serde(skip_serializing_if = "String::is_empty")]
    priority_class_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    replicas: Option<i32>,
}

/// Chart values equivalent to the RKE metrics-server settings
pub fn metrics_server_values(monitoring: &MonitoringConfig) -> MetricsServerValues {
    MetricsServerValues {
        node_selector: monitoring.node_selector.clone(),
        tolerations: monitoring.tolerations.clone(),
        priority_class_name: monitoring.metrics_server_priority_class_name.clone(),
        replicas: monitoring.replicas,
    }
}

/// Translate ingress, DNS and metrics addon settings into HelmChartConfigs.
///
/// Each addon is only translated when RKE ran the provider RKE2 ships;
/// anything else is skipped.
pub fn migrate_addons_config(paths: &TargetPaths, state: &ClusterState) -> Result<()> {
    let rke = &state.rke_config;

    if rke.ingress.provider == "nginx" {
        write_helm_chart_config(paths, INGRESS_NGINX_CHART, &ingress_values(&rke.ingress))?;
    } else {
        debug!(provider = %rke.ingress.provider, "Ingress provider not migrated");
    }

    match &rke.dns {
        Some(dns) if dns.provider == "coredns" => {
            write_helm_chart_config(paths, COREDNS_CHART, &coredns_values(dns))?;
        }
        dns => debug!(provider = ?dns.as_ref().map(|d| &d.provider), "DNS provider not migrated"),
    }

    if rke.monitoring.provider == "metrics-server" {
        write_helm_chart_config(
            paths,
            METRICS_SERVER_CHART,
            &metrics_server_values(&rke.monitoring),
        )?;
    } else {
        debug!(provider = %rke.monitoring.provider, "Monitoring provider not migrated");
    }

    Ok(())
}
