//! RKE cluster state document model
//!
//! Only the parts of the RKE full-state document the migration reads are
//! modelled. Everything else in the document is ignored on decode.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvVar, Toleration, Volume, VolumeMount};
use serde::{Deserialize, Serialize};

/// Top level of a `.rkestate` file
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FullState {
    /// State RKE was asked to converge to
    #[serde(default)]
    pub desired_state: ClusterState,
    /// State RKE last applied
    #[serde(default)]
    pub current_state: ClusterState,
}

/// One snapshot of cluster configuration and certificate material
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterState {
    /// Cluster configuration (`cluster.yml` equivalent)
    #[serde(default)]
    pub rke_config: RkeConfig,
    /// Certificates keyed by RKE certificate name
    #[serde(default)]
    pub certificates_bundle: BTreeMap<String, CertificatePki>,
}

impl ClusterState {
    /// Nodes in the order the state lists them
    pub fn nodes(&self) -> &[NodeSpec] {
        &self.rke_config.nodes
    }

    /// Certificate by RKE name
    pub fn certificate(&self, name: &str) -> Option<&CertificatePki> {
        self.certificates_bundle.get(name)
    }
}

/// Certificate and key material for one RKE certificate
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CertificatePki {
    /// PEM encoded certificate
    #[serde(default, rename = "certificatePEM")]
    pub certificate_pem: String,
    /// PEM encoded private key
    #[serde(default, rename = "keyPEM")]
    pub key_pem: String,
    /// Kubeconfig generated for this certificate, if any
    #[serde(default)]
    pub config: String,
    /// Certificate name
    #[serde(default)]
    pub name: String,
    /// Common name
    #[serde(default)]
    pub common_name: String,
    /// Certificate path on RKE1 nodes
    #[serde(default)]
    pub path: String,
    /// Key path on RKE1 nodes
    #[serde(default)]
    pub key_path: String,
    /// Kubeconfig path on RKE1 nodes
    #[serde(default)]
    pub config_path: String,
}

/// RKE cluster configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RkeConfig {
    /// Cluster members
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    /// Kubernetes component configuration
    #[serde(default)]
    pub services: Services,
    /// CNI configuration
    #[serde(default)]
    pub network: NetworkConfig,
    /// Ingress controller configuration
    #[serde(default)]
    pub ingress: IngressConfig,
    /// Cluster DNS configuration
    #[serde(default)]
    pub dns: Option<DnsConfig>,
    /// Metrics provider configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    /// Private registries used for system images
    #[serde(default)]
    pub private_registries: Vec<PrivateRegistry>,
    /// Cloud provider configuration
    #[serde(default)]
    pub cloud_provider: CloudProvider,
    /// Inline user addon YAML
    #[serde(default)]
    pub addons: String,
    /// User addon files or URLs
    #[serde(default)]
    pub addons_include: Vec<String>,
}

/// One node in the RKE cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    /// Name RKE registered the node under
    #[serde(default)]
    pub node_name: String,
    /// Public address used to reach the node
    #[serde(default)]
    pub address: String,
    /// Address used for intra-cluster traffic
    #[serde(default)]
    pub internal_address: String,
    /// Kubernetes node name override
    #[serde(default)]
    pub hostname_override: String,
    /// Role tags as written by RKE (`controlplane`, `etcd`, `worker`)
    #[serde(default)]
    pub role: Vec<String>,
}

impl NodeSpec {
    /// Name the node is known by in Kubernetes
    pub fn kubernetes_name(&self) -> &str {
        if !self.hostname_override.is_empty() {
            &self.hostname_override
        } else {
            &self.address
        }
    }

    /// True if `name` equals the address, internal address or hostname override
    pub fn is_named(&self, name: &str) -> bool {
        !name.is_empty()
            && (self.address == name
                || self.internal_address == name
                || self.hostname_override == name)
    }
}

/// Kubernetes component configuration
///
/// State files use the JSON names; the `cluster.yml` spellings are accepted too.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Services {
    /// kube-apiserver
    #[serde(default, alias = "kube-api")]
    pub kube_api: KubeApiService,
    /// kube-controller-manager
    #[serde(default, alias = "kube-controller")]
    pub kube_controller: KubeControllerService,
    /// kube-scheduler
    #[serde(default)]
    pub scheduler: BaseService,
    /// kubelet
    #[serde(default)]
    pub kubelet: KubeletService,
}

/// Extra arguments shared by every component
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BaseService {
    /// Additional flags, empty value means a bare flag
    #[serde(default)]
    pub extra_args: BTreeMap<String, String>,
}

/// kube-apiserver configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KubeApiService {
    /// Additional flags
    #[serde(default)]
    pub extra_args: BTreeMap<String, String>,
    /// Service CIDR
    #[serde(default)]
    pub service_cluster_ip_range: String,
    /// NodePort range
    #[serde(default)]
    pub service_node_port_range: String,
}

/// kube-controller-manager configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KubeControllerService {
    /// Additional flags
    #[serde(default)]
    pub extra_args: BTreeMap<String, String>,
    /// Pod CIDR
    #[serde(default)]
    pub cluster_cidr: String,
}

/// kubelet configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KubeletService {
    /// Additional flags
    #[serde(default)]
    pub extra_args: BTreeMap<String, String>,
    /// Cluster DNS domain
    #[serde(default)]
    pub cluster_domain: String,
    /// Cluster DNS service IP
    #[serde(default)]
    pub cluster_dns_server: String,
}

/// CNI plugin configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    /// Plugin name (`canal`, `calico`, `flannel`, `weave`, `none`)
    #[serde(default)]
    pub plugin: String,
    /// Plugin specific options
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    /// Interface MTU, 0 for the plugin default
    #[serde(default)]
    pub mtu: i32,
    /// Node selector for plugin control plane components
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
}

/// Ingress controller configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressConfig {
    /// Provider name, `nginx` or `none`
    #[serde(default)]
    pub provider: String,
    /// nginx ConfigMap options
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    /// Node selector for the controller
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    /// Additional controller flags
    #[serde(default)]
    pub extra_args: BTreeMap<String, String>,
    /// Controller DNS policy
    #[serde(default)]
    pub dns_policy: String,
    /// Additional controller environment
    #[serde(default)]
    pub extra_envs: Vec<EnvVar>,
    /// Additional controller volumes
    #[serde(default)]
    pub extra_volumes: Vec<Volume>,
    /// Additional controller volume mounts
    #[serde(default)]
    pub extra_volume_mounts: Vec<VolumeMount>,
    /// Host HTTP port
    #[serde(default)]
    pub http_port: i32,
    /// Host HTTPS port
    #[serde(default)]
    pub https_port: i32,
    /// Controller tolerations
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
    /// Whether the default backend is deployed
    #[serde(default)]
    pub default_backend: Option<bool>,
    /// Priority class of the default backend
    #[serde(default)]
    pub default_http_backend_priority_class_name: String,
    /// Priority class of the controller
    #[serde(default)]
    pub nginx_ingress_controller_priority_class_name: String,
    /// DaemonSet update strategy
    #[serde(default)]
    pub update_strategy: Option<DaemonSetUpdateStrategy>,
}

/// RKE's DaemonSet update strategy shape
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DaemonSetUpdateStrategy {
    /// `RollingUpdate` or `OnDelete`
    #[serde(default)]
    pub strategy: Option<String>,
    /// Rolling update parameters
    #[serde(default)]
    pub rolling_update: Option<k8s_openapi::api::apps::v1::RollingUpdateDaemonSet>,
}

/// Cluster DNS configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DnsConfig {
    /// Provider name, `coredns`, `kube-dns` or `none`
    #[serde(default)]
    pub provider: String,
    /// Node selector for the DNS deployment
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    /// DNS deployment tolerations
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
    /// NodeLocal DNSCache configuration
    #[serde(default)]
    pub nodelocal: Option<NodeLocalDns>,
}

/// NodeLocal DNSCache configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeLocalDns {
    /// Link-local listen address, disabled when empty
    #[serde(default)]
    pub ip_address: String,
}

/// Metrics provider configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringConfig {
    /// Provider name, `metrics-server` or `none`
    #[serde(default)]
    pub provider: String,
    /// Node selector for metrics-server
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    /// metrics-server tolerations
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
    /// metrics-server replica count
    #[serde(default)]
    pub replicas: Option<i32>,
    /// Priority class of metrics-server
    #[serde(default)]
    pub metrics_server_priority_class_name: String,
}

/// Private registry credentials
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PrivateRegistry {
    /// Registry host, `docker.io` when empty
    #[serde(default)]
    pub url: String,
    /// Username
    #[serde(default)]
    pub user: String,
    /// Password
    #[serde(default)]
    pub password: String,
    /// Registry used for system images
    #[serde(default)]
    pub is_default: bool,
}

/// Cloud provider configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct CloudProvider {
    /// Provider name, unset when no cloud provider is configured
    #[serde(default)]
    pub name: String,
}
