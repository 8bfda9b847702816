//! CNI plugin options to rke2-canal / rke2-calico chart values

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::info;

use crate::config::TargetPaths;
use crate::state::{ClusterState, NetworkConfig};
use crate::Result;

use super::write_helm_chart_config;

const CANAL: &str = "canal";
const CALICO: &str = "calico";

const CANAL_FLANNEL_BACKEND_TYPE: &str = "canal_flannel_backend_type";
const CANAL_FLEX_VOLUME_PLUGIN_DIR: &str = "canal_flex_volume_plugin_dir";
const CANAL_FLANNEL_IFACE: &str = "canal_iface";
const CALICO_FLEX_VOLUME_PLUGIN_DIR: &str = "calico_flex_volume_plugin_dir";

/// rke2-canal values
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CanalValues {
    /// Calico half of canal
    pub calico: CanalCalicoValues,
    /// Flannel half of canal
    pub flannel: CanalFlannelValues,
}

/// rke2-canal `calico` values
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CanalCalicoValues {
    /// Veth MTU
    #[serde(rename = "vethuMTU", skip_serializing_if = "Option::is_none")]
    pub vethu_mtu: Option<i32>,
    /// Flexvolume plugin directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flex_volume_plugin_dir: Option<String>,
}

/// rke2-canal `flannel` values
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CanalFlannelValues {
    /// Flannel backend type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    /// Interface flannel binds to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iface: Option<String>,
}

/// rke2-calico values
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CalicoValues {
    /// Tigera operator Installation spec
    pub installation: CalicoInstallation,
}

/// Subset of the Tigera operator Installation spec
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalicoInstallation {
    /// Network settings; only the MTU is carried over
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub calico_network: BTreeMap<String, i32>,
    /// Flexvolume plugin directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flex_volume_path: Option<String>,
    /// Node selector for the calico control plane
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub control_plane_node_selector: BTreeMap<String, String>,
}

fn option(network: &NetworkConfig, key: &str) -> Option<String> {
    network.options.get(key).filter(|v| !v.is_empty()).cloned()
}

fn mtu(network: &NetworkConfig) -> Option<i32> {
    (network.mtu > 0).then_some(network.mtu)
}

/// rke2-canal values for an RKE canal network
pub fn canal_values(network: &NetworkConfig) -> CanalValues {
    CanalValues {
        calico: CanalCalicoValues {
            vethu_mtu: mtu(network),
            flex_volume_plugin_dir: option(network, CANAL_FLEX_VOLUME_PLUGIN_DIR),
        },
        flannel: CanalFlannelValues {
            backend: option(network, CANAL_FLANNEL_BACKEND_TYPE),
            iface: option(network, CANAL_FLANNEL_IFACE),
        },
    }
}

/// rke2-calico values for an RKE calico network
pub fn calico_values(network: &NetworkConfig) -> CalicoValues {
    CalicoValues {
        installation: CalicoInstallation {
            calico_network: mtu(network)
                .map(|m| BTreeMap::from([("mtu".to_string(), m)]))
                .unwrap_or_default(),
            flex_volume_path: option(network, CALICO_FLEX_VOLUME_PLUGIN_DIR),
            control_plane_node_selector: network.node_selector.clone(),
        },
    }
}

/// Write `rke2-<plugin>-config.yaml` for canal and calico networks.
///
/// Other plugins have no RKE2 chart equivalent and are skipped.
pub fn migrate_cni_config(paths: &TargetPaths, state: &ClusterState) -> Result<()> {
    let network = &state.rke_config.network;
    let chart = format!("rke2-{}", network.plugin);

    match network.plugin.as_str() {
        CANAL => {
            info!("Canal CNI plugin is used by RKE1, migrating config to RKE2");
            write_helm_chart_config(paths, &chart, &canal_values(network))
        }
        CALICO => {
            info!("Calico CNI plugin is used by RKE1, migrating config to RKE2");
            write_helm_chart_config(paths, &chart, &calico_values(network))
        }
        "" => Ok(()),
        other => {
            info!(plugin = %other, "Network plugin has no RKE2 chart, skipping");
            Ok(())
        }
    }
}
