//! Working out which node of the RKE cluster this host is
//!
//! Matching runs in strict tiers and the first hit wins:
//!
//! 1. An operator supplied node name, compared with each node's address,
//!    internal address and hostname override.
//! 2. The local IP against address and internal address, or the local
//!    hostname against the hostname override (case-insensitive).
//! 3. The live cluster: node annotations that record a public IP (flannel,
//!    then calico) are searched for the local IP, and the matching API node
//!    is mapped back to the state by name.
//!
//! Tier 3 exists for hosts whose public address is not bound to any local
//! interface, e.g. cloud instances behind NAT.

mod host;
mod role;

pub use host::{parse_default_route_interface, HostIdentity};
pub use role::{Role, RoleSet};

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::state::{ClusterState, NodeSpec};
use crate::{Error, Result};

/// Flannel annotation holding the node's public IP
pub const FLANNEL_PUBLIC_IP_ANNOTATION: &str = "flannel.alpha.coreos.com/public-ip";

/// Calico annotation holding the node's IPv4 address and prefix
pub const CALICO_IP_ANNOTATION: &str = "projectcalico.org/IPv4Address";

/// Annotations searched for the local IP, in order
pub const IP_ANNOTATIONS: [&str; 2] = [FLANNEL_PUBLIC_IP_ANNOTATION, CALICO_IP_ANNOTATION];

/// Upper bound on the node list call
pub const NODE_LIST_TIMEOUT: Duration = Duration::from_secs(30);

/// How the local node was found in the state
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MatchSource {
    /// Operator supplied node name
    Override,
    /// Local IP or hostname
    LocalIdentity,
    /// Live node annotation
    Annotation {
        /// Annotation that held the local IP
        key: String,
    },
}

/// The state node this host was resolved to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedIdentity {
    /// Matching node entry
    pub node: NodeSpec,
    /// Roles parsed from the node entry
    pub roles: RoleSet,
    /// Host identity used during matching
    pub host: HostIdentity,
    /// Tier that produced the match
    pub matched_by: MatchSource,
}

impl ResolvedIdentity {
    /// Kubernetes node name RKE2 should register under
    pub fn node_name(&self) -> &str {
        self.node.kubernetes_name()
    }

    /// Address etcd peers reach this node on
    pub fn peer_ip(&self) -> &str {
        if !self.node.internal_address.is_empty() {
            &self.node.internal_address
        } else if !self.node.address.is_empty() {
            &self.node.address
        } else {
            &self.host.ip
        }
    }
}

/// Source of live cluster nodes for the annotation fallback
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeLister: Send + Sync {
    /// List all nodes in the cluster
    async fn list_nodes(&self) -> Result<Vec<Node>>;
}

/// [`NodeLister`] backed by the Kubernetes API
pub struct KubeNodeLister {
    client: Client,
}

impl KubeNodeLister {
    /// Create a lister over the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeLister for KubeNodeLister {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await?;
        Ok(nodes.items)
    }
}

/// Resolve the local node in `state`.
///
/// `lister` is `None` when there is no API connection or node search is
/// disabled, in which case tier 3 is skipped.
pub async fn resolve(
    state: &ClusterState,
    override_name: Option<&str>,
    host: &HostIdentity,
    lister: Option<&dyn NodeLister>,
    cancel: &CancellationToken,
) -> Result<ResolvedIdentity> {
    let nodes = state.nodes();
    let override_name = override_name.filter(|n| !n.is_empty());

    if let Some(name) = override_name {
        info!(node_name = %name, "Searching RKE state for node name");
        if let Some(node) = nodes.iter().find(|n| n.is_named(name)) {
            return Ok(resolved(node, host, MatchSource::Override));
        }
        debug!(node_name = %name, "Node name not in state, falling back to host identity");
    }

    info!(hostname = %host.hostname, ip = %host.ip, "Searching RKE state for local host");
    if let Some(node) = nodes.iter().find(|n| matches_host(n, host)) {
        return Ok(resolved(node, host, MatchSource::LocalIdentity));
    }

    if let Some(lister) = lister {
        if !host.ip.is_empty() {
            info!(hostname = %host.hostname, "Searching Kubernetes node annotations");
            let api_nodes = list_with_deadline(lister, cancel).await?;
            if let Some((api_name, key)) = find_annotated(&api_nodes, &host.ip) {
                debug!(node = %api_name, annotation = %key, "Local IP found in node annotation");
                // An annotated node with no state entry is a miss, not a reason
                // to keep scanning
                return match nodes.iter().find(|n| n.is_named(&api_name)) {
                    Some(node) => Ok(resolved(
                        node,
                        host,
                        MatchSource::Annotation {
                            key: key.to_string(),
                        },
                    )),
                    None => Err(not_found(host, override_name)),
                };
            }
        }
    }

    Err(not_found(host, override_name))
}

fn matches_host(node: &NodeSpec, host: &HostIdentity) -> bool {
    let ip_match =
        !host.ip.is_empty() && (node.address == host.ip || node.internal_address == host.ip);
    let name_match = !host.hostname.is_empty()
        && !node.hostname_override.is_empty()
        && node.hostname_override.eq_ignore_ascii_case(&host.hostname);
    ip_match || name_match
}

async fn list_with_deadline(
    lister: &dyn NodeLister,
    cancel: &CancellationToken,
) -> Result<Vec<Node>> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        listed = tokio::time::timeout(NODE_LIST_TIMEOUT, lister.list_nodes()) => {
            listed.map_err(|_| Error::timeout("node list", NODE_LIST_TIMEOUT))?
        }
    }
}

/// First API node whose IP annotation contains `ip`, with the annotation key
fn find_annotated(nodes: &[Node], ip: &str) -> Option<(String, &'static str)> {
    nodes.iter().find_map(|node| {
        let annotations = node.metadata.annotations.as_ref()?;
        let key = IP_ANNOTATIONS
            .into_iter()
            .find(|key| annotations.get(*key).is_some_and(|v| v.contains(ip)))?;
        Some((node.metadata.name.clone().unwrap_or_default(), key))
    })
}

fn resolved(node: &NodeSpec, host: &HostIdentity, matched_by: MatchSource) -> ResolvedIdentity {
    let roles = RoleSet::from_tags(&node.role);
    info!(
        node = %node.kubernetes_name(),
        roles = %roles,
        matched_by = ?matched_by,
        "Node found in RKE state"
    );
    ResolvedIdentity {
        node: node.clone(),
        roles,
        host: host.clone(),
        matched_by,
    }
}

fn not_found(host: &HostIdentity, override_name: Option<&str>) -> Error {
    Error::NodeNotFound {
        hostname: host.hostname.clone(),
        ip: host.ip.clone(),
        override_name: override_name.map(str::to_string),
    }
}
