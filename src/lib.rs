//! Migration agent - moves an RKE1 node onto RKE2 from an etcd snapshot
//!
//! The agent runs once on every node of an RKE1 cluster. It unpacks the
//! snapshot archive RKE took (optionally fetched from S3 first), decodes the
//! cluster state stored next to the etcd backup, works out which state node
//! it is running on, and then writes whatever RKE2 needs to take that node
//! over: recovered CAs, a config drop-in, HelmChartConfigs for the bundled
//! addons, the restored etcd datastore on etcd nodes, and a kube-proxy
//! kubeconfig on workers.
//!
//! # Modules
//!
//! - [`archive`] - Safe extraction of the snapshot zip
//! - [`snapshot`] - Locating the state document and etcd backup
//! - [`state`] - RKE cluster state model and decoding
//! - [`node`] - Host identity, roles and local node resolution
//! - [`migrate`] - Role-gated step planning and the run orchestrator
//! - [`certs`] - CA and service account key recovery
//! - [`export`] - RKE2 config drop-in, registries and kube-proxy kubeconfig
//! - [`addons`] - Addon removal job and HelmChartConfig translation
//! - [`etcd`] - Restoring the etcd backup into the RKE2 datastore
//! - [`download`] - Snapshot download from S3 compatible storage
//! - [`config`] - Operator supplied parameters and RKE2 target paths
//! - [`error`] - Error types for the agent

#![deny(missing_docs)]

pub mod addons;
pub mod archive;
pub mod certs;
pub mod config;
pub mod download;
pub mod error;
pub mod etcd;
pub mod export;
pub mod migrate;
pub mod node;
pub mod snapshot;
pub mod state;

pub use config::{MigrationConfig, S3Config, TargetPaths};
pub use error::Error;
pub use migrate::{Agent, LocalSteps, MigrationReport};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
