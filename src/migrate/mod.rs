//! Migration orchestration
//!
//! A run moves through these phases, each logged as it completes:
//!
//! ```text
//! Start -> Downloaded? -> Extracted -> Located -> Decoded -> Resolved
//!       -> role-gated steps (see [`plan`]) -> Done
//! ```
//!
//! Preparation ([`Agent::prepare`]) is read-only with respect to RKE2 paths:
//! it only fetches and unpacks the snapshot and works out who this node is.
//! All writes to the RKE2 data and config directories happen in the steps,
//! dispatched through [`MigrationSteps`]. The first failing step aborts the
//! run. Nothing is retried or rolled back; every step overwrites fixed
//! destinations so the run can simply be repeated.
//!
//! Cancellation is checked between phases and before every step. A step
//! that has started runs to completion.

mod steps;

pub use steps::{LocalSteps, MigrationSteps};

#[cfg(test)]
pub use steps::MockMigrationSteps;

use std::fmt;
use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::MigrationConfig;
use crate::download::SnapshotDownloader;
use crate::node::{self, HostIdentity, NodeLister, ResolvedIdentity, Role, RoleSet};
use crate::snapshot::{self, SnapshotFiles};
use crate::state::{self, ClusterState};
use crate::{archive, Error, Result};

/// A role-gated unit of migration work
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MigrationStep {
    /// Write CA and service account material from the state bundle
    RecoverCerts,
    /// Write the RKE2 config drop-in and registries file
    ExportConfig,
    /// Drop a job that deletes the RKE1 addon deployments
    RemoveOldAddons,
    /// Translate the CNI plugin options into a HelmChartConfig
    MigrateCni,
    /// Translate ingress, DNS and metrics addons into HelmChartConfigs
    MigrateAddons,
    /// Copy user addon manifests
    MigrateUserAddons,
    /// Restore the etcd backup into the RKE2 data directory
    RestoreDatastore,
    /// Write a kube-proxy kubeconfig for worker-only nodes
    ConfigureKubeProxy,
}

impl MigrationStep {
    /// Stable kebab-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStep::RecoverCerts => "recover-certs",
            MigrationStep::ExportConfig => "export-config",
            MigrationStep::RemoveOldAddons => "remove-old-addons",
            MigrationStep::MigrateCni => "migrate-cni",
            MigrationStep::MigrateAddons => "migrate-addons",
            MigrationStep::MigrateUserAddons => "migrate-user-addons",
            MigrationStep::RestoreDatastore => "restore-datastore",
            MigrationStep::ConfigureKubeProxy => "configure-kube-proxy",
        }
    }
}

impl fmt::Display for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Steps to run for a node holding `roles`, in execution order
pub fn plan(roles: RoleSet, config: &MigrationConfig) -> Vec<MigrationStep> {
    let mut steps = Vec::new();

    if roles.is_server() {
        steps.extend([
            MigrationStep::RecoverCerts,
            MigrationStep::ExportConfig,
            MigrationStep::RemoveOldAddons,
        ]);
        if !config.disable_cni_migrate {
            steps.push(MigrationStep::MigrateCni);
        }
        if !config.disable_addons_migrate {
            steps.push(MigrationStep::MigrateAddons);
        }
        if !config.disable_user_addons_migrate {
            steps.push(MigrationStep::MigrateUserAddons);
        }
    }

    if roles.contains(Role::Etcd) && !config.disable_etcd_restore {
        steps.push(MigrationStep::RestoreDatastore);
    }

    if roles.is_pure_worker() {
        steps.push(MigrationStep::ConfigureKubeProxy);
    }

    steps
}

/// Everything the steps need, produced by [`Agent::prepare`]
#[derive(Clone, Debug)]
pub struct StepContext {
    /// Directory the snapshot was extracted to
    pub extract_dir: PathBuf,
    /// State document and backup inside `extract_dir`
    pub snapshot: SnapshotFiles,
    /// Decoded current state
    pub state: ClusterState,
    /// This node's entry and roles
    pub identity: ResolvedIdentity,
}

/// Outcome of a completed run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationReport {
    /// Kubernetes name of the migrated node
    pub node_name: String,
    /// Roles the node held in RKE
    pub roles: RoleSet,
    /// Steps that ran, in order
    pub steps: Vec<MigrationStep>,
}

/// Fail with [`Error::Cancelled`] once `cancel` has fired
fn ensure_active(cancel: &CancellationToken, phase: &str) -> Result<()> {
    if cancel.is_cancelled() {
        warn!(phase, "Migration cancelled");
        return Err(Error::Cancelled);
    }
    Ok(())
}

/// Run the planned steps in order, stopping at the first failure or when
/// `cancel` fires
pub fn execute_plan(
    steps: &dyn MigrationSteps,
    plan: &[MigrationStep],
    ctx: &StepContext,
    cancel: &CancellationToken,
) -> Result<()> {
    for &step in plan {
        ensure_active(cancel, step.as_str())?;
        info!(step = %step, "Running migration step");
        steps
            .execute(step, ctx)
            .map_err(|source| Error::step(step, source))?;
        info!(step = %step, "Migration step complete");
    }
    Ok(())
}

/// Drives one migration of the local node
pub struct Agent<'a> {
    config: &'a MigrationConfig,
    steps: Box<dyn MigrationSteps>,
    downloader: Option<Box<dyn SnapshotDownloader>>,
    lister: Option<Box<dyn NodeLister>>,
    host: Option<HostIdentity>,
}

impl<'a> Agent<'a> {
    /// Agent with no cluster access and host identity detected at run time
    pub fn new(config: &'a MigrationConfig, steps: Box<dyn MigrationSteps>) -> Self {
        Self {
            config,
            steps,
            downloader: None,
            lister: None,
            host: None,
        }
    }

    /// Fetch the snapshot from object storage through `downloader`
    pub fn with_downloader(mut self, downloader: Box<dyn SnapshotDownloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    /// Use `lister` for the node annotation fallback
    pub fn with_node_lister(mut self, lister: Box<dyn NodeLister>) -> Self {
        self.lister = Some(lister);
        self
    }

    /// Use a fixed host identity instead of detecting it
    pub fn with_host_identity(mut self, host: HostIdentity) -> Self {
        self.host = Some(host);
        self
    }

    /// Fetch, unpack and decode the snapshot, then resolve the local node
    pub async fn prepare(&self, cancel: &CancellationToken) -> Result<StepContext> {
        let archive_path = self.config.local_snapshot_path();
        ensure_active(cancel, "start")?;

        if let Some(s3) = &self.config.s3 {
            let downloader = self.downloader.as_deref().ok_or_else(|| {
                Error::validation("snapshot source is S3 but no downloader is configured")
            })?;
            let key = s3.object_key(&self.config.snapshot);
            info!(bucket = %s3.bucket, key = %key, "Downloading snapshot");
            let bytes = downloader.download(&key, &archive_path, cancel).await?;
            info!(path = %archive_path.display(), bytes, "Snapshot downloaded");
            ensure_active(cancel, "downloaded")?;
        }

        if let Err(e) = std::fs::metadata(&archive_path) {
            return Err(Error::archive_open(&archive_path, e));
        }

        let extract_dir = snapshot::extraction_dir(&self.config.work_dir);
        info!(dir = %extract_dir.display(), "Extracting snapshot");
        archive::extract(&archive_path, &extract_dir)?;
        ensure_active(cancel, "extracted")?;

        let files = snapshot::locate(&extract_dir)?;
        let state = state::decode(&files.state_path)?;
        ensure_active(cancel, "decoded")?;

        let host = match &self.host {
            Some(host) => host.clone(),
            None => HostIdentity::detect()?,
        };
        let lister = if self.config.disable_node_search {
            None
        } else {
            self.lister.as_deref()
        };
        let identity = node::resolve(
            &state,
            self.config.node_name_override(),
            &host,
            lister,
            cancel,
        )
        .await?;
        ensure_active(cancel, "resolved")?;

        Ok(StepContext {
            extract_dir,
            snapshot: files,
            state,
            identity,
        })
    }

    /// Prepare and run every step planned for this node
    pub async fn run(&self, cancel: &CancellationToken) -> Result<MigrationReport> {
        let ctx = self.prepare(cancel).await?;
        let steps = plan(ctx.identity.roles, self.config);
        info!(
            node = %ctx.identity.node_name(),
            roles = %ctx.identity.roles,
            steps = steps.len(),
            "Starting migration"
        );

        execute_plan(self.steps.as_ref(), &steps, &ctx, cancel)?;

        info!(node = %ctx.identity.node_name(), "Migration complete");
        Ok(MigrationReport {
            node_name: ctx.identity.node_name().to_string(),
            roles: ctx.identity.roles,
            steps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::Path;

    use mockall::predicate::eq;
    use mockall::Sequence;

    use crate::download::MockSnapshotDownloader;
    use crate::node::MatchSource;
    use crate::state::NodeSpec;

    const STATE: &str = r#"{"currentState":{"rkeConfig":{"nodes":[
        {"address":"10.0.0.5","hostnameOverride":"node-a","role":["etcd","controlplane"]},
        {"address":"10.0.0.6","hostnameOverride":"node-b","role":["worker"]}
    ]}}}"#;

    fn write_snapshot(path: &Path) {
        let file = std::fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        zip.start_file("backup/cluster.rkestate", options).unwrap();
        zip.write_all(STATE.as_bytes()).unwrap();
        zip.start_file("backup/snapshot.db", options).unwrap();
        zip.write_all(b"etcd-backup").unwrap();
        zip.finish().unwrap();
    }

    fn roles(tags: &[&str]) -> RoleSet {
        RoleSet::from_tags(tags)
    }

    fn context(tags: &[&str]) -> StepContext {
        let node = NodeSpec {
            address: "10.0.0.5".to_string(),
            role: tags.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        };
        StepContext {
            extract_dir: PathBuf::from("/tmp/snapshot-1"),
            snapshot: SnapshotFiles {
                state_path: PathBuf::from("/tmp/snapshot-1/cluster.rkestate"),
                backup_path: PathBuf::from("/tmp/snapshot-1/snapshot.db"),
            },
            state: ClusterState::default(),
            identity: ResolvedIdentity {
                roles: RoleSet::from_tags(&node.role),
                node,
                host: HostIdentity::new("node-a", "10.0.0.5"),
                matched_by: MatchSource::LocalIdentity,
            },
        }
    }

    #[test]
    fn test_step_names() {
        assert_eq!(MigrationStep::RecoverCerts.to_string(), "recover-certs");
        assert_eq!(
            MigrationStep::ConfigureKubeProxy.to_string(),
            "configure-kube-proxy"
        );
    }

    #[test]
    fn test_worker_only_plans_kube_proxy() {
        let config = MigrationConfig::new("snap.zip");
        assert_eq!(
            plan(roles(&["worker"]), &config),
            vec![MigrationStep::ConfigureKubeProxy]
        );
    }

    #[test]
    fn test_etcd_controlplane_plans_full_server_sequence() {
        let config = MigrationConfig::new("snap.zip");
        assert_eq!(
            plan(roles(&["etcd", "controlplane", "worker"]), &config),
            vec![
                MigrationStep::RecoverCerts,
                MigrationStep::ExportConfig,
                MigrationStep::RemoveOldAddons,
                MigrationStep::MigrateCni,
                MigrationStep::MigrateAddons,
                MigrationStep::MigrateUserAddons,
                MigrationStep::RestoreDatastore,
            ]
        );
    }

    #[test]
    fn test_controlplane_only_skips_restore() {
        let config = MigrationConfig::new("snap.zip");
        let steps = plan(roles(&["controlplane"]), &config);
        assert!(!steps.contains(&MigrationStep::RestoreDatastore));
        assert!(!steps.contains(&MigrationStep::ConfigureKubeProxy));
        assert_eq!(steps.len(), 6);
    }

    #[test]
    fn test_disable_flags_remove_their_steps() {
        let server = roles(&["etcd", "controlplane"]);

        let mut config = MigrationConfig::new("snap.zip");
        config.disable_cni_migrate = true;
        assert!(!plan(server, &config).contains(&MigrationStep::MigrateCni));

        let mut config = MigrationConfig::new("snap.zip");
        config.disable_addons_migrate = true;
        assert!(!plan(server, &config).contains(&MigrationStep::MigrateAddons));

        let mut config = MigrationConfig::new("snap.zip");
        config.disable_user_addons_migrate = true;
        assert!(!plan(server, &config).contains(&MigrationStep::MigrateUserAddons));

        let mut config = MigrationConfig::new("snap.zip");
        config.disable_etcd_restore = true;
        let steps = plan(server, &config);
        assert!(!steps.contains(&MigrationStep::RestoreDatastore));
        assert_eq!(steps.first(), Some(&MigrationStep::RecoverCerts));
    }

    #[test]
    fn test_no_roles_plans_nothing() {
        let config = MigrationConfig::new("snap.zip");
        assert!(plan(RoleSet::empty(), &config).is_empty());
    }

    /// Story: a failing step aborts the run and names itself in the error
    ///
    /// Steps after the failure must not run, since they build on the output
    /// of earlier ones.
    #[test]
    fn story_first_failing_step_aborts_sequence() {
        let ctx = context(&["etcd", "controlplane"]);
        let steps = plan(ctx.identity.roles, &MigrationConfig::new("snap.zip"));

        let mut seq = Sequence::new();
        let mut mock = MockMigrationSteps::new();
        mock.expect_execute()
            .with(eq(MigrationStep::RecoverCerts), mockall::predicate::always())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        mock.expect_execute()
            .with(eq(MigrationStep::ExportConfig), mockall::predicate::always())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(Error::validation("bad registry spec")));

        let err = execute_plan(&mock, &steps, &ctx, &CancellationToken::new()).unwrap_err();
        match err {
            Error::Step { step, source } => {
                assert_eq!(step, MigrationStep::ExportConfig);
                assert!(matches!(*source, Error::Validation(_)));
            }
            other => panic!("expected Step error, got {other:?}"),
        }
    }

    /// Story: a local snapshot is unpacked and the node found by its IP
    #[tokio::test]
    async fn story_prepare_resolves_local_node_from_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("snap.zip");
        write_snapshot(&archive);

        let mut config = MigrationConfig::new(archive.to_string_lossy());
        config.work_dir = tmp.path().join("work");

        let agent = Agent::new(&config, Box::new(MockMigrationSteps::new()))
            .with_host_identity(HostIdentity::new("some-host", "10.0.0.6"));
        let ctx = agent.prepare(&CancellationToken::new()).await.unwrap();

        assert!(ctx.extract_dir.starts_with(tmp.path().join("work")));
        assert!(ctx.snapshot.backup_path.ends_with("backup/snapshot.db"));
        assert_eq!(ctx.identity.node_name(), "node-b");
        assert!(ctx.identity.roles.is_pure_worker());
    }

    #[tokio::test]
    async fn test_run_executes_planned_steps() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("snap.zip");
        write_snapshot(&archive);

        let mut config = MigrationConfig::new(archive.to_string_lossy());
        config.work_dir = tmp.path().join("work");
        config.disable_etcd_restore = true;

        let mut mock = MockMigrationSteps::new();
        mock.expect_execute().times(6).returning(|_, _| Ok(()));

        let agent = Agent::new(&config, Box::new(mock))
            .with_host_identity(HostIdentity::new("NODE-A", "192.168.0.1"));
        let report = agent.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.node_name, "node-a");
        assert_eq!(report.steps.len(), 6);
        assert_eq!(report.steps.last(), Some(&MigrationStep::MigrateUserAddons));
    }

    #[tokio::test]
    async fn test_missing_archive_fails_before_extraction() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = MigrationConfig::new(tmp.path().join("missing.zip").to_string_lossy());
        config.work_dir = tmp.path().join("work");

        let agent = Agent::new(&config, Box::new(MockMigrationSteps::new()))
            .with_host_identity(HostIdentity::new("node-a", "10.0.0.5"));
        let err = agent.prepare(&CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, Error::ArchiveOpen { .. }));
        assert!(!tmp.path().join("work").exists());
    }

    #[tokio::test]
    async fn test_download_failure_aborts_before_extraction() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = MigrationConfig::new("snap.zip");
        config.data_dir = tmp.path().join("rke2");
        config.work_dir = tmp.path().join("work");
        config.s3 = Some(crate::config::S3Config {
            endpoint: crate::config::DEFAULT_S3_ENDPOINT.to_string(),
            endpoint_ca: None,
            skip_ssl_verify: false,
            access_key: None,
            secret_key: None,
            bucket: "backups".to_string(),
            region: crate::config::DEFAULT_S3_REGION.to_string(),
            folder: Some("rke".to_string()),
            timeout: crate::config::DEFAULT_S3_TIMEOUT,
        });

        let mut downloader = MockSnapshotDownloader::new();
        downloader
            .expect_download()
            .withf(|key, dest, _| key == "rke/snap.zip" && dest.ends_with("db/snapshots/snap.zip"))
            .times(1)
            .returning(|_, _, _| Err(Error::download("403 Forbidden")));

        let agent = Agent::new(&config, Box::new(MockMigrationSteps::new()))
            .with_downloader(Box::new(downloader))
            .with_host_identity(HostIdentity::new("node-a", "10.0.0.5"));
        let err = agent.prepare(&CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, Error::Download(_)));
        assert!(!tmp.path().join("work").exists());
    }

    #[test]
    fn test_cancel_between_steps_stops_the_plan() {
        let ctx = context(&["etcd", "controlplane"]);
        let steps = plan(ctx.identity.roles, &MigrationConfig::new("snap.zip"));
        let cancel = CancellationToken::new();

        let mut mock = MockMigrationSteps::new();
        let token = cancel.clone();
        mock.expect_execute()
            .with(eq(MigrationStep::RecoverCerts), mockall::predicate::always())
            .times(1)
            .returning(move |_, _| {
                token.cancel();
                Ok(())
            });

        let err = execute_plan(&mock, &steps, &ctx, &cancel).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    /// Story: a run cancelled before it starts touches nothing
    ///
    /// No snapshot is extracted and no step runs, so neither the work dir nor
    /// any RKE2 path is created.
    #[tokio::test]
    async fn story_cancelled_run_writes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("snap.zip");
        write_snapshot(&archive);

        let mut config = MigrationConfig::new(archive.to_string_lossy());
        config.data_dir = tmp.path().join("rke2");
        config.config_dir = tmp.path().join("etc");
        config.work_dir = tmp.path().join("work");

        let mut mock = MockMigrationSteps::new();
        mock.expect_execute().times(0);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let agent = Agent::new(&config, Box::new(mock))
            .with_host_identity(HostIdentity::new("node-a", "10.0.0.5"));
        let err = agent.run(&cancel).await.unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert!(!tmp.path().join("work").exists());
        assert!(!tmp.path().join("rke2").exists());
        assert!(!tmp.path().join("etc").exists());
    }
}
