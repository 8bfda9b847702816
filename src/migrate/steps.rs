//! Step dispatch onto the collaborator modules

#[cfg(test)]
use mockall::automock;

use crate::config::{MigrationConfig, TargetPaths};
use crate::etcd::{DatastoreRestorer, EtcdutlRestorer};
use crate::{addons, certs, etcd, export, Result};

use super::{MigrationStep, StepContext};

/// Executes a single migration step
#[cfg_attr(test, automock)]
pub trait MigrationSteps: Send + Sync {
    /// Perform `step` for the node described by `ctx`
    fn execute(&self, step: MigrationStep, ctx: &StepContext) -> Result<()>;
}

/// Writes step output to the local RKE2 data and config directories
pub struct LocalSteps {
    paths: TargetPaths,
    registries_tls: Vec<String>,
    restorer: Box<dyn DatastoreRestorer>,
}

impl LocalSteps {
    /// Steps writing to the paths in `config`, restoring with `etcdutl`
    pub fn from_config(config: &MigrationConfig) -> Self {
        Self::new(
            config.target_paths(),
            config.registries_tls.clone(),
            Box::new(EtcdutlRestorer::default()),
        )
    }

    /// Steps writing under `paths`
    pub fn new(
        paths: TargetPaths,
        registries_tls: Vec<String>,
        restorer: Box<dyn DatastoreRestorer>,
    ) -> Self {
        Self {
            paths,
            registries_tls,
            restorer,
        }
    }
}

impl MigrationSteps for LocalSteps {
    fn execute(&self, step: MigrationStep, ctx: &StepContext) -> Result<()> {
        let state = &ctx.state;
        match step {
            MigrationStep::RecoverCerts => certs::recover_certs(&self.paths, state),
            MigrationStep::ExportConfig => {
                export::export_cluster_config(&self.paths, state, &ctx.identity)?;
                export::configure_private_registries(&self.paths, state, &self.registries_tls)
            }
            MigrationStep::RemoveOldAddons => addons::remove_old_addons(&self.paths),
            MigrationStep::MigrateCni => addons::cni::migrate_cni_config(&self.paths, state),
            MigrationStep::MigrateAddons => addons::migrate_addons_config(&self.paths, state),
            MigrationStep::MigrateUserAddons => {
                addons::user::migrate_user_addons(&self.paths, state)
            }
            MigrationStep::RestoreDatastore => etcd::restore(
                &self.paths,
                state,
                &ctx.identity,
                &ctx.snapshot.backup_path,
                self.restorer.as_ref(),
            ),
            MigrationStep::ConfigureKubeProxy => {
                export::export_kube_proxy_config(&self.paths, state)
            }
        }
    }
}
