//! User addons from `cluster.yml`
//!
//! RKE applies inline `addons` YAML and every `addons_include` entry after
//! the system addons. RKE2 applies anything in its manifests directory, so
//! both are copied there.

use std::path::Path;

use tracing::{info, warn};

use crate::config::{self, TargetPaths};
use crate::state::ClusterState;
use crate::{Error, Result};

/// Manifest holding the inline user addons
pub const USER_ADDONS_MANIFEST: &str = "rke-user-addons.yaml";

const MANIFEST_MODE: u32 = 0o600;

/// Manifest file name for the `index`th include
pub fn include_manifest_name(index: usize) -> String {
    format!("rke-user-addon-{}.yaml", index)
}

fn is_remote(include: &str) -> bool {
    include.starts_with("http://") || include.starts_with("https://")
}

/// Copy user addon manifests into the RKE2 manifests directory.
///
/// Remote includes are not fetched and includes missing on this host are
/// skipped; both are logged.
pub fn migrate_user_addons(paths: &TargetPaths, state: &ClusterState) -> Result<()> {
    let rke = &state.rke_config;
    let manifests = paths.manifests_dir();

    if !rke.addons.trim().is_empty() {
        let path = manifests.join(USER_ADDONS_MANIFEST);
        config::write_file(&path, rke.addons.as_bytes(), MANIFEST_MODE)?;
        info!(path = %path.display(), "Migrated inline user addons");
    }

    for (index, include) in rke.addons_include.iter().enumerate() {
        if is_remote(include) {
            warn!(include = %include, "Skipping remote user addon, apply it to the RKE2 cluster manually");
            continue;
        }
        let source = Path::new(include);
        if !source.is_file() {
            warn!(include = %include, "User addon file not found on this node, skipping");
            continue;
        }

        let contents = std::fs::read(source)
            .map_err(|e| Error::io(format!("failed to read {}", source.display()), e))?;
        let dest = manifests.join(include_manifest_name(index));
        config::write_file(&dest, &contents, MANIFEST_MODE)?;
        info!(include = %include, path = %dest.display(), "Migrated user addon include");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: inline and local include addons land in the manifests dir
    #[test]
    fn story_user_addons_are_copied() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = TargetPaths::new(tmp.path().join("data"), tmp.path().join("etc"));
        let include = tmp.path().join("extra.yaml");
        std::fs::write(&include, "kind: ConfigMap\n").unwrap();

        let mut state = ClusterState::default();
        state.rke_config.addons = "apiVersion: v1\nkind: Namespace\n".to_string();
        state.rke_config.addons_include = vec![
            "https://example.com/addon.yaml".to_string(),
            include.to_string_lossy().into_owned(),
            tmp.path().join("missing.yaml").to_string_lossy().into_owned(),
        ];

        migrate_user_addons(&paths, &state).unwrap();

        let manifests = paths.manifests_dir();
        assert_eq!(
            std::fs::read_to_string(manifests.join(USER_ADDONS_MANIFEST)).unwrap(),
            "apiVersion: v1\nkind: Namespace\n"
        );
        assert!(!manifests.join(include_manifest_name(0)).exists());
        assert_eq!(
            std::fs::read_to_string(manifests.join(include_manifest_name(1))).unwrap(),
            "kind: ConfigMap\n"
        );
        assert!(!manifests.join(include_manifest_name(2)).exists());
    }

    #[test]
    fn test_no_user_addons() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = TargetPaths::new(tmp.path().join("data"), tmp.path().join("etc"));
        migrate_user_addons(&paths, &ClusterState::default()).unwrap();
        assert!(!paths.manifests_dir().exists());
    }
}
