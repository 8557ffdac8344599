//! Per-user target configuration store.
//!
//! # Storage layout
//!
//! ```text
//! ~/.pimsync/
//!   targets.yaml   (mode 0600, every user's target list)
//! ```
//!
//! # API pattern
//!
//! Every I/O function has two forms:
//! - `fn_at(home: &Path, …)`: explicit home; used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`
//!
//! Tests must NEVER call the no-arg wrappers; always use `_at`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{io_err, ConfigError};
use crate::types::{FolderRef, TargetConfig, TargetId};

pub const CONFIG_FILE: &str = "targets.yaml";
pub const CONFIG_VERSION: u32 = 1;

/// Targets configured by one signed-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTargets {
    pub user: String,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

/// Root of `targets.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub version: u32,
    /// When false the runtime never starts automatic passes; manual passes still run.
    #[serde(default = "default_auto_sync")]
    pub auto_sync: bool,
    #[serde(default)]
    pub users: Vec<UserTargets>,
}

fn default_auto_sync() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            auto_sync: true,
            users: Vec::new(),
        }
    }
}

impl SyncConfig {
    /// Target list of `user`. User names compare case-insensitively.
    pub fn targets_for(&self, user: &str) -> &[TargetConfig] {
        self.users
            .iter()
            .find(|u| u.user.eq_ignore_ascii_case(user))
            .map(|u| u.targets.as_slice())
            .unwrap_or(&[])
    }

    /// Replace the whole target list of `user`.
    pub fn set_targets(
        &mut self,
        user: &str,
        targets: Vec<TargetConfig>,
    ) -> Result<(), ConfigError> {
        if user.is_empty() {
            return Err(ConfigError::EmptyUser);
        }
        match self
            .users
            .iter_mut()
            .find(|u| u.user.eq_ignore_ascii_case(user))
        {
            Some(entry) => entry.targets = targets,
            None => self.users.push(UserTargets {
                user: user.to_string(),
                targets,
            }),
        }
        Ok(())
    }

    pub fn find_by_id(&self, user: &str, id: TargetId) -> Option<&TargetConfig> {
        self.targets_for(user).iter().find(|t| t.id == id)
    }

    /// Lookup by remote collection address, ignoring ASCII case.
    pub fn find_by_url(&self, user: &str, url: &str) -> Option<&TargetConfig> {
        self.targets_for(user)
            .iter()
            .find(|t| t.url.eq_ignore_ascii_case(url))
    }

    /// Whether some *other* user already binds a target to `folder`.
    pub fn is_folder_in_use_by_other_users(&self, user: &str, folder: &FolderRef) -> bool {
        self.users
            .iter()
            .filter(|u| !u.user.eq_ignore_ascii_case(user))
            .flat_map(|u| u.targets.iter())
            .any(|t| t.folder.as_ref() == Some(folder))
    }
}

// ---------------------------------------------------------------------------
// 1. Paths
// ---------------------------------------------------------------------------

/// `<home>/.pimsync/`
pub fn root_dir_at(home: &Path) -> PathBuf {
    home.join(".pimsync")
}

/// `<home>/.pimsync/targets.yaml`. Pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    root_dir_at(home).join(CONFIG_FILE)
}

// ---------------------------------------------------------------------------
// 2. Load
// ---------------------------------------------------------------------------

/// Load `targets.yaml`. A missing file yields an empty default config;
/// malformed YAML yields `ConfigError::Parse` with the file path.
pub fn load_at(home: &Path) -> Result<SyncConfig, ConfigError> {
    let path = config_path_at(home);
    if !path.exists() {
        return Ok(SyncConfig::default());
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse { path, source: e })
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<SyncConfig, ConfigError> {
    load_at(&home()?)
}

// ---------------------------------------------------------------------------
// 3. Save (atomic)
// ---------------------------------------------------------------------------

/// Atomically save `targets.yaml`.
///
/// Write flow: serialize → `targets.yaml.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_at(home: &Path, config: &SyncConfig) -> Result<(), ConfigError> {
    let dir = root_dir_at(home);
    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        set_dir_permissions(&dir)?;
    }
    let path = config_path_at(home);
    let tmp_path = path.with_file_name(format!("{CONFIG_FILE}.tmp"));

    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(&tmp_path, yaml).map_err(|e| io_err(&tmp_path, e))?;
    set_file_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, &path).map_err(|e| io_err(&path, e))?;
    Ok(())
}

/// `save_at` convenience wrapper.
pub fn save(config: &SyncConfig) -> Result<(), ConfigError> {
    save_at(&home()?, config)
}

/// Load, replace `user`'s targets, save.
pub fn store_user_targets_at(
    home: &Path,
    user: &str,
    targets: Vec<TargetConfig>,
) -> Result<SyncConfig, ConfigError> {
    let mut config = load_at(home)?;
    config.set_targets(user, targets)?;
    save_at(home, &config)?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_home() -> TempDir {
        TempDir::new().expect("tempdir")
    }

    fn target(url: &str) -> TargetConfig {
        TargetConfig::new(url)
    }

    #[test]
    fn config_path_is_correct() {
        let home = make_home();
        assert!(config_path_at(home.path()).ends_with(".pimsync/targets.yaml"));
    }

    #[test]
    fn missing_file_loads_empty_default() {
        let home = make_home();
        let config = load_at(home.path()).expect("load");
        assert_eq!(config, SyncConfig::default());
        assert!(config.auto_sync);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let home = make_home();
        let mut config = SyncConfig::default();
        config
            .set_targets("alice@example.org", vec![target("https://dav/a/")])
            .expect("set");
        save_at(home.path(), &config).expect("save");

        let loaded = load_at(home.path()).expect("load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn atomic_write_cleans_up_tmp() {
        let home = make_home();
        save_at(home.path(), &SyncConfig::default()).expect("save");
        let tmp = config_path_at(home.path()).with_file_name("targets.yaml.tmp");
        assert!(!tmp.exists(), ".tmp must be gone after successful save");
    }

    #[test]
    fn root_dir_created_with_perms() {
        let home = make_home();
        save_at(home.path(), &SyncConfig::default()).expect("save");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(root_dir_at(home.path()))
                .unwrap()
                .permissions()
                .mode()
                & 0o777;
            assert_eq!(mode, 0o700);
        }
    }

    #[test]
    fn set_targets_rejects_empty_user() {
        let mut config = SyncConfig::default();
        let err = config.set_targets("", vec![]).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyUser));
    }

    #[test]
    fn set_targets_replaces_existing_user_case_insensitively() {
        let mut config = SyncConfig::default();
        config
            .set_targets("Alice@Example.org", vec![target("https://dav/a/")])
            .unwrap();
        config
            .set_targets("alice@example.org", vec![target("https://dav/b/")])
            .unwrap();
        assert_eq!(config.users.len(), 1);
        assert_eq!(config.targets_for("ALICE@example.org")[0].url, "https://dav/b/");
    }

    #[test]
    fn store_user_targets_persists() {
        let home = make_home();
        let t = target("https://dav/a/");
        store_user_targets_at(home.path(), "alice", vec![t.clone()]).expect("store");
        let loaded = load_at(home.path()).expect("load");
        assert_eq!(loaded.find_by_id("alice", t.id), Some(&t));
    }
}
