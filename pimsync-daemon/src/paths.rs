use std::path::{Path, PathBuf};
use std::time::Duration;

use pimsync_core::TargetId;

/// Leading-edge window for coalescing `targets.yaml` change events.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

/// Quiet period after the last local change notice before a partial sync.
pub const PARTIAL_SYNC_DELAY: Duration = Duration::from_secs(5);

pub const AUTO_SYNC_FIRST_DELAY: Duration = Duration::from_secs(5);
pub const AUTO_SYNC_PERIOD: Duration = Duration::from_secs(60);

pub const DAEMON_SOCKET: &str = "daemon.sock";
pub const ENTITY_CACHE_FILE: &str = "relations.json";

pub fn pimsync_root(home: &Path) -> PathBuf {
    pimsync_core::config::root_dir_at(home)
}

/// Invite registry and per-target entity caches.
pub fn data_dir(home: &Path) -> PathBuf {
    pimsync_root(home).join("data")
}

pub fn run_dir(home: &Path) -> PathBuf {
    pimsync_root(home).join("run")
}

pub fn socket_path(home: &Path) -> PathBuf {
    pimsync_root(home).join(DAEMON_SOCKET)
}

/// Directory an engine keeps its relation cache for `target` in.
pub fn target_cache_dir(data_dir: &Path, target: TargetId) -> PathBuf {
    data_dir.join(target.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_rooted_under_dot_pimsync() {
        let home = Path::new("/home/alice");
        assert_eq!(data_dir(home), PathBuf::from("/home/alice/.pimsync/data"));
        assert_eq!(
            socket_path(home),
            PathBuf::from("/home/alice/.pimsync/daemon.sock")
        );
        let id = TargetId::new();
        assert!(target_cache_dir(&data_dir(home), id).ends_with(id.to_string()));
    }
}
