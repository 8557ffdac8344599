//! Invite registry: lifecycle facts about meeting invites.
//!
//! Persists an [`InvitesFile`] JSON document at
//! `<data_dir>/invites_info.json`. Writes use the atomic `.tmp` + rename
//! pattern. All mutations go through one coarse lock; the registry only ever
//! holds a handful of entries.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{io_err, SyncError};
use crate::uid::extract_uid;

pub const INVITES_FILE: &str = "invites_info.json";

/// Entries older than this many hours are purged by [`InvitesStore::clean_up`].
pub const INVITE_ENTRY_LIFETIME_HOURS: i64 = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteEntry {
    pub uid: String,
    /// Origin time of the invite version last seen for this uid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub marked_for_deletion: bool,
    #[serde(default)]
    pub overridden: bool,
    pub created_at: DateTime<Utc>,
}

impl InviteEntry {
    fn new(uid: String, now: DateTime<Utc>) -> Self {
        Self {
            uid,
            origin_time: None,
            marked_for_deletion: false,
            overridden: false,
            created_at: now,
        }
    }
}

/// On-disk payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvitesFile {
    #[serde(default)]
    pub invites: Vec<InviteEntry>,
}

#[derive(Debug)]
pub struct InvitesStore {
    path: PathBuf,
    entries: Mutex<Vec<InviteEntry>>,
}

/// Path of the registry file inside `data_dir`.
pub fn store_path_at(data_dir: &Path) -> PathBuf {
    data_dir.join(INVITES_FILE)
}

impl InvitesStore {
    /// Empty registry that will persist to `<data_dir>/invites_info.json`.
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: store_path_at(data_dir),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Load the registry from `data_dir`.
    ///
    /// Returns an empty registry if the file does not yet exist.
    pub fn load_at(data_dir: &Path) -> Result<Self, SyncError> {
        let path = store_path_at(data_dir);
        if !path.exists() {
            return Ok(Self::new(data_dir));
        }
        let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        let file: InvitesFile = serde_json::from_str(&contents)?;
        Ok(Self {
            path,
            entries: Mutex::new(file.invites),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record an incoming invite for the uid behind `global_id`.
    pub fn add_incoming_invite(&self, global_id: &str, origin_time: DateTime<Utc>) {
        self.add_incoming_invite_at(global_id, origin_time, Utc::now());
    }

    pub fn add_incoming_invite_at(
        &self,
        global_id: &str,
        origin_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        let Some(uid) = extract_uid(global_id) else {
            return;
        };
        let mut entries = self.lock();
        match entries.iter_mut().find(|e| e.uid == uid) {
            Some(entry) => entry.origin_time = Some(origin_time),
            None => {
                let mut entry = InviteEntry::new(uid, now);
                entry.origin_time = Some(origin_time);
                entries.push(entry);
            }
        }
    }

    /// One-shot latch: `true` only the first time it is asked for a given
    /// uid and origin time.
    pub fn find_and_set_overridden(&self, global_id: &str, origin_time: DateTime<Utc>) -> bool {
        let Some(uid) = extract_uid(global_id) else {
            return false;
        };
        let mut entries = self.lock();
        match entries
            .iter_mut()
            .find(|e| e.uid == uid && e.origin_time == Some(origin_time))
        {
            Some(entry) if !entry.overridden => {
                entry.overridden = true;
                true
            }
            _ => false,
        }
    }

    /// Two-phase removal: the first call marks the uid for deletion, the
    /// next call drops the entry. A call for an unknown uid starts a new
    /// marked entry.
    pub fn on_invite_deleted(&self, uid: &str) {
        self.on_invite_deleted_at(uid, Utc::now());
    }

    pub fn on_invite_deleted_at(&self, uid: &str, now: DateTime<Utc>) {
        if uid.is_empty() {
            return;
        }
        let mut entries = self.lock();
        match entries.iter().position(|e| e.uid == uid) {
            Some(idx) if entries[idx].marked_for_deletion => {
                entries.remove(idx);
            }
            Some(idx) => entries[idx].marked_for_deletion = true,
            None => {
                let mut entry = InviteEntry::new(uid.to_string(), now);
                entry.marked_for_deletion = true;
                entries.push(entry);
            }
        }
    }

    pub fn find_marked_for_deletion(&self, uid: &str) -> bool {
        self.lock()
            .iter()
            .any(|e| e.uid == uid && e.marked_for_deletion)
    }

    /// Purge entries older than [`INVITE_ENTRY_LIFETIME_HOURS`]. Returns the number
    /// removed.
    pub fn clean_up(&self) -> usize {
        self.clean_up_at(Utc::now())
    }

    pub fn clean_up_at(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        let lifetime = Duration::hours(INVITE_ENTRY_LIFETIME_HOURS);
        entries.retain(|e| e.created_at + lifetime > now);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "purged expired invite entries");
        }
        removed
    }

    /// Save the registry atomically.
    ///
    /// Writes to `<path>.tmp` then renames to `<path>`.
    pub fn save(&self) -> Result<(), SyncError> {
        let file = InvitesFile {
            invites: self.snapshot(),
        };
        let Some(dir) = self.path.parent() else {
            return Err(io_err(
                &self.path,
                std::io::Error::other("invalid invite registry path"),
            ));
        };
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

        let json = serde_json::to_string_pretty(&file)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &json).map_err(|e| io_err(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| io_err(&self.path, e))?;
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<InviteEntry> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<InviteEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
