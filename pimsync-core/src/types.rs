//! Domain types for pimsync targets.
//!
//! A *target* pairs one local folder with one remote collection. Its
//! persisted subset ([`TargetConfig`]) is stored per user in the YAML config;
//! the full [`Target`] is rebuilt on every remote discovery.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Opaque, stable identity of a synchronized target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetId(pub Uuid);

impl TargetId {
    /// Mint a fresh random identity for a newly discovered collection.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TargetId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for TargetId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// What a target synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Contacts,
    Calendar,
    Tasks,
}

impl TargetKind {
    /// Position of this kind within a pass. Contacts go first since events
    /// and tasks may reference contact identities.
    pub fn sync_order(self) -> u8 {
        match self {
            TargetKind::Contacts => 0,
            TargetKind::Calendar => 1,
            TargetKind::Tasks => 2,
        }
    }

    /// Entity type label used when tracking failed writes.
    pub fn entity_type(self) -> &'static str {
        match self {
            TargetKind::Contacts => "contact",
            TargetKind::Calendar => "event",
            TargetKind::Tasks => "task",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::Contacts => write!(f, "contacts"),
            TargetKind::Calendar => write!(f, "calendar"),
            TargetKind::Tasks => write!(f, "tasks"),
        }
    }
}

// ---------------------------------------------------------------------------
// Domain structs
// ---------------------------------------------------------------------------

/// Reference to a folder in the local item store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FolderRef {
    pub entry_id: String,
    pub store_id: String,
}

impl FolderRef {
    pub fn new(entry_id: impl Into<String>, store_id: impl Into<String>) -> Self {
        Self {
            entry_id: entry_id.into(),
            store_id: store_id.into(),
        }
    }
}

impl fmt::Display for FolderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.entry_id, self.store_id)
    }
}

/// Persisted per-user settings of one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub id: TargetId,
    pub active: bool,
    /// Remote collection address.
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<FolderRef>,
}

impl TargetConfig {
    /// Config for a collection seen for the first time: fresh id, active.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            id: TargetId::new(),
            active: true,
            url: url.into(),
            folder: None,
        }
    }
}

/// A remote collection as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredCollection {
    pub url: String,
    pub kind: TargetKind,
    pub name: String,
    /// Change tag summarizing the collection state, when the server supplies one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctag: Option<String>,
    #[serde(default)]
    pub read_only: bool,
}

/// One synchronized collection: persisted config plus discovery metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    pub kind: TargetKind,
    pub name: String,
    pub url: String,
    pub active: bool,
    pub read_only: bool,
    /// First collection of its kind on the server.
    #[serde(default)]
    pub is_primary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<FolderRef>,
}

impl Target {
    pub fn from_discovery(
        config: TargetConfig,
        collection: &DiscoveredCollection,
        is_primary: bool,
    ) -> Self {
        Self {
            id: config.id,
            kind: collection.kind,
            name: collection.name.clone(),
            url: config.url,
            active: config.active,
            read_only: collection.read_only,
            is_primary,
            folder: config.folder,
        }
    }

    /// The persisted subset of this target.
    pub fn config(&self) -> TargetConfig {
        TargetConfig {
            id: self.id,
            active: self.active,
            url: self.url.clone(),
            folder: self.folder.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_order_contacts_first() {
        let mut kinds = vec![TargetKind::Tasks, TargetKind::Calendar, TargetKind::Contacts];
        kinds.sort_by_key(|k| k.sync_order());
        assert_eq!(
            kinds,
            vec![TargetKind::Contacts, TargetKind::Calendar, TargetKind::Tasks]
        );
    }

    #[test]
    fn target_id_serializes_as_plain_uuid() {
        let id = TargetId::new();
        let yaml = serde_yaml::to_string(&id).expect("serialize");
        assert_eq!(yaml.trim(), id.to_string());
    }

    #[test]
    fn target_config_roundtrips_through_discovery() {
        let mut config = TargetConfig::new("https://dav.example.org/calendars/work/");
        config.folder = Some(FolderRef::new("entry-1", "store-1"));
        let collection = DiscoveredCollection {
            url: config.url.clone(),
            kind: TargetKind::Calendar,
            name: "Work".to_string(),
            ctag: Some("c1".to_string()),
            read_only: true,
        };

        let target = Target::from_discovery(config.clone(), &collection, true);
        assert_eq!(target.kind, TargetKind::Calendar);
        assert!(target.read_only);
        assert_eq!(target.config(), config);
    }

    #[test]
    fn kind_display_is_lowercase() {
        assert_eq!(TargetKind::Contacts.to_string(), "contacts");
        assert_eq!(TargetKind::Tasks.entity_type(), "task");
    }
}
