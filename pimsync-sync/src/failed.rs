//! Bounded retry bookkeeping for entities whose write failed.
//!
//! Independent of any retry an engine does internally: after each pass the
//! session asks for [`FailedEntityTracker::retryable_entities`] and re-syncs
//! exactly those identities. Cleanup is explicit, never on a timer.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use pimsync_core::TargetId;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Entries at or above this count are no longer retried.
pub const MAX_RETRY_COUNT: u32 = 3;

/// Entries that first failed longer ago than this are dropped on cleanup.
pub const FAILED_ENTITY_TTL_MINUTES: i64 = 60;

const LOGGED_ID_CHARS: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedEntityInfo {
    pub entity_id: String,
    pub entity_type: String,
    /// Target whose runner owns the entity.
    pub target: TargetId,
    pub failed_at: DateTime<Utc>,
    pub error_message: String,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_retry_at: Option<DateTime<Utc>>,
}

type EntityKey = (String, String);

#[derive(Debug, Default)]
pub struct FailedEntityTracker {
    entries: Mutex<HashMap<EntityKey, FailedEntityInfo>>,
}

impl FailedEntityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a write failure. A repeat failure bumps the retry count and
    /// refreshes the message; a new entry starts at zero.
    pub fn add_failed_entity(
        &self,
        target: TargetId,
        entity_id: &str,
        entity_type: &str,
        error_message: &str,
    ) {
        self.add_failed_entity_at(target, entity_id, entity_type, error_message, Utc::now());
    }

    pub fn add_failed_entity_at(
        &self,
        target: TargetId,
        entity_id: &str,
        entity_type: &str,
        error_message: &str,
        now: DateTime<Utc>,
    ) {
        let mut entries = self.lock();
        let key = (entity_type.to_string(), entity_id.to_string());
        match entries.get_mut(&key) {
            Some(info) => {
                info.retry_count += 1;
                info.last_retry_at = Some(now);
                info.error_message = error_message.to_string();
                info.target = target;
                warn!(
                    entity = %truncate_entity_id(entity_id),
                    entity_type,
                    retry_count = info.retry_count,
                    error = error_message,
                    "entity failed again"
                );
            }
            None => {
                warn!(
                    entity = %truncate_entity_id(entity_id),
                    entity_type,
                    error = error_message,
                    "entity failed to sync"
                );
                entries.insert(
                    key,
                    FailedEntityInfo {
                        entity_id: entity_id.to_string(),
                        entity_type: entity_type.to_string(),
                        target,
                        failed_at: now,
                        error_message: error_message.to_string(),
                        retry_count: 0,
                        last_retry_at: None,
                    },
                );
            }
        }
    }

    /// Entries still below [`MAX_RETRY_COUNT`], oldest failure first.
    pub fn retryable_entities(&self) -> Vec<FailedEntityInfo> {
        let mut retryable: Vec<FailedEntityInfo> = self
            .lock()
            .values()
            .filter(|info| info.retry_count < MAX_RETRY_COUNT)
            .cloned()
            .collect();
        retryable.sort_by(|a, b| a.failed_at.cmp(&b.failed_at));
        retryable
    }

    /// Count a retry attempt without a new failure message.
    pub fn mark_retried(&self, entity_id: &str, entity_type: &str) {
        self.mark_retried_at(entity_id, entity_type, Utc::now());
    }

    pub fn mark_retried_at(&self, entity_id: &str, entity_type: &str, now: DateTime<Utc>) {
        let key = (entity_type.to_string(), entity_id.to_string());
        if let Some(info) = self.lock().get_mut(&key) {
            info.retry_count += 1;
            info.last_retry_at = Some(now);
        }
    }

    /// Forget an entity after a confirmed successful write.
    pub fn remove_entity(&self, entity_id: &str, entity_type: &str) -> bool {
        let key = (entity_type.to_string(), entity_id.to_string());
        let removed = self.lock().remove(&key).is_some();
        if removed {
            debug!(
                entity = %truncate_entity_id(entity_id),
                entity_type,
                "failed entity recovered"
            );
        }
        removed
    }

    /// Drop entries that exhausted their retries or first failed more than
    /// [`FAILED_ENTITY_TTL_MINUTES`] ago. Returns the number removed.
    pub fn cleanup_old_entities(&self) -> usize {
        self.cleanup_old_entities_at(Utc::now())
    }

    pub fn cleanup_old_entities_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::minutes(FAILED_ENTITY_TTL_MINUTES);
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, info| info.retry_count < MAX_RETRY_COUNT && info.failed_at >= cutoff);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "dropped stale failed entities");
        }
        removed
    }

    pub fn get(&self, entity_id: &str, entity_type: &str) -> Option<FailedEntityInfo> {
        let key = (entity_type.to_string(), entity_id.to_string());
        self.lock().get(&key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<EntityKey, FailedEntityInfo>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Last 20 characters of an entity id, for log lines.
pub fn truncate_entity_id(entity_id: &str) -> String {
    let count = entity_id.chars().count();
    if count <= LOGGED_ID_CHARS {
        return entity_id.to_string();
    }
    let tail: String = entity_id.chars().skip(count - LOGGED_ID_CHARS).collect();
    format!("...{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(mins: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap() + Duration::minutes(mins)
    }

    #[test]
    fn new_entry_starts_at_zero_and_repeat_increments() {
        let tracker = FailedEntityTracker::new();
        let target = TargetId::new();
        tracker.add_failed_entity_at(target, "e1", "event", "first", ts(0));
        assert_eq!(tracker.get("e1", "event").unwrap().retry_count, 0);

        tracker.add_failed_entity_at(target, "e1", "event", "second", ts(1));
        let info = tracker.get("e1", "event").unwrap();
        assert_eq!(info.retry_count, 1);
        assert_eq!(info.error_message, "second");
        assert_eq!(info.failed_at, ts(0));
        assert_eq!(info.last_retry_at, Some(ts(1)));
    }

    #[test]
    fn same_id_different_type_are_distinct() {
        let tracker = FailedEntityTracker::new();
        let target = TargetId::new();
        tracker.add_failed_entity(target, "x", "event", "e");
        tracker.add_failed_entity(target, "x", "task", "e");
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn retryable_excludes_exhausted_entries() {
        let tracker = FailedEntityTracker::new();
        let target = TargetId::new();
        for _ in 0..4 {
            tracker.add_failed_entity(target, "bad", "contact", "nope");
        }
        tracker.add_failed_entity(target, "ok", "contact", "once");

        let retryable = tracker.retryable_entities();
        assert_eq!(retryable.len(), 1);
        assert_eq!(retryable[0].entity_id, "ok");
        assert!(retryable.iter().all(|i| i.retry_count < MAX_RETRY_COUNT));
    }

    #[test]
    fn mark_retried_counts_toward_bound() {
        let tracker = FailedEntityTracker::new();
        tracker.add_failed_entity(TargetId::new(), "e1", "event", "x");
        for _ in 0..MAX_RETRY_COUNT {
            tracker.mark_retried("e1", "event");
        }
        assert!(tracker.retryable_entities().is_empty());
    }

    #[test]
    fn cleanup_removes_old_regardless_of_retry_count() {
        let tracker = FailedEntityTracker::new();
        let target = TargetId::new();
        tracker.add_failed_entity_at(target, "old", "event", "x", ts(0));
        tracker.add_failed_entity_at(target, "fresh", "event", "x", ts(30));

        let removed = tracker.cleanup_old_entities_at(ts(61));
        assert_eq!(removed, 1);
        assert!(tracker.get("old", "event").is_none());
        assert!(tracker.get("fresh", "event").is_some());
    }

    #[test]
    fn cleanup_removes_exhausted_entries() {
        let tracker = FailedEntityTracker::new();
        let target = TargetId::new();
        for i in 0..4 {
            tracker.add_failed_entity_at(target, "bad", "event", "x", ts(i));
        }
        assert_eq!(tracker.cleanup_old_entities_at(ts(5)), 1);
        assert!(tracker.is_empty());
    }

    #[test]
    fn remove_entity_reports_presence() {
        let tracker = FailedEntityTracker::new();
        tracker.add_failed_entity(TargetId::new(), "e1", "event", "x");
        assert!(tracker.remove_entity("e1", "event"));
        assert!(!tracker.remove_entity("e1", "event"));
    }

    #[test]
    fn long_ids_are_truncated_to_their_tail() {
        assert_eq!(truncate_entity_id("short"), "short");
        let long = "0123456789abcdefghijKLMNOP";
        assert_eq!(truncate_entity_id(long), "...6789abcdefghijKLMNOP");
    }
}
