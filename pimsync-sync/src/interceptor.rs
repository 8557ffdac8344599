//! Post-classification rewrite of two ambiguous calendar cases.
//!
//! 1. Invite suppression: a local item about to be created remotely whose uid
//!    the invite registry has marked for deletion is a stale duplicate of an
//!    invite that was already discarded. It is deleted locally instead.
//! 2. Delete/create race: the remote copy of an item is about to be deleted
//!    while a local copy with the same uid is about to be created, because
//!    the two no longer share identifiers. The delete is discarded and the
//!    create becomes an update of the remote copy.
//!
//! Actions whose uid cannot be extracted are left untouched.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::action::{Action, Relation};
use crate::invites::InvitesStore;
use crate::uid::{extract_uid, is_global_appointment_id, uid_from_href};

/// Hook an engine calls once per cycle with the full classified action set,
/// before executing any of it.
pub trait SyncInterceptor: Send + Sync {
    fn intercept(&self, actions: &mut [Action]) -> InterceptSummary;
}

/// Passes every action through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInterceptor;

impl SyncInterceptor for NoopInterceptor {
    fn intercept(&self, _actions: &mut [Action]) -> InterceptSummary {
        InterceptSummary::default()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InterceptSummary {
    /// Creates turned into local deletes.
    pub suppressed_invites: usize,
    /// Delete/create pairs collapsed into one update.
    pub merged_races: usize,
}

impl InterceptSummary {
    pub fn is_empty(&self) -> bool {
        self.suppressed_invites == 0 && self.merged_races == 0
    }
}

#[derive(Debug, Clone)]
pub struct ConflictInterceptor {
    invites: Arc<InvitesStore>,
}

impl ConflictInterceptor {
    pub fn new(invites: Arc<InvitesStore>) -> Self {
        Self { invites }
    }

    pub fn transform(&self, actions: &mut [Action]) -> InterceptSummary {
        let mut summary = InterceptSummary::default();
        let (mut creates, deletes) = index_actions(actions);

        // Invite suppression.
        let mut suppressed: Vec<String> = creates
            .keys()
            .filter(|uid| self.invites.find_marked_for_deletion(uid))
            .cloned()
            .collect();
        suppressed.sort();
        for uid in suppressed {
            let Some(idx) = creates.remove(&uid) else {
                continue;
            };
            if let Action::CreateRemote { local } = &actions[idx] {
                let relation = Relation::local_only(local);
                debug!(uid = %uid, local = %relation.local_id, "suppressing create of deleted invite");
                actions[idx] = Action::DeleteLocal { relation };
                summary.suppressed_invites += 1;
            }
        }

        // Delete/create races. Each delete action is handled once even when
        // registered under two keys.
        let mut delete_indices: Vec<usize> = deletes.values().copied().collect();
        delete_indices.sort_unstable();
        delete_indices.dedup();
        for delete_idx in delete_indices {
            let Some(keys) = delete_keys(&actions[delete_idx]) else {
                continue;
            };
            let matched = keys
                .lookup_order()
                .find_map(|key| creates.remove(key).map(|idx| (key.to_string(), idx)));
            let Some((uid, create_idx)) = matched else {
                continue;
            };
            let remote = match &actions[delete_idx] {
                Action::DeleteRemote { relation } => relation.remote.clone(),
                _ => None,
            };
            let Action::CreateRemote { local } = &actions[create_idx] else {
                continue;
            };
            let relation = Relation {
                local_id: local.id.clone(),
                local_version: local.version,
                remote,
            };
            debug!(uid = %uid, local = %relation.local_id, "merging remote delete into update");
            actions[delete_idx] = Action::Discard;
            actions[create_idx] = Action::UpdateRemote { relation };
            summary.merged_races += 1;
        }

        summary
    }
}

impl SyncInterceptor for ConflictInterceptor {
    fn intercept(&self, actions: &mut [Action]) -> InterceptSummary {
        self.transform(actions)
    }
}

/// Keys a remote delete may match under.
struct DeleteKeys {
    decoded: String,
    extracted: Option<String>,
}

impl DeleteKeys {
    fn lookup_order(&self) -> impl Iterator<Item = &str> {
        self.extracted
            .as_deref()
            .into_iter()
            .chain(std::iter::once(self.decoded.as_str()))
    }
}

fn delete_keys(action: &Action) -> Option<DeleteKeys> {
    let Action::DeleteRemote { relation } = action else {
        return None;
    };
    let decoded = uid_from_href(&relation.remote.as_ref()?.href)?;
    let extracted = if is_global_appointment_id(&decoded) {
        extract_uid(&decoded).filter(|uid| *uid != decoded)
    } else {
        None
    };
    Some(DeleteKeys { decoded, extracted })
}

/// `creates[uid]` and `deletes[uid]` as action indices. Later creates win on
/// a uid collision.
fn index_actions(actions: &[Action]) -> (HashMap<String, usize>, HashMap<String, usize>) {
    let mut creates = HashMap::new();
    let mut deletes = HashMap::new();
    for (idx, action) in actions.iter().enumerate() {
        match action {
            Action::CreateRemote { local } => {
                let uid = local.global_id.as_deref().and_then(extract_uid);
                if let Some(uid) = uid.filter(|u| !u.is_empty()) {
                    creates.insert(uid, idx);
                }
            }
            Action::DeleteRemote { .. } => {
                if let Some(keys) = delete_keys(action) {
                    if let Some(extracted) = keys.extracted {
                        deletes.entry(extracted).or_insert(idx);
                    }
                    deletes.insert(keys.decoded, idx);
                }
            }
            _ => {}
        }
    }
    (creates, deletes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{LocalRef, RemoteRef};
    use crate::uid::encode_vcal_global_id;
    use tempfile::TempDir;

    fn create(local_id: &str, uid: &str) -> Action {
        Action::CreateRemote {
            local: LocalRef {
                id: local_id.into(),
                version: 7,
                global_id: Some(encode_vcal_global_id(uid)),
            },
        }
    }

    fn delete(href: &str) -> Action {
        Action::DeleteRemote {
            relation: Relation {
                local_id: "gone".into(),
                local_version: 1,
                remote: Some(RemoteRef {
                    href: href.into(),
                    etag: "\"e9\"".into(),
                }),
            },
        }
    }

    #[test]
    fn create_without_global_id_is_ignored() {
        let tmp = TempDir::new().unwrap();
        let interceptor = ConflictInterceptor::new(Arc::new(InvitesStore::new(tmp.path())));
        let mut actions = vec![
            Action::CreateRemote {
                local: LocalRef {
                    id: "l1".into(),
                    version: 1,
                    global_id: None,
                },
            },
            delete("/cal/l1.ics"),
        ];
        let before = actions.clone();
        assert!(interceptor.transform(&mut actions).is_empty());
        assert_eq!(actions, before);
    }

    #[test]
    fn delete_keyed_by_global_id_file_name_matches_extracted_uid() {
        let tmp = TempDir::new().unwrap();
        let interceptor = ConflictInterceptor::new(Arc::new(InvitesStore::new(tmp.path())));
        let gid = encode_vcal_global_id("meeting-1");
        let mut actions = vec![delete(&format!("/cal/{gid}.ics")), create("l2", "meeting-1")];

        let summary = interceptor.transform(&mut actions);
        assert_eq!(summary.merged_races, 1);
        assert_eq!(actions[0], Action::Discard);
        assert!(matches!(actions[1], Action::UpdateRemote { .. }));
    }

    #[test]
    fn unrelated_actions_pass_through() {
        let tmp = TempDir::new().unwrap();
        let interceptor = ConflictInterceptor::new(Arc::new(InvitesStore::new(tmp.path())));
        let mut actions = vec![Action::DoNothing, create("l1", "a"), delete("/cal/b.ics")];
        let before = actions.clone();
        interceptor.transform(&mut actions);
        assert_eq!(actions, before);
    }
}
