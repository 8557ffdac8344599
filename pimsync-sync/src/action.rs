//! The closed set of actions an engine assigns to an entity pair during one
//! cycle, before any of them executes.

use serde::{Deserialize, Serialize};

/// Local item as seen by the classifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRef {
    /// Storage-local identity.
    pub id: String,
    pub version: u64,
    /// Hex-encoded global object id, present for calendar items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_id: Option<String>,
}

/// Remote resource as seen by the classifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRef {
    /// Resource address; its file stem usually carries the item uid.
    pub href: String,
    pub etag: String,
}

/// A known pairing between a local item and a remote resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub local_id: String,
    pub local_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteRef>,
}

impl Relation {
    /// Relation with no remote side yet.
    pub fn local_only(local: &LocalRef) -> Self {
        Self {
            local_id: local.id.clone(),
            local_version: local.version,
            remote: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    CreateLocal { remote: RemoteRef },
    CreateRemote { local: LocalRef },
    UpdateLocal { relation: Relation },
    UpdateRemote { relation: Relation },
    DeleteLocal { relation: Relation },
    DeleteRemote { relation: Relation },
    RestoreLocal { relation: Relation },
    RestoreRemote { relation: Relation },
    /// Drop the pairing without touching either side.
    Discard,
    DoNothing,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_serialize_with_tag() {
        let action = Action::DeleteRemote {
            relation: Relation {
                local_id: "l1".into(),
                local_version: 3,
                remote: Some(RemoteRef {
                    href: "/cal/abc.ics".into(),
                    etag: "\"e1\"".into(),
                }),
            },
        };
        let json = serde_json::to_value(&action).expect("serialize");
        assert_eq!(json["action"], "delete_remote");
        assert_eq!(json["relation"]["remote"]["href"], "/cal/abc.ics");
    }
}
