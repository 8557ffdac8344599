//! # pimsync-sync
//!
//! Building blocks shared by every target runner: the classified action
//! model, the conflict interceptor, the invite registry, the failed-entity
//! tracker, and the collaborator traits an engine implementation plugs into.
//!
//! Nothing in this crate schedules work; see `pimsync-daemon` for that.

pub mod action;
pub mod engine;
pub mod error;
pub mod failed;
pub mod interceptor;
pub mod invites;
pub mod uid;

pub use action::{Action, LocalRef, Relation, RemoteRef};
pub use engine::{
    change_channel, ChangeNotice, ChangeSender, DateRangeFilter, EngineContext, EngineFactory,
    EngineReport, EntityFailure, ErrorSink, FolderAllocator, Subscription, SyncEngine,
    TargetDiscovery,
};
pub use error::{classify, FailureKind, SyncError};
pub use failed::{FailedEntityInfo, FailedEntityTracker};
pub use interceptor::{ConflictInterceptor, InterceptSummary, NoopInterceptor, SyncInterceptor};
pub use invites::{InviteEntry, InvitesStore};
