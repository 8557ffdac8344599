//! Collaborator boundary.
//!
//! The two-way engine, the local store, the remote protocol and folder
//! management all live outside this workspace. These traits are the only
//! surface the orchestration layer sees; implementations are handed to the
//! daemon at construction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use pimsync_core::{DiscoveredCollection, FolderRef, Target, TargetId, TargetKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::SyncError;
use crate::interceptor::SyncInterceptor;

// ---------------------------------------------------------------------------
// Change notifications
// ---------------------------------------------------------------------------

/// One local-store change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotice {
    /// Storage-local identity; `None` when the store could not name the item.
    pub id: Option<String>,
    /// Monotonically increasing per identity.
    pub version: u64,
    pub deleted: bool,
}

impl ChangeNotice {
    pub fn changed(id: impl Into<String>, version: u64) -> Self {
        Self {
            id: Some(id.into()),
            version,
            deleted: false,
        }
    }

    pub fn deleted(id: impl Into<String>, version: u64) -> Self {
        Self {
            id: Some(id.into()),
            version,
            deleted: true,
        }
    }

    /// A notice that only says "something changed".
    pub fn anonymous() -> Self {
        Self {
            id: None,
            version: 0,
            deleted: false,
        }
    }

    /// Identity usable as a pending-set key.
    pub fn key(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }
}

/// Handed to [`EngineFactory::subscribe`]; the store pushes notices through it.
#[derive(Debug, Clone)]
pub struct ChangeSender(mpsc::UnboundedSender<ChangeNotice>);

impl ChangeSender {
    /// Returns `false` once the receiving runner state has been released.
    pub fn send(&self, notice: ChangeNotice) -> bool {
        self.0.send(notice).is_ok()
    }
}

pub fn change_channel() -> (ChangeSender, mpsc::UnboundedReceiver<ChangeNotice>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChangeSender(tx), rx)
}

/// Live change-notification registration with the local store.
pub trait Subscription: Send {
    fn unsubscribe(self: Box<Self>);
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityFailure {
    pub entity_id: String,
    pub error: String,
}

/// Outcome of one engine cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineReport {
    /// Local identities confirmed written.
    pub written: Vec<String>,
    pub failures: Vec<EntityFailure>,
}

/// One target's two-way engine instance.
#[async_trait]
pub trait SyncEngine: Send + Sync {
    /// Reconcile every entity in the target.
    async fn synchronize(&self) -> Result<EngineReport, SyncError>;

    /// Reconcile only the listed local identities.
    async fn synchronize_partial(&self, changes: &[ChangeNotice]) -> Result<EngineReport, SyncError>;
}

/// Everything an engine receives from the runner that owns it.
#[derive(Clone)]
pub struct EngineContext {
    /// Canceled when the owning runner state is released.
    pub cancel: CancellationToken,
    /// Called once per cycle on the classified action set, before execution.
    pub interceptor: Arc<dyn SyncInterceptor>,
    pub date_range: Arc<DateRangeFilter>,
}

pub trait EngineFactory: Send + Sync {
    fn create_engine(
        &self,
        target: &Target,
        ctx: EngineContext,
    ) -> Result<Arc<dyn SyncEngine>, SyncError>;

    /// Register for local change notices on the target's folder. `Ok(None)`
    /// when the store offers no notifications for it.
    fn subscribe(
        &self,
        target: &Target,
        sender: ChangeSender,
    ) -> Result<Option<Box<dyn Subscription>>, SyncError>;
}

// ---------------------------------------------------------------------------
// Session collaborators
// ---------------------------------------------------------------------------

#[async_trait]
pub trait TargetDiscovery: Send + Sync {
    /// Every collection the signed-in account exposes, in server order.
    async fn discover(&self) -> Result<Vec<DiscoveredCollection>, SyncError>;
}

/// Local folder management for newly discovered targets.
pub trait FolderAllocator: Send + Sync {
    /// The store's built-in folder for `kind`, if any.
    fn default_folder(&self, kind: TargetKind) -> Option<FolderRef>;

    fn create_folder(&self, kind: TargetKind, name: &str) -> Result<FolderRef, SyncError>;
}

/// Where failures go once classified. Implementations perform the side
/// effects (sign-out, status updates).
pub trait ErrorSink: Send + Sync {
    fn report(&self, target: Option<TargetId>, err: &SyncError);
}

// ---------------------------------------------------------------------------
// Date range
// ---------------------------------------------------------------------------

pub const DEFAULT_DAYS_BACK: i64 = 60;
pub const DEFAULT_DAYS_FORWARD: i64 = 365;

/// Window of calendar items an engine considers; shared by every engine and
/// switched off for "all dates" passes.
#[derive(Debug)]
pub struct DateRangeFilter {
    unbounded: AtomicBool,
    days_back: i64,
    days_forward: i64,
}

impl Default for DateRangeFilter {
    fn default() -> Self {
        Self::new(DEFAULT_DAYS_BACK, DEFAULT_DAYS_FORWARD)
    }
}

impl DateRangeFilter {
    pub fn new(days_back: i64, days_forward: i64) -> Self {
        Self {
            unbounded: AtomicBool::new(false),
            days_back,
            days_forward,
        }
    }

    pub fn set_unbounded(&self, unbounded: bool) {
        self.unbounded.store(unbounded, Ordering::SeqCst);
    }

    pub fn is_unbounded(&self) -> bool {
        self.unbounded.load(Ordering::SeqCst)
    }

    /// `None` when no constraint applies.
    pub fn window(&self, now: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        if self.is_unbounded() {
            return None;
        }
        Some((
            now - Duration::days(self.days_back),
            now + Duration::days(self.days_forward),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_spans_defaults_until_unbounded() {
        let filter = DateRangeFilter::default();
        let now = Utc::now();
        let (from, to) = filter.window(now).expect("bounded");
        assert_eq!(now - from, Duration::days(60));
        assert_eq!(to - now, Duration::days(365));

        filter.set_unbounded(true);
        assert!(filter.window(now).is_none());
    }

    #[test]
    fn empty_identity_is_not_a_key() {
        let notice = ChangeNotice {
            id: Some(String::new()),
            version: 1,
            deleted: false,
        };
        assert_eq!(notice.key(), None);
        assert_eq!(ChangeNotice::anonymous().key(), None);
        assert_eq!(ChangeNotice::changed("a", 2).key(), Some("a"));
    }

    #[tokio::test]
    async fn sender_reports_closed_receiver() {
        let (tx, mut rx) = change_channel();
        assert!(tx.send(ChangeNotice::changed("a", 1)));
        assert_eq!(rx.recv().await, Some(ChangeNotice::changed("a", 1)));
        drop(rx);
        assert!(!tx.send(ChangeNotice::changed("a", 2)));
    }
}
