//! Aggregate pass status shared with status consumers, and the default
//! error sink that feeds it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use pimsync_core::TargetId;
use pimsync_sync::{ErrorSink, FailureKind, SyncError};
use serde::Serialize;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Unknown,
    Running,
    Idle,
    CriticalError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CriticalError {
    #[default]
    None,
    ProxyConnectFailure,
    ProxyAuthFailure,
    NoInternet,
    ServerError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TargetResult {
    #[default]
    None,
    Success,
    HasErrors,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct PassStatus {
    pub state: SyncState,
    pub critical_error: CriticalError,
    /// Last result per target taking part in the current or last pass.
    pub results: BTreeMap<TargetId, TargetResult>,
    /// Set when the server rejected the credentials or the user signed out.
    pub signed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_finished_at: Option<DateTime<Utc>>,
}

/// One per process; shared by the session, every runner and the socket server.
#[derive(Debug, Default)]
pub struct StatusHandle {
    inner: Mutex<PassStatus>,
}

impl StatusHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter `Running`. Results survive only for targets still taking part;
    /// newcomers start at `None`.
    pub fn on_started(&self, targets: &[TargetId]) {
        let mut status = self.lock();
        let previous = std::mem::take(&mut status.results);
        status.results = targets
            .iter()
            .map(|id| (*id, previous.get(id).copied().unwrap_or_default()))
            .collect();
        status.state = SyncState::Running;
        status.last_started_at = Some(Utc::now());
    }

    pub fn on_finished(&self) {
        let mut status = self.lock();
        status.state = if status.critical_error == CriticalError::None {
            SyncState::Idle
        } else {
            SyncState::CriticalError
        };
        status.last_finished_at = Some(Utc::now());
    }

    pub fn set_critical_error(&self, critical: CriticalError) {
        let mut status = self.lock();
        status.critical_error = critical;
        if critical != CriticalError::None {
            status.state = SyncState::CriticalError;
        } else if status.state == SyncState::CriticalError {
            status.state = SyncState::Unknown;
        }
    }

    pub fn set_target_result(&self, target: TargetId, result: TargetResult) {
        self.lock().results.insert(target, result);
    }

    pub fn set_signed_out(&self, signed_out: bool) {
        self.lock().signed_out = signed_out;
    }

    /// Back to the initial state, except for the sign-out flag.
    pub fn reset(&self) {
        let mut status = self.lock();
        let signed_out = status.signed_out;
        *status = PassStatus {
            signed_out,
            ..PassStatus::default()
        };
    }

    pub fn is_running(&self) -> bool {
        self.lock().state == SyncState::Running
    }

    pub fn snapshot(&self) -> PassStatus {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, PassStatus> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Maps classified failures onto [`StatusHandle`].
#[derive(Debug, Clone)]
pub struct StatusErrorSink {
    status: Arc<StatusHandle>,
}

impl StatusErrorSink {
    pub fn new(status: Arc<StatusHandle>) -> Self {
        Self { status }
    }
}

impl ErrorSink for StatusErrorSink {
    fn report(&self, target: Option<TargetId>, err: &SyncError) {
        let kind = err.kind();
        if kind == FailureKind::Cancelled {
            debug!(target = ?target, "sync canceled");
            return;
        }
        if let Some(id) = target {
            self.status.set_target_result(id, TargetResult::HasErrors);
        }
        match kind {
            FailureKind::Unauthorized => {
                warn!(target = ?target, error = %err, "credentials rejected, signing out");
                self.status.set_signed_out(true);
            }
            FailureKind::ProxyConnect => {
                self.status.set_critical_error(CriticalError::ProxyConnectFailure)
            }
            FailureKind::ProxyAuth => {
                self.status.set_critical_error(CriticalError::ProxyAuthFailure)
            }
            FailureKind::NoInternet => self.status.set_critical_error(CriticalError::NoInternet),
            FailureKind::ServerError => {
                self.status.set_critical_error(CriticalError::ServerError)
            }
            FailureKind::Cancelled | FailureKind::Other => {}
        }
        if kind != FailureKind::Unauthorized {
            error!(target = ?target, kind = ?kind, error = %err, "sync failed");
        }
    }
}
