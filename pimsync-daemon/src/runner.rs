//! Per-target execution discipline.
//!
//! A [`TargetRunner`] owns one target's engine and change subscription and
//! decides when that engine runs:
//!
//! - a scheduled pass marks a full sync pending and drains the loop;
//! - local change notices accumulate in the pending set and a 5 second quiet
//!   period later the loop drains them as a partial sync;
//! - only one loop runs at a time. A request arriving while a loop is
//!   active returns at once and the active loop picks the work up.
//!
//! Settings updates swap the whole [`RunnerState`]; the swapped-out state's
//! cancellation token, subscription and notice pump are released, which is
//! all a running loop can lose.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use pimsync_core::{FolderRef, Target, TargetId, TargetKind};
use pimsync_sync::{
    change_channel, ChangeNotice, DateRangeFilter, EngineContext, EngineFactory, EngineReport,
    ErrorSink, FailedEntityTracker, NoopInterceptor, Subscription, SyncEngine, SyncError,
    SyncInterceptor,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::paths::PARTIAL_SYNC_DELAY;
use crate::status::{StatusHandle, TargetResult};

/// Collaborators shared by every runner.
#[derive(Clone)]
pub struct RunnerDeps {
    pub factory: Arc<dyn EngineFactory>,
    pub errors: Arc<dyn ErrorSink>,
    pub failed: Arc<FailedEntityTracker>,
    pub status: Arc<StatusHandle>,
    /// Handed to calendar engines; other kinds get a pass-through hook.
    pub interceptor: Arc<dyn SyncInterceptor>,
    pub date_range: Arc<DateRangeFilter>,
    pub partial_delay: Duration,
}

impl RunnerDeps {
    pub fn new(
        factory: Arc<dyn EngineFactory>,
        errors: Arc<dyn ErrorSink>,
        status: Arc<StatusHandle>,
        interceptor: Arc<dyn SyncInterceptor>,
    ) -> Self {
        Self {
            factory,
            errors,
            failed: Arc::new(FailedEntityTracker::new()),
            status,
            interceptor,
            date_range: Arc::new(DateRangeFilter::default()),
            partial_delay: PARTIAL_SYNC_DELAY,
        }
    }
}

// ---------------------------------------------------------------------------
// State snapshot
// ---------------------------------------------------------------------------

/// Settings a runner state was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerSettings {
    pub active: bool,
    pub name: String,
    pub url: String,
    pub folder: Option<FolderRef>,
    pub kind: TargetKind,
    pub read_only: bool,
}

impl RunnerSettings {
    fn from_target(target: &Target) -> Self {
        let has_folder = target
            .folder
            .as_ref()
            .is_some_and(|f| !f.entry_id.is_empty());
        Self {
            active: target.active && has_folder,
            name: target.name.clone(),
            url: target.url.clone(),
            folder: target.folder.clone(),
            kind: target.kind,
            read_only: target.read_only,
        }
    }

    /// Fields whose change requires a fresh engine.
    fn binding_eq(&self, other: &Self) -> bool {
        self.active == other.active
            && self.read_only == other.read_only
            && self.url == other.url
            && self.folder == other.folder
    }
}

struct Resources {
    subscription: Option<Box<dyn Subscription>>,
    pump: Option<JoinHandle<()>>,
}

/// Immutable snapshot plus the resources it owns.
struct RunnerState {
    settings: RunnerSettings,
    engine: Option<Arc<dyn SyncEngine>>,
    cancel: CancellationToken,
    resources: Mutex<Option<Resources>>,
}

impl RunnerState {
    fn inactive(mut settings: RunnerSettings) -> Self {
        settings.active = false;
        Self {
            settings,
            engine: None,
            cancel: CancellationToken::new(),
            resources: Mutex::new(None),
        }
    }

    /// Idempotent.
    fn release(&self) {
        self.cancel.cancel();
        let taken = self
            .resources
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(resources) = taken {
            if let Some(subscription) = resources.subscription {
                subscription.unsubscribe();
            }
            if let Some(pump) = resources.pump {
                pump.abort();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

pub struct TargetRunner {
    id: TargetId,
    me: Weak<TargetRunner>,
    deps: RunnerDeps,
    state: Mutex<Arc<RunnerState>>,
    running: AtomicBool,
    full_pending: AtomicBool,
    pending: Mutex<HashMap<String, ChangeNotice>>,
    /// Change tag seen at the end of the last successful run; empty = unknown.
    prev_ctag: Mutex<String>,
    last_auto_sync: Mutex<Option<Instant>>,
    debounce: Mutex<Option<JoinHandle<()>>>,
}

impl TargetRunner {
    /// Build a runner and its first state for `target`.
    ///
    /// Must be called within a tokio runtime.
    pub fn spawn(target: &Target, deps: RunnerDeps) -> Result<Arc<Self>, SyncError> {
        let runner = Arc::new_cyclic(|me| Self {
            id: target.id,
            me: me.clone(),
            deps,
            state: Mutex::new(Arc::new(RunnerState::inactive(RunnerSettings::from_target(
                target,
            )))),
            running: AtomicBool::new(false),
            full_pending: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            prev_ctag: Mutex::new(String::new()),
            last_auto_sync: Mutex::new(None),
            debounce: Mutex::new(None),
        });
        runner.apply(target)?;
        Ok(runner)
    }

    pub fn id(&self) -> TargetId {
        self.id
    }

    pub fn settings(&self) -> RunnerSettings {
        self.state().settings.clone()
    }

    pub fn kind(&self) -> TargetKind {
        self.state().settings.kind
    }

    pub fn is_active(&self) -> bool {
        self.state().settings.active
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// When the last automatic run (or first manual run) started.
    pub fn last_auto_sync(&self) -> Option<Instant> {
        *lock(&self.last_auto_sync)
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Rebuild engine and subscription if the binding-relevant settings
    /// changed. A failure leaves the runner inactive.
    pub fn update_settings(&self, target: &Target) -> Result<(), SyncError> {
        let next = RunnerSettings::from_target(target);
        if self.state().settings.binding_eq(&next) {
            return Ok(());
        }
        self.apply(target)
    }

    fn apply(&self, target: &Target) -> Result<(), SyncError> {
        if self.is_running() {
            info!(target = %self.id, name = %target.name, "applying settings to a running target");
        }
        self.clear_queued_work();

        let settings = RunnerSettings::from_target(target);
        let (fresh, result) = match self.build_state(target, settings.clone()) {
            Ok(state) => (state, Ok(())),
            Err(err) => (RunnerState::inactive(settings), Err(err)),
        };
        let active = fresh.settings.active;
        let old = std::mem::replace(&mut *lock(&self.state), Arc::new(fresh));
        old.release();
        debug!(target = %self.id, active, "runner settings applied");
        result
    }

    fn build_state(
        &self,
        target: &Target,
        settings: RunnerSettings,
    ) -> Result<RunnerState, SyncError> {
        if !settings.active {
            return Ok(RunnerState::inactive(settings));
        }

        let cancel = CancellationToken::new();
        let interceptor: Arc<dyn SyncInterceptor> = match settings.kind {
            TargetKind::Calendar => self.deps.interceptor.clone(),
            _ => Arc::new(NoopInterceptor),
        };
        let ctx = EngineContext {
            cancel: cancel.clone(),
            interceptor,
            date_range: self.deps.date_range.clone(),
        };
        let engine = self.deps.factory.create_engine(target, ctx)?;

        let (sender, receiver) = change_channel();
        let subscription = match self.deps.factory.subscribe(target, sender) {
            Ok(subscription) => subscription,
            Err(err) => {
                warn!(target = %self.id, error = %err, "change notifications unavailable");
                None
            }
        };
        let pump = subscription
            .is_some()
            .then(|| tokio::spawn(pump_notices(self.me.clone(), receiver)));

        Ok(RunnerState {
            settings,
            engine: Some(engine),
            cancel,
            resources: Mutex::new(Some(Resources { subscription, pump })),
        })
    }

    /// Record a local change. Every notice invalidates the cached change tag;
    /// an identified notice joins the pending set and restarts the quiet
    /// period.
    pub fn notify_change(&self, notice: ChangeNotice) {
        lock(&self.prev_ctag).clear();
        let Some(key) = notice.key().map(str::to_owned) else {
            debug!(target = %self.id, "change notice without identity");
            return;
        };
        match lock(&self.pending).entry(key) {
            Entry::Occupied(mut slot) => {
                if notice.version > slot.get().version {
                    slot.insert(notice);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(notice);
            }
        }
        self.restart_debounce();
    }

    fn restart_debounce(&self) {
        let me = self.me.clone();
        let delay = self.deps.partial_delay;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(runner) = me.upgrade() {
                // Detached so a later restart cannot abort a run in progress.
                tokio::spawn(async move {
                    runner.run_all_pending().await;
                });
            }
        });
        if let Some(previous) = lock(&self.debounce).replace(timer) {
            previous.abort();
        }
    }

    /// Run one scheduled attempt. Returns whether work was started.
    pub async fn run_and_reschedule(&self, manual: bool, ctag: &str) -> bool {
        let settings = self.settings();
        if !settings.active {
            return false;
        }
        if !manual {
            let prev = lock(&self.prev_ctag).clone();
            if !prev.is_empty() && !ctag.is_empty() && prev == ctag {
                debug!(target = %self.id, name = %settings.name, "remote unchanged, skipping");
                return false;
            }
        }
        {
            let mut last = lock(&self.last_auto_sync);
            if !manual || last.is_none() {
                *last = Some(Instant::now());
            }
        }

        self.full_pending.store(true, Ordering::Release);
        info!(target = %self.id, name = %settings.name, kind = %settings.kind, manual, "sync started");
        if self.run_all_pending().await {
            *lock(&self.prev_ctag) = ctag.to_string();
        }
        true
    }

    /// Queue `entity_ids` as partial work and drain immediately, bypassing
    /// the quiet period.
    pub async fn retry_entities(&self, entity_ids: &[String]) -> bool {
        if !self.is_active() || entity_ids.is_empty() {
            return false;
        }
        {
            let mut pending = lock(&self.pending);
            for id in entity_ids {
                pending
                    .entry(id.clone())
                    .or_insert_with(|| ChangeNotice::changed(id.clone(), 0));
            }
        }
        debug!(target = %self.id, count = entity_ids.len(), "retrying failed entities");
        self.run_all_pending().await;
        true
    }

    /// Stop notifications, drop queued work, and release the engine. Safe
    /// while a run is in progress.
    pub fn cancel(&self) {
        self.clear_queued_work();
        let settings = self.settings();
        let old = std::mem::replace(
            &mut *lock(&self.state),
            Arc::new(RunnerState::inactive(settings)),
        );
        old.release();
        debug!(target = %self.id, "runner canceled");
    }

    fn clear_queued_work(&self) {
        if let Some(timer) = lock(&self.debounce).take() {
            timer.abort();
        }
        lock(&self.pending).clear();
        self.full_pending.store(false, Ordering::Release);
    }

    fn handle_failure(&self, err: SyncError) {
        lock(&self.prev_ctag).clear();
        self.deps.errors.report(Some(self.id), &err);
    }

    // -----------------------------------------------------------------------
    // Execution loop
    // -----------------------------------------------------------------------

    /// Drain until no work is left. Returns false when any engine call in
    /// this loop failed; the failure has already been reported.
    async fn run_all_pending(&self) -> bool {
        let mut clean = true;
        loop {
            if self
                .running
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return clean;
            }
            let outcome = {
                let _guard = RunningGuard(&self.running);
                self.drain().await
            };
            clean &= !outcome.failed;
            if !outcome.canceled {
                self.deps.status.set_target_result(
                    self.id,
                    if outcome.failed || outcome.had_failures {
                        TargetResult::HasErrors
                    } else {
                        TargetResult::Success
                    },
                );
            }
            // Work queued between the last drain check and the release.
            if !self.has_pending_work() {
                return clean;
            }
        }
    }

    /// A failing phase is reported and the loop moves on; queued work is
    /// never dropped by an earlier failure.
    async fn drain(&self) -> DrainOutcome {
        let mut outcome = DrainOutcome::default();
        loop {
            let state = self.state();
            let Some(engine) = state.engine.clone() else {
                self.full_pending.store(false, Ordering::Release);
                lock(&self.pending).clear();
                return outcome;
            };
            let mut worked = false;

            if self.full_pending.swap(false, Ordering::AcqRel) {
                worked = true;
                let result = until_canceled(&state.cancel, engine.synchronize()).await;
                self.settle(&state, result, &mut outcome);
            }

            let changes: Vec<ChangeNotice> = lock(&self.pending).drain().map(|(_, n)| n).collect();
            if !changes.is_empty() {
                worked = true;
                debug!(target = %self.id, count = changes.len(), "partial sync");
                let result =
                    until_canceled(&state.cancel, engine.synchronize_partial(&changes)).await;
                self.settle(&state, result, &mut outcome);
            }

            if !worked {
                return outcome;
            }
        }
    }

    fn settle(
        &self,
        state: &RunnerState,
        result: Result<EngineReport, SyncError>,
        outcome: &mut DrainOutcome,
    ) {
        match result {
            Ok(report) => outcome.had_failures |= self.absorb(state, report),
            Err(err) => {
                outcome.failed = true;
                outcome.canceled |= matches!(err, SyncError::Cancelled);
                self.handle_failure(err);
            }
        }
    }

    /// Feed an engine report into the failed-entity tracker.
    fn absorb(&self, state: &RunnerState, report: EngineReport) -> bool {
        let entity_type = state.settings.kind.entity_type();
        for id in &report.written {
            self.deps.failed.remove_entity(id, entity_type);
        }
        for failure in &report.failures {
            self.deps
                .failed
                .add_failed_entity(self.id, &failure.entity_id, entity_type, &failure.error);
        }
        !report.failures.is_empty()
    }

    fn has_pending_work(&self) -> bool {
        self.full_pending.load(Ordering::Acquire) || !lock(&self.pending).is_empty()
    }

    fn state(&self) -> Arc<RunnerState> {
        lock(&self.state).clone()
    }
}

impl Drop for TargetRunner {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.debounce).take() {
            timer.abort();
        }
        lock(&self.state).release();
    }
}

#[derive(Default)]
struct DrainOutcome {
    /// Some entities failed inside an otherwise completed call.
    had_failures: bool,
    /// An engine call itself failed.
    failed: bool,
    canceled: bool,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

async fn until_canceled<F>(cancel: &CancellationToken, work: F) -> Result<EngineReport, SyncError>
where
    F: std::future::Future<Output = Result<EngineReport, SyncError>>,
{
    tokio::select! {
        result = work => result,
        _ = cancel.cancelled() => Err(SyncError::Cancelled),
    }
}

async fn pump_notices(runner: Weak<TargetRunner>, mut receiver: mpsc::UnboundedReceiver<ChangeNotice>) {
    while let Some(notice) = receiver.recv().await {
        let Some(runner) = runner.upgrade() else {
            break;
        };
        runner.notify_change(notice);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
