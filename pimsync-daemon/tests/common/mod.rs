#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pimsync_core::{DiscoveredCollection, FolderRef, Target, TargetConfig, TargetId, TargetKind};
use pimsync_daemon::{RunnerDeps, SessionDeps, StatusHandle};
use pimsync_sync::{
    ChangeNotice, ChangeSender, DateRangeFilter, EngineContext, EngineFactory, EngineReport,
    EntityFailure, ErrorSink, FailureKind, FolderAllocator, NoopInterceptor, Subscription,
    SyncEngine, SyncError, TargetDiscovery,
};

// ---------------------------------------------------------------------------
// Engine calls
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallKind {
    Full,
    /// Sorted `(id, version)` pairs of the partial batch.
    Partial(Vec<(String, u64)>),
}

#[derive(Debug, Clone)]
pub struct EngineCall {
    pub target: TargetId,
    pub kind: CallKind,
    /// Whether the date range was lifted while the call ran.
    pub unbounded: bool,
}

#[derive(Default)]
pub struct Shared {
    pub calls: Mutex<Vec<EngineCall>>,
    pub created: AtomicUsize,
    pub unsubscribed: AtomicUsize,
    pub fail_create: Mutex<HashSet<String>>,
    pub senders: Mutex<HashMap<TargetId, ChangeSender>>,
    pub full_delay: Mutex<Duration>,
    pub full_failures: Mutex<Vec<EntityFailure>>,
    pub unauthorized: AtomicBool,
    /// Full syncs fail with a 503 after their delay.
    pub server_down: AtomicBool,
}

impl Shared {
    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, target: TargetId) -> Vec<CallKind> {
        self.calls()
            .into_iter()
            .filter(|c| c.target == target)
            .map(|c| c.kind)
            .collect()
    }

    pub fn sender(&self, target: TargetId) -> ChangeSender {
        self.senders
            .lock()
            .unwrap()
            .get(&target)
            .cloned()
            .expect("target subscribed")
    }

    pub fn set_full_delay(&self, delay: Duration) {
        *self.full_delay.lock().unwrap() = delay;
    }
}

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

pub struct FakeEngine {
    target: TargetId,
    shared: Arc<Shared>,
    date_range: Arc<DateRangeFilter>,
}

impl FakeEngine {
    fn record(&self, kind: CallKind) {
        self.shared.calls.lock().unwrap().push(EngineCall {
            target: self.target,
            kind,
            unbounded: self.date_range.is_unbounded(),
        });
    }
}

#[async_trait]
impl SyncEngine for FakeEngine {
    async fn synchronize(&self) -> Result<EngineReport, SyncError> {
        self.record(CallKind::Full);
        let delay = *self.shared.full_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.shared.unauthorized.load(Ordering::SeqCst) {
            return Err(SyncError::Unauthorized("401".into()));
        }
        if self.shared.server_down.load(Ordering::SeqCst) {
            return Err(SyncError::Server {
                status: 503,
                message: "service unavailable".into(),
            });
        }
        Ok(EngineReport {
            written: Vec::new(),
            failures: self.shared.full_failures.lock().unwrap().clone(),
        })
    }

    async fn synchronize_partial(&self, changes: &[ChangeNotice]) -> Result<EngineReport, SyncError> {
        let mut batch: Vec<(String, u64)> = changes
            .iter()
            .filter_map(|c| c.id.clone().map(|id| (id, c.version)))
            .collect();
        batch.sort();
        self.record(CallKind::Partial(batch.clone()));
        Ok(EngineReport {
            written: batch.into_iter().map(|(id, _)| id).collect(),
            failures: Vec::new(),
        })
    }
}

pub struct FakeSubscription {
    shared: Arc<Shared>,
}

impl Subscription for FakeSubscription {
    fn unsubscribe(self: Box<Self>) {
        self.shared.unsubscribed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct FakeFactory {
    pub shared: Arc<Shared>,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
        }
    }
}

impl EngineFactory for FakeFactory {
    fn create_engine(
        &self,
        target: &Target,
        ctx: EngineContext,
    ) -> Result<Arc<dyn SyncEngine>, SyncError> {
        if self.shared.fail_create.lock().unwrap().contains(&target.url) {
            return Err(SyncError::MissingIdentifier(format!("no folder for {}", target.url)));
        }
        self.shared.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeEngine {
            target: target.id,
            shared: self.shared.clone(),
            date_range: ctx.date_range,
        }))
    }

    fn subscribe(
        &self,
        target: &Target,
        sender: ChangeSender,
    ) -> Result<Option<Box<dyn Subscription>>, SyncError> {
        self.shared.senders.lock().unwrap().insert(target.id, sender);
        Ok(Some(Box::new(FakeSubscription {
            shared: self.shared.clone(),
        })))
    }
}

#[derive(Default)]
pub struct FakeDiscovery {
    pub collections: Mutex<Vec<DiscoveredCollection>>,
}

impl FakeDiscovery {
    pub fn set(&self, collections: Vec<DiscoveredCollection>) {
        *self.collections.lock().unwrap() = collections;
    }
}

#[async_trait]
impl TargetDiscovery for FakeDiscovery {
    async fn discover(&self) -> Result<Vec<DiscoveredCollection>, SyncError> {
        Ok(self.collections.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct FakeFolders {
    pub created: AtomicUsize,
}

impl FakeFolders {
    pub fn default_for(kind: TargetKind) -> FolderRef {
        FolderRef::new(format!("default-{kind}"), "store")
    }
}

impl FolderAllocator for FakeFolders {
    fn default_folder(&self, kind: TargetKind) -> Option<FolderRef> {
        Some(Self::default_for(kind))
    }

    fn create_folder(&self, _kind: TargetKind, name: &str) -> Result<FolderRef, SyncError> {
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        Ok(FolderRef::new(format!("created-{n}-{name}"), "store"))
    }
}

/// Error sink that only records what it was handed.
#[derive(Default)]
pub struct RecordingSink {
    pub reports: Mutex<Vec<(Option<TargetId>, FailureKind)>>,
}

impl RecordingSink {
    pub fn kinds(&self) -> Vec<(Option<TargetId>, FailureKind)> {
        self.reports.lock().unwrap().clone()
    }
}

impl ErrorSink for RecordingSink {
    fn report(&self, target: Option<TargetId>, err: &SyncError) {
        self.reports.lock().unwrap().push((target, err.kind()));
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn target(kind: TargetKind, url: &str) -> Target {
    let mut config = TargetConfig::new(url);
    config.folder = Some(FolderRef::new(format!("folder-{url}"), "store"));
    let collection = collection(kind, url, url);
    Target::from_discovery(config, &collection, false)
}

pub fn collection(kind: TargetKind, url: &str, name: &str) -> DiscoveredCollection {
    DiscoveredCollection {
        url: url.to_string(),
        kind,
        name: name.to_string(),
        ctag: None,
        read_only: false,
    }
}

pub struct Harness {
    pub factory: FakeFactory,
    pub sink: Arc<RecordingSink>,
    pub status: Arc<StatusHandle>,
    pub deps: RunnerDeps,
}

impl Harness {
    pub fn new() -> Self {
        let factory = FakeFactory::new();
        let sink = Arc::new(RecordingSink::default());
        let status = Arc::new(StatusHandle::new());
        let deps = RunnerDeps::new(
            Arc::new(factory.clone()),
            sink.clone(),
            status.clone(),
            Arc::new(NoopInterceptor),
        );
        Self {
            factory,
            sink,
            status,
            deps,
        }
    }

    pub fn shared(&self) -> &Arc<Shared> {
        &self.factory.shared
    }
}

pub struct SessionFakes {
    pub factory: FakeFactory,
    pub discovery: Arc<FakeDiscovery>,
    pub folders: Arc<FakeFolders>,
}

impl SessionFakes {
    pub fn new() -> Self {
        Self {
            factory: FakeFactory::new(),
            discovery: Arc::new(FakeDiscovery::default()),
            folders: Arc::new(FakeFolders::default()),
        }
    }

    pub fn deps(&self) -> SessionDeps {
        SessionDeps {
            factory: Arc::new(self.factory.clone()),
            discovery: self.discovery.clone(),
            folders: self.folders.clone(),
        }
    }
}
