//! Top-level entry point of the sync subsystem.
//!
//! The session reconciles discovered collections with the stored target
//! configuration, hands the resulting targets to the [`Scheduler`], and
//! after each pass maintains the invite registry and retries failed
//! entities.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use pimsync_core::{config, FolderRef, SyncConfig, Target, TargetConfig, TargetId};
use pimsync_sync::{
    ConflictInterceptor, EngineFactory, ErrorSink, FailedEntityTracker, FolderAllocator,
    InvitesStore, TargetDiscovery,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::DaemonError;
use crate::paths::{data_dir, target_cache_dir};
use crate::runner::RunnerDeps;
use crate::scheduler::Scheduler;
use crate::status::{CriticalError, StatusErrorSink, StatusHandle};

/// Host-supplied collaborators.
#[derive(Clone)]
pub struct SessionDeps {
    pub factory: Arc<dyn EngineFactory>,
    pub discovery: Arc<dyn TargetDiscovery>,
    pub folders: Arc<dyn FolderAllocator>,
}

/// Serializable view of one configured target.
#[derive(Debug, Clone, Serialize)]
pub struct TargetSummary {
    pub id: TargetId,
    pub kind: String,
    pub name: String,
    pub active: bool,
    pub running: bool,
}

pub struct SessionDriver {
    home: PathBuf,
    data_dir: PathBuf,
    user: Mutex<Option<String>>,
    auto_sync: AtomicBool,
    scheduler: Scheduler,
    status: Arc<StatusHandle>,
    errors: Arc<dyn ErrorSink>,
    invites: Arc<InvitesStore>,
    failed: Arc<FailedEntityTracker>,
    discovery: Arc<dyn TargetDiscovery>,
    folders: Arc<dyn FolderAllocator>,
    ctags: Mutex<HashMap<TargetId, String>>,
    targets: Mutex<Vec<Target>>,
    pass_lock: tokio::sync::Mutex<()>,
}

impl SessionDriver {
    pub fn new(home: &Path, deps: SessionDeps) -> Result<Self, DaemonError> {
        let data_dir = data_dir(home);
        let invites = match InvitesStore::load_at(&data_dir) {
            Ok(store) => store,
            Err(err) => {
                warn!(error = %err, "invite registry unreadable, starting empty");
                InvitesStore::new(&data_dir)
            }
        };
        let invites = Arc::new(invites);
        let auto_sync = config::load_at(home)?.auto_sync;

        let status = Arc::new(StatusHandle::new());
        let errors: Arc<dyn ErrorSink> = Arc::new(StatusErrorSink::new(status.clone()));
        let runner_deps = RunnerDeps::new(
            deps.factory,
            errors.clone(),
            status.clone(),
            Arc::new(ConflictInterceptor::new(invites.clone())),
        );
        let failed = runner_deps.failed.clone();

        Ok(Self {
            home: home.to_path_buf(),
            data_dir,
            user: Mutex::new(None),
            auto_sync: AtomicBool::new(auto_sync),
            scheduler: Scheduler::new(runner_deps),
            status,
            errors,
            invites,
            failed,
            discovery: deps.discovery,
            folders: deps.folders,
            ctags: Mutex::new(HashMap::new()),
            targets: Mutex::new(Vec::new()),
            pass_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn status(&self) -> &Arc<StatusHandle> {
        &self.status
    }

    /// Registry fed by the host's incoming-invite notifier.
    pub fn invites(&self) -> &Arc<InvitesStore> {
        &self.invites
    }

    pub fn failed(&self) -> &Arc<FailedEntityTracker> {
        &self.failed
    }

    pub fn current_user(&self) -> Option<String> {
        lock(&self.user).clone()
    }

    pub fn auto_sync_enabled(&self) -> bool {
        self.auto_sync.load(Ordering::Acquire)
    }

    pub fn targets(&self) -> Vec<Target> {
        lock(&self.targets).clone()
    }

    pub fn target_summaries(&self) -> Vec<TargetSummary> {
        self.targets()
            .into_iter()
            .map(|t| TargetSummary {
                running: self
                    .scheduler
                    .runner(t.id)
                    .is_some_and(|r| r.is_running()),
                id: t.id,
                kind: t.kind.to_string(),
                name: t.name,
                active: t.active,
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Target reconciliation
    // -----------------------------------------------------------------------

    /// Discover remote collections, rebuild the target list against the
    /// stored configuration, and apply it.
    pub async fn update_targets(&self) -> Result<Vec<Target>, DaemonError> {
        let user = self.current_user().ok_or(DaemonError::NotSignedIn)?;
        let collections = self.discovery.discover().await?;
        let config = config::load_at(&self.home)?;

        let mut seen_kinds = HashSet::new();
        let mut targets: Vec<Target> = Vec::with_capacity(collections.len());
        let mut ctags = HashMap::new();
        for collection in &collections {
            let is_primary = seen_kinds.insert(collection.kind);
            let (stored, is_new) = match config.find_by_url(&user, &collection.url) {
                Some(stored) => (stored.clone(), false),
                None => (TargetConfig::new(&collection.url), true),
            };
            let mut target = Target::from_discovery(stored, collection, is_primary);
            if is_new {
                self.assign_folder(&config, &user, &mut target, &targets);
                info!(target = %target.id, name = %target.name, kind = %target.kind, active = target.active, "new target discovered");
            }
            if let Some(ctag) = &collection.ctag {
                ctags.insert(target.id, ctag.clone());
            }
            targets.push(target);
        }

        *lock(&self.ctags) = ctags;
        self.status.set_critical_error(CriticalError::None);
        self.apply_targets(targets.clone())?;
        Ok(targets)
    }

    /// Pick a local folder for a newly discovered target. The primary
    /// collection of each kind takes the store's default folder when nobody
    /// uses it yet; everything else gets a folder of its own. A target left
    /// without folder stays inactive.
    fn assign_folder(
        &self,
        config: &SyncConfig,
        user: &str,
        target: &mut Target,
        siblings: &[Target],
    ) {
        let in_use = |folder: &FolderRef| {
            config
                .targets_for(user)
                .iter()
                .any(|t| t.folder.as_ref() == Some(folder))
                || siblings.iter().any(|t| t.folder.as_ref() == Some(folder))
                || config.is_folder_in_use_by_other_users(user, folder)
        };

        let default = target
            .is_primary
            .then(|| self.folders.default_folder(target.kind))
            .flatten()
            .filter(|folder| !in_use(folder));
        let folder = match default {
            Some(folder) => Some(folder),
            None => match self.folders.create_folder(target.kind, &target.name) {
                Ok(folder) => Some(folder),
                Err(err) => {
                    warn!(name = %target.name, error = %err, "cannot create local folder");
                    None
                }
            },
        };
        target.active = folder.is_some();
        target.folder = folder;
    }

    /// Persist `targets` for the current user, drop entity caches of targets
    /// whose folder changed, and hand the list to the scheduler.
    pub fn apply_targets(&self, targets: Vec<Target>) -> Result<(), DaemonError> {
        let user = self.current_user().ok_or(DaemonError::NotSignedIn)?;
        let previous: HashMap<TargetId, Option<FolderRef>> = config::load_at(&self.home)?
            .targets_for(&user)
            .iter()
            .map(|t| (t.id, t.folder.clone()))
            .collect();

        let stored = config::store_user_targets_at(
            &self.home,
            &user,
            targets.iter().map(Target::config).collect(),
        )?;
        self.auto_sync.store(stored.auto_sync, Ordering::Release);

        for target in &targets {
            if let Some(folder) = previous.get(&target.id) {
                if *folder != target.folder {
                    self.drop_entity_cache(target.id);
                }
            }
        }

        self.scheduler.apply_settings(&targets);
        *lock(&self.targets) = targets;
        Ok(())
    }

    /// Re-apply one changed target.
    pub fn notify_settings_changed(&self, target: Target) -> Result<(), DaemonError> {
        let mut targets = self.targets();
        match targets.iter_mut().find(|t| t.id == target.id) {
            Some(slot) => *slot = target,
            None => targets.push(target),
        }
        self.apply_targets(targets)
    }

    /// Pick up external edits of `targets.yaml`: active flags and folders of
    /// known targets are overlaid from the file, then re-applied.
    pub fn reload_config(&self) -> Result<(), DaemonError> {
        let config = config::load_at(&self.home)?;
        self.auto_sync.store(config.auto_sync, Ordering::Release);
        let Some(user) = self.current_user() else {
            return Ok(());
        };

        let mut targets = self.targets();
        let mut changed = false;
        for target in targets.iter_mut() {
            let Some(stored) = config.find_by_id(&user, target.id) else {
                continue;
            };
            if stored.folder != target.folder {
                self.drop_entity_cache(target.id);
            }
            if stored.active != target.active || stored.folder != target.folder {
                target.active = stored.active;
                target.folder = stored.folder.clone();
                changed = true;
            }
        }
        if changed {
            info!("target configuration changed on disk, re-applying");
            self.scheduler.apply_settings(&targets);
            *lock(&self.targets) = targets;
        }
        Ok(())
    }

    fn drop_entity_cache(&self, target: TargetId) {
        let dir = target_cache_dir(&self.data_dir, target);
        if !dir.exists() {
            return;
        }
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => info!(target = %target, "folder changed, entity cache dropped"),
            Err(err) => warn!(target = %target, error = %err, "cannot drop entity cache"),
        }
    }

    // -----------------------------------------------------------------------
    // Passes
    // -----------------------------------------------------------------------

    /// Run one pass. Returns whether any target started work.
    pub async fn run_synchronization(&self, manual: bool, no_date_constraint: bool) -> bool {
        let Ok(_pass) = self.pass_lock.try_lock() else {
            debug!("pass already running");
            return false;
        };
        if self.current_user().is_none() {
            debug!("no user signed in, skipping pass");
            return false;
        }

        let started_at = std::time::Instant::now();
        let active: Vec<TargetId> = self
            .targets()
            .iter()
            .filter(|t| t.active)
            .map(|t| t.id)
            .collect();
        self.status.on_started(&active);

        if let Err(err) = self.update_targets().await {
            self.report(err);
        }
        let ctags = lock(&self.ctags).clone();
        let started = self
            .scheduler
            .run_synchronization(manual, no_date_constraint, &ctags)
            .await;

        if started {
            info!(
                manual,
                all_dates = no_date_constraint,
                duration_ms = started_at.elapsed().as_millis() as u64,
                "sync pass finished"
            );
            self.invites.clean_up();
            if let Err(err) = self.invites.save() {
                warn!(error = %err, "cannot save invite registry");
            }
            self.retry_failed_entities().await;
        }
        self.status.on_finished();
        started
    }

    pub async fn synchronize_now(&self) -> bool {
        self.run_synchronization(true, false).await
    }

    async fn retry_failed_entities(&self) {
        self.failed.cleanup_old_entities();
        let retryable = self.failed.retryable_entities();
        if retryable.is_empty() {
            return;
        }
        let targets = self.scheduler.retry_failed(&retryable).await;
        debug!(entities = retryable.len(), targets, "failed entity retry pass");
    }

    fn report(&self, err: DaemonError) {
        match err {
            DaemonError::Sync(err) => self.errors.report(None, &err),
            other => warn!(error = %other, "cannot refresh targets"),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// `Some(user)` signs in; `None` signs out, dropping every runner and
    /// resetting status.
    pub fn on_login_changed(&self, user: Option<String>) {
        let previous = std::mem::replace(&mut *lock(&self.user), user.clone());
        match user {
            Some(user) => {
                if previous.as_deref().is_some_and(|p| p != user) {
                    self.clear_session();
                }
                self.status.set_signed_out(false);
                info!(user = %user, "signed in");
            }
            None => {
                self.clear_session();
                self.status.set_signed_out(true);
                self.status.reset();
                info!("signed out");
            }
        }
    }

    fn clear_session(&self) {
        self.scheduler.clear_settings();
        lock(&self.targets).clear();
        lock(&self.ctags).clear();
    }

    /// Release every runner and persist the invite registry.
    pub fn shutdown(&self) -> Result<(), DaemonError> {
        self.scheduler.clear_settings();
        self.invites.save()?;
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
