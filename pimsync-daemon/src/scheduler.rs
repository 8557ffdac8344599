//! Pass scheduling across targets.
//!
//! The scheduler owns the runner map and runs targets strictly one after
//! another, contacts first, then calendars, then task lists. Passes never
//! overlap: a pass requested while another is active returns `false` without
//! touching anything.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use pimsync_core::{Target, TargetId, TargetKind};
use pimsync_sync::{DateRangeFilter, FailedEntityInfo};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::runner::{RunnerDeps, TargetRunner};

/// Runners in pass order. Replaced wholesale, never mutated in place.
pub type RunnerMap = Vec<Arc<TargetRunner>>;

/// Minimum time between two automatic runs of a target of `kind`.
pub fn auto_sync_interval(kind: TargetKind) -> Duration {
    match kind {
        TargetKind::Calendar | TargetKind::Tasks => Duration::from_secs(60),
        TargetKind::Contacts => Duration::from_secs(30 * 60),
    }
}

pub struct Scheduler {
    deps: RunnerDeps,
    runners: Mutex<Arc<RunnerMap>>,
    pass_running: AtomicBool,
}

impl Scheduler {
    pub fn new(deps: RunnerDeps) -> Self {
        Self {
            deps,
            runners: Mutex::new(Arc::new(Vec::new())),
            pass_running: AtomicBool::new(false),
        }
    }

    pub fn deps(&self) -> &RunnerDeps {
        &self.deps
    }

    /// Current runner map.
    pub fn runners(&self) -> Arc<RunnerMap> {
        self.lock().clone()
    }

    pub fn runner(&self, id: TargetId) -> Option<Arc<TargetRunner>> {
        self.runners().iter().find(|r| r.id() == id).cloned()
    }

    pub fn is_pass_running(&self) -> bool {
        self.pass_running.load(Ordering::Acquire)
    }

    /// Reconcile the runner map with `targets`.
    ///
    /// Runners are reused by target id and created for new ids. Runners whose
    /// id disappeared, or whose settings could not be applied, are canceled
    /// and left out of the new map.
    pub fn apply_settings(&self, targets: &[Target]) {
        let mut ordered: Vec<&Target> = targets.iter().collect();
        ordered.sort_by_key(|t| t.kind.sync_order());

        let current = self.runners();
        let mut next: RunnerMap = Vec::with_capacity(ordered.len());
        for target in ordered {
            if next.iter().any(|r| r.id() == target.id) {
                debug!(target = %target.id, "duplicate target id ignored");
                continue;
            }
            let existing = current.iter().find(|r| r.id() == target.id).cloned();
            let applied = match existing {
                Some(runner) => match runner.update_settings(target) {
                    Ok(()) => Ok(runner),
                    Err(err) => {
                        runner.cancel();
                        Err(err)
                    }
                },
                None => TargetRunner::spawn(target, self.deps.clone()),
            };
            match applied {
                Ok(runner) => next.push(runner),
                Err(err) => {
                    error!(target = %target.id, name = %target.name, error = %err, "cannot apply target settings");
                    self.deps.errors.report(Some(target.id), &err);
                }
            }
        }

        for stale in current.iter() {
            if !next.iter().any(|r| Arc::ptr_eq(r, stale)) {
                info!(target = %stale.id(), "target removed");
                stale.cancel();
            }
        }

        *self.lock() = Arc::new(next);
    }

    /// Cancel every runner and install an empty map.
    pub fn clear_settings(&self) {
        let previous = std::mem::take(&mut *self.lock());
        for runner in previous.iter() {
            runner.cancel();
        }
    }

    /// Run one pass. Returns `true` iff at least one target started work.
    ///
    /// `ctags` holds the remote change tag last reported per target.
    pub async fn run_synchronization(
        &self,
        manual: bool,
        no_date_constraint: bool,
        ctags: &HashMap<TargetId, String>,
    ) -> bool {
        let Some(_pass) = PassGuard::acquire(&self.pass_running) else {
            debug!("pass already running");
            return false;
        };
        let _range = no_date_constraint.then(|| UnboundedDateRange::enable(&self.deps.date_range));

        let time_point = (!manual).then(Instant::now);
        let mut already_ran = HashSet::new();
        let mut started = false;
        while let Some(runner) = self.next_runner(&already_ran, time_point) {
            already_ran.insert(runner.id());
            let ctag = ctags.get(&runner.id()).map(String::as_str).unwrap_or("");
            if runner.run_and_reschedule(manual, ctag).await {
                started = true;
            }
        }
        started
    }

    /// First runner in the current map that is active, has not run in this
    /// pass and, when `time_point` is set, is due for an automatic run.
    fn next_runner(
        &self,
        already_ran: &HashSet<TargetId>,
        time_point: Option<Instant>,
    ) -> Option<Arc<TargetRunner>> {
        self.runners()
            .iter()
            .find(|runner| {
                if already_ran.contains(&runner.id()) || !runner.is_active() {
                    return false;
                }
                match (time_point, runner.last_auto_sync()) {
                    (Some(now), Some(last)) => {
                        now.saturating_duration_since(last) >= auto_sync_interval(runner.kind())
                    }
                    _ => true,
                }
            })
            .cloned()
    }

    /// Re-sync retryable failed entities on the runners that own them.
    /// Entities whose target is gone or inactive only have the attempt
    /// counted. Returns the number of targets asked to retry.
    pub async fn retry_failed(&self, entities: &[FailedEntityInfo]) -> usize {
        let Some(_pass) = PassGuard::acquire(&self.pass_running) else {
            return 0;
        };
        let mut by_target: BTreeMap<TargetId, Vec<&FailedEntityInfo>> = BTreeMap::new();
        for info in entities {
            by_target.entry(info.target).or_default().push(info);
        }

        let mut retried = 0;
        for (target, infos) in by_target {
            match self.runner(target).filter(|r| r.is_active()) {
                Some(runner) => {
                    let ids: Vec<String> = infos.iter().map(|i| i.entity_id.clone()).collect();
                    if runner.retry_entities(&ids).await {
                        retried += 1;
                    }
                }
                None => {
                    for info in infos {
                        self.deps
                            .failed
                            .mark_retried(&info.entity_id, &info.entity_type);
                    }
                }
            }
        }
        retried
    }

    fn lock(&self) -> MutexGuard<'_, Arc<RunnerMap>> {
        self.runners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Holds the pass flag for the lifetime of one pass.
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Lifts the date-range constraint until dropped.
struct UnboundedDateRange<'a>(&'a DateRangeFilter);

impl<'a> UnboundedDateRange<'a> {
    fn enable(filter: &'a DateRangeFilter) -> Self {
        filter.set_unbounded(true);
        Self(filter)
    }
}

impl Drop for UnboundedDateRange<'_> {
    fn drop(&mut self) {
        self.0.set_unbounded(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intervals_per_kind() {
        assert_eq!(auto_sync_interval(TargetKind::Calendar), Duration::from_secs(60));
        assert_eq!(auto_sync_interval(TargetKind::Tasks), Duration::from_secs(60));
        assert_eq!(
            auto_sync_interval(TargetKind::Contacts),
            Duration::from_secs(1800)
        );
    }

    #[test]
    fn pass_guard_is_exclusive_and_released_on_drop() {
        let flag = AtomicBool::new(false);
        let guard = PassGuard::acquire(&flag).expect("first acquire");
        assert!(PassGuard::acquire(&flag).is_none());
        drop(guard);
        assert!(PassGuard::acquire(&flag).is_some());
    }

    #[test]
    fn date_range_restored_on_drop() {
        let filter = DateRangeFilter::default();
        {
            let _guard = UnboundedDateRange::enable(&filter);
            assert!(filter.is_unbounded());
        }
        assert!(!filter.is_unbounded());
    }
}
