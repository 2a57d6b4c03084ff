//! Enqueuer and serialized worker driving merge targets toward completion.
//!
//! The enqueuer scans every target on a fixed cadence (or when woken),
//! garbage-collects expired inactive targets and hands due ones to a single
//! worker over a depth-1 channel. The worker finishes one target, including
//! all remote calls, before receiving the next. A target is never queued
//! again while a previous dispatch of it is still pending. Results are
//! written back only while the stored record is still the authorization they
//! were derived from, so a human cancel made mid-flight is kept.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use glu_gitlab::GitlabApi;
use glu_store::RecordStore;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;

use crate::config::to_chrono;
use crate::fingerprint::fingerprint_matches;
use crate::keys::{item_key, target_key, TARGET_PREFIX};
use crate::merge_target::{MergePolicy, MergeTarget, TargetAction};
use crate::{AutoMergeConfig, AutoMergeResult};

/// Work done by one enqueuer pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueReport {
    pub dispatched: usize,
    pub collected: usize,
}

/// What the worker did with one dispatched target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Record gone, inactive or not yet due.
    Skipped,
    /// Merge request could not be fetched; target left untouched.
    FetchFailed,
    Applied {
        action: TargetAction,
        target: MergeTarget,
    },
    /// Unrecognized merge status; target left untouched.
    Ignored { status: String },
    /// Record was cancelled or re-authorized while processing; it was kept.
    Superseded,
}

/// Applies merge policy decisions to stored targets.
#[derive(Clone)]
pub struct TargetProcessor {
    store: Arc<RecordStore>,
    api: Arc<dyn GitlabApi>,
    policy: MergePolicy,
    retention: chrono::Duration,
    in_flight: Arc<Mutex<HashSet<u64>>>,
}

impl TargetProcessor {
    pub fn new(store: Arc<RecordStore>, api: Arc<dyn GitlabApi>, config: &AutoMergeConfig) -> Self {
        Self {
            store,
            api,
            policy: MergePolicy::new(to_chrono(config.retry_delay)),
            retention: to_chrono(config.inactive_retention),
            in_flight: Arc::default(),
        }
    }

    fn in_flight(&self) -> std::sync::MutexGuard<'_, HashSet<u64>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks a dispatched target as handled so later passes may queue it again.
    pub fn release(&self, target_id: u64) {
        self.in_flight().remove(&target_id);
    }

    /// Takes the dispatch slot for `target_id`. None while a previous dispatch is pending.
    fn claim(&self, target_id: u64) -> Option<InFlightClaim<'_>> {
        let inserted = self.in_flight().insert(target_id);
        inserted.then(|| InFlightClaim {
            processor: self,
            target_id,
        })
    }

    pub fn targets(&self) -> AutoMergeResult<Vec<MergeTarget>> {
        Ok(self.store.scan_prefix(TARGET_PREFIX)?)
    }

    /// Collects expired targets, then sends each due target to `dispatch`.
    ///
    /// Sending waits for the worker to accept the previous target. Targets
    /// still pending from an earlier pass are skipped until [`Self::release`].
    /// A closed channel ends the pass early without error.
    pub async fn enqueue_pass(
        &self,
        dispatch: &mpsc::Sender<MergeTarget>,
        now: DateTime<Utc>,
    ) -> AutoMergeResult<EnqueueReport> {
        let (collectable, live): (Vec<_>, Vec<_>) = self
            .targets()?
            .into_iter()
            .partition(|target| target.is_collectable(now, self.retention));

        let mut report = EnqueueReport {
            collected: self.collect_expired(&collectable, now)?,
            ..EnqueueReport::default()
        };

        for target in live.into_iter().filter(|target| target.is_due(now)) {
            let target_id = target.id;
            // Dropping the pass mid-send releases the claim.
            let Some(claim) = self.claim(target_id) else {
                continue;
            };
            if dispatch.send(target).await.is_err() {
                tracing::debug!(target_id, "merge worker is gone; stopping dispatch");
                break;
            }
            claim.handed_over();
            report.dispatched += 1;
        }
        Ok(report)
    }

    /// Deletes `candidates` that are still collectable when re-read in the
    /// deleting transaction. A target re-authorized after the scan survives.
    fn collect_expired(&self, candidates: &[MergeTarget], now: DateTime<Utc>) -> AutoMergeResult<usize> {
        if candidates.is_empty() {
            return Ok(0);
        }
        let keys = candidates
            .iter()
            .map(|target| target_key(target.id))
            .collect::<Vec<_>>();
        let removed = self.store.delete_many_if(
            keys.iter().map(String::as_str),
            |target: &MergeTarget| target.is_collectable(now, self.retention),
        )?;
        tracing::debug!(collected = removed.len(), "collected inactive merge targets");
        Ok(removed.len())
    }

    /// Re-reads target `target_id` and advances it one step.
    #[tracing::instrument(skip(self, now))]
    pub async fn process(
        &self,
        target_id: u64,
        now: DateTime<Utc>,
    ) -> AutoMergeResult<ProcessOutcome> {
        let key = target_key(target_id);
        let Some(target) = self.store.get::<MergeTarget>(&key)? else {
            return Ok(ProcessOutcome::Skipped);
        };
        if !target.is_due(now) {
            return Ok(ProcessOutcome::Skipped);
        }

        let merge_request = match self
            .api
            .get_merge_request(target.project_id, target.merge_request_iid)
            .await
        {
            Ok(merge_request) => merge_request,
            Err(error) => {
                tracing::warn!(error = %error, "failed to fetch merge request");
                return Ok(ProcessOutcome::FetchFailed);
            }
        };
        if let Err(error) = self.store.put(&item_key(merge_request.id), &merge_request) {
            tracing::warn!(error = %error, "failed to cache merge request snapshot");
        }

        let status = merge_request.detailed_merge_status.as_str();
        let transition = self.policy.decide(&target, status, now);
        let (updated, written) = match transition.action {
            TargetAction::Skip => return Ok(ProcessOutcome::Skipped),
            TargetAction::Ignore => {
                tracing::warn!(status, "unrecognized merge status");
                return Ok(ProcessOutcome::Ignored {
                    status: status.to_string(),
                });
            }
            TargetAction::Reschedule | TargetAction::Stop => {
                let written = self.persist(&key, &transition.target)?;
                (transition.target, written)
            }
            TargetAction::VerifyThenApprove => {
                let updated = self.verify_then_approve(transition.target, now).await;
                let written = self.persist_after_remote_step(&key, &updated);
                (updated, written)
            }
            TargetAction::Merge => {
                let updated = self.merge(transition.target, now).await;
                let written = self.persist_after_remote_step(&key, &updated);
                (updated, written)
            }
        };
        if !written {
            tracing::info!(
                status,
                info = %updated.info,
                "merge target changed while processing; keeping stored record"
            );
            return Ok(ProcessOutcome::Superseded);
        }

        tracing::info!(
            status,
            info = %updated.info,
            active = updated.active,
            "merge target updated"
        );
        Ok(ProcessOutcome::Applied {
            action: transition.action,
            target: updated,
        })
    }

    async fn verify_then_approve(&self, target: MergeTarget, now: DateTime<Utc>) -> MergeTarget {
        let diffs = match self
            .api
            .all_merge_request_diffs(target.project_id, target.merge_request_iid)
            .await
        {
            Ok(diffs) => diffs,
            Err(error) => {
                tracing::warn!(error = %error, "failed to pull merge request diff");
                return self.policy.diff_fetch_failed(target, now);
            }
        };
        if !fingerprint_matches(&target.diff_fingerprint, &diffs) {
            tracing::warn!("diff changed since authorization; automation aborted");
            return self.policy.diff_changed(target, now);
        }

        match self
            .api
            .approve_merge_request(target.project_id, target.merge_request_iid)
            .await
        {
            Ok(approval) => {
                tracing::debug!(approvals_left = approval.approvals_left, "merge request approved");
                self.policy.approved(target, now)
            }
            Err(error) => {
                tracing::warn!(error = %error, "failed to approve merge request");
                self.policy.approval_failed(target, now)
            }
        }
    }

    async fn merge(&self, target: MergeTarget, now: DateTime<Utc>) -> MergeTarget {
        match self
            .api
            .accept_merge_request(target.project_id, target.merge_request_iid)
            .await
        {
            Ok(merge_request) => {
                if let Err(error) = self.store.put(&item_key(merge_request.id), &merge_request) {
                    tracing::warn!(error = %error, "failed to cache merged snapshot");
                }
                self.policy.merged(target, now)
            }
            Err(error) => {
                tracing::warn!(error = %error, "failed to merge merge request");
                self.policy.merge_failed(target, now)
            }
        }
    }

    /// Writes `updated` only while the stored record is still the active
    /// authorization it was derived from. Returns false when a human cancelled
    /// or re-authorized with another diff in the meantime.
    fn persist(&self, key: &str, updated: &MergeTarget) -> AutoMergeResult<bool> {
        Ok(self.store.put_if(key, updated, |current: Option<&MergeTarget>| {
            current.is_some_and(|current| {
                current.active && current.diff_fingerprint == updated.diff_fingerprint
            })
        })?)
    }

    // Remote side effects already happened; a failed write is only reported.
    fn persist_after_remote_step(&self, key: &str, target: &MergeTarget) -> bool {
        self.persist(key, target).unwrap_or_else(|error| {
            tracing::error!(error = %error, info = %target.info, "failed to persist merge target");
            true
        })
    }
}

/// Dispatch slot for one target. Released on drop unless handed to the worker.
struct InFlightClaim<'a> {
    processor: &'a TargetProcessor,
    target_id: u64,
}

impl InFlightClaim<'_> {
    /// The worker owns the release from here on.
    fn handed_over(self) {
        std::mem::forget(self);
    }
}

impl Drop for InFlightClaim<'_> {
    fn drop(&mut self) {
        self.processor.release(self.target_id);
    }
}

/// Releases targets accepted by the channel but never received by the worker.
fn release_undelivered(processor: &TargetProcessor, dispatch: &mut mpsc::Receiver<MergeTarget>) {
    dispatch.close();
    while let Ok(snapshot) = dispatch.try_recv() {
        processor.release(snapshot.id);
    }
}

/// Running enqueuer and worker tasks.
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    enqueuer: JoinHandle<()>,
    worker: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Spawns both loops on the current tokio runtime.
    pub fn spawn(processor: TargetProcessor, config: &AutoMergeConfig, wake: Arc<Notify>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (dispatch_tx, dispatch_rx) = mpsc::channel(1);
        let enqueuer = tokio::spawn(run_enqueuer(
            processor.clone(),
            dispatch_tx,
            wake,
            EnqueuerTiming {
                interval: config.enqueue_interval,
                scan_error_backoff: config.scan_error_backoff,
            },
            shutdown_rx.clone(),
        ));
        let worker = tokio::spawn(run_worker(processor, dispatch_rx, shutdown_rx));
        Self {
            shutdown_tx,
            enqueuer,
            worker,
        }
    }

    /// Signals both loops and waits for them. An in-flight target finishes first.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(error) = self.enqueuer.await {
            tracing::warn!(error = %error, "merge enqueuer task failed");
        }
        if let Err(error) = self.worker.await {
            tracing::warn!(error = %error, "merge worker task failed");
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct EnqueuerTiming {
    interval: Duration,
    scan_error_backoff: Duration,
}

fn shutdown_requested(changed: Result<(), watch::error::RecvError>, rx: &watch::Receiver<bool>) -> bool {
    changed.is_err() || *rx.borrow()
}

async fn run_enqueuer(
    processor: TargetProcessor,
    dispatch: mpsc::Sender<MergeTarget>,
    wake: Arc<Notify>,
    timing: EnqueuerTiming,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(timing.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if shutdown_requested(changed, &shutdown) {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
            _ = wake.notified() => {}
        }

        let pass = tokio::select! {
            changed = shutdown.changed() => {
                if shutdown_requested(changed, &shutdown) {
                    break;
                }
                continue;
            }
            pass = processor.enqueue_pass(&dispatch, Utc::now()) => pass,
        };

        match pass {
            Ok(report) if report.dispatched > 0 || report.collected > 0 => {
                tracing::debug!(
                    dispatched = report.dispatched,
                    collected = report.collected,
                    "merge target scan finished"
                );
            }
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(error = %error, "failed to scan merge targets");
                tokio::select! {
                    changed = shutdown.changed() => {
                        if shutdown_requested(changed, &shutdown) {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(timing.scan_error_backoff) => {}
                }
            }
        }
    }
}

async fn run_worker(
    processor: TargetProcessor,
    mut dispatch: mpsc::Receiver<MergeTarget>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let snapshot = tokio::select! {
            changed = shutdown.changed() => {
                if shutdown_requested(changed, &shutdown) {
                    break;
                }
                continue;
            }
            received = dispatch.recv() => match received {
                Some(snapshot) => snapshot,
                None => break,
            },
        };

        match processor.process(snapshot.id, Utc::now()).await {
            Ok(outcome) => tracing::trace!(target_id = snapshot.id, ?outcome, "merge target processed"),
            Err(error) => {
                tracing::warn!(target_id = snapshot.id, error = %error, "failed to process merge target");
            }
        }
        processor.release(snapshot.id);
    }
    release_undelivered(&processor, &mut dispatch);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    use chrono::{DateTime, Duration, TimeZone, Utc};
    use glu_gitlab::MergeRequest;
    use glu_store::RecordStore;
    use tempfile::tempdir;
    use tokio::sync::{mpsc, Notify};

    use super::{release_undelivered, ProcessOutcome, SchedulerHandle, TargetProcessor};
    use crate::fingerprint::diff_fingerprint;
    use crate::keys::{item_key, target_key};
    use crate::merge_target::{MergeTarget, TargetAction, INFO_CLEARED, INFO_DIFF_CHANGED, INFO_ENABLED};
    use crate::test_support::{diff, merge_request, FakeGitlab};
    use crate::AutoMergeConfig;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 17, 9, 0, 0).unwrap()
    }

    struct Fixture {
        _temp: tempfile::TempDir,
        store: Arc<RecordStore>,
        api: Arc<FakeGitlab>,
        processor: TargetProcessor,
    }

    fn fixture_with(config: &AutoMergeConfig) -> Fixture {
        let temp = tempdir().expect("tempdir");
        let store = Arc::new(RecordStore::open(temp.path().join("records.redb")).expect("open"));
        let api = Arc::new(FakeGitlab::default());
        let processor = TargetProcessor::new(store.clone(), api.clone(), config);
        Fixture {
            _temp: temp,
            store,
            api,
            processor,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(&AutoMergeConfig::default())
    }

    /// Seeds a tracked merge request whose reviewed diff is `+value`.
    fn seed(fixture: &Fixture, status: &str) -> MergeTarget {
        let merge_request = merge_request(100, 5, status);
        fixture.api.put_merge_request(merge_request.clone());
        fixture
            .api
            .set_diff_pages(42, 5, vec![vec![diff("a.txt", "+value")]]);
        let target = MergeTarget::authorize(
            &merge_request,
            diff_fingerprint(&[diff("a.txt", "+value")]),
            now() - Duration::seconds(1),
        );
        fixture
            .store
            .put(&target_key(target.id), &target)
            .expect("put target");
        target
    }

    fn stored(fixture: &Fixture) -> MergeTarget {
        fixture
            .store
            .get_required::<MergeTarget>(&target_key(100))
            .expect("target")
    }

    #[tokio::test]
    async fn functional_transient_status_reschedules_and_caches_snapshot() {
        let fixture = fixture();
        seed(&fixture, "ci_still_running");

        let outcome = fixture.processor.process(100, now()).await.expect("process");
        assert!(matches!(
            outcome,
            ProcessOutcome::Applied {
                action: TargetAction::Reschedule,
                ..
            }
        ));
        let target = stored(&fixture);
        assert_eq!(target.latest, Some(now()));
        assert_eq!(target.next, now() + Duration::minutes(1));
        assert_eq!(
            target.info,
            "status ci_still_running - will check again in 1 minute"
        );
        assert!(fixture
            .store
            .get::<MergeRequest>(&item_key(100))
            .expect("get")
            .is_some());
    }

    #[tokio::test]
    async fn functional_matching_diff_is_approved_and_due_immediately() {
        let fixture = fixture();
        seed(&fixture, "not_approved");

        fixture.processor.process(100, now()).await.expect("process");
        let target = stored(&fixture);
        assert_eq!(fixture.api.approve_calls(), 1);
        assert!(target.active);
        assert_eq!(target.next, now());
        assert_eq!(target.latest, Some(now()));
        assert_eq!(target.info, "approved - will try to merge");
    }

    #[tokio::test]
    async fn functional_changed_diff_aborts_without_approval() {
        let fixture = fixture();
        seed(&fixture, "not_approved");
        fixture
            .api
            .set_diff_pages(42, 5, vec![vec![diff("a.txt", "+value")], vec![diff("b.txt", "+sneaky")]]);

        fixture.processor.process(100, now()).await.expect("process");
        let target = stored(&fixture);
        assert_eq!(fixture.api.approve_calls(), 0);
        assert!(!target.active);
        assert_eq!(target.info, INFO_DIFF_CHANGED);
    }

    #[tokio::test]
    async fn functional_mergeable_target_is_merged() {
        let fixture = fixture();
        seed(&fixture, "mergeable");

        fixture.processor.process(100, now()).await.expect("process");
        let target = stored(&fixture);
        assert_eq!(fixture.api.accept_calls(), 1);
        assert!(!target.active);
        assert_eq!(target.info, "merged");
        let snapshot = fixture
            .store
            .get_required::<MergeRequest>(&item_key(100))
            .expect("snapshot");
        assert_eq!(snapshot.state, "merged");
    }

    #[tokio::test]
    async fn functional_blocking_status_stops_without_mutation() {
        let fixture = fixture();
        seed(&fixture, "draft_status");

        fixture.processor.process(100, now()).await.expect("process");
        let target = stored(&fixture);
        assert_eq!(fixture.api.approve_calls(), 0);
        assert_eq!(fixture.api.accept_calls(), 0);
        assert!(!target.active);
        assert_eq!(target.info, "aborted - draft_status");
    }

    #[tokio::test]
    async fn regression_failed_mutations_retry_after_delay() {
        let fixture = fixture();
        seed(&fixture, "not_approved");
        fixture.api.set_fail_approve(true);
        fixture.processor.process(100, now()).await.expect("process");
        let target = stored(&fixture);
        assert!(target.active);
        assert_eq!(target.next, now() + Duration::minutes(1));
        assert_eq!(target.info, "error approving - will check again in 1 minute");

        let fixture = fixture_with(&AutoMergeConfig::default());
        seed(&fixture, "mergeable");
        fixture.api.set_fail_accept(true);
        fixture.processor.process(100, now()).await.expect("process");
        assert_eq!(
            stored(&fixture).info,
            "error merging - will check again in 1 minute"
        );
    }

    #[tokio::test]
    async fn regression_fetch_failure_and_unknown_status_leave_target_untouched() {
        let fixture = fixture();
        let seeded = seed(&fixture, "preparing");
        let outcome = fixture.processor.process(100, now()).await.expect("process");
        assert_eq!(
            outcome,
            ProcessOutcome::Ignored {
                status: "preparing".to_string()
            }
        );
        assert_eq!(stored(&fixture), seeded);

        fixture.api.set_fail_get(true);
        let outcome = fixture.processor.process(100, now()).await.expect("process");
        assert_eq!(outcome, ProcessOutcome::FetchFailed);
        assert_eq!(stored(&fixture), seeded);
    }

    #[tokio::test]
    async fn regression_worker_rereads_record_before_acting() {
        let fixture = fixture();
        let mut target = seed(&fixture, "mergeable");
        target.clear(now());
        fixture
            .store
            .put(&target_key(100), &target)
            .expect("cancel");

        let outcome = fixture.processor.process(100, now()).await.expect("process");
        assert_eq!(outcome, ProcessOutcome::Skipped);
        assert_eq!(fixture.api.accept_calls(), 0);

        let missing = fixture.processor.process(999, now()).await.expect("process");
        assert_eq!(missing, ProcessOutcome::Skipped);
    }

    #[tokio::test]
    async fn functional_enqueue_pass_dispatches_due_and_collects_expired() {
        let fixture = fixture();
        let due = seed(&fixture, "mergeable");

        let mut later = due.clone();
        later.id = 101;
        later.next = now() + Duration::minutes(5);
        let mut expired = due.clone();
        expired.id = 102;
        expired.clear(now() - Duration::minutes(31));
        let mut audit = fixture.processor.policy.diff_changed(due.clone(), now());
        audit.id = 103;
        audit.latest = Some(now() - Duration::days(2));
        for target in [&later, &expired, &audit] {
            fixture
                .store
                .put(&target_key(target.id), target)
                .expect("put");
        }

        let (tx, mut rx) = mpsc::channel(8);
        let report = fixture
            .processor
            .enqueue_pass(&tx, now())
            .await
            .expect("pass");
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.collected, 1);
        assert_eq!(rx.recv().await.map(|target| target.id), Some(100));

        let remaining = fixture
            .processor
            .targets()
            .expect("targets")
            .into_iter()
            .map(|target| target.id)
            .collect::<Vec<_>>();
        assert_eq!(remaining, vec![100, 101, 103]);
    }

    #[tokio::test]
    async fn regression_pending_target_is_not_queued_twice() {
        let fixture = fixture();
        seed(&fixture, "mergeable");
        let (tx, mut rx) = mpsc::channel(8);

        let first = fixture.processor.enqueue_pass(&tx, now()).await.expect("pass");
        let second = fixture.processor.enqueue_pass(&tx, now()).await.expect("pass");
        assert_eq!(first.dispatched, 1);
        assert_eq!(second.dispatched, 0);

        let snapshot = rx.recv().await.expect("dispatched");
        fixture.processor.release(snapshot.id);
        let third = fixture.processor.enqueue_pass(&tx, now()).await.expect("pass");
        assert_eq!(third.dispatched, 1);
    }

    #[tokio::test]
    async fn regression_cancel_during_approval_is_not_overwritten() {
        let fixture = fixture();
        seed(&fixture, "not_approved");
        let store = fixture.store.clone();
        fixture.api.on_mutation(move || {
            let mut target = store
                .get_required::<MergeTarget>(&target_key(100))
                .expect("target");
            target.clear(now());
            store.put(&target_key(100), &target).expect("cancel");
        });

        let outcome = fixture.processor.process(100, now()).await.expect("process");
        assert_eq!(outcome, ProcessOutcome::Superseded);
        assert_eq!(fixture.api.approve_calls(), 1);
        let target = stored(&fixture);
        assert!(!target.active);
        assert_eq!(target.info, INFO_CLEARED);

        let next = fixture.processor.process(100, now()).await.expect("process");
        assert_eq!(next, ProcessOutcome::Skipped);
        assert_eq!(fixture.api.accept_calls(), 0);
    }

    #[tokio::test]
    async fn regression_reauthorization_during_merge_keeps_new_fingerprint() {
        let fixture = fixture();
        let seeded = seed(&fixture, "mergeable");
        let store = fixture.store.clone();
        fixture.api.on_mutation(move || {
            let renewed = MergeTarget::authorize(
                &merge_request(100, 5, "mergeable"),
                "+other\n".to_string(),
                now(),
            );
            store.put(&target_key(100), &renewed).expect("re-authorize");
        });

        let outcome = fixture.processor.process(100, now()).await.expect("process");
        assert_eq!(outcome, ProcessOutcome::Superseded);
        let target = stored(&fixture);
        assert!(target.active);
        assert_eq!(target.info, INFO_ENABLED);
        assert_eq!(target.diff_fingerprint, "+other\n");
        assert_ne!(target.diff_fingerprint, seeded.diff_fingerprint);
    }

    #[tokio::test]
    async fn regression_interrupted_pass_releases_pending_targets() {
        let fixture = fixture();
        let first = seed(&fixture, "mergeable");
        let mut second = first.clone();
        second.id = 101;
        fixture
            .store
            .put(&target_key(second.id), &second)
            .expect("put");

        let (tx, mut rx) = mpsc::channel(1);
        let interrupted = tokio::time::timeout(
            StdDuration::from_millis(50),
            fixture.processor.enqueue_pass(&tx, now()),
        )
        .await;
        assert!(interrupted.is_err(), "second send should block on a full channel");
        release_undelivered(&fixture.processor, &mut rx);
        drop(rx);

        let (tx, mut rx) = mpsc::channel(4);
        let report = fixture
            .processor
            .enqueue_pass(&tx, now())
            .await
            .expect("pass");
        assert_eq!(report.dispatched, 2);
        assert_eq!(rx.recv().await.map(|target| target.id), Some(100));
        assert_eq!(rx.recv().await.map(|target| target.id), Some(101));
    }

    #[tokio::test]
    async fn regression_collection_keeps_target_reauthorized_after_scan() {
        let fixture = fixture();
        let mut expired = seed(&fixture, "mergeable");
        expired.clear(now() - Duration::minutes(31));
        fixture
            .store
            .put(&target_key(100), &expired)
            .expect("put");

        let scanned = fixture.processor.targets().expect("targets");
        let renewed = MergeTarget::authorize(&merge_request(100, 5, "mergeable"), "+value\n".to_string(), now());
        fixture
            .store
            .put(&target_key(100), &renewed)
            .expect("re-authorize");

        let collected = fixture
            .processor
            .collect_expired(&scanned, now())
            .expect("collect");
        assert_eq!(collected, 0);
        assert_eq!(stored(&fixture), renewed);
    }

    #[tokio::test]
    async fn integration_scheduler_approves_then_merges_and_shuts_down() {
        let config = AutoMergeConfig {
            enqueue_interval: StdDuration::from_millis(20),
            ..AutoMergeConfig::default()
        };
        let fixture = fixture_with(&config);
        seed(&fixture, "not_approved");

        let handle = SchedulerHandle::spawn(fixture.processor.clone(), &config, Arc::new(Notify::new()));
        let deadline = tokio::time::Instant::now() + StdDuration::from_secs(5);
        loop {
            if stored(&fixture).info == "merged" {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "target was not merged in time: {:?}",
                stored(&fixture)
            );
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        handle.shutdown().await;

        assert_eq!(fixture.api.approve_calls(), 1);
        assert_eq!(fixture.api.accept_calls(), 1);
        assert!(!stored(&fixture).active);
    }

    #[tokio::test]
    async fn regression_shutdown_returns_promptly_when_idle() {
        let fixture = fixture();
        let handle = SchedulerHandle::spawn(
            fixture.processor.clone(),
            &AutoMergeConfig::default(),
            Arc::new(Notify::new()),
        );
        tokio::time::timeout(StdDuration::from_secs(2), handle.shutdown())
            .await
            .expect("shutdown completes");
    }
}
