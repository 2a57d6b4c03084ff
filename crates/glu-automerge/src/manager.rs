use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use glu_gitlab::{GitlabApi, MergeRequest, MergeRequestDiff, Project};
use glu_store::RecordStore;
use tokio::sync::Notify;

use crate::fingerprint::diff_fingerprint;
use crate::keys::{item_key, project_key, target_key, ITEM_PREFIX, PROJECT_PREFIX, TARGET_PREFIX};
use crate::merge_target::MergeTarget;
use crate::scheduler::{SchedulerHandle, TargetProcessor};
use crate::sync::CatalogSync;
use crate::{AutoMergeConfig, AutoMergeResult};

/// Cached merge request joined with its project and automation record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRequestInfo {
    pub merge_request: MergeRequest,
    pub project: Option<Project>,
    pub target: Option<MergeTarget>,
}

impl MergeRequestInfo {
    /// `<project path>!<iid>`, falling back to the numeric project id.
    pub fn human_id(&self) -> String {
        let project = match &self.project {
            Some(project) if !project.path_with_namespace.is_empty() => {
                project.path_with_namespace.clone()
            }
            Some(project) => project.name.clone(),
            None => self.merge_request.project_id.to_string(),
        };
        format!("{project}!{}", self.merge_request.iid)
    }
}

/// Upward API over the catalog cache and merge automation.
pub struct MergeRequestManager {
    store: Arc<RecordStore>,
    api: Arc<dyn GitlabApi>,
    config: AutoMergeConfig,
    sync: CatalogSync,
    processor: TargetProcessor,
    wake: Arc<Notify>,
    started: AtomicBool,
    scheduler: Mutex<Option<SchedulerHandle>>,
}

impl MergeRequestManager {
    pub fn new(
        store: Arc<RecordStore>,
        api: Arc<dyn GitlabApi>,
        config: AutoMergeConfig,
    ) -> AutoMergeResult<Self> {
        config.validate()?;
        Ok(Self {
            sync: CatalogSync::new(store.clone(), api.clone(), &config),
            processor: TargetProcessor::new(store.clone(), api.clone(), &config),
            store,
            api,
            config,
            wake: Arc::new(Notify::new()),
            started: AtomicBool::new(false),
            scheduler: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &AutoMergeConfig {
        &self.config
    }

    /// Refreshes stale caches (the merge request listing always when `force`)
    /// and returns cached merge requests, most recently updated first.
    pub async fn get_or_refresh_items(&self, force: bool) -> AutoMergeResult<Vec<MergeRequestInfo>> {
        let now = Utc::now();
        self.sync.refresh_projects(false, now).await?;
        self.sync
            .refresh_merge_requests(&self.config.filter(), force, now)
            .await?;

        let projects = self
            .store
            .scan_prefix::<Project>(PROJECT_PREFIX)?
            .into_iter()
            .map(|project| (project.id, project))
            .collect::<HashMap<_, _>>();
        let mut targets = self
            .store
            .scan_prefix::<MergeTarget>(TARGET_PREFIX)?
            .into_iter()
            .map(|target| (target.id, target))
            .collect::<HashMap<_, _>>();

        let mut items = self
            .store
            .scan_prefix::<MergeRequest>(ITEM_PREFIX)?
            .into_iter()
            .map(|merge_request| MergeRequestInfo {
                project: projects.get(&merge_request.project_id).cloned(),
                target: targets.remove(&merge_request.id),
                merge_request,
            })
            .collect::<Vec<_>>();
        items.sort_by(|left, right| {
            right
                .merge_request
                .updated_at
                .cmp(&left.merge_request.updated_at)
                .then_with(|| right.merge_request.id.cmp(&left.merge_request.id))
        });
        Ok(items)
    }

    pub fn get_item(&self, id: u64) -> AutoMergeResult<Option<MergeRequest>> {
        Ok(self.store.get(&item_key(id))?)
    }

    pub fn get_project(&self, id: u64) -> AutoMergeResult<Option<Project>> {
        Ok(self.store.get(&project_key(id))?)
    }

    /// Cached projects sorted by display name.
    pub fn projects(&self) -> AutoMergeResult<Vec<Project>> {
        let mut projects = self.store.scan_prefix::<Project>(PROJECT_PREFIX)?;
        projects.sort_by(|left, right| left.name_with_namespace.cmp(&right.name_with_namespace));
        Ok(projects)
    }

    /// Fetches every diff fragment of cached merge request `id`.
    pub async fn pull_diff(&self, id: u64) -> AutoMergeResult<Vec<MergeRequestDiff>> {
        let merge_request = self.store.get_required::<MergeRequest>(&item_key(id))?;
        Ok(self
            .api
            .all_merge_request_diffs(merge_request.project_id, merge_request.iid)
            .await?)
    }

    /// Records a human authorization for `id` bound to the reviewed `diffs`.
    ///
    /// Any previous record for the merge request is replaced and the enqueuer
    /// is woken so processing starts without waiting for the next tick.
    pub fn authorize_and_track(
        &self,
        id: u64,
        diffs: &[MergeRequestDiff],
    ) -> AutoMergeResult<MergeTarget> {
        let merge_request = self.store.get_required::<MergeRequest>(&item_key(id))?;
        let target = MergeTarget::authorize(&merge_request, diff_fingerprint(diffs), Utc::now());
        self.store.put(&target_key(id), &target)?;
        self.wake.notify_one();
        tracing::info!(target_id = id, fragments = diffs.len(), "merge automation authorized");
        Ok(target)
    }

    /// Deactivates automation for `id`, creating a cleared record if none exists.
    ///
    /// Ids that are neither tracked nor cached still get a cleared record.
    pub fn cancel_tracking(&self, id: u64) -> AutoMergeResult<MergeTarget> {
        let now = Utc::now();
        let target = match self.store.get::<MergeTarget>(&target_key(id))? {
            Some(mut target) => {
                target.clear(now);
                target
            }
            None => match self.store.get::<MergeRequest>(&item_key(id))? {
                Some(merge_request) => {
                    let mut target = MergeTarget::authorize(&merge_request, String::new(), now);
                    target.clear(now);
                    target
                }
                None => MergeTarget::cleared(id, now),
            },
        };
        self.store.put(&target_key(id), &target)?;
        tracing::info!(target_id = id, "merge automation cancelled");
        Ok(target)
    }

    pub fn targets(&self) -> AutoMergeResult<Vec<MergeTarget>> {
        self.processor.targets()
    }

    /// Launches the background scheduler once. Returns false when already running.
    pub fn start(&self) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            return false;
        }
        let handle = SchedulerHandle::spawn(self.processor.clone(), &self.config, self.wake.clone());
        match self.scheduler.lock() {
            Ok(mut slot) => *slot = Some(handle),
            Err(poisoned) => *poisoned.into_inner() = Some(handle),
        }
        tracing::info!("merge scheduler started");
        true
    }

    /// Stops the background scheduler and waits for both loops to exit.
    pub async fn shutdown(&self) {
        let handle = match self.scheduler.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.shutdown().await;
            self.started.store(false, Ordering::SeqCst);
            tracing::info!("merge scheduler stopped");
        }
    }
}
