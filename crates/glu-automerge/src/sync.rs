//! Staleness-gated refresh of the cached project catalog and merge request set.
//!
//! A refresh pages through the full remote listing, upserts every entity,
//! deletes cached entities of the same kind that were not seen, and only then
//! records the refresh timestamp. Any failure leaves the previous timestamp in
//! place so the next call retries from page one.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use glu_core::{format_rfc3339, is_stale, parse_rfc3339};
use glu_gitlab::{GitlabApi, MergeRequestFilter};
use glu_store::RecordStore;

use crate::config::to_chrono;
use crate::keys::{
    item_key, items_resource_id, project_key, timestamp_key, ITEMS_RESOURCE_PREFIX, ITEM_PREFIX,
    PROJECTS_RESOURCE, PROJECT_PREFIX,
};
use crate::{AutoMergeConfig, AutoMergeError, AutoMergeResult};

/// Outcome of one refresh call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// False when the cache was fresh and no remote call was made.
    pub refreshed: bool,
    pub upserted: usize,
    pub deleted: usize,
}

/// Keeps the local cache in step with the remote listings.
#[derive(Clone)]
pub struct CatalogSync {
    store: Arc<RecordStore>,
    api: Arc<dyn GitlabApi>,
    project_ttl: chrono::Duration,
    item_ttl: chrono::Duration,
}

impl CatalogSync {
    pub fn new(store: Arc<RecordStore>, api: Arc<dyn GitlabApi>, config: &AutoMergeConfig) -> Self {
        Self {
            store,
            api,
            project_ttl: to_chrono(config.project_ttl),
            item_ttl: to_chrono(config.item_ttl),
        }
    }

    /// Last successful refresh of `resource_id`. Unreadable timestamps count as missing.
    pub fn last_refresh(&self, resource_id: &str) -> AutoMergeResult<Option<DateTime<Utc>>> {
        let key = timestamp_key(resource_id);
        let Some(raw) = self.store.get_raw(&key)? else {
            return Ok(None);
        };
        let parsed = std::str::from_utf8(&raw)
            .map_err(|error| error.to_string())
            .and_then(|text| parse_rfc3339(text).map_err(|error| error.to_string()));
        match parsed {
            Ok(instant) => Ok(Some(instant)),
            Err(error) => {
                tracing::warn!(key = %key, error = %error, "ignoring unreadable refresh timestamp");
                Ok(None)
            }
        }
    }

    fn record_refresh(&self, resource_id: &str, now: DateTime<Utc>) -> AutoMergeResult<()> {
        self.store
            .put_raw(&timestamp_key(resource_id), format_rfc3339(now).as_bytes())?;
        Ok(())
    }

    /// Refreshes the project catalog when older than the project TTL or when forced.
    pub async fn refresh_projects(
        &self,
        force: bool,
        now: DateTime<Utc>,
    ) -> AutoMergeResult<SyncReport> {
        let last = self.last_refresh(PROJECTS_RESOURCE)?;
        if !force && !is_stale(last, now, self.project_ttl) {
            return Ok(SyncReport::default());
        }

        let mut seen = HashSet::new();
        let mut page = 1_u32;
        loop {
            let chunk = self.api.list_projects(page).await?;
            for project in &chunk.items {
                let key = project_key(project.id);
                self.store.put(&key, project)?;
                seen.insert(key);
            }
            match chunk.next_page {
                Some(next) if next > page => page = next,
                _ => break,
            }
        }

        let deleted = self.delete_unseen(PROJECT_PREFIX, &seen)?;
        self.record_refresh(PROJECTS_RESOURCE, now)?;
        tracing::info!(upserted = seen.len(), deleted, "project catalog refreshed");
        Ok(SyncReport {
            refreshed: true,
            upserted: seen.len(),
            deleted,
        })
    }

    /// Refreshes open merge requests matching `filter` when older than the item TTL or forced.
    pub async fn refresh_merge_requests(
        &self,
        filter: &MergeRequestFilter,
        force: bool,
        now: DateTime<Utc>,
    ) -> AutoMergeResult<SyncReport> {
        if filter.is_empty() {
            return Err(AutoMergeError::MissingFilter);
        }
        let resource_id = items_resource_id(filter);
        let last = self.last_refresh(&resource_id)?;
        if !force && !is_stale(last, now, self.item_ttl) {
            return Ok(SyncReport::default());
        }

        let mut seen = HashSet::new();
        let mut page = 1_u32;
        loop {
            let chunk = self.api.list_merge_requests(filter, page).await?;
            for merge_request in &chunk.items {
                let key = item_key(merge_request.id);
                self.store.put(&key, merge_request)?;
                seen.insert(key);
            }
            match chunk.next_page {
                Some(next) if next > page => page = next,
                _ => break,
            }
        }

        let deleted = self.delete_unseen(ITEM_PREFIX, &seen)?;
        // The item cache now mirrors this filter only; other listings must refetch.
        let own_key = timestamp_key(&resource_id);
        let other_listings = self
            .store
            .scan_prefix_keys(&timestamp_key(ITEMS_RESOURCE_PREFIX))?
            .into_iter()
            .filter(|key| *key != own_key)
            .collect::<Vec<_>>();
        self.store
            .delete_many(other_listings.iter().map(String::as_str))?;
        self.record_refresh(&resource_id, now)?;
        tracing::info!(
            resource = %resource_id,
            upserted = seen.len(),
            deleted,
            "merge requests refreshed"
        );
        Ok(SyncReport {
            refreshed: true,
            upserted: seen.len(),
            deleted,
        })
    }

    fn delete_unseen(&self, prefix: &str, seen: &HashSet<String>) -> AutoMergeResult<usize> {
        let stale = self
            .store
            .scan_prefix_keys(prefix)?
            .into_iter()
            .filter(|key| !seen.contains(key))
            .collect::<Vec<_>>();
        if !stale.is_empty() {
            self.store.delete_many(stale.iter().map(String::as_str))?;
        }
        Ok(stale.len())
    }
}
