//! Batched deletion of crawls and uploads.
//!
//! A batch is validated completely, then live crawls are stopped and every
//! backing object deleted. Metadata is only removed once all storage deletes
//! succeeded; the org byte counters and per-config aggregates are corrected in
//! one pass afterwards.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};
use crate::observability::LedgerMetrics;
use crate::quota::storage_quota_reached_for;
use crate::services::{
    BackgroundJobs, ConfigStats, CrawlOrchestrator, DeletionEvent, DeletionNotifier,
    ReplicaDeletionJob, StorageBackend,
};
use crate::store::{CrawlStore, OrgStore};
use crate::types::{BaseCrawl, CrawlType, Organization, StorageKind};
use crate::{LedgerError, Result};

/// Orchestrator error text meaning the crawl job no longer exists.
const STOP_NOT_FOUND: &str = "Not Found";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOutcome {
    pub deleted: u64,
    pub storage_quota_reached: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct ConfigCorrection {
    count: u64,
    size: u64,
}

/// Totals over the crawls a commit actually removed. A crawl already
/// deleted by an overlapping batch contributes nothing.
#[derive(Debug, Default)]
struct Reclaimed {
    size: u64,
    per_config: BTreeMap<String, ConfigCorrection>,
}

impl Reclaimed {
    fn from_removed(batch: &[BaseCrawl], removed: &[String]) -> Self {
        let removed: BTreeSet<&str> = removed.iter().map(String::as_str).collect();
        let mut reclaimed = Self::default();
        for crawl in batch.iter().filter(|crawl| removed.contains(crawl.id.as_str())) {
            let size = crawl.total_file_size();
            reclaimed.size = reclaimed.size.saturating_add(size);
            if let Some(cid) = crawl.cid.as_ref() {
                let entry = reclaimed.per_config.entry(cid.clone()).or_default();
                entry.count += 1;
                entry.size = entry.size.saturating_add(size);
            }
        }
        reclaimed
    }
}

pub struct DeletionCoordinator {
    orgs: Arc<dyn OrgStore>,
    crawls: Arc<dyn CrawlStore>,
    storage: Arc<dyn StorageBackend>,
    orchestrator: Arc<dyn CrawlOrchestrator>,
    config_stats: Arc<dyn ConfigStats>,
    jobs: Arc<dyn BackgroundJobs>,
    notifier: Arc<dyn DeletionNotifier>,
    clock: Arc<dyn Clock>,
    metrics: Arc<LedgerMetrics>,
}

impl DeletionCoordinator {
    pub fn new(
        orgs: Arc<dyn OrgStore>,
        crawls: Arc<dyn CrawlStore>,
        storage: Arc<dyn StorageBackend>,
        orchestrator: Arc<dyn CrawlOrchestrator>,
        config_stats: Arc<dyn ConfigStats>,
        jobs: Arc<dyn BackgroundJobs>,
        notifier: Arc<dyn DeletionNotifier>,
    ) -> Self {
        Self {
            orgs,
            crawls,
            storage,
            orchestrator,
            config_stats,
            jobs,
            notifier,
            clock: Arc::new(SystemClock),
            metrics: Arc::new(LedgerMetrics::default()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<LedgerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Deletes the listed items of one type. Ids of the other type are
    /// skipped; `user_id` of `None` bypasses the ownership check.
    pub async fn delete_crawls(
        &self,
        org: &Organization,
        crawl_ids: &[String],
        crawl_type: CrawlType,
        user_id: Option<&str>,
    ) -> Result<DeleteOutcome> {
        if crawl_ids.is_empty() {
            return Err(LedgerError::NothingToDelete);
        }
        let batch = self.validate(org, crawl_ids, crawl_type, user_id).await?;
        if batch.is_empty() {
            let current = self.orgs.get_org(&org.id).await?;
            return Ok(DeleteOutcome {
                deleted: 0,
                storage_quota_reached: storage_quota_reached_for(&current),
            });
        }

        if let Err(err) = self.reclaim(org, &batch, crawl_type).await {
            self.metrics.record_deletion_aborted();
            tracing::warn!(
                org_id = %org.id,
                crawl_type = %crawl_type,
                batch = batch.len(),
                reason = err.reason(),
                "deletion batch aborted before commit"
            );
            return Err(err);
        }

        self.commit(org, &batch, crawl_type).await
    }

    /// Deletes a mixed list, routing each id by its stored type.
    pub async fn delete_all_types(
        &self,
        org: &Organization,
        crawl_ids: &[String],
        user_id: Option<&str>,
    ) -> Result<DeleteOutcome> {
        let mut crawl_batch = Vec::new();
        let mut upload_batch = Vec::new();
        for crawl_id in crawl_ids {
            let crawl = self.crawls.get_crawl(&org.id, crawl_id).await?;
            match crawl.crawl_type {
                CrawlType::Crawl => crawl_batch.push(crawl.id),
                CrawlType::Upload => upload_batch.push(crawl.id),
            }
        }
        if crawl_batch.is_empty() && upload_batch.is_empty() {
            return Err(LedgerError::NothingToDelete);
        }

        let mut outcome = DeleteOutcome::default();
        for (crawl_type, ids) in [
            (CrawlType::Crawl, crawl_batch),
            (CrawlType::Upload, upload_batch),
        ] {
            if ids.is_empty() {
                continue;
            }
            let sub = self.delete_crawls(org, &ids, crawl_type, user_id).await?;
            outcome.deleted += sub.deleted;
            outcome.storage_quota_reached = sub.storage_quota_reached;
        }

        if outcome.deleted == 0 {
            return Err(LedgerError::not_found("crawl_not_found"));
        }
        Ok(outcome)
    }

    async fn validate(
        &self,
        org: &Organization,
        crawl_ids: &[String],
        crawl_type: CrawlType,
        user_id: Option<&str>,
    ) -> Result<Vec<BaseCrawl>> {
        let mut seen = BTreeSet::new();
        let mut batch = Vec::with_capacity(crawl_ids.len());
        for crawl_id in crawl_ids {
            if !seen.insert(crawl_id.as_str()) {
                continue;
            }
            let crawl = self.crawls.get_crawl(&org.id, crawl_id).await?;
            if crawl.crawl_type != crawl_type {
                continue;
            }
            if let Some(user_id) = user_id {
                let is_creator = crawl.userid.as_deref() == Some(user_id);
                if !is_creator && !org.is_owner(user_id) {
                    return Err(LedgerError::forbidden("not_allowed"));
                }
            }
            batch.push(crawl);
        }
        Ok(batch)
    }

    async fn reclaim(
        &self,
        org: &Organization,
        batch: &[BaseCrawl],
        crawl_type: CrawlType,
    ) -> Result<()> {
        for crawl in batch {
            if crawl_type == CrawlType::Crawl && !crawl.is_finished() {
                self.stop_live_crawl(crawl).await?;
            }

            for file in &crawl.files {
                if !self.storage.delete_object(org, file).await? {
                    return Err(LedgerError::upstream("file_deletion_error"));
                }
                self.jobs.enqueue_replica_deletion(ReplicaDeletionJob {
                    org_id: org.id.clone(),
                    crawl_id: crawl.id.clone(),
                    crawl_type,
                    file: file.clone(),
                });
            }

            self.notifier.notify_deleted(DeletionEvent {
                org_id: org.id.clone(),
                crawl_id: crawl.id.clone(),
                crawl_type,
            });
        }
        Ok(())
    }

    async fn stop_live_crawl(&self, crawl: &BaseCrawl) -> Result<()> {
        let result = self.orchestrator.stop_crawl(&crawl.id, false).await?;
        if result.success {
            return Ok(());
        }
        if result.error.as_deref() == Some(STOP_NOT_FOUND) {
            // The job is already gone; record the crawl as canceled.
            self.crawls
                .mark_canceled(&crawl.id, self.clock.now())
                .await?;
            tracing::info!(crawl_id = %crawl.id, "crawl job missing on stop; marked canceled");
            return Ok(());
        }
        tracing::warn!(
            crawl_id = %crawl.id,
            error = result.error.as_deref().unwrap_or_default(),
            "crawl stop failed"
        );
        Err(LedgerError::upstream("crawl_stop_failed"))
    }

    async fn commit(
        &self,
        org: &Organization,
        batch: &[BaseCrawl],
        crawl_type: CrawlType,
    ) -> Result<DeleteOutcome> {
        let ids: Vec<String> = batch.iter().map(|crawl| crawl.id.clone()).collect();
        let removed = self.crawls.delete_crawls(&org.id, &ids, crawl_type).await?;
        let deleted = removed.len() as u64;
        if removed.len() < ids.len() {
            tracing::info!(
                org_id = %org.id,
                requested = ids.len(),
                removed = removed.len(),
                "some crawls were already removed by an overlapping batch"
            );
        }

        let reclaimed = Reclaimed::from_removed(batch, &removed);
        if reclaimed.size > 0 {
            let size_delta = i64::try_from(reclaimed.size).unwrap_or(i64::MAX);
            self.orgs
                .inc_bytes_stored(&org.id, -size_delta, StorageKind::from(crawl_type))
                .await?;
        }

        for (cid, correction) in &reclaimed.per_config {
            let size = i64::try_from(correction.size).unwrap_or(i64::MAX);
            let count = i64::try_from(correction.count).unwrap_or(i64::MAX);
            if !self.config_stats.recompute_aggregate(cid, -size, -count).await? {
                return Err(LedgerError::not_found("crawl_config_not_found"));
            }
        }

        self.metrics.record_deletion_committed(deleted, reclaimed.size);
        tracing::info!(
            org_id = %org.id,
            crawl_type = %crawl_type,
            deleted,
            bytes = reclaimed.size,
            configs = reclaimed.per_config.len(),
            "deletion batch committed"
        );

        let current = self.orgs.get_org(&org.id).await?;
        Ok(DeleteOutcome {
            deleted,
            storage_quota_reached: storage_quota_reached_for(&current),
        })
    }
}
