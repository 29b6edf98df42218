//! Interfaces to collaborators that live outside this crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::types::{CrawlFile, CrawlType, Organization};

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Returns `false` when the backend refused or could not delete the object.
    async fn delete_object(&self, org: &Organization, file: &CrawlFile) -> Result<bool>;

    async fn mint_signed_url(
        &self,
        org: &Organization,
        file: &CrawlFile,
        ttl_seconds: u64,
    ) -> Result<String>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StopResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait CrawlOrchestrator: Send + Sync {
    async fn stop_crawl(&self, crawl_id: &str, graceful: bool) -> Result<StopResult>;
}

#[async_trait]
pub trait ConfigStats: Send + Sync {
    /// Applies signed size and count corrections to a crawl config's
    /// aggregates. Returns `false` when the config no longer exists.
    async fn recompute_aggregate(&self, cid: &str, size_delta: i64, count_delta: i64)
    -> Result<bool>;
}

#[async_trait]
pub trait CollectionService: Send + Sync {
    async fn add_crawls(
        &self,
        collection_id: &str,
        crawl_ids: &[String],
        org: &Organization,
    ) -> Result<()>;

    async fn remove_crawls(
        &self,
        collection_id: &str,
        crawl_ids: &[String],
        org: &Organization,
    ) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaDeletionJob {
    pub org_id: String,
    pub crawl_id: String,
    pub crawl_type: CrawlType,
    pub file: CrawlFile,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionEvent {
    pub org_id: String,
    pub crawl_id: String,
    pub crawl_type: CrawlType,
}

/// Fire-and-forget: enqueueing never fails the caller.
pub trait BackgroundJobs: Send + Sync {
    fn enqueue_replica_deletion(&self, job: ReplicaDeletionJob);
}

/// Fire-and-forget: delivery failures are the notifier's concern.
pub trait DeletionNotifier: Send + Sync {
    fn notify_deleted(&self, event: DeletionEvent);
}
