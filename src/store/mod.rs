//! Persistence seam for org counters and crawl documents.
//!
//! Every mutating method is a single atomic operation against the backing
//! store. Callers never read a counter, compute, and write it back: pool
//! consumption and monthly crediting are conditional updates that report how
//! much was actually applied.

mod memory;
#[cfg(feature = "store-sqlite")]
mod sqlite;

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;

use crate::types::{
    BaseCrawl, CrawlType, CrawlUpdate, OrgQuotasPatch, Organization, RolloverPool, StorageKind,
    StorageRef, TimeCounter,
};
use crate::{LedgerError, Result};

pub use memory::MemoryStore;
#[cfg(feature = "store-sqlite")]
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[cfg(feature = "store-sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("timestamp error: {0}")]
    Timestamp(String),
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Store(StoreError::Json(err))
    }
}

impl From<tokio::task::JoinError> for LedgerError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Store(StoreError::Join(err))
    }
}

#[cfg(feature = "store-sqlite")]
impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(StoreError::Sqlite(err))
    }
}

#[async_trait]
pub trait OrgStore: Send + Sync {
    async fn insert_org(&self, org: &Organization) -> Result<()>;

    async fn get_org(&self, oid: &str) -> Result<Organization>;

    /// Unbounded add to a per-period seconds map.
    async fn inc_time_counter(
        &self,
        oid: &str,
        counter: TimeCounter,
        period: &str,
        seconds: u64,
    ) -> Result<()>;

    /// Adds up to `seconds` to the monthly map without passing `quota_seconds`.
    /// Returns the seconds actually credited.
    async fn credit_monthly_exec(
        &self,
        oid: &str,
        period: &str,
        seconds: u64,
        quota_seconds: u64,
    ) -> Result<u64>;

    /// Moves `min(seconds, available)` out of a rollover pool into that pool's
    /// per-period map. Returns the seconds actually consumed.
    async fn consume_rollover(
        &self,
        oid: &str,
        pool: RolloverPool,
        period: &str,
        seconds: u64,
    ) -> Result<u64>;

    async fn inc_bytes_stored(&self, oid: &str, delta: i64, kind: StorageKind) -> Result<()>;

    /// Merges the patch, appends the audit record and reconciles rollover pools
    /// in one step. Returns the updated org.
    async fn apply_quota_update(
        &self,
        oid: &str,
        patch: &OrgQuotasPatch,
        modified: OffsetDateTime,
        retention: Option<usize>,
    ) -> Result<Organization>;
}

#[async_trait]
pub trait CrawlStore: Send + Sync {
    async fn insert_crawl(&self, crawl: &BaseCrawl) -> Result<()>;

    async fn get_crawl(&self, oid: &str, crawl_id: &str) -> Result<BaseCrawl>;

    /// Stores a freshly minted URL on one file. An entry already holding a
    /// later expiry is kept; returns whether the write was applied.
    async fn set_file_presigned(
        &self,
        crawl_id: &str,
        filename: &str,
        url: &str,
        expire_at: OffsetDateTime,
    ) -> Result<bool>;

    async fn add_file_replica(
        &self,
        crawl_id: &str,
        filename: &str,
        replica: &StorageRef,
    ) -> Result<()>;

    async fn update_crawl_metadata(
        &self,
        oid: &str,
        crawl_id: &str,
        crawl_type: Option<CrawlType>,
        update: &CrawlUpdate,
    ) -> Result<()>;

    async fn mark_canceled(&self, crawl_id: &str, finished: OffsetDateTime) -> Result<()>;

    async fn add_collection(&self, oid: &str, crawl_id: &str, collection_id: &str) -> Result<()>;

    async fn remove_collection(
        &self,
        oid: &str,
        crawl_id: &str,
        collection_id: &str,
    ) -> Result<()>;

    /// One batched delete of matching documents. Returns the ids this call
    /// removed; ids already gone are not reported.
    async fn delete_crawls(
        &self,
        oid: &str,
        crawl_ids: &[String],
        crawl_type: CrawlType,
    ) -> Result<Vec<String>>;
}

pub(crate) fn org_not_found() -> LedgerError {
    LedgerError::not_found("org_not_found")
}

pub(crate) fn crawl_not_found() -> LedgerError {
    LedgerError::not_found("crawl_not_found")
}

pub(crate) fn apply_crawl_update(crawl: &mut BaseCrawl, update: &CrawlUpdate) {
    if let Some(name) = update.name.as_ref() {
        crawl.name = Some(name.clone());
    }
    if let Some(description) = update.description.as_ref() {
        crawl.description = Some(description.clone());
    }
    if let Some(tags) = update.tags.as_ref() {
        crawl.tags = tags.clone();
    }
}

/// Returns whether the stored entry changed.
pub(crate) fn apply_presigned(
    crawl: &mut BaseCrawl,
    filename: &str,
    url: &str,
    expire_at: OffsetDateTime,
) -> bool {
    let Some(file) = crawl.file_mut(filename) else {
        return false;
    };
    if file.expire_at.is_some_and(|existing| existing > expire_at) {
        return false;
    }
    file.presigned_url = Some(url.to_string());
    file.expire_at = Some(expire_at);
    true
}

pub(crate) fn apply_add_collection(crawl: &mut BaseCrawl, collection_id: &str) -> Result<()> {
    if !crawl.collection_ids.insert(collection_id.to_string()) {
        return Err(LedgerError::conflict("crawl_already_in_collection"));
    }
    Ok(())
}
