//! Lazily minted, store-cached signed URLs for crawl artifacts.

use std::sync::Arc;

use crate::Result;
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, Env, LedgerConfig};
use crate::observability::LedgerMetrics;
use crate::services::StorageBackend;
use crate::store::CrawlStore;
use crate::types::{CrawlFile, CrawlFileOut, Organization};

/// Upper bound on signed URL lifetime, in minutes (one week less a minute).
pub const PRESIGN_MINUTES_MAX: u64 = 10079;

/// TTL in seconds for a configured duration. Missing means the maximum;
/// values are clamped to `1..=PRESIGN_MINUTES_MAX` minutes.
pub fn presign_duration_seconds(minutes: Option<u64>) -> u64 {
    minutes
        .unwrap_or(PRESIGN_MINUTES_MAX)
        .clamp(1, PRESIGN_MINUTES_MAX)
        * 60
}

pub struct PresignedUrlCache {
    crawls: Arc<dyn CrawlStore>,
    storage: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    metrics: Arc<LedgerMetrics>,
    ttl_seconds: u64,
}

impl PresignedUrlCache {
    pub fn new(crawls: Arc<dyn CrawlStore>, storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            crawls,
            storage,
            clock: Arc::new(SystemClock),
            metrics: Arc::new(LedgerMetrics::default()),
            ttl_seconds: presign_duration_seconds(None),
        }
    }

    /// Cache whose TTL follows `PRESIGN_DURATION_MINUTES`, then
    /// `[presign] duration_minutes`.
    pub fn from_config(
        crawls: Arc<dyn CrawlStore>,
        storage: Arc<dyn StorageBackend>,
        config: &LedgerConfig,
        env: &Env,
    ) -> std::result::Result<Self, ConfigError> {
        let ttl_seconds = config.presign_duration_seconds(env)?;
        Ok(Self::new(crawls, storage).with_ttl_seconds(ttl_seconds))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<LedgerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_ttl_seconds(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }

    /// Descriptors with usable URLs for every file, minting where the cached
    /// entry is missing or expired.
    pub async fn resolve(
        &self,
        files: &[CrawlFile],
        org: &Organization,
        crawl_id: &str,
    ) -> Result<Vec<CrawlFileOut>> {
        let mut out = Vec::with_capacity(files.len());
        for file in files {
            let now = self.clock.now();
            if let Some(url) = file.cached_url(now) {
                self.metrics.record_presign_reused();
                tracing::debug!(crawl_id, filename = %file.filename, "presigned url reused");
                out.push(CrawlFileOut::from_file(file, crawl_id, Some(url)));
                continue;
            }

            let url = self
                .storage
                .mint_signed_url(org, file, self.ttl_seconds)
                .await?;
            let ttl = i64::try_from(self.ttl_seconds).unwrap_or(i64::MAX);
            let expire_at = now.saturating_add(time::Duration::seconds(ttl));
            let applied = self
                .crawls
                .set_file_presigned(crawl_id, &file.filename, &url, expire_at)
                .await?;
            self.metrics.record_presign_minted();
            tracing::debug!(
                crawl_id,
                filename = %file.filename,
                applied,
                "presigned url minted"
            );

            let mut minted = file.clone();
            minted.presigned_url = Some(url);
            minted.expire_at = Some(expire_at);
            out.push(CrawlFileOut::from_file(
                &minted,
                crawl_id,
                minted.presigned_url.as_deref(),
            ));
        }
        Ok(out)
    }

    pub async fn resolve_crawl(
        &self,
        org: &Organization,
        crawl_id: &str,
    ) -> Result<Vec<CrawlFileOut>> {
        let crawl = self.crawls.get_crawl(&org.id, crawl_id).await?;
        self.resolve(&crawl.files, org, crawl_id).await
    }

    /// Listing descriptors without minting: still-valid cached URLs are
    /// included, everything else gets an empty path and expiry.
    pub fn describe(&self, files: &[CrawlFile], crawl_id: &str) -> Vec<CrawlFileOut> {
        let now = self.clock.now();
        files
            .iter()
            .map(|file| CrawlFileOut::from_file(file, crawl_id, file.cached_url(now)))
            .collect()
    }
}
