use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use time::macros::datetime;
use warc_ledger::{
    BaseCrawl, CrawlFile, CrawlState, CrawlStore, CrawlType, LedgerMetrics, ManualClock,
    MemoryStore, Organization, PresignedUrlCache, Result, StorageBackend,
};

#[derive(Default)]
struct MintingStorage {
    minted: AtomicU64,
}

impl MintingStorage {
    fn minted(&self) -> u64 {
        self.minted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageBackend for MintingStorage {
    async fn delete_object(&self, _org: &Organization, _file: &CrawlFile) -> Result<bool> {
        Ok(true)
    }

    async fn mint_signed_url(
        &self,
        _org: &Organization,
        file: &CrawlFile,
        ttl_seconds: u64,
    ) -> Result<String> {
        let n = self.minted.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!(
            "https://signed.example/{}?ttl={ttl_seconds}&n={n}",
            file.filename
        ))
    }
}

struct Fixture {
    store: Arc<MemoryStore>,
    storage: Arc<MintingStorage>,
    clock: Arc<ManualClock>,
    metrics: Arc<LedgerMetrics>,
    cache: PresignedUrlCache,
    org: Organization,
}

async fn fixture(ttl_seconds: u64) -> Result<Fixture> {
    let org = Organization::new("org-1", "Org");
    let store = Arc::new(MemoryStore::new());
    let mut crawl = BaseCrawl::new("c1", "org-1", CrawlType::Crawl, CrawlState::Complete);
    crawl.files = vec![CrawlFile::new("a.wacz", 10), CrawlFile::new("b.wacz", 20)];
    store.insert_crawl(&crawl).await?;

    let storage = Arc::new(MintingStorage::default());
    let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 12:00 UTC)));
    let metrics = Arc::new(LedgerMetrics::default());
    let cache = PresignedUrlCache::new(store.clone(), storage.clone())
        .with_clock(clock.clone())
        .with_metrics(metrics.clone())
        .with_ttl_seconds(ttl_seconds);
    Ok(Fixture {
        store,
        storage,
        clock,
        metrics,
        cache,
        org,
    })
}

#[tokio::test]
async fn cached_urls_are_reused_without_minting() -> Result<()> {
    let f = fixture(600).await?;

    let first = f.cache.resolve_crawl(&f.org, "c1").await?;
    assert_eq!(f.storage.minted(), 2);
    assert_eq!(first[0].path, "https://signed.example/a.wacz?ttl=600&n=1");
    assert_eq!(first[0].expire_at, "2024-05-01T12:10:00Z");
    assert_eq!(first[1].crawl_id, "c1");

    f.clock.advance(time::Duration::minutes(5));
    let second = f.cache.resolve_crawl(&f.org, "c1").await?;
    assert_eq!(f.storage.minted(), 2);
    assert_eq!(second, first);

    let snapshot = f.metrics.snapshot();
    assert_eq!(snapshot.presign_minted, 2);
    assert_eq!(snapshot.presign_reused, 2);
    Ok(())
}

#[tokio::test]
async fn expired_urls_are_reminted_and_persisted() -> Result<()> {
    let f = fixture(600).await?;
    f.cache.resolve_crawl(&f.org, "c1").await?;

    // Expiry is exclusive: at exactly expire_at the cached URL is stale.
    f.clock.advance(time::Duration::minutes(10));
    let refreshed = f.cache.resolve_crawl(&f.org, "c1").await?;
    assert_eq!(f.storage.minted(), 4);
    assert_eq!(refreshed[0].path, "https://signed.example/a.wacz?ttl=600&n=3");
    assert_eq!(refreshed[0].expire_at, "2024-05-01T12:20:00Z");

    let stored = f.store.get_crawl("org-1", "c1").await?;
    assert_eq!(
        stored.files[0].presigned_url.as_deref(),
        Some("https://signed.example/a.wacz?ttl=600&n=3")
    );
    assert_eq!(stored.files[0].expire_at, Some(datetime!(2024-05-01 12:20 UTC)));
    Ok(())
}

#[tokio::test]
async fn describe_lists_without_minting() -> Result<()> {
    let f = fixture(600).await?;
    let crawl = f.store.get_crawl("org-1", "c1").await?;

    let listed = f.cache.describe(&crawl.files, "c1");
    assert_eq!(f.storage.minted(), 0);
    assert!(listed.iter().all(|file| file.path.is_empty()));
    assert!(listed.iter().all(|file| file.expire_at.is_empty()));

    f.cache.resolve(&crawl.files[..1], &f.org, "c1").await?;
    let crawl = f.store.get_crawl("org-1", "c1").await?;
    let listed = f.cache.describe(&crawl.files, "c1");
    assert_eq!(listed[0].path, "https://signed.example/a.wacz?ttl=600&n=1");
    assert_eq!(listed[1].path, "");
    assert_eq!(f.storage.minted(), 1);

    f.clock.advance(time::Duration::minutes(10));
    let listed = f.cache.describe(&crawl.files, "c1");
    assert_eq!(listed[0].path, "");
    assert_eq!(listed[0].expire_at, "");
    assert_eq!(f.storage.minted(), 1);
    Ok(())
}

#[tokio::test]
async fn unknown_crawl_is_not_found() -> Result<()> {
    let f = fixture(600).await?;
    let err = f
        .cache
        .resolve_crawl(&f.org, "missing")
        .await
        .expect_err("missing crawl");
    assert_eq!(err.reason(), "crawl_not_found");
    assert_eq!(f.storage.minted(), 0);
    Ok(())
}
