#![cfg(feature = "storage-s3")]

use std::sync::Arc;

use httpmock::{Method::DELETE, MockServer};
use time::macros::datetime;
use warc_ledger::auth::SigV4Signer;
use warc_ledger::config::StorageConfig;
use warc_ledger::{
    CrawlFile, ManualClock, Organization, PresignedUrlCache, Result, S3Storage, StorageBackend,
};

fn can_bind_localhost() -> bool {
    match std::net::TcpListener::bind(("127.0.0.1", 0)) {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => false,
        Err(err) => panic!("failed to bind localhost for httpmock tests: {err}"),
    }
}

fn storage(endpoint: String) -> S3Storage {
    let config = StorageConfig {
        endpoint_url: endpoint,
        bucket: "crawls".to_string(),
        region: "us-east-1".to_string(),
        key_prefix: "archive".to_string(),
        access_endpoint_url: None,
    };
    let signer =
        SigV4Signer::new("AKIDEXAMPLE", "SECRET", None, "us-east-1", "s3").expect("signer");
    S3Storage::new(config, signer)
        .expect("client")
        .with_clock(Arc::new(ManualClock::new(datetime!(2024-05-01 12:00 UTC))))
}

#[tokio::test]
async fn delete_sends_signed_request() -> Result<()> {
    if !can_bind_localhost() {
        return Ok(());
    }
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(DELETE)
                .path("/crawls/archive/org-1/a.wacz")
                .header_exists("authorization")
                .header("x-amz-date", "20240501T120000Z")
                .header("x-amz-content-sha256", EMPTY_SHA256);
            then.status(204);
        })
        .await;

    let storage = storage(server.base_url());
    let org = Organization::new("org-1", "Org");
    let deleted = storage
        .delete_object(&org, &CrawlFile::new("a.wacz", 10))
        .await?;
    mock.assert_async().await;
    assert!(deleted);
    Ok(())
}

#[tokio::test]
async fn rejected_delete_reports_false() -> Result<()> {
    if !can_bind_localhost() {
        return Ok(());
    }
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(DELETE).path("/crawls/archive/org-1/b.wacz");
            then.status(403)
                .header("content-type", "application/xml")
                .body("<Error><Code>AccessDenied</Code></Error>");
        })
        .await;

    let storage = storage(server.base_url());
    let org = Organization::new("org-1", "Org");
    let deleted = storage
        .delete_object(&org, &CrawlFile::new("b.wacz", 10))
        .await?;
    mock.assert_async().await;
    assert!(!deleted);
    Ok(())
}

#[tokio::test]
async fn cache_mints_through_s3_presigning() -> Result<()> {
    let storage = Arc::new(storage("http://minio:9000".to_string()));
    let store = Arc::new(warc_ledger::MemoryStore::new());
    let mut crawl = warc_ledger::BaseCrawl::new(
        "c1",
        "org-1",
        warc_ledger::CrawlType::Upload,
        warc_ledger::CrawlState::Complete,
    );
    crawl.files.push(CrawlFile::new("a.wacz", 10));
    warc_ledger::CrawlStore::insert_crawl(store.as_ref(), &crawl).await?;

    let cache = PresignedUrlCache::new(store, storage)
        .with_clock(Arc::new(ManualClock::new(datetime!(2024-05-01 12:00 UTC))))
        .with_ttl_seconds(3600);
    let org = Organization::new("org-1", "Org");
    let files = cache.resolve_crawl(&org, "c1").await?;

    let expected_prefix =
        "http://minio:9000/crawls/archive/org-1/a.wacz?X-Amz-Algorithm=AWS4-HMAC-SHA256";
    assert!(files[0].path.starts_with(expected_prefix));
    assert!(files[0].path.contains("X-Amz-Expires=3600"));
    assert_eq!(files[0].expire_at, "2024-05-01T13:00:00Z");
    Ok(())
}

const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
