use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use super::{
    CrawlStore, OrgStore, apply_add_collection, apply_crawl_update, apply_presigned,
    crawl_not_found, org_not_found,
};
use crate::Result;
use crate::ledger::monthly_credit;
use crate::quota::reconcile_quota_update;
use crate::types::{
    BaseCrawl, CrawlState, CrawlType, CrawlUpdate, OrgQuotasPatch, Organization, RolloverPool,
    StorageKind, StorageRef, TimeCounter,
};

#[derive(Default)]
struct Inner {
    orgs: HashMap<String, Organization>,
    crawls: HashMap<String, BaseCrawl>,
}

impl Inner {
    fn org_mut(&mut self, oid: &str) -> Result<&mut Organization> {
        self.orgs.get_mut(oid).ok_or_else(org_not_found)
    }

    fn crawl_mut(&mut self, crawl_id: &str) -> Result<&mut BaseCrawl> {
        self.crawls.get_mut(crawl_id).ok_or_else(crawl_not_found)
    }

    fn org_crawl_mut(&mut self, oid: &str, crawl_id: &str) -> Result<&mut BaseCrawl> {
        match self.crawls.get_mut(crawl_id) {
            Some(crawl) if crawl.oid == oid => Ok(crawl),
            _ => Err(crawl_not_found()),
        }
    }
}

/// Process-local store. One lock covers every document, so each trait call
/// is linearizable.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrgStore for MemoryStore {
    async fn insert_org(&self, org: &Organization) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.orgs.insert(org.id.clone(), org.clone());
        Ok(())
    }

    async fn get_org(&self, oid: &str) -> Result<Organization> {
        let inner = self.inner.lock().await;
        inner.orgs.get(oid).cloned().ok_or_else(org_not_found)
    }

    async fn inc_time_counter(
        &self,
        oid: &str,
        counter: TimeCounter,
        period: &str,
        seconds: u64,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let org = inner.org_mut(oid)?;
        let slot = org
            .time_counter_mut(counter)
            .entry(period.to_string())
            .or_insert(0);
        *slot = slot.saturating_add(seconds);
        Ok(())
    }

    async fn credit_monthly_exec(
        &self,
        oid: &str,
        period: &str,
        seconds: u64,
        quota_seconds: u64,
    ) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let org = inner.org_mut(oid)?;
        let used = org.seconds_in_period(TimeCounter::Monthly, period);
        let credit = monthly_credit(used, seconds, quota_seconds);
        if credit > 0 {
            org.monthly_exec_seconds
                .insert(period.to_string(), used.saturating_add(credit));
        }
        Ok(credit)
    }

    async fn consume_rollover(
        &self,
        oid: &str,
        pool: RolloverPool,
        period: &str,
        seconds: u64,
    ) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let org = inner.org_mut(oid)?;
        let available = org.pool_available(pool);
        let consumed = seconds.min(available);
        if consumed == 0 {
            return Ok(0);
        }
        *org.pool_available_mut(pool) = available - consumed;
        let slot = org
            .time_counter_mut(pool.counter())
            .entry(period.to_string())
            .or_insert(0);
        *slot = slot.saturating_add(consumed);
        Ok(consumed)
    }

    async fn inc_bytes_stored(&self, oid: &str, delta: i64, kind: StorageKind) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.org_mut(oid)?.apply_bytes_delta(delta, kind);
        Ok(())
    }

    async fn apply_quota_update(
        &self,
        oid: &str,
        patch: &OrgQuotasPatch,
        modified: OffsetDateTime,
        retention: Option<usize>,
    ) -> Result<Organization> {
        let mut inner = self.inner.lock().await;
        let org = inner.org_mut(oid)?;
        reconcile_quota_update(org, patch, modified, retention);
        Ok(org.clone())
    }
}

#[async_trait]
impl CrawlStore for MemoryStore {
    async fn insert_crawl(&self, crawl: &BaseCrawl) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.crawls.insert(crawl.id.clone(), crawl.clone());
        Ok(())
    }

    async fn get_crawl(&self, oid: &str, crawl_id: &str) -> Result<BaseCrawl> {
        let inner = self.inner.lock().await;
        match inner.crawls.get(crawl_id) {
            Some(crawl) if crawl.oid == oid => Ok(crawl.clone()),
            _ => Err(crawl_not_found()),
        }
    }

    async fn set_file_presigned(
        &self,
        crawl_id: &str,
        filename: &str,
        url: &str,
        expire_at: OffsetDateTime,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(crawl) = inner.crawls.get_mut(crawl_id) else {
            return Ok(false);
        };
        Ok(apply_presigned(crawl, filename, url, expire_at))
    }

    async fn add_file_replica(
        &self,
        crawl_id: &str,
        filename: &str,
        replica: &StorageRef,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let crawl = inner.crawl_mut(crawl_id)?;
        if let Some(file) = crawl.file_mut(filename) {
            file.replicas.insert(replica.clone());
        }
        Ok(())
    }

    async fn update_crawl_metadata(
        &self,
        oid: &str,
        crawl_id: &str,
        crawl_type: Option<CrawlType>,
        update: &CrawlUpdate,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let crawl = inner.org_crawl_mut(oid, crawl_id)?;
        if crawl_type.is_some_and(|wanted| wanted != crawl.crawl_type) {
            return Err(crawl_not_found());
        }
        apply_crawl_update(crawl, update);
        Ok(())
    }

    async fn mark_canceled(&self, crawl_id: &str, finished: OffsetDateTime) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let crawl = inner.crawl_mut(crawl_id)?;
        crawl.state = CrawlState::Canceled;
        crawl.finished = Some(finished);
        Ok(())
    }

    async fn add_collection(&self, oid: &str, crawl_id: &str, collection_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let crawl = inner.org_crawl_mut(oid, crawl_id)?;
        apply_add_collection(crawl, collection_id)
    }

    async fn remove_collection(
        &self,
        oid: &str,
        crawl_id: &str,
        collection_id: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let crawl = inner.org_crawl_mut(oid, crawl_id)?;
        crawl.collection_ids.remove(collection_id);
        Ok(())
    }

    async fn delete_crawls(
        &self,
        oid: &str,
        crawl_ids: &[String],
        crawl_type: CrawlType,
    ) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().await;
        let mut deleted = Vec::new();
        for crawl_id in crawl_ids {
            let matches = inner
                .crawls
                .get(crawl_id)
                .is_some_and(|crawl| crawl.oid == oid && crawl.crawl_type == crawl_type);
            if matches && inner.crawls.remove(crawl_id).is_some() {
                deleted.push(crawl_id.clone());
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CrawlFile;
    use time::macros::datetime;

    fn crawl_with_file() -> BaseCrawl {
        let mut crawl = BaseCrawl::new("c1", "org-1", CrawlType::Crawl, CrawlState::Complete);
        crawl.files.push(CrawlFile::new("a.wacz", 10));
        crawl
    }

    #[tokio::test]
    async fn consume_rollover_reports_partial_credit() {
        let store = MemoryStore::new();
        let mut org = Organization::new("org-1", "Org");
        org.gifted_exec_seconds_available = 30;
        store.insert_org(&org).await.expect("insert");

        let consumed = store
            .consume_rollover("org-1", RolloverPool::Gifted, "2024-05", 50)
            .await
            .expect("consume");
        assert_eq!(consumed, 30);
        let again = store
            .consume_rollover("org-1", RolloverPool::Gifted, "2024-05", 50)
            .await
            .expect("consume");
        assert_eq!(again, 0);

        let org = store.get_org("org-1").await.expect("org");
        assert_eq!(org.gifted_exec_seconds_available, 0);
        assert_eq!(org.seconds_in_period(TimeCounter::Gifted, "2024-05"), 30);
    }

    #[tokio::test]
    async fn presigned_entry_keeps_later_expiry() {
        let store = MemoryStore::new();
        store.insert_crawl(&crawl_with_file()).await.expect("insert");

        let later = datetime!(2024-05-01 12:00 UTC);
        let earlier = datetime!(2024-05-01 11:00 UTC);
        assert!(store.set_file_presigned("c1", "a.wacz", "u-late", later).await.expect("set"));
        assert!(!store.set_file_presigned("c1", "a.wacz", "u-early", earlier).await.expect("set"));
        assert!(!store.set_file_presigned("c1", "missing.wacz", "u", later).await.expect("set"));

        let crawl = store.get_crawl("org-1", "c1").await.expect("crawl");
        assert_eq!(crawl.files[0].presigned_url.as_deref(), Some("u-late"));
        assert_eq!(crawl.files[0].expire_at, Some(later));
    }

    #[tokio::test]
    async fn crawls_are_scoped_to_their_org() {
        let store = MemoryStore::new();
        store.insert_crawl(&crawl_with_file()).await.expect("insert");
        let err = store.get_crawl("org-2", "c1").await.expect_err("other org");
        assert_eq!(err.reason(), "crawl_not_found");

        let deleted = store
            .delete_crawls("org-2", &["c1".to_string()], CrawlType::Crawl)
            .await
            .expect("delete");
        assert!(deleted.is_empty());
        let deleted = store
            .delete_crawls("org-1", &["c1".to_string()], CrawlType::Upload)
            .await
            .expect("delete");
        assert!(deleted.is_empty());
        let deleted = store
            .delete_crawls("org-1", &["c1".to_string(), "c1".to_string()], CrawlType::Crawl)
            .await
            .expect("delete");
        assert_eq!(deleted, vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn replicas_have_set_semantics() {
        let store = MemoryStore::new();
        store.insert_crawl(&crawl_with_file()).await.expect("insert");
        let replica = StorageRef::new("backup");
        store.add_file_replica("c1", "a.wacz", &replica).await.expect("add");
        store.add_file_replica("c1", "a.wacz", &replica).await.expect("add");

        let crawl = store.get_crawl("org-1", "c1").await.expect("crawl");
        assert_eq!(crawl.files[0].replicas.len(), 1);
    }
}
