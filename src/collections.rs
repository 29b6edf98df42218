use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::services::CollectionService;
use crate::store::CrawlStore;
use crate::types::{CrawlType, CrawlUpdate, Organization};
use crate::{LedgerError, Result};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipDelta {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl MembershipDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub fn membership_delta(current: &BTreeSet<String>, requested: &BTreeSet<String>) -> MembershipDelta {
    MembershipDelta {
        added: requested.difference(current).cloned().collect(),
        removed: current.difference(requested).cloned().collect(),
    }
}

pub struct CollectionMembershipSync {
    crawls: Arc<dyn CrawlStore>,
    collections: Arc<dyn CollectionService>,
}

impl CollectionMembershipSync {
    pub fn new(crawls: Arc<dyn CrawlStore>, collections: Arc<dyn CollectionService>) -> Self {
        Self {
            crawls,
            collections,
        }
    }

    /// Sends only the membership changes to the collection service.
    pub async fn reconcile_membership(
        &self,
        crawl_id: &str,
        org: &Organization,
        requested: &[String],
    ) -> Result<MembershipDelta> {
        let crawl = self.crawls.get_crawl(&org.id, crawl_id).await?;
        let requested: BTreeSet<String> = requested.iter().cloned().collect();
        let delta = membership_delta(&crawl.collection_ids, &requested);

        let crawl_ids = [crawl_id.to_string()];
        for collection_id in &delta.added {
            self.collections
                .add_crawls(collection_id, &crawl_ids, org)
                .await?;
        }
        for collection_id in &delta.removed {
            self.collections
                .remove_crawls(collection_id, &crawl_ids, org)
                .await?;
        }
        if !delta.is_empty() {
            tracing::debug!(
                crawl_id,
                added = delta.added.len(),
                removed = delta.removed.len(),
                "collection membership reconciled"
            );
        }
        Ok(delta)
    }

    pub async fn update_crawl(
        &self,
        crawl_id: &str,
        org: &Organization,
        update: &CrawlUpdate,
        crawl_type: Option<CrawlType>,
    ) -> Result<()> {
        if update.is_empty() {
            return Err(LedgerError::bad_request("no_update_data"));
        }
        let crawl = self.crawls.get_crawl(&org.id, crawl_id).await?;
        if crawl_type.is_some_and(|wanted| wanted != crawl.crawl_type) {
            return Err(LedgerError::not_found("crawl_not_found"));
        }

        if let Some(collection_ids) = update.collection_ids.as_deref() {
            self.reconcile_membership(crawl_id, org, collection_ids)
                .await?;
        }
        if update.has_metadata() {
            self.crawls
                .update_crawl_metadata(&org.id, crawl_id, crawl_type, update)
                .await?;
        }
        Ok(())
    }
}

/// Collection service that records membership on the crawl documents.
pub struct StoreCollections {
    crawls: Arc<dyn CrawlStore>,
}

impl StoreCollections {
    pub fn new(crawls: Arc<dyn CrawlStore>) -> Self {
        Self { crawls }
    }
}

#[async_trait]
impl CollectionService for StoreCollections {
    async fn add_crawls(
        &self,
        collection_id: &str,
        crawl_ids: &[String],
        org: &Organization,
    ) -> Result<()> {
        for crawl_id in crawl_ids {
            self.crawls
                .add_collection(&org.id, crawl_id, collection_id)
                .await?;
        }
        Ok(())
    }

    async fn remove_crawls(
        &self,
        collection_id: &str,
        crawl_ids: &[String],
        org: &Organization,
    ) -> Result<()> {
        for crawl_id in crawl_ids {
            self.crawls
                .remove_collection(&org.id, crawl_id, collection_id)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{BaseCrawl, CrawlState};

    #[derive(Default)]
    struct RecordingCollections {
        calls: Mutex<Vec<(String, String)>>,
    }

    impl RecordingCollections {
        fn take(&self) -> Vec<(String, String)> {
            std::mem::take(&mut *self.calls.lock().expect("lock"))
        }
    }

    #[async_trait]
    impl CollectionService for RecordingCollections {
        async fn add_crawls(
            &self,
            collection_id: &str,
            _crawl_ids: &[String],
            _org: &Organization,
        ) -> Result<()> {
            self.calls
                .lock()
                .expect("lock")
                .push(("add".to_string(), collection_id.to_string()));
            Ok(())
        }

        async fn remove_crawls(
            &self,
            collection_id: &str,
            _crawl_ids: &[String],
            _org: &Organization,
        ) -> Result<()> {
            self.calls
                .lock()
                .expect("lock")
                .push(("remove".to_string(), collection_id.to_string()));
            Ok(())
        }
    }

    fn ids(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|id| id.to_string()).collect()
    }

    async fn store_with_crawl(collections: &[&str]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let mut crawl = BaseCrawl::new("c1", "org-1", CrawlType::Crawl, CrawlState::Complete);
        crawl.collection_ids = collections.iter().map(|id| id.to_string()).collect();
        store.insert_crawl(&crawl).await.expect("insert");
        store
    }

    #[tokio::test]
    async fn only_the_difference_reaches_the_collection_service() {
        let store = store_with_crawl(&["a", "b"]).await;
        let recorder = Arc::new(RecordingCollections::default());
        let sync = CollectionMembershipSync::new(store, recorder.clone());
        let org = Organization::new("org-1", "Org");

        let delta = sync
            .reconcile_membership("c1", &org, &ids(&["b", "c"]))
            .await
            .expect("reconcile");
        assert_eq!(delta.added, ids(&["c"]));
        assert_eq!(delta.removed, ids(&["a"]));
        assert_eq!(
            recorder.take(),
            vec![
                ("add".to_string(), "c".to_string()),
                ("remove".to_string(), "a".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn store_backed_sync_is_idempotent() {
        let store = store_with_crawl(&["a"]).await;
        let collections = Arc::new(StoreCollections::new(store.clone()));
        let sync = CollectionMembershipSync::new(store.clone(), collections);
        let org = Organization::new("org-1", "Org");

        let first = sync
            .reconcile_membership("c1", &org, &ids(&["b", "c"]))
            .await
            .expect("first");
        assert_eq!(first.added, ids(&["b", "c"]));

        let second = sync
            .reconcile_membership("c1", &org, &ids(&["c", "b"]))
            .await
            .expect("second");
        assert!(second.is_empty());

        let crawl = store.get_crawl("org-1", "c1").await.expect("crawl");
        assert_eq!(crawl.collection_ids.into_iter().collect::<Vec<_>>(), ids(&["b", "c"]));
    }

    #[tokio::test]
    async fn update_crawl_rejects_empty_updates_and_type_mismatch() {
        let store = store_with_crawl(&[]).await;
        let collections = Arc::new(StoreCollections::new(store.clone()));
        let sync = CollectionMembershipSync::new(store.clone(), collections);
        let org = Organization::new("org-1", "Org");

        let err = sync
            .update_crawl("c1", &org, &CrawlUpdate::default(), None)
            .await
            .expect_err("empty");
        assert_eq!(err.reason(), "no_update_data");

        let update = CrawlUpdate {
            name: Some("n".to_string()),
            ..CrawlUpdate::default()
        };
        let err = sync
            .update_crawl("c1", &org, &update, Some(CrawlType::Upload))
            .await
            .expect_err("mismatch");
        assert_eq!(err.status(), 404);
    }

    #[tokio::test]
    async fn update_crawl_writes_metadata_and_membership() {
        let store = store_with_crawl(&["old"]).await;
        let collections = Arc::new(StoreCollections::new(store.clone()));
        let sync = CollectionMembershipSync::new(store.clone(), collections);
        let org = Organization::new("org-1", "Org");

        let update = CrawlUpdate {
            description: Some("desc".to_string()),
            tags: Some(ids(&["t1"])),
            collection_ids: Some(ids(&["new"])),
            ..CrawlUpdate::default()
        };
        sync.update_crawl("c1", &org, &update, Some(CrawlType::Crawl))
            .await
            .expect("update");

        let crawl = store.get_crawl("org-1", "c1").await.expect("crawl");
        assert_eq!(crawl.description.as_deref(), Some("desc"));
        assert_eq!(crawl.tags, ids(&["t1"]));
        assert_eq!(crawl.collection_ids.into_iter().collect::<Vec<_>>(), ids(&["new"]));
    }

    #[tokio::test]
    async fn adding_twice_through_the_service_conflicts() {
        let store = store_with_crawl(&[]).await;
        let collections = StoreCollections::new(store);
        let org = Organization::new("org-1", "Org");
        collections
            .add_crawls("coll", &ids(&["c1"]), &org)
            .await
            .expect("add");
        let err = collections
            .add_crawls("coll", &ids(&["c1"]), &org)
            .await
            .expect_err("dup");
        assert_eq!(err.reason(), "crawl_already_in_collection");
        assert_eq!(err.status(), 409);
    }
}
