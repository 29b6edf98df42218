//! Quota boundary checks and the quota change log.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::clock::{Clock, SystemClock};
use crate::store::OrgStore;
use crate::types::{
    OrgQuotasPatch, Organization, QuotaUpdateRecord, RolloverPool, TimeCounter, period_key,
};
use crate::{LedgerError, Result};

pub fn storage_quota_reached_for(org: &Organization) -> bool {
    let quota = org.quotas.storage_quota;
    quota > 0 && org.bytes_stored >= quota
}

pub fn exec_minutes_quota_reached_for(
    org: &Organization,
    period: &str,
    include_extra: bool,
) -> bool {
    if include_extra
        && (org.gifted_exec_seconds_available > 0 || org.extra_exec_seconds_available > 0)
    {
        return false;
    }
    let quota = org.quotas.max_exec_minutes_per_month;
    if quota == 0 {
        return false;
    }
    org.seconds_in_period(TimeCounter::Monthly, period) / 60 >= quota
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrgUsageReport {
    pub org_id: String,
    pub period: String,
    pub bytes_stored: u64,
    pub bytes_stored_crawls: u64,
    pub bytes_stored_uploads: u64,
    pub bytes_stored_profiles: u64,
    pub storage_quota: u64,
    pub monthly_exec_seconds: u64,
    pub gifted_exec_seconds: u64,
    pub extra_exec_seconds: u64,
    pub max_exec_minutes_per_month: u64,
    pub gifted_exec_seconds_available: u64,
    pub extra_exec_seconds_available: u64,
    pub storage_quota_reached: bool,
    pub exec_minutes_quota_reached: bool,
}

impl OrgUsageReport {
    pub fn from_org(org: &Organization, period: &str) -> Self {
        Self {
            org_id: org.id.clone(),
            period: period.to_string(),
            bytes_stored: org.bytes_stored,
            bytes_stored_crawls: org.bytes_stored_crawls,
            bytes_stored_uploads: org.bytes_stored_uploads,
            bytes_stored_profiles: org.bytes_stored_profiles,
            storage_quota: org.quotas.storage_quota,
            monthly_exec_seconds: org.seconds_in_period(TimeCounter::Monthly, period),
            gifted_exec_seconds: org.seconds_in_period(TimeCounter::Gifted, period),
            extra_exec_seconds: org.seconds_in_period(TimeCounter::Extra, period),
            max_exec_minutes_per_month: org.quotas.max_exec_minutes_per_month,
            gifted_exec_seconds_available: org.gifted_exec_seconds_available,
            extra_exec_seconds_available: org.extra_exec_seconds_available,
            storage_quota_reached: storage_quota_reached_for(org),
            exec_minutes_quota_reached: exec_minutes_quota_reached_for(org, period, true),
        }
    }
}

/// Read-only view over current org counters.
pub struct QuotaGuard {
    orgs: Arc<dyn OrgStore>,
    clock: Arc<dyn Clock>,
}

impl QuotaGuard {
    pub fn new(orgs: Arc<dyn OrgStore>) -> Self {
        Self {
            orgs,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn storage_quota_reached(&self, oid: &str) -> Result<bool> {
        let org = self.orgs.get_org(oid).await?;
        Ok(storage_quota_reached_for(&org))
    }

    pub async fn exec_minutes_quota_reached(&self, oid: &str, include_extra: bool) -> Result<bool> {
        let org = self.orgs.get_org(oid).await?;
        let period = period_key(self.clock.now());
        Ok(exec_minutes_quota_reached_for(&org, &period, include_extra))
    }

    pub async fn usage_report(&self, oid: &str) -> Result<OrgUsageReport> {
        let org = self.orgs.get_org(oid).await?;
        let period = period_key(self.clock.now());
        Ok(OrgUsageReport::from_org(&org, &period))
    }
}

/// Applies a quota patch to an org in place: merge, audit append, retention
/// prune and rollover pool reconciliation. Store backends call this inside
/// their atomic section.
pub fn reconcile_quota_update(
    org: &mut Organization,
    patch: &OrgQuotasPatch,
    modified: OffsetDateTime,
    retention: Option<usize>,
) {
    let previous = org.quotas.clone();
    org.quotas = patch.apply_to(&previous);

    for pool in [RolloverPool::Gifted, RolloverPool::Extra] {
        let Some(new_minutes) = patch.granted_minutes(pool) else {
            continue;
        };
        let prev_minutes = match pool {
            RolloverPool::Gifted => previous.gifted_exec_minutes,
            RolloverPool::Extra => previous.extra_exec_minutes,
        };
        let delta_seconds = (i128::from(new_minutes) - i128::from(prev_minutes)) * 60;
        let delta_seconds = i64::try_from(delta_seconds).unwrap_or(if delta_seconds < 0 {
            i64::MIN
        } else {
            i64::MAX
        });
        let available = org.pool_available_mut(pool);
        *available = crate::types::apply_signed(*available, delta_seconds);
    }

    org.quota_updates.push(QuotaUpdateRecord {
        update: patch.clone(),
        modified,
    });
    if let Some(keep) = retention {
        let keep = keep.max(1);
        let len = org.quota_updates.len();
        if len > keep {
            org.quota_updates.drain(..len - keep);
        }
    }
}

pub struct QuotaUpdateLog {
    orgs: Arc<dyn OrgStore>,
    clock: Arc<dyn Clock>,
    retention: Option<usize>,
}

impl QuotaUpdateLog {
    pub fn new(orgs: Arc<dyn OrgStore>) -> Self {
        Self {
            orgs,
            clock: Arc::new(SystemClock),
            retention: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Keep only the newest `retention` audit records; `None` keeps all.
    pub fn with_retention(mut self, retention: Option<usize>) -> Self {
        self.retention = retention;
        self
    }

    pub async fn apply_quota_update(
        &self,
        oid: &str,
        patch: &OrgQuotasPatch,
    ) -> Result<Organization> {
        if patch.is_empty() {
            return Err(LedgerError::bad_request("no_update_data"));
        }
        let modified = self.clock.now();
        let org = self
            .orgs
            .apply_quota_update(oid, patch, modified, self.retention)
            .await?;
        tracing::info!(
            org_id = oid,
            gifted_available = org.gifted_exec_seconds_available,
            extra_available = org.extra_exec_seconds_available,
            audit_records = org.quota_updates.len(),
            "quota update applied"
        );
        Ok(org)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use crate::types::OrgQuotas;
    use time::macros::datetime;

    fn org() -> Organization {
        let mut org = Organization::new("org-1", "Org");
        org.quotas = OrgQuotas {
            storage_quota: 1000,
            max_exec_minutes_per_month: 10,
            gifted_exec_minutes: 5,
            extra_exec_minutes: 20,
            ..OrgQuotas::default()
        };
        org.gifted_exec_seconds_available = 300;
        org.extra_exec_seconds_available = 100;
        org
    }

    #[test]
    fn storage_quota_zero_is_unlimited() {
        let mut org = Organization::new("org-1", "Org");
        org.bytes_stored = u64::MAX;
        assert!(!storage_quota_reached_for(&org));

        org.quotas.storage_quota = 10;
        org.bytes_stored = 9;
        assert!(!storage_quota_reached_for(&org));
        org.bytes_stored = 10;
        assert!(storage_quota_reached_for(&org));
    }

    #[test]
    fn exec_quota_uses_whole_minutes_and_respects_pools() {
        let mut org = org();
        org.monthly_exec_seconds.insert("2024-05".to_string(), 599);
        assert!(!exec_minutes_quota_reached_for(&org, "2024-05", false));

        org.monthly_exec_seconds.insert("2024-05".to_string(), 600);
        assert!(exec_minutes_quota_reached_for(&org, "2024-05", false));
        assert!(!exec_minutes_quota_reached_for(&org, "2024-05", true));
        assert!(!exec_minutes_quota_reached_for(&org, "2024-06", false));

        org.gifted_exec_seconds_available = 0;
        org.extra_exec_seconds_available = 0;
        assert!(exec_minutes_quota_reached_for(&org, "2024-05", true));

        org.quotas.max_exec_minutes_per_month = 0;
        assert!(!exec_minutes_quota_reached_for(&org, "2024-05", true));
    }

    #[test]
    fn pool_reconciliation_applies_minute_deltas() {
        let mut org = org();
        let patch = OrgQuotasPatch {
            gifted_exec_minutes: Some(10),
            extra_exec_minutes: Some(0),
            ..OrgQuotasPatch::default()
        };
        reconcile_quota_update(&mut org, &patch, datetime!(2024-05-01 0:00 UTC), None);

        assert_eq!(org.quotas.gifted_exec_minutes, 10);
        assert_eq!(org.quotas.extra_exec_minutes, 0);
        assert_eq!(org.quotas.max_exec_minutes_per_month, 10);
        assert_eq!(org.gifted_exec_seconds_available, 600);
        // 100 - 1200 floors at zero.
        assert_eq!(org.extra_exec_seconds_available, 0);
        assert_eq!(org.quota_updates.len(), 1);
        assert_eq!(org.quota_updates[0].update, patch);
    }

    #[test]
    fn pools_untouched_when_field_absent() {
        let mut org = org();
        let patch = OrgQuotasPatch {
            storage_quota: Some(5),
            ..OrgQuotasPatch::default()
        };
        reconcile_quota_update(&mut org, &patch, datetime!(2024-05-01 0:00 UTC), None);
        assert_eq!(org.gifted_exec_seconds_available, 300);
        assert_eq!(org.extra_exec_seconds_available, 100);
        assert_eq!(org.quotas.storage_quota, 5);
    }

    #[test]
    fn retention_keeps_newest_records_in_order() {
        let mut org = org();
        for minutes in 1..=5u64 {
            let patch = OrgQuotasPatch {
                max_pages_per_crawl: Some(minutes),
                ..OrgQuotasPatch::default()
            };
            let modified = datetime!(2024-05-01 0:00 UTC) + time::Duration::minutes(minutes as i64);
            reconcile_quota_update(&mut org, &patch, modified, Some(3));
        }
        let kept: Vec<_> = org
            .quota_updates
            .iter()
            .map(|record| record.update.max_pages_per_crawl)
            .collect();
        assert_eq!(kept, vec![Some(3), Some(4), Some(5)]);
    }

    #[tokio::test]
    async fn empty_patch_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        store.insert_org(&org()).await.expect("insert");
        let log = QuotaUpdateLog::new(store);
        let err = log
            .apply_quota_update("org-1", &OrgQuotasPatch::default())
            .await
            .expect_err("empty");
        assert_eq!(err.reason(), "no_update_data");
        assert_eq!(err.status(), 400);
    }

    #[tokio::test]
    async fn update_log_records_modified_time_from_clock() {
        let store = Arc::new(MemoryStore::new());
        store.insert_org(&org()).await.expect("insert");
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-02 8:30 UTC)));
        let log = QuotaUpdateLog::new(store.clone()).with_clock(clock);

        let patch = OrgQuotasPatch {
            extra_exec_minutes: Some(25),
            ..OrgQuotasPatch::default()
        };
        let updated = log.apply_quota_update("org-1", &patch).await.expect("update");
        assert_eq!(updated.extra_exec_seconds_available, 400);
        assert_eq!(
            updated.quota_updates[0].modified,
            datetime!(2024-05-02 8:30 UTC)
        );

        let stored = store.get_org("org-1").await.expect("org");
        assert_eq!(stored, updated);
    }

    #[tokio::test]
    async fn guard_reports_current_period_usage() {
        let store = Arc::new(MemoryStore::new());
        let mut org = org();
        org.bytes_stored = 1000;
        org.bytes_stored_crawls = 1000;
        org.monthly_exec_seconds.insert("2024-05".to_string(), 120);
        store.insert_org(&org).await.expect("insert");

        let guard = QuotaGuard::new(store)
            .with_clock(Arc::new(ManualClock::new(datetime!(2024-05-20 0:00 UTC))));
        assert!(guard.storage_quota_reached("org-1").await.expect("storage"));
        assert!(!guard.exec_minutes_quota_reached("org-1", false).await.expect("exec"));

        let report = guard.usage_report("org-1").await.expect("report");
        assert_eq!(report.period, "2024-05");
        assert_eq!(report.monthly_exec_seconds, 120);
        assert_eq!(report.bytes_stored_crawls, 1000);
        assert!(report.storage_quota_reached);
        assert!(!report.exec_minutes_quota_reached);
    }
}
