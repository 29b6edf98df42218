//! Execution-time and byte accounting for organizations.
//!
//! Exec seconds are allocated in a fixed order: the monthly base quota, then
//! the gifted rollover pool, then the extra rollover pool. Seconds left over
//! once both pools are empty are reported as `uncredited` and not recorded in
//! any tiered map; only the raw `crawlExecSeconds` counter sees them.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::clock::{Clock, SystemClock};
use crate::observability::LedgerMetrics;
use crate::quota::storage_quota_reached_for;
use crate::store::OrgStore;
use crate::types::{RolloverPool, StorageKind, TimeCounter, period_key};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecAllocation {
    pub period: String,
    pub duration: u64,
    pub monthly: u64,
    pub gifted: u64,
    pub extra: u64,
    pub uncredited: u64,
}

impl ExecAllocation {
    fn untiered(period: String, duration: u64) -> Self {
        Self {
            period,
            duration,
            ..Self::default()
        }
    }

    pub fn credited(&self) -> u64 {
        self.monthly
            .saturating_add(self.gifted)
            .saturating_add(self.extra)
    }
}

/// Seconds that fit under the monthly quota given what is already used.
pub fn monthly_credit(used: u64, seconds: u64, quota_seconds: u64) -> u64 {
    seconds.min(quota_seconds.saturating_sub(used))
}

pub struct ExecutionTimeLedger {
    orgs: Arc<dyn OrgStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<LedgerMetrics>,
}

impl ExecutionTimeLedger {
    pub fn new(orgs: Arc<dyn OrgStore>) -> Self {
        Self {
            orgs,
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

    pub async fn record_usage(
        &self,
        oid: &str,
        duration: u64,
        is_exec_time: bool,
    ) -> Result<ExecAllocation> {
        let period = period_key(self.clock.now());
        let raw_counter = if is_exec_time {
            TimeCounter::CrawlExec
        } else {
            TimeCounter::Usage
        };
        self.orgs
            .inc_time_counter(oid, raw_counter, &period, duration)
            .await?;

        if !is_exec_time {
            return Ok(ExecAllocation::untiered(period, duration));
        }

        let org = self.orgs.get_org(oid).await?;
        let quota_seconds = org.quotas.max_exec_minutes_per_month.saturating_mul(60);
        if quota_seconds == 0
            && org.gifted_exec_seconds_available == 0
            && org.extra_exec_seconds_available == 0
        {
            return Ok(ExecAllocation::untiered(period, duration));
        }

        let mut allocation = ExecAllocation::untiered(period, duration);
        allocation.monthly = self
            .orgs
            .credit_monthly_exec(oid, &allocation.period, duration, quota_seconds)
            .await?;

        let mut over = duration.saturating_sub(allocation.monthly);
        if over > 0 {
            allocation.gifted = self
                .orgs
                .consume_rollover(oid, RolloverPool::Gifted, &allocation.period, over)
                .await?;
            over = over.saturating_sub(allocation.gifted);
        }
        if over > 0 {
            allocation.extra = self
                .orgs
                .consume_rollover(oid, RolloverPool::Extra, &allocation.period, over)
                .await?;
            over = over.saturating_sub(allocation.extra);
        }
        allocation.uncredited = over;

        self.metrics
            .record_exec_credit(allocation.monthly, allocation.gifted, allocation.extra);
        if allocation.uncredited > 0 {
            self.metrics.record_uncredited(allocation.uncredited);
            tracing::warn!(
                org_id = oid,
                period = %allocation.period,
                uncredited = allocation.uncredited,
                "exec seconds exceed monthly quota and rollover pools"
            );
        } else {
            tracing::debug!(
                org_id = oid,
                period = %allocation.period,
                monthly = allocation.monthly,
                gifted = allocation.gifted,
                extra = allocation.extra,
                "exec seconds allocated"
            );
        }
        Ok(allocation)
    }

    /// Adjusts stored bytes (negative to subtract) and reports whether the
    /// storage quota is now reached.
    pub async fn record_bytes_stored(
        &self,
        oid: &str,
        delta: i64,
        kind: StorageKind,
    ) -> Result<bool> {
        self.orgs.inc_bytes_stored(oid, delta, kind).await?;
        let org = self.orgs.get_org(oid).await?;
        Ok(storage_quota_reached_for(&org))
    }
}
