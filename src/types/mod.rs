use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{LedgerError, Result};

mod crawl;

pub use crawl::{BaseCrawl, CrawlFile, CrawlFileOut, CrawlState, CrawlUpdate, StorageRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlType {
    Crawl,
    Upload,
}

impl CrawlType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Crawl => "crawl",
            Self::Upload => "upload",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim() {
            "crawl" => Ok(Self::Crawl),
            "upload" => Ok(Self::Upload),
            _ => Err(LedgerError::bad_request("invalid_crawl_type")),
        }
    }
}

impl std::fmt::Display for CrawlType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which `bytesStored*` sub-counter moves together with the total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    Crawl,
    Upload,
    Profile,
}

impl From<CrawlType> for StorageKind {
    fn from(value: CrawlType) -> Self {
        match value {
            CrawlType::Crawl => Self::Crawl,
            CrawlType::Upload => Self::Upload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrgRole {
    Viewer,
    Crawler,
    Owner,
}

/// Per-period seconds maps kept on the org document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeCounter {
    /// Non-exec runtime, unbounded.
    Usage,
    /// Exec runtime, unbounded.
    CrawlExec,
    Monthly,
    Gifted,
    Extra,
}

impl TimeCounter {
    pub const ALL: [TimeCounter; 5] = [
        TimeCounter::Usage,
        TimeCounter::CrawlExec,
        TimeCounter::Monthly,
        TimeCounter::Gifted,
        TimeCounter::Extra,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Usage => "usage",
            Self::CrawlExec => "crawlExecSeconds",
            Self::Monthly => "monthlyExecSeconds",
            Self::Gifted => "giftedExecSeconds",
            Self::Extra => "extraExecSeconds",
        }
    }

    pub fn from_str_opt(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|counter| counter.as_str() == raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RolloverPool {
    Gifted,
    Extra,
}

impl RolloverPool {
    pub fn counter(self) -> TimeCounter {
        match self {
            Self::Gifted => TimeCounter::Gifted,
            Self::Extra => TimeCounter::Extra,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OrgQuotas {
    pub storage_quota: u64,
    pub max_exec_minutes_per_month: u64,
    pub max_concurrent_crawls: u64,
    pub max_pages_per_crawl: u64,
    pub extra_exec_minutes: u64,
    pub gifted_exec_minutes: u64,
}

/// A partial quota change; absent fields keep their previous values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OrgQuotasPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_quota: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_exec_minutes_per_month: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_crawls: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_pages_per_crawl: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_exec_minutes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gifted_exec_minutes: Option<u64>,
}

impl OrgQuotasPatch {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn apply_to(&self, quotas: &OrgQuotas) -> OrgQuotas {
        OrgQuotas {
            storage_quota: self.storage_quota.unwrap_or(quotas.storage_quota),
            max_exec_minutes_per_month: self
                .max_exec_minutes_per_month
                .unwrap_or(quotas.max_exec_minutes_per_month),
            max_concurrent_crawls: self
                .max_concurrent_crawls
                .unwrap_or(quotas.max_concurrent_crawls),
            max_pages_per_crawl: self
                .max_pages_per_crawl
                .unwrap_or(quotas.max_pages_per_crawl),
            extra_exec_minutes: self.extra_exec_minutes.unwrap_or(quotas.extra_exec_minutes),
            gifted_exec_minutes: self
                .gifted_exec_minutes
                .unwrap_or(quotas.gifted_exec_minutes),
        }
    }

    pub fn granted_minutes(&self, pool: RolloverPool) -> Option<u64> {
        match pool {
            RolloverPool::Gifted => self.gifted_exec_minutes,
            RolloverPool::Extra => self.extra_exec_minutes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUpdateRecord {
    pub update: OrgQuotasPatch,
    #[serde(with = "time::serde::rfc3339")]
    pub modified: OffsetDateTime,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Organization {
    pub id: String,
    pub name: String,
    pub users: BTreeMap<String, OrgRole>,
    pub quotas: OrgQuotas,
    pub bytes_stored: u64,
    pub bytes_stored_crawls: u64,
    pub bytes_stored_uploads: u64,
    pub bytes_stored_profiles: u64,
    pub usage: BTreeMap<String, u64>,
    pub crawl_exec_seconds: BTreeMap<String, u64>,
    pub monthly_exec_seconds: BTreeMap<String, u64>,
    pub gifted_exec_seconds: BTreeMap<String, u64>,
    pub extra_exec_seconds: BTreeMap<String, u64>,
    pub extra_exec_seconds_available: u64,
    pub gifted_exec_seconds_available: u64,
    pub quota_updates: Vec<QuotaUpdateRecord>,
}

impl Organization {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_owner(mut self, user_id: impl Into<String>) -> Self {
        self.users.insert(user_id.into(), OrgRole::Owner);
        self
    }

    pub fn is_owner(&self, user_id: &str) -> bool {
        self.users.get(user_id) == Some(&OrgRole::Owner)
    }

    pub fn time_counter(&self, counter: TimeCounter) -> &BTreeMap<String, u64> {
        match counter {
            TimeCounter::Usage => &self.usage,
            TimeCounter::CrawlExec => &self.crawl_exec_seconds,
            TimeCounter::Monthly => &self.monthly_exec_seconds,
            TimeCounter::Gifted => &self.gifted_exec_seconds,
            TimeCounter::Extra => &self.extra_exec_seconds,
        }
    }

    pub fn time_counter_mut(&mut self, counter: TimeCounter) -> &mut BTreeMap<String, u64> {
        match counter {
            TimeCounter::Usage => &mut self.usage,
            TimeCounter::CrawlExec => &mut self.crawl_exec_seconds,
            TimeCounter::Monthly => &mut self.monthly_exec_seconds,
            TimeCounter::Gifted => &mut self.gifted_exec_seconds,
            TimeCounter::Extra => &mut self.extra_exec_seconds,
        }
    }

    pub fn seconds_in_period(&self, counter: TimeCounter, period: &str) -> u64 {
        self.time_counter(counter).get(period).copied().unwrap_or(0)
    }

    pub fn pool_available(&self, pool: RolloverPool) -> u64 {
        match pool {
            RolloverPool::Gifted => self.gifted_exec_seconds_available,
            RolloverPool::Extra => self.extra_exec_seconds_available,
        }
    }

    pub fn pool_available_mut(&mut self, pool: RolloverPool) -> &mut u64 {
        match pool {
            RolloverPool::Gifted => &mut self.gifted_exec_seconds_available,
            RolloverPool::Extra => &mut self.extra_exec_seconds_available,
        }
    }

    /// Moves the total and one sub-counter together; decrements floor at zero.
    pub fn apply_bytes_delta(&mut self, delta: i64, kind: StorageKind) {
        self.bytes_stored = apply_signed(self.bytes_stored, delta);
        let sub = match kind {
            StorageKind::Crawl => &mut self.bytes_stored_crawls,
            StorageKind::Upload => &mut self.bytes_stored_uploads,
            StorageKind::Profile => &mut self.bytes_stored_profiles,
        };
        *sub = apply_signed(*sub, delta);
    }
}

pub(crate) fn apply_signed(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value.saturating_add(delta.unsigned_abs())
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}

/// `"YYYY-MM"` key of the UTC calendar month containing `now`.
pub fn period_key(now: OffsetDateTime) -> String {
    let now = now.to_offset(time::UtcOffset::UTC);
    format!("{:04}-{:02}", now.year(), u8::from(now.month()))
}
