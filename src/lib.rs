//! Multi-tenant quota accounting and artifact access for an archival crawling
//! platform: tiered execution-time ledger, presigned URL cache and batched
//! crawl deletion.

mod error;

pub mod clock;
pub mod collections;
pub mod config;
pub mod deletion;
pub mod dispatch;
pub mod ledger;
pub mod observability;
pub mod presign;
pub mod quota;
pub mod services;
pub mod store;
pub mod telemetry;
pub mod types;

#[cfg(feature = "storage-s3")]
pub mod auth;
#[cfg(feature = "storage-s3")]
pub mod storage;

pub use error::{ErrorBody, LedgerError, Result};

pub use clock::{Clock, ManualClock, SystemClock};
pub use collections::{CollectionMembershipSync, MembershipDelta, StoreCollections};
pub use config::{ConfigError, Env, LedgerConfig};
pub use deletion::{DeleteOutcome, DeletionCoordinator};
pub use dispatch::{ChannelDispatcher, Dispatch};
pub use ledger::{ExecAllocation, ExecutionTimeLedger};
pub use observability::{LedgerMetrics, MetricsSnapshot};
pub use presign::{PRESIGN_MINUTES_MAX, PresignedUrlCache};
pub use quota::{OrgUsageReport, QuotaGuard, QuotaUpdateLog};
pub use services::{
    BackgroundJobs, CollectionService, ConfigStats, CrawlOrchestrator, DeletionEvent,
    DeletionNotifier, ReplicaDeletionJob, StopResult, StorageBackend,
};
#[cfg(feature = "store-sqlite")]
pub use store::SqliteStore;
pub use store::{CrawlStore, MemoryStore, OrgStore, StoreError};
pub use types::{
    BaseCrawl, CrawlFile, CrawlFileOut, CrawlState, CrawlType, CrawlUpdate, OrgQuotas,
    OrgQuotasPatch, OrgRole, Organization, StorageKind, StorageRef,
};

#[cfg(feature = "storage-s3")]
pub use storage::S3Storage;
