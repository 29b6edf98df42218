use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub monthly_seconds_credited: u64,
    pub gifted_seconds_credited: u64,
    pub extra_seconds_credited: u64,
    pub uncredited_exec_seconds: u64,
    pub presign_reused: u64,
    pub presign_minted: u64,
    pub deletion_batches_committed: u64,
    pub deletion_batches_aborted: u64,
    pub crawls_deleted: u64,
    pub bytes_reclaimed: u64,
}

/// Process-local counters shared by the ledger, presign cache and deletion paths.
#[derive(Debug, Default)]
pub struct LedgerMetrics {
    monthly_seconds_credited: AtomicU64,
    gifted_seconds_credited: AtomicU64,
    extra_seconds_credited: AtomicU64,
    uncredited_exec_seconds: AtomicU64,
    presign_reused: AtomicU64,
    presign_minted: AtomicU64,
    deletion_batches_committed: AtomicU64,
    deletion_batches_aborted: AtomicU64,
    crawls_deleted: AtomicU64,
    bytes_reclaimed: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    if by > 0 {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

impl LedgerMetrics {
    pub fn record_exec_credit(&self, monthly: u64, gifted: u64, extra: u64) {
        bump(&self.monthly_seconds_credited, monthly);
        bump(&self.gifted_seconds_credited, gifted);
        bump(&self.extra_seconds_credited, extra);
    }

    pub fn record_uncredited(&self, seconds: u64) {
        bump(&self.uncredited_exec_seconds, seconds);
    }

    pub fn record_presign_reused(&self) {
        bump(&self.presign_reused, 1);
    }

    pub fn record_presign_minted(&self) {
        bump(&self.presign_minted, 1);
    }

    pub fn record_deletion_committed(&self, crawls: u64, bytes: u64) {
        bump(&self.deletion_batches_committed, 1);
        bump(&self.crawls_deleted, crawls);
        bump(&self.bytes_reclaimed, bytes);
    }

    pub fn record_deletion_aborted(&self) {
        bump(&self.deletion_batches_aborted, 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            monthly_seconds_credited: self.monthly_seconds_credited.load(Ordering::Relaxed),
            gifted_seconds_credited: self.gifted_seconds_credited.load(Ordering::Relaxed),
            extra_seconds_credited: self.extra_seconds_credited.load(Ordering::Relaxed),
            uncredited_exec_seconds: self.uncredited_exec_seconds.load(Ordering::Relaxed),
            presign_reused: self.presign_reused.load(Ordering::Relaxed),
            presign_minted: self.presign_minted.load(Ordering::Relaxed),
            deletion_batches_committed: self.deletion_batches_committed.load(Ordering::Relaxed),
            deletion_batches_aborted: self.deletion_batches_aborted.load(Ordering::Relaxed),
            crawls_deleted: self.crawls_deleted.load(Ordering::Relaxed),
            bytes_reclaimed: self.bytes_reclaimed.load(Ordering::Relaxed),
        }
    }
}
