//! Channel-backed dispatch of jobs and notifications.
//!
//! Senders never block or fail the caller; a closed receiver is logged and the
//! message dropped.

use tokio::sync::mpsc;

use crate::services::{BackgroundJobs, DeletionEvent, DeletionNotifier, ReplicaDeletionJob};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Dispatch {
    ReplicaDeletion(ReplicaDeletionJob),
    Deleted(DeletionEvent),
}

#[derive(Clone, Debug)]
pub struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<Dispatch>,
}

impl ChannelDispatcher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Dispatch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, message: Dispatch) {
        if let Err(err) = self.tx.send(message) {
            tracing::warn!(message = ?err.0, "dispatch receiver closed; dropping message");
        }
    }
}

impl BackgroundJobs for ChannelDispatcher {
    fn enqueue_replica_deletion(&self, job: ReplicaDeletionJob) {
        self.send(Dispatch::ReplicaDeletion(job));
    }
}

impl DeletionNotifier for ChannelDispatcher {
    fn notify_deleted(&self, event: DeletionEvent) {
        self.send(Dispatch::Deleted(event));
    }
}
