//! Per-worker watermark and pending-mention queue.
//!
//! The watermark is durable (Store-backed) and only moves forward. The pending
//! queue is memory only: queued ids are never behind the watermark, so after a
//! restart the same queue is rebuilt by re-reading the Store from the
//! watermark.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use crate::error::StoreError;
use crate::store::Store;

pub struct Debouncer {
    store: Arc<dyn Store>,
    lane: String,
    pending: Mutex<HashMap<String, BTreeSet<i64>>>,
}

impl Debouncer {
    pub fn new(store: Arc<dyn Store>, lane: impl Into<String>) -> Self {
        Self {
            store,
            lane: lane.into(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn lane(&self) -> &str {
        &self.lane
    }

    pub fn watermark(&self, worker_id: &str) -> Result<i64, StoreError> {
        self.store.watermark(worker_id, &self.lane)
    }

    /// Moves the watermark to `message_id` if that is ahead of the current one.
    pub fn update_watermark(&self, worker_id: &str, message_id: i64) -> Result<(), StoreError> {
        let current = self.watermark(worker_id)?;
        if message_id <= current {
            return Ok(());
        }
        tracing::debug!(
            worker = %worker_id,
            from = current,
            to = message_id,
            "Advancing watermark"
        );
        self.store.set_watermark(worker_id, &self.lane, message_id)
    }

    /// Returns false when the id was already queued.
    pub fn queue_mention(&self, worker_id: &str, message_id: i64) -> bool {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        pending
            .entry(worker_id.to_string())
            .or_default()
            .insert(message_id)
    }

    /// Drains the queue in ascending id order.
    pub fn flush_pending(&self, worker_id: &str) -> Vec<i64> {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        pending
            .remove(worker_id)
            .map(|ids| ids.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn pending_count(&self, worker_id: &str) -> usize {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        pending.get(worker_id).map(BTreeSet::len).unwrap_or(0)
    }
}
