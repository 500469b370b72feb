//! Store interface: the source of truth for workers, messages, watermarks and
//! the audit log.
//!
//! The daemon only reads through this trait and requests updates; it never
//! caches presence across a decision. `SqliteStore` is the shipped backend.

mod sqlite;

pub use sqlite::{AuditRow, NewMessage, SqliteStore};

use chrono::{DateTime, Utc};
use relay_protocol::{AuditEvent, Message, Presence, Worker};

use crate::error::StoreError;

pub trait Store: Send + Sync {
    fn list_managed_workers(&self) -> Result<Vec<Worker>, StoreError>;

    fn get_worker(&self, worker_id: &str) -> Result<Option<Worker>, StoreError>;

    fn update_worker_presence(&self, worker_id: &str, presence: Presence)
        -> Result<(), StoreError>;

    fn set_worker_session(&self, worker_id: &str, session_id: &str) -> Result<(), StoreError>;

    fn mark_worker_left(&self, worker_id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Messages in `lane` with id greater than `since` that mention the worker
    /// or reply to it, in ascending id order.
    fn messages_mentioning(
        &self,
        worker_id: &str,
        lane: &str,
        since: i64,
    ) -> Result<Vec<Message>, StoreError>;

    fn get_messages(&self, ids: &[i64]) -> Result<Vec<Message>, StoreError>;

    /// Root message plus replies, oldest first.
    fn get_thread(&self, thread_id: i64) -> Result<Vec<Message>, StoreError>;

    /// Timestamp of the newest message posted by the worker, in any lane.
    fn last_message_from(&self, worker_id: &str) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Sender is human, holds wake-trust for the worker, or owns the thread.
    fn is_wake_authorized(&self, message: &Message, worker_id: &str) -> Result<bool, StoreError>;

    fn watermark(&self, worker_id: &str, lane: &str) -> Result<i64, StoreError>;

    fn set_watermark(&self, worker_id: &str, lane: &str, message_id: i64)
        -> Result<(), StoreError>;

    fn append_audit(&self, event: &AuditEvent) -> Result<(), StoreError>;
}
