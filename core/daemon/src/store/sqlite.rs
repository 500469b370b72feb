//! SQLite persistence for relay.
//!
//! Connection-per-call against a WAL database. Every worker mutation also
//! lands in the append-only `audit` table. Schema mismatches surface as
//! `StoreError::Schema` so the daemon can stop instead of guessing.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use relay_protocol::{
    AuditEvent, InvokeSettings, Message, ParticipantKind, Presence, Worker,
};
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension, Row};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use super::Store;
use crate::error::StoreError;

const SCHEMA_VERSION: i64 = 1;

static RE_MENTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@([A-Za-z0-9][A-Za-z0-9_.\-]*)").expect("mention regex"));

const MESSAGE_COLUMNS: &str = "id, lane, sender, body, thread_id, reply_to, created_at";
const WORKER_COLUMNS: &str =
    "id, kind, managed, presence, session_id, last_heartbeat, left_at, invoke";

pub struct SqliteStore {
    path: PathBuf,
}

/// A message about to be appended to the log.
#[derive(Debug, Clone, Default)]
pub struct NewMessage<'a> {
    pub lane: &'a str,
    pub sender: &'a str,
    pub body: &'a str,
    pub thread_id: Option<i64>,
    pub reply_to: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct AuditRow {
    pub id: i64,
    pub recorded_at: String,
    pub worker_id: String,
    pub kind: String,
    pub payload: serde_json::Value,
}

impl SqliteStore {
    pub fn new(path: PathBuf) -> Result<Self, StoreError> {
        let store = Self { path };
        store.init_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates or updates a participant without touching its presence.
    pub fn upsert_worker(
        &self,
        worker_id: &str,
        kind: ParticipantKind,
        managed: bool,
        invoke: &InvokeSettings,
    ) -> Result<(), StoreError> {
        let invoke_json = serde_json::to_string(invoke)
            .map_err(|err| StoreError::Unavailable(format!("Failed to encode invoke: {}", err)))?;
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO workers (id, kind, managed, presence, invoke) \
                 VALUES (?1, ?2, ?3, 'idle', ?4) \
                 ON CONFLICT(id) DO UPDATE SET \
                    kind = excluded.kind, \
                    managed = excluded.managed, \
                    invoke = excluded.invoke",
                params![worker_id, kind.as_str(), managed, invoke_json],
            )
            .map_err(|err| classify(err, "Failed to upsert worker"))?;
            Ok(())
        })
    }

    pub fn list_workers(&self) -> Result<Vec<Worker>, StoreError> {
        self.with_connection(|conn| {
            let sql = format!("SELECT {} FROM workers ORDER BY id ASC", WORKER_COLUMNS);
            query_workers(conn, &sql, [])
        })
    }

    pub fn record_heartbeat(&self, worker_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            let changed = conn
                .execute(
                    "UPDATE workers SET last_heartbeat = ?2 WHERE id = ?1",
                    params![worker_id, at.to_rfc3339()],
                )
                .map_err(|err| classify(err, "Failed to record heartbeat"))?;
            if changed == 0 {
                return Err(StoreError::WorkerNotFound(worker_id.to_string()));
            }
            Ok(())
        })
    }

    pub fn grant_wake_trust(&self, grantee: &str, worker_id: &str) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO wake_trust (grantee, worker_id) VALUES (?1, ?2)",
                params![grantee, worker_id],
            )
            .map_err(|err| classify(err, "Failed to grant wake trust"))?;
            Ok(())
        })
    }

    /// Appends a message, recording every `@name` in the body as a mention.
    /// Mentions are stored lowercased and matched case-insensitively.
    pub fn post_message(&self, message: &NewMessage<'_>) -> Result<i64, StoreError> {
        let mentions: BTreeSet<String> = RE_MENTION
            .captures_iter(message.body)
            .map(|cap| cap[1].trim_end_matches(['.', '-']).to_ascii_lowercase())
            .filter(|name| !name.is_empty())
            .collect();

        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| classify(err, "Failed to begin message insert"))?;
            tx.execute(
                "INSERT INTO messages (lane, sender, body, thread_id, reply_to, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    message.lane,
                    message.sender,
                    message.body,
                    message.thread_id,
                    message.reply_to,
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(|err| classify(err, "Failed to insert message"))?;
            let id = tx.last_insert_rowid();
            for name in &mentions {
                tx.execute(
                    "INSERT OR IGNORE INTO mentions (message_id, worker_id) VALUES (?1, ?2)",
                    params![id, name],
                )
                .map_err(|err| classify(err, "Failed to insert mention"))?;
            }
            tx.commit()
                .map_err(|err| classify(err, "Failed to commit message insert"))?;
            Ok(id)
        })
    }

    pub fn list_audit(&self, worker_id: &str) -> Result<Vec<AuditRow>, StoreError> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, recorded_at, worker_id, kind, payload FROM audit \
                     WHERE worker_id = ?1 ORDER BY id ASC",
                )
                .map_err(|err| classify(err, "Failed to prepare audit query"))?;
            let rows = stmt
                .query_map(params![worker_id], |row| {
                    let payload: String = row.get(4)?;
                    Ok(AuditRow {
                        id: row.get(0)?,
                        recorded_at: row.get(1)?,
                        worker_id: row.get(2)?,
                        kind: row.get(3)?,
                        payload: serde_json::from_str(&payload)
                            .unwrap_or(serde_json::Value::String(payload)),
                    })
                })
                .map_err(|err| classify(err, "Failed to query audit"))?;

            let mut entries = Vec::new();
            for row in rows {
                entries.push(row.map_err(|err| classify(err, "Failed to decode audit row"))?);
            }
            Ok(entries)
        })
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            let version: i64 = conn
                .query_row("PRAGMA user_version", [], |row| row.get(0))
                .map_err(|err| classify(err, "Failed to read schema version"))?;
            if version > SCHEMA_VERSION {
                return Err(StoreError::Schema(format!(
                    "database schema version {} is newer than supported version {}",
                    version, SCHEMA_VERSION
                )));
            }

            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS workers (
                    id TEXT PRIMARY KEY,
                    kind TEXT NOT NULL DEFAULT 'agent',
                    managed INTEGER NOT NULL DEFAULT 0,
                    presence TEXT NOT NULL DEFAULT 'idle',
                    session_id TEXT,
                    last_heartbeat TEXT,
                    left_at TEXT,
                    invoke TEXT
                 );
                 CREATE TABLE IF NOT EXISTS messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    lane TEXT NOT NULL,
                    sender TEXT NOT NULL,
                    body TEXT NOT NULL,
                    thread_id INTEGER,
                    reply_to TEXT,
                    created_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_messages_lane ON messages (lane, id);
                 CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages (sender, id);
                 CREATE INDEX IF NOT EXISTS idx_messages_reply_to ON messages (reply_to, id);
                 CREATE TABLE IF NOT EXISTS mentions (
                    message_id INTEGER NOT NULL,
                    worker_id TEXT NOT NULL,
                    PRIMARY KEY (message_id, worker_id)
                 );
                 CREATE INDEX IF NOT EXISTS idx_mentions_worker ON mentions (worker_id, message_id);
                 CREATE TABLE IF NOT EXISTS wake_trust (
                    grantee TEXT NOT NULL,
                    worker_id TEXT NOT NULL,
                    PRIMARY KEY (grantee, worker_id)
                 );
                 CREATE TABLE IF NOT EXISTS watermarks (
                    worker_id TEXT NOT NULL,
                    lane TEXT NOT NULL,
                    message_id INTEGER NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (worker_id, lane)
                 );
                 CREATE TABLE IF NOT EXISTS audit (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    recorded_at TEXT NOT NULL,
                    worker_id TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    payload TEXT NOT NULL
                 );
                 PRAGMA user_version = 1;
                 COMMIT;",
            )
            .map_err(|err| classify(err, "Failed to initialize schema"))?;
            Ok(())
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection, StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                StoreError::Unavailable(format!("Failed to create relay data dir: {}", err))
            })?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| classify(err, "Failed to open sqlite db"))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| classify(err, "Failed to enable WAL"))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| classify(err, "Failed to set synchronous"))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| classify(err, "Failed to set busy_timeout"))?;

        Ok(conn)
    }
}

impl Store for SqliteStore {
    fn list_managed_workers(&self) -> Result<Vec<Worker>, StoreError> {
        self.with_connection(|conn| {
            let sql = format!(
                "SELECT {} FROM workers WHERE managed = 1 ORDER BY id ASC",
                WORKER_COLUMNS
            );
            query_workers(conn, &sql, [])
        })
    }

    fn get_worker(&self, worker_id: &str) -> Result<Option<Worker>, StoreError> {
        self.with_connection(|conn| {
            let sql = format!("SELECT {} FROM workers WHERE id = ?1", WORKER_COLUMNS);
            conn.query_row(&sql, params![worker_id], worker_from_row)
                .optional()
                .map_err(|err| classify(err, "Failed to query worker"))
        })
    }

    fn update_worker_presence(
        &self,
        worker_id: &str,
        presence: Presence,
    ) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| classify(err, "Failed to begin presence update"))?;
            let changed = tx
                .execute(
                    "UPDATE workers SET presence = ?2 WHERE id = ?1",
                    params![worker_id, presence.as_str()],
                )
                .map_err(|err| classify(err, "Failed to update presence"))?;
            if changed == 0 {
                return Err(StoreError::WorkerNotFound(worker_id.to_string()));
            }
            insert_audit(
                &tx,
                worker_id,
                "presence",
                &serde_json::json!({ "presence": presence }),
            )?;
            tx.commit()
                .map_err(|err| classify(err, "Failed to commit presence update"))
        })
    }

    fn set_worker_session(&self, worker_id: &str, session_id: &str) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| classify(err, "Failed to begin session update"))?;
            tx.execute(
                "UPDATE workers SET session_id = ?2 WHERE id = ?1",
                params![worker_id, session_id],
            )
            .map_err(|err| classify(err, "Failed to update session"))?;
            insert_audit(
                &tx,
                worker_id,
                "session",
                &serde_json::json!({ "session_id": session_id }),
            )?;
            tx.commit()
                .map_err(|err| classify(err, "Failed to commit session update"))
        })
    }

    fn mark_worker_left(&self, worker_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| classify(err, "Failed to begin left_at update"))?;
            tx.execute(
                "UPDATE workers SET left_at = ?2 WHERE id = ?1",
                params![worker_id, at.to_rfc3339()],
            )
            .map_err(|err| classify(err, "Failed to update left_at"))?;
            insert_audit(
                &tx,
                worker_id,
                "left",
                &serde_json::json!({ "left_at": at.to_rfc3339() }),
            )?;
            tx.commit()
                .map_err(|err| classify(err, "Failed to commit left_at update"))
        })
    }

    fn messages_mentioning(
        &self,
        worker_id: &str,
        lane: &str,
        since: i64,
    ) -> Result<Vec<Message>, StoreError> {
        self.with_connection(|conn| {
            let sql = format!(
                "SELECT {} FROM messages m \
                 WHERE m.lane = ?2 AND m.id > ?3 AND ( \
                    EXISTS (SELECT 1 FROM mentions x WHERE x.message_id = m.id AND x.worker_id = lower(?1)) \
                    OR m.reply_to = ?1 \
                 ) \
                 ORDER BY m.id ASC",
                MESSAGE_COLUMNS
            );
            query_messages(conn, &sql, params![worker_id, lane, since])
        })
    }

    fn get_messages(&self, ids: &[i64]) -> Result<Vec<Message>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.with_connection(|conn| {
            let placeholders = vec!["?"; ids.len()].join(", ");
            let sql = format!(
                "SELECT {} FROM messages WHERE id IN ({}) ORDER BY id ASC",
                MESSAGE_COLUMNS, placeholders
            );
            query_messages(conn, &sql, params_from_iter(ids.iter()))
        })
    }

    fn get_thread(&self, thread_id: i64) -> Result<Vec<Message>, StoreError> {
        self.with_connection(|conn| {
            let sql = format!(
                "SELECT {} FROM messages WHERE id = ?1 OR thread_id = ?1 ORDER BY id ASC",
                MESSAGE_COLUMNS
            );
            query_messages(conn, &sql, params![thread_id])
        })
    }

    fn last_message_from(&self, worker_id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.with_connection(|conn| {
            let created_at: Option<String> = conn
                .query_row(
                    "SELECT created_at FROM messages WHERE sender = ?1 ORDER BY id DESC LIMIT 1",
                    params![worker_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|err| classify(err, "Failed to query last message"))?;
            Ok(created_at.as_deref().and_then(parse_rfc3339))
        })
    }

    fn is_wake_authorized(&self, message: &Message, worker_id: &str) -> Result<bool, StoreError> {
        self.with_connection(|conn| {
            let sender_kind: Option<String> = conn
                .query_row(
                    "SELECT kind FROM workers WHERE id = ?1",
                    params![message.sender],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|err| classify(err, "Failed to query sender"))?;
            if sender_kind.as_deref() == Some(ParticipantKind::Human.as_str()) {
                return Ok(true);
            }

            let trusted: bool = conn
                .query_row(
                    "SELECT EXISTS (SELECT 1 FROM wake_trust \
                     WHERE grantee = ?1 AND (worker_id = ?2 OR worker_id = '*'))",
                    params![message.sender, worker_id],
                    |row| row.get(0),
                )
                .map_err(|err| classify(err, "Failed to query wake trust"))?;
            if trusted {
                return Ok(true);
            }

            let Some(thread_id) = message.thread_id else {
                return Ok(false);
            };
            let owner: Option<String> = conn
                .query_row(
                    "SELECT sender FROM messages WHERE id = ?1",
                    params![thread_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|err| classify(err, "Failed to query thread owner"))?;
            Ok(owner.as_deref() == Some(message.sender.as_str()))
        })
    }

    fn watermark(&self, worker_id: &str, lane: &str) -> Result<i64, StoreError> {
        self.with_connection(|conn| {
            let value: Option<i64> = conn
                .query_row(
                    "SELECT message_id FROM watermarks WHERE worker_id = ?1 AND lane = ?2",
                    params![worker_id, lane],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|err| classify(err, "Failed to query watermark"))?;
            Ok(value.unwrap_or(0))
        })
    }

    fn set_watermark(
        &self,
        worker_id: &str,
        lane: &str,
        message_id: i64,
    ) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO watermarks (worker_id, lane, message_id, updated_at) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(worker_id, lane) DO UPDATE SET \
                    message_id = MAX(watermarks.message_id, excluded.message_id), \
                    updated_at = excluded.updated_at",
                params![worker_id, lane, message_id, Utc::now().to_rfc3339()],
            )
            .map_err(|err| classify(err, "Failed to update watermark"))?;
            Ok(())
        })
    }

    fn append_audit(&self, event: &AuditEvent) -> Result<(), StoreError> {
        let payload = serde_json::to_value(event)
            .map_err(|err| StoreError::Unavailable(format!("Failed to encode audit: {}", err)))?;
        self.with_connection(|conn| insert_audit(conn, event.worker(), event.kind(), &payload))
    }
}

fn insert_audit(
    conn: &Connection,
    worker_id: &str,
    kind: &str,
    payload: &serde_json::Value,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO audit (recorded_at, worker_id, kind, payload) VALUES (?1, ?2, ?3, ?4)",
        params![Utc::now().to_rfc3339(), worker_id, kind, payload.to_string()],
    )
    .map_err(|err| classify(err, "Failed to append audit"))?;
    Ok(())
}

fn query_workers<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<Worker>, StoreError> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|err| classify(err, "Failed to prepare workers query"))?;
    let rows = stmt
        .query_map(params, worker_from_row)
        .map_err(|err| classify(err, "Failed to query workers"))?;

    let mut workers = Vec::new();
    for row in rows {
        workers.push(row.map_err(|err| classify(err, "Failed to decode worker row"))?);
    }
    Ok(workers)
}

fn query_messages<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<Message>, StoreError> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|err| classify(err, "Failed to prepare messages query"))?;
    let rows = stmt
        .query_map(params, message_from_row)
        .map_err(|err| classify(err, "Failed to query messages"))?;

    let mut messages = Vec::new();
    for row in rows {
        messages.push(row.map_err(|err| classify(err, "Failed to decode message row"))?);
    }
    Ok(messages)
}

fn worker_from_row(row: &Row<'_>) -> rusqlite::Result<Worker> {
    let kind_raw: String = row.get(1)?;
    let kind = ParticipantKind::from_str(&kind_raw)
        .ok_or_else(|| invalid_column(1, format!("Unknown participant kind: {}", kind_raw)))?;
    let presence_raw: String = row.get(3)?;
    let presence = Presence::from_str(&presence_raw)
        .ok_or_else(|| invalid_column(3, format!("Unknown presence: {}", presence_raw)))?;
    let invoke_raw: Option<String> = row.get(7)?;
    let invoke = match invoke_raw {
        Some(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)
            .map_err(|err| invalid_column(7, format!("Invalid invoke settings: {}", err)))?,
        _ => InvokeSettings::default(),
    };
    let last_heartbeat: Option<String> = row.get(5)?;
    let left_at: Option<String> = row.get(6)?;

    Ok(Worker {
        id: row.get(0)?,
        kind,
        managed: row.get(2)?,
        presence,
        session_id: row.get(4)?,
        last_heartbeat: last_heartbeat.as_deref().and_then(parse_rfc3339),
        left_at: left_at.as_deref().and_then(parse_rfc3339),
        invoke,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let created_at: String = row.get(6)?;
    Ok(Message {
        id: row.get(0)?,
        lane: row.get(1)?,
        sender: row.get(2)?,
        body: row.get(3)?,
        thread_id: row.get(4)?,
        reply_to: row.get(5)?,
        created_at: parse_rfc3339(&created_at)
            .ok_or_else(|| invalid_column(6, format!("Invalid timestamp: {}", created_at)))?,
    })
}

fn invalid_column(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

/// Maps a rusqlite failure onto the transient/fatal split the watch loop acts on.
fn classify(err: rusqlite::Error, context: &str) -> StoreError {
    let message = format!("{}: {}", context, err);
    match &err {
        rusqlite::Error::FromSqlConversionFailure(..)
        | rusqlite::Error::InvalidColumnType(..)
        | rusqlite::Error::InvalidColumnName(..)
        | rusqlite::Error::InvalidColumnIndex(..) => StoreError::Schema(message),
        rusqlite::Error::SqliteFailure(_, Some(detail))
            if detail.contains("no such table") || detail.contains("no such column") =>
        {
            StoreError::Schema(message)
        }
        _ => StoreError::Unavailable(message),
    }
}

fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
