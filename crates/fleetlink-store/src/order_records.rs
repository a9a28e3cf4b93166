//! Durable order execution records.
//!
//! Every dispatched order or direct command gets one row in the SQLite table
//! `order_executions`.  Rows move through the lifecycle
//! `CREATED → SENT → (STARTED) → COMPLETED | FAILED | CANCELLED` and are never
//! deleted by the bridge.
//!
//! # Storage layout
//!
//! | column        | type    | description                                   |
//! |---------------|---------|-----------------------------------------------|
//! | order_id      | TEXT    | Externally visible id, primary key            |
//! | template_id   | TEXT    | Source template (NULL for direct commands)    |
//! | device_id     | TEXT    | Target robot                                  |
//! | order_revision| INTEGER | `orderUpdateId` sent with the order           |
//! | status        | TEXT    | `CREATED`, `SENT`, `STARTED`, `COMPLETED`, …  |
//! | error_message | TEXT    | Set whenever the record is `FAILED`           |
//! | created_at    | TEXT    | RFC-3339 UTC                                  |
//! | started_at    | TEXT    | RFC-3339 UTC, set on `STARTED`                |
//! | completed_at  | TEXT    | RFC-3339 UTC, set on any terminal status      |
//! | in_flight     | INTEGER | 1 while the dispatch outcome is unrecorded   |
//!
//! # Units of work
//!
//! The dispatch path persists a `CREATED` row, performs network I/O and then
//! records the outcome.  [`OrderRecordStore::begin`] commits the `CREATED`
//! row flagged `in_flight` and hands back a [`UnitOfWork`]; the outcome is
//! recorded by [`UnitOfWork::commit_sent`] or [`UnitOfWork::commit_failed`],
//! each a transaction of its own.  No lock is held in between, so a slow send
//! never stalls the rest of the store.  [`UnitOfWork::discard`] (or dropping
//! the unit of work) deletes a row that was never dispatched.  Rows still
//! flagged after a crash are failed by [`OrderRecordStore::recover_in_flight`].
//!
//! ```rust
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! use fleetlink_store::{NewOrderRecord, OrderRecordStore};
//! use fleetlink_types::OrderStatus;
//!
//! let store = OrderRecordStore::open_in_memory().unwrap();
//! let uow = store.begin(&NewOrderRecord::new("order-1", "agv-01")).await.unwrap();
//! assert_eq!(store.get("order-1").await.unwrap().status, OrderStatus::Created);
//! uow.commit_sent().unwrap();
//!
//! assert_eq!(store.get("order-1").await.unwrap().status, OrderStatus::Sent);
//! # });
//! ```

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use fleetlink_types::{BridgeError, OrderStatus};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Stored when a record fails without a reported reason.
pub const UNSPECIFIED_FAILURE: &str = "failed without a reported reason";

/// Stored on records whose dispatch outcome was lost to a restart.
pub const INTERRUPTED_DISPATCH: &str = "bridge stopped before the send outcome was recorded";

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Order execution record not found: {0}")]
    NotFound(String),
    #[error("Order execution record already exists: {0}")]
    Duplicate(String),
    #[error("Invalid state transition for order {order_id}: {from} -> {to}")]
    InvalidStateTransition {
        order_id: String,
        from: OrderStatus,
        to: OrderStatus,
    },
}

impl From<StoreError> for BridgeError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => BridgeError::OrderNotFound(id),
            StoreError::InvalidStateTransition { order_id, from, to } => {
                BridgeError::InvalidStateTransition { order_id, from, to }
            }
            other => BridgeError::Store(other.to_string()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────────────────────────

/// One order execution record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub template_id: Option<String>,
    pub device_id: String,
    pub order_revision: u64,
    pub status: OrderStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Identity of a record about to be created.
#[derive(Debug, Clone)]
pub struct NewOrderRecord {
    pub order_id: String,
    pub template_id: Option<String>,
    pub device_id: String,
    pub order_revision: u64,
}

impl NewOrderRecord {
    pub fn new(order_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
            template_id: None,
            device_id: device_id.into(),
            order_revision: 0,
        }
    }

    pub fn with_template(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = Some(template_id.into());
        self
    }

    pub fn with_revision(mut self, order_revision: u64) -> Self {
        self.order_revision = order_revision;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// OrderRecordStore
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite-backed store of order execution records.
///
/// Cloning is cheap; clones share one connection.
#[derive(Clone)]
pub struct OrderRecordStore {
    conn: Arc<Mutex<Connection>>,
}

impl OrderRecordStore {
    /// Open (or create) a persistent store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open(path)?)
    }

    /// Open a temporary in-memory store (useful for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS order_executions (
                order_id       TEXT NOT NULL PRIMARY KEY,
                template_id    TEXT,
                device_id      TEXT NOT NULL,
                order_revision INTEGER NOT NULL DEFAULT 0,
                status         TEXT NOT NULL,
                error_message  TEXT,
                created_at     TEXT NOT NULL,
                started_at     TEXT,
                completed_at   TEXT,
                in_flight      INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_order_executions_device
                ON order_executions (device_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_order_executions_status
                ON order_executions (status);",
        )?;
        add_in_flight_column(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Persist `new` as `CREATED` and flag it in flight until the returned
    /// unit of work records the send outcome.
    ///
    /// # Errors
    ///
    /// [`StoreError::Duplicate`] when a record with the same id exists.
    pub async fn begin(&self, new: &NewOrderRecord) -> Result<UnitOfWork, StoreError> {
        let created_at = Utc::now();
        self.lock()
            .execute(
                "INSERT INTO order_executions
                    (order_id, template_id, device_id, order_revision, status, created_at, in_flight)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)",
                params![
                    new.order_id,
                    new.template_id,
                    new.device_id,
                    new.order_revision as i64,
                    OrderStatus::Created.as_str(),
                    timestamp(created_at),
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(ref err, _)
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    StoreError::Duplicate(new.order_id.clone())
                }
                other => StoreError::Sqlite(other),
            })?;
        debug!(order_id = %new.order_id, device_id = %new.device_id, "order record created");
        Ok(UnitOfWork {
            store: self.clone(),
            order_id: new.order_id.clone(),
            finished: false,
        })
    }

    /// Fail every `CREATED` record still flagged in flight, i.e. whose send
    /// outcome was never recorded.  Meant for startup, before any dispatch.
    pub async fn recover_in_flight(&self) -> Result<Vec<OrderRecord>, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let stranded: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT order_id FROM order_executions WHERE in_flight = 1 AND status = ?1",
            )?;
            let rows = stmt.query_map(params![OrderStatus::Created.as_str()], |row| row.get(0))?;
            rows.collect::<Result<Vec<String>, rusqlite::Error>>()?
        };
        let mut recovered = Vec::with_capacity(stranded.len());
        for order_id in &stranded {
            recovered.push(transition_record(
                &tx,
                order_id,
                OrderStatus::Failed,
                Some(INTERRUPTED_DISPATCH),
            )?);
        }
        tx.execute("UPDATE order_executions SET in_flight = 0 WHERE in_flight = 1", [])?;
        tx.commit()?;
        if !recovered.is_empty() {
            warn!(count = recovered.len(), "interrupted dispatches marked FAILED");
        }
        Ok(recovered)
    }

    /// Move a record to `status`, enforcing the lifecycle.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] for an unknown id and
    /// [`StoreError::InvalidStateTransition`] when the lifecycle forbids the
    /// move; the record is left untouched in both cases.
    pub async fn update_status(
        &self,
        order_id: &str,
        status: OrderStatus,
        error_message: Option<&str>,
    ) -> Result<OrderRecord, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let record = transition_record(&tx, order_id, status, error_message)?;
        tx.commit()?;
        Ok(record)
    }

    pub async fn get(&self, order_id: &str) -> Result<OrderRecord, StoreError> {
        get_record(&self.lock(), order_id)
    }

    /// Records for one device, newest first.
    pub async fn list_by_device(
        &self,
        device_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<OrderRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM order_executions WHERE device_id = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt.query_map(
            params![device_id, limit as i64, offset as i64],
            row_to_record,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Records in `status`, oldest first.
    pub async fn list_by_status(&self, status: OrderStatus) -> Result<Vec<OrderRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM order_executions WHERE status = ?1
             ORDER BY created_at ASC, rowid ASC"
        ))?;
        let rows = stmt.query_map(params![status.as_str()], row_to_record)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Number of records in `status`, optionally restricted to one device.
    pub async fn count_by_status(
        &self,
        status: OrderStatus,
        device_id: Option<&str>,
    ) -> Result<u64, StoreError> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM order_executions
             WHERE status = ?1 AND (?2 IS NULL OR device_id = ?2)",
            params![status.as_str(), device_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn add_in_flight_column(conn: &Connection) -> Result<(), StoreError> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info('order_executions')")?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    if !columns.iter().any(|c| c == "in_flight") {
        conn.execute_batch(
            "ALTER TABLE order_executions ADD COLUMN in_flight INTEGER NOT NULL DEFAULT 0",
        )?;
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// UnitOfWork
// ─────────────────────────────────────────────────────────────────────────────

/// A `CREATED` record whose send outcome is still to be recorded.
///
/// Finish with [`commit_sent`](Self::commit_sent),
/// [`commit_failed`](Self::commit_failed) or [`discard`](Self::discard);
/// dropping an unfinished unit of work discards it.
pub struct UnitOfWork {
    store: OrderRecordStore,
    order_id: String,
    finished: bool,
}

impl UnitOfWork {
    pub fn order_id(&self) -> &str {
        &self.order_id
    }

    /// The send succeeded: move the record to `SENT`.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidStateTransition`] when the record was cancelled
    /// while the send was in flight; it keeps its status.
    pub fn commit_sent(self) -> Result<OrderRecord, StoreError> {
        self.settle(OrderStatus::Sent, None)
    }

    /// The send failed: move the record to `FAILED` with `reason`.
    pub fn commit_failed(self, reason: &str) -> Result<OrderRecord, StoreError> {
        self.settle(OrderStatus::Failed, Some(reason))
    }

    /// Nothing was sent: delete the record.  A record changed by someone
    /// else in the meantime is kept.
    pub fn discard(mut self) -> Result<(), StoreError> {
        self.finished = true;
        delete_unsent(&self.store.lock(), &self.order_id)
    }

    fn settle(mut self, status: OrderStatus, reason: Option<&str>) -> Result<OrderRecord, StoreError> {
        self.finished = true;
        let mut conn = self.store.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE order_executions SET in_flight = 0 WHERE order_id = ?1",
            params![self.order_id],
        )?;
        let settled = transition_record(&tx, &self.order_id, status, reason);
        tx.commit()?;
        settled
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!(order_id = %self.order_id, "unit of work dropped unfinished; discarding record");
        if let Err(e) = delete_unsent(&self.store.lock(), &self.order_id) {
            warn!(order_id = %self.order_id, error = %e, "discard failed; left for recovery");
        }
    }
}

fn delete_unsent(conn: &Connection, order_id: &str) -> Result<(), StoreError> {
    let deleted = conn.execute(
        "DELETE FROM order_executions WHERE order_id = ?1 AND in_flight = 1 AND status = ?2",
        params![order_id, OrderStatus::Created.as_str()],
    )?;
    if deleted == 0 {
        conn.execute(
            "UPDATE order_executions SET in_flight = 0 WHERE order_id = ?1",
            params![order_id],
        )?;
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Row helpers
// ─────────────────────────────────────────────────────────────────────────────

const COLUMNS: &str = "order_id, template_id, device_id, order_revision, status, \
                       error_message, created_at, started_at, completed_at";

fn get_record(conn: &Connection, order_id: &str) -> Result<OrderRecord, StoreError> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM order_executions WHERE order_id = ?1"),
        params![order_id],
        row_to_record,
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound(order_id.to_string()))
}

fn transition_record(
    conn: &Connection,
    order_id: &str,
    to: OrderStatus,
    error_message: Option<&str>,
) -> Result<OrderRecord, StoreError> {
    let current = get_record(conn, order_id)?;
    if !current.status.can_transition_to(to) {
        return Err(StoreError::InvalidStateTransition {
            order_id: order_id.to_string(),
            from: current.status,
            to,
        });
    }

    let error_message = match (to, error_message) {
        (OrderStatus::Failed, None) => Some(UNSPECIFIED_FAILURE),
        (OrderStatus::Failed, Some(m)) if m.trim().is_empty() => Some(UNSPECIFIED_FAILURE),
        (_, m) => m,
    };
    let now = timestamp(Utc::now());
    let started_at = (to == OrderStatus::Started).then(|| now.clone());
    let completed_at = to.is_terminal().then_some(now);

    conn.execute(
        "UPDATE order_executions
         SET status = ?1,
             error_message = COALESCE(?2, error_message),
             started_at = COALESCE(?3, started_at),
             completed_at = COALESCE(?4, completed_at)
         WHERE order_id = ?5",
        params![to.as_str(), error_message, started_at, completed_at, order_id],
    )?;
    debug!(order_id, from = %current.status, to = %to, "order record transitioned");
    get_record(conn, order_id)
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<OrderRecord> {
    let status_str: String = row.get(4)?;
    let status = OrderStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(4, status_str, rusqlite::types::Type::Text)
    })?;
    let revision: i64 = row.get(3)?;
    Ok(OrderRecord {
        order_id: row.get(0)?,
        template_id: row.get(1)?,
        device_id: row.get(2)?,
        order_revision: revision as u64,
        status,
        error_message: row.get(5)?,
        created_at: parse_timestamp(6, row.get(6)?)?,
        started_at: row
            .get::<_, Option<String>>(7)?
            .map(|raw| parse_timestamp(7, raw))
            .transpose()?,
        completed_at: row
            .get::<_, Option<String>>(8)?
            .map(|raw| parse_timestamp(8, raw))
            .transpose()?,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
