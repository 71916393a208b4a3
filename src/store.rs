//! Durable catalog of invoice secrets.
//!
//! Backed by a local SQLite file. Records are append-only from the core's
//! point of view: they are inserted as Registered and may only transition to
//! Used, never back and never deleted. The synthetic short channel id is
//! persisted with its high bit cleared and surfaced with the high bit set so
//! client-minted ids can't be confused with real channel ids.

use std::path::Path;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use strum::{Display, EnumString};

use crate::errors::{Result, WalletError};

/// Bit 63, set on every in-memory short channel id.
pub const SHORT_CHAN_ID_FLAG: u64 = 1 << 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum InvoiceState {
    Registered,
    Used,
}

/// One persisted invoice secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceRecord {
    pub id: Option<i64>,
    pub preimage: [u8; 32],
    pub payment_hash: [u8; 32],
    pub payment_secret: [u8; 32],
    pub key_path: String,
    /// Always carries [`SHORT_CHAN_ID_FLAG`] in memory.
    pub short_chan_id: u64,
    /// 0 means "amountless invoice"; set when the invoice is used.
    pub amount_sat: i64,
    pub state: InvoiceState,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

struct Migration {
    version: i64,
    sql: &'static str,
}

// Migration 1 is the initial table layout; amount_sat arrived later.
// Both statements are written to survive a table that already exists without
// its migration marker (recovery path for historical corruption).
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        sql: "CREATE TABLE IF NOT EXISTS invoices (
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  created_at TEXT NOT NULL,
                  updated_at TEXT NOT NULL,
                  deleted_at TEXT,
                  preimage BLOB NOT NULL,
                  payment_hash BLOB NOT NULL,
                  payment_secret BLOB NOT NULL,
                  key_path TEXT NOT NULL,
                  short_chan_id INTEGER NOT NULL,
                  state TEXT NOT NULL,
                  used_at TEXT
              );
              CREATE INDEX IF NOT EXISTS idx_invoices_payment_hash
                  ON invoices (payment_hash);",
    },
    Migration {
        version: 2,
        sql: "ALTER TABLE invoices ADD COLUMN amount_sat INTEGER NOT NULL DEFAULT 0;",
    },
];

const RECORD_COLUMNS: &str = "id, created_at, updated_at, preimage, payment_hash, \
     payment_secret, key_path, short_chan_id, amount_sat, state, used_at";

/// Handle to the invoice table. Cheap to open; callers open one per
/// operation and release it on every exit path.
pub struct InvoiceStore {
    conn: Connection,
}

impl InvoiceStore {
    /// Opens (creating if needed) the database at `path` and brings the
    /// schema up to date.
    pub fn open(path: &Path) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        run_migrations(&mut conn)?;
        Ok(InvoiceStore { conn })
    }

    /// Inserts a new record, stamping `created_at`/`updated_at` and
    /// assigning the row id.
    pub fn create(&self, record: &mut InvoiceRecord) -> Result<()> {
        let now = Utc::now();
        record.created_at = now;
        record.updated_at = now;
        self.conn.execute(
            "INSERT INTO invoices (created_at, updated_at, preimage, payment_hash, \
                 payment_secret, key_path, short_chan_id, amount_sat, state, used_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.created_at,
                record.updated_at,
                record.preimage.as_slice(),
                record.payment_hash.as_slice(),
                record.payment_secret.as_slice(),
                record.key_path,
                persisted_short_chan_id(record.short_chan_id),
                record.amount_sat,
                record.state.to_string(),
                record.used_at,
            ],
        )?;
        record.id = Some(self.conn.last_insert_rowid());
        record.short_chan_id |= SHORT_CHAN_ID_FLAG;
        Ok(())
    }

    /// Upserts by primary key. A record without an id is inserted.
    pub fn save(&self, record: &mut InvoiceRecord) -> Result<()> {
        let Some(id) = record.id else {
            return self.create(record);
        };
        record.updated_at = Utc::now();
        self.conn.execute(
            "INSERT INTO invoices (id, created_at, updated_at, preimage, payment_hash, \
                 payment_secret, key_path, short_chan_id, amount_sat, state, used_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
             ON CONFLICT(id) DO UPDATE SET \
                 updated_at = excluded.updated_at, \
                 amount_sat = excluded.amount_sat, \
                 state = excluded.state, \
                 used_at = excluded.used_at",
            params![
                id,
                record.created_at,
                record.updated_at,
                record.preimage.as_slice(),
                record.payment_hash.as_slice(),
                record.payment_secret.as_slice(),
                record.key_path,
                persisted_short_chan_id(record.short_chan_id),
                record.amount_sat,
                record.state.to_string(),
                record.used_at,
            ],
        )?;
        record.short_chan_id |= SHORT_CHAN_ID_FLAG;
        Ok(())
    }

    /// Transitions a Registered record to Used. Compare-and-swap on `state`:
    /// losing a race against a concurrent caller is an error, never a silent
    /// reuse of the secret.
    pub fn mark_used(&self, id: i64, amount_sat: i64, used_at: DateTime<Utc>) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE invoices SET state = ?1, amount_sat = ?2, used_at = ?3, updated_at = ?4 \
             WHERE id = ?5 AND state = ?6",
            params![
                InvoiceState::Used.to_string(),
                amount_sat,
                used_at,
                Utc::now(),
                id,
                InvoiceState::Registered.to_string(),
            ],
        )?;
        if updated != 1 {
            return Err(WalletError::storage(anyhow!(
                "invoice {id} is no longer registered; refusing to mark it used"
            )));
        }
        Ok(())
    }

    /// Returns a Registered record in the store's natural order, or `None`.
    /// Never returns a Used record.
    pub fn find_first_unused(&self) -> Result<Option<InvoiceRecord>> {
        let record = self
            .conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM invoices WHERE state = ?1 ORDER BY id LIMIT 1"
                ),
                params![InvoiceState::Registered.to_string()],
                read_record,
            )
            .optional()?;
        Ok(record)
    }

    pub fn count_unused(&self) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM invoices WHERE state = ?1",
            params![InvoiceState::Registered.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Exact-match lookup. A missing record is an error here: it means the
    /// server reported a payment for a hash we never registered.
    pub fn find_by_payment_hash(&self, payment_hash: &[u8; 32]) -> Result<InvoiceRecord> {
        self.conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM invoices WHERE payment_hash = ?1"),
                params![payment_hash.as_slice()],
                read_record,
            )
            .optional()?
            .ok_or_else(|| WalletError::not_found(payment_hash))
    }

    /// Best-effort release of the underlying connection.
    pub fn close(self) {
        if let Err((_conn, err)) = self.conn.close() {
            tracing::warn!("invoice store did not close cleanly: {err}");
        }
    }
}

fn persisted_short_chan_id(short_chan_id: u64) -> i64 {
    // Clearing bit 63 keeps the value in i64 range for SQLite.
    (short_chan_id & !SHORT_CHAN_ID_FLAG) as i64
}

fn surfaced_short_chan_id(persisted: i64) -> u64 {
    persisted as u64 | SHORT_CHAN_ID_FLAG
}

fn blob32(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<[u8; 32]> {
    let bytes: Vec<u8> = row.get(idx)?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Blob,
            format!("expected 32 bytes, got {len}", len = bytes.len()).into(),
        )
    })
}

fn read_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<InvoiceRecord> {
    let state_text: String = row.get(9)?;
    let state = state_text.parse::<InvoiceState>().map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(err))
    })?;
    Ok(InvoiceRecord {
        id: Some(row.get(0)?),
        created_at: row.get(1)?,
        updated_at: row.get(2)?,
        preimage: blob32(row, 3)?,
        payment_hash: blob32(row, 4)?,
        payment_secret: blob32(row, 5)?,
        key_path: row.get(6)?,
        short_chan_id: surfaced_short_chan_id(row.get(7)?),
        amount_sat: row.get(8)?,
        state,
        used_at: row.get(10)?,
    })
}

fn run_migrations(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
             version INTEGER PRIMARY KEY,
             applied_at TEXT NOT NULL
         );",
    )?;
    for migration in MIGRATIONS {
        let tx = conn.transaction()?;
        let applied: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE version = ?1)",
            params![migration.version],
            |row| row.get(0),
        )?;
        if applied {
            continue;
        }
        if let Err(err) = tx.execute_batch(migration.sql) {
            // The schema object may predate its marker; adopt it instead of
            // failing the open.
            if !is_already_applied(&err) {
                return Err(err.into());
            }
            tracing::warn!(
                version = migration.version,
                "migration target already present, recording marker only"
            );
        }
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![migration.version, Utc::now()],
        )?;
        tx.commit()?;
    }
    Ok(())
}

fn is_already_applied(err: &rusqlite::Error) -> bool {
    let msg = err.to_string();
    msg.contains("already exists") || msg.contains("duplicate column name")
}
