//! The durable session store.
//!
//! One SQLite database holds users, the append-only sales ledger, coin
//! sources, the price table with per-source visibility, fail-attempt
//! records, and a small key/value config area. The connection sits behind
//! one mutex: every write is serialized through it, which is the
//! single-logical-writer discipline the rest of the engine assumes. Reads
//! copy rows out, so callers always hold snapshots.
//!
//! # Schema
//!
//! Tables: `users`, `sales`, `sources`, `rates`, `source_rates`,
//! `failures`, `config`. Unique indices on `users(mac)` and
//! `users(user_code)`; a partial unique index guarantees a non-null IP is
//! owned by at most one active user.
//!
//! Timestamps are UTC unix seconds throughout. Reporting applies a tenant
//! offset at aggregation time only.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::coin::SourceId;
use crate::net::MacAddr;
use crate::rates::{Rate, RateTable};

/// Alphabet for user codes: unambiguous, no `I`, `O`, `0`, `1`.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Length of the random body of a user code.
const CODE_BODY_LEN: usize = 6;

/// Prefix stamped on every generated user code.
const CODE_PREFIX: &str = "CJ-";

/// Attempts at generating a unique user code before giving up. With a
/// 32^6 space this only trips if the RNG is broken.
const CODE_GEN_ATTEMPTS: usize = 64;

/// Errors from store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Underlying SQLite failure.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The user-code space could not yield a free code.
    #[error("exhausted {attempts} attempts generating a unique user code")]
    CodeSpaceExhausted {
        /// Attempts made.
        attempts: usize,
    },

    /// No row matched the targeted mutation.
    #[error("no such user {user_id}")]
    NoSuchUser {
        /// The id that missed.
        user_id: String,
    },
}

/// A user row, copied out of the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    /// Opaque identifier, stable for the record's lifetime.
    pub user_id: String,
    /// Canonical MAC the record is bound to.
    pub mac: MacAddr,
    /// Persistent portal cookie, if one has been bound.
    pub client_id: Option<String>,
    /// Last known client IP.
    pub ip: Option<Ipv4Addr>,
    /// Printable restore/voucher code, unique among active records.
    pub user_code: String,
    /// Remaining credit. Never negative.
    pub credit_seconds: i64,
    /// Lifetime credited seconds.
    pub total_seconds_ever: i64,
    /// Download cap in kbit/s.
    pub rate_down_kbps: u32,
    /// Upload cap in kbit/s.
    pub rate_up_kbps: u32,
    /// Paused by the user or the idle monitor.
    pub paused: bool,
    /// Currently considered on the network.
    pub connected: bool,
    /// Last time a byte-counter delta was attributed to this user.
    pub last_traffic_at: i64,
    /// Last portal contact.
    pub last_seen_at: i64,
    /// When the ticker expired the session, if it has.
    pub session_expiry_at: Option<i64>,
}

impl UserRecord {
    /// Active means the record still holds credit.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.credit_seconds > 0
    }
}

/// A coin source row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRow {
    /// Canonical source identity.
    pub source: SourceId,
    /// Operator-facing name.
    pub display_name: String,
    /// Pesos contributed per pulse. Clamped to `1..=100` on write.
    pub pulse_value_pesos: u32,
    /// Per-source download override, if configured.
    pub rate_down_kbps: Option<u32>,
    /// Per-source upload override, if configured.
    pub rate_up_kbps: Option<u32>,
    /// Last authenticated heartbeat or pulse.
    pub last_active_at: i64,
}

impl SourceRow {
    /// A source is online while its heartbeat is fresh.
    #[must_use]
    pub const fn online(&self, now: i64, offline_after_secs: i64) -> bool {
        now - self.last_active_at < offline_after_secs
    }
}

/// One sales-ledger row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaleRow {
    /// Ledger sequence.
    pub id: i64,
    /// UTC unix seconds.
    pub created_at: i64,
    /// Pesos credited.
    pub amount_pesos: u32,
    /// MAC the credit went to.
    pub mac: MacAddr,
    /// Canonical source name.
    pub source: String,
}

/// Aggregated sales over a time range.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SalesSummary {
    /// Total pesos in range.
    pub total_pesos: u64,
    /// Pesos per source, sorted by source name.
    pub by_source: Vec<(String, u64)>,
    /// Pesos per local day (`YYYY-MM-DD` in the tenant offset), sorted.
    pub by_day: Vec<(String, u64)>,
}

/// The durable record set. Cheap to clone; clones share the connection.
#[derive(Debug, Clone)]
pub struct SessionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SessionStore {
    /// Opens (creating if needed) the store at `path` and ensures the
    /// schema exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on open or migration failure.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        // WAL keeps the 1 Hz writer from stalling portal reads.
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::init_schema(&conn)?;
        info!(path = %path.as_ref().display(), "session store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory store. Test fixtures only; nothing survives drop.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on schema failure.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                user_id           TEXT PRIMARY KEY,
                mac               TEXT NOT NULL,
                client_id         TEXT,
                ip                TEXT,
                user_code         TEXT NOT NULL,
                credit_seconds    INTEGER NOT NULL DEFAULT 0,
                total_seconds_ever INTEGER NOT NULL DEFAULT 0,
                rate_down_kbps    INTEGER NOT NULL DEFAULT 0,
                rate_up_kbps      INTEGER NOT NULL DEFAULT 0,
                paused            INTEGER NOT NULL DEFAULT 0,
                connected         INTEGER NOT NULL DEFAULT 0,
                last_traffic_at   INTEGER NOT NULL DEFAULT 0,
                last_seen_at      INTEGER NOT NULL DEFAULT 0,
                session_expiry_at INTEGER
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_users_mac ON users(mac);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_users_code ON users(user_code);
            CREATE INDEX IF NOT EXISTS idx_users_client ON users(client_id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_users_active_ip
                ON users(ip) WHERE ip IS NOT NULL AND credit_seconds > 0;

            CREATE TABLE IF NOT EXISTS sales (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at   INTEGER NOT NULL,
                amount_pesos INTEGER NOT NULL,
                mac          TEXT NOT NULL,
                source       TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sales_created ON sales(created_at);

            CREATE TABLE IF NOT EXISTS sources (
                source_id         TEXT PRIMARY KEY,
                display_name      TEXT NOT NULL,
                pulse_value_pesos INTEGER NOT NULL DEFAULT 1,
                rate_down_kbps    INTEGER,
                rate_up_kbps      INTEGER,
                last_active_at    INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS rates (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                amount_pesos INTEGER NOT NULL,
                minutes      INTEGER NOT NULL,
                up_kbps      INTEGER NOT NULL DEFAULT 0,
                down_kbps    INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS source_rates (
                source_id TEXT NOT NULL,
                rate_id   INTEGER NOT NULL,
                PRIMARY KEY (source_id, rate_id)
            );

            CREATE TABLE IF NOT EXISTS failures (
                mac          TEXT PRIMARY KEY,
                fail_count   INTEGER NOT NULL DEFAULT 0,
                banned_until INTEGER
            );

            CREATE TABLE IF NOT EXISTS config (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A poisoned lock means a panic mid-statement; the connection is
        // still usable and refusing service would take the gateway down.
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    /// Looks a user up by bound cookie.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on query failure.
    pub fn find_by_cookie(&self, client_id: &str) -> Result<Option<UserRecord>, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                &format!("SELECT {USER_COLS} FROM users WHERE client_id = ?1"),
                params![client_id],
                row_to_user,
            )
            .optional()?;
        Ok(row)
    }

    /// Looks a user up by MAC, case-insensitively, rewriting any legacy
    /// row to the canonical spelling on match.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on query failure.
    pub fn find_by_mac(&self, mac: &MacAddr) -> Result<Option<UserRecord>, StoreError> {
        let canonical = mac.to_string();
        let conn = self.lock();
        let found: Option<(String, String)> = conn
            .query_row(
                "SELECT user_id, mac FROM users WHERE lower(mac) = ?1",
                params![canonical],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((user_id, stored)) = found else {
            return Ok(None);
        };
        if stored != canonical {
            conn.execute(
                "UPDATE users SET mac = ?1 WHERE user_id = ?2",
                params![canonical, user_id],
            )?;
        }
        let row = conn.query_row(
            &format!("SELECT {USER_COLS} FROM users WHERE user_id = ?1"),
            params![user_id],
            row_to_user,
        )?;
        Ok(Some(row))
    }

    /// Looks a user up by code, case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on query failure.
    pub fn find_by_code(&self, code: &str) -> Result<Option<UserRecord>, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                &format!("SELECT {USER_COLS} FROM users WHERE upper(user_code) = upper(?1)"),
                params![code],
                row_to_user,
            )
            .optional()?;
        Ok(row)
    }

    /// Fetches a user by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on query failure.
    pub fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                &format!("SELECT {USER_COLS} FROM users WHERE user_id = ?1"),
                params![user_id],
                row_to_user,
            )
            .optional()?;
        Ok(row)
    }

    /// Returns the active owner of an IP, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on query failure.
    pub fn find_active_by_ip(&self, ip: Ipv4Addr) -> Result<Option<UserRecord>, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {USER_COLS} FROM users \
                     WHERE ip = ?1 AND credit_seconds > 0"
                ),
                params![ip.to_string()],
                row_to_user,
            )
            .optional()?;
        Ok(row)
    }

    /// Creates a user with a freshly generated unique code.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::CodeSpaceExhausted`] if code generation keeps
    /// colliding, or [`StoreError::Sqlite`] on insert failure.
    pub fn create_user(
        &self,
        mac: &MacAddr,
        client_id: Option<&str>,
        ip: Option<Ipv4Addr>,
        now: i64,
    ) -> Result<UserRecord, StoreError> {
        let conn = self.lock();
        let user_code = generate_unique_code(&conn)?;
        let user_id = format!("USR-{}", Uuid::new_v4());
        conn.execute(
            "INSERT INTO users (user_id, mac, client_id, ip, user_code, last_seen_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user_id,
                mac.to_string(),
                client_id,
                ip.map(|i| i.to_string()),
                user_code,
                now
            ],
        )?;
        debug!(%user_id, %mac, %user_code, "user created");
        let row = conn.query_row(
            &format!("SELECT {USER_COLS} FROM users WHERE user_id = ?1"),
            params![user_id],
            row_to_user,
        )?;
        Ok(row)
    }

    /// Moves a user onto a new MAC, deleting any stale record already
    /// holding it. The caller is responsible for having ruled out an
    /// active owner first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn claim_mac(&self, user_id: &str, new_mac: &MacAddr) -> Result<(), StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let evicted = tx.execute(
            "DELETE FROM users WHERE lower(mac) = ?1 AND user_id != ?2",
            params![new_mac.to_string(), user_id],
        )?;
        if evicted > 0 {
            warn!(mac = %new_mac, evicted, "stale record evicted during MAC claim");
        }
        tx.execute(
            "UPDATE users SET mac = ?1 WHERE user_id = ?2",
            params![new_mac.to_string(), user_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Binds a cookie to a user.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn bind_cookie(&self, user_id: &str, client_id: &str) -> Result<(), StoreError> {
        self.lock().execute(
            "UPDATE users SET client_id = ?1 WHERE user_id = ?2",
            params![client_id, user_id],
        )?;
        Ok(())
    }

    /// Assigns an IP to a user, clearing it from any other record first so
    /// the active-IP uniqueness invariant holds.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn assign_ip(&self, user_id: &str, ip: Ipv4Addr) -> Result<(), StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE users SET ip = NULL WHERE ip = ?1 AND user_id != ?2",
            params![ip.to_string(), user_id],
        )?;
        tx.execute(
            "UPDATE users SET ip = ?1 WHERE user_id = ?2",
            params![ip.to_string(), user_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Subtracts credit, clamping at zero. Returns the new balance.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NoSuchUser`] if the record vanished, or
    /// [`StoreError::Sqlite`] on failure.
    pub fn decrement(&self, user_id: &str, seconds: i64) -> Result<i64, StoreError> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE users SET credit_seconds = max(0, credit_seconds - ?1) WHERE user_id = ?2",
            params![seconds, user_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NoSuchUser {
                user_id: user_id.to_string(),
            });
        }
        let balance = conn.query_row(
            "SELECT credit_seconds FROM users WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(balance)
    }

    /// Marks a user paused and off the network.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn pause(&self, user_id: &str) -> Result<(), StoreError> {
        self.lock().execute(
            "UPDATE users SET paused = 1, connected = 0 WHERE user_id = ?1",
            params![user_id],
        )?;
        Ok(())
    }

    /// Clears the paused flag and marks the user connected.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn resume(&self, user_id: &str, now: i64) -> Result<(), StoreError> {
        self.lock().execute(
            "UPDATE users SET paused = 0, connected = 1, last_traffic_at = ?2 \
             WHERE user_id = ?1",
            params![user_id, now],
        )?;
        Ok(())
    }

    /// Zeroes the credit and records the expiry instant.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn expire(&self, user_id: &str, now: i64) -> Result<(), StoreError> {
        self.lock().execute(
            "UPDATE users SET credit_seconds = 0, connected = 0, session_expiry_at = ?2 \
             WHERE user_id = ?1",
            params![user_id, now],
        )?;
        Ok(())
    }

    /// Stamps `last_seen_at` (portal contact).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn touch_seen(&self, user_id: &str, now: i64) -> Result<(), StoreError> {
        self.lock().execute(
            "UPDATE users SET last_seen_at = ?2 WHERE user_id = ?1",
            params![user_id, now],
        )?;
        Ok(())
    }

    /// Stamps `last_traffic_at`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn touch_traffic(&self, user_id: &str, now: i64) -> Result<(), StoreError> {
        self.lock().execute(
            "UPDATE users SET last_traffic_at = ?2 WHERE user_id = ?1",
            params![user_id, now],
        )?;
        Ok(())
    }

    /// Snapshot of every user with credit left and not paused.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn iterate_active(&self) -> Result<Vec<UserRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {USER_COLS} FROM users \
             WHERE credit_seconds > 0 AND paused = 0 ORDER BY user_id"
        ))?;
        let rows = stmt
            .query_map([], row_to_user)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Snapshot of connected, unpaused, active users (idle-monitor view).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn iterate_connected(&self) -> Result<Vec<UserRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {USER_COLS} FROM users \
             WHERE credit_seconds > 0 AND paused = 0 AND connected = 1 ORDER BY user_id"
        ))?;
        let rows = stmt
            .query_map([], row_to_user)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Applies a credit to a user: the field update list of the credit
    /// transaction, executed as one statement so it cannot interleave
    /// with ticker decrements.
    ///
    /// `override_rates` replaces both caps after the max-merge, for
    /// dominant sources that define a bandwidth override.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NoSuchUser`] if the record vanished, or
    /// [`StoreError::Sqlite`] on failure.
    pub fn apply_credit(
        &self,
        user_id: &str,
        seconds: i64,
        up_kbps: u32,
        down_kbps: u32,
        override_rates: Option<(u32, u32)>,
        client_id: Option<&str>,
        now: i64,
    ) -> Result<(), StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE users SET
                credit_seconds = credit_seconds + ?2,
                total_seconds_ever = total_seconds_ever + ?2,
                paused = 0,
                connected = 1,
                last_traffic_at = ?3,
                last_seen_at = ?3,
                session_expiry_at = NULL,
                client_id = COALESCE(?4, client_id),
                rate_up_kbps = max(rate_up_kbps, ?5),
                rate_down_kbps = max(rate_down_kbps, ?6)
             WHERE user_id = ?1",
            params![user_id, seconds, now, client_id, up_kbps, down_kbps],
        )?;
        if changed == 0 {
            return Err(StoreError::NoSuchUser {
                user_id: user_id.to_string(),
            });
        }
        if let Some((up, down)) = override_rates {
            tx.execute(
                "UPDATE users SET rate_up_kbps = ?2, rate_down_kbps = ?3 WHERE user_id = ?1",
                params![user_id, up, down],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Deletes a user record outright (administrative action and voucher
    /// merges only).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn delete_user(&self, user_id: &str) -> Result<(), StoreError> {
        self.lock()
            .execute("DELETE FROM users WHERE user_id = ?1", params![user_id])?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sales ledger
    // ------------------------------------------------------------------

    /// Appends one sale row. Always called before the user mutation it
    /// funds.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn record_sale(
        &self,
        now: i64,
        amount_pesos: u32,
        mac: &MacAddr,
        source: &SourceId,
    ) -> Result<i64, StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO sales (created_at, amount_pesos, mac, source) VALUES (?1, ?2, ?3, ?4)",
            params![now, amount_pesos, mac.to_string(), source.to_string()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// All sales in `[from, to)`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn sales_in_range(&self, from: i64, to: i64) -> Result<Vec<SaleRow>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, created_at, amount_pesos, mac, source FROM sales \
             WHERE created_at >= ?1 AND created_at < ?2 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![from, to], |row| {
                let mac_raw: String = row.get(3)?;
                let mac = MacAddr::parse(&mac_raw).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        3,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?;
                Ok(SaleRow {
                    id: row.get(0)?,
                    created_at: row.get(1)?,
                    amount_pesos: row.get(2)?,
                    mac,
                    source: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Aggregates sales in `[from, to)` by source and by local day. Day
    /// boundaries shift by `tz_offset_minutes`; the rows themselves stay
    /// UTC.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn sales_summary(
        &self,
        from: i64,
        to: i64,
        tz_offset_minutes: i32,
    ) -> Result<SalesSummary, StoreError> {
        let rows = self.sales_in_range(from, to)?;
        let mut total: u64 = 0;
        let mut by_source: HashMap<String, u64> = HashMap::new();
        let mut by_day: HashMap<String, u64> = HashMap::new();
        let offset = i64::from(tz_offset_minutes) * 60;
        for row in rows {
            let amount = u64::from(row.amount_pesos);
            total += amount;
            *by_source.entry(row.source).or_default() += amount;
            let day = chrono::DateTime::from_timestamp(row.created_at + offset, 0)
                .map_or_else(|| "invalid".to_string(), |d| d.format("%Y-%m-%d").to_string());
            *by_day.entry(day).or_default() += amount;
        }
        let mut by_source: Vec<_> = by_source.into_iter().collect();
        by_source.sort();
        let mut by_day: Vec<_> = by_day.into_iter().collect();
        by_day.sort();
        Ok(SalesSummary {
            total_pesos: total,
            by_source,
            by_day,
        })
    }

    // ------------------------------------------------------------------
    // Failure records
    // ------------------------------------------------------------------

    /// Current `(fail_count, banned_until)` for a MAC.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn failure_state(&self, mac: &MacAddr) -> Result<Option<(u32, Option<i64>)>, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT fail_count, banned_until FROM failures WHERE mac = ?1",
                params![mac.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    /// Bumps the failure counter; when it reaches `ban_limit`, stamps and
    /// returns the new `banned_until`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn failure_record(
        &self,
        mac: &MacAddr,
        now: i64,
        ban_limit: u32,
        ban_duration_secs: i64,
    ) -> Result<Option<i64>, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO failures (mac, fail_count) VALUES (?1, 1)
             ON CONFLICT(mac) DO UPDATE SET fail_count = fail_count + 1",
            params![mac.to_string()],
        )?;
        let count: u32 = tx.query_row(
            "SELECT fail_count FROM failures WHERE mac = ?1",
            params![mac.to_string()],
            |row| row.get(0),
        )?;
        let banned_until = if count >= ban_limit {
            let until = now + ban_duration_secs;
            tx.execute(
                "UPDATE failures SET banned_until = ?2 WHERE mac = ?1",
                params![mac.to_string(), until],
            )?;
            Some(until)
        } else {
            None
        };
        tx.commit()?;
        Ok(banned_until)
    }

    /// Clears the failure record for a MAC. Called on every success.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn failure_clear(&self, mac: &MacAddr) -> Result<(), StoreError> {
        self.lock().execute(
            "DELETE FROM failures WHERE mac = ?1",
            params![mac.to_string()],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sources
    // ------------------------------------------------------------------

    /// Upserts a source row, refreshing its name and heartbeat stamp.
    /// Pulse value and overrides are preserved across upserts.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn upsert_source(
        &self,
        source: &SourceId,
        display_name: &str,
        now: i64,
    ) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT INTO sources (source_id, display_name, pulse_value_pesos, last_active_at)
             VALUES (?1, ?2, 1, ?3)
             ON CONFLICT(source_id) DO UPDATE SET
                 display_name = excluded.display_name,
                 last_active_at = excluded.last_active_at",
            params![source.to_string(), display_name, now],
        )?;
        Ok(())
    }

    /// Refreshes a source's heartbeat stamp.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn touch_source(&self, source: &SourceId, now: i64) -> Result<(), StoreError> {
        self.lock().execute(
            "UPDATE sources SET last_active_at = ?2 WHERE source_id = ?1",
            params![source.to_string(), now],
        )?;
        Ok(())
    }

    /// Fetches one source row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn get_source(&self, source: &SourceId) -> Result<Option<SourceRow>, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT source_id, display_name, pulse_value_pesos, rate_down_kbps, \
                        rate_up_kbps, last_active_at
                 FROM sources WHERE source_id = ?1",
                params![source.to_string()],
                row_to_source,
            )
            .optional()?;
        Ok(row)
    }

    /// All sources, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn list_sources(&self) -> Result<Vec<SourceRow>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT source_id, display_name, pulse_value_pesos, rate_down_kbps, \
                    rate_up_kbps, last_active_at
             FROM sources ORDER BY source_id",
        )?;
        let rows = stmt
            .query_map([], row_to_source)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Sets a source's pesos-per-pulse multiplier, clamped to `1..=100`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn set_source_pulse_value(
        &self,
        source: &SourceId,
        pulse_value_pesos: u32,
    ) -> Result<(), StoreError> {
        let clamped = pulse_value_pesos.clamp(1, 100);
        self.lock().execute(
            "UPDATE sources SET pulse_value_pesos = ?2 WHERE source_id = ?1",
            params![source.to_string(), clamped],
        )?;
        Ok(())
    }

    /// Sets or clears a source's bandwidth override.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn set_source_bandwidth(
        &self,
        source: &SourceId,
        down_kbps: Option<u32>,
        up_kbps: Option<u32>,
    ) -> Result<(), StoreError> {
        self.lock().execute(
            "UPDATE sources SET rate_down_kbps = ?2, rate_up_kbps = ?3 WHERE source_id = ?1",
            params![source.to_string(), down_kbps, up_kbps],
        )?;
        Ok(())
    }

    /// Replaces a source's visible-rate subset. An empty slice clears the
    /// mask, restoring full-table visibility.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn set_source_visible_rates(
        &self,
        source: &SourceId,
        rate_ids: &[i64],
    ) -> Result<(), StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM source_rates WHERE source_id = ?1",
            params![source.to_string()],
        )?;
        for rate_id in rate_ids {
            tx.execute(
                "INSERT OR IGNORE INTO source_rates (source_id, rate_id) VALUES (?1, ?2)",
                params![source.to_string(), rate_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Rates
    // ------------------------------------------------------------------

    /// Inserts one price line, returning its id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn insert_rate(
        &self,
        amount_pesos: u32,
        minutes: u32,
        up_kbps: u32,
        down_kbps: u32,
    ) -> Result<i64, StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO rates (amount_pesos, minutes, up_kbps, down_kbps) \
             VALUES (?1, ?2, ?3, ?4)",
            params![amount_pesos, minutes, up_kbps, down_kbps],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Deletes one price line and its visibility entries.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn delete_rate(&self, rate_id: i64) -> Result<(), StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM rates WHERE id = ?1", params![rate_id])?;
        tx.execute(
            "DELETE FROM source_rates WHERE rate_id = ?1",
            params![rate_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Loads the full price table with per-source visibility.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn load_rate_table(&self) -> Result<RateTable, StoreError> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT id, amount_pesos, minutes, up_kbps, down_kbps FROM rates")?;
        let lines = stmt
            .query_map([], |row| {
                Ok(Rate {
                    id: row.get(0)?,
                    amount_pesos: row.get(1)?,
                    minutes: row.get(2)?,
                    up_kbps: row.get(3)?,
                    down_kbps: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = conn.prepare("SELECT source_id, rate_id FROM source_rates")?;
        let mut visibility: HashMap<String, HashSet<i64>> = HashMap::new();
        let pairs = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (source, rate_id) in pairs {
            visibility.entry(source).or_default().insert(rate_id);
        }
        Ok(RateTable::new(lines, visibility))
    }

    // ------------------------------------------------------------------
    // Config
    // ------------------------------------------------------------------

    /// Reads a config value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn get_config(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.lock();
        let value = conn
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Writes a config value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn set_config(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

/// Column list shared by every user SELECT so `row_to_user` indexes stay
/// in one place.
const USER_COLS: &str = "user_id, mac, client_id, ip, user_code, credit_seconds, \
    total_seconds_ever, rate_down_kbps, rate_up_kbps, paused, connected, \
    last_traffic_at, last_seen_at, session_expiry_at";

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<UserRecord> {
    let mac_raw: String = row.get(1)?;
    let mac = MacAddr::parse(&mac_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let ip_raw: Option<String> = row.get(3)?;
    let ip = match ip_raw {
        Some(raw) => Some(raw.parse::<Ipv4Addr>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?),
        None => None,
    };
    Ok(UserRecord {
        user_id: row.get(0)?,
        mac,
        client_id: row.get(2)?,
        ip,
        user_code: row.get(4)?,
        credit_seconds: row.get(5)?,
        total_seconds_ever: row.get(6)?,
        rate_down_kbps: row.get(7)?,
        rate_up_kbps: row.get(8)?,
        paused: row.get(9)?,
        connected: row.get(10)?,
        last_traffic_at: row.get(11)?,
        last_seen_at: row.get(12)?,
        session_expiry_at: row.get(13)?,
    })
}

fn row_to_source(row: &Row<'_>) -> rusqlite::Result<SourceRow> {
    let id_raw: String = row.get(0)?;
    let source = SourceId::parse(&id_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(SourceRow {
        source,
        display_name: row.get(1)?,
        pulse_value_pesos: row.get(2)?,
        rate_down_kbps: row.get(3)?,
        rate_up_kbps: row.get(4)?,
        last_active_at: row.get(5)?,
    })
}

fn generate_unique_code(conn: &Connection) -> Result<String, StoreError> {
    let mut rng = rand::thread_rng();
    for _ in 0..CODE_GEN_ATTEMPTS {
        let body: String = (0..CODE_BODY_LEN)
            .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
            .collect();
        let code = format!("{CODE_PREFIX}{body}");
        let taken: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM users WHERE user_code = ?1",
                params![code],
                |row| row.get(0),
            )
            .optional()?;
        if taken.is_none() {
            return Ok(code);
        }
    }
    Err(StoreError::CodeSpaceExhausted {
        attempts: CODE_GEN_ATTEMPTS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(n: u8) -> MacAddr {
        MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, n])
    }

    fn store() -> SessionStore {
        SessionStore::open_in_memory().unwrap()
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vendo.db");
        let store = SessionStore::open(&path).unwrap();
        let user = store.create_user(&mac(1), None, None, 100).unwrap();
        drop(store);
        // Reopen and find the same record.
        let store = SessionStore::open(&path).unwrap();
        let found = store.find_by_mac(&mac(1)).unwrap().unwrap();
        assert_eq!(found.user_id, user.user_id);
    }

    #[test]
    fn test_user_code_shape() {
        let store = store();
        let user = store.create_user(&mac(1), None, None, 0).unwrap();
        assert!(user.user_code.starts_with("CJ-"));
        let body = &user.user_code[3..];
        assert_eq!(body.len(), 6);
        assert!(body
            .bytes()
            .all(|b| CODE_ALPHABET.contains(&b)));
    }

    #[test]
    fn test_find_by_code_case_insensitive() {
        let store = store();
        let user = store.create_user(&mac(1), None, None, 0).unwrap();
        let lowered = user.user_code.to_lowercase();
        let found = store.find_by_code(&lowered).unwrap().unwrap();
        assert_eq!(found.user_id, user.user_id);
    }

    #[test]
    fn test_find_by_mac_normalizes_legacy_rows() {
        let store = store();
        let user = store.create_user(&mac(1), None, None, 0).unwrap();
        // Simulate a legacy row written with uppercase.
        store
            .lock()
            .execute(
                "UPDATE users SET mac = ?1 WHERE user_id = ?2",
                params!["AA:BB:CC:DD:EE:01", user.user_id],
            )
            .unwrap();
        let found = store.find_by_mac(&mac(1)).unwrap().unwrap();
        assert_eq!(found.mac, mac(1));
        // The row itself is rewritten canonical.
        let stored: String = store
            .lock()
            .query_row(
                "SELECT mac FROM users WHERE user_id = ?1",
                params![found.user_id],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(stored, "aa:bb:cc:dd:ee:01");
    }

    #[test]
    fn test_claim_mac_evicts_stale_record() {
        let store = store();
        let keeper = store.create_user(&mac(1), Some("C1"), None, 0).unwrap();
        let stale = store.create_user(&mac(2), None, None, 0).unwrap();
        store.claim_mac(&keeper.user_id, &mac(2)).unwrap();
        assert!(store.get_user(&stale.user_id).unwrap().is_none());
        let moved = store.get_user(&keeper.user_id).unwrap().unwrap();
        assert_eq!(moved.mac, mac(2));
    }

    #[test]
    fn test_assign_ip_is_exclusive() {
        let store = store();
        let a = store.create_user(&mac(1), None, None, 0).unwrap();
        let b = store.create_user(&mac(2), None, None, 0).unwrap();
        let ip = Ipv4Addr::new(10, 0, 0, 9);
        store.assign_ip(&a.user_id, ip).unwrap();
        store.assign_ip(&b.user_id, ip).unwrap();
        assert_eq!(store.get_user(&a.user_id).unwrap().unwrap().ip, None);
        assert_eq!(store.get_user(&b.user_id).unwrap().unwrap().ip, Some(ip));

        // Ownership is only visible while the holder is active.
        assert!(store.find_active_by_ip(ip).unwrap().is_none());
        store
            .apply_credit(&b.user_id, 60, 0, 0, None, None, 0)
            .unwrap();
        let owner = store.find_active_by_ip(ip).unwrap().unwrap();
        assert_eq!(owner.user_id, b.user_id);
    }

    #[test]
    fn test_decrement_clamps_at_zero() {
        let store = store();
        let user = store.create_user(&mac(1), None, None, 0).unwrap();
        store
            .apply_credit(&user.user_id, 5, 0, 0, None, None, 0)
            .unwrap();
        assert_eq!(store.decrement(&user.user_id, 3).unwrap(), 2);
        assert_eq!(store.decrement(&user.user_id, 10).unwrap(), 0);
    }

    #[test]
    fn test_apply_credit_field_updates() {
        let store = store();
        let user = store.create_user(&mac(1), None, None, 0).unwrap();
        store.pause(&user.user_id).unwrap();
        store
            .apply_credit(&user.user_id, 180, 1024, 2048, None, Some("C1"), 50)
            .unwrap();
        let after = store.get_user(&user.user_id).unwrap().unwrap();
        assert_eq!(after.credit_seconds, 180);
        assert_eq!(after.total_seconds_ever, 180);
        assert!(!after.paused);
        assert!(after.connected);
        assert_eq!(after.client_id.as_deref(), Some("C1"));
        assert_eq!(after.rate_up_kbps, 1024);
        assert_eq!(after.rate_down_kbps, 2048);
        assert_eq!(after.last_traffic_at, 50);

        // Second credit merges rates by max and keeps the cookie.
        store
            .apply_credit(&user.user_id, 60, 512, 4096, None, None, 60)
            .unwrap();
        let after = store.get_user(&user.user_id).unwrap().unwrap();
        assert_eq!(after.credit_seconds, 240);
        assert_eq!(after.total_seconds_ever, 240);
        assert_eq!(after.client_id.as_deref(), Some("C1"));
        assert_eq!(after.rate_up_kbps, 1024);
        assert_eq!(after.rate_down_kbps, 4096);
    }

    #[test]
    fn test_apply_credit_override_wins() {
        let store = store();
        let user = store.create_user(&mac(1), None, None, 0).unwrap();
        store
            .apply_credit(&user.user_id, 60, 1024, 2048, Some((256, 512)), None, 0)
            .unwrap();
        let after = store.get_user(&user.user_id).unwrap().unwrap();
        assert_eq!(after.rate_up_kbps, 256);
        assert_eq!(after.rate_down_kbps, 512);
    }

    #[test]
    fn test_iterate_active_excludes_paused_and_expired() {
        let store = store();
        let a = store.create_user(&mac(1), None, None, 0).unwrap();
        let b = store.create_user(&mac(2), None, None, 0).unwrap();
        let c = store.create_user(&mac(3), None, None, 0).unwrap();
        store.apply_credit(&a.user_id, 60, 0, 0, None, None, 0).unwrap();
        store.apply_credit(&b.user_id, 60, 0, 0, None, None, 0).unwrap();
        store.pause(&b.user_id).unwrap();
        // c never credited.
        let _ = c;
        let active = store.iterate_active().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].user_id, a.user_id);
    }

    #[test]
    fn test_expire_zeroes_and_disconnects() {
        let store = store();
        let user = store.create_user(&mac(1), None, None, 0).unwrap();
        store.apply_credit(&user.user_id, 60, 0, 0, None, None, 0).unwrap();
        store.expire(&user.user_id, 99).unwrap();
        let after = store.get_user(&user.user_id).unwrap().unwrap();
        assert_eq!(after.credit_seconds, 0);
        assert!(!after.connected);
        assert_eq!(after.session_expiry_at, Some(99));
    }

    #[test]
    fn test_sales_are_append_only_and_summarized() {
        let store = store();
        store.record_sale(100, 3, &mac(1), &SourceId::Hardware).unwrap();
        store
            .record_sale(200, 5, &mac(2), &SourceId::remote("booth-a"))
            .unwrap();
        store
            .record_sale(100_000, 10, &mac(1), &SourceId::Hardware)
            .unwrap();

        let summary = store.sales_summary(0, 1_000_000, 0).unwrap();
        assert_eq!(summary.total_pesos, 18);
        assert_eq!(
            summary.by_source,
            vec![
                ("hardware".to_string(), 13),
                ("remote:booth-a".to_string(), 5)
            ]
        );
        assert_eq!(
            summary.by_day,
            vec![
                ("1970-01-01".to_string(), 8),
                ("1970-01-02".to_string(), 10)
            ]
        );

        // A tenant offset shifts day boundaries, not the stored rows.
        let shifted = store.sales_summary(0, 1_000_000, -120).unwrap();
        assert_eq!(shifted.total_pesos, 18);

        // Range bounds are half-open.
        let summary = store.sales_summary(0, 150, 0).unwrap();
        assert_eq!(summary.total_pesos, 3);
    }

    #[test]
    fn test_failure_record_bans_at_limit() {
        let store = store();
        let m = mac(1);
        assert_eq!(store.failure_record(&m, 100, 3, 60).unwrap(), None);
        assert_eq!(store.failure_record(&m, 101, 3, 60).unwrap(), None);
        assert_eq!(store.failure_record(&m, 102, 3, 60).unwrap(), Some(162));
        let (count, until) = store.failure_state(&m).unwrap().unwrap();
        assert_eq!(count, 3);
        assert_eq!(until, Some(162));
        store.failure_clear(&m).unwrap();
        assert!(store.failure_state(&m).unwrap().is_none());
    }

    #[test]
    fn test_source_upsert_preserves_tuning() {
        let store = store();
        let src = SourceId::remote("booth-a");
        store.upsert_source(&src, "Booth A", 100).unwrap();
        store.set_source_pulse_value(&src, 5).unwrap();
        store.set_source_bandwidth(&src, Some(2048), Some(1024)).unwrap();
        // A later heartbeat upsert must not reset tuning.
        store.upsert_source(&src, "Booth A2", 200).unwrap();
        let row = store.get_source(&src).unwrap().unwrap();
        assert_eq!(row.display_name, "Booth A2");
        assert_eq!(row.pulse_value_pesos, 5);
        assert_eq!(row.rate_down_kbps, Some(2048));
        assert_eq!(row.last_active_at, 200);
        assert!(row.online(250, 70));
        assert!(!row.online(271, 70));
    }

    #[test]
    fn test_pulse_value_clamped() {
        let store = store();
        let src = SourceId::remote("booth-a");
        store.upsert_source(&src, "Booth A", 0).unwrap();
        store.set_source_pulse_value(&src, 0).unwrap();
        assert_eq!(store.get_source(&src).unwrap().unwrap().pulse_value_pesos, 1);
        store.set_source_pulse_value(&src, 500).unwrap();
        assert_eq!(
            store.get_source(&src).unwrap().unwrap().pulse_value_pesos,
            100
        );
    }

    #[test]
    fn test_rate_table_round_trip() {
        let store = store();
        let base = store.insert_rate(1, 1, 128, 256).unwrap();
        let five = store.insert_rate(5, 7, 1024, 2048).unwrap();
        let src = SourceId::remote("booth-a");
        store.upsert_source(&src, "Booth A", 0).unwrap();
        store.set_source_visible_rates(&src, &[base]).unwrap();

        let table = store.load_rate_table().unwrap();
        assert_eq!(table.lines().len(), 2);
        assert_eq!(table.visible_for(Some(&src)).len(), 1);
        assert_eq!(table.visible_for(Some(&SourceId::Hardware)).len(), 2);

        store.delete_rate(five).unwrap();
        let table = store.load_rate_table().unwrap();
        assert_eq!(table.lines().len(), 1);
    }

    #[test]
    fn test_config_round_trip() {
        let store = store();
        assert!(store.get_config("vendo_mode").unwrap().is_none());
        store.set_config("vendo_mode", "auto").unwrap();
        store.set_config("vendo_mode", "manual").unwrap();
        assert_eq!(
            store.get_config("vendo_mode").unwrap().as_deref(),
            Some("manual")
        );
    }
}
