//! SQLite persistence for invoices and API credentials.
//!
//! The store is the single source of truth. Every status change is a
//! compare-and-swap (`UPDATE ... WHERE status = ?expected`) so a cancel request
//! racing a reconciliation tick can never lose an update, and a terminal row is
//! never written again.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use alloy::primitives::Address;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::constants::{Chain, Token};
use crate::credentials::ApiCredential;
use crate::error::{GhostpayError, Result};
use crate::invoice::{Invoice, InvoiceFilter, InvoicePage, InvoiceStatus};

/// Latest schema version understood by this build.
pub const SCHEMA_VERSION: i64 = 2;

const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS invoices (
    id              TEXT PRIMARY KEY,
    chain           TEXT NOT NULL CHECK(chain IN ('BSC','POLYGON')),
    token           TEXT NOT NULL CHECK(token IN ('USDT','BNB','POL')),
    amount_native   TEXT NOT NULL,
    amount_usd      REAL,
    deposit_address TEXT NOT NULL,
    hd_index        INTEGER NOT NULL,
    status          TEXT NOT NULL DEFAULT 'pending'
                    CHECK(status IN ('pending','underpaid','confirming',
                                     'sweeping','completed','expired','failed')),
    tx_in_hash      TEXT,
    gas_tx_hash     TEXT,
    tx_out_hash     TEXT,
    webhook_url     TEXT,
    metadata        TEXT,
    created_at      TEXT NOT NULL,
    expires_at      TEXT NOT NULL,
    confirmed_at    TEXT,
    completed_at    TEXT
);

CREATE TABLE IF NOT EXISTS api_keys (
    id              TEXT PRIMARY KEY,
    label           TEXT NOT NULL,
    key_hash        TEXT NOT NULL UNIQUE,
    key_prefix      TEXT NOT NULL,
    is_active       INTEGER NOT NULL DEFAULT 1,
    created_at      TEXT NOT NULL,
    last_used_at    TEXT
);

CREATE INDEX IF NOT EXISTS idx_invoices_status  ON invoices(status);
CREATE INDEX IF NOT EXISTS idx_invoices_chain   ON invoices(chain);
CREATE INDEX IF NOT EXISTS idx_invoices_created ON invoices(created_at);
CREATE INDEX IF NOT EXISTS idx_api_keys_hash    ON api_keys(key_hash);

PRAGMA user_version = 1;
"#;

// Confirmation depth tracking and sweep leases.
const MIGRATION_V2: &str = r#"
ALTER TABLE invoices ADD COLUMN confirmed_block  INTEGER;
ALTER TABLE invoices ADD COLUMN claim_owner      TEXT;
ALTER TABLE invoices ADD COLUMN claim_expires_at TEXT;
CREATE UNIQUE INDEX IF NOT EXISTS idx_invoices_hd_index ON invoices(hd_index);

PRAGMA user_version = 2;
"#;

const INVOICE_COLUMNS: &str = "id, chain, token, amount_native, amount_usd, deposit_address, \
     hd_index, status, gas_tx_hash, tx_out_hash, webhook_url, metadata, created_at, \
     expires_at, confirmed_at, completed_at, confirmed_block";

const CREDENTIAL_COLUMNS: &str =
    "id, label, key_hash, key_prefix, is_active, created_at, last_used_at";

/// Fields of a new invoice chosen before its derivation index is known.
#[derive(Debug, Clone)]
pub struct InvoiceDraft {
    pub id: String,
    pub chain: Chain,
    pub token: Token,
    pub amount_requested: String,
    pub amount_usd: Option<f64>,
    pub webhook_url: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Canonical timestamp encoding. Fixed width, so stored values compare lexically.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn conversion_err(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn invoice_from_row(row: &Row<'_>) -> rusqlite::Result<Invoice> {
    let chain: String = row.get(1)?;
    let token: String = row.get(2)?;
    let deposit_address: String = row.get(5)?;
    let status: String = row.get(7)?;
    let metadata: Option<String> = row.get(11)?;
    let created_at: String = row.get(12)?;
    let expires_at: String = row.get(13)?;
    let confirmed_at: Option<String> = row.get(14)?;
    let completed_at: Option<String> = row.get(15)?;
    let confirmed_block: Option<i64> = row.get(16)?;

    Ok(Invoice {
        id: row.get(0)?,
        chain: Chain::parse(&chain)
            .ok_or_else(|| conversion_err(1, format!("unknown chain '{chain}'")))?,
        token: Token::parse(&token)
            .ok_or_else(|| conversion_err(2, format!("unknown token '{token}'")))?,
        amount_requested: row.get(3)?,
        amount_usd: row.get(4)?,
        deposit_address: deposit_address
            .parse::<Address>()
            .map_err(|e| conversion_err(5, format!("bad deposit address: {e}")))?,
        hd_index: row.get(6)?,
        status: InvoiceStatus::parse(&status)
            .ok_or_else(|| conversion_err(7, format!("unknown status '{status}'")))?,
        gas_tx_hash: row.get(8)?,
        tx_out_hash: row.get(9)?,
        webhook_url: row.get::<_, Option<String>>(10)?.filter(|u| !u.is_empty()),
        // Rows written by older releases may hold non-JSON metadata; keep it as a string.
        metadata: metadata.map(|m| {
            serde_json::from_str(&m).unwrap_or(serde_json::Value::String(m))
        }),
        created_at: parse_ts(12, &created_at)?,
        expires_at: parse_ts(13, &expires_at)?,
        confirmed_at: confirmed_at.as_deref().map(|s| parse_ts(14, s)).transpose()?,
        completed_at: completed_at.as_deref().map(|s| parse_ts(15, s)).transpose()?,
        confirmed_block: confirmed_block.and_then(|b| u64::try_from(b).ok()),
    })
}

fn credential_from_row(row: &Row<'_>) -> rusqlite::Result<ApiCredential> {
    let created_at: String = row.get(5)?;
    let last_used_at: Option<String> = row.get(6)?;
    Ok(ApiCredential {
        id: row.get(0)?,
        label: row.get(1)?,
        key_hash: row.get(2)?,
        key_prefix: row.get(3)?,
        active: row.get::<_, i64>(4)? == 1,
        created_at: parse_ts(5, &created_at)?,
        last_used_at: last_used_at.as_deref().map(|s| parse_ts(6, s)).transpose()?,
    })
}

/// Durable invoice and credential records.
pub struct InvoiceStore {
    conn: Mutex<Connection>,
}

impl InvoiceStore {
    /// Open (or create) the database at `path` and bring its schema up to date.
    /// `":memory:"` gives a private in-memory database.
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() && path != ":memory:" {
                std::fs::create_dir_all(parent).map_err(|e| {
                    GhostpayError::Configuration(format!("cannot create {}: {e}", parent.display()))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA foreign_keys=ON;",
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;
        migrate(&conn)?;

        // Credential hashes and deposit indices live here; keep the file owner-only.
        #[cfg(unix)]
        if path != ":memory:" {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
                tracing::warn!(path = %path, error = %e, "failed to restrict database file permissions");
            }
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(c) => c,
            Err(poisoned) => {
                tracing::error!("invoice store mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn schema_version(&self) -> Result<i64> {
        Ok(self
            .conn()
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    // ── Invoices ────────────────────────────────────────────────────────

    /// Insert a new `pending` invoice under the next derivation index.
    ///
    /// The index is `MAX(hd_index) + 1` (starting at 1) and is allocated in the
    /// same transaction as the insert, so concurrent creations never share one.
    /// `derive` maps the allocated index to its deposit address.
    pub fn insert_invoice(
        &self,
        draft: InvoiceDraft,
        derive: impl FnOnce(i64) -> Result<Address>,
    ) -> Result<Invoice> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let max_index: Option<i64> =
            tx.query_row("SELECT MAX(hd_index) FROM invoices", [], |row| row.get(0))?;
        let hd_index = max_index.unwrap_or(0) + 1;
        let deposit_address = derive(hd_index)?;
        let metadata = draft
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        tx.execute(
            r#"
            INSERT INTO invoices
                (id, chain, token, amount_native, amount_usd, deposit_address, hd_index,
                 status, webhook_url, metadata, created_at, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, ?9, ?10, ?11)
            "#,
            params![
                draft.id,
                draft.chain.as_str(),
                draft.token.as_str(),
                draft.amount_requested,
                draft.amount_usd,
                deposit_address.to_string(),
                hd_index,
                draft.webhook_url,
                metadata,
                fmt_ts(draft.created_at),
                fmt_ts(draft.expires_at),
            ],
        )?;
        tx.commit()?;

        // Read back so timestamps carry the stored precision.
        Ok(conn.query_row(
            &format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = ?1"),
            params![draft.id],
            invoice_from_row,
        )?)
    }

    pub fn get_invoice(&self, id: &str) -> Result<Option<Invoice>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = ?1"),
                params![id],
                invoice_from_row,
            )
            .optional()?)
    }

    /// Every invoice that can still change, oldest index first.
    pub fn list_live(&self) -> Result<Vec<Invoice>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices \
             WHERE status IN ('pending','underpaid','confirming','sweeping') \
             ORDER BY hd_index ASC"
        ))?;
        let invoices = stmt
            .query_map([], invoice_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(invoices)
    }

    /// Newest-first listing. `page` starts at 1, `limit` is clamped to 1..=500.
    pub fn list_invoices(&self, filter: InvoiceFilter, page: u32, limit: u32) -> Result<InvoicePage> {
        let page = page.max(1);
        let limit = limit.clamp(1, 500);

        let mut clause = String::from(" WHERE 1=1");
        let mut args: Vec<Value> = Vec::new();
        if let Some(status) = filter.status {
            clause.push_str(" AND status = ?");
            args.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(chain) = filter.chain {
            clause.push_str(" AND chain = ?");
            args.push(Value::Text(chain.as_str().to_string()));
        }

        let conn = self.conn();
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM invoices{clause}"),
            params_from_iter(args.iter()),
            |row| row.get(0),
        )?;

        let mut page_args = args;
        page_args.push(Value::Integer(i64::from(limit)));
        page_args.push(Value::Integer(i64::from(page - 1) * i64::from(limit)));
        let mut stmt = conn.prepare(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices{clause} \
             ORDER BY created_at DESC, hd_index DESC LIMIT ? OFFSET ?"
        ))?;
        let invoices = stmt
            .query_map(params_from_iter(page_args.iter()), invoice_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(InvoicePage {
            invoices,
            total: u64::try_from(total).unwrap_or(0),
            page,
            limit,
        })
    }

    /// Number of invoices per status, for dashboards.
    pub fn status_counts(&self) -> Result<HashMap<InvoiceStatus, u64>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM invoices GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(status, count)| {
                InvoiceStatus::parse(&status).map(|s| (s, u64::try_from(count).unwrap_or(0)))
            })
            .collect())
    }

    /// `from -> to` status change for unclaimed invoices. Entering a terminal
    /// state also stamps `completed_at` for `completed` and clears any stale lease.
    /// Returns `false` when the row was not in `from` (or is leased).
    pub fn transition(
        &self,
        id: &str,
        from: InvoiceStatus,
        to: InvoiceStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self.conn().execute(
            r#"
            UPDATE invoices
               SET status = ?3,
                   claim_owner = NULL,
                   claim_expires_at = NULL
             WHERE id = ?1 AND status = ?2
               AND (claim_expires_at IS NULL OR claim_expires_at <= ?4)
            "#,
            params![id, from.as_str(), to.as_str(), fmt_ts(now)],
        )?;
        Ok(changed == 1)
    }

    /// Record full payment: `from -> confirming` with detection time and block.
    pub fn mark_confirming(
        &self,
        id: &str,
        from: InvoiceStatus,
        confirmed_at: DateTime<Utc>,
        confirmed_block: Option<u64>,
    ) -> Result<bool> {
        let block = confirmed_block.and_then(|b| i64::try_from(b).ok());
        let changed = self.conn().execute(
            r#"
            UPDATE invoices
               SET status = 'confirming', confirmed_at = ?3, confirmed_block = ?4
             WHERE id = ?1 AND status = ?2
            "#,
            params![id, from.as_str(), fmt_ts(confirmed_at), block],
        )?;
        Ok(changed == 1)
    }

    // ── Sweep leases ────────────────────────────────────────────────────

    /// Take the sweep lease of a `sweeping` invoice unless another owner holds a live one.
    pub fn try_claim(
        &self,
        id: &str,
        owner: &str,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Result<bool> {
        let changed = self.conn().execute(
            r#"
            UPDATE invoices
               SET claim_owner = ?2, claim_expires_at = ?4
             WHERE id = ?1 AND status = 'sweeping'
               AND (claim_expires_at IS NULL OR claim_expires_at <= ?3)
            "#,
            params![id, owner, fmt_ts(now), fmt_ts(now + lease)],
        )?;
        Ok(changed == 1)
    }

    pub fn release_claim(&self, id: &str, owner: &str) -> Result<bool> {
        let changed = self.conn().execute(
            r#"
            UPDATE invoices
               SET claim_owner = NULL, claim_expires_at = NULL
             WHERE id = ?1 AND claim_owner = ?2 AND status = 'sweeping'
            "#,
            params![id, owner],
        )?;
        Ok(changed == 1)
    }

    /// Write-once `gas_tx_hash`, only by the lease holder.
    pub fn record_gas_tx(&self, id: &str, owner: &str, tx_hash: &str) -> Result<bool> {
        let changed = self.conn().execute(
            r#"
            UPDATE invoices SET gas_tx_hash = ?3
             WHERE id = ?1 AND claim_owner = ?2 AND status = 'sweeping'
               AND gas_tx_hash IS NULL
            "#,
            params![id, owner, tx_hash],
        )?;
        Ok(changed == 1)
    }

    /// Write-once `tx_out_hash`, only by the lease holder.
    pub fn record_tx_out(&self, id: &str, owner: &str, tx_hash: &str) -> Result<bool> {
        let changed = self.conn().execute(
            r#"
            UPDATE invoices SET tx_out_hash = ?3
             WHERE id = ?1 AND claim_owner = ?2 AND status = 'sweeping'
               AND tx_out_hash IS NULL
            "#,
            params![id, owner, tx_hash],
        )?;
        Ok(changed == 1)
    }

    /// `sweeping -> completed` by the lease holder once the outbound transfer is mined.
    pub fn complete_sweep(&self, id: &str, owner: &str, completed_at: DateTime<Utc>) -> Result<bool> {
        let changed = self.conn().execute(
            r#"
            UPDATE invoices
               SET status = 'completed', completed_at = ?3,
                   claim_owner = NULL, claim_expires_at = NULL
             WHERE id = ?1 AND claim_owner = ?2 AND status = 'sweeping'
               AND tx_out_hash IS NOT NULL
            "#,
            params![id, owner, fmt_ts(completed_at)],
        )?;
        Ok(changed == 1)
    }

    /// `sweeping -> failed` by the lease holder (unrecoverable settlement error).
    pub fn fail_claimed(&self, id: &str, owner: &str) -> Result<bool> {
        let changed = self.conn().execute(
            r#"
            UPDATE invoices
               SET status = 'failed', claim_owner = NULL, claim_expires_at = NULL
             WHERE id = ?1 AND claim_owner = ?2 AND status = 'sweeping'
            "#,
            params![id, owner],
        )?;
        Ok(changed == 1)
    }

    // ── API credentials ─────────────────────────────────────────────────

    pub fn insert_credential(&self, credential: &ApiCredential) -> Result<()> {
        self.conn().execute(
            r#"
            INSERT INTO api_keys (id, label, key_hash, key_prefix, is_active, created_at, last_used_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                credential.id,
                credential.label,
                credential.key_hash,
                credential.key_prefix,
                i64::from(credential.active),
                fmt_ts(credential.created_at),
                credential.last_used_at.map(fmt_ts),
            ],
        )?;
        Ok(())
    }

    pub fn credential_by_hash(&self, key_hash: &str) -> Result<Option<ApiCredential>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {CREDENTIAL_COLUMNS} FROM api_keys WHERE key_hash = ?1"),
                params![key_hash],
                credential_from_row,
            )
            .optional()?)
    }

    pub fn get_credential(&self, id: &str) -> Result<Option<ApiCredential>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {CREDENTIAL_COLUMNS} FROM api_keys WHERE id = ?1"),
                params![id],
                credential_from_row,
            )
            .optional()?)
    }

    /// Stamp `last_used_at` on an active credential.
    pub fn touch_credential(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE api_keys SET last_used_at = ?2 WHERE id = ?1 AND is_active = 1",
            params![id, fmt_ts(at)],
        )?;
        Ok(changed == 1)
    }

    /// Deactivate a credential. There is no inverse operation.
    pub fn revoke_credential(&self, id: &str) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE api_keys SET is_active = 0 WHERE id = ?1 AND is_active = 1",
            params![id],
        )?;
        Ok(changed == 1)
    }

    /// Remove a credential; only revoked ones may be deleted.
    pub fn delete_revoked_credential(&self, id: &str) -> Result<bool> {
        let changed = self.conn().execute(
            "DELETE FROM api_keys WHERE id = ?1 AND is_active = 0",
            params![id],
        )?;
        Ok(changed == 1)
    }

    /// Newest-first credential listing.
    pub fn list_credentials(&self, page: u32, limit: u32) -> Result<Vec<ApiCredential>> {
        let page = page.max(1);
        let limit = limit.clamp(1, 500);
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM api_keys ORDER BY created_at DESC LIMIT ?1 OFFSET ?2"
        ))?;
        let credentials = stmt
            .query_map(
                params![i64::from(limit), i64::from(page - 1) * i64::from(limit)],
                credential_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(credentials)
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version > SCHEMA_VERSION {
        return Err(GhostpayError::Configuration(format!(
            "database schema version {version} is newer than supported version {SCHEMA_VERSION}"
        )));
    }
    if version < 1 {
        conn.execute_batch(SCHEMA_V1)?;
        tracing::info!("applied initial invoice schema");
    }
    if version < 2 {
        conn.execute_batch(MIGRATION_V2)?;
        tracing::info!("migrated invoice schema to version 2");
    }
    Ok(())
}
