//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! The importer, template service and orchestrator call store methods;
//! they never execute SQL directly.

use crate::{aging::AgingBuckets, error::DunningResult, templates::TemplateData};
use chrono::NaiveDate;
use rusqlite::Connection;

mod account;
mod event_log;
mod invoice;
mod snapshot;
mod template;

pub struct AgingStore {
    conn: Connection,
    path: Option<String>, // None for :memory:, Some(path) for file
}

impl AgingStore {
    pub fn open(path: &str) -> DunningResult<Self> {
        if path == ":memory:" {
            return Self::in_memory();
        }
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn,
            path: Some(path.to_string()),
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> DunningResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn, path: None })
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> DunningResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_aging.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_email_templates.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/003_event_log.sql"))?;
        Ok(())
    }

    // ── Transactions ──────────────────────────────────────────────

    /// Open the single transaction an import batch writes into.
    pub fn begin_batch(&self) -> DunningResult<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE;")?;
        Ok(())
    }

    pub fn commit_batch(&self) -> DunningResult<()> {
        self.conn.execute_batch("COMMIT;")?;
        Ok(())
    }

    pub fn rollback_batch(&self) -> DunningResult<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK;")?;
        }
        Ok(())
    }

    /// Run `f` inside a savepoint. On error only `f`'s writes are undone;
    /// the enclosing transaction (if any) stays open.
    pub fn in_savepoint<T>(
        &self,
        name: &str,
        f: impl FnOnce(&Self) -> DunningResult<T>,
    ) -> DunningResult<T> {
        self.conn.execute_batch(&format!("SAVEPOINT {name};"))?;
        match f(self) {
            Ok(value) => {
                self.conn.execute_batch(&format!("RELEASE {name};"))?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rb) = self
                    .conn
                    .execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name};"))
                {
                    log::error!("savepoint {name} rollback failed: {rb}");
                }
                Err(e)
            }
        }
    }

    // ── Dashboard ─────────────────────────────────────────────────

    pub fn receivables_summary(&self) -> DunningResult<ReceivablesSummary> {
        let summary = self.conn.query_row(
            "SELECT
                (SELECT COUNT(*) FROM account),
                (SELECT COUNT(*) FROM contact),
                (SELECT COUNT(*) FROM invoice),
                (SELECT COUNT(*) FROM invoice_aging_snapshot),
                (SELECT COALESCE(SUM(invoice_amount), 0.0) FROM invoice),
                (SELECT COALESCE(SUM(total_outstanding), 0.0) FROM invoice)",
            [],
            |row| {
                Ok(ReceivablesSummary {
                    account_count: row.get(0)?,
                    contact_count: row.get(1)?,
                    invoice_count: row.get(2)?,
                    snapshot_count: row.get(3)?,
                    total_invoiced: row.get(4)?,
                    total_outstanding: row.get(5)?,
                })
            },
        )?;
        Ok(summary)
    }
}

pub(crate) fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ── Row types ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct AccountRow {
    pub account_id: String,
    pub client_id: String,
    pub account_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContactRow {
    pub contact_id: String,
    pub account_id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub is_billing_contact: bool,
}

/// Contact fields supplied when an account is first created.
#[derive(Debug, Clone, PartialEq)]
pub struct NewContact {
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub is_billing_contact: bool,
}

#[derive(Debug, Clone)]
pub struct AccountWithContacts {
    pub account: AccountRow,
    pub contacts: Vec<ContactRow>,
}

impl AccountWithContacts {
    /// First billing contact, else the first contact, else none.
    pub fn primary_contact(&self) -> Option<&ContactRow> {
        self.contacts
            .iter()
            .find(|c| c.is_billing_contact)
            .or_else(|| self.contacts.first())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceRow {
    pub invoice_id: String,
    pub account_id: String,
    pub invoice_number: String,
    pub invoice_date: NaiveDate,
    pub invoice_amount: f64,
    pub total_outstanding: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewInvoice<'a> {
    pub account_id: &'a str,
    pub invoice_number: &'a str,
    pub invoice_date: NaiveDate,
    pub invoice_amount: f64,
    pub total_outstanding: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRow {
    pub snapshot_id: String,
    pub invoice_id: String,
    pub snapshot_date: NaiveDate,
    pub buckets: AgingBuckets,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct TemplateRow {
    pub template_id: String,
    pub identifier: String,
    pub version: i64,
    pub data: TemplateData,
    pub is_active: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ReceivablesSummary {
    pub account_count: i64,
    pub contact_count: i64,
    pub invoice_count: i64,
    pub snapshot_count: i64,
    pub total_invoiced: f64,
    pub total_outstanding: f64,
}
