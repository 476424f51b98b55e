use super::{new_id, now_timestamp, AgingStore, InvoiceRow, NewInvoice};
use crate::error::DunningResult;
use rusqlite::{params, OptionalExtension};

impl AgingStore {
    // ── Invoice ───────────────────────────────────────────────────

    /// Invoice numbers are a global business key, independent of account.
    pub fn get_invoice_by_number(&self, invoice_number: &str) -> DunningResult<Option<InvoiceRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT invoice_id, account_id, invoice_number, invoice_date,
                        invoice_amount, total_outstanding
                 FROM invoice WHERE invoice_number = ?1",
                params![invoice_number],
                map_invoice_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_invoice(&self, invoice_id: &str) -> DunningResult<Option<InvoiceRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT invoice_id, account_id, invoice_number, invoice_date,
                        invoice_amount, total_outstanding
                 FROM invoice WHERE invoice_id = ?1",
                params![invoice_id],
                map_invoice_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn create_invoice(&self, new: &NewInvoice<'_>) -> DunningResult<InvoiceRow> {
        let now = now_timestamp();
        let row = InvoiceRow {
            invoice_id: new_id(),
            account_id: new.account_id.to_string(),
            invoice_number: new.invoice_number.to_string(),
            invoice_date: new.invoice_date,
            invoice_amount: new.invoice_amount,
            total_outstanding: new.total_outstanding,
        };
        self.conn.execute(
            "INSERT INTO invoice (invoice_id, account_id, invoice_number, invoice_date,
                                  invoice_amount, total_outstanding, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                row.invoice_id,
                row.account_id,
                row.invoice_number,
                row.invoice_date,
                row.invoice_amount,
                row.total_outstanding,
                now,
            ],
        )?;
        Ok(row)
    }

    /// Overwrite the two amount fields. Callers decide whether anything changed.
    pub fn update_invoice_amounts(
        &self,
        invoice_id: &str,
        invoice_amount: f64,
        total_outstanding: f64,
    ) -> DunningResult<()> {
        self.conn.execute(
            "UPDATE invoice SET invoice_amount = ?1, total_outstanding = ?2, updated_at = ?3
             WHERE invoice_id = ?4",
            params![invoice_amount, total_outstanding, now_timestamp(), invoice_id],
        )?;
        Ok(())
    }

    pub fn invoices_for_account(&self, account_id: &str) -> DunningResult<Vec<InvoiceRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT invoice_id, account_id, invoice_number, invoice_date,
                    invoice_amount, total_outstanding
             FROM invoice WHERE account_id = ?1
             ORDER BY invoice_date ASC, invoice_number ASC",
        )?;
        let rows = stmt
            .query_map(params![account_id], map_invoice_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn invoice_count(&self) -> DunningResult<i64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM invoice", [], |row| row.get(0))?;
        Ok(n)
    }
}

fn map_invoice_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<InvoiceRow> {
    Ok(InvoiceRow {
        invoice_id: row.get(0)?,
        account_id: row.get(1)?,
        invoice_number: row.get(2)?,
        invoice_date: row.get(3)?,
        invoice_amount: row.get(4)?,
        total_outstanding: row.get(5)?,
    })
}
