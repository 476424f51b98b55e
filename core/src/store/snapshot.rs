use super::{new_id, now_timestamp, AgingStore, SnapshotRow};
use crate::{aging::AgingBuckets, error::DunningResult};
use chrono::NaiveDate;
use rusqlite::{params, OptionalExtension};

const SNAPSHOT_COLUMNS: &str = "snapshot_id, invoice_id, snapshot_date,
    days_0_30, days_31_60, days_61_90, days_91_120, days_over_120";

impl AgingStore {
    // ── Aging snapshots (append-only) ─────────────────────────────

    /// Most recent snapshot for an invoice regardless of its date.
    /// Same-day ties resolve to the last one written.
    pub fn latest_snapshot(&self, invoice_id: &str) -> DunningResult<Option<SnapshotRow>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {SNAPSHOT_COLUMNS} FROM invoice_aging_snapshot
                     WHERE invoice_id = ?1
                     ORDER BY snapshot_date DESC, rowid DESC
                     LIMIT 1"
                ),
                params![invoice_id],
                map_snapshot_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn create_snapshot(
        &self,
        invoice_id: &str,
        snapshot_date: NaiveDate,
        buckets: &AgingBuckets,
    ) -> DunningResult<SnapshotRow> {
        let row = SnapshotRow {
            snapshot_id: new_id(),
            invoice_id: invoice_id.to_string(),
            snapshot_date,
            buckets: *buckets,
        };
        self.conn.execute(
            "INSERT INTO invoice_aging_snapshot
                 (snapshot_id, invoice_id, snapshot_date,
                  days_0_30, days_31_60, days_61_90, days_91_120, days_over_120, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                row.snapshot_id,
                row.invoice_id,
                row.snapshot_date,
                buckets.days_0_30,
                buckets.days_31_60,
                buckets.days_61_90,
                buckets.days_91_120,
                buckets.days_over_120,
                now_timestamp(),
            ],
        )?;
        Ok(row)
    }

    /// Full history for an invoice, newest first.
    pub fn snapshots_for_invoice(&self, invoice_id: &str) -> DunningResult<Vec<SnapshotRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM invoice_aging_snapshot
             WHERE invoice_id = ?1
             ORDER BY snapshot_date DESC, rowid DESC"
        ))?;
        let rows = stmt
            .query_map(params![invoice_id], map_snapshot_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn snapshot_count(&self) -> DunningResult<i64> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM invoice_aging_snapshot",
            [],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}

fn map_snapshot_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SnapshotRow> {
    Ok(SnapshotRow {
        snapshot_id: row.get(0)?,
        invoice_id: row.get(1)?,
        snapshot_date: row.get(2)?,
        buckets: AgingBuckets {
            days_0_30: row.get(3)?,
            days_31_60: row.get(4)?,
            days_61_90: row.get(5)?,
            days_91_120: row.get(6)?,
            days_over_120: row.get(7)?,
        },
    })
}
