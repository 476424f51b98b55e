use super::AgingStore;
use crate::{
    error::DunningResult,
    event::{EventLogEntry, PipelineEvent},
};
use rusqlite::params;

impl AgingStore {
    // ── Event log ─────────────────────────────────────────────────

    pub fn append_event(&self, entry: &EventLogEntry) -> DunningResult<()> {
        self.conn.execute(
            "INSERT INTO event_log (event_type, payload, created_at) VALUES (?1, ?2, ?3)",
            params![entry.event_type, entry.payload, entry.created_at],
        )?;
        Ok(())
    }

    /// Serialize and append a pipeline event.
    pub fn record_event(&self, event: &PipelineEvent) -> DunningResult<()> {
        self.append_event(&EventLogEntry::from_event(event)?)
    }

    pub fn events_of_type(&self, event_type: &str) -> DunningResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, event_type, payload, created_at
             FROM event_log WHERE event_type = ?1
             ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![event_type], |row| {
                Ok(EventLogEntry {
                    id: Some(row.get(0)?),
                    event_type: row.get(1)?,
                    payload: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}
