//! Audit events recorded by the import and escalation pipelines.
//!
//! Events are write-only from the pipeline's point of view: they are
//! appended to `event_log` and never read back to drive behaviour.

use serde::{Deserialize, Serialize};

/// Every event the pipeline records.
/// Variants are only ever added, never removed or reordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    // ── Import ─────────────────────────────────────
    ImportCompleted {
        total_rows: usize,
        failed_rows: usize,
        accounts_created: usize,
        invoices_created: usize,
        invoices_updated: usize,
        aging_snapshots_created: usize,
    },
    ImportFailed {
        reason: String,
    },

    // ── Escalation ─────────────────────────────────
    EscalationCompleted {
        processed: usize,
        generated: usize,
        skipped: usize,
        preview_only: bool,
    },
    EmailSent {
        account_name: String,
        recipient: String,
        template_identifier: String,
        message_id: String,
        attempts: u32,
    },
    EmailFailed {
        account_name: String,
        recipient: String,
        template_identifier: String,
        error: String,
        attempts: u32,
    },
}

impl PipelineEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            PipelineEvent::ImportCompleted { .. } => "import_completed",
            PipelineEvent::ImportFailed { .. } => "import_failed",
            PipelineEvent::EscalationCompleted { .. } => "escalation_completed",
            PipelineEvent::EmailSent { .. } => "email_sent",
            PipelineEvent::EmailFailed { .. } => "email_failed",
        }
    }
}

/// Event log entry as stored in SQLite.
#[derive(Debug, Clone)]
pub struct EventLogEntry {
    pub id: Option<i64>,
    pub event_type: String,
    pub payload: String, // JSON-serialized PipelineEvent
    pub created_at: String,
}

impl EventLogEntry {
    pub fn from_event(event: &PipelineEvent) -> serde_json::Result<Self> {
        Ok(Self {
            id: None,
            event_type: event.event_type().to_string(),
            payload: serde_json::to_string(event)?,
            created_at: chrono::Utc::now().to_rfc3339(),
        })
    }

    pub fn decode(&self) -> serde_json::Result<PipelineEvent> {
        serde_json::from_str(&self.payload)
    }
}
