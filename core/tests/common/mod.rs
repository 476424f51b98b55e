//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use chrono::NaiveDate;
use dunning_core::{
    config::AppConfig,
    csv_import::{import_csv, ImportOptions, ImportResult},
    store::AgingStore,
    templates::{TemplateData, TemplateService},
};

pub const HEADER: &str = "Client ID,Client Name,Email Address,Invoice #,Invoice Date,Invoice Amount,Current (0-30),31-60 Days,61-90 Days,91-120 Days,120+ Days,Total Outstanding";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Migrated in-memory store.
pub fn store() -> AgingStore {
    init_logging();
    let store = AgingStore::in_memory().expect("in-memory store");
    store.migrate().expect("migration");
    store
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

pub fn options(snapshot_date: NaiveDate) -> ImportOptions {
    ImportOptions::on(snapshot_date, &AppConfig::default_test().import)
}

/// Header plus the given data lines.
pub fn csv(lines: &[&str]) -> String {
    let mut out = String::from(HEADER);
    for line in lines {
        out.push('\n');
        out.push_str(line);
    }
    out.push('\n');
    out
}

pub fn import(store: &AgingStore, lines: &[&str], snapshot_date: NaiveDate) -> ImportResult {
    import_csv(store, &csv(lines), &options(snapshot_date)).expect("import")
}

/// Active templates for degrees 1-3 with plain variable placeholders.
pub fn seed_escalation_templates(store: &AgingStore) {
    let service = TemplateService::new(store);
    for (level, tone) in [(1, "Friendly reminder"), (2, "Second notice"), (3, "Final notice")] {
        service
            .create(
                &format!("ESCALATION_LEVEL_{level}"),
                &TemplateData::new(
                    format!("{tone}: {{{{account_name}}}}"),
                    format!(
                        "<p>Dear {{{{account_name}}}}, {{{{invoice_count}}}} invoice(s) totalling \
                         {{{{total_outstanding}}}} are overdue.</p>{{{{invoice_details}}}}"
                    ),
                ),
            )
            .expect("seed template");
    }
}
