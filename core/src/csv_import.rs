//! CSV reconciliation: aging extract → accounts, contacts, invoices, snapshots.
//!
//! Rows are processed sequentially inside one batch transaction. Each row
//! runs in its own savepoint, so a failing row is undone and reported while
//! the rest of the batch carries on. The batch commits once at the end.
//!
//! Re-importing unchanged data is a no-op: invoices are only updated when an
//! amount differs, and a snapshot is only appended when a bucket differs from
//! the invoice's most recent one.

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;
use std::time::Instant;

use crate::aging::{AgingBuckets, AgingSnapshotSummary};
use crate::config::ImportConfig;
use crate::error::{DunningError, DunningResult};
use crate::event::PipelineEvent;
use crate::store::{AccountRow, AgingStore, NewContact, NewInvoice};
use crate::types::{money_differs, AccountId, Money};

// ── Column mapping ────────────────────────────────────────────────

pub const REQUIRED_COLUMNS: [&str; 6] = [
    "Client ID",
    "Client Name",
    "Invoice #",
    "Invoice Date",
    "Invoice Amount",
    "Total Outstanding",
];

pub const OPTIONAL_COLUMNS: [&str; 6] = [
    "Email Address",
    "Current (0-30)",
    "31-60 Days",
    "61-90 Days",
    "91-120 Days",
    "120+ Days",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Column {
    ClientId,
    AccountName,
    Email,
    InvoiceNumber,
    InvoiceDate,
    InvoiceAmount,
    TotalOutstanding,
    Days0To30,
    Days31To60,
    Days61To90,
    Days91To120,
    DaysOver120,
}

impl Column {
    fn from_header(header: &str) -> Option<Column> {
        let col = match header {
            "Client ID" => Column::ClientId,
            "Client Name" => Column::AccountName,
            "Email Address" => Column::Email,
            "Invoice #" => Column::InvoiceNumber,
            "Invoice Date" => Column::InvoiceDate,
            "Invoice Amount" => Column::InvoiceAmount,
            "Total Outstanding" => Column::TotalOutstanding,
            "Current (0-30)" => Column::Days0To30,
            "31-60 Days" => Column::Days31To60,
            "61-90 Days" => Column::Days61To90,
            "91-120 Days" => Column::Days91To120,
            "120+ Days" => Column::DaysOver120,
            _ => return None,
        };
        Some(col)
    }

    fn field_name(self) -> &'static str {
        match self {
            Column::ClientId => "client_id",
            Column::AccountName => "account_name",
            Column::Email => "email",
            Column::InvoiceNumber => "invoice_number",
            Column::InvoiceDate => "invoice_date",
            Column::InvoiceAmount => "invoice_amount",
            Column::TotalOutstanding => "total_outstanding",
            Column::Days0To30 => "days_0_30",
            Column::Days31To60 => "days_31_60",
            Column::Days61To90 => "days_61_90",
            Column::Days91To120 => "days_91_120",
            Column::DaysOver120 => "days_over_120",
        }
    }
}

fn clean_header(h: &str) -> &str {
    h.trim().trim_start_matches('\u{feff}').trim()
}

// ── Report types ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactReadyClient {
    pub client_id: String,
    pub account_name: String,
    pub email_address: Option<String>,
    pub invoice_aging_snapshots: Vec<AgingSnapshotSummary>,
    pub total_outstanding_across_invoices: Money,
    pub dnc_status: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportError {
    /// 1-based data row number in the file (header excluded). 0 for file-level errors.
    pub row_number: usize,
    pub field: Option<String>,
    pub error_message: String,
    pub row_data: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportResult {
    pub success: bool,
    pub total_rows: usize,
    pub successful_rows: usize,
    pub failed_rows: usize,
    pub accounts_created: usize,
    pub accounts_found: usize,
    pub contacts_created: usize,
    pub invoices_created: usize,
    pub invoices_updated: usize,
    pub invoices_found: usize,
    pub aging_snapshots_created: usize,
    pub aging_snapshots_skipped: usize,
    /// Invoice numbers that already existed when their row was processed.
    pub repeated_invoice_numbers: Vec<String>,
    pub contact_ready_clients: Vec<ContactReadyClient>,
    pub errors: Vec<ImportError>,
    pub processing_time_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CsvValidation {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub unrecognized_columns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub snapshot_date: NaiveDate,
    pub amount_tolerance: Money,
}

impl ImportOptions {
    /// Snapshot dated today (local time).
    pub fn today(config: &ImportConfig) -> Self {
        Self {
            snapshot_date: chrono::Local::now().date_naive(),
            amount_tolerance: config.amount_tolerance,
        }
    }

    pub fn on(snapshot_date: NaiveDate, config: &ImportConfig) -> Self {
        Self {
            snapshot_date,
            amount_tolerance: config.amount_tolerance,
        }
    }
}

// ── Parsing ───────────────────────────────────────────────────────

/// One data row after column mapping. Numeric cells that fail to parse are 0;
/// an unparseable date is kept as `None` and rejected during validation.
#[derive(Debug, Clone, PartialEq)]
pub struct CsvRow {
    pub row_number: usize,
    pub client_id: String,
    pub account_name: String,
    pub email: Option<String>,
    pub invoice_number: String,
    pub invoice_date: Option<NaiveDate>,
    pub invoice_amount: Money,
    pub total_outstanding: Money,
    pub buckets: AgingBuckets,
    pub raw: BTreeMap<String, String>,
}

/// `$1,234.50` → 1234.5. Blank, unparseable or non-finite cells are 0.
pub fn parse_currency(cell: &str) -> Money {
    let cleaned: String = cell
        .trim()
        .chars()
        .filter(|c| *c != '$' && *c != ',')
        .collect();
    if cleaned.is_empty() {
        return 0.0;
    }
    cleaned
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

pub fn parse_date(cell: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(cell.trim(), "%Y-%m-%d").ok()
}

/// Parse CSV text into mapped rows. Unknown columns are ignored; rows with a
/// blank client id or invoice number are dropped silently.
pub fn parse_rows(csv_text: &str) -> DunningResult<Vec<CsvRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(csv_text.as_bytes());

    let columns: Vec<Option<Column>> = reader
        .headers()?
        .iter()
        .map(|h| Column::from_header(clean_header(h)))
        .collect();

    let mut rows = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record?;
        let mut cells: HashMap<Column, &str> = HashMap::new();
        let mut raw = BTreeMap::new();
        for (col, value) in columns.iter().zip(record.iter()) {
            if let Some(col) = col {
                let value = value.trim();
                cells.insert(*col, value);
                raw.insert(col.field_name().to_string(), value.to_string());
            }
        }
        let text = |c: Column| cells.get(&c).copied().unwrap_or("").to_string();
        let money = |c: Column| cells.get(&c).map(|v| parse_currency(v)).unwrap_or(0.0);

        let client_id = text(Column::ClientId);
        let invoice_number = text(Column::InvoiceNumber);
        if client_id.is_empty() || invoice_number.is_empty() {
            log::debug!("row {}: dropped, no client id or invoice number", idx + 1);
            continue;
        }

        rows.push(CsvRow {
            row_number: idx + 1,
            client_id,
            account_name: text(Column::AccountName),
            email: Some(text(Column::Email)).filter(|e| !e.is_empty()),
            invoice_number,
            invoice_date: cells.get(&Column::InvoiceDate).and_then(|v| parse_date(v)),
            invoice_amount: money(Column::InvoiceAmount),
            total_outstanding: money(Column::TotalOutstanding),
            buckets: AgingBuckets::new(
                money(Column::Days0To30),
                money(Column::Days31To60),
                money(Column::Days61To90),
                money(Column::Days91To120),
                money(Column::DaysOver120),
            ),
            raw,
        });
    }
    Ok(rows)
}

/// Header and row-count check. Nothing is written.
pub fn validate_csv_format(csv_text: &str) -> CsvValidation {
    let mut errors = Vec::new();
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(csv_text.as_bytes());

    let headers: Vec<String> = match reader.headers() {
        Ok(h) => h
            .iter()
            .map(clean_header)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .collect(),
        Err(e) => {
            return CsvValidation {
                is_valid: false,
                errors: vec![format!("Failed to parse CSV file: {e}")],
                unrecognized_columns: Vec::new(),
            }
        }
    };
    if headers.is_empty() {
        return CsvValidation {
            is_valid: false,
            errors: vec!["CSV file appears to be empty or invalid".into()],
            unrecognized_columns: Vec::new(),
        };
    }

    let missing: Vec<&str> = REQUIRED_COLUMNS
        .iter()
        .copied()
        .filter(|req| !headers.iter().any(|h| h == req))
        .collect();
    if !missing.is_empty() {
        errors.push(format!("Missing required columns: {}", missing.join(", ")));
    }

    let unrecognized: Vec<String> = headers
        .iter()
        .filter(|h| Column::from_header(h).is_none())
        .cloned()
        .collect();
    if !unrecognized.is_empty() {
        log::warn!(
            "unrecognized columns will be ignored: {}",
            unrecognized.join(", ")
        );
    }

    match reader.records().next() {
        None => errors.push("CSV file contains no data rows".into()),
        Some(Err(e)) => errors.push(format!("Failed to parse CSV file: {e}")),
        Some(Ok(_)) => {}
    }

    CsvValidation {
        is_valid: errors.is_empty(),
        errors,
        unrecognized_columns: unrecognized,
    }
}

/// Header line plus one example row, for users building an extract by hand.
pub fn template_csv() -> String {
    let header = [
        "Client ID",
        "Client Name",
        "Email Address",
        "Invoice #",
        "Invoice Date",
        "Invoice Amount",
        "Current (0-30)",
        "31-60 Days",
        "61-90 Days",
        "91-120 Days",
        "120+ Days",
        "Total Outstanding",
    ];
    let example = [
        "C-1001",
        "Acme Corporation",
        "billing.team@acme.example",
        "INV-2024-001",
        "2024-01-15",
        "$1,250.00",
        "$0.00",
        "$0.00",
        "$1,250.00",
        "$0.00",
        "$0.00",
        "$1,250.00",
    ];
    let quote = |cells: &[&str]| {
        cells
            .iter()
            .map(|c| {
                if c.contains(',') {
                    format!("\"{c}\"")
                } else {
                    c.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(",")
    };
    format!("{}\n{}\n", quote(&header), quote(&example))
}

// ── Contact derivation ────────────────────────────────────────────

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// (first_name, last_name) for the primary contact.
///
/// `jane.doe@x.com` → ("Jane", "Doe"). Without a usable email the account
/// name is split on whitespace; with neither, the first name is "Contact".
pub fn derive_contact_name(email: Option<&str>, account_name: &str) -> (String, String) {
    if let Some(email) = email {
        let local = email.split('@').next().unwrap_or("");
        let parts: Vec<String> = local
            .split(|c| c == '.' || c == '_' || c == '-')
            .filter(|p| !p.trim().is_empty())
            .map(|p| capitalize(p.trim()))
            .collect();
        if let Some((first, rest)) = parts.split_first() {
            return (first.clone(), rest.join(" "));
        }
    }
    let mut words = account_name.split_whitespace();
    match words.next() {
        Some(first) => (first.to_string(), words.collect::<Vec<_>>().join(" ")),
        None => ("Contact".to_string(), String::new()),
    }
}

fn re_email() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("static regex"))
}

pub fn is_plausible_email(email: &str) -> bool {
    re_email().is_match(email)
}

/// True when the account must not be contacted: no primary email, or any of
/// its new snapshots holds money only in the 0-30 bucket.
pub fn compute_dnc(email: Option<&str>, snapshots: &[AgingSnapshotSummary]) -> bool {
    if email.map_or(true, |e| e.trim().is_empty()) {
        return true;
    }
    snapshots.iter().any(|s| s.buckets.is_fresh_only())
}

// ── Row validation ────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct ValidRow<'a> {
    row: &'a CsvRow,
    invoice_date: NaiveDate,
}

#[derive(Debug, Clone)]
struct FieldError {
    field: Option<&'static str>,
    message: String,
}

impl FieldError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field: Some(field),
            message: message.into(),
        }
    }
}

fn validate_row(row: &CsvRow, tolerance: Money) -> Result<ValidRow<'_>, FieldError> {
    if row.client_id.trim().is_empty() {
        return Err(FieldError::new("client_id", "client_id cannot be empty"));
    }
    if row.account_name.trim().is_empty() {
        return Err(FieldError::new("account_name", "account_name cannot be empty"));
    }
    if row.invoice_number.trim().is_empty() {
        return Err(FieldError::new("invoice_number", "invoice_number cannot be empty"));
    }
    let invoice_date = row.invoice_date.ok_or_else(|| {
        FieldError::new(
            "invoice_date",
            format!(
                "Invalid invoice date '{}' (expected YYYY-MM-DD)",
                row.raw.get("invoice_date").map(String::as_str).unwrap_or("")
            ),
        )
    })?;
    if let Some(email) = &row.email {
        if !is_plausible_email(email) {
            return Err(FieldError::new("email", format!("Invalid email address '{email}'")));
        }
    }
    if row.invoice_amount < 0.0 {
        return Err(FieldError::new("invoice_amount", "invoice_amount cannot be negative"));
    }
    if row.total_outstanding < 0.0 {
        return Err(FieldError::new("total_outstanding", "total_outstanding cannot be negative"));
    }
    if row.total_outstanding > row.invoice_amount + 1e-9 {
        return Err(FieldError::new(
            "total_outstanding",
            "Outstanding amount cannot exceed invoice amount",
        ));
    }
    if row.buckets.any_negative() {
        return Err(FieldError::new("aging_buckets", "Aging amounts cannot be negative"));
    }
    let bucket_sum = row.buckets.total();
    if (bucket_sum - row.total_outstanding).abs() > tolerance + 1e-9 {
        return Err(FieldError::new(
            "aging_buckets",
            format!(
                "Aging buckets total ({bucket_sum:.2}) does not match total outstanding ({:.2})",
                row.total_outstanding
            ),
        ));
    }
    Ok(ValidRow { row, invoice_date })
}

// ── Reconciliation ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccountOutcome {
    Cached,
    Found,
    Created,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InvoiceOutcome {
    Created,
    Updated,
    Found,
}

#[derive(Debug, Clone)]
struct CreatedSnapshot {
    account_id: AccountId,
    summary: AgingSnapshotSummary,
    total_outstanding: Money,
}

/// Everything one row did. Applied to the batch state only after the row's
/// savepoint is released.
#[derive(Debug, Clone)]
struct RowOutcome {
    account: AccountRow,
    account_outcome: AccountOutcome,
    invoice_outcome: InvoiceOutcome,
    snapshot: Option<CreatedSnapshot>,
}

fn reconcile_row(
    store: &AgingStore,
    valid: &ValidRow<'_>,
    account_cache: &HashMap<String, AccountRow>,
    snapshot_date: NaiveDate,
) -> DunningResult<RowOutcome> {
    let row = valid.row;

    // 1. Account, cache first.
    let (account, account_outcome) = match account_cache.get(&row.client_id) {
        Some(cached) => (cached.clone(), AccountOutcome::Cached),
        None => match store.get_account_by_client_id(&row.client_id)? {
            Some(found) => {
                log::debug!("reusing account {} for client {}", found.account_id, row.client_id);
                (found, AccountOutcome::Found)
            }
            None => {
                let (first_name, last_name) =
                    derive_contact_name(row.email.as_deref(), &row.account_name);
                let contact = NewContact {
                    first_name,
                    last_name,
                    email: row.email.clone(),
                    phone: None,
                    is_billing_contact: true,
                };
                let (account, _) =
                    store.create_account_with_contact(&row.client_id, &row.account_name, &contact)?;
                log::info!("created account {} for client {}", account.account_id, row.client_id);
                (account, AccountOutcome::Created)
            }
        },
    };

    // 2. Invoice, by global invoice number.
    let (invoice, invoice_outcome) = match store.get_invoice_by_number(&row.invoice_number)? {
        None => {
            let invoice = store.create_invoice(&NewInvoice {
                account_id: &account.account_id,
                invoice_number: &row.invoice_number,
                invoice_date: valid.invoice_date,
                invoice_amount: row.invoice_amount,
                total_outstanding: row.total_outstanding,
            })?;
            (invoice, InvoiceOutcome::Created)
        }
        Some(existing) => {
            let changed = money_differs(existing.invoice_amount, row.invoice_amount)
                || money_differs(existing.total_outstanding, row.total_outstanding);
            if changed {
                store.update_invoice_amounts(
                    &existing.invoice_id,
                    row.invoice_amount,
                    row.total_outstanding,
                )?;
                log::info!(
                    "invoice {} amounts changed: {:.2}/{:.2} -> {:.2}/{:.2}",
                    row.invoice_number,
                    existing.invoice_amount,
                    existing.total_outstanding,
                    row.invoice_amount,
                    row.total_outstanding
                );
                (existing, InvoiceOutcome::Updated)
            } else {
                (existing, InvoiceOutcome::Found)
            }
        }
    };

    // 3. Snapshot, append only when buckets moved.
    let latest = store.latest_snapshot(&invoice.invoice_id)?;
    let needs_snapshot = latest
        .as_ref()
        .map_or(true, |prev| prev.buckets.differs_from(&row.buckets));
    let snapshot = if needs_snapshot {
        store.create_snapshot(&invoice.invoice_id, snapshot_date, &row.buckets)?;
        Some(CreatedSnapshot {
            account_id: account.account_id.clone(),
            summary: AgingSnapshotSummary {
                invoice_number: row.invoice_number.clone(),
                invoice_date: valid.invoice_date,
                snapshot_date,
                buckets: row.buckets,
            },
            total_outstanding: row.total_outstanding,
        })
    } else {
        log::debug!("invoice {}: buckets unchanged, snapshot skipped", row.invoice_number);
        None
    };

    Ok(RowOutcome {
        account,
        account_outcome,
        invoice_outcome,
        snapshot,
    })
}

/// Validate, parse and reconcile a CSV extract against the store.
///
/// A file that fails the format check, or cannot be parsed at all, is a
/// single `Format` error and nothing is written. Row failures are reported
/// in `ImportResult::errors` and do not stop the batch.
pub fn import_csv(
    store: &AgingStore,
    csv_text: &str,
    options: &ImportOptions,
) -> DunningResult<ImportResult> {
    let started = Instant::now();

    let format = validate_csv_format(csv_text);
    if !format.is_valid {
        let reason = format.errors.join("; ");
        log::error!("import rejected: {reason}");
        record_event(store, &PipelineEvent::ImportFailed { reason: reason.clone() });
        return Err(DunningError::Format(reason));
    }
    let rows = match parse_rows(csv_text) {
        Ok(rows) => rows,
        Err(e) => {
            let reason = e.to_string();
            log::error!("import failed while parsing: {reason}");
            record_event(store, &PipelineEvent::ImportFailed { reason: reason.clone() });
            return Err(DunningError::Format(reason));
        }
    };

    let mut result = ImportResult {
        total_rows: rows.len(),
        ..ImportResult::default()
    };
    log::info!("starting import of {} rows", rows.len());

    let mut account_cache: HashMap<String, AccountRow> = HashMap::new();
    let mut created: Vec<CreatedSnapshot> = Vec::new();

    store.begin_batch()?;
    for row in &rows {
        let outcome = validate_row(row, options.amount_tolerance)
            .map_err(|fe| (fe.field, fe.message))
            .and_then(|valid| {
                store
                    .in_savepoint("import_row", |s| {
                        reconcile_row(s, &valid, &account_cache, options.snapshot_date)
                    })
                    .map_err(|e| (None, e.to_string()))
            });

        match outcome {
            Ok(outcome) => {
                result.successful_rows += 1;
                match outcome.account_outcome {
                    AccountOutcome::Cached => result.accounts_found += 1,
                    AccountOutcome::Found => {
                        result.accounts_found += 1;
                        account_cache.insert(row.client_id.clone(), outcome.account);
                    }
                    AccountOutcome::Created => {
                        result.accounts_created += 1;
                        result.contacts_created += 1;
                        account_cache.insert(row.client_id.clone(), outcome.account);
                    }
                }
                match outcome.invoice_outcome {
                    InvoiceOutcome::Created => result.invoices_created += 1,
                    InvoiceOutcome::Updated | InvoiceOutcome::Found => {
                        if outcome.invoice_outcome == InvoiceOutcome::Updated {
                            result.invoices_updated += 1;
                        } else {
                            result.invoices_found += 1;
                        }
                        if !result.repeated_invoice_numbers.contains(&row.invoice_number) {
                            result.repeated_invoice_numbers.push(row.invoice_number.clone());
                        }
                    }
                }
                match outcome.snapshot {
                    Some(snap) => {
                        result.aging_snapshots_created += 1;
                        created.push(snap);
                    }
                    None => result.aging_snapshots_skipped += 1,
                }
            }
            Err((field, message)) => {
                log::error!("row {} ({}): {message}", row.row_number, row.invoice_number);
                result.errors.push(ImportError {
                    row_number: row.row_number,
                    field: field.map(str::to_string),
                    error_message: message,
                    row_data: Some(row.raw.clone()),
                });
            }
        }
    }

    if let Err(e) = store.commit_batch() {
        log::error!("import commit failed: {e}");
        store.rollback_batch()?;
        return Err(e);
    }

    result.failed_rows = result.errors.len();
    result.success = result.errors.is_empty();
    result.contact_ready_clients = build_contact_ready_clients(store, &created)?;
    result.processing_time_seconds = (started.elapsed().as_secs_f64() * 100.0).round() / 100.0;

    log::info!(
        "import finished: {}/{} rows ok, {} accounts created, {} invoices created, {} updated, {} snapshots created",
        result.successful_rows,
        result.total_rows,
        result.accounts_created,
        result.invoices_created,
        result.invoices_updated,
        result.aging_snapshots_created
    );
    record_event(
        store,
        &PipelineEvent::ImportCompleted {
            total_rows: result.total_rows,
            failed_rows: result.failed_rows,
            accounts_created: result.accounts_created,
            invoices_created: result.invoices_created,
            invoices_updated: result.invoices_updated,
            aging_snapshots_created: result.aging_snapshots_created,
        },
    );
    Ok(result)
}

/// One aggregate per account that gained a snapshot, in first-touched order.
fn build_contact_ready_clients(
    store: &AgingStore,
    created: &[CreatedSnapshot],
) -> DunningResult<Vec<ContactReadyClient>> {
    let mut order: Vec<AccountId> = Vec::new();
    let mut by_account: HashMap<&str, Vec<&CreatedSnapshot>> = HashMap::new();
    for snap in created {
        let snaps = by_account.entry(snap.account_id.as_str()).or_insert_with(|| {
            order.push(snap.account_id.clone());
            Vec::new()
        });
        // An invoice repeated within one file contributes only its last snapshot.
        match snaps
            .iter_mut()
            .find(|s| s.summary.invoice_number == snap.summary.invoice_number)
        {
            Some(existing) => *existing = snap,
            None => snaps.push(snap),
        }
    }

    let accounts = store.accounts_with_contacts(&order)?;
    Ok(accounts
        .into_iter()
        .map(|awc| {
            let email = awc.primary_contact().and_then(|c| c.email.clone());
            let snaps = by_account
                .get(awc.account.account_id.as_str())
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            let summaries: Vec<AgingSnapshotSummary> =
                snaps.iter().map(|s| s.summary.clone()).collect();
            let total: Money = snaps.iter().map(|s| s.total_outstanding).sum();
            ContactReadyClient {
                dnc_status: compute_dnc(email.as_deref(), &summaries),
                client_id: awc.account.client_id,
                account_name: awc.account.account_name,
                email_address: email,
                invoice_aging_snapshots: summaries,
                total_outstanding_across_invoices: total,
            }
        })
        .collect())
}

fn record_event(store: &AgingStore, event: &PipelineEvent) {
    if let Err(e) = store.record_event(event) {
        log::warn!("could not record {} event: {e}", event.event_type());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn currency_cells_strip_symbols_and_fail_soft() {
        assert_eq!(parse_currency("$1,250.50"), 1250.5);
        assert_eq!(parse_currency("  300 "), 300.0);
        assert_eq!(parse_currency(""), 0.0);
        assert_eq!(parse_currency("n/a"), 0.0);
        assert_eq!(parse_currency("-$5"), -5.0);
        assert_eq!(parse_currency("-5"), -5.0);
        assert_eq!(parse_currency("inf"), 0.0);
        assert_eq!(parse_currency("-Infinity"), 0.0);
        assert_eq!(parse_currency("NaN"), 0.0);
    }

    #[test]
    fn contact_name_from_email_local_part() {
        assert_eq!(
            derive_contact_name(Some("jane.doe-smith@acme.com"), "Acme Corp"),
            ("Jane".to_string(), "Doe Smith".to_string())
        );
        assert_eq!(
            derive_contact_name(Some("ACCOUNTING@acme.com"), "Acme Corp"),
            ("Accounting".to_string(), String::new())
        );
    }

    #[test]
    fn contact_name_falls_back_to_account_then_placeholder() {
        assert_eq!(
            derive_contact_name(None, "Globex  Industries Ltd"),
            ("Globex".to_string(), "Industries Ltd".to_string())
        );
        assert_eq!(
            derive_contact_name(Some("@x.com"), "Initech"),
            ("Initech".to_string(), String::new())
        );
        assert_eq!(
            derive_contact_name(None, "   "),
            ("Contact".to_string(), String::new())
        );
    }

    #[test]
    fn email_plausibility() {
        assert!(is_plausible_email("a.b@c.io"));
        assert!(!is_plausible_email("nobody"));
        assert!(!is_plausible_email("x@localhost"));
        assert!(!is_plausible_email("a b@c.io"));
    }

    #[test]
    fn dnc_when_no_email_or_any_fresh_only_snapshot() {
        let d = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let snap = |b: AgingBuckets| AgingSnapshotSummary {
            invoice_number: "I".into(),
            invoice_date: d,
            snapshot_date: d,
            buckets: b,
        };
        let aged = snap(AgingBuckets::new(0.0, 10.0, 0.0, 0.0, 0.0));
        let fresh = snap(AgingBuckets::new(10.0, 0.0, 0.0, 0.0, 0.0));

        assert!(compute_dnc(None, &[aged.clone()]));
        assert!(compute_dnc(Some("  "), &[aged.clone()]));
        assert!(!compute_dnc(Some("a@b.co"), &[aged.clone()]));
        assert!(compute_dnc(Some("a@b.co"), &[aged, fresh]));
    }

    #[test]
    fn template_csv_round_trips_through_the_parser() {
        let text = template_csv();
        assert!(validate_csv_format(&text).is_valid);
        let rows = parse_rows(&text).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].invoice_amount, 1250.0);
        assert_eq!(rows[0].buckets.days_61_90, 1250.0);
    }

    #[test]
    fn format_check_reports_missing_columns_and_empty_body() {
        let v = validate_csv_format("Client ID,Invoice #,Extra\n");
        assert!(!v.is_valid);
        assert!(v.errors[0].starts_with("Missing required columns: Client Name"));
        assert!(v.errors.iter().any(|e| e == "CSV file contains no data rows"));
        assert_eq!(v.unrecognized_columns, vec!["Extra".to_string()]);

        let empty = validate_csv_format("");
        assert!(!empty.is_valid);
    }

    #[test]
    fn rows_without_keys_are_dropped() {
        let text = "Client ID,Client Name,Invoice #,Invoice Date,Invoice Amount,Total Outstanding\n\
                    C1,Acme,INV-1,2024-01-01,10,10\n\
                    ,Acme,INV-2,2024-01-01,10,10\n\
                    C1,Acme,,2024-01-01,10,10\n";
        let rows = parse_rows(text).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].row_number, 1);
    }

    #[test]
    fn row_validation_rejects_bucket_mismatch_and_overpayment() {
        let text = "Client ID,Client Name,Invoice #,Invoice Date,Invoice Amount,Total Outstanding,31-60 Days\n\
                    C1,Acme,INV-1,2024-01-01,100,100,99.98\n\
                    C1,Acme,INV-2,2024-01-01,100,150,150\n\
                    C1,Acme,INV-3,01/02/2024,100,100,100\n\
                    C1,Acme,INV-4,2024-01-01,100,100,99.995\n";
        let rows = parse_rows(text).unwrap();
        let err = validate_row(&rows[0], 0.01).unwrap_err();
        assert_eq!(err.field, Some("aging_buckets"));
        let err = validate_row(&rows[1], 0.01).unwrap_err();
        assert_eq!(err.field, Some("total_outstanding"));
        let err = validate_row(&rows[2], 0.01).unwrap_err();
        assert_eq!(err.field, Some("invoice_date"));
        assert!(validate_row(&rows[3], 0.01).is_ok());
    }
}
