//! Escalation orchestrator.
//!
//! filter → degree → template resolution → personalization → dispatch.
//!
//! Every input account ends up either escalated or under exactly one skip
//! reason. A missing template or a failed personalization call aborts the
//! batch before anything is sent; send failures stay with their recipient.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use crate::aging::{AgingSummary, InvoiceDetail};
use crate::config::DispatchConfig;
use crate::csv_import::{is_plausible_email, ContactReadyClient};
use crate::dispatch::{dispatch_all, DispatchPolicy, EmailSendingSummary};
use crate::error::{DunningError, DunningResult};
use crate::escalation_degree::{calculate_degree, EscalationDegree, EscalationDegreeInfo};
use crate::event::PipelineEvent;
use crate::personalize::{AccountPayload, GeneratedEmail, Personalizer, ResolvedTemplate};
use crate::store::AgingStore;
use crate::transport::{EmailTransport, OutgoingEmail};
use crate::types::Money;

pub const SKIP_DNC: &str = "dnc_status";
pub const SKIP_NO_EMAIL: &str = "no_email";
pub const SKIP_NO_INVOICES: &str = "no_invoices";
pub const SKIP_DEGREE_0: &str = "degree_0_no_escalation";
pub const SKIP_PERSONALIZATION_DROPPED: &str = "personalization_dropped";
pub const SKIP_ABORTED: &str = "batch_aborted";

const NO_VALID_CONTACTS: &str = "No valid contacts found for escalation processing";
const NOTHING_TO_ESCALATE: &str = "No contacts require escalation (all are degree 0)";

// ── Request / response ────────────────────────────────────────────

fn default_batch_size() -> usize {
    10
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRequest {
    pub contact_ready_clients: Vec<ContactReadyClient>,
    #[serde(default)]
    pub preview_only: bool,
    #[serde(default)]
    pub send_emails: bool,
    #[serde(default = "default_batch_size")]
    pub email_batch_size: usize,
    #[serde(default = "default_true")]
    pub retry_failed_emails: bool,
}

impl EscalationRequest {
    /// Generate only; nothing is sent.
    pub fn preview(clients: Vec<ContactReadyClient>) -> Self {
        Self {
            contact_ready_clients: clients,
            preview_only: true,
            send_emails: false,
            email_batch_size: default_batch_size(),
            retry_failed_emails: true,
        }
    }

    pub fn send(clients: Vec<ContactReadyClient>) -> Self {
        Self {
            contact_ready_clients: clients,
            preview_only: false,
            send_emails: true,
            email_batch_size: default_batch_size(),
            retry_failed_emails: true,
        }
    }

    fn dispatches(&self) -> bool {
        self.send_emails && !self.preview_only
    }
}

/// One escalated account.
#[derive(Debug, Clone, Serialize)]
pub struct EscalationResult {
    pub account: String,
    pub email_address: String,
    pub email_subject: String,
    pub email_body: String,
    pub escalation_degree: EscalationDegree,
    pub template_used: String,
    pub invoice_count: usize,
    pub total_outstanding: Money,
    pub email_sent: bool,
    pub email_sent_at: Option<DateTime<Utc>>,
    pub email_message_id: Option<String>,
    pub email_send_error: Option<String>,
    pub invoice_details: Vec<InvoiceDetail>,
    pub aging_summary: AgingSummary,
}

/// Final delivery outcome for one generated email.
#[derive(Debug, Clone, Serialize)]
pub struct EmailSendingDetail {
    pub account_id: String,
    pub account_name: String,
    pub email_address: String,
    pub email_sent: bool,
    pub email_sent_at: Option<DateTime<Utc>>,
    pub email_message_id: Option<String>,
    pub email_subject: String,
    pub email_send_error: Option<String>,
    pub escalation_degree: EscalationDegree,
    pub template_used: String,
    pub invoice_count: usize,
    pub total_outstanding: Money,
    pub oldest_invoice_days: i64,
    pub invoices: Vec<InvoiceDetail>,
    pub aging_summary: AgingSummary,
    pub attempts: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EscalationBatchResponse {
    pub success: bool,
    pub processed_count: usize,
    pub emails_generated: usize,
    pub skipped_count: usize,
    pub escalation_results: Vec<EscalationResult>,
    pub skipped_reasons: BTreeMap<String, usize>,
    pub processing_time_seconds: f64,
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_sending_summary: Option<EmailSendingSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub email_sending_details: Vec<EmailSendingDetail>,
    /// Preview only: template identifier → number of emails using it.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub template_usage: BTreeMap<String, usize>,
}

impl EscalationBatchResponse {
    /// Number of accounts accounted for by results and skip reasons.
    pub fn accounted_for(&self) -> usize {
        self.emails_generated + self.skipped_reasons.values().sum::<usize>()
    }
}

// ── Orchestrator ──────────────────────────────────────────────────

/// An account that passed the filter, with its degree computed once.
struct Candidate<'a> {
    client: &'a ContactReadyClient,
    email: String,
    info: EscalationDegreeInfo,
    details: Vec<InvoiceDetail>,
    summary: AgingSummary,
}

impl Candidate<'_> {
    fn payload(&self) -> AccountPayload {
        AccountPayload {
            client_id: self.client.client_id.clone(),
            account_name: self.client.account_name.clone(),
            email_address: self.email.clone(),
            escalation_degree: self.info.degree,
            degree_info: self.info.clone(),
            invoice_aging_snapshots: self.client.invoice_aging_snapshots.clone(),
            invoice_details: self.details.clone(),
            aging_summary: self.summary,
            total_outstanding_across_invoices: self.client.total_outstanding_across_invoices,
        }
    }

    fn oldest_invoice_days(&self) -> i64 {
        self.details.iter().map(|d| d.days_overdue).max().unwrap_or(0)
    }
}

fn build_candidate(client: &ContactReadyClient) -> Result<Candidate<'_>, &'static str> {
    if client.dnc_status {
        return Err(SKIP_DNC);
    }
    let email = match client.email_address.as_deref().map(str::trim) {
        Some(e) if !e.is_empty() => e.to_string(),
        _ => return Err(SKIP_NO_EMAIL),
    };
    if client.invoice_aging_snapshots.is_empty() {
        return Err(SKIP_NO_INVOICES);
    }
    let info = calculate_degree(&client.invoice_aging_snapshots);
    if !info.degree.needs_escalation() {
        return Err(SKIP_DEGREE_0);
    }
    let qualifying: Vec<_> = client
        .invoice_aging_snapshots
        .iter()
        .filter(|s| info.qualifying_invoices.contains(&s.invoice_number))
        .collect();
    let details = qualifying.iter().map(|s| InvoiceDetail::from_snapshot(s)).collect();
    let summary =
        AgingSummary::from_buckets(client.invoice_aging_snapshots.iter().map(|s| &s.buckets));
    Ok(Candidate {
        client,
        email,
        info,
        details,
        summary,
    })
}

/// Pair each candidate with at most one generated email: by account name
/// first, then by recipient address. Extra generated emails are ignored.
fn match_generated(
    candidates: &[Candidate<'_>],
    generated: Vec<GeneratedEmail>,
) -> Vec<Option<GeneratedEmail>> {
    let mut slots: Vec<Option<GeneratedEmail>> = vec![None; candidates.len()];
    for email in generated {
        let by_name = candidates
            .iter()
            .enumerate()
            .position(|(i, c)| slots[i].is_none() && c.client.account_name.trim() == email.account);
        let slot = by_name.or_else(|| {
            candidates.iter().enumerate().position(|(i, c)| {
                slots[i].is_none() && c.email.eq_ignore_ascii_case(&email.email_address)
            })
        });
        match slot {
            Some(i) => slots[i] = Some(email),
            None => log::warn!(
                "generated email for '{}' matches no pending account, ignored",
                email.account
            ),
        }
    }
    slots
}

pub struct EscalationService {
    personalizer: Arc<dyn Personalizer>,
    transport: Arc<dyn EmailTransport>,
    dispatch: DispatchConfig,
}

impl EscalationService {
    pub fn new(
        personalizer: Arc<dyn Personalizer>,
        transport: Arc<dyn EmailTransport>,
        dispatch: DispatchConfig,
    ) -> Self {
        Self {
            personalizer,
            transport,
            dispatch,
        }
    }

    /// Run one escalation batch.
    ///
    /// Dependency failures (missing template, personalization) come back as
    /// `success = false` with a reason in `errors`. Only store failures
    /// propagate as `Err`.
    pub async fn process_batch(
        &self,
        store: &AgingStore,
        request: &EscalationRequest,
    ) -> DunningResult<EscalationBatchResponse> {
        let started = Instant::now();
        let mut response = EscalationBatchResponse {
            success: true,
            processed_count: request.contact_ready_clients.len(),
            ..Default::default()
        };

        // 1. filter + degree
        let mut candidates = Vec::new();
        for client in &request.contact_ready_clients {
            match build_candidate(client) {
                Ok(c) => candidates.push(c),
                Err(reason) => {
                    log::debug!("skipping {} ({reason})", client.account_name);
                    *response.skipped_reasons.entry(reason.to_string()).or_default() += 1;
                }
            }
        }
        log::info!(
            "escalation batch: {} accounts, {} need escalation",
            response.processed_count,
            candidates.len()
        );

        if candidates.is_empty() {
            let only_degree_0 = response.skipped_reasons.len() == 1
                && response.skipped_reasons.contains_key(SKIP_DEGREE_0);
            response.errors.push(
                if only_degree_0 {
                    NOTHING_TO_ESCALATE
                } else {
                    NO_VALID_CONTACTS
                }
                .to_string(),
            );
            return self.finish(store, request, response, started);
        }

        // 2. templates
        let templates = match resolve_templates(store, &candidates) {
            Ok(t) => t,
            Err(e @ DunningError::TemplateMissing { .. }) => {
                log::error!("escalation aborted: {e}");
                return self.abort(store, request, response, candidates.len(), e, started);
            }
            Err(e) => return Err(e),
        };

        // 3. personalization
        let payloads: Vec<AccountPayload> = candidates.iter().map(Candidate::payload).collect();
        let generated = match self.personalizer.generate(&payloads, &templates).await {
            Ok(g) => g,
            Err(e) => {
                log::error!("escalation aborted, personalization failed: {e}");
                return self.abort(store, request, response, candidates.len(), e, started);
            }
        };

        let mut results = Vec::new();
        let mut sources = Vec::new();
        for (candidate, slot) in candidates.iter().zip(match_generated(&candidates, generated)) {
            let Some(email) = slot else {
                log::warn!(
                    "no usable email generated for {}",
                    candidate.client.account_name
                );
                *response
                    .skipped_reasons
                    .entry(SKIP_PERSONALIZATION_DROPPED.to_string())
                    .or_default() += 1;
                continue;
            };
            if !email.email_address.eq_ignore_ascii_case(&candidate.email) {
                log::warn!(
                    "generator addressed {} to {}, sending to {} on file",
                    candidate.client.account_name,
                    email.email_address,
                    candidate.email
                );
            }
            results.push(EscalationResult {
                account: candidate.client.account_name.clone(),
                email_address: candidate.email.clone(),
                email_subject: email.email_subject,
                email_body: email.email_body,
                escalation_degree: candidate.info.degree,
                template_used: candidate.info.degree.template_identifier(),
                invoice_count: candidate.info.qualifying_invoices.len(),
                total_outstanding: candidate.info.total_amount,
                email_sent: false,
                email_sent_at: None,
                email_message_id: None,
                email_send_error: None,
                invoice_details: candidate.details.clone(),
                aging_summary: candidate.summary,
            });
            sources.push(candidate);
        }

        if request.preview_only {
            for r in &results {
                *response.template_usage.entry(r.template_used.clone()).or_default() += 1;
            }
        }

        // 4. dispatch
        if request.dispatches() && !results.is_empty() {
            let emails = results
                .iter()
                .map(|r| OutgoingEmail::html(&r.email_address, &r.email_subject, &r.email_body))
                .collect();
            let policy = DispatchPolicy::new(
                &self.dispatch,
                request.email_batch_size,
                request.retry_failed_emails,
            );
            let report = dispatch_all(Arc::clone(&self.transport), emails, policy).await;

            for ((result, candidate), delivery) in
                results.iter_mut().zip(&sources).zip(report.deliveries)
            {
                let event = match &delivery.outcome {
                    Ok(receipt) => {
                        result.email_sent = true;
                        result.email_sent_at = Some(receipt.sent_at);
                        result.email_message_id = Some(receipt.message_id.clone());
                        PipelineEvent::EmailSent {
                            account_name: result.account.clone(),
                            recipient: result.email_address.clone(),
                            template_identifier: result.template_used.clone(),
                            message_id: receipt.message_id.clone(),
                            attempts: delivery.attempts,
                        }
                    }
                    Err(error) => {
                        log::error!("email to {} failed: {error}", result.email_address);
                        result.email_send_error = Some(error.clone());
                        PipelineEvent::EmailFailed {
                            account_name: result.account.clone(),
                            recipient: result.email_address.clone(),
                            template_identifier: result.template_used.clone(),
                            error: error.clone(),
                            attempts: delivery.attempts,
                        }
                    }
                };
                store.record_event(&event)?;
                response.email_sending_details.push(EmailSendingDetail {
                    account_id: candidate.client.client_id.clone(),
                    account_name: result.account.clone(),
                    email_address: result.email_address.clone(),
                    email_sent: result.email_sent,
                    email_sent_at: result.email_sent_at,
                    email_message_id: result.email_message_id.clone(),
                    email_subject: result.email_subject.clone(),
                    email_send_error: result.email_send_error.clone(),
                    escalation_degree: result.escalation_degree,
                    template_used: result.template_used.clone(),
                    invoice_count: result.invoice_count,
                    total_outstanding: result.total_outstanding,
                    oldest_invoice_days: candidate.oldest_invoice_days(),
                    invoices: result.invoice_details.clone(),
                    aging_summary: result.aging_summary,
                    attempts: delivery.attempts,
                });
            }
            response.email_sending_summary = Some(report.summary);
        }

        response.emails_generated = results.len();
        response.escalation_results = results;
        self.finish(store, request, response, started)
    }

    fn abort(
        &self,
        store: &AgingStore,
        request: &EscalationRequest,
        mut response: EscalationBatchResponse,
        pending: usize,
        error: DunningError,
        started: Instant,
    ) -> DunningResult<EscalationBatchResponse> {
        response.success = false;
        response.errors.push(error.to_string());
        if pending > 0 {
            *response.skipped_reasons.entry(SKIP_ABORTED.to_string()).or_default() += pending;
        }
        response.skipped_count = response.skipped_reasons.values().sum();
        self.finish(store, request, response, started)
    }

    fn finish(
        &self,
        store: &AgingStore,
        request: &EscalationRequest,
        mut response: EscalationBatchResponse,
        started: Instant,
    ) -> DunningResult<EscalationBatchResponse> {
        if response.success {
            response.skipped_count = response.processed_count - response.emails_generated;
        }
        response.processing_time_seconds = started.elapsed().as_secs_f64();
        store.record_event(&PipelineEvent::EscalationCompleted {
            processed: response.processed_count,
            generated: response.emails_generated,
            skipped: response.skipped_count,
            preview_only: request.preview_only,
        })?;
        log::info!(
            "escalation finished: {} processed, {} generated, {} skipped",
            response.processed_count,
            response.emails_generated,
            response.skipped_count
        );
        Ok(response)
    }
}

/// Active template for every distinct degree among the candidates.
fn resolve_templates(
    store: &AgingStore,
    candidates: &[Candidate<'_>],
) -> DunningResult<Vec<ResolvedTemplate>> {
    let mut degrees: Vec<EscalationDegree> = candidates.iter().map(|c| c.info.degree).collect();
    degrees.sort();
    degrees.dedup();

    let mut resolved = Vec::with_capacity(degrees.len());
    let mut missing = Vec::new();
    for degree in degrees {
        let identifier = degree.template_identifier();
        match store.active_template(&identifier)? {
            Some(row) => resolved.push(ResolvedTemplate {
                identifier,
                template_data: row.data,
            }),
            None => missing.push(identifier),
        }
    }
    if !missing.is_empty() {
        return Err(DunningError::TemplateMissing {
            identifiers: missing,
        });
    }
    Ok(resolved)
}

// ── Analysis ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EscalationStats {
    pub total_accounts: usize,
    pub degree_0_count: usize,
    pub degree_1_count: usize,
    pub degree_2_count: usize,
    pub degree_3_count: usize,
    pub dnc_count: usize,
    pub no_email_count: usize,
    pub processable_count: usize,
    pub total_outstanding: Money,
}

#[derive(Debug, Clone, Serialize)]
pub struct EscalationAnalysis {
    pub stats: EscalationStats,
    /// Degree → account names at that degree.
    pub degree_breakdown: BTreeMap<u8, Vec<String>>,
    pub recommendations: Vec<String>,
}

/// Read-only look at a batch: how many accounts would escalate, at which degree.
pub fn analyze_escalation_needs(clients: &[ContactReadyClient]) -> EscalationAnalysis {
    let mut stats = EscalationStats {
        total_accounts: clients.len(),
        ..Default::default()
    };
    let mut breakdown: BTreeMap<u8, Vec<String>> = EscalationDegree::ALL
        .iter()
        .map(|d| (d.as_u8(), Vec::new()))
        .collect();

    for client in clients {
        if client.dnc_status {
            stats.dnc_count += 1;
            continue;
        }
        if client
            .email_address
            .as_deref()
            .map_or(true, |e| e.trim().is_empty())
        {
            stats.no_email_count += 1;
            continue;
        }
        let degree = if client.invoice_aging_snapshots.is_empty() {
            EscalationDegree::None
        } else {
            stats.total_outstanding += client.total_outstanding_across_invoices;
            calculate_degree(&client.invoice_aging_snapshots).degree
        };
        match degree {
            EscalationDegree::None => stats.degree_0_count += 1,
            EscalationDegree::First => stats.degree_1_count += 1,
            EscalationDegree::Second => stats.degree_2_count += 1,
            EscalationDegree::Final => stats.degree_3_count += 1,
        }
        if degree.needs_escalation() {
            stats.processable_count += 1;
        }
        breakdown
            .entry(degree.as_u8())
            .or_default()
            .push(client.account_name.clone());
    }

    let recommendations = recommendations(&stats);
    EscalationAnalysis {
        stats,
        degree_breakdown: breakdown,
        recommendations,
    }
}

fn recommendations(stats: &EscalationStats) -> Vec<String> {
    let mut out = Vec::new();
    if stats.processable_count == 0 {
        out.push("No accounts currently require escalation".to_string());
    } else {
        out.push(format!(
            "{} account(s) ready for escalation emails",
            stats.processable_count
        ));
    }
    if stats.degree_3_count > 0 {
        out.push(format!(
            "{} account(s) are at final notice (91+ days); review before sending",
            stats.degree_3_count
        ));
    }
    if stats.dnc_count > 0 {
        out.push(format!(
            "{} account(s) are marked do-not-contact and will be skipped",
            stats.dnc_count
        ));
    }
    if stats.no_email_count > 0 {
        out.push(format!(
            "{} account(s) have no email address; add contact details to include them",
            stats.no_email_count
        ));
    }
    out
}

// ── Input validation ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EscalationValidationError {
    pub account_name: String,
    pub field: String,
    pub error_message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EscalationValidation {
    pub is_valid: bool,
    pub validation_errors: Vec<EscalationValidationError>,
    pub valid_accounts: usize,
    pub invalid_accounts: usize,
}

/// Field-level checks on escalation input before a batch is run.
pub fn validate_escalation_input(clients: &[ContactReadyClient]) -> EscalationValidation {
    let mut errors = Vec::new();
    let mut invalid_accounts = 0;

    for (index, client) in clients.iter().enumerate() {
        let name = if client.account_name.trim().is_empty() {
            format!("Account {}", index + 1)
        } else {
            client.account_name.clone()
        };
        let before = errors.len();
        let mut push = |field: &str, message: String| {
            errors.push(EscalationValidationError {
                account_name: name.clone(),
                field: field.to_string(),
                error_message: message,
            })
        };

        if client.account_name.trim().is_empty() {
            push("account_name", "Account name is required".into());
        }
        if let Some(email) = client.email_address.as_deref() {
            let email = email.trim();
            if !email.is_empty() && !is_plausible_email(email) {
                push("email_address", format!("Invalid email address '{email}'"));
            }
        }
        if client.invoice_aging_snapshots.is_empty() {
            push(
                "invoice_aging_snapshots",
                "At least one invoice aging snapshot is required".into(),
            );
        }
        for (i, snapshot) in client.invoice_aging_snapshots.iter().enumerate() {
            if snapshot.invoice_number.trim().is_empty() {
                push(
                    "invoice_number",
                    format!("Invoice number is required for snapshot {}", i + 1),
                );
            }
        }

        if errors.len() > before {
            invalid_accounts += 1;
        }
    }

    EscalationValidation {
        is_valid: errors.is_empty(),
        validation_errors: errors,
        valid_accounts: clients.len() - invalid_accounts,
        invalid_accounts,
    }
}
