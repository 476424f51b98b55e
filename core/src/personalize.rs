//! Personalization of escalation templates.
//!
//! `ClaudePersonalizer` asks the Messages API to fill the templates for the
//! whole batch in one call. `TemplateRenderer` does plain variable
//! substitution without any network access.
//!
//! Both return only emails that pass `accept_generated`; anything malformed
//! is dropped and logged, never forwarded to the transport.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::aging::{AgingSnapshotSummary, AgingSummary, InvoiceDetail};
use crate::config::PersonalizationConfig;
use crate::csv_import::is_plausible_email;
use crate::error::{DunningError, DunningResult};
use crate::escalation_degree::{EscalationDegree, EscalationDegreeInfo};
use crate::templates::TemplateData;
use crate::types::Money;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// One qualifying account as handed to the personalizer.
#[derive(Debug, Clone, Serialize)]
pub struct AccountPayload {
    pub client_id: String,
    pub account_name: String,
    pub email_address: String,
    pub escalation_degree: EscalationDegree,
    pub degree_info: EscalationDegreeInfo,
    pub invoice_aging_snapshots: Vec<AgingSnapshotSummary>,
    pub invoice_details: Vec<InvoiceDetail>,
    pub aging_summary: AgingSummary,
    pub total_outstanding_across_invoices: Money,
}

impl AccountPayload {
    pub fn oldest_invoice_days(&self) -> i64 {
        self.invoice_details
            .iter()
            .map(|d| d.days_overdue)
            .max()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedTemplate {
    pub identifier: String,
    pub template_data: TemplateData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedEmail {
    pub account: String,
    pub email_address: String,
    pub email_subject: String,
    pub email_body: String,
}

#[async_trait]
pub trait Personalizer: Send + Sync {
    /// One personalized email per account the generator could handle.
    /// Accounts it cannot handle are simply absent from the result.
    async fn generate(
        &self,
        accounts: &[AccountPayload],
        templates: &[ResolvedTemplate],
    ) -> DunningResult<Vec<GeneratedEmail>>;
}

/// Minimum content a generated email must carry to be sent.
#[derive(Debug, Clone, Copy)]
pub struct ContentRules {
    pub min_subject_len: usize,
    pub min_body_len: usize,
}

impl From<&PersonalizationConfig> for ContentRules {
    fn from(cfg: &PersonalizationConfig) -> Self {
        Self {
            min_subject_len: cfg.min_subject_len,
            min_body_len: cfg.min_body_len,
        }
    }
}

impl Default for ContentRules {
    fn default() -> Self {
        Self {
            min_subject_len: 5,
            min_body_len: 50,
        }
    }
}

/// Trimmed email if it is usable, `None` otherwise.
pub fn accept_generated(email: GeneratedEmail, rules: ContentRules) -> Option<GeneratedEmail> {
    let email = GeneratedEmail {
        account: email.account.trim().to_string(),
        email_address: email.email_address.trim().to_string(),
        email_subject: email.email_subject.trim().to_string(),
        email_body: email.email_body.trim().to_string(),
    };
    if email.account.is_empty() {
        log::warn!("dropping generated email without account name");
        return None;
    }
    if !is_plausible_email(&email.email_address) {
        log::warn!("dropping generated email for {}: invalid address", email.account);
        return None;
    }
    if email.email_subject.chars().count() < rules.min_subject_len {
        log::warn!("dropping generated email for {}: subject too short", email.account);
        return None;
    }
    if email.email_body.chars().count() < rules.min_body_len {
        log::warn!("dropping generated email for {}: body too short", email.account);
        return None;
    }
    Some(email)
}

/// Parse the generator's reply: a JSON array, optionally fenced in ```json.
/// A reply that is not a JSON array fails the whole step; malformed items
/// inside a valid array are dropped.
pub fn parse_generated_emails(text: &str, rules: ContentRules) -> DunningResult<Vec<GeneratedEmail>> {
    let mut cleaned = text.trim();
    if let Some(rest) = cleaned.strip_prefix("```json") {
        cleaned = rest;
    } else if let Some(rest) = cleaned.strip_prefix("```") {
        cleaned = rest;
    }
    if let Some(rest) = cleaned.strip_suffix("```") {
        cleaned = rest;
    }
    let value: serde_json::Value = serde_json::from_str(cleaned.trim())
        .map_err(|e| DunningError::Personalization(format!("Invalid JSON in response: {e}")))?;
    let items = value
        .as_array()
        .ok_or_else(|| DunningError::Personalization("Response must be a JSON array".into()))?;

    let total = items.len();
    let accepted: Vec<GeneratedEmail> = items
        .iter()
        .filter_map(|item| match serde_json::from_value::<GeneratedEmail>(item.clone()) {
            Ok(email) => Some(email),
            Err(e) => {
                log::warn!("dropping malformed generated item: {e}");
                None
            }
        })
        .filter_map(|email| accept_generated(email, rules))
        .collect();
    log::info!("generator returned {total} items, {} usable", accepted.len());
    Ok(accepted)
}

// ── Formatting helpers ────────────────────────────────────────────

/// 1250.0 → "$1,250.00"
pub fn format_currency(amount: Money) -> String {
    let cents = (amount.abs() * 100.0).round() as i64;
    let whole = (cents / 100).to_string();
    let mut grouped = String::new();
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    let sign = if amount < 0.0 && cents > 0 { "-" } else { "" };
    format!("{sign}${grouped}.{:02}", cents % 100)
}

/// "January 15, 2025"
pub fn format_long_date(date: NaiveDate) -> String {
    date.format("%B %d, %Y").to_string()
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

pub fn invoice_details_html(details: &[InvoiceDetail]) -> String {
    let items: String = details
        .iter()
        .map(|d| {
            format!(
                "<li>Invoice {}: {} ({} days overdue)</li>",
                escape_html(&d.invoice_number),
                format_currency(d.total_outstanding),
                d.days_overdue
            )
        })
        .collect();
    format!("<ul>{items}</ul>")
}

// ── Offline renderer ──────────────────────────────────────────────

/// Fills `{{variable}}` placeholders in the active template for each
/// account's degree. Accounts without a matching template are dropped.
pub struct TemplateRenderer {
    today: NaiveDate,
    rules: ContentRules,
}

impl TemplateRenderer {
    pub fn new(rules: ContentRules) -> Self {
        Self {
            today: chrono::Local::now().date_naive(),
            rules,
        }
    }

    pub fn with_date(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    pub fn render(&self, text: &str, account: &AccountPayload) -> String {
        text.replace("{{account_name}}", &escape_html(&account.account_name))
            .replace(
                "{{total_outstanding}}",
                &format_currency(account.degree_info.total_amount),
            )
            .replace(
                "{{invoice_count}}",
                &account.degree_info.qualifying_invoices.len().to_string(),
            )
            .replace(
                "{{oldest_invoice_days}}",
                &account.oldest_invoice_days().to_string(),
            )
            .replace("{{invoice_details}}", &invoice_details_html(&account.invoice_details))
            .replace("{{current_date}}", &format_long_date(self.today))
    }
}

#[async_trait]
impl Personalizer for TemplateRenderer {
    async fn generate(
        &self,
        accounts: &[AccountPayload],
        templates: &[ResolvedTemplate],
    ) -> DunningResult<Vec<GeneratedEmail>> {
        let mut out = Vec::with_capacity(accounts.len());
        for account in accounts {
            let identifier = account.escalation_degree.template_identifier();
            let Some(template) = templates.iter().find(|t| t.identifier == identifier) else {
                log::warn!("no template {identifier} for {}", account.account_name);
                continue;
            };
            let email = GeneratedEmail {
                account: account.account_name.clone(),
                email_address: account.email_address.clone(),
                email_subject: self.render(&template.template_data.subject, account),
                email_body: self.render(&template.template_data.body, account),
            };
            if let Some(email) = accept_generated(email, self.rules) {
                out.push(email);
            }
        }
        Ok(out)
    }
}

// ── Messages API client ───────────────────────────────────────────

pub struct ClaudePersonalizer {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
    max_tokens: u32,
    timeout_secs: u64,
    rules: ContentRules,
}

impl ClaudePersonalizer {
    pub fn new(config: &PersonalizationConfig) -> DunningResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_key: config.api_key.clone().filter(|k| !k.trim().is_empty()),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            timeout_secs: config.timeout_secs,
            rules: ContentRules::from(config),
        })
    }

    pub fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    fn system_prompt(templates: &[ResolvedTemplate]) -> String {
        let mut templates_text = String::new();
        for t in templates {
            templates_text.push_str(&format!(
                "\nTemplate: {}\nSubject: {}\nBody: {}\n\n---\n",
                t.identifier, t.template_data.subject, t.template_data.body
            ));
        }
        format!(
            "You personalize collection emails for overdue invoices.\n\
             \n\
             TEMPLATES:\n{templates_text}\n\
             Each account carries its escalation_degree; use template ESCALATION_LEVEL_<degree>.\n\
             Only the invoices listed in invoice_details count toward the email.\n\
             \n\
             VARIABLES:\n\
             - {{{{account_name}}}}: the account name\n\
             - {{{{total_outstanding}}}}: degree_info.total_amount as currency, e.g. \"$1,250.00\"\n\
             - {{{{invoice_count}}}}: number of invoice_details\n\
             - {{{{oldest_invoice_days}}}}: largest days_overdue in invoice_details\n\
             - {{{{invoice_details}}}}: an HTML list of invoice numbers, amounts and days overdue\n\
             - {{{{current_date}}}}: today, formatted like \"January 15, 2025\"\n\
             \n\
             Match the tone to the degree. Produce valid HTML.\n\
             \n\
             Reply with ONLY a JSON array, no prose and no markdown:\n\
             [{{\"account\": \"...\", \"email_address\": \"...\", \"email_subject\": \"...\", \"email_body\": \"...\"}}]"
        )
    }

    fn user_message(accounts: &[AccountPayload]) -> DunningResult<String> {
        Ok(format!(
            "Current date: {}\n\nAccounts:\n{}\n\nGenerate one email per account.",
            format_long_date(chrono::Local::now().date_naive()),
            serde_json::to_string_pretty(accounts)?
        ))
    }
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[async_trait]
impl Personalizer for ClaudePersonalizer {
    async fn generate(
        &self,
        accounts: &[AccountPayload],
        templates: &[ResolvedTemplate],
    ) -> DunningResult<Vec<GeneratedEmail>> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(DunningError::PersonalizationUnavailable)?;

        log::info!(
            "requesting personalization for {} accounts with {} templates",
            accounts.len(),
            templates.len()
        );
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": Self::system_prompt(templates),
            "messages": [{ "role": "user", "content": Self::user_message(accounts)? }],
        });

        let resp = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DunningError::Timeout(format!(
                        "personalization request after {}s",
                        self.timeout_secs
                    ))
                } else {
                    DunningError::Personalization(format!("request failed: {e}"))
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            log::error!("personalization API returned {status}");
            return Err(DunningError::Personalization(format!(
                "API error {status}: {text}"
            )));
        }

        let parsed: MessagesResponse = resp
            .json()
            .await
            .map_err(|e| DunningError::Personalization(format!("unreadable response: {e}")))?;
        let text = parsed
            .content
            .into_iter()
            .find_map(|b| b.text)
            .ok_or_else(|| DunningError::Personalization("empty response content".into()))?;

        parse_generated_emails(&text, self.rules)
    }
}
