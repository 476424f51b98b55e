//! Versioned email templates.
//!
//! Every write appends a new version; nothing is edited in place. Exactly
//! one version per identifier is active after any create, update or activate.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::error::{DunningError, DunningResult};
use crate::store::{AgingStore, TemplateRow};

pub const MAX_SUBJECT_LEN: usize = 500;
pub const MAX_BODY_LEN: usize = 50_000;

/// Subject plus HTML body, stored as JSON in `email_template.data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateData {
    pub subject: String,
    pub body: String,
}

impl TemplateData {
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemplateSummary {
    pub identifier: String,
    pub template_data: TemplateData,
}

#[derive(Debug, Clone, Serialize)]
pub struct TemplateVersionInfo {
    pub template_id: String,
    pub version: i64,
    pub is_active: bool,
    pub created_at: String,
}

/// One page of active templates plus the total number available.
#[derive(Debug, Clone)]
pub struct TemplatePage {
    pub templates: Vec<TemplateRow>,
    pub total: usize,
}

pub struct TemplateService<'a> {
    store: &'a AgingStore,
}

impl<'a> TemplateService<'a> {
    pub fn new(store: &'a AgingStore) -> Self {
        Self { store }
    }

    /// New identifier starts at version 1; an existing one gets the next version.
    pub fn create(&self, identifier: &str, data: &TemplateData) -> DunningResult<TemplateRow> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(DunningError::InvalidTemplate(
                "Template identifier cannot be empty".into(),
            ));
        }
        let data = validate_and_sanitize(data)?;
        let row = self.store.insert_template_version(identifier, &data)?;
        log::info!(
            "template {} created at version {}",
            row.identifier,
            row.version
        );
        Ok(row)
    }

    /// Append a new version to an existing identifier.
    /// Returns the new row and the previously active version.
    pub fn update(
        &self,
        identifier: &str,
        data: &TemplateData,
    ) -> DunningResult<(TemplateRow, Option<i64>)> {
        if !self.store.template_exists(identifier)? {
            return Err(DunningError::NotFound(format!(
                "Template with identifier '{identifier}'"
            )));
        }
        let data = validate_and_sanitize(data)?;
        let previous = self.store.active_template(identifier)?.map(|t| t.version);
        let row = self.store.insert_template_version(identifier, &data)?;
        log::info!(
            "template {identifier} updated to version {} (previous {:?})",
            row.version,
            previous
        );
        Ok((row, previous))
    }

    pub fn get(&self, identifier: &str) -> DunningResult<Option<TemplateRow>> {
        self.store.active_template(identifier)
    }

    pub fn version(&self, identifier: &str, version: i64) -> DunningResult<Option<TemplateRow>> {
        self.store.template_version(identifier, version)
    }

    pub fn versions(&self, identifier: &str) -> DunningResult<Vec<TemplateVersionInfo>> {
        Ok(self
            .store
            .all_template_versions(identifier)?
            .into_iter()
            .map(|t| TemplateVersionInfo {
                template_id: t.template_id,
                version: t.version,
                is_active: t.is_active,
                created_at: t.created_at,
            })
            .collect())
    }

    /// Active templates, paginated.
    pub fn list(&self, skip: usize, limit: usize) -> DunningResult<TemplatePage> {
        Ok(TemplatePage {
            templates: self.store.active_templates(skip, Some(limit))?,
            total: self.store.active_template_count()?,
        })
    }

    pub fn summaries(&self) -> DunningResult<Vec<TemplateSummary>> {
        Ok(self
            .store
            .active_templates(0, None)?
            .into_iter()
            .map(|t| TemplateSummary {
                identifier: t.identifier,
                template_data: t.data,
            })
            .collect())
    }

    /// Make `version` the single active one.
    /// Returns the activated row and the previously active version.
    pub fn activate(
        &self,
        identifier: &str,
        version: i64,
    ) -> DunningResult<(TemplateRow, Option<i64>)> {
        let previous = self.store.active_template(identifier)?.map(|t| t.version);
        if !self.store.activate_template_version(identifier, version)? {
            return Err(DunningError::NotFound(format!(
                "Template '{identifier}' version {version}"
            )));
        }
        let row = self
            .store
            .active_template(identifier)?
            .ok_or_else(|| DunningError::NotFound(format!("Template '{identifier}'")))?;
        log::info!("template {identifier} activated version {version} (previous {previous:?})");
        Ok((row, previous))
    }

    /// Delete every version. Returns how many were removed; 0 when absent.
    pub fn delete(&self, identifier: &str) -> DunningResult<usize> {
        let n = self.store.delete_templates(identifier)?;
        if n > 0 {
            log::info!("template {identifier} deleted ({n} versions)");
        }
        Ok(n)
    }

    pub fn exists(&self, identifier: &str) -> DunningResult<bool> {
        self.store.template_exists(identifier)
    }

    pub fn identifiers(&self) -> DunningResult<Vec<String>> {
        self.store.template_identifiers()
    }
}

/// Trim, bound and sanitize template content before it is stored.
pub fn validate_and_sanitize(data: &TemplateData) -> DunningResult<TemplateData> {
    let subject = data.subject.trim();
    let body = data.body.trim();
    if subject.is_empty() {
        return Err(DunningError::InvalidTemplate("Subject cannot be empty".into()));
    }
    if body.is_empty() {
        return Err(DunningError::InvalidTemplate("Body cannot be empty".into()));
    }
    if subject.chars().count() > MAX_SUBJECT_LEN {
        return Err(DunningError::InvalidTemplate(
            "Subject line too long (maximum 500 characters)".into(),
        ));
    }
    if body.chars().count() > MAX_BODY_LEN {
        return Err(DunningError::InvalidTemplate(
            "Email body too long (maximum 50,000 characters)".into(),
        ));
    }
    Ok(TemplateData {
        subject: subject.to_string(),
        body: sanitize_html(body),
    })
}

fn re_script() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<script\b.*?</script\s*>").expect("static regex"))
}

fn re_event_handler() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\s*on\w+\s*=\s*(?:"[^"]*"|'[^']*')"#).expect("static regex")
    })
}

fn re_javascript_scheme() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)javascript:").expect("static regex"))
}

/// Strip script blocks, inline `on*=` handlers and `javascript:` schemes.
pub fn sanitize_html(html: &str) -> String {
    let html = re_script().replace_all(html, "");
    let html = re_event_handler().replace_all(&html, "");
    re_javascript_scheme().replace_all(&html, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_script_blocks_across_lines() {
        let out = sanitize_html("<p>Hi</p><SCRIPT type=\"x\">\nalert(1)\n</script><p>Bye</p>");
        assert_eq!(out, "<p>Hi</p><p>Bye</p>");
    }

    #[test]
    fn strips_inline_handlers_and_js_scheme() {
        let out = sanitize_html(r#"<a href="javascript:go()" onclick="steal()">pay</a>"#);
        assert_eq!(out, r#"<a href="go()">pay</a>"#);
    }

    #[test]
    fn leaves_plain_markup_alone() {
        let html = "<p>Dear {{account_name}}, you owe {{total_outstanding}}.</p>";
        assert_eq!(sanitize_html(html), html);
    }

    #[test]
    fn validation_trims_and_bounds() {
        let ok = validate_and_sanitize(&TemplateData::new("  Reminder  ", "  <p>x</p> ")).unwrap();
        assert_eq!(ok.subject, "Reminder");
        assert_eq!(ok.body, "<p>x</p>");

        assert!(validate_and_sanitize(&TemplateData::new("   ", "body")).is_err());
        assert!(validate_and_sanitize(&TemplateData::new("s", " ")).is_err());
        let long = "x".repeat(MAX_SUBJECT_LEN + 1);
        assert!(validate_and_sanitize(&TemplateData::new(long, "body")).is_err());
    }
}
