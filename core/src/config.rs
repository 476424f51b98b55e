use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{DunningError, DunningResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Allowed gap between the bucket sum and the outstanding amount.
    pub amount_tolerance: f64,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            amount_tolerance: 0.01,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Upper bound on concurrent sends per batch. Requests above it are clamped.
    pub max_batch_size: usize,
    pub batch_pause_ms: u64,
    /// Linear backoff unit: attempt N waits N * retry_backoff_ms before retrying.
    pub retry_backoff_ms: u64,
    pub max_attempts: u32,
    pub send_timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            batch_pause_ms: 500,
            retry_backoff_ms: 1_000,
            max_attempts: 3,
            send_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonalizationConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub min_subject_len: usize,
    pub min_body_len: usize,
}

impl Default for PersonalizationConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.anthropic.com/v1".into(),
            model: "claude-3-5-sonnet-20241022".into(),
            max_tokens: 4_000,
            timeout_secs: 60,
            min_subject_len: 5,
            min_body_len: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MailTransportKind {
    /// `.eml` files in `spool_dir`.
    Spool,
    Smtp,
}

impl MailTransportKind {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "spool" => Some(Self::Spool),
            "smtp" => Some(Self::Smtp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpSecurity {
    /// TLS from the first byte (usually port 465).
    Tls,
    /// Plain connect, then mandatory STARTTLS (usually port 587).
    StartTls,
    /// No encryption. Local relays and tests only.
    Plain,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    pub transport: MailTransportKind,
    pub from_email: String,
    pub from_name: String,
    pub spool_dir: String,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_security: SmtpSecurity,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub smtp_timeout_secs: u64,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            transport: MailTransportKind::Spool,
            from_email: "noreply@example.com".into(),
            from_name: "Accounts Receivable".into(),
            spool_dir: "./outbox".into(),
            smtp_host: "localhost".into(),
            smtp_port: 587,
            smtp_security: SmtpSecurity::StartTls,
            smtp_username: None,
            smtp_password: None,
            smtp_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_path: String,
    pub import: ImportConfig,
    pub dispatch: DispatchConfig,
    pub personalization: PersonalizationConfig,
    pub mail: MailConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: "dunning.db".into(),
            import: ImportConfig::default(),
            dispatch: DispatchConfig::default(),
            personalization: PersonalizationConfig::default(),
            mail: MailConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from a JSON file, then apply environment overrides.
    /// A missing file yields the defaults; a malformed one is an error.
    pub fn load(path: &str) -> DunningResult<Self> {
        let mut config = if Path::new(path).exists() {
            let content = std::fs::read_to_string(path)
                .map_err(|e| DunningError::Config(format!("Cannot read {path}: {e}")))?;
            serde_json::from_str(&content)
                .map_err(|e| DunningError::Config(format!("Cannot parse {path}: {e}")))?
        } else {
            log::debug!("config file {path} not found, using defaults");
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Environment overrides, looked up through `lookup` so tests stay hermetic.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(db) = lookup("DUNNING_DB") {
            self.database_path = db;
        }
        if let Some(key) = lookup("CLAUDE_API_KEY").filter(|k| !k.trim().is_empty()) {
            self.personalization.api_key = Some(key);
        }
        if let Some(from) = lookup("FROM_EMAIL") {
            self.mail.from_email = from;
        }
        if let Some(name) = lookup("FROM_NAME") {
            self.mail.from_name = name;
        }
        if let Some(dir) = lookup("DUNNING_SPOOL_DIR") {
            self.mail.spool_dir = dir;
        }
        if let Some(kind) = lookup("MAIL_TRANSPORT") {
            match MailTransportKind::parse(&kind) {
                Some(kind) => self.mail.transport = kind,
                None => log::warn!("ignoring MAIL_TRANSPORT={kind}: expected spool or smtp"),
            }
        }
        if let Some(host) = lookup("SMTP_HOST") {
            self.mail.smtp_host = host;
        }
        if let Some(port) = lookup("SMTP_PORT") {
            match port.trim().parse() {
                Ok(port) => self.mail.smtp_port = port,
                Err(_) => log::warn!("ignoring SMTP_PORT={port}: not a port number"),
            }
        }
        if let Some(user) = lookup("SMTP_USERNAME").filter(|u| !u.trim().is_empty()) {
            self.mail.smtp_username = Some(user);
        }
        if let Some(password) = lookup("SMTP_PASSWORD").filter(|p| !p.is_empty()) {
            self.mail.smtp_password = Some(password);
        }
    }

    pub fn validate(&self) -> DunningResult<()> {
        if self.dispatch.max_batch_size == 0 {
            return Err(DunningError::Config("dispatch.max_batch_size must be >= 1".into()));
        }
        if self.dispatch.max_attempts == 0 {
            return Err(DunningError::Config("dispatch.max_attempts must be >= 1".into()));
        }
        if self.mail.transport == MailTransportKind::Smtp && self.mail.smtp_host.trim().is_empty() {
            return Err(DunningError::Config("mail.smtp_host must be set when mail.transport is smtp".into()));
        }
        if self.mail.smtp_username.is_some() != self.mail.smtp_password.is_some() {
            return Err(DunningError::Config(
                "mail.smtp_username and mail.smtp_password must be set together".into(),
            ));
        }
        if self.import.amount_tolerance < 0.0 {
            return Err(DunningError::Config("import.amount_tolerance must be >= 0".into()));
        }
        Ok(())
    }

    /// Config with hardcoded defaults for use in tests: no pauses, no backoff.
    pub fn default_test() -> Self {
        Self {
            database_path: ":memory:".into(),
            import: ImportConfig::default(),
            dispatch: DispatchConfig {
                max_batch_size: 10,
                batch_pause_ms: 0,
                retry_backoff_ms: 0,
                max_attempts: 3,
                send_timeout_secs: 5,
            },
            personalization: PersonalizationConfig::default(),
            mail: MailConfig {
                from_email: "ar@test.example".into(),
                from_name: "AR Test".into(),
                spool_dir: "./outbox-test".into(),
                smtp_host: "127.0.0.1".into(),
                smtp_port: 2525,
                smtp_security: SmtpSecurity::Plain,
                smtp_timeout_secs: 5,
                ..MailConfig::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_apply() {
        let mut cfg = AppConfig::default();
        cfg.apply_env(|k| match k {
            "CLAUDE_API_KEY" => Some("sk-test".into()),
            "DUNNING_DB" => Some("/tmp/x.db".into()),
            _ => None,
        });
        assert_eq!(cfg.personalization.api_key.as_deref(), Some("sk-test"));
        assert_eq!(cfg.database_path, "/tmp/x.db");
        assert_eq!(cfg.mail.from_email, "noreply@example.com");
    }

    #[test]
    fn blank_api_key_is_ignored() {
        let mut cfg = AppConfig::default();
        cfg.apply_env(|k| (k == "CLAUDE_API_KEY").then(|| "  ".to_string()));
        assert!(cfg.personalization.api_key.is_none());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: AppConfig =
            serde_json::from_str(r#"{"dispatch": {"max_batch_size": 4}}"#).unwrap();
        assert_eq!(cfg.dispatch.max_batch_size, 4);
        assert_eq!(cfg.dispatch.max_attempts, 3);
        assert_eq!(cfg.import.amount_tolerance, 0.01);
    }

    #[test]
    fn smtp_settings_come_from_env() {
        let mut cfg = AppConfig::default();
        cfg.apply_env(|k| match k {
            "MAIL_TRANSPORT" => Some("SMTP".into()),
            "SMTP_HOST" => Some("email-smtp.example.com".into()),
            "SMTP_PORT" => Some("465".into()),
            "SMTP_USERNAME" => Some("user".into()),
            "SMTP_PASSWORD" => Some("secret".into()),
            _ => None,
        });
        assert_eq!(cfg.mail.transport, MailTransportKind::Smtp);
        assert_eq!(cfg.mail.smtp_host, "email-smtp.example.com");
        assert_eq!(cfg.mail.smtp_port, 465);
        assert_eq!(cfg.mail.smtp_username.as_deref(), Some("user"));
        assert!(cfg.validate().is_ok());

        cfg.apply_env(|k| match k {
            "MAIL_TRANSPORT" => Some("pigeon".into()),
            "SMTP_PORT" => Some("lots".into()),
            _ => None,
        });
        assert_eq!(cfg.mail.transport, MailTransportKind::Smtp);
        assert_eq!(cfg.mail.smtp_port, 465);
    }

    #[test]
    fn smtp_credentials_come_in_pairs() {
        let mut cfg = AppConfig::default_test();
        cfg.mail.smtp_username = Some("user".into());
        assert!(cfg.validate().is_err());
        cfg.mail.smtp_password = Some("secret".into());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn mail_transport_parses_from_json() {
        let cfg: AppConfig = serde_json::from_str(
            r#"{"mail": {"transport": "smtp", "smtp_security": "starttls", "smtp_host": "relay"}}"#,
        )
        .unwrap();
        assert_eq!(cfg.mail.transport, MailTransportKind::Smtp);
        assert_eq!(cfg.mail.smtp_security, SmtpSecurity::StartTls);
        assert_eq!(cfg.mail.smtp_port, 587);
    }

    #[test]
    fn zero_batch_size_rejected() {
        let mut cfg = AppConfig::default_test();
        cfg.dispatch.max_batch_size = 0;
        assert!(cfg.validate().is_err());
    }
}
