use thiserror::Error;

#[derive(Error, Debug)]
pub enum DunningError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("SMTP error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    /// The file itself is unusable: unreadable, missing required columns, no rows.
    #[error("Invalid CSV format: {0}")]
    Format(String),

    /// A single row failed validation; the batch continues.
    #[error("{0}")]
    RowValidation(String),

    #[error("No active escalation template for: {}", identifiers.join(", "))]
    TemplateMissing { identifiers: Vec<String> },

    #[error("Invalid template data: {0}")]
    InvalidTemplate(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("AI email generation is not available - API key not configured")]
    PersonalizationUnavailable,

    #[error("AI email generation failed: {0}")]
    Personalization(String),

    #[error("Email transport failed: {0}")]
    Transport(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type DunningResult<T> = Result<T, DunningError>;
