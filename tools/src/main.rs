//! dunning-runner: headless front end for the receivables dunning pipeline.
//!
//! Usage:
//!   dunning-runner import aging.csv --snapshot-date 2025-03-01
//!   dunning-runner escalate aging.csv --preview --offline
//!   dunning-runner template create ESCALATION_LEVEL_1 --subject "..." --body-file l1.html
//!
//! Every command prints JSON on stdout; logs go to stderr (RUST_LOG).
//! Mail goes to the spool directory unless `mail.transport` (or
//! MAIL_TRANSPORT) is `smtp`.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use dunning_core::{
    config::AppConfig,
    csv_import::{self, ImportOptions, ImportResult},
    escalation::{self, EscalationRequest, EscalationService},
    personalize::{ClaudePersonalizer, ContentRules, Personalizer, TemplateRenderer},
    store::AgingStore,
    templates::{TemplateData, TemplateService},
    transport::transport_from_config,
};
use serde::Serialize;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "dunning-runner", version, about = "Invoice aging import and escalation emails")]
struct Cli {
    /// JSON config file; missing file means defaults.
    #[arg(long, default_value = "dunning.json")]
    config: String,

    /// Overrides `database_path` from the config.
    #[arg(long)]
    db: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check a CSV file's header and rows without importing.
    Validate { csv: String },
    /// Import an aging CSV.
    Import {
        csv: String,
        #[arg(long)]
        snapshot_date: Option<NaiveDate>,
    },
    /// Import an aging CSV, then escalate the contact-ready accounts.
    Escalate {
        csv: String,
        #[arg(long)]
        snapshot_date: Option<NaiveDate>,
        /// Actually deliver the generated emails.
        #[arg(long)]
        send: bool,
        /// Generate only, report template usage.
        #[arg(long)]
        preview: bool,
        #[arg(long, default_value_t = 10)]
        batch_size: usize,
        #[arg(long)]
        no_retry: bool,
        /// Fill templates locally instead of calling the text generator.
        #[arg(long)]
        offline: bool,
    },
    /// Import an aging CSV and report how many accounts would escalate.
    Analyze {
        csv: String,
        #[arg(long)]
        snapshot_date: Option<NaiveDate>,
    },
    #[command(subcommand)]
    Template(TemplateCommand),
    /// Counts and totals across the whole store.
    Summary,
    /// Print an example CSV with every recognised column.
    CsvTemplate,
}

#[derive(Subcommand)]
enum TemplateCommand {
    Create {
        identifier: String,
        #[arg(long)]
        subject: String,
        #[command(flatten)]
        body: BodyArg,
    },
    Update {
        identifier: String,
        #[arg(long)]
        subject: String,
        #[command(flatten)]
        body: BodyArg,
    },
    Show {
        identifier: String,
        #[arg(long)]
        version: Option<i64>,
    },
    Versions { identifier: String },
    Activate { identifier: String, version: i64 },
    Delete { identifier: String },
    List {
        #[arg(long, default_value_t = 0)]
        skip: usize,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
}

#[derive(clap::Args)]
#[group(required = true, multiple = false)]
struct BodyArg {
    #[arg(long)]
    body: Option<String>,
    #[arg(long)]
    body_file: Option<String>,
}

impl BodyArg {
    fn read(&self) -> Result<String> {
        match (&self.body, &self.body_file) {
            (Some(body), _) => Ok(body.clone()),
            (None, Some(path)) => {
                std::fs::read_to_string(path).with_context(|| format!("reading {path}"))
            }
            (None, None) => bail!("either --body or --body-file is required"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = AppConfig::load(&cli.config)?;
    if let Some(db) = cli.db {
        config.database_path = db;
    }

    match cli.command {
        Command::CsvTemplate => {
            print!("{}", csv_import::template_csv());
            Ok(())
        }
        Command::Validate { csv } => print_json(&csv_import::validate_csv_format(&read_csv(&csv)?)),
        command => {
            let store = AgingStore::open(&config.database_path)?;
            store.migrate()?;
            run(command, &config, &store).await
        }
    }
}

async fn run(command: Command, config: &AppConfig, store: &AgingStore) -> Result<()> {
    match command {
        Command::Import { csv, snapshot_date } => {
            let result = import(store, config, &csv, snapshot_date)?;
            print_json(&result)
        }
        Command::Analyze { csv, snapshot_date } => {
            let result = import(store, config, &csv, snapshot_date)?;
            print_json(&escalation::analyze_escalation_needs(
                &result.contact_ready_clients,
            ))
        }
        Command::Escalate {
            csv,
            snapshot_date,
            send,
            preview,
            batch_size,
            no_retry,
            offline,
        } => {
            let imported = import(store, config, &csv, snapshot_date)?;
            let validation = escalation::validate_escalation_input(&imported.contact_ready_clients);
            for e in &validation.validation_errors {
                log::warn!("{}: {} {}", e.account_name, e.field, e.error_message);
            }

            let personalizer: Arc<dyn Personalizer> = if offline {
                Arc::new(TemplateRenderer::new(ContentRules::from(&config.personalization)))
            } else {
                Arc::new(ClaudePersonalizer::new(&config.personalization)?)
            };
            let transport = transport_from_config(&config.mail)?;
            let service = EscalationService::new(personalizer, transport, config.dispatch.clone());

            let request = EscalationRequest {
                contact_ready_clients: imported.contact_ready_clients,
                preview_only: preview,
                send_emails: send,
                email_batch_size: batch_size,
                retry_failed_emails: !no_retry,
            };
            let response = service.process_batch(store, &request).await?;
            print_json(&response)
        }
        Command::Template(cmd) => template(cmd, store),
        Command::Summary => print_json(&store.receivables_summary()?),
        Command::Validate { .. } | Command::CsvTemplate => Ok(()),
    }
}

fn import(
    store: &AgingStore,
    config: &AppConfig,
    path: &str,
    snapshot_date: Option<NaiveDate>,
) -> Result<ImportResult> {
    let text = read_csv(path)?;
    let options = match snapshot_date {
        Some(date) => ImportOptions::on(date, &config.import),
        None => ImportOptions::today(&config.import),
    };
    let result = csv_import::import_csv(store, &text, &options)?;
    log::info!(
        "imported {path}: {}/{} rows, {} snapshots, {} contact-ready",
        result.successful_rows,
        result.total_rows,
        result.aging_snapshots_created,
        result.contact_ready_clients.len()
    );
    Ok(result)
}

fn template(cmd: TemplateCommand, store: &AgingStore) -> Result<()> {
    let service = TemplateService::new(store);
    match cmd {
        TemplateCommand::Create {
            identifier,
            subject,
            body,
        } => {
            let row = service.create(&identifier, &TemplateData::new(subject, body.read()?))?;
            print_json(&row)
        }
        TemplateCommand::Update {
            identifier,
            subject,
            body,
        } => {
            let (row, previous) =
                service.update(&identifier, &TemplateData::new(subject, body.read()?))?;
            print_json(&serde_json::json!({ "template": row, "previous_version": previous }))
        }
        TemplateCommand::Show {
            identifier,
            version,
        } => {
            let row = match version {
                Some(v) => service.version(&identifier, v)?,
                None => service.get(&identifier)?,
            };
            match row {
                Some(row) => print_json(&row),
                None => bail!("template {identifier} not found"),
            }
        }
        TemplateCommand::Versions { identifier } => print_json(&service.versions(&identifier)?),
        TemplateCommand::Activate {
            identifier,
            version,
        } => {
            let (row, previous) = service.activate(&identifier, version)?;
            print_json(&serde_json::json!({ "template": row, "previous_version": previous }))
        }
        TemplateCommand::Delete { identifier } => {
            let deleted = service.delete(&identifier)?;
            if deleted == 0 {
                bail!("template {identifier} not found");
            }
            print_json(&serde_json::json!({ "identifier": identifier, "versions_deleted": deleted }))
        }
        TemplateCommand::List { skip, limit } => {
            let page = service.list(skip, limit)?;
            print_json(&serde_json::json!({
                "templates": page.templates,
                "total": page.total,
                "skip": skip,
                "limit": limit,
            }))
        }
    }
}

fn read_csv(path: &str) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {path}"))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
