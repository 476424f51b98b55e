//! Receivables dunning: aging import, escalation degree, templated
//! collection emails and their batched delivery.

pub mod aging;
pub mod config;
pub mod csv_import;
pub mod dispatch;
pub mod error;
pub mod escalation;
pub mod escalation_degree;
pub mod event;
pub mod personalize;
pub mod store;
pub mod templates;
pub mod transport;
pub mod types;
