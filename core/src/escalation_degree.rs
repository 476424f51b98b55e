//! Escalation degree: how severe an account's overdue position is.
//!
//! Pure functions only. No store, no IO.
//!
//! Per-invoice rule (first match wins, higher buckets dominate):
//!   3: any money in 91-120 or 120+
//!   2: any money in 61-90
//!   1: any money in 31-60
//!   0: otherwise
//!
//! Account rule: the maximum per-invoice degree. Only invoices at that
//! maximum qualify for the escalation email; degree-0 invoices never do.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::aging::{AgingBuckets, AgingSnapshotSummary};
use crate::types::Money;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum EscalationDegree {
    None = 0,
    First = 1,
    Second = 2,
    Final = 3,
}

impl EscalationDegree {
    pub const ALL: [EscalationDegree; 4] = [
        EscalationDegree::None,
        EscalationDegree::First,
        EscalationDegree::Second,
        EscalationDegree::Final,
    ];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn needs_escalation(self) -> bool {
        self != EscalationDegree::None
    }

    /// Template identifier the degree routes to, e.g. `ESCALATION_LEVEL_2`.
    pub fn template_identifier(self) -> String {
        format!("ESCALATION_LEVEL_{}", self.as_u8())
    }

    pub fn reason(self) -> &'static str {
        match self {
            EscalationDegree::None => "No escalation needed (all invoices 0-30 days)",
            EscalationDegree::First => "Invoices in 31-60 days aging bucket",
            EscalationDegree::Second => "Invoices in 61-90 days aging bucket",
            EscalationDegree::Final => "Invoices in 91-120+ days aging buckets",
        }
    }
}

impl From<EscalationDegree> for u8 {
    fn from(d: EscalationDegree) -> u8 {
        d.as_u8()
    }
}

impl TryFrom<u8> for EscalationDegree {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(EscalationDegree::None),
            1 => Ok(EscalationDegree::First),
            2 => Ok(EscalationDegree::Second),
            3 => Ok(EscalationDegree::Final),
            other => Err(format!("escalation degree must be 0-3, got {other}")),
        }
    }
}

impl fmt::Display for EscalationDegree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationDegreeInfo {
    pub degree: EscalationDegree,
    pub reason: String,
    pub qualifying_invoices: Vec<String>,
    /// Bucket total across qualifying invoices only.
    pub total_amount: Money,
}

/// Degree of a single snapshot.
pub fn invoice_degree(buckets: &AgingBuckets) -> EscalationDegree {
    if buckets.days_91_120 > 0.0 || buckets.days_over_120 > 0.0 {
        EscalationDegree::Final
    } else if buckets.days_61_90 > 0.0 {
        EscalationDegree::Second
    } else if buckets.days_31_60 > 0.0 {
        EscalationDegree::First
    } else {
        EscalationDegree::None
    }
}

/// Account-level degree across all of an account's snapshots.
/// An empty list yields degree 0 with no qualifying invoices.
pub fn calculate_degree(snapshots: &[AgingSnapshotSummary]) -> EscalationDegreeInfo {
    let degrees: Vec<EscalationDegree> = snapshots
        .iter()
        .map(|s| invoice_degree(&s.buckets))
        .collect();
    let degree = degrees
        .iter()
        .copied()
        .max()
        .unwrap_or(EscalationDegree::None);

    let mut qualifying_invoices = Vec::new();
    let mut total_amount = 0.0;
    if degree.needs_escalation() {
        for (snapshot, d) in snapshots.iter().zip(degrees.iter()) {
            if *d == degree {
                qualifying_invoices.push(snapshot.invoice_number.clone());
                total_amount += snapshot.outstanding();
            }
        }
    }

    EscalationDegreeInfo {
        degree,
        reason: degree.reason().to_string(),
        qualifying_invoices,
        total_amount,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn snap(number: &str, b: [f64; 5]) -> AgingSnapshotSummary {
        AgingSnapshotSummary {
            invoice_number: number.into(),
            invoice_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            snapshot_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            buckets: AgingBuckets::new(b[0], b[1], b[2], b[3], b[4]),
        }
    }

    #[test]
    fn truth_table_over_every_bucket_combination() {
        // 32 presence/absence combinations of the five buckets.
        for mask in 0u8..32 {
            let b: Vec<f64> = (0..5)
                .map(|i| if mask & (1 << i) != 0 { 10.0 } else { 0.0 })
                .collect();
            let buckets = AgingBuckets::new(b[0], b[1], b[2], b[3], b[4]);
            let expected = if b[3] > 0.0 || b[4] > 0.0 {
                3
            } else if b[2] > 0.0 {
                2
            } else if b[1] > 0.0 {
                1
            } else {
                0
            };
            assert_eq!(
                invoice_degree(&buckets).as_u8(),
                expected,
                "mask {mask:05b} gave the wrong degree"
            );
        }
    }

    #[test]
    fn single_61_90_invoice_is_degree_two() {
        let info = calculate_degree(&[snap("INV-100", [0.0, 0.0, 500.0, 0.0, 0.0])]);
        assert_eq!(info.degree, EscalationDegree::Second);
        assert_eq!(info.qualifying_invoices, vec!["INV-100".to_string()]);
        assert_eq!(info.total_amount, 500.0);
        assert_eq!(info.reason, "Invoices in 61-90 days aging bucket");
    }

    #[test]
    fn only_invoices_at_the_account_degree_qualify() {
        let info = calculate_degree(&[
            snap("INV-1", [0.0, 100.0, 0.0, 0.0, 0.0]),
            snap("INV-3", [0.0, 0.0, 0.0, 0.0, 50.0]),
        ]);
        assert_eq!(info.degree, EscalationDegree::Final);
        assert_eq!(info.qualifying_invoices, vec!["INV-3".to_string()]);
        assert_eq!(info.total_amount, 50.0);
    }

    #[test]
    fn fresh_invoices_never_qualify() {
        let info = calculate_degree(&[
            snap("INV-FRESH", [900.0, 0.0, 0.0, 0.0, 0.0]),
            snap("INV-OLD", [0.0, 0.0, 0.0, 75.0, 0.0]),
        ]);
        assert_eq!(info.degree, EscalationDegree::Final);
        assert!(!info.qualifying_invoices.contains(&"INV-FRESH".to_string()));
        assert_eq!(info.total_amount, 75.0);
    }

    #[test]
    fn all_fresh_account_is_degree_zero() {
        let info = calculate_degree(&[
            snap("A", [10.0, 0.0, 0.0, 0.0, 0.0]),
            snap("B", [0.0, 0.0, 0.0, 0.0, 0.0]),
        ]);
        assert_eq!(info.degree, EscalationDegree::None);
        assert!(info.qualifying_invoices.is_empty());
        assert_eq!(info.total_amount, 0.0);
        assert_eq!(calculate_degree(&[]).degree, EscalationDegree::None);
    }

    #[test]
    fn higher_bucket_dominates_within_one_invoice() {
        let info = calculate_degree(&[snap("MIX", [5.0, 5.0, 5.0, 0.0, 5.0])]);
        assert_eq!(info.degree, EscalationDegree::Final);
        assert_eq!(info.total_amount, 20.0);
    }

    #[test]
    fn degree_serializes_as_number() {
        assert_eq!(serde_json::to_string(&EscalationDegree::Second).unwrap(), "2");
        let d: EscalationDegree = serde_json::from_str("3").unwrap();
        assert_eq!(d, EscalationDegree::Final);
        assert!(serde_json::from_str::<EscalationDegree>("4").is_err());
        assert_eq!(EscalationDegree::First.template_identifier(), "ESCALATION_LEVEL_1");
    }
}
