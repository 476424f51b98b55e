//! Aging buckets and the per-invoice values derived from them.
//!
//! Five fixed day-ranges: 0-30, 31-60, 61-90, 91-120, 120+.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::types::{money_differs, Money};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AgingBuckets {
    pub days_0_30: Money,
    pub days_31_60: Money,
    pub days_61_90: Money,
    pub days_91_120: Money,
    pub days_over_120: Money,
}

impl AgingBuckets {
    pub fn new(
        days_0_30: Money,
        days_31_60: Money,
        days_61_90: Money,
        days_91_120: Money,
        days_over_120: Money,
    ) -> Self {
        Self {
            days_0_30,
            days_31_60,
            days_61_90,
            days_91_120,
            days_over_120,
        }
    }

    pub fn total(&self) -> Money {
        self.days_0_30 + self.days_31_60 + self.days_61_90 + self.days_91_120 + self.days_over_120
    }

    pub fn as_array(&self) -> [Money; 5] {
        [
            self.days_0_30,
            self.days_31_60,
            self.days_61_90,
            self.days_91_120,
            self.days_over_120,
        ]
    }

    /// Money only in the 0-30 bucket. Such an invoice needs no escalation.
    pub fn is_fresh_only(&self) -> bool {
        self.days_0_30 > 0.0
            && self.days_31_60 == 0.0
            && self.days_61_90 == 0.0
            && self.days_91_120 == 0.0
            && self.days_over_120 == 0.0
    }

    pub fn any_negative(&self) -> bool {
        self.as_array().iter().any(|v| *v < 0.0)
    }

    /// Field-by-field comparison at cent precision.
    pub fn differs_from(&self, other: &AgingBuckets) -> bool {
        self.as_array()
            .iter()
            .zip(other.as_array().iter())
            .any(|(a, b)| money_differs(*a, *b))
    }

    pub fn accumulate(&mut self, other: &AgingBuckets) {
        self.days_0_30 += other.days_0_30;
        self.days_31_60 += other.days_31_60;
        self.days_61_90 += other.days_61_90;
        self.days_91_120 += other.days_91_120;
        self.days_over_120 += other.days_over_120;
    }
}

/// Whole days between invoice and snapshot, floored at zero.
/// No payment-terms offset is applied.
pub fn days_overdue(invoice_date: NaiveDate, snapshot_date: NaiveDate) -> i64 {
    (snapshot_date - invoice_date).num_days().max(0)
}

/// Bucket label for a day count. Derived from dates, independent of which
/// bucket the amount was filed under.
pub fn aging_bucket_label(days_overdue: i64) -> &'static str {
    match days_overdue {
        d if d <= 30 => "0-30",
        d if d <= 60 => "31-60",
        d if d <= 90 => "61-90",
        d if d <= 120 => "91-120",
        _ => "120+",
    }
}

/// Account-wide bucket totals shown alongside escalation emails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AgingSummary {
    #[serde(flatten)]
    pub buckets: AgingBuckets,
    pub total: Money,
}

impl AgingSummary {
    pub fn from_buckets<'a>(all: impl IntoIterator<Item = &'a AgingBuckets>) -> Self {
        let mut buckets = AgingBuckets::default();
        for b in all {
            buckets.accumulate(b);
        }
        Self {
            total: buckets.total(),
            buckets,
        }
    }
}

/// One invoice's newly created snapshot, as handed from import to escalation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgingSnapshotSummary {
    pub invoice_number: String,
    pub invoice_date: NaiveDate,
    pub snapshot_date: NaiveDate,
    #[serde(flatten)]
    pub buckets: AgingBuckets,
}

impl AgingSnapshotSummary {
    pub fn outstanding(&self) -> Money {
        self.buckets.total()
    }

    pub fn days_overdue(&self) -> i64 {
        days_overdue(self.invoice_date, self.snapshot_date)
    }
}

/// Per-invoice line shown in escalation emails and delivery records.
///
/// Amounts come from the snapshot's buckets; the age and its label are
/// recomputed from the invoice and snapshot dates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceDetail {
    pub invoice_id: String,
    pub invoice_number: String,
    pub invoice_amount: Money,
    pub total_outstanding: Money,
    pub days_overdue: i64,
    pub aging_bucket: String,
}

impl InvoiceDetail {
    pub fn from_snapshot(snapshot: &AgingSnapshotSummary) -> Self {
        let outstanding = snapshot.outstanding();
        let days = snapshot.days_overdue();
        Self {
            invoice_id: snapshot.invoice_number.clone(),
            invoice_number: snapshot.invoice_number.clone(),
            invoice_amount: outstanding,
            total_outstanding: outstanding,
            days_overdue: days,
            aging_bucket: aging_bucket_label(days).to_string(),
        }
    }
}
