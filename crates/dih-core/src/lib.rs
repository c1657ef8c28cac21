//! Core domain model and window planning for the donation hub.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "dih-core";

/// A single donation transaction as reported by an upstream source.
///
/// `id` is the natural key assigned by the remote source and is unique
/// within one source. `source` is the provenance tag; it may be absent on
/// freshly fetched rows and is stamped during consolidation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonationRecord {
    pub id: i64,
    pub amount: f64,
    #[serde(default)]
    pub currency: Option<String>,
    pub date: String,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

/// One calendar month of fetch-and-persist work.
///
/// Invariant: `date_to` is exactly one second before the first instant of
/// the following month, so consecutive windows are contiguous and disjoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthWindow {
    pub year: i32,
    pub month: u32,
    pub date_from: NaiveDateTime,
    pub date_to: NaiveDateTime,
}

impl MonthWindow {
    /// `YYYY-MM` label used for logging and partition file naming.
    pub fn label(&self) -> String {
        format!("{:04}-{:02}", self.year, self.month)
    }

    pub fn partition_file_name(&self) -> String {
        format!("donations_{}.db", self.label())
    }

    /// Window start in the wire form the reporting API expects
    /// (millisecond precision, UTC).
    pub fn date_from_param(&self) -> String {
        self.date_from.format("%Y-%m-%dT%H:%M:%S.000Z").to_string()
    }

    /// Window end in the wire form the reporting API expects.
    pub fn date_to_param(&self) -> String {
        self.date_to.format("%Y-%m-%dT%H:%M:%S.000Z").to_string()
    }
}

/// Plan one calendar month. The end instant is derived from the start of
/// the next month, never from month-length arithmetic.
pub fn plan_month(year: i32, month: u32) -> MonthWindow {
    let date_from = NaiveDate::from_ymd_opt(year, month, 1)
        .expect("month must be in 1..=12")
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid");

    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    let next_start = NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .expect("successor month is always valid")
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid");

    MonthWindow {
        year,
        month,
        date_from,
        date_to: next_start - Duration::seconds(1),
    }
}

/// Plan a full year: twelve windows, chronological, contiguous, disjoint.
/// Pure and deterministic so a harvest run can recompute its windows at any
/// time without hidden state.
pub fn plan_year(year: i32) -> Vec<MonthWindow> {
    (1..=12).map(|month| plan_month(year, month)).collect()
}
