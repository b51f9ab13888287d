// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Time-bucketed historical aggregates
//!
//! A [`Histogram`] maps bucket labels to running count/sum/avg. Every sample
//! lands in one bucket per active granularity, and each granularity is
//! maintained independently: buckets are never rolled up into one another.
//!
//! ```text
//! "2024-03"        month
//! "2024-03-15"     day       (tracks min/max by default)
//! "2024-03-15_14"  day_hour
//! ```
//!
//! ISO labels sort chronologically, so a `BTreeMap` doubles as a time index.

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{CoreError, Result};

/// Width of a histogram bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Month,
    Day,
    DayHour,
}

impl Granularity {
    pub const ALL: [Granularity; 3] = [Granularity::Month, Granularity::Day, Granularity::DayHour];

    /// Bucket label for this granularity.
    pub fn label(self, labels: &TimeLabels) -> String {
        match self {
            Granularity::Month => labels.month.clone(),
            Granularity::Day => labels.day.clone(),
            Granularity::DayHour => format!("{}_{}", labels.day, labels.hour),
        }
    }

    /// Recognise a bucket label's granularity from its shape.
    pub fn of_label(label: &str) -> Option<Granularity> {
        if !label.is_ascii() {
            return None;
        }
        match label.len() {
            7 if is_month(label) => Some(Granularity::Month),
            10 if is_day(label) => Some(Granularity::Day),
            13 if label.as_bytes()[10] == b'_'
                && is_day(&label[..10])
                && is_hour(&label[11..]) =>
            {
                Some(Granularity::DayHour)
            }
            _ => None,
        }
    }
}

fn is_day(s: &str) -> bool {
    s.len() == 10 && NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}

fn is_month(s: &str) -> bool {
    s.len() == 7 && NaiveDate::parse_from_str(&format!("{s}-01"), "%Y-%m-%d").is_ok()
}

fn is_hour(s: &str) -> bool {
    s.len() == 2
        && s.bytes().all(|b| b.is_ascii_digit())
        && s.parse::<u8>().map_or(false, |h| h < 24)
}

/// Pre-formatted time labels for one sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeLabels {
    /// `YYYY-MM`
    pub month: String,
    /// `YYYY-MM-DD`
    pub day: String,
    /// `HH`, 00 through 23
    pub hour: String,
}

impl TimeLabels {
    /// Build from caller-formatted strings, validating their shape.
    pub fn new(
        day: impl Into<String>,
        month: impl Into<String>,
        hour: impl Into<String>,
    ) -> Result<Self> {
        let labels = Self {
            month: month.into(),
            day: day.into(),
            hour: hour.into(),
        };
        if !is_day(&labels.day) {
            return Err(CoreError::InvalidLabel {
                label: labels.day,
                expected: "YYYY-MM-DD",
            });
        }
        if !is_month(&labels.month) {
            return Err(CoreError::InvalidLabel {
                label: labels.month,
                expected: "YYYY-MM",
            });
        }
        if !is_hour(&labels.hour) {
            return Err(CoreError::InvalidLabel {
                label: labels.hour,
                expected: "HH (00-23)",
            });
        }
        Ok(labels)
    }

    /// Derive labels from an event timestamp.
    pub fn from_datetime(ts: &DateTime<Utc>) -> Self {
        Self {
            month: format!("{:04}-{:02}", ts.year(), ts.month()),
            day: format!("{:04}-{:02}-{:02}", ts.year(), ts.month(), ts.day()),
            hour: format!("{:02}", ts.hour()),
        }
    }
}

/// Running count/sum/avg for one bucket, with optional extrema.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketStats {
    pub count: u64,
    pub sum: f64,
    pub avg: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl BucketStats {
    pub fn first(sample: f64, track_extrema: bool) -> Self {
        Self {
            count: 1,
            sum: sample,
            avg: sample,
            min: track_extrema.then_some(sample),
            max: track_extrema.then_some(sample),
        }
    }

    /// Fold one more sample in.
    ///
    /// Extrema only move once they exist: a bucket opened while extrema were
    /// off keeps `None` rather than reporting a min/max over a partial range.
    pub fn push(&self, sample: f64, track_extrema: bool) -> Self {
        let count = self.count + 1;
        let sum = self.sum + sample;
        let (min, max) = if track_extrema {
            (self.min.map(|m| m.min(sample)), self.max.map(|m| m.max(sample)))
        } else {
            (self.min, self.max)
        };

        Self {
            count,
            sum,
            avg: sum / count as f64,
            min,
            max,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.sum.is_finite() && self.avg.is_finite()
    }
}

/// Bucket label → bucket stats, across all active granularities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Histogram {
    buckets: BTreeMap<String, BucketStats>,
}

impl Histogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, label: &str) -> Option<&BucketStats> {
        self.buckets.get(label)
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BucketStats)> {
        self.buckets.iter().map(|(label, stats)| (label.as_str(), stats))
    }

    /// Buckets of one granularity, in chronological order.
    pub fn buckets(&self, granularity: Granularity) -> impl Iterator<Item = (&str, &BucketStats)> {
        self.iter()
            .filter(move |(label, _)| Granularity::of_label(label) == Some(granularity))
    }

    /// Merge the buckets of `granularity` whose labels fall in `[from, to]`.
    pub fn summarize(&self, granularity: Granularity, from: &str, to: &str) -> BucketSummary {
        let mut summary = BucketSummary::default();
        if from > to {
            return summary;
        }

        for (label, stats) in self.buckets.range(from.to_string()..=to.to_string()) {
            if Granularity::of_label(label) != Some(granularity) {
                continue;
            }
            summary.buckets += 1;
            summary.count += stats.count;
            summary.sum += stats.sum;
            summary.min = merge_extremum(summary.min, stats.min, f64::min);
            summary.max = merge_extremum(summary.max, stats.max, f64::max);
        }

        if summary.count > 0 {
            summary.avg = summary.sum / summary.count as f64;
        }
        summary
    }

    pub fn is_finite(&self) -> bool {
        self.buckets.values().all(BucketStats::is_finite)
    }

    fn upsert(&mut self, label: String, sample: f64, track_extrema: bool) {
        self.buckets
            .entry(label)
            .and_modify(|b| *b = b.push(sample, track_extrema))
            .or_insert_with(|| BucketStats::first(sample, track_extrema));
    }
}

fn merge_extremum(acc: Option<f64>, next: Option<f64>, pick: fn(f64, f64) -> f64) -> Option<f64> {
    match (acc, next) {
        (Some(a), Some(b)) => Some(pick(a, b)),
        (a, b) => a.or(b),
    }
}

/// Merged view over a label range of one granularity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketSummary {
    pub buckets: usize,
    pub count: u64,
    pub sum: f64,
    pub avg: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// Pure multi-granularity histogram accumulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistogramAccumulator {
    granularities: Vec<Granularity>,
    extrema: Option<Granularity>,
}

impl Default for HistogramAccumulator {
    /// Month, day and day-hour buckets; only the day bucket tracks min/max.
    fn default() -> Self {
        Self::new(Granularity::ALL.to_vec(), Some(Granularity::Day))
    }
}

impl HistogramAccumulator {
    pub fn new(granularities: Vec<Granularity>, extrema: Option<Granularity>) -> Self {
        let mut granularities = granularities;
        granularities.sort();
        granularities.dedup();
        Self {
            granularities,
            extrema,
        }
    }

    pub fn granularities(&self) -> &[Granularity] {
        &self.granularities
    }

    /// Fold `sample` into one bucket per active granularity.
    pub fn apply(&self, old: Option<&Histogram>, sample: f64, labels: &TimeLabels) -> Histogram {
        let mut histogram = old.cloned().unwrap_or_default();
        for &granularity in &self.granularities {
            let track_extrema = self.extrema == Some(granularity);
            histogram.upsert(granularity.label(labels), sample, track_extrema);
        }
        histogram
    }
}
