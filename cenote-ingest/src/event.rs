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

//! Event envelope
//!
//! ```json
//! {
//!   "cenote": {
//!     "url": "/projects/p1/events/orders",
//!     "created_at": 1704103200000,
//!     "timestamp": "2024-01-01T10:00:00Z",
//!     "id": "7d0c..."
//!   },
//!   "data": { "price": 10.5, "user": { "id": "u1" } }
//! }
//! ```

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use cenote_core::TimeLabels;

use crate::error::{IngestError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    pub url: String,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub created_at: Option<i64>,
    /// Event time, ISO-8601. Falls back to `created_at` when absent.
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub cenote: EventMeta,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl EventEnvelope {
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn table(&self) -> Result<String> {
        table_name(&self.cenote.url)
    }

    /// When the event happened: `timestamp`, else `created_at`, else now.
    pub fn event_time(&self) -> Result<DateTime<Utc>> {
        if let Some(ts) = &self.cenote.timestamp {
            return parse_timestamp(ts);
        }
        match self.cenote.created_at {
            Some(ms) => Utc.timestamp_millis_opt(ms).single().ok_or_else(|| {
                IngestError::MalformedEvent(format!("created_at {ms} is out of range"))
            }),
            None => Ok(Utc::now()),
        }
    }

    pub fn time_labels(&self) -> Result<TimeLabels> {
        Ok(TimeLabels::from_datetime(&self.event_time()?))
    }
}

/// `<project_id>_<collection>` from `.../projects/<project_id>/events/<collection>[/]`.
pub fn table_name(url: &str) -> Result<String> {
    let url = url.strip_suffix('/').unwrap_or(url);
    let malformed = || IngestError::MalformedEvent(format!("no project/collection in url {url:?}"));

    let (_, tail) = url.rsplit_once("/projects/").ok_or_else(malformed)?;
    let (project, collection) = tail.split_once("/events/").ok_or_else(malformed)?;
    if project.is_empty() || collection.is_empty() || collection.contains('/') {
        return Err(malformed());
    }
    Ok(format!("{project}_{collection}"))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    // Naive ISO timestamps are taken as UTC.
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| IngestError::MalformedEvent(format!("timestamp {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name() {
        assert_eq!(
            table_name("https://api.example.com/projects/p1/events/orders").unwrap(),
            "p1_orders"
        );
        assert_eq!(table_name("/projects/p1/events/orders/").unwrap(), "p1_orders");
        assert!(table_name("/projects/p1/orders").is_err());
        assert!(table_name("/projects//events/orders").is_err());
    }

    #[test]
    fn test_parse_envelope() {
        let event = EventEnvelope::from_json(
            r#"{"cenote": {"url": "/projects/p1/events/orders", "created_at": 1704103200000},
                "data": {"price": 3}}"#,
        )
        .unwrap();
        assert_eq!(event.table().unwrap(), "p1_orders");
        assert_eq!(event.cenote.timestamp, None);
        assert_eq!(event.data["price"], 3);

        assert!(EventEnvelope::from_json(r#"{"data": {}}"#).is_err());
    }

    #[test]
    fn test_time_labels_prefer_timestamp() {
        let mut event = EventEnvelope::from_json(
            r#"{"cenote": {"url": "/projects/p/events/e", "created_at": 1704103200000}}"#,
        )
        .unwrap();

        // 2024-01-01T10:00:00Z
        let labels = event.time_labels().unwrap();
        assert_eq!(labels.day, "2024-01-01");
        assert_eq!(labels.hour, "10");

        event.cenote.timestamp = Some("2023-07-04T23:59:59+02:00".into());
        let labels = event.time_labels().unwrap();
        assert_eq!(labels.day, "2023-07-04");
        assert_eq!(labels.hour, "21");

        event.cenote.timestamp = Some("2023-02-03T04:05:06.789".into());
        let labels = event.time_labels().unwrap();
        assert_eq!(labels.month, "2023-02");
        assert_eq!(labels.hour, "04");

        event.cenote.timestamp = Some("yesterday".into());
        assert!(event.time_labels().is_err());

        event.cenote.timestamp = None;
        event.cenote.created_at = None;
        let drift = Utc::now() - event.event_time().unwrap();
        assert!(drift.num_seconds().abs() < 5);
    }
}
