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

//! Ingestion adapter
//!
//! Turns written events into per-attribute aggregate updates. For every
//! numeric column of an event the table-scoped aggregate is updated, and when
//! an entity column is configured and present, the entity-scoped one as well.
//! Updates of one event are independent and run concurrently; each keeps its
//! own result so a report can show partial success.

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use cenote_core::{AggregateKey, CenoteConfig, IngestConfig, TimeLabels};
use cenote_storage::{AggregateError, AggregateUpdater, UpdateReceipt};

use crate::error::{IngestError, Result};
use crate::event::EventEnvelope;
use crate::flatten::{flatten, is_numeric, normalize_key};
use crate::stats::IngestStats;

/// One sample bound for one aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedUpdate {
    pub key: AggregateKey,
    pub sample: f64,
}

/// Everything an event contributes, before any I/O.
#[derive(Debug, Clone, PartialEq)]
pub struct EventPlan {
    pub table: String,
    pub labels: TimeLabels,
    pub updates: Vec<PlannedUpdate>,
}

#[derive(Debug)]
pub struct AttributeOutcome {
    pub key: AggregateKey,
    pub sample: f64,
    pub result: std::result::Result<UpdateReceipt, AggregateError>,
}

/// Per-attribute results for one event.
#[derive(Debug)]
pub struct IngestReport {
    pub table: String,
    pub event_id: Option<String>,
    pub outcomes: Vec<AttributeOutcome>,
}

impl IngestReport {
    /// True when every attribute update committed.
    pub fn is_complete(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &AttributeOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }

    pub fn committed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }
}

/// Per-event results for a single-table batch, in input order.
#[derive(Debug)]
pub struct BatchReport {
    pub table: String,
    pub events: Vec<Result<IngestReport>>,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.events
            .iter()
            .all(|e| e.as_ref().map_or(false, IngestReport::is_complete))
    }

    pub fn committed(&self) -> usize {
        self.events
            .iter()
            .filter_map(|e| e.as_ref().ok())
            .map(IngestReport::committed)
            .sum()
    }
}

#[derive(Debug, Clone)]
pub struct IngestionAdapter {
    updater: AggregateUpdater,
    config: IngestConfig,
    stats: Arc<IngestStats>,
}

impl IngestionAdapter {
    pub fn new(updater: AggregateUpdater, config: &CenoteConfig) -> Self {
        Self {
            updater,
            config: config.ingest.clone(),
            stats: Arc::new(IngestStats::new()),
        }
    }

    pub fn updater(&self) -> &AggregateUpdater {
        &self.updater
    }

    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    /// Decide which aggregates an event feeds. Pure.
    pub fn plan(&self, event: &EventEnvelope) -> Result<EventPlan> {
        let table = event.table()?;
        let labels = event.time_labels()?;
        let columns = flatten(&event.data, &self.config.nested_separator);
        let entity_column = self
            .config
            .entity_attribute
            .as_deref()
            .map(|attr| self.column_name(attr));

        let entity = entity_column
            .as_deref()
            .and_then(|attr| columns.iter().find(|(name, _)| name == attr))
            .and_then(|(_, value)| entity_id(value));

        let mut updates = Vec::new();
        for (column, value) in &columns {
            if column.is_empty() {
                debug!(table = %table, "skipping column with an empty name");
                continue;
            }
            if entity_column.as_deref() == Some(column.as_str())
                || self.config.excluded_columns.iter().any(|c| c == column)
            {
                continue;
            }
            let Some(sample) = is_numeric(value) else {
                continue;
            };

            updates.push(PlannedUpdate {
                key: AggregateKey::new(table.as_str(), column.as_str())?,
                sample,
            });
            if let Some(entity) = &entity {
                updates.push(PlannedUpdate {
                    key: AggregateKey::for_entity(
                        table.as_str(),
                        entity.as_str(),
                        column.as_str(),
                    )?,
                    sample,
                });
            }
        }

        Ok(EventPlan {
            table,
            labels,
            updates,
        })
    }

    /// Apply every update an event implies.
    ///
    /// `Err` only when the event itself is unusable; update failures are
    /// reported per attribute inside the `IngestReport`.
    pub async fn ingest_event(&self, event: &EventEnvelope) -> Result<IngestReport> {
        let plan = match self.plan(event) {
            Ok(plan) => plan,
            Err(err) => {
                self.stats.record_rejected();
                return Err(err);
            }
        };

        let EventPlan {
            table,
            labels,
            updates,
        } = plan;
        let labels = &labels;

        let outcomes = join_all(updates.into_iter().map(|update| async move {
            let result = self
                .updater
                .update_aggregate(&update.key, update.sample, Some(labels))
                .await;
            AttributeOutcome {
                key: update.key,
                sample: update.sample,
                result,
            }
        }))
        .await;

        let report = IngestReport {
            table,
            event_id: event.cenote.id.clone(),
            outcomes,
        };

        let committed = report.committed() as u64;
        let failed = report.outcomes.len() as u64 - committed;
        self.stats.record_event(committed, failed);

        if report.is_complete() {
            debug!(table = %report.table, committed, "event aggregated");
        } else {
            for failure in report.failures() {
                if let Err(err) = &failure.result {
                    warn!(key = %failure.key, error = %err, "aggregate update failed");
                }
            }
        }

        Ok(report)
    }

    /// Ingest events that all target one table, at most `ingest.concurrency`
    /// events at a time.
    pub async fn ingest_batch(&self, events: &[EventEnvelope]) -> Result<BatchReport> {
        let Some(first) = events.first() else {
            return Err(IngestError::MalformedEvent("empty batch".into()));
        };
        let table = first.table()?;
        for event in &events[1..] {
            let found = event.table()?;
            if found != table {
                return Err(IngestError::MixedTables {
                    expected: table,
                    found,
                });
            }
        }

        let mut indexed: Vec<(usize, Result<IngestReport>)> =
            stream::iter(events.iter().enumerate())
                .map(|(i, event)| async move { (i, self.ingest_event(event).await) })
                .buffer_unordered(self.config.concurrency.max(1))
                .collect()
                .await;
        indexed.sort_by_key(|(i, _)| *i);

        Ok(BatchReport {
            table,
            events: indexed.into_iter().map(|(_, report)| report).collect(),
        })
    }

    /// A configured column path in the same normal form `flatten` produces.
    fn column_name(&self, path: &str) -> String {
        let separator = self.config.nested_separator.as_str();
        if separator.is_empty() {
            return normalize_key(path);
        }
        path.split(separator)
            .map(normalize_key)
            .collect::<Vec<_>>()
            .join(separator)
    }
}

fn entity_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
