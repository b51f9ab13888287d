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

//! Cenote Ingest
//!
//! Feeds written events into the aggregate engine: envelope parsing, payload
//! flattening, numeric column selection and concurrent per-attribute updates.

pub mod adapter;
pub mod error;
pub mod event;
pub mod flatten;
pub mod stats;

pub use adapter::{
    AttributeOutcome, BatchReport, EventPlan, IngestReport, IngestionAdapter, PlannedUpdate,
};
pub use error::{IngestError, Result};
pub use event::{table_name, EventEnvelope, EventMeta};
pub use flatten::{flatten, is_numeric, normalize_key};
pub use stats::{IngestStats, IngestStatsSnapshot};
