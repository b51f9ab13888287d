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

//! Cenote Core
//!
//! Pure aggregation math and shared types: two-tier Welford statistics,
//! time-bucketed histograms, aggregate keys, configuration and the
//! conflict-retry policy. Nothing here performs I/O except config loading.

pub mod config;
pub mod error;
pub mod histogram;
pub mod key;
pub mod record;
pub mod retry;
pub mod stats;

pub use config::{
    AggregationPolicy, CenoteConfig, CodecConfig, CodecFormat, HistogramPolicy, IngestConfig,
    PolicyConfig, RetryConfig, StatsConfig,
};
pub use error::{check_sample, CoreError, Result};
pub use histogram::{
    BucketStats, BucketSummary, Granularity, Histogram, HistogramAccumulator, TimeLabels,
};
pub use key::AggregateKey;
pub use record::AggregateRecord;
pub use retry::RetryPolicy;
pub use stats::{TierStats, TwoTierAggregate, WelfordTierAccumulator, DEFAULT_OUTLIER_SENSITIVITY};
