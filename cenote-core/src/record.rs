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

//! The stored value for one aggregate key.

use serde::{Deserialize, Serialize};

use crate::histogram::Histogram;
use crate::stats::TwoTierAggregate;

/// Two-tier stats plus the optional time-bucketed histogram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub stats: TwoTierAggregate,
    pub histogram: Option<Histogram>,
}

impl AggregateRecord {
    pub fn new(stats: TwoTierAggregate, histogram: Option<Histogram>) -> Self {
        Self { stats, histogram }
    }

    /// Samples seen, outliers included.
    pub fn count(&self) -> u64 {
        self.stats.tier1.count
    }

    pub fn mean(&self) -> f64 {
        self.stats.tier1.mean
    }

    pub fn stddev(&self) -> f64 {
        self.stats.tier1.stddev()
    }

    /// Mean with outliers excluded.
    pub fn filtered_mean(&self) -> f64 {
        self.stats.tier2.mean
    }

    pub fn filtered_stddev(&self) -> f64 {
        self.stats.tier2.stddev()
    }

    pub fn is_finite(&self) -> bool {
        self.stats.is_finite() && self.histogram.as_ref().map_or(true, Histogram::is_finite)
    }
}
