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

//! Two-tier running statistics
//!
//! Both tiers run Welford's online update over the same sample stream:
//!
//! - **Tier 1** folds in every sample and maintains outlier bounds
//!   `mean ± k·stddev`.
//! - **Tier 2** folds in a sample only when it lies inside tier 1's bounds as
//!   they stood *before* the sample was applied; otherwise it is carried
//!   forward unchanged.
//!
//! `k` is an outlier-sensitivity knob, not a significance level. The default
//! `1/sqrt(0.05)` comes from Chebyshev's inequality and bounds at most 5% of
//! any distribution outside the interval; the interval is not a confidence
//! interval for the mean.

use serde::{Deserialize, Serialize};

/// Default outlier sensitivity, `1/sqrt(0.05) = sqrt(20)`.
pub const DEFAULT_OUTLIER_SENSITIVITY: f64 = 4.472_135_954_999_58;

/// Running Welford state for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierStats {
    pub count: u64,
    pub mean: f64,
    /// Sum of squared deltas from the mean (M2 in Welford's algorithm).
    pub sum_squared_delta: f64,
    /// Population variance, `sum_squared_delta / count`.
    pub variance: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
}

impl TierStats {
    /// State after the first sample: zero spread, bounds collapsed onto it.
    pub fn first(sample: f64) -> Self {
        Self {
            count: 1,
            mean: sample,
            sum_squared_delta: 0.0,
            variance: 0.0,
            lower_bound: sample,
            upper_bound: sample,
        }
    }

    /// Welford update, with bounds recomputed from the new mean and variance.
    pub fn push(&self, sample: f64, k: f64) -> Self {
        let count = self.count + 1;
        let delta = sample - self.mean;
        let mean = self.mean + delta / count as f64;
        let sum_squared_delta = self.sum_squared_delta + delta * (sample - mean);
        let variance = sum_squared_delta / count as f64;
        let spread = k * variance.sqrt();

        Self {
            count,
            mean,
            sum_squared_delta,
            variance,
            lower_bound: mean - spread,
            upper_bound: mean + spread,
        }
    }

    #[inline]
    pub fn stddev(&self) -> f64 {
        self.variance.sqrt()
    }

    /// Inclusive bounds test.
    #[inline]
    pub fn admits(&self, sample: f64) -> bool {
        self.lower_bound <= sample && sample <= self.upper_bound
    }

    pub fn is_finite(&self) -> bool {
        self.mean.is_finite()
            && self.sum_squared_delta.is_finite()
            && self.variance.is_finite()
            && self.lower_bound.is_finite()
            && self.upper_bound.is_finite()
    }
}

/// Unfiltered (tier 1) and outlier-filtered (tier 2) statistics for one key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TwoTierAggregate {
    pub tier1: TierStats,
    pub tier2: TierStats,
}

impl TwoTierAggregate {
    pub fn first(sample: f64) -> Self {
        Self {
            tier1: TierStats::first(sample),
            tier2: TierStats::first(sample),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.tier1.is_finite() && self.tier2.is_finite()
    }
}

/// Pure two-tier accumulator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WelfordTierAccumulator {
    k: f64,
    outlier_filter: bool,
}

impl Default for WelfordTierAccumulator {
    fn default() -> Self {
        Self::new(DEFAULT_OUTLIER_SENSITIVITY)
    }
}

impl WelfordTierAccumulator {
    pub fn new(k: f64) -> Self {
        Self {
            k,
            outlier_filter: true,
        }
    }

    /// With the filter off the tier-2 gate always passes and tier 2 mirrors tier 1.
    pub fn with_outlier_filter(mut self, enabled: bool) -> Self {
        self.outlier_filter = enabled;
        self
    }

    pub fn sensitivity(&self) -> f64 {
        self.k
    }

    /// Fold `sample` into `old`, or start a new aggregate when there is none.
    ///
    /// The caller is responsible for rejecting non-finite samples.
    pub fn apply(&self, old: Option<&TwoTierAggregate>, sample: f64) -> TwoTierAggregate {
        let Some(old) = old else {
            return TwoTierAggregate::first(sample);
        };

        // Gate against the bounds in effect before this sample.
        let admitted = !self.outlier_filter || old.tier1.admits(sample);

        TwoTierAggregate {
            tier1: old.tier1.push(sample, self.k),
            tier2: if admitted {
                old.tier2.push(sample, self.k)
            } else {
                old.tier2
            },
        }
    }
}
