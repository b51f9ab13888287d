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

//! Ingestion counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct IngestStats {
    events: AtomicU64,
    rejected_events: AtomicU64,
    samples_committed: AtomicU64,
    samples_failed: AtomicU64,
}

/// Point-in-time copy of [`IngestStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStatsSnapshot {
    pub events: u64,
    pub rejected_events: u64,
    pub samples_committed: u64,
    pub samples_failed: u64,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_event(&self, committed: u64, failed: u64) {
        self.events.fetch_add(1, Ordering::Relaxed);
        self.samples_committed.fetch_add(committed, Ordering::Relaxed);
        self.samples_failed.fetch_add(failed, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            events: self.events.load(Ordering::Relaxed),
            rejected_events: self.rejected_events.load(Ordering::Relaxed),
            samples_committed: self.samples_committed.load(Ordering::Relaxed),
            samples_failed: self.samples_failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = IngestStats::new();
        stats.record_event(3, 1);
        stats.record_event(2, 0);
        stats.record_rejected();

        assert_eq!(
            stats.snapshot(),
            IngestStatsSnapshot {
                events: 2,
                rejected_events: 1,
                samples_committed: 5,
                samples_failed: 1,
            }
        );
    }
}
