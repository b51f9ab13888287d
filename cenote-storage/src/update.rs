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

//! Optimistic update protocol
//!
//! One `update_aggregate` call runs the loop
//!
//! ```text
//! Start → Reading → Computing → Committing → Done
//!            ↑                       │
//!            └────── Conflict ←──────┘
//! ```
//!
//! with `Failed` reachable from every non-terminal phase. No lock is held
//! across an iteration: each iteration either commits a complete new snapshot
//! or leaves the key untouched, so dropping the future between iterations is
//! safe. Conflicts are retried under a [`RetryPolicy`]; everything else aborts.

use thiserror::Error;
use tracing::{debug, trace, warn};

use cenote_core::{
    check_sample, AggregateKey, AggregateRecord, CenoteConfig, CoreError, HistogramAccumulator,
    PolicyConfig, RetryPolicy, StatsConfig, TimeLabels, WelfordTierAccumulator,
};

use crate::backend::{CasOutcome, StoreError, Version};
use crate::codec::{AggregateCodec, CodecError};
use crate::store::AggregateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    Start,
    Reading,
    Computing,
    Committing,
    Conflict,
    Done,
    Failed,
}

impl UpdatePhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, UpdatePhase::Done | UpdatePhase::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateEvent {
    Begin,
    Fetched,
    Computed,
    Committed,
    Conflicted,
    Retry,
    Error,
}

#[derive(Debug, Error)]
#[error("Invalid transition: {current:?} -> {event:?}")]
pub struct InvalidTransition {
    pub current: UpdatePhase,
    pub event: UpdateEvent,
}

impl UpdatePhase {
    pub fn transition(self, event: UpdateEvent) -> Result<UpdatePhase, InvalidTransition> {
        use UpdateEvent::*;
        use UpdatePhase::*;

        let next = match (self, event) {
            (Start, Begin) => Reading,
            (Reading, Fetched) => Computing,
            (Computing, Computed) => Committing,
            (Committing, UpdateEvent::Committed) => Done,
            (Committing, Conflicted) => Conflict,
            (Conflict, Retry) => Reading,
            (s, Error) if !s.is_terminal() => Failed,
            _ => {
                return Err(InvalidTransition {
                    current: self,
                    event,
                })
            }
        };

        Ok(next)
    }
}

/// Why an update did not commit.
#[derive(Debug, Error)]
pub enum AggregateError {
    /// NaN, infinite, or would drive the aggregate out of the finite range.
    /// The key is left untouched.
    #[error("Invalid sample: {0}")]
    InvalidSample(#[source] CoreError),

    #[error(transparent)]
    BackendUnavailable(#[from] StoreError),

    /// The stored snapshot does not parse. The key is never reset.
    #[error("Stored aggregate for {key} does not decode: {source}")]
    DecodeFailure {
        key: String,
        #[source]
        source: CodecError,
    },

    #[error("Failed to encode aggregate for {key}: {source}")]
    EncodeFailure {
        key: String,
        #[source]
        source: CodecError,
    },

    #[error("Gave up on {key} after {attempts} conflicting attempts")]
    ContentionExhausted { key: String, attempts: u32 },

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}

/// Result of a committed update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateReceipt {
    pub version: Version,
    /// Compare-and-set attempts used, 1 when uncontended.
    pub attempts: u32,
}

/// Phase tracking for one call.
struct UpdateRun<'a> {
    key: &'a AggregateKey,
    phase: UpdatePhase,
}

impl<'a> UpdateRun<'a> {
    fn new(key: &'a AggregateKey) -> Self {
        Self {
            key,
            phase: UpdatePhase::Start,
        }
    }

    fn advance(&mut self, event: UpdateEvent) -> Result<(), AggregateError> {
        let next = self.phase.transition(event)?;
        trace!(key = %self.key, from = ?self.phase, to = ?next, "update transition");
        self.phase = next;
        Ok(())
    }

    fn fail(&mut self, err: AggregateError) -> AggregateError {
        match self.advance(UpdateEvent::Error) {
            Ok(()) => err,
            Err(invalid) => invalid,
        }
    }
}

/// Applies samples to aggregates through an [`AggregateStore`].
#[derive(Debug, Clone)]
pub struct AggregateUpdater {
    store: AggregateStore,
    codec: AggregateCodec,
    stats: StatsConfig,
    policy: PolicyConfig,
    retry: RetryPolicy,
}

impl AggregateUpdater {
    pub fn new(store: AggregateStore, config: &CenoteConfig) -> Self {
        Self {
            store,
            codec: AggregateCodec::new(config.codec.format),
            stats: config.stats.clone(),
            policy: config.policy.clone(),
            retry: config.retry.policy(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &AggregateStore {
        &self.store
    }

    pub fn codec(&self) -> AggregateCodec {
        self.codec
    }

    /// Fold one sample into `key`'s aggregate.
    ///
    /// Histogram buckets are updated only when `labels` is given and the key's
    /// policy enables a histogram; otherwise any stored histogram is carried
    /// forward as is. Re-delivering a sample counts it again.
    pub async fn update_aggregate(
        &self,
        key: &AggregateKey,
        sample: f64,
        labels: Option<&TimeLabels>,
    ) -> Result<UpdateReceipt, AggregateError> {
        let sample = check_sample(sample).map_err(AggregateError::InvalidSample)?;

        let policy = self.policy.policy_for(key);
        let welford = policy.welford(&self.stats);
        let histogram = match labels {
            Some(labels) => policy.histogram_accumulator().map(|acc| (acc, labels)),
            None => None,
        };

        let mut run = UpdateRun::new(key);
        run.advance(UpdateEvent::Begin)?;

        let mut attempt = 0u32;
        loop {
            attempt += 1;

            let snapshot = match self.store.get(key).await {
                Ok(snapshot) => snapshot,
                Err(err) => return Err(run.fail(err.into())),
            };
            run.advance(UpdateEvent::Fetched)?;

            let old = match snapshot.data.as_deref().map(|bytes| self.codec.decode(bytes)) {
                None => None,
                Some(Ok(record)) => Some(record),
                Some(Err(source)) => {
                    warn!(
                        key = %key,
                        version = %snapshot.version,
                        error = %source,
                        "stored aggregate does not decode"
                    );
                    return Err(run.fail(AggregateError::DecodeFailure {
                        key: key.to_string(),
                        source,
                    }));
                }
            };

            let record = fold_sample(old.as_ref(), sample, &welford, histogram.as_ref());
            if !record.is_finite() {
                return Err(run.fail(AggregateError::InvalidSample(CoreError::invalid_sample(
                    sample,
                    "aggregate would leave the finite range",
                ))));
            }
            let bytes = match self.codec.encode(&record) {
                Ok(bytes) => bytes,
                Err(source) => {
                    return Err(run.fail(AggregateError::EncodeFailure {
                        key: key.to_string(),
                        source,
                    }))
                }
            };
            run.advance(UpdateEvent::Computed)?;

            let outcome = match self.store.compare_and_set(key, snapshot.version, bytes).await {
                Ok(outcome) => outcome,
                Err(err) => return Err(run.fail(err.into())),
            };

            match outcome {
                CasOutcome::Committed { version } => {
                    run.advance(UpdateEvent::Committed)?;
                    trace!(
                        key = %key,
                        version = %version,
                        attempts = attempt,
                        "aggregate committed"
                    );
                    return Ok(UpdateReceipt {
                        version,
                        attempts: attempt,
                    });
                }
                CasOutcome::Conflict { current } => {
                    run.advance(UpdateEvent::Conflicted)?;
                    debug!(
                        key = %key,
                        attempt,
                        expected = %snapshot.version,
                        current = %current,
                        "compare-and-set conflict"
                    );

                    if attempt >= self.retry.max_attempts {
                        warn!(key = %key, attempts = attempt, "contention exhausted");
                        return Err(run.fail(AggregateError::ContentionExhausted {
                            key: key.to_string(),
                            attempts: attempt,
                        }));
                    }

                    let delay = self.retry.delay_for_attempt(attempt - 1);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    run.advance(UpdateEvent::Retry)?;
                }
            }
        }
    }

    /// Non-transactional point read. `None` for a key that was never written.
    pub async fn read_aggregate(
        &self,
        key: &AggregateKey,
    ) -> Result<Option<AggregateRecord>, AggregateError> {
        let snapshot = self.store.get(key).await?;
        snapshot
            .data
            .map(|bytes| {
                self.codec
                    .decode(&bytes)
                    .map_err(|source| AggregateError::DecodeFailure {
                        key: key.to_string(),
                        source,
                    })
            })
            .transpose()
    }
}

/// Pure compute step: new record from the old one and a sample.
fn fold_sample(
    old: Option<&AggregateRecord>,
    sample: f64,
    welford: &WelfordTierAccumulator,
    histogram: Option<&(HistogramAccumulator, &TimeLabels)>,
) -> AggregateRecord {
    let old_histogram = old.and_then(|r| r.histogram.as_ref());
    let stats = welford.apply(old.map(|r| &r.stats), sample);
    let histogram = match histogram {
        Some((acc, labels)) => Some(acc.apply(old_histogram, sample, labels)),
        None => old_histogram.cloned(),
    };
    AggregateRecord::new(stats, histogram)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        use UpdateEvent::*;
        let mut phase = UpdatePhase::Start;
        for event in [Begin, Fetched, Computed, Conflicted, Retry, Fetched, Computed, Committed] {
            phase = phase.transition(event).unwrap();
        }
        assert_eq!(phase, UpdatePhase::Done);
        assert!(phase.is_terminal());
    }

    #[test]
    fn test_error_from_any_live_phase() {
        for phase in [
            UpdatePhase::Start,
            UpdatePhase::Reading,
            UpdatePhase::Computing,
            UpdatePhase::Committing,
            UpdatePhase::Conflict,
        ] {
            assert_eq!(phase.transition(UpdateEvent::Error).unwrap(), UpdatePhase::Failed);
        }
    }

    #[test]
    fn test_terminal_phases_reject_events() {
        assert!(UpdatePhase::Done.transition(UpdateEvent::Error).is_err());
        assert!(UpdatePhase::Failed.transition(UpdateEvent::Retry).is_err());
        let err = UpdatePhase::Reading
            .transition(UpdateEvent::Committed)
            .unwrap_err();
        assert_eq!(err.current, UpdatePhase::Reading);
        assert_eq!(err.event, UpdateEvent::Committed);
    }

    #[test]
    fn test_fold_without_labels_carries_histogram() {
        let welford = WelfordTierAccumulator::default();
        let acc = HistogramAccumulator::default();
        let labels = TimeLabels::new("2024-01-01", "2024-01", "00").unwrap();

        let first = fold_sample(None, 10.0, &welford, Some(&(acc, &labels)));
        let second = fold_sample(Some(&first), 20.0, &welford, None);

        assert_eq!(second.count(), 2);
        assert_eq!(second.histogram, first.histogram);
    }
}
