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

//! Key-value backend abstraction
//!
//! A backend exposes exactly two primitives: a point read that returns the
//! stored bytes together with an opaque version token, and a conditional write
//! that only succeeds when the caller's version is still current. Everything
//! the update loop needs for lock-free read-modify-write is built on these.

use async_trait::async_trait;
use thiserror::Error;

/// Opaque per-key version token.
///
/// Callers never interpret it; they hand back whatever `get` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version(u64);

impl Version {
    /// The version of a key that has never been written.
    pub const fn absent() -> Self {
        Version(0)
    }

    pub const fn is_absent(self) -> bool {
        self.0 == 0
    }

    /// Backends that track versions numerically construct tokens through this.
    pub const fn from_raw(raw: u64) -> Self {
        Version(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub(crate) fn next(self) -> Self {
        Version(self.0 + 1)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Result of a point read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// `None` when the key has never been written.
    pub data: Option<Vec<u8>>,
    pub version: Version,
}

impl Snapshot {
    pub fn absent() -> Self {
        Self {
            data: None,
            version: Version::absent(),
        }
    }
}

/// Outcome of a conditional write. `Conflict` is expected contention, not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Committed { version: Version },
    Conflict { current: Version },
}

impl CasOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, CasOutcome::Committed { .. })
    }
}

/// Backend-side failures. Never retried by the update loop.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Storage primitive behind an `AggregateStore`.
///
/// Implementations must make `compare_and_set` atomic per key and bound their
/// own I/O with a timeout, reporting expiry as [`StoreError::Unavailable`].
#[async_trait]
pub trait KvBackend: Send + Sync + 'static {
    async fn get(&self, key: &str) -> StoreResult<Snapshot>;

    /// Write `value` only if the key is still at `expected`.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Version,
        value: Vec<u8>,
    ) -> StoreResult<CasOutcome>;

    /// Backend name for logs.
    fn name(&self) -> &str {
        "kv"
    }
}
