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

//! In-memory backend
//!
//! Reference implementation of [`KvBackend`] over a `DashMap`. The entry API
//! holds the shard lock for the duration of one compare-and-set, which makes
//! each conditional write atomic per key. State is lost when the process exits.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::backend::{CasOutcome, KvBackend, Snapshot, StoreResult, Version};

#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: DashMap<String, (Vec<u8>, Version)>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored backend keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Overwrite a key unconditionally, bumping its version. Lets tests plant
    /// arbitrary bytes such as a corrupt snapshot.
    pub fn put_raw(&self, key: &str, value: Vec<u8>) -> Version {
        let mut slot = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| (Vec::new(), Version::absent()));
        let version = slot.1.next();
        *slot = (value, version);
        version
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> StoreResult<Snapshot> {
        Ok(match self.entries.get(key) {
            Some(entry) => Snapshot {
                data: Some(entry.0.clone()),
                version: entry.1,
            },
            None => Snapshot::absent(),
        })
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Version,
        value: Vec<u8>,
    ) -> StoreResult<CasOutcome> {
        let outcome = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get().1;
                if current == expected {
                    let version = current.next();
                    occupied.insert((value, version));
                    CasOutcome::Committed { version }
                } else {
                    CasOutcome::Conflict { current }
                }
            }
            Entry::Vacant(vacant) => {
                if expected.is_absent() {
                    let version = Version::absent().next();
                    vacant.insert((value, version));
                    CasOutcome::Committed { version }
                } else {
                    CasOutcome::Conflict {
                        current: Version::absent(),
                    }
                }
            }
        };
        Ok(outcome)
    }

    fn name(&self) -> &str {
        "memory"
    }
}
