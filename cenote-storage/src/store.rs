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

//! Aggregate store
//!
//! Wraps a [`KvBackend`] with the structured [`AggregateKey`]. Keys become
//! backend strings here and nowhere else.

use std::sync::Arc;

use cenote_core::AggregateKey;

use crate::backend::{CasOutcome, KvBackend, Snapshot, StoreResult, Version};

/// Cheap to clone; clones share the backend handle.
#[derive(Clone)]
pub struct AggregateStore {
    backend: Arc<dyn KvBackend>,
}

impl std::fmt::Debug for AggregateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateStore")
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl AggregateStore {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    pub async fn get(&self, key: &AggregateKey) -> StoreResult<Snapshot> {
        self.backend.get(&key.to_storage_key()).await
    }

    pub async fn compare_and_set(
        &self,
        key: &AggregateKey,
        expected: Version,
        snapshot: Vec<u8>,
    ) -> StoreResult<CasOutcome> {
        self.backend
            .compare_and_set(&key.to_storage_key(), expected, snapshot)
            .await
    }
}
