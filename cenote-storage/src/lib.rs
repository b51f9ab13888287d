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

//! Cenote Storage
//!
//! The lock-free update path: a compare-and-set key-value abstraction, the
//! snapshot codec, and the read-compute-commit loop that applies the core
//! accumulators to stored aggregates.

pub mod backend;
pub mod codec;
pub mod memory;
pub mod store;
pub mod update;

pub use backend::{CasOutcome, KvBackend, Snapshot, StoreError, StoreResult, Version};
pub use codec::{AggregateCodec, CodecError, BINCODE_MAGIC};
pub use memory::MemoryBackend;
pub use store::AggregateStore;
pub use update::{
    AggregateError, AggregateUpdater, InvalidTransition, UpdateEvent, UpdatePhase, UpdateReceipt,
};
