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

//! Stored representation of an `AggregateRecord`.
//!
//! JSON is the default and stays readable with ordinary backend tooling.
//! Bincode is compact and carries a 4-byte magic prefix so that decoding can
//! tell the formats apart; a store may hold both while migrating.

use cenote_core::{AggregateRecord, CodecFormat};
use thiserror::Error;

/// Prefix on every bincode-encoded snapshot.
pub const BINCODE_MAGIC: &[u8; 4] = b"CNB1";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("JSON snapshot: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Bincode snapshot: {0}")]
    Bincode(#[from] bincode::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregateCodec {
    format: CodecFormat,
}

impl AggregateCodec {
    pub fn new(format: CodecFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> CodecFormat {
        self.format
    }

    /// Encode in this codec's format.
    pub fn encode(&self, record: &AggregateRecord) -> Result<Vec<u8>, CodecError> {
        match self.format {
            CodecFormat::Json => Ok(serde_json::to_vec(record)?),
            CodecFormat::Bincode => {
                let body = bincode::serialize(record)?;
                let mut bytes = Vec::with_capacity(BINCODE_MAGIC.len() + body.len());
                bytes.extend_from_slice(BINCODE_MAGIC);
                bytes.extend_from_slice(&body);
                Ok(bytes)
            }
        }
    }

    /// Decode either format, regardless of the one this codec writes.
    pub fn decode(&self, bytes: &[u8]) -> Result<AggregateRecord, CodecError> {
        match bytes.strip_prefix(BINCODE_MAGIC.as_slice()) {
            Some(body) => Ok(bincode::deserialize(body)?),
            None => Ok(serde_json::from_slice(bytes)?),
        }
    }
}
