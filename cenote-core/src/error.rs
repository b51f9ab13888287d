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

//! Error types for the Cenote core domain.

use thiserror::Error;

/// Errors raised by the pure domain layer (keys, labels, samples, config).
#[derive(Debug, Error)]
pub enum CoreError {
    /// Sample is NaN, infinite, or pushes an aggregate out of the finite range.
    #[error("Invalid sample {value}: {reason}")]
    InvalidSample { value: f64, reason: &'static str },

    #[error("Invalid time label {label:?}: expected {expected}")]
    InvalidLabel { label: String, expected: &'static str },

    #[error("Invalid aggregate key: {0}")]
    InvalidKey(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to load configuration: {0}")]
    Config(String),
}

impl CoreError {
    pub fn invalid_sample(value: f64, reason: &'static str) -> Self {
        CoreError::InvalidSample { value, reason }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Rejects NaN and infinite samples before any accumulator sees them.
pub fn check_sample(value: f64) -> Result<f64> {
    if value.is_nan() {
        return Err(CoreError::invalid_sample(value, "sample is NaN"));
    }
    if value.is_infinite() {
        return Err(CoreError::invalid_sample(value, "sample is infinite"));
    }
    Ok(value)
}
