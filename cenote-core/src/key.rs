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

//! Aggregate keys
//!
//! # Key Encoding
//!
//! ```text
//! t/{table}/{attribute}            table-scoped aggregate
//! e/{table}/{entity}/{attribute}   entity-scoped aggregate
//! ```
//!
//! `%` and `/` inside a component are percent-escaped, so two distinct keys
//! never share a storage key and every storage key parses back to one key.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CoreError, Result};

const TABLE_PREFIX: &str = "t";
const ENTITY_PREFIX: &str = "e";

/// Identifies one running aggregate: a scope (table, optionally narrowed to
/// one entity) plus the event attribute being summarized.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AggregateKey {
    pub table: String,
    pub entity: Option<String>,
    pub attribute: String,
}

impl AggregateKey {
    /// Table-scoped key.
    pub fn new(table: impl Into<String>, attribute: impl Into<String>) -> Result<Self> {
        let key = Self {
            table: table.into(),
            entity: None,
            attribute: attribute.into(),
        };
        key.validate()?;
        Ok(key)
    }

    /// Entity-scoped key, used for per-entity historical aggregates.
    pub fn for_entity(
        table: impl Into<String>,
        entity: impl Into<String>,
        attribute: impl Into<String>,
    ) -> Result<Self> {
        let key = Self {
            table: table.into(),
            entity: Some(entity.into()),
            attribute: attribute.into(),
        };
        key.validate()?;
        Ok(key)
    }

    fn validate(&self) -> Result<()> {
        if self.table.is_empty() {
            return Err(CoreError::InvalidKey("table must not be empty".into()));
        }
        if self.attribute.is_empty() {
            return Err(CoreError::InvalidKey("attribute must not be empty".into()));
        }
        if matches!(self.entity.as_deref(), Some("")) {
            return Err(CoreError::InvalidKey("entity must not be empty".into()));
        }
        Ok(())
    }

    pub fn is_entity_scoped(&self) -> bool {
        self.entity.is_some()
    }

    /// Encode to the backend key string.
    pub fn to_storage_key(&self) -> String {
        match &self.entity {
            None => format!(
                "{}/{}/{}",
                TABLE_PREFIX,
                escape(&self.table),
                escape(&self.attribute)
            ),
            Some(entity) => format!(
                "{}/{}/{}/{}",
                ENTITY_PREFIX,
                escape(&self.table),
                escape(entity),
                escape(&self.attribute)
            ),
        }
    }

    /// Decode a backend key string produced by [`AggregateKey::to_storage_key`].
    pub fn parse_storage_key(raw: &str) -> Result<Self> {
        let parts: Vec<&str> = raw.split('/').collect();
        let invalid = || CoreError::InvalidKey(format!("malformed storage key {raw:?}"));

        match parts.as_slice() {
            [TABLE_PREFIX, table, attribute] => Self::new(
                unescape(table).ok_or_else(invalid)?,
                unescape(attribute).ok_or_else(invalid)?,
            ),
            [ENTITY_PREFIX, table, entity, attribute] => Self::for_entity(
                unescape(table).ok_or_else(invalid)?,
                unescape(entity).ok_or_else(invalid)?,
                unescape(attribute).ok_or_else(invalid)?,
            ),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for AggregateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entity {
            Some(entity) => write!(f, "{}[{}].{}", self.table, entity, self.attribute),
            None => write!(f, "{}.{}", self.table, self.attribute),
        }
    }
}

fn escape(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    for c in component.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(component: &str) -> Option<String> {
    let mut out = String::with_capacity(component.len());
    let mut rest = component;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let code = rest.get(pos + 1..pos + 3)?;
        match code {
            "25" => out.push('%'),
            "2F" => out.push('/'),
            _ => return None,
        }
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_key_format() {
        let key = AggregateKey::new("proj_clicks", "price").unwrap();
        assert_eq!(key.to_storage_key(), "t/proj_clicks/price");

        let key = AggregateKey::for_entity("proj_clicks", "user-7", "price").unwrap();
        assert_eq!(key.to_storage_key(), "e/proj_clicks/user-7/price");
    }

    #[test]
    fn test_separators_do_not_collide() {
        // Plain concatenation ("a_b" + "_" + "c") would collide here.
        let a = AggregateKey::new("a_b", "c").unwrap();
        let b = AggregateKey::new("a", "b_c").unwrap();
        assert_ne!(a.to_storage_key(), b.to_storage_key());

        let slashy = AggregateKey::new("a/b", "c").unwrap();
        let entity = AggregateKey::for_entity("a", "b", "c").unwrap();
        assert_ne!(slashy.to_storage_key(), entity.to_storage_key());
    }

    #[test]
    fn test_parse_storage_key_inverts_encoding() {
        let keys = [
            AggregateKey::new("p_events", "cart$total").unwrap(),
            AggregateKey::for_entity("p/e", "100%", "x/y").unwrap(),
        ];
        for key in keys {
            let parsed = AggregateKey::parse_storage_key(&key.to_storage_key()).unwrap();
            assert_eq!(parsed, key);
        }
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(AggregateKey::new("", "x").is_err());
        assert!(AggregateKey::new("t", "").is_err());
        assert!(AggregateKey::for_entity("t", "", "x").is_err());
        assert!(AggregateKey::parse_storage_key("x/t/a").is_err());
        assert!(AggregateKey::parse_storage_key("t/only").is_err());
        assert!(AggregateKey::parse_storage_key("t/bad%zz/a").is_err());
    }
}
