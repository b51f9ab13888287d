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

//! Flattening of nested event payloads into aggregatable columns.

use serde_json::{Map, Value};

/// Column name normal form: lower-case, spaces removed.
pub fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| *c != ' ')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Flatten nested objects into `(column, value)` pairs, joining path segments
/// with `separator`. Arrays and scalars are leaves.
pub fn flatten(data: &Map<String, Value>, separator: &str) -> Vec<(String, Value)> {
    let mut columns = Vec::new();
    flatten_into(data, separator, None, &mut columns);
    columns
}

fn flatten_into(
    data: &Map<String, Value>,
    separator: &str,
    prefix: Option<&str>,
    out: &mut Vec<(String, Value)>,
) {
    for (key, value) in data {
        let name = match prefix {
            Some(prefix) => format!("{prefix}{separator}{}", normalize_key(key)),
            None => normalize_key(key),
        };
        match value {
            Value::Object(nested) => flatten_into(nested, separator, Some(&name), out),
            leaf => out.push((name, leaf.clone())),
        }
    }
}

/// The sample a value contributes, if it is numeric.
///
/// Only JSON numbers qualify; booleans and numeric-looking strings do not.
pub fn is_numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|x| x.is_finite()),
        _ => None,
    }
}
