use std::path::Path;

use serde_json::Value;

use crate::error::{Result, ShipgateError};

/// Versioned list of policy entries (licenses, vulnerability ids).
///
/// Accepted on disk as JSON, `{ "version": "..", "<key>": ["..", ..] }`, or
/// as plain text with one entry per line and `#` comments. A text file may
/// declare its version in a `# version: <v>` comment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyList {
    pub version: Option<String>,
    pub entries: Vec<String>,
}

impl PolicyList {
    pub fn load(path: &Path, key: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ShipgateError::Config(format!("cannot read policy list {}: {e}", path.display()))
        })?;
        Self::parse(&text, key)
            .map_err(|e| ShipgateError::Config(format!("{}: {e}", path.display())))
    }

    pub fn parse(text: &str, key: &str) -> std::result::Result<Self, String> {
        let trimmed = text.trim_start();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            return Self::parse_json(trimmed, key);
        }

        let mut list = PolicyList::default();
        for line in text.lines() {
            let line = line.trim();
            if let Some(comment) = line.strip_prefix('#') {
                if let Some(v) = comment.trim().strip_prefix("version:") {
                    list.version = Some(v.trim().to_string());
                }
                continue;
            }
            if !line.is_empty() {
                list.entries.push(line.to_string());
            }
        }
        Ok(list)
    }

    fn parse_json(text: &str, key: &str) -> std::result::Result<Self, String> {
        let value: Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
        let (version, items) = match &value {
            Value::Array(items) => (None, items),
            Value::Object(map) => {
                let items = map
                    .get(key)
                    .and_then(Value::as_array)
                    .ok_or_else(|| format!("missing '{key}' array"))?;
                let version = map.get("version").and_then(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                });
                (version, items)
            }
            _ => return Err("expected a JSON object or array".to_string()),
        };
        let entries = items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(|s| s.trim().to_string())
                    .ok_or_else(|| format!("non-string entry in '{key}': {item}"))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { version, entries })
    }
}
