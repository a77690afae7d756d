// src/config.rs
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, info};

use crate::errors::{AutoConfigError, Result};

/// Prefix under which the RabbitMQ properties live unless told otherwise.
pub const DEFAULT_PREFIX: &str = "rabbitmq";

/// Separator between key segments in environment variable names.
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Property {
    key: String,
    value: String,
}

/// Flat set of dotted string properties.
///
/// Keys are matched in relaxed form: every dot-separated segment is lower-cased and
/// stripped of `-` and `_`, so `virtual_host`, `virtualHost` and `virtual-host` all
/// address the same entry. A later insert for the same relaxed key replaces the value
/// and the key spelling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertySet {
    entries: BTreeMap<String, Property>,
}

/// Relaxed form of a dotted key.
pub fn canonical_key(key: &str) -> String {
    key.split('.')
        .map(|segment| {
            segment
                .chars()
                .filter(|c| *c != '-' && *c != '_')
                .flat_map(char::to_lowercase)
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Splits `key:value` or `key=value` at whichever separator comes first.
pub fn parse_entry(entry: &str) -> Option<(&str, &str)> {
    let split_at = entry.find([':', '='])?;
    let (key, rest) = entry.split_at(split_at);
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key, &rest[1..]))
}

impl PropertySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set from `key:value` / `key=value` strings, in order.
    pub fn from_entries<I, S>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut properties = Self::new();
        for entry in entries {
            let entry = entry.as_ref();
            let (key, value) = parse_entry(entry).ok_or_else(|| {
                AutoConfigError::invalid(entry, "", "expected 'key=value' or 'key:value'")
            })?;
            properties.insert(key, value);
        }
        Ok(properties)
    }

    /// Builder-style insert.
    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.insert(key, value);
        self
    }

    /// Inserts a property, returning the value it replaced.
    pub fn insert(&mut self, key: &str, value: &str) -> Option<String> {
        self.entries
            .insert(
                canonical_key(key),
                Property {
                    key: key.to_string(),
                    value: value.to_string(),
                },
            )
            .map(|previous| previous.value)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&canonical_key(key))
            .map(|property| property.value.as_str())
    }

    /// The key as it was spelled by whoever set it last.
    pub fn source_key(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&canonical_key(key))
            .map(|property| property.key.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(&canonical_key(key))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates `(key, value)` pairs in relaxed-key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .values()
            .map(|property| (property.key.as_str(), property.value.as_str()))
    }

    /// Layers `other` on top of `self`; entries of `other` win.
    pub fn merge(&mut self, other: PropertySet) {
        self.entries.extend(other.entries);
    }

    /// The properties below `prefix`, with the prefix removed from their keys.
    pub fn subset(&self, prefix: &str) -> PropertySet {
        let prefix = canonical_key(prefix);
        if prefix.is_empty() {
            return self.clone();
        }
        let lead = format!("{}.", prefix);
        let entries = self
            .entries
            .iter()
            .filter_map(|(canonical, property)| {
                let rest = canonical.strip_prefix(&lead)?;
                let segments = prefix.split('.').count();
                let key = property.key.splitn(segments + 1, '.').last()?.to_string();
                Some((
                    rest.to_string(),
                    Property {
                        key,
                        value: property.value.clone(),
                    },
                ))
            })
            .collect();
        PropertySet { entries }
    }

    /// Maps `PREFIX__SEGMENT__KEY=value` variables onto `prefix.segment.key`.
    ///
    /// Variables outside `prefix` are ignored.
    pub fn from_env_vars<I>(prefix: &str, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let lead = format!("{}.", canonical_key(prefix));
        let mut properties = Self::new();
        for (name, value) in vars {
            if !name.contains(ENV_SEPARATOR) {
                continue;
            }
            let key = name.split(ENV_SEPARATOR).collect::<Vec<_>>().join(".").to_lowercase();
            if canonical_key(&key).starts_with(&lead) {
                debug!(variable = %name, key = %key, "Mapped environment variable");
                properties.insert(&key, &value);
            }
        }
        properties
    }

    /// Reads `.env` if present, then the process environment.
    pub fn from_env(prefix: &str) -> Self {
        dotenv::dotenv().ok();
        Self::from_env_vars(prefix, std::env::vars())
    }

    /// Flattens a JSON document into dotted keys.
    pub fn from_json(document: &Value) -> Self {
        let mut properties = Self::new();
        flatten_json("", document, &mut properties);
        properties
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            AutoConfigError::ConfigSource(format!(
                "Failed to read config file at {}: {}",
                path.display(),
                e
            ))
        })?;
        let document: Value = serde_json::from_str(&content).map_err(|e| {
            AutoConfigError::ConfigSource(format!(
                "Config file at {} contains invalid JSON: {}",
                path.display(),
                e
            ))
        })?;
        Ok(Self::from_json(&document))
    }
}

fn flatten_json(path: &str, value: &Value, out: &mut PropertySet) {
    let join = |key: &str| {
        if path.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", path, key)
        }
    };

    match value {
        Value::Object(map) => {
            for (key, child) in map {
                flatten_json(&join(key), child, out);
            }
        }
        Value::Array(items) => {
            let joined = items
                .iter()
                .filter_map(scalar_text)
                .collect::<Vec<_>>()
                .join(",");
            out.insert(path, &joined);
        }
        Value::Null => {}
        scalar => {
            if let Some(text) = scalar_text(scalar) {
                out.insert(path, &text);
            }
        }
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Looks for a JSON configuration file in the usual places.
pub fn find_config_file() -> Option<PathBuf> {
    let locations = [
        ("Current directory", Path::new("rabbitmq.json")),
        ("Config directory", Path::new("config/rabbitmq.json")),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Some(path.to_path_buf());
        }
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(".rabbitmq.json");
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Some(home_config);
        }
    }

    None
}

/// The JSON file (if one is found) overlaid with the environment.
pub fn load_properties(prefix: &str) -> Result<PropertySet> {
    let mut properties = PropertySet::new();

    if let Some(path) = find_config_file() {
        properties.merge(PropertySet::from_json_file(&path)?);
        info!(path = %path.display(), "Loaded configuration file");
    }

    properties.merge(PropertySet::from_env(prefix));
    Ok(properties)
}
