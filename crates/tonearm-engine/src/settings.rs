//! Persisted key/value settings addressed by `(domain, key)`.
//!
//! Components get a [`ScopedSettings`] bound to their module name as the domain. The engine
//! itself uses the empty domain.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde_json::{Map, Value};

use crate::sync::lock;

/// Key/value store contract consumed by components.
pub trait SettingsStore: Send + Sync {
    fn get_value(&self, domain: &str, key: &str) -> Option<Value>;
    fn set_value(&self, domain: &str, key: &str, value: Value) -> Result<()>;

    fn get_string(&self, domain: &str, key: &str) -> Option<String> {
        match self.get_value(domain, key)? {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    fn set_string(&self, domain: &str, key: &str, value: &str) -> Result<()> {
        self.set_value(domain, key, Value::String(value.to_string()))
    }

    /// `None` unless every element is a string.
    fn get_string_array(&self, domain: &str, key: &str) -> Option<Vec<String>> {
        match self.get_value(domain, key)? {
            Value::Array(items) => items
                .into_iter()
                .map(|v| match v {
                    Value::String(s) => Some(s),
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    }

    fn set_string_array(&self, domain: &str, key: &str, values: &[String]) -> Result<()> {
        let items = values.iter().cloned().map(Value::String).collect();
        self.set_value(domain, key, Value::Array(items))
    }

    fn get_number(&self, domain: &str, key: &str) -> Option<f64> {
        self.get_value(domain, key)?.as_f64()
    }

    fn set_number(&self, domain: &str, key: &str, value: f64) -> Result<()> {
        let number = serde_json::Number::from_f64(value)
            .with_context(|| format!("setting {domain}.{key} is not a finite number"))?;
        self.set_value(domain, key, Value::Number(number))
    }
}

/// Settings held in memory only.
#[derive(Default)]
pub struct MemorySettingsStore {
    domains: Mutex<HashMap<String, Map<String, Value>>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn get_value(&self, domain: &str, key: &str) -> Option<Value> {
        lock(&self.domains).get(domain)?.get(key).cloned()
    }

    fn set_value(&self, domain: &str, key: &str, value: Value) -> Result<()> {
        lock(&self.domains)
            .entry(domain.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }
}

/// One JSON object per domain under a root directory.
///
/// The empty domain lives at `<root>/config.json`, every other domain at
/// `<root>/<domain>/config.json`. Files are read on first access and rewritten on every set.
pub struct JsonSettingsStore {
    root: PathBuf,
    domains: Mutex<HashMap<String, Map<String, Value>>>,
}

impl JsonSettingsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            domains: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn domain_path(&self, domain: &str) -> PathBuf {
        if domain.is_empty() {
            self.root.join("config.json")
        } else {
            self.root.join(domain).join("config.json")
        }
    }

    fn load_domain(&self, domain: &str) -> Map<String, Value> {
        let path = self.domain_path(domain);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Map::new(),
            Err(e) => {
                tracing::warn!(path = ?path, "failed to read settings: {e}");
                return Map::new();
            }
        };
        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                tracing::warn!(path = ?path, "settings file is not a JSON object; ignoring");
                Map::new()
            }
            Err(e) => {
                tracing::warn!(path = ?path, "failed to parse settings: {e}");
                Map::new()
            }
        }
    }

    fn persist(&self, domain: &str, map: &Map<String, Value>) -> Result<()> {
        let path = self.domain_path(domain);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create settings dir {:?}", parent))?;
        }
        let text = serde_json::to_string_pretty(map).context("serialize settings")?;
        fs::write(&path, text).with_context(|| format!("write settings {:?}", path))
    }
}

impl SettingsStore for JsonSettingsStore {
    fn get_value(&self, domain: &str, key: &str) -> Option<Value> {
        let mut domains = lock(&self.domains);
        if !domains.contains_key(domain) {
            let map = self.load_domain(domain);
            domains.insert(domain.to_string(), map);
        }
        domains.get(domain)?.get(key).cloned()
    }

    fn set_value(&self, domain: &str, key: &str, value: Value) -> Result<()> {
        let mut domains = lock(&self.domains);
        if !domains.contains_key(domain) {
            let map = self.load_domain(domain);
            domains.insert(domain.to_string(), map);
        }
        let map = domains.entry(domain.to_string()).or_default();
        map.insert(key.to_string(), value);
        self.persist(domain, map)
    }
}

/// A store bound to one domain.
#[derive(Clone)]
pub struct ScopedSettings {
    store: Arc<dyn SettingsStore>,
    domain: String,
}

impl ScopedSettings {
    pub fn new(store: Arc<dyn SettingsStore>, domain: &str) -> Self {
        Self {
            store,
            domain: domain.to_string(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.store.get_string(&self.domain, key)
    }

    pub fn set_string(&self, key: &str, value: &str) -> Result<()> {
        self.store.set_string(&self.domain, key, value)
    }

    pub fn get_string_array(&self, key: &str) -> Option<Vec<String>> {
        self.store.get_string_array(&self.domain, key)
    }

    pub fn set_string_array(&self, key: &str, values: &[String]) -> Result<()> {
        self.store.set_string_array(&self.domain, key, values)
    }

    pub fn get_number(&self, key: &str) -> Option<f64> {
        self.store.get_number(&self.domain, key)
    }

    pub fn set_number(&self, key: &str, value: f64) -> Result<()> {
        self.store.set_number(&self.domain, key, value)
    }
}
