use crate::error::{ExceptionError, Result};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::env;
use std::path::Path;
use std::sync::Arc;

/// Configuration service
///
/// Holds named JSON configs (`exception`, `correlation`, `status`, ...).
/// Typed views are deserialized on every call, so callers load once at
/// startup and keep the result.
#[derive(Clone, Default)]
pub struct ConfigService {
    configs: Arc<DashMap<String, Value>>,
}

impl ConfigService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `<name>.json` file in `dir` as the config `<name>`.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let service = Self::new();
        for entry in std::fs::read_dir(dir.as_ref())? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let raw = std::fs::read_to_string(&path)?;
            let value: Value = serde_json::from_str(&raw)
                .map_err(|e| ExceptionError::config(name, e.to_string()))?;
            tracing::debug!("Loaded config '{}' from {}", name, path.display());
            service.insert(name, value);
        }
        Ok(service)
    }

    /// Apply overrides from the process environment.
    pub fn with_env(self) -> Self {
        self.apply_overrides(env::vars());
        self
    }

    /// Apply `<NAME>_<KEY>=value` overrides to already loaded configs.
    ///
    /// `EXCEPTION_ENABLED=false` sets `enabled` in the `exception` config.
    /// Only top-level scalar keys a config already has can be overridden, and
    /// the value is parsed as the type already stored there. Anything else is
    /// ignored. Returns the number of overrides applied.
    pub fn apply_overrides<I>(&self, vars: I) -> usize
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut applied = 0;
        for (var, raw) in vars {
            for mut config in self.configs.iter_mut() {
                let prefix = format!("{}_", config.key().to_uppercase().replace('-', "_"));
                let Some(key) = var.strip_prefix(&prefix) else {
                    continue;
                };
                let key = key.to_lowercase();
                let name = config.key().clone();
                let Value::Object(map) = config.value_mut() else {
                    continue;
                };
                let Some(current) = map.get_mut(&key) else {
                    continue;
                };
                match parse_override(current, &raw) {
                    Some(value) => {
                        tracing::debug!("Config '{}' key '{}' overridden by {}", name, key, var);
                        *current = value;
                        applied += 1;
                    }
                    None => tracing::warn!(
                        "Ignoring {}: cannot override '{}' in config '{}' with {:?}",
                        var,
                        key,
                        name,
                        raw
                    ),
                }
            }
        }
        applied
    }

    pub fn insert(&self, name: &str, value: Value) {
        self.configs.insert(name.to_string(), value);
    }

    /// Raw config as loaded, for diagnostics and module registration.
    pub fn get_map(&self, name: &str) -> Option<Value> {
        self.configs.get(name).map(|v| v.clone())
    }

    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let Some(value) = self.get_map(name) else {
            return Ok(None);
        };
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| ExceptionError::config(name, e.to_string()))
    }

    pub fn get_or_default<T: DeserializeOwned + Default>(&self, name: &str) -> Result<T> {
        Ok(self.get(name)?.unwrap_or_default())
    }
}

/// Parse `raw` as the same JSON type as `current`. Objects and arrays are
/// never overridden.
fn parse_override(current: &Value, raw: &str) -> Option<Value> {
    match current {
        Value::Bool(_) => {
            if raw.eq_ignore_ascii_case("true") {
                Some(Value::Bool(true))
            } else if raw.eq_ignore_ascii_case("false") {
                Some(Value::Bool(false))
            } else {
                None
            }
        }
        Value::Number(_) => raw.parse::<i64>().map(Value::from).ok().or_else(|| {
            raw.parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
        }),
        Value::String(_) | Value::Null => Some(Value::String(raw.to_string())),
        Value::Object(_) | Value::Array(_) => None,
    }
}
