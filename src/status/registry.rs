use super::Status;
use crate::config::ConfigService;
use crate::error::{ExceptionError, Result};
use axum::http::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;

/// Config name holding additional status definitions keyed by code.
pub const STATUS_CONFIG_NAME: &str = "status";

/// Status used when a handler fails with an unclassified runtime failure.
pub const STATUS_RUNTIME_EXCEPTION: &str = "ERR10010";
/// Status used when a handler fails with any other unclassified failure.
pub const STATUS_UNCAUGHT_EXCEPTION: &str = "ERR10011";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusEntry {
    status_code: u16,
    #[serde(default)]
    code: Option<String>,
    message: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    severity: Option<String>,
}

/// Lookup table from symbolic status codes to [`Status`] values.
///
/// Built once at startup and read-only afterwards.
#[derive(Debug, Clone)]
pub struct StatusRegistry {
    statuses: HashMap<String, Status>,
}

impl Default for StatusRegistry {
    fn default() -> Self {
        let mut statuses = HashMap::new();
        for status in [
            Status::new(
                500,
                STATUS_RUNTIME_EXCEPTION,
                "RUNTIME_EXCEPTION",
                "Unexpected runtime exception",
            ),
            Status::new(
                500,
                STATUS_UNCAUGHT_EXCEPTION,
                "UNCAUGHT_EXCEPTION",
                "Uncaught exception",
            ),
        ] {
            statuses.insert(status.code.clone(), status);
        }
        Self { statuses }
    }
}

impl StatusRegistry {
    /// Built-in statuses merged with the `status` config, if one is loaded.
    pub fn from_config(config: &ConfigService) -> Result<Self> {
        let mut registry = Self::default();
        let Some(entries) = config.get::<HashMap<String, StatusEntry>>(STATUS_CONFIG_NAME)? else {
            return Ok(registry);
        };

        for (key, entry) in entries {
            if let Some(code) = &entry.code {
                if code != &key {
                    return Err(ExceptionError::config(
                        STATUS_CONFIG_NAME,
                        format!("entry '{}' declares mismatched code '{}'", key, code),
                    ));
                }
            }
            if StatusCode::from_u16(entry.status_code).is_err() {
                return Err(ExceptionError::config(
                    STATUS_CONFIG_NAME,
                    format!(
                        "entry '{}' has invalid HTTP status code {}",
                        key, entry.status_code
                    ),
                ));
            }
            let mut status = Status::new(entry.status_code, key, entry.message, entry.description);
            if let Some(severity) = entry.severity {
                status = status.with_severity(severity);
            }
            registry.insert(status);
        }

        tracing::debug!("Loaded {} statuses", registry.len());
        Ok(registry)
    }

    pub fn insert(&mut self, status: Status) -> &mut Self {
        self.statuses.insert(status.code.clone(), status);
        self
    }

    pub fn get(&self, code: &str) -> Result<Status> {
        self.statuses
            .get(code)
            .cloned()
            .ok_or_else(|| ExceptionError::UnknownStatus {
                code: code.to_string(),
            })
    }

    /// Like [`get`](Self::get), but falls back to a bare 500 carrying the
    /// requested code so a response can always be produced.
    pub fn get_or_internal(&self, code: &str) -> Status {
        self.get(code).unwrap_or_else(|e| {
            tracing::error!("{}", e);
            Status::new(500, code, "INTERNAL_SERVER_ERROR", "Internal server error")
        })
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtin_statuses() {
        let registry = StatusRegistry::default();

        let runtime = registry.get(STATUS_RUNTIME_EXCEPTION).unwrap();
        let uncaught = registry.get(STATUS_UNCAUGHT_EXCEPTION).unwrap();

        assert_eq!(runtime.status_code, 500);
        assert_eq!(uncaught.status_code, 500);
        assert_ne!(runtime.code, uncaught.code);
    }

    #[test]
    fn test_from_config_merges_and_overrides() {
        let config = ConfigService::new();
        config.insert(
            STATUS_CONFIG_NAME,
            json!({
                "ERR00404": {
                    "statusCode": 404,
                    "message": "NOT_FOUND",
                    "description": "Resource %s not found"
                },
                "ERR10010": {
                    "statusCode": 503,
                    "code": "ERR10010",
                    "message": "RUNTIME_EXCEPTION",
                    "description": "Service unavailable",
                    "severity": "WARN"
                }
            }),
        );

        let registry = StatusRegistry::from_config(&config).unwrap();

        assert_eq!(registry.get("ERR00404").unwrap().status_code, 404);
        let runtime = registry.get(STATUS_RUNTIME_EXCEPTION).unwrap();
        assert_eq!(runtime.status_code, 503);
        assert_eq!(runtime.severity, "WARN");
        assert!(registry.get(STATUS_UNCAUGHT_EXCEPTION).is_ok());
    }

    #[test]
    fn test_mismatched_code_is_rejected() {
        let config = ConfigService::new();
        config.insert(
            STATUS_CONFIG_NAME,
            json!({ "ERR1": { "statusCode": 400, "code": "ERR2", "message": "X" } }),
        );

        assert!(matches!(
            StatusRegistry::from_config(&config),
            Err(ExceptionError::Config { .. })
        ));
    }

    #[test]
    fn test_invalid_http_status_code_is_rejected() {
        let config = ConfigService::new();
        config.insert(
            STATUS_CONFIG_NAME,
            json!({
                "ERR10010": {
                    "statusCode": 42,
                    "message": "RUNTIME_EXCEPTION",
                    "description": "Unexpected runtime exception"
                }
            }),
        );

        let err = StatusRegistry::from_config(&config).unwrap_err();
        assert!(matches!(err, ExceptionError::Config { ref name, .. } if name == STATUS_CONFIG_NAME));
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn test_unknown_code_falls_back_to_internal() {
        let registry = StatusRegistry::default();

        assert!(matches!(
            registry.get("ERR99999"),
            Err(ExceptionError::UnknownStatus { .. })
        ));
        let fallback = registry.get_or_internal("ERR99999");
        assert_eq!(fallback.status_code, 500);
        assert_eq!(fallback.code, "ERR99999");
    }
}
