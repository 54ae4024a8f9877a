use serde::{Deserialize, Serialize};
use std::fmt;

mod registry;

pub use registry::{
    STATUS_CONFIG_NAME, STATUS_RUNTIME_EXCEPTION, STATUS_UNCAUGHT_EXCEPTION, StatusRegistry,
};

/// A response status pairing an HTTP code with a stable symbolic identifier.
///
/// The `Display` output is the canonical JSON body sent to clients:
///
/// ```
/// use meshestra_exception::status::Status;
///
/// let status = Status::new(404, "ERR00404", "NOT_FOUND", "Resource not found");
/// assert_eq!(
///     status.to_string(),
///     r#"{"statusCode":404,"code":"ERR00404","message":"NOT_FOUND","description":"Resource not found","severity":"ERROR"}"#
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub status_code: u16,
    pub code: String,
    pub message: String,
    pub description: String,
    #[serde(default = "default_severity")]
    pub severity: String,
}

fn default_severity() -> String {
    "ERROR".to_string()
}

impl Status {
    pub fn new(
        status_code: u16,
        code: impl Into<String>,
        message: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            status_code,
            code: code.into(),
            message: message.into(),
            description: description.into(),
            severity: default_severity(),
        }
    }

    /// Substitute `%s` placeholders in the description, left to right.
    ///
    /// Extra arguments are ignored and unmatched placeholders are kept.
    pub fn with_args(mut self, args: &[&str]) -> Self {
        let mut args = args.iter();
        let mut description = String::with_capacity(self.description.len());
        let mut rest = self.description.as_str();
        while let Some(pos) = rest.find("%s") {
            description.push_str(&rest[..pos]);
            match args.next() {
                Some(arg) => description.push_str(arg),
                None => description.push_str("%s"),
            }
            rest = &rest[pos + 2..];
        }
        description.push_str(rest);
        self.description = description;
        self
    }

    pub fn with_severity(mut self, severity: impl Into<String>) -> Self {
        self.severity = severity.into();
        self
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_json() {
        let status = Status::new(500, "ERR10010", "RUNTIME_EXCEPTION", "Unexpected runtime exception");
        let value: serde_json::Value = serde_json::from_str(&status.to_string()).unwrap();

        assert_eq!(value["statusCode"], 500);
        assert_eq!(value["code"], "ERR10010");
        assert_eq!(value["message"], "RUNTIME_EXCEPTION");
        assert_eq!(value["severity"], "ERROR");
    }

    #[test]
    fn test_with_args() {
        let status = Status::new(400, "ERR11000", "VALIDATION_ERROR", "Field %s is invalid: %s")
            .with_args(&["email", "missing @"]);
        assert_eq!(status.description, "Field email is invalid: missing @");

        let partial = Status::new(400, "ERR11000", "VALIDATION_ERROR", "%s and %s").with_args(&["a"]);
        assert_eq!(partial.description, "a and %s");
    }

    #[test]
    fn test_severity_defaults_when_missing() {
        let status: Status = serde_json::from_str(
            r#"{"statusCode":401,"code":"ERR10001","message":"AUTH_TOKEN_EXPIRED","description":"Jwt token expired"}"#,
        )
        .unwrap();
        assert_eq!(status.severity, "ERROR");
    }
}
