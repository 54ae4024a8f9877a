use thiserror::Error;

pub type Result<T> = std::result::Result<T, ExceptionError>;

/// Errors raised while wiring or driving a handler chain.
///
/// Request-time failures of the handlers themselves are modelled by
/// [`HandlerError`](crate::handler::HandlerError) instead.
#[derive(Debug, Error)]
pub enum ExceptionError {
    #[error("Next handler must not be empty")]
    MissingNext,

    #[error("Invalid configuration '{name}': {message}")]
    Config { name: String, message: String },

    #[error("Unknown status code: {code}")]
    UnknownStatus { code: String },

    #[error("Worker pool error: {0}")]
    WorkerPool(String),

    #[error("Worker task panicked: {0}")]
    WorkerPanicked(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ExceptionError {
    pub fn config(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl axum::response::IntoResponse for ExceptionError {
    fn into_response(self) -> axum::response::Response {
        (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            self.to_string(),
        )
            .into_response()
    }
}
