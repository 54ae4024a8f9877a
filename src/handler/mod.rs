use crate::error::Result;
use crate::exchange::Exchange;
use crate::module::ModuleRegistry;
use crate::status::Status;
use crate::worker::PanicSite;
use std::any::Any;
use std::sync::Arc;
use strum_macros::{AsRefStr, Display, EnumIter};
use thiserror::Error;

/// Standard return type for handlers
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// A failure escaping a handler.
///
/// The structured variants carry a pre-resolved [`Status`] that is sent to
/// the client as is. The unstructured variants are mapped to a generic status
/// by the exception handler: `Runtime` for bugs and broken invariants
/// (including panics), `Uncaught` for every other error value.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("framework error {}", .0.code)]
    Framework(Status),

    #[error("api error {}", .0.code)]
    Api(Status),

    #[error("runtime error: {0}")]
    Runtime(anyhow::Error),

    #[error("uncaught error: {0}")]
    Uncaught(anyhow::Error),
}

/// Coarse bucket of a [`HandlerError`], used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum Classification {
    Framework,
    Api,
    Runtime,
    Uncaught,
}

impl HandlerError {
    pub fn runtime(error: impl Into<anyhow::Error>) -> Self {
        Self::Runtime(error.into())
    }

    pub fn uncaught(error: impl Into<anyhow::Error>) -> Self {
        Self::Uncaught(error.into())
    }

    /// Convert a panic payload caught while running a handler.
    ///
    /// Includes the panic location (and backtrace, if enabled) when the panic
    /// hook installed by the exception handler recorded one on this thread.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = crate::worker::panic_message(&*payload);
        let error = match crate::worker::take_panic_site() {
            Some(PanicSite {
                location,
                backtrace: Some(backtrace),
            }) => anyhow::anyhow!(
                "handler panicked at {}: {}\nstack backtrace:\n{}",
                location,
                message,
                backtrace
            ),
            Some(PanicSite { location, .. }) => {
                anyhow::anyhow!("handler panicked at {}: {}", location, message)
            }
            None => anyhow::anyhow!("handler panicked: {}", message),
        };
        Self::Runtime(error)
    }

    pub fn classification(&self) -> Classification {
        match self {
            Self::Framework(_) => Classification::Framework,
            Self::Api(_) => Classification::Api,
            Self::Runtime(_) => Classification::Runtime,
            Self::Uncaught(_) => Classification::Uncaught,
        }
    }

    /// The status carried by a structured failure.
    pub fn status(&self) -> Option<&Status> {
        match self {
            Self::Framework(status) | Self::Api(status) => Some(status),
            Self::Runtime(_) | Self::Uncaught(_) => None,
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(error: anyhow::Error) -> Self {
        Self::Uncaught(error)
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(error: std::io::Error) -> Self {
        Self::Uncaught(error.into())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(error: serde_json::Error) -> Self {
        Self::Uncaught(error.into())
    }
}

/// A stage in a handler chain.
///
/// Handlers run on worker threads once the exception handler has moved the
/// request off the reactor, so they may block.
pub trait Handler: Send + Sync + 'static {
    fn handle_request(&self, exchange: &mut Exchange) -> HandlerResult;
}

impl<F> Handler for F
where
    F: Fn(&mut Exchange) -> HandlerResult + Send + Sync + 'static,
{
    fn handle_request(&self, exchange: &mut Exchange) -> HandlerResult {
        self(exchange)
    }
}

/// A handler that wraps the rest of the chain and can be switched off.
///
/// The pipeline builder wires `next` once, splices the middleware in only when
/// [`is_enabled`](Self::is_enabled) is true, and then calls
/// [`register`](Self::register).
pub trait MiddlewareHandler: Handler {
    fn next(&self) -> Option<&Arc<dyn Handler>>;

    /// Wire the following stage. `None` is a configuration error.
    fn set_next(&mut self, next: Option<Arc<dyn Handler>>) -> Result<&mut Self>
    where
        Self: Sized;

    fn is_enabled(&self) -> bool;

    fn register(&self, registry: &ModuleRegistry);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::panic;
    use strum::IntoEnumIterator;

    #[test]
    fn test_classification() {
        let status = Status::new(404, "ERR00404", "NOT_FOUND", "Not found");

        assert_eq!(
            HandlerError::Framework(status.clone()).classification(),
            Classification::Framework
        );
        assert_eq!(
            HandlerError::Api(status.clone()).status().map(|s| s.code.as_str()),
            Some("ERR00404")
        );
        assert_eq!(HandlerError::Api(status).classification(), Classification::Api);
        assert_eq!(
            HandlerError::runtime(anyhow::anyhow!("bug")).classification(),
            Classification::Runtime
        );
        assert_eq!(
            HandlerError::from(std::io::Error::other("disk")).classification(),
            Classification::Uncaught
        );
        assert!(HandlerError::uncaught(anyhow::anyhow!("disk")).status().is_none());
    }

    #[test]
    fn test_classification_labels_are_distinct() {
        let labels: HashSet<String> = Classification::iter().map(|c| c.to_string()).collect();
        assert_eq!(labels.len(), 4);
        assert!(labels.contains("runtime"));
        assert!(labels.contains("uncaught"));
    }

    #[test]
    fn test_from_panic_keeps_message() {
        let payload = panic::catch_unwind(|| panic!("index out of range")).unwrap_err();
        let error = HandlerError::from_panic(payload);

        assert_eq!(error.classification(), Classification::Runtime);
        assert!(error.to_string().contains("index out of range"));

        let formatted = panic::catch_unwind(|| panic!("value {}", 7)).unwrap_err();
        assert!(HandlerError::from_panic(formatted).to_string().contains("value 7"));
    }

    #[test]
    fn test_from_panic_records_location() {
        crate::worker::install_panic_hook();
        let line = line!() + 1;
        let payload = panic::catch_unwind(|| panic!("out of bounds")).unwrap_err();

        let message = HandlerError::from_panic(payload).to_string();

        assert!(message.contains(&format!("{}:{}", file!(), line)));
        assert!(message.contains("out of bounds"));
        // The site is consumed, so an unrelated payload does not reuse it.
        assert!(crate::worker::take_panic_site().is_none());
    }

    #[test]
    fn test_closure_is_handler() {
        let handler = |exchange: &mut Exchange| -> HandlerResult {
            exchange.set_status_code(204);
            Ok(())
        };
        let mut exchange = Exchange::builder().build();

        handler.handle_request(&mut exchange).unwrap();
        assert_eq!(exchange.status_code().as_u16(), 204);
    }
}
