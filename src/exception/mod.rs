//! Last-line exception handling for handler chains
//!
//! [`ExceptionHandler`] belongs at the front of a chain. It wraps everything
//! after it, so any failure a business handler did not deal with ends up here
//! and is turned into a structured status response instead of a dropped
//! connection. It also moves requests off the reactor before any handler code
//! runs, and it owns clearing the diagnostic context at the end of a request.
//!
//! Handling errors close to where they happen is still preferred; this is the
//! safety net. Only disable it when something else takes over both jobs.

use crate::config::ConfigService;
use crate::context::DiagnosticScope;
use crate::error::{ExceptionError, Result};
use crate::exchange::Exchange;
use crate::handler::{Handler, HandlerError, HandlerResult, MiddlewareHandler};
use crate::module::ModuleRegistry;
use crate::status::{Status, StatusRegistry};
use axum::http::{HeaderValue, header};
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

pub use crate::status::{STATUS_RUNTIME_EXCEPTION, STATUS_UNCAUGHT_EXCEPTION};

/// Config name of the exception handler
pub const CONFIG_NAME: &str = "exception";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Default for ExceptionConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
        }
    }
}

/// Catches failures escaping the rest of the chain and answers them with a
/// status response.
///
/// | Failure                  | Response                          |
/// |--------------------------|-----------------------------------|
/// | `HandlerError::Framework` | the carried status                |
/// | `HandlerError::Runtime`, panics | [`STATUS_RUNTIME_EXCEPTION`] |
/// | `HandlerError::Api`       | the carried status                |
/// | `HandlerError::Uncaught`  | [`STATUS_UNCAUGHT_EXCEPTION`]     |
pub struct ExceptionHandler {
    config: ExceptionConfig,
    statuses: Arc<StatusRegistry>,
    next: Option<Arc<dyn Handler>>,
}

impl Default for ExceptionHandler {
    fn default() -> Self {
        Self::new(ExceptionConfig::default(), Arc::new(StatusRegistry::default()))
    }
}

impl ExceptionHandler {
    pub fn new(config: ExceptionConfig, statuses: Arc<StatusRegistry>) -> Self {
        Self {
            config,
            statuses,
            next: None,
        }
    }

    /// Build from the `exception` and `status` configs.
    ///
    /// A missing `exception` config means enabled.
    pub fn from_config(config: &ConfigService) -> Result<Self> {
        let exception_config = config.get_or_default::<ExceptionConfig>(CONFIG_NAME)?;
        let statuses = StatusRegistry::from_config(config)?;
        Ok(Self::new(exception_config, Arc::new(statuses)))
    }

    pub fn config(&self) -> &ExceptionConfig {
        &self.config
    }

    fn handle_failure(&self, exchange: &mut Exchange, failure: HandlerError) {
        tracing::error!(
            classification = %failure.classification(),
            diagnostics = %exchange.diagnostics(),
            "Exception: {:?}",
            failure
        );

        if !exchange.is_response_channel_available() {
            tracing::warn!(
                "Response channel unavailable, skipping error response for {}",
                failure.classification()
            );
            return;
        }

        let status = self.resolve_status(failure);
        exchange.set_status_code(status.status_code);
        // Drop whatever content type the failed stage had chosen.
        exchange.response_headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        if let Some(sender) = exchange.response_sender() {
            sender.send_json(status.to_string());
        }
    }

    fn resolve_status(&self, failure: HandlerError) -> Status {
        match failure {
            HandlerError::Framework(status) => status,
            HandlerError::Runtime(_) => self.statuses.get_or_internal(STATUS_RUNTIME_EXCEPTION),
            HandlerError::Api(status) => status,
            HandlerError::Uncaught(_) => self.statuses.get_or_internal(STATUS_UNCAUGHT_EXCEPTION),
        }
    }
}

impl Handler for ExceptionHandler {
    fn handle_request(&self, exchange: &mut Exchange) -> HandlerResult {
        // The driver runs the chain again on a worker; leave the exchange alone.
        if exchange.is_in_io_thread() {
            exchange.dispatch();
            return Ok(());
        }

        crate::worker::install_panic_hook();
        let mut scope = DiagnosticScope::enter(exchange);

        let outcome = match &self.next {
            Some(next) => panic::catch_unwind(AssertUnwindSafe(|| next.handle_request(&mut scope)))
                .unwrap_or_else(|payload| Err(HandlerError::from_panic(payload))),
            None => Err(HandlerError::runtime(ExceptionError::MissingNext)),
        };

        if let Err(failure) = outcome {
            self.handle_failure(&mut scope, failure);
        }

        Ok(())
    }
}

impl MiddlewareHandler for ExceptionHandler {
    fn next(&self) -> Option<&Arc<dyn Handler>> {
        self.next.as_ref()
    }

    fn set_next(&mut self, next: Option<Arc<dyn Handler>>) -> Result<&mut Self> {
        let next = next.ok_or(ExceptionError::MissingNext)?;
        self.next = Some(next);
        Ok(self)
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn register(&self, registry: &ModuleRegistry) {
        registry.register_module(
            std::any::type_name::<Self>(),
            serde_json::to_value(&self.config).ok(),
            None,
        );
    }
}
