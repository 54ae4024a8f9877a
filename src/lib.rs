//! # Meshestra Exception
//!
//! The last line of defense of a Meshestra handler chain.
//!
//! [`ExceptionHandler`] sits first in a [`Pipeline`]. It moves every request
//! from the async runtime onto a [`WorkerPool`] thread, runs the rest of the
//! chain in a protected region, and turns anything that escapes (error values
//! and panics alike) into a structured status response. Whatever happens, the
//! request's diagnostic context is cleared before the worker moves on.
//!
//! ## Features
//!
//! - **Failure classification**: structured statuses pass through, everything
//!   else maps to `ERR10010` (runtime) or `ERR10011` (uncaught)
//! - **Reactor offloading**: handlers may block without stalling the runtime
//! - **Diagnostic context**: correlation ids and friends, scoped per request
//! - **Configurable**: JSON configs with environment overrides
//! - **Tower integration**: a `Pipeline` is a `tower::Service`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshestra_exception::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> meshestra_exception::Result<()> {
//!     let config = ConfigService::new().with_env();
//!
//!     let pipeline = Pipeline::builder()
//!         .middleware(ExceptionHandler::from_config(&config)?)
//!         .middleware(CorrelationHandler::from_config(&config)?)
//!         .handler(|exchange: &mut Exchange| -> HandlerResult {
//!             let id = exchange.request().uri().path().trim_start_matches('/').to_string();
//!             if id.is_empty() {
//!                 return Err(HandlerError::Api(Status::new(
//!                     404,
//!                     "ERR00404",
//!                     "NOT_FOUND",
//!                     "Resource not found",
//!                 )));
//!             }
//!             if let Some(sender) = exchange.response_sender() {
//!                 sender.send(id);
//!             }
//!             Ok(())
//!         })
//!         .build()?;
//!
//!     let app = Router::new().fallback_service(pipeline);
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod correlation;
pub mod error;
pub mod exception;
pub mod exchange;
pub mod handler;
pub mod module;
pub mod pipeline;
pub mod status;
pub mod worker;

// Re-export core types
pub use config::ConfigService;
pub use error::{ExceptionError, Result};
pub use exception::{ExceptionConfig, ExceptionHandler};
pub use exchange::Exchange;
pub use handler::{Handler, HandlerError, HandlerResult, MiddlewareHandler};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use status::{Status, StatusRegistry};
pub use worker::WorkerPool;

// Re-export commonly used types from dependencies
pub use axum;

/// Prelude module for convenient imports
///
/// ```
/// use meshestra_exception::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::ConfigService;
    pub use crate::context::{CORRELATION_ID_KEY, DiagnosticContext, DiagnosticScope};
    pub use crate::correlation::{CorrelationConfig, CorrelationHandler};
    pub use crate::error::{ExceptionError, Result};
    pub use crate::exception::{
        ExceptionConfig, ExceptionHandler, STATUS_RUNTIME_EXCEPTION, STATUS_UNCAUGHT_EXCEPTION,
    };
    pub use crate::exchange::{Exchange, ExecutionContext};
    pub use crate::handler::{
        Classification, Handler, HandlerError, HandlerResult, MiddlewareHandler,
    };
    pub use crate::module::{ModuleInfo, ModuleRegistry};
    pub use crate::pipeline::{Pipeline, PipelineBuilder};
    pub use crate::status::{Status, StatusRegistry};
    pub use crate::worker::WorkerPool;
    pub use axum::{Router, http::StatusCode};
    pub use std::sync::Arc;
}
