use crate::config::ConfigService;
use crate::context::CORRELATION_ID_KEY;
use crate::error::{ExceptionError, Result};
use crate::exchange::Exchange;
use crate::handler::{Handler, HandlerError, HandlerResult, MiddlewareHandler};
use crate::module::ModuleRegistry;
use axum::http::HeaderValue;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Config name of the correlation handler
pub const CONFIG_NAME: &str = "correlation";

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Generate an id when the request carries none
    #[serde(default = "default_true")]
    pub autogen_correlation_id: bool,
}

fn default_true() -> bool {
    true
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            autogen_correlation_id: true,
        }
    }
}

/// Puts the request's correlation id into the diagnostic context and echoes
/// it back in the response headers.
///
/// Place it after the exception handler, which clears the context.
pub struct CorrelationHandler {
    config: CorrelationConfig,
    next: Option<Arc<dyn Handler>>,
}

impl Default for CorrelationHandler {
    fn default() -> Self {
        Self::new(CorrelationConfig::default())
    }
}

impl CorrelationHandler {
    pub fn new(config: CorrelationConfig) -> Self {
        Self { config, next: None }
    }

    pub fn from_config(config: &ConfigService) -> Result<Self> {
        Ok(Self::new(config.get_or_default(CONFIG_NAME)?))
    }

    fn correlation_id(&self, exchange: &Exchange) -> Option<String> {
        let incoming = exchange
            .request()
            .headers()
            .get(CORRELATION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_string);

        match incoming {
            Some(id) => Some(id),
            None if self.config.autogen_correlation_id => Some(Uuid::new_v4().to_string()),
            None => None,
        }
    }
}

impl Handler for CorrelationHandler {
    fn handle_request(&self, exchange: &mut Exchange) -> HandlerResult {
        if let Some(id) = self.correlation_id(exchange) {
            if let Ok(value) = HeaderValue::from_str(&id) {
                exchange
                    .response_headers_mut()
                    .insert(CORRELATION_ID_HEADER, value);
            }
            exchange.diagnostics_mut().put(CORRELATION_ID_KEY, id);
        }

        let next = self
            .next
            .as_ref()
            .ok_or_else(|| HandlerError::runtime(ExceptionError::MissingNext))?;
        next.handle_request(exchange)
    }
}

impl MiddlewareHandler for CorrelationHandler {
    fn next(&self) -> Option<&Arc<dyn Handler>> {
        self.next.as_ref()
    }

    fn set_next(&mut self, next: Option<Arc<dyn Handler>>) -> Result<&mut Self> {
        self.next = Some(next.ok_or(ExceptionError::MissingNext)?);
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
