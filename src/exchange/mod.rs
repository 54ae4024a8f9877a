//! The per-request exchange passed through a handler chain

use crate::context::DiagnosticContext;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode, header};
use axum::response::Response;
use strum_macros::{AsRefStr, Display};
use tokio_util::sync::CancellationToken;

/// Where a handler is currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ExecutionContext {
    /// The async runtime task that accepted the request. Must not block.
    Reactor,
    /// A worker pool thread. Blocking work is allowed.
    Worker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchState {
    Idle,
    Pending,
    Dispatched,
}

/// Mutable request/response state shared by every stage of a chain.
///
/// The request body is fully buffered before the chain runs. The response is
/// built in place: status and headers may be changed until a body is sent,
/// after which the response channel is closed.
#[derive(Debug)]
pub struct Exchange {
    request: Request<Bytes>,
    status: StatusCode,
    response_headers: HeaderMap,
    response_body: Option<Bytes>,
    diagnostics: DiagnosticContext,
    context: ExecutionContext,
    dispatch: DispatchState,
    cancellation: CancellationToken,
}

impl Exchange {
    /// A new exchange on the reactor context.
    pub fn new(request: Request<Bytes>) -> Self {
        Self::builder().request(request).build()
    }

    pub fn builder() -> ExchangeBuilder {
        ExchangeBuilder::default()
    }

    pub fn request(&self) -> &Request<Bytes> {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request<Bytes> {
        &mut self.request
    }

    pub fn status_code(&self) -> StatusCode {
        self.status
    }

    /// Set the response status from a numeric code.
    ///
    /// Codes outside the valid HTTP range are replaced by 500.
    pub fn set_status_code(&mut self, code: u16) {
        self.status = StatusCode::from_u16(code).unwrap_or_else(|_| {
            tracing::warn!("Invalid status code {}, using 500", code);
            StatusCode::INTERNAL_SERVER_ERROR
        });
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn response_headers(&self) -> &HeaderMap {
        &self.response_headers
    }

    pub fn response_headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.response_headers
    }

    pub fn response_body(&self) -> Option<&Bytes> {
        self.response_body.as_ref()
    }

    /// The sender for the response body, or `None` once the channel is
    /// unavailable.
    pub fn response_sender(&mut self) -> Option<ResponseSender<'_>> {
        if self.is_response_channel_available() {
            Some(ResponseSender { exchange: self })
        } else {
            None
        }
    }

    pub fn is_response_started(&self) -> bool {
        self.response_body.is_some()
    }

    /// Whether a response can still be written: nothing has been sent yet
    /// and the client has not gone away.
    pub fn is_response_channel_available(&self) -> bool {
        !self.is_response_started() && !self.is_cancelled()
    }

    pub fn diagnostics(&self) -> &DiagnosticContext {
        &self.diagnostics
    }

    pub fn diagnostics_mut(&mut self) -> &mut DiagnosticContext {
        &mut self.diagnostics
    }

    pub fn execution_context(&self) -> ExecutionContext {
        self.context
    }

    pub fn is_in_io_thread(&self) -> bool {
        self.context == ExecutionContext::Reactor
    }

    /// Ask the driver to re-run the chain on a worker once the current call
    /// returns.
    ///
    /// Returns `false` without changing anything when the exchange is already
    /// on a worker or a dispatch was already requested.
    pub fn dispatch(&mut self) -> bool {
        if self.context == ExecutionContext::Worker || self.dispatch != DispatchState::Idle {
            return false;
        }
        self.dispatch = DispatchState::Pending;
        true
    }

    pub fn is_dispatched(&self) -> bool {
        self.dispatch != DispatchState::Idle
    }

    pub(crate) fn take_dispatch(&mut self) -> bool {
        if self.dispatch == DispatchState::Pending {
            self.dispatch = DispatchState::Dispatched;
            true
        } else {
            false
        }
    }

    pub(crate) fn enter_worker(&mut self) {
        self.context = ExecutionContext::Worker;
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn into_response(self) -> Response {
        let mut response = Response::new(match self.response_body {
            Some(body) => Body::from(body),
            None => Body::empty(),
        });
        *response.status_mut() = self.status;
        *response.headers_mut() = self.response_headers;
        response
    }
}

/// Completes the response with a body. Consumed by [`send`](Self::send).
pub struct ResponseSender<'a> {
    exchange: &'a mut Exchange,
}

impl ResponseSender<'_> {
    pub fn send(self, body: impl Into<Bytes>) {
        self.exchange.response_body = Some(body.into());
    }

    /// Send a JSON body, setting the content type unless a stage already did.
    pub fn send_json(self, body: impl Into<Bytes>) {
        self.exchange
            .response_headers
            .entry(header::CONTENT_TYPE)
            .or_insert(HeaderValue::from_static("application/json"));
        self.send(body);
    }
}

/// Builder for [`Exchange`], used by the pipeline driver and in tests.
#[derive(Default)]
pub struct ExchangeBuilder {
    request: Option<Request<Bytes>>,
    context: Option<ExecutionContext>,
    cancellation: Option<CancellationToken>,
}

impl ExchangeBuilder {
    pub fn request(mut self, request: Request<Bytes>) -> Self {
        self.request = Some(request);
        self
    }

    pub fn execution_context(mut self, context: ExecutionContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn build(self) -> Exchange {
        Exchange {
            request: self.request.unwrap_or_default(),
            status: StatusCode::OK,
            response_headers: HeaderMap::new(),
            response_body: None,
            diagnostics: DiagnosticContext::new(),
            context: self.context.unwrap_or(ExecutionContext::Reactor),
            dispatch: DispatchState::Idle,
            cancellation: self.cancellation.unwrap_or_default(),
        }
    }
}
