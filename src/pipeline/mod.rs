//! Chain assembly and the reactor → worker hand-off
//!
//! A [`Pipeline`] is built once at startup from middlewares and a terminal
//! handler, then shared immutably by every request. Each request starts on the
//! async runtime (the reactor). When a stage asks for a dispatch, the pipeline
//! submits the exchange to its [`WorkerPool`] and runs the chain again there.

mod service;

use crate::error::{ExceptionError, Result};
use crate::exchange::Exchange;
use crate::handler::{Handler, HandlerError, MiddlewareHandler};
use crate::module::ModuleRegistry;
use crate::worker::WorkerPool;
use axum::body::{Body, Bytes};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Default limit for buffered request bodies, 10 MiB
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

type Stage =
    Box<dyn FnOnce(Option<Arc<dyn Handler>>, &ModuleRegistry) -> Result<Option<Arc<dyn Handler>>> + Send>;

/// An assembled, immutable handler chain.
#[derive(Clone)]
pub struct Pipeline {
    root: Arc<dyn Handler>,
    workers: WorkerPool,
    max_body_size: usize,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    pub fn root(&self) -> &Arc<dyn Handler> {
        &self.root
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    /// Buffer the request, run it through the chain and build the response.
    pub async fn serve(&self, request: Request<Body>) -> Response {
        let (parts, body) = request.into_parts();
        let body = match read_body(body, self.max_body_size).await {
            Ok(body) => body,
            Err(BodyError::TooLarge) => {
                tracing::warn!(
                    "Request body for {} exceeds {} bytes",
                    parts.uri,
                    self.max_body_size
                );
                return (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response();
            }
            Err(BodyError::Read(e)) => {
                tracing::warn!("Failed to read request body for {}: {}", parts.uri, e);
                return (StatusCode::BAD_REQUEST, "Failed to read request body").into_response();
            }
        };

        // Cancels the exchange if this future is dropped before completion.
        let token = CancellationToken::new();
        let cancel_on_drop = token.clone().drop_guard();

        let exchange = Exchange::builder()
            .request(Request::from_parts(parts, body))
            .cancellation_token(token)
            .build();
        let result = self.process(exchange).await;
        cancel_on_drop.disarm();

        match result {
            Ok(exchange) => exchange.into_response(),
            Err(e) => {
                tracing::error!("Request processing aborted: {}", e);
                e.into_response()
            }
        }
    }

    /// Run an exchange through the chain, moving it to a worker if a stage
    /// requests a dispatch.
    pub async fn process(&self, mut exchange: Exchange) -> Result<Exchange> {
        if let Err(failure) = self.root.handle_request(&mut exchange) {
            unguarded_failure(&mut exchange, failure);
        }

        if !exchange.take_dispatch() {
            return Ok(exchange);
        }
        if exchange.is_cancelled() {
            tracing::debug!("Exchange cancelled before dispatch");
            return Ok(exchange);
        }

        tracing::debug!(
            "Dispatching {} {} to worker pool",
            exchange.request().method(),
            exchange.request().uri()
        );
        let root = Arc::clone(&self.root);
        self.workers
            .execute(move || {
                exchange.enter_worker();
                if exchange.is_cancelled() {
                    tracing::debug!("Exchange cancelled before re-entry");
                    return exchange;
                }
                if let Err(failure) = root.handle_request(&mut exchange) {
                    unguarded_failure(&mut exchange, failure);
                }
                exchange
            })
            .await
    }
}

enum BodyError {
    TooLarge,
    Read(axum::Error),
}

async fn read_body(body: Body, limit: usize) -> std::result::Result<Bytes, BodyError> {
    let mut stream = body.into_data_stream();
    let mut buffer = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(BodyError::Read)?;
        if buffer.len() + chunk.len() > limit {
            return Err(BodyError::TooLarge);
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(buffer))
}

// Only reachable when no exception handler is in the chain.
fn unguarded_failure(exchange: &mut Exchange, failure: HandlerError) {
    tracing::error!("Unhandled failure escaped the chain: {:?}", failure);
    if exchange.is_response_channel_available() {
        exchange.set_status(StatusCode::INTERNAL_SERVER_ERROR);
        if let Some(sender) = exchange.response_sender() {
            sender.send("Internal Server Error");
        }
    }
}

/// Builder for [`Pipeline`]
///
/// Middlewares run in the order they are added, before the terminal handler.
///
/// ```rust,no_run
/// use meshestra_exception::prelude::*;
///
/// # fn main() -> meshestra_exception::Result<()> {
/// let config = ConfigService::new();
/// let pipeline = Pipeline::builder()
///     .middleware(ExceptionHandler::from_config(&config)?)
///     .middleware(CorrelationHandler::from_config(&config)?)
///     .handler(|exchange: &mut Exchange| -> HandlerResult {
///         if let Some(sender) = exchange.response_sender() {
///             sender.send("hello");
///         }
///         Ok(())
///     })
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct PipelineBuilder {
    stages: Vec<Stage>,
    handler: Option<Arc<dyn Handler>>,
    registry: Option<ModuleRegistry>,
    workers: Option<WorkerPool>,
    max_body_size: usize,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            handler: None,
            registry: None,
            workers: None,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }

    /// Add a middleware. Disabled middlewares are left out of the chain.
    pub fn middleware<M: MiddlewareHandler>(mut self, mut middleware: M) -> Self {
        let stage = move |next: Option<Arc<dyn Handler>>,
                          registry: &ModuleRegistry|
              -> Result<Option<Arc<dyn Handler>>> {
            let name = std::any::type_name::<M>();
            if !middleware.is_enabled() {
                tracing::info!("{} is disabled, leaving it out of the chain", name);
                return Ok(next);
            }
            middleware.set_next(next)?;
            middleware.register(registry);
            tracing::debug!("Wired {}", name);
            let wired: Arc<dyn Handler> = Arc::new(middleware);
            Ok(Some(wired))
        };
        self.stages.push(Box::new(stage));
        self
    }

    /// Set the terminal handler.
    pub fn handler<H: Handler>(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn shared_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Registry used for module registration. Defaults to
    /// [`ModuleRegistry::global`].
    pub fn registry(mut self, registry: ModuleRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Worker pool for dispatched requests. Defaults to one thread per CPU.
    pub fn workers(mut self, workers: WorkerPool) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn max_body_size(mut self, limit: usize) -> Self {
        self.max_body_size = limit;
        self
    }

    /// Wire the chain back to front.
    ///
    /// # Errors
    ///
    /// [`ExceptionError::MissingNext`] when there is no terminal handler, and
    /// any error from creating the default worker pool.
    pub fn build(self) -> Result<Pipeline> {
        let registry = self
            .registry
            .unwrap_or_else(|| ModuleRegistry::global().clone());

        let stage_count = self.stages.len();
        let mut next = self.handler;
        for stage in self.stages.into_iter().rev() {
            next = stage(next, &registry)?;
        }
        let root = next.ok_or(ExceptionError::MissingNext)?;

        let workers = match self.workers {
            Some(workers) => workers,
            None => WorkerPool::with_available_parallelism()?,
        };

        tracing::info!(
            "Pipeline assembled ({} middlewares, {} worker threads)",
            stage_count,
            workers.num_threads()
        );

        Ok(Pipeline {
            root,
            workers,
            max_body_size: self.max_body_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exception::{ExceptionConfig, ExceptionHandler, STATUS_UNCAUGHT_EXCEPTION};
    use crate::handler::HandlerResult;
    use crate::status::StatusRegistry;

    fn pool() -> WorkerPool {
        WorkerPool::new(2).unwrap()
    }

    fn failing() -> impl Handler {
        |_: &mut Exchange| -> HandlerResult { Err(HandlerError::uncaught(anyhow::anyhow!("nope"))) }
    }

    #[test]
    fn test_build_without_handler_fails() {
        let result = Pipeline::builder()
            .middleware(ExceptionHandler::default())
            .registry(ModuleRegistry::new())
            .workers(pool())
            .build();

        assert!(matches!(result, Err(ExceptionError::MissingNext)));
    }

    #[test]
    fn test_build_registers_enabled_middlewares_only() {
        let registry = ModuleRegistry::new();
        let disabled = ExceptionHandler::new(
            ExceptionConfig { enabled: false },
            Arc::new(StatusRegistry::default()),
        );

        Pipeline::builder()
            .middleware(disabled)
            .handler(failing())
            .registry(registry.clone())
            .workers(pool())
            .build()
            .unwrap();
        assert!(registry.is_empty());

        Pipeline::builder()
            .middleware(ExceptionHandler::default())
            .handler(failing())
            .registry(registry.clone())
            .workers(pool())
            .build()
            .unwrap();
        assert!(registry.get(std::any::type_name::<ExceptionHandler>()).is_some());
    }

    #[test]
    fn test_shared_handler_becomes_root_without_middlewares() {
        let terminal: Arc<dyn Handler> = Arc::new(failing());
        let pipeline = Pipeline::builder()
            .shared_handler(Arc::clone(&terminal))
            .registry(ModuleRegistry::new())
            .workers(pool())
            .build()
            .unwrap();

        assert!(Arc::ptr_eq(pipeline.root(), &terminal));
        assert_eq!(pipeline.workers().num_threads(), 2);
    }

    #[tokio::test]
    async fn test_process_dispatches_to_worker() {
        let workers = pool();
        let probe = workers.clone();
        let pipeline = Pipeline::builder()
            .middleware(ExceptionHandler::default())
            .handler(move |exchange: &mut Exchange| -> HandlerResult {
                assert!(probe.is_worker_thread());
                assert!(!exchange.is_in_io_thread());
                exchange.set_status_code(202);
                Ok(())
            })
            .registry(ModuleRegistry::new())
            .workers(workers)
            .build()
            .unwrap();

        let exchange = pipeline.process(Exchange::builder().build()).await.unwrap();

        assert_eq!(exchange.status_code().as_u16(), 202);
    }

    #[tokio::test]
    async fn test_process_guarded_failure() {
        let pipeline = Pipeline::builder()
            .middleware(ExceptionHandler::default())
            .handler(failing())
            .registry(ModuleRegistry::new())
            .workers(pool())
            .build()
            .unwrap();

        let exchange = pipeline.process(Exchange::builder().build()).await.unwrap();

        let body = exchange.response_body().unwrap();
        assert!(String::from_utf8_lossy(body).contains(STATUS_UNCAUGHT_EXCEPTION));
    }

    #[tokio::test]
    async fn test_unguarded_failure_gets_bare_500() {
        let pipeline = Pipeline::builder()
            .handler(failing())
            .registry(ModuleRegistry::new())
            .workers(pool())
            .build()
            .unwrap();

        let exchange = pipeline.process(Exchange::builder().build()).await.unwrap();

        // Without the exception handler the chain stays on the reactor.
        assert!(exchange.is_in_io_thread());
        assert_eq!(exchange.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(exchange.response_body().unwrap().as_ref(), b"Internal Server Error");
    }

    #[tokio::test]
    async fn test_cancelled_exchange_is_not_reentered() {
        let pipeline = Pipeline::builder()
            .middleware(ExceptionHandler::default())
            .handler(|_: &mut Exchange| -> HandlerResult {
                panic!("cancelled exchanges must not reach the handler")
            })
            .registry(ModuleRegistry::new())
            .workers(pool())
            .build()
            .unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let exchange = pipeline
            .process(Exchange::builder().cancellation_token(token).build())
            .await
            .unwrap();

        assert!(exchange.is_dispatched());
        assert!(exchange.response_body().is_none());
    }

    #[tokio::test]
    async fn test_exchange_cancelled_while_queued_is_not_reentered() {
        let workers = WorkerPool::new(1).unwrap();
        let reached = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&reached);
        let pipeline = Pipeline::builder()
            .middleware(ExceptionHandler::default())
            .handler(move |_: &mut Exchange| -> HandlerResult {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            })
            .registry(ModuleRegistry::new())
            .workers(workers.clone())
            .build()
            .unwrap();

        // Occupy the only worker thread until released.
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let busy = workers.clone();
        let blocker = tokio::spawn(async move {
            busy.execute(move || {
                let _ = started_tx.send(());
                let _ = release_rx.recv();
            })
            .await
        });
        started_rx.await.unwrap();

        let token = CancellationToken::new();
        let exchange = Exchange::builder().cancellation_token(token.clone()).build();
        let mut processing = Box::pin(pipeline.process(exchange));

        // The first poll runs the reactor pass and queues the job.
        assert!(futures::poll!(&mut processing).is_pending());
        token.cancel();
        release_tx.send(()).unwrap();

        let exchange = processing.await.unwrap();
        blocker.await.unwrap().unwrap();

        assert!(!reached.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!exchange.is_in_io_thread());
        assert!(exchange.response_body().is_none());
    }
}
