use crate::error::{ExceptionError, Result};
use rayon::ThreadPool;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Once};
use tokio::sync::oneshot;

/// Shared thread pool for potentially blocking request work
///
/// Requests are moved here from the async runtime so that handlers may block
/// without stalling unrelated requests.
#[derive(Clone)]
pub struct WorkerPool {
    pool: Arc<ThreadPool>,
}

impl WorkerPool {
    pub fn new(num_threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("meshestra-worker-{}", i))
            .build()
            .map_err(|e| ExceptionError::WorkerPool(e.to_string()))?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// A pool with one thread per available CPU.
    pub fn with_available_parallelism() -> Result<Self> {
        Self::new(num_cpus::get())
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Whether the calling thread belongs to this pool.
    pub fn is_worker_thread(&self) -> bool {
        self.pool.current_thread_index().is_some()
    }

    /// Execute a task in the thread pool and return its result asynchronously.
    ///
    /// A panic inside the task is caught and reported as
    /// [`ExceptionError::WorkerPanicked`].
    pub async fn execute<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        install_panic_hook();
        let (tx, rx) = oneshot::channel();
        self.pool.spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
                let message = panic_message(&*payload);
                match take_panic_site() {
                    Some(site) => format!("{} at {}", message, site.location),
                    None => message,
                }
            });
            let _ = tx.send(result);
        });

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(ExceptionError::WorkerPanicked(message)),
            Err(_) => Err(ExceptionError::WorkerPool(
                "worker dropped the task before completing it".to_string(),
            )),
        }
    }
}

/// Where a caught panic happened, recorded by the panic hook.
#[derive(Debug, Clone)]
pub(crate) struct PanicSite {
    pub(crate) location: String,
    pub(crate) backtrace: Option<String>,
}

thread_local! {
    static LAST_PANIC: RefCell<Option<PanicSite>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chain a hook in front of the current panic hook that remembers the
/// location (and backtrace, when `RUST_BACKTRACE` enables one) of the last
/// panic on each thread.
pub(crate) fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let location = info
                .location()
                .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
                .unwrap_or_else(|| "<unknown>".to_string());
            let backtrace = Backtrace::capture();
            let backtrace = (backtrace.status() == BacktraceStatus::Captured)
                .then(|| backtrace.to_string());
            LAST_PANIC.with(|last| *last.borrow_mut() = Some(PanicSite { location, backtrace }));
            previous(info);
        }));
    });
}

/// The site of the last panic on this thread, cleared by the call.
pub(crate) fn take_panic_site() -> Option<PanicSite> {
    LAST_PANIC.with(|last| last.borrow_mut().take())
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_execute_runs_on_pool_thread() {
        let pool = WorkerPool::new(2).unwrap();
        let probe = pool.clone();

        let on_worker = pool.execute(move || probe.is_worker_thread()).await.unwrap();

        assert!(on_worker);
        assert!(!pool.is_worker_thread());
        assert_eq!(pool.num_threads(), 2);
    }

    #[tokio::test]
    async fn test_execute_reports_panics() {
        let pool = WorkerPool::new(1).unwrap();

        let result: Result<()> = pool.execute(|| panic!("worker boom")).await;

        match result {
            Err(ExceptionError::WorkerPanicked(message)) => {
                assert!(message.starts_with("worker boom at "));
                assert!(message.contains(file!()));
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }

        // The pool survives the panic.
        assert_eq!(pool.execute(|| 1 + 1).await.unwrap(), 2);
    }
}
