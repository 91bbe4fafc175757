//! Composable units of work.
//!
//! A [`Task`] is an async function of a [`TaskContext`] returning
//! `Result<()>`. Tasks are cheap to clone (they share their closure) and are
//! composed with [`Task::then`], [`Task::finally`], [`Task::with_condition`],
//! [`Task::with_timeout`], [`chain`] and [`parallel`]. Nothing in this module
//! knows about containers or pipelines.

use crate::{Error, Result};
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tokio::time::Instant;
use tracing::{Instrument, Span, info};

/// Execution context passed to every task.
///
/// Carries the cancellation signal, an optional deadline and the tracing
/// span that log lines of the task are attributed to. Cloning is cheap and
/// clones share the cancellation signal.
#[derive(Debug, Clone)]
pub struct TaskContext {
    cancel: Arc<watch::Sender<bool>>,
    deadline: Option<Instant>,
    span: Span,
}

impl TaskContext {
    pub fn new() -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            cancel: Arc::new(cancel),
            deadline: None,
            span: Span::current(),
        }
    }

    /// Same context, logging under `span`.
    pub fn with_span(&self, span: Span) -> Self {
        Self {
            span,
            ..self.clone()
        }
    }

    /// Child context expiring at the earlier of the current deadline and `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        };
        Self {
            deadline: Some(deadline),
            ..self.clone()
        }
    }

    /// Context for cleanup work: keeps the span, drops deadline and cancellation.
    pub fn detached(&self) -> Self {
        let mut ctx = Self::new();
        ctx.span = self.span.clone();
        ctx
    }

    /// Cancel this context and every context cloned or derived from it.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// The reason this context is no longer usable, if any.
    pub fn err(&self) -> Option<Error> {
        if *self.cancel.borrow() {
            return Some(Error::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Error::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> Error {
        let mut cancelled = self.cancel.subscribe();
        let cancel = async move {
            if cancelled.wait_for(|c| *c).await.is_err() {
                std::future::pending::<()>().await;
            }
        };

        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = cancel => Error::Cancelled,
                _ = tokio::time::sleep_until(deadline) => Error::DeadlineExceeded,
            },
            None => {
                cancel.await;
                Error::Cancelled
            }
        }
    }

    /// Run `fut` until it finishes or the context ends, whichever comes first.
    ///
    /// When the context ends first, `fut` is dropped and the context's error
    /// is returned.
    pub async fn guard<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            result = fut => result,
        }
    }
}

impl Default for TaskContext {
    fn default() -> Self {
        Self::new()
    }
}

type TaskFn = dyn Fn(TaskContext) -> BoxFuture<'static, Result<()>> + Send + Sync;

/// A reusable unit of work.
#[derive(Clone)]
pub struct Task {
    run: Arc<TaskFn>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Task")
    }
}

impl Task {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            run: Arc::new(move |ctx| -> BoxFuture<'static, Result<()>> { Box::pin(f(ctx)) }),
        }
    }

    /// A task that does nothing and succeeds.
    pub fn noop() -> Self {
        Self::new(|_| async { Ok(()) })
    }

    pub async fn run(&self, ctx: TaskContext) -> Result<()> {
        (self.run)(ctx).await
    }

    /// Run `next` after `self` succeeds and while the context is still live.
    pub fn then(self, next: Task) -> Task {
        Task::new(move |ctx| {
            let (first, next) = (self.clone(), next.clone());
            async move {
                first.run(ctx.clone()).await?;
                if let Some(err) = ctx.err() {
                    return Err(err);
                }
                next.run(ctx).await
            }
        })
    }

    /// Always run `cleanup` after `self`.
    ///
    /// A cleanup error is returned wrapped in [`Error::Cleanup`] and replaces
    /// any error from `self`. Otherwise the result of `self` is returned.
    /// Cleanup runs under [`TaskContext::detached`].
    pub fn finally(self, cleanup: Task) -> Task {
        Task::new(move |ctx| {
            let (task, cleanup) = (self.clone(), cleanup.clone());
            async move {
                let result = task.run(ctx.clone()).await;
                match cleanup.run(ctx.detached()).await {
                    Ok(()) => result,
                    Err(err) => Err(Error::Cleanup(Box::new(err))),
                }
            }
        })
    }

    /// Run `self` only if `predicate` holds when the task starts.
    pub fn with_condition<P>(self, predicate: P) -> Task
    where
        P: Fn() -> bool + Send + Sync + 'static,
    {
        let predicate = Arc::new(predicate);
        Task::new(move |ctx| {
            let (task, predicate) = (self.clone(), predicate.clone());
            async move {
                if !predicate() {
                    info!(parent: ctx.span(), "Condition not met, skipping");
                    return Ok(());
                }
                task.run(ctx).await
            }
        })
    }

    /// Bound `self` to `timeout`.
    ///
    /// Expiry of this timeout surfaces as [`Error::Timeout`]; expiry of an
    /// enclosing deadline is passed through unchanged.
    pub fn with_timeout(self, timeout: Duration) -> Task {
        Task::new(move |ctx| {
            let task = self.clone();
            async move {
                let child = ctx.with_deadline(Instant::now() + timeout);
                match task.run(child).await {
                    Err(Error::DeadlineExceeded) if ctx.err().is_none() => {
                        Err(Error::Timeout(timeout))
                    }
                    other => other,
                }
            }
        })
    }
}

/// Sequence `tasks` with [`Task::then`]. An empty sequence succeeds.
pub fn chain<I>(tasks: I) -> Task
where
    I: IntoIterator<Item = Task>,
{
    tasks
        .into_iter()
        .reduce(Task::then)
        .unwrap_or_else(Task::noop)
}

/// Run `tasks` on at most `max_workers` concurrent workers.
///
/// Every task runs to completion even if a sibling fails. Returns the
/// context's error if it ended, otherwise the first error in submission
/// order.
pub fn parallel(max_workers: usize, tasks: Vec<Task>) -> Task {
    let tasks = Arc::new(tasks);
    Task::new(move |ctx| {
        let tasks = tasks.clone();
        async move {
            let workers = max_workers.min(tasks.len()).max(1);
            let permits = Arc::new(Semaphore::new(workers));

            let handles: Vec<_> = tasks
                .iter()
                .cloned()
                .map(|task| {
                    let permits = permits.clone();
                    let ctx = ctx.clone();
                    let span = ctx.span().clone();
                    tokio::spawn(
                        async move {
                            let _permit = permits
                                .acquire_owned()
                                .await
                                .map_err(|e| Error::Internal(e.to_string()))?;
                            task.run(ctx).await
                        }
                        .instrument(span),
                    )
                })
                .collect();

            let mut first_error = None;
            for handle in handles {
                let result = handle
                    .await
                    .unwrap_or_else(|e| Err(Error::Internal(format!("task panicked: {e}"))));
                if let Err(err) = result {
                    first_error.get_or_insert(err);
                }
            }

            if let Some(err) = ctx.err() {
                return Err(err);
            }
            first_error.map_or(Ok(()), Err)
        }
    })
}

/// Number of workers to use for parallel groups on this host.
pub fn available_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn recording(log: &Arc<Mutex<Vec<u32>>>, id: u32, delay_ms: u64) -> Task {
        let log = log.clone();
        Task::new(move |_| {
            let log = log.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                log.lock().unwrap().push(id);
                Ok(())
            }
        })
    }

    fn failing(message: &'static str) -> Task {
        Task::new(move |_| async move { Err(Error::InvalidInput(message.to_string())) })
    }

    fn counting(counter: &Arc<AtomicUsize>) -> Task {
        let counter = counter.clone();
        Task::new(move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_chain_empty_is_noop() {
        assert!(chain(Vec::new()).run(TaskContext::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_chain_runs_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let task = chain(vec![
            recording(&log, 1, 20),
            recording(&log, 2, 0),
            recording(&log, 3, 5),
        ]);
        task.run(TaskContext::new()).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_then_skips_next_on_error() {
        let counter = Arc::new(AtomicUsize::new(0));
        let err = failing("boom")
            .then(counting(&counter))
            .run(TaskContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(ref m) if m == "boom"));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_then_skips_next_when_context_expired() {
        let counter = Arc::new(AtomicUsize::new(0));
        let ctx = TaskContext::new().with_deadline(Instant::now());
        let err = Task::noop()
            .then(counting(&counter))
            .run(ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_finally_error_masks_primary_error() {
        let err = failing("primary")
            .finally(failing("cleanup"))
            .run(TaskContext::new())
            .await
            .unwrap_err();
        match err {
            Error::Cleanup(inner) => {
                assert!(matches!(*inner, Error::InvalidInput(ref m) if m == "cleanup"))
            }
            other => panic!("expected cleanup error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_finally_error_masks_success() {
        let err = Task::noop()
            .finally(failing("cleanup"))
            .run(TaskContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cleanup(_)));
    }

    #[tokio::test]
    async fn test_finally_passes_through_primary_result() {
        let counter = Arc::new(AtomicUsize::new(0));
        let err = failing("primary")
            .finally(counting(&counter))
            .run(TaskContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(ref m) if m == "primary"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        assert!(
            Task::noop()
                .finally(counting(&counter))
                .run(TaskContext::new())
                .await
                .is_ok()
        );
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_finally_cleanup_runs_after_deadline() {
        let cleanup_saw_live_context = Arc::new(AtomicBool::new(false));
        let flag = cleanup_saw_live_context.clone();
        let cleanup = Task::new(move |ctx| {
            let flag = flag.clone();
            async move {
                flag.store(ctx.err().is_none(), Ordering::SeqCst);
                Ok(())
            }
        });

        let ctx = TaskContext::new().with_deadline(Instant::now());
        let err = Task::new(|ctx: TaskContext| async move { ctx.err().map_or(Ok(()), Err) })
            .finally(cleanup)
            .run(ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded));
        assert!(cleanup_saw_live_context.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_condition_false_skips_task() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = counting(&counter).with_condition(|| false);
        assert!(task.run(TaskContext::new()).await.is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_condition_evaluated_at_run_time() {
        let counter = Arc::new(AtomicUsize::new(0));
        let enabled = Arc::new(AtomicBool::new(false));
        let gate = enabled.clone();
        let task = counting(&counter).with_condition(move || gate.load(Ordering::SeqCst));

        enabled.store(true, Ordering::SeqCst);
        task.run(TaskContext::new()).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_interrupts_guarded_work() {
        let task = Task::new(|ctx: TaskContext| async move {
            ctx.guard(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
        })
        .with_timeout(Duration::from_millis(20));

        let started = Instant::now();
        let err = task.run(TaskContext::new()).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(d) if d == Duration::from_millis(20)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_timeout_allows_fast_task() {
        let log = Arc::new(Mutex::new(Vec::new()));
        recording(&log, 1, 1)
            .with_timeout(Duration::from_secs(1))
            .run(TaskContext::new())
            .await
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_outer_deadline_is_not_reported_as_inner_timeout() {
        let task = Task::new(|ctx: TaskContext| async move {
            ctx.guard(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
        })
        .with_timeout(Duration::from_secs(60))
        .with_timeout(Duration::from_millis(20));

        let err = task.run(TaskContext::new()).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(d) if d == Duration::from_millis(20)));
    }

    #[tokio::test]
    async fn test_guard_returns_cancelled() {
        let ctx = TaskContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });
        let err = ctx
            .guard(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_detached_context_ignores_parent_cancel() {
        let ctx = TaskContext::new();
        let detached = ctx.detached();
        ctx.cancel();
        assert!(matches!(ctx.err(), Some(Error::Cancelled)));
        assert!(detached.err().is_none());
    }

    #[tokio::test]
    async fn test_parallel_runs_every_task_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let task = parallel(
            3,
            vec![
                recording(&log, 1, 50),
                recording(&log, 2, 100),
                recording(&log, 3, 10),
            ],
        );
        task.run(TaskContext::new()).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec![3, 1, 2]);
    }

    #[tokio::test]
    async fn test_parallel_failure_does_not_stop_siblings() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let slow_failure = {
            let log = log.clone();
            Task::new(move |_| {
                let log = log.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    log.lock().unwrap().push(1);
                    Err(Error::InvalidInput("first".to_string()))
                }
            })
        };
        let task = parallel(
            4,
            vec![
                slow_failure,
                failing("second"),
                recording(&log, 3, 80),
            ],
        );

        let err = task.run(TaskContext::new()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(ref m) if m == "first"));
        assert_eq!(*log.lock().unwrap(), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_parallel_respects_worker_bound() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let tasks = (0..6)
            .map(|_| {
                let (active, peak) = (active.clone(), peak.clone());
                Task::new(move |_| {
                    let (active, peak) = (active.clone(), peak.clone());
                    async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
            })
            .collect();

        parallel(2, tasks).run(TaskContext::new()).await.unwrap();
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_parallel_empty_and_zero_workers() {
        assert!(parallel(0, Vec::new()).run(TaskContext::new()).await.is_ok());

        let counter = Arc::new(AtomicUsize::new(0));
        parallel(0, vec![counting(&counter), counting(&counter)])
            .run(TaskContext::new())
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_parallel_reports_context_error() {
        let ctx = TaskContext::new();
        ctx.cancel();
        let err = parallel(2, vec![Task::noop()]).run(ctx).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
