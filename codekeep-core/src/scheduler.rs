/*!
Cron-keyed schedule dispatcher.

Handlers are registered against the exact schedule string a trigger source
will deliver. A dispatch runs every handler for that string concurrently,
waits for all of them and for any work they deferred through the
[`ExecutionContext`], and only then reports the first failure.

Schedule strings are compared byte for byte: `"0 3 * * *"` and `"0  3 * * *"`
are different schedules.
*/

use crate::{CodekeepError, Result};
use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A cron trigger as delivered by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledEvent {
    /// Schedule string the trigger was configured with
    pub cron: String,
    /// Instant the trigger was due
    pub scheduled_time: DateTime<Utc>,
}

impl ScheduledEvent {
    pub fn new<S: Into<String>>(cron: S, scheduled_time: DateTime<Utc>) -> Self {
        Self {
            cron: cron.into(),
            scheduled_time,
        }
    }

    /// Event for `cron` due right now
    pub fn now<S: Into<String>>(cron: S) -> Self {
        Self::new(cron, Utc::now())
    }
}

/// Deferred-completion handle shared by the handlers of one dispatch
///
/// Work passed to [`wait_until`](Self::wait_until) starts immediately on the
/// tokio runtime; [`settle`](Self::settle) waits for it to finish.
#[derive(Clone, Default)]
pub struct ExecutionContext {
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register background work that must finish before the dispatch does
    ///
    /// Must be called from within a tokio runtime.
    pub fn wait_until<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(work);
        self.lock().push(handle);
    }

    /// Number of registered tasks not yet awaited by [`settle`](Self::settle)
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Await every registered task, including tasks registered while settling
    ///
    /// Returns how many tasks ran to completion. A task that panicked is
    /// logged and not counted.
    pub async fn settle(&self) -> usize {
        let mut completed = 0usize;
        loop {
            let batch = std::mem::take(&mut *self.lock());
            if batch.is_empty() {
                break;
            }
            for outcome in join_all(batch).await {
                match outcome {
                    Ok(()) => completed += 1,
                    Err(e) => error!(error = %e, "Deferred task did not complete"),
                }
            }
        }
        completed
    }

    fn lock(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Future returned by a registered handler
pub type HandlerFuture = BoxFuture<'static, Result<()>>;

/// A registered handler, receiving the event, the environment, and the context
pub type Handler<E> =
    Arc<dyn Fn(ScheduledEvent, Arc<E>, ExecutionContext) -> HandlerFuture + Send + Sync>;

/// Registry from schedule string to the handlers bound to it
///
/// Built once at startup through chained [`register`](Self::register) calls,
/// then only read during dispatch.
///
/// # Example
/// ```rust
/// use codekeep_core::scheduler::{ExecutionContext, ScheduleDispatcher, ScheduledEvent};
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> codekeep_core::Result<()> {
/// let dispatcher = ScheduleDispatcher::<()>::new()
///     .register("0 3 * * *", |_event, _env, _ctx| async { Ok(()) });
///
/// let ran = dispatcher
///     .dispatch(&ScheduledEvent::now("0 3 * * *"), Arc::new(()), &ExecutionContext::new())
///     .await?;
/// assert_eq!(ran, 1);
/// # Ok(())
/// # }
/// ```
pub struct ScheduleDispatcher<E> {
    handlers: HashMap<String, Vec<Handler<E>>>,
}

impl<E> Default for ScheduleDispatcher<E> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<E> ScheduleDispatcher<E>
where
    E: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `handler` to the list for `schedule`
    ///
    /// Registering twice on the same schedule runs both; the empty string is
    /// a valid schedule.
    pub fn register<S, F, Fut>(mut self, schedule: S, handler: F) -> Self
    where
        S: Into<String>,
        F: Fn(ScheduledEvent, Arc<E>, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: Handler<E> = Arc::new(
            move |event: ScheduledEvent, env: Arc<E>, ctx: ExecutionContext| -> HandlerFuture {
                Box::pin(handler(event, env, ctx))
            },
        );
        let schedule = schedule.into();
        debug!(schedule = %schedule, "Registered schedule handler");
        self.handlers.entry(schedule).or_default().push(handler);
        self
    }

    /// Registered schedule strings in lexical order
    pub fn schedules(&self) -> Vec<&str> {
        let mut schedules: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        schedules.sort_unstable();
        schedules
    }

    /// Number of handlers registered on `schedule`
    pub fn handler_count(&self, schedule: &str) -> usize {
        self.handlers.get(schedule).map_or(0, Vec::len)
    }

    /// Run every handler registered on `event.cron`
    ///
    /// Returns the number of handlers run; zero when nothing is registered,
    /// which is logged as a warning rather than treated as an error.
    ///
    /// # Errors
    /// The first handler failure, reported only after every handler and every
    /// deferred task has finished.
    pub async fn dispatch(
        &self,
        event: &ScheduledEvent,
        env: Arc<E>,
        ctx: &ExecutionContext,
    ) -> Result<usize> {
        let Some(handlers) = self.handlers.get(&event.cron) else {
            warn!(schedule = %event.cron, "No handlers registered for schedule");
            #[cfg(feature = "metrics")]
            crate::observability::BackupMetrics::global().record_dispatch_miss();
            return Ok(0);
        };

        let invocation = Uuid::new_v4();
        info!(
            invocation = %invocation,
            schedule = %event.cron,
            scheduled_time = %event.scheduled_time,
            handlers = handlers.len(),
            "Dispatching scheduled event"
        );

        // A panicking handler is caught here so its siblings keep running
        let outcomes = join_all(handlers.iter().map(|handler| {
            let (event, env, ctx) = (event.clone(), Arc::clone(&env), ctx.clone());
            AssertUnwindSafe(async move { handler(event, env, ctx).await }).catch_unwind()
        }))
        .await;
        let deferred = ctx.settle().await;

        let mut first_failure = None;
        for (index, outcome) in outcomes.into_iter().enumerate() {
            let message = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(payload) => format!("handler panicked: {}", panic_message(payload.as_ref())),
            };
            error!(
                invocation = %invocation,
                schedule = %event.cron,
                handler = index,
                error = %message,
                "Scheduled handler failed"
            );
            first_failure.get_or_insert(message);
        }

        match first_failure {
            Some(message) => Err(CodekeepError::handler(&event.cron, message)),
            None => {
                info!(
                    invocation = %invocation,
                    schedule = %event.cron,
                    deferred,
                    "Scheduled event completed"
                );
                Ok(handlers.len())
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    /// Counts WARN events seen while installed
    struct WarnCounter(Arc<AtomicUsize>);

    impl<S: Subscriber> Layer<S> for WarnCounter {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() == Level::WARN {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[derive(Default)]
    struct Calls {
        first: AtomicUsize,
        second: AtomicUsize,
    }

    fn event(cron: &str) -> ScheduledEvent {
        ScheduledEvent::new(cron, Utc::now())
    }

    #[tokio::test]
    async fn test_dispatch_miss_warns_once() {
        let warnings = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(WarnCounter(Arc::clone(&warnings)));
        let _guard = tracing::subscriber::set_default(subscriber);

        let dispatcher = ScheduleDispatcher::<Calls>::new()
            .register("0 3 * * *", |_, env, _| async move {
                env.first.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        let env = Arc::new(Calls::default());

        let ran = dispatcher
            .dispatch(&event("*/5 * * * *"), Arc::clone(&env), &ExecutionContext::new())
            .await
            .unwrap();

        assert_eq!(ran, 0);
        assert_eq!(env.first.load(Ordering::SeqCst), 0);
        assert_eq!(warnings.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispatch_runs_every_handler_for_schedule() {
        let dispatcher = ScheduleDispatcher::<Calls>::new()
            .register("0 3 * * *", |_, env, _| async move {
                env.first.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .register("0 3 * * *", |_, env, _| async move {
                env.second.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .register("0 4 * * *", |_, env, _| async move {
                env.first.fetch_add(100, Ordering::SeqCst);
                Ok(())
            });
        let env = Arc::new(Calls::default());

        let ran = dispatcher
            .dispatch(&event("0 3 * * *"), Arc::clone(&env), &ExecutionContext::new())
            .await
            .unwrap();

        assert_eq!(ran, 2);
        assert_eq!(env.first.load(Ordering::SeqCst), 1);
        assert_eq!(env.second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_additive() {
        let handler = |_: ScheduledEvent, env: Arc<Calls>, _: ExecutionContext| async move {
            env.first.fetch_add(1, Ordering::SeqCst);
            Ok::<(), CodekeepError>(())
        };
        let dispatcher = ScheduleDispatcher::<Calls>::new()
            .register("@daily", handler)
            .register("@daily", handler);
        assert_eq!(dispatcher.handler_count("@daily"), 2);

        let env = Arc::new(Calls::default());
        dispatcher
            .dispatch(&event("@daily"), Arc::clone(&env), &ExecutionContext::new())
            .await
            .unwrap();
        assert_eq!(env.first.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_schedule_match_is_exact() {
        let dispatcher = ScheduleDispatcher::<Calls>::new()
            .register("0 3 * * *", |_, env, _| async move {
                env.first.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        let env = Arc::new(Calls::default());

        let ran = dispatcher
            .dispatch(&event("0  3 * * *"), Arc::clone(&env), &ExecutionContext::new())
            .await
            .unwrap();
        assert_eq!(ran, 0);
        assert_eq!(env.first.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_schedule_is_a_valid_key() {
        let dispatcher = ScheduleDispatcher::<Calls>::new()
            .register("", |_, env, _| async move {
                env.first.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        let env = Arc::new(Calls::default());

        let ran = dispatcher
            .dispatch(&event(""), Arc::clone(&env), &ExecutionContext::new())
            .await
            .unwrap();
        assert_eq!(ran, 1);
        assert_eq!(dispatcher.schedules(), vec![""]);
    }

    #[tokio::test]
    async fn test_failure_reported_after_siblings_settle() {
        let sibling_done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&sibling_done);

        let dispatcher = ScheduleDispatcher::<()>::new()
            .register("0 3 * * *", |_, _, _| async {
                Err(CodekeepError::storage("kv offline"))
            })
            .register("0 3 * * *", move |_, _, _| {
                let flag = Arc::clone(&flag);
                async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
            });

        let result = dispatcher
            .dispatch(&event("0 3 * * *"), Arc::new(()), &ExecutionContext::new())
            .await;

        assert!(sibling_done.load(Ordering::SeqCst));
        match result {
            Err(CodekeepError::Handler { schedule, message }) => {
                assert_eq!(schedule, "0 3 * * *");
                assert!(message.contains("kv offline"));
            }
            other => panic!("expected handler error, got {other:?}"),
        }
    }

    async fn fail_hard() -> Result<()> {
        tokio::time::sleep(Duration::from_millis(1)).await;
        panic!("snapshot handler blew up")
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_abandon_siblings() {
        let sibling_done = Arc::new(AtomicBool::new(false));
        let deferred_done = Arc::new(AtomicBool::new(false));
        let (sibling_flag, deferred_flag) = (Arc::clone(&sibling_done), Arc::clone(&deferred_done));

        let dispatcher = ScheduleDispatcher::<()>::new()
            .register("0 3 * * *", move |_, _, ctx: ExecutionContext| {
                let deferred_flag = Arc::clone(&deferred_flag);
                ctx.wait_until(async move {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    deferred_flag.store(true, Ordering::SeqCst);
                });
                fail_hard()
            })
            .register("0 3 * * *", move |_, _, _| {
                let flag = Arc::clone(&sibling_flag);
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
            });

        let result = dispatcher
            .dispatch(&event("0 3 * * *"), Arc::new(()), &ExecutionContext::new())
            .await;

        assert!(sibling_done.load(Ordering::SeqCst));
        assert!(deferred_done.load(Ordering::SeqCst));
        match result {
            Err(CodekeepError::Handler { schedule, message }) => {
                assert_eq!(schedule, "0 3 * * *");
                assert!(message.contains("snapshot handler blew up"));
            }
            other => panic!("expected handler error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handlers_for_one_schedule_run_concurrently() {
        let barrier = Arc::new(tokio::sync::Barrier::new(2));
        let (first, second) = (Arc::clone(&barrier), Arc::clone(&barrier));

        let dispatcher = ScheduleDispatcher::<()>::new()
            .register("0 3 * * *", move |_, _, _| {
                let barrier = Arc::clone(&first);
                async move {
                    barrier.wait().await;
                    Ok(())
                }
            })
            .register("0 3 * * *", move |_, _, _| {
                let barrier = Arc::clone(&second);
                async move {
                    barrier.wait().await;
                    Ok(())
                }
            });

        // Both handlers must be in flight at once to pass the barrier
        let ran = tokio::time::timeout(
            Duration::from_secs(5),
            dispatcher.dispatch(&event("0 3 * * *"), Arc::new(()), &ExecutionContext::new()),
        )
        .await
        .expect("handlers did not overlap")
        .unwrap();
        assert_eq!(ran, 2);
    }

    #[tokio::test]
    async fn test_dispatch_waits_for_deferred_work() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);

        let dispatcher = ScheduleDispatcher::<()>::new().register(
            "0 3 * * *",
            move |_, _, ctx: ExecutionContext| {
                let flag = Arc::clone(&flag);
                ctx.wait_until(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    flag.store(true, Ordering::SeqCst);
                });
                async { Ok(()) }
            },
        );

        let ctx = ExecutionContext::new();
        dispatcher
            .dispatch(&event("0 3 * * *"), Arc::new(()), &ctx)
            .await
            .unwrap();

        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(ctx.pending(), 0);
    }

    #[tokio::test]
    async fn test_settle_picks_up_nested_registrations() {
        let ctx = ExecutionContext::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let inner_ctx = ctx.clone();
        let inner_runs = Arc::clone(&runs);
        ctx.wait_until(async move {
            inner_runs.fetch_add(1, Ordering::SeqCst);
            let nested_runs = Arc::clone(&inner_runs);
            inner_ctx.wait_until(async move {
                nested_runs.fetch_add(1, Ordering::SeqCst);
            });
        });

        assert_eq!(ctx.settle().await, 2);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_settle_survives_panicking_task() {
        let ctx = ExecutionContext::new();
        ctx.wait_until(async { panic!("boom") });
        ctx.wait_until(async {});

        assert_eq!(ctx.settle().await, 1);
    }
}
