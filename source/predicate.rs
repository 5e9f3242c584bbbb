//! Predicate (condition) source, plus the `ResourcePredicate`
//! specialization (spec §4.C).
//!
//! Grounded on `examples/original_source/src/hother/cancelable/sources/
//! condition.py`: a polling loop around a user predicate, with a
//! resource-metrics specialization layered on top. The predicate itself
//! is represented the same way `agent-backplane`'s async trait objects are
//! (`Arc<dyn Fn(...) -> BoxFuture<...>>`), so both sync and async
//! predicates share one storage shape; sync predicates are wrapped to run
//! on a blocking-pool thread (spec: "Sync predicates are executed on a
//! worker thread").

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::Source;
use crate::error::CancellationError;
use crate::token::{Reason, Token};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
type AsyncPredicate = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

/// Polls a zero-arg predicate at a fixed interval; fires when it returns
/// `true`.
pub struct PredicateSource {
    name: String,
    predicate: AsyncPredicate,
    interval: Duration,
    triggered: Arc<AtomicBool>,
    check_count: Arc<AtomicU64>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PredicateSource {
    fn build(
        name: impl Into<String>,
        interval: Duration,
        predicate: AsyncPredicate,
    ) -> Result<Self, CancellationError> {
        if interval.is_zero() {
            return Err(CancellationError::InvalidConfiguration(
                "predicate poll interval must be strictly positive".into(),
            ));
        }
        Ok(PredicateSource {
            name: name.into(),
            predicate,
            interval,
            triggered: Arc::new(AtomicBool::new(false)),
            check_count: Arc::new(AtomicU64::new(0)),
            handle: Mutex::new(None),
        })
    }

    /// An async predicate, awaited directly on the loop.
    pub fn new_async<F, Fut>(
        name: impl Into<String>,
        interval: Duration,
        predicate: F,
    ) -> Result<Self, CancellationError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let predicate: AsyncPredicate = Arc::new(move || Box::pin(predicate()) as BoxFuture<'static, bool>);
        Self::build(name, interval, predicate)
    }

    /// A synchronous predicate, executed on a blocking-pool worker thread
    /// each poll (spec §4.C).
    pub fn new_sync<F>(
        name: impl Into<String>,
        interval: Duration,
        predicate: F,
    ) -> Result<Self, CancellationError>
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        let predicate = Arc::new(predicate);
        let wrapped: AsyncPredicate = Arc::new(move || {
            let predicate = predicate.clone();
            Box::pin(async move {
                match tokio::task::spawn_blocking(move || predicate()).await {
                    Ok(result) => result,
                    Err(join_err) => {
                        tracing::error!("predicate panicked on worker thread: {join_err}");
                        false
                    }
                }
            }) as BoxFuture<'static, bool>
        });
        Self::build(name, interval, wrapped)
    }

    pub fn check_count(&self) -> u64 {
        self.check_count.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Source for PredicateSource {
    fn reason(&self) -> Reason {
        Reason::Condition
    }

    async fn start_monitoring(&self, token: Token) -> Result<(), CancellationError> {
        let mut guard = self.handle.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let predicate = self.predicate.clone();
        let interval = self.interval;
        let triggered = self.triggered.clone();
        let check_count = self.check_count.clone();
        let name = self.name.clone();
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so the first real
            // check happens after one full interval, matching a
            // straightforward poll loop.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let count = check_count.fetch_add(1, Ordering::SeqCst) + 1;
                // A panicking predicate must not kill the poll loop silently
                // (spec: "exceptions inside the predicate are logged and
                // polling continues").
                let satisfied = match AssertUnwindSafe(predicate()).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::error!(condition = %name, "predicate panicked; treated as not satisfied");
                        false
                    }
                };
                if satisfied {
                    triggered.store(true, Ordering::SeqCst);
                    let message = format!("condition '{name}' satisfied after {count} checks");
                    token.cancel(Reason::Condition, Some(message)).await;
                    return;
                }
            }
        }));
        Ok(())
    }

    async fn stop_monitoring(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
    }

    fn triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}

/// Thresholds for [`ResourcePredicate`].
#[derive(Debug, Clone, Copy)]
pub struct ResourceThresholds {
    pub max_memory_percent: Option<f32>,
    pub max_cpu_percent: Option<f32>,
    pub max_disk_percent: Option<f32>,
}

/// Polls process/system metrics and fires when any configured threshold is
/// exceeded (spec §4.C "ResourcePredicate"). Backed by `sysinfo` (the
/// process-metrics crate `examples/f-squirrel-nearcore` depends on) behind
/// the `resource-metrics` feature; without the feature this degrades to
/// "always false" with a one-time warning, per spec.
#[cfg(feature = "resource-metrics")]
pub struct ResourcePredicate;

#[cfg(feature = "resource-metrics")]
impl ResourcePredicate {
    pub fn build(
        interval: Duration,
        thresholds: ResourceThresholds,
    ) -> Result<PredicateSource, CancellationError> {
        use std::sync::Mutex as StdMutex;
        use sysinfo::{ProcessExt, System, SystemExt};

        let system = Arc::new(StdMutex::new(System::new_all()));
        let pid = sysinfo::get_current_pid().ok();
        PredicateSource::new_sync("resource-thresholds", interval, move || {
            let mut system = system.lock().unwrap();
            system.refresh_memory();
            system.refresh_cpu();
            if let Some(pid) = pid {
                system.refresh_process(pid);
            }

            if let Some(max) = thresholds.max_memory_percent {
                let used = system.used_memory() as f64;
                let total = system.total_memory().max(1) as f64;
                if (used / total * 100.0) as f32 > max {
                    return true;
                }
            }
            if let Some(max) = thresholds.max_cpu_percent {
                let cpu = system.global_cpu_info().cpu_usage();
                if cpu > max {
                    return true;
                }
            }
            if let Some(max) = thresholds.max_disk_percent {
                let _ = max; // disk usage is reported per-mount by sysinfo; left to callers
                             // who know which mount to watch via a custom predicate.
            }
            false
        })
    }
}

/// Degraded `ResourcePredicate` when built without the `resource-metrics`
/// feature: always false, logged once (spec §4.C).
#[cfg(not(feature = "resource-metrics"))]
pub struct ResourcePredicate;

#[cfg(not(feature = "resource-metrics"))]
impl ResourcePredicate {
    pub fn build(
        interval: Duration,
        _thresholds: ResourceThresholds,
    ) -> Result<PredicateSource, CancellationError> {
        tracing::warn!(
            "ResourcePredicate requested but the `resource-metrics` feature is disabled; \
             degrading to a predicate that never fires"
        );
        PredicateSource::new_async("resource-thresholds (disabled)", interval, || async { false })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn rejects_zero_interval() {
        assert!(PredicateSource::new_async("x", Duration::ZERO, || async { false }).is_err());
    }

    #[tokio::test]
    async fn fires_on_third_poll() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let source = PredicateSource::new_async("third-call", Duration::from_millis(10), move || {
            let calls2 = calls2.clone();
            async move { calls2.fetch_add(1, Ordering::SeqCst) + 1 >= 3 }
        })
        .unwrap();
        let token = Token::new();
        source.start_monitoring(token.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(token.is_cancelled());
        assert_eq!(token.reason(), Some(Reason::Condition));
        assert!(source.check_count() >= 3);
    }

    #[tokio::test]
    async fn panicking_predicate_is_logged_and_polling_continues() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let source = PredicateSource::new_async("flaky", Duration::from_millis(10), move || {
            let calls2 = calls2.clone();
            async move {
                let n = calls2.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    panic!("transient failure");
                }
                true
            }
        })
        .unwrap();
        let token = Token::new();
        source.start_monitoring(token.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(token.is_cancelled());
        assert_eq!(token.reason(), Some(Reason::Condition));
    }

    #[tokio::test]
    async fn sync_predicate_runs_on_worker_thread() {
        let source = PredicateSource::new_sync("sync", Duration::from_millis(10), || true).unwrap();
        let token = Token::new();
        source.start_monitoring(token.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(token.is_cancelled());
    }
}
