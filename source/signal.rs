//! OS signal source (spec §4.C).
//!
//! Signal delivery is the canonical case the spec's thread→loop bridge
//! exists for: the actual `SIGINT`/`SIGTERM` event originates off the
//! cooperative task graph. `tokio::signal::unix` already coalesces
//! multiple listeners for the same signal kind internally, but the spec's
//! contract is explicit about a process-scoped, weak-referenced fan-out
//! table with first-registration/last-deregistration handler lifecycle
//! (spec §4.C, §9 "Weakly-held signal-handler registry") — so we keep that
//! shape on top of `tokio::signal`, fanning each delivered signal out to
//! every live `SignalSource` bound to it via [`crate::bridge::Bridge`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;

use super::Source;
use crate::bridge::Bridge;
use crate::error::CancellationError;
use crate::token::{Reason, Token};

/// An OS signal number. On unix this is the raw signal number (`SIGINT` =
/// 2, `SIGTERM` = 15, ...); kept as a bare integer so callers aren't
/// forced onto a platform-specific enum.
pub type SignalNumber = i32;

pub const SIGINT: SignalNumber = 2;
pub const SIGTERM: SignalNumber = 15;

struct Watched {
    triggered: Arc<AtomicBool>,
    token: Token,
}

struct Dispatch {
    // Per-signal-number fan-out list of live sources, held weakly so a
    // dropped `SignalSource` doesn't keep a zombie entry alive forever
    // (spec §9). Pruned opportunistically on every dispatch and on
    // de-registration.
    watchers: Mutex<HashMap<SignalNumber, Vec<Weak<AsyncMutex<Option<Watched>>>>>>,
    // One background listener task per signal number that currently has
    // at least one watcher; installed on first registration, aborted on
    // last de-registration (spec: "installed on first registration per
    // signal ... restored on last de-registration").
    tasks: Mutex<HashMap<SignalNumber, tokio::task::JoinHandle<()>>>,
}

fn dispatch() -> &'static Dispatch {
    static INSTANCE: OnceLock<Dispatch> = OnceLock::new();
    INSTANCE.get_or_init(|| Dispatch {
        watchers: Mutex::new(HashMap::new()),
        tasks: Mutex::new(HashMap::new()),
    })
}

#[cfg(unix)]
fn signal_kind(number: SignalNumber) -> Option<tokio::signal::unix::SignalKind> {
    Some(tokio::signal::unix::SignalKind::from_raw(number))
}

async fn ensure_task_installed(number: SignalNumber) {
    let mut tasks = dispatch().tasks.lock().unwrap();
    if tasks.contains_key(&number) {
        return;
    }
    #[cfg(unix)]
    {
        let Some(kind) = signal_kind(number) else {
            return;
        };
        let Ok(mut stream) = tokio::signal::unix::signal(kind) else {
            tracing::error!(signal = number, "failed to install signal handler");
            return;
        };
        let handle = tokio::spawn(async move {
            loop {
                if stream.recv().await.is_none() {
                    return;
                }
                dispatch_signal(number);
            }
        });
        tasks.insert(number, handle);
    }
    #[cfg(not(unix))]
    {
        let _ = number;
    }
}

/// Runs outside the per-scope loop turn conceptually (mirrors an OS
/// handler per spec §4.C): never does blocking work, only schedules
/// cancellation via the bridge.
fn dispatch_signal(number: SignalNumber) {
    let mut watchers = dispatch().watchers.lock().unwrap();
    let Some(list) = watchers.get_mut(&number) else {
        return;
    };
    list.retain(|weak| weak.strong_count() > 0);
    let live: Vec<_> = list.iter().filter_map(|w| w.upgrade()).collect();
    drop(watchers);
    for watched in live {
        Bridge::global().call_soon_threadsafe(move || async move {
            let guard = watched.lock().await;
            if let Some(w) = guard.as_ref() {
                if !w.triggered.load(Ordering::SeqCst) {
                    w.triggered.store(true, Ordering::SeqCst);
                    let message = format!("received signal {number}");
                    w.token.cancel(Reason::Signal, Some(message)).await;
                }
            }
        });
    }
}

async fn deregister(number: SignalNumber) {
    let should_stop_task = {
        let mut watchers = dispatch().watchers.lock().unwrap();
        if let Some(list) = watchers.get_mut(&number) {
            list.retain(|weak| weak.strong_count() > 0);
            list.is_empty()
        } else {
            true
        }
    };
    if should_stop_task {
        if let Some(handle) = dispatch().tasks.lock().unwrap().remove(&number) {
            handle.abort();
        }
    }
}

/// Watches a set of OS signals; defaults to `{SIGINT, SIGTERM}` when
/// constructed with an empty set (spec §8 boundary cases).
pub struct SignalSource {
    signals: Vec<SignalNumber>,
    triggered: Arc<AtomicBool>,
    state: Arc<AsyncMutex<Option<Watched>>>,
}

impl SignalSource {
    pub fn new(signals: impl IntoIterator<Item = SignalNumber>) -> Self {
        let mut signals: Vec<_> = signals.into_iter().collect();
        if signals.is_empty() {
            signals = vec![SIGINT, SIGTERM];
        }
        SignalSource {
            signals,
            triggered: Arc::new(AtomicBool::new(false)),
            state: Arc::new(AsyncMutex::new(None)),
        }
    }

    pub fn signals(&self) -> &[SignalNumber] {
        &self.signals
    }
}

#[async_trait]
impl Source for SignalSource {
    fn reason(&self) -> Reason {
        Reason::Signal
    }

    async fn start_monitoring(&self, token: Token) -> Result<(), CancellationError> {
        {
            let mut guard = self.state.lock().await;
            if guard.is_some() {
                return Ok(());
            }
            *guard = Some(Watched {
                triggered: self.triggered.clone(),
                token,
            });
        }
        for &number in &self.signals {
            ensure_task_installed(number).await;
            dispatch()
                .watchers
                .lock()
                .unwrap()
                .entry(number)
                .or_default()
                .push(Arc::downgrade(&self.state));
        }
        Ok(())
    }

    async fn stop_monitoring(&self) {
        *self.state.lock().await = None;
        for &number in &self.signals {
            deregister(number).await;
        }
    }

    fn triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_set_defaults_to_sigint_sigterm() {
        let source = SignalSource::new(std::iter::empty());
        assert_eq!(source.signals(), &[SIGINT, SIGTERM]);
    }

    #[tokio::test]
    async fn fires_on_configured_signal() {
        // The bridge only drains once something is running its `start()`
        // loop; the process-wide bridge has no implicit driver, so tests
        // that rely on a dispatch actually reaching the token must spawn
        // one themselves, same as a real binary would on startup.
        tokio::spawn(async { Bridge::global().start().await });
        tokio::task::yield_now().await;

        let source = SignalSource::new([SIGUSR1_FOR_TEST]);
        let token = Token::new();
        source.start_monitoring(token.clone()).await.unwrap();
        // Send ourselves the signal; tokio's unix signal stream observes
        // real OS delivery, so we use `libc`-free raising via the `kill`
        // syscall through `std::process` is unavailable — instead we
        // directly drive the dispatch helper, exercising the same
        // fan-out/bridge path a real OS delivery would take.
        dispatch_signal(SIGUSR1_FOR_TEST);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(token.is_cancelled());
        assert_eq!(token.reason(), Some(Reason::Signal));
        source.stop_monitoring().await;
    }

    const SIGUSR1_FOR_TEST: SignalNumber = 10;
}
