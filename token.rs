//! The one-shot, thread-safe cancellation latch (spec §3/§4.A).
//!
//! Grounded on `examples/dgrunwald-rust-cancellation/lib.rs`: that crate's
//! `CancellationToken` uses an `AtomicUsize` status for a lock-free fast
//! path and a mutex-guarded linked list of `on_cancel` registrations for
//! the slow path. We keep the same two-tier shape — an atomic flag for
//! `is_cancelled()` snapshots and a mutex-guarded `Vec` of listeners for
//! the (rarer) registration/dispatch path — but generalize `on_cancel`
//! (a synchronous, single callback invoked by whichever thread calls
//! `cancel()`) into an ordered list of async listeners awaited by the
//! single cooperative loop that owns the token, per spec §4.A/§5.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::CancellationError;

/// Classified cause of a cancellation (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reason {
    Timeout,
    Manual,
    Signal,
    Condition,
    Parent,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Reason::Timeout => "timeout",
            Reason::Manual => "manual",
            Reason::Signal => "signal",
            Reason::Condition => "condition",
            Reason::Parent => "parent",
        };
        f.write_str(s)
    }
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
type Listener = Box<dyn Fn(Token) -> BoxFuture<'static, ()> + Send + Sync>;

struct Locked {
    reason: Option<Reason>,
    message: Option<String>,
    cancelled_at: Option<DateTime<Utc>>,
    listeners: Vec<Listener>,
}

struct Inner {
    id: Uuid,
    // Fast, non-blocking snapshot for `is_cancelled()` (spec §4.A:
    // "non-blocking snapshot"). Always written last, under `Release`,
    // after `locked`'s fields are populated, so a reader that observes
    // `true` via `Acquire` is guaranteed to see a fully populated `Locked`.
    cancelled: AtomicBool,
    locked: Mutex<Locked>,
    notify: Notify,
}

/// A one-shot cancellation latch. Cheaply `Clone`-able (it's a thin `Arc`
/// wrapper, the same shape as the teacher's `Arc<CancellationToken>`
/// convention), safe to hand to any thread, but only `cancel()`-safe from
/// the loop that owns it — off-loop producers must route through
/// [`crate::bridge::Bridge`] (spec §5 "Cross-thread").
#[derive(Clone)]
pub struct Token(Arc<Inner>);

impl Token {
    /// Creates a fresh, not-yet-cancelled token.
    pub fn new() -> Self {
        Token(Arc::new(Inner {
            id: Uuid::new_v4(),
            cancelled: AtomicBool::new(false),
            locked: Mutex::new(Locked {
                reason: None,
                message: None,
                cancelled_at: None,
                listeners: Vec::new(),
            }),
            notify: Notify::new(),
        }))
    }

    pub fn id(&self) -> Uuid {
        self.0.id
    }

    /// Non-blocking snapshot (spec §4.A).
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> Option<Reason> {
        self.0.locked.lock().unwrap().reason
    }

    pub fn message(&self) -> Option<String> {
        self.0.locked.lock().unwrap().message.clone()
    }

    pub fn cancelled_at(&self) -> Option<DateTime<Utc>> {
        self.0.locked.lock().unwrap().cancelled_at
    }

    /// Fails with [`CancellationError::Cancelled`] if this token has been
    /// cancelled; otherwise a no-op (spec §4.A).
    pub fn raise_if_cancelled(&self) -> Result<(), CancellationError> {
        if !self.is_cancelled() {
            return Ok(());
        }
        let locked = self.0.locked.lock().unwrap();
        Err(CancellationError::cancelled(
            locked.reason.unwrap_or(Reason::Manual),
            locked.message.clone(),
        ))
    }

    /// Awaits cancellation; returns immediately if already cancelled.
    ///
    /// Uses the standard `Notify` check-register-check-await dance so that
    /// a `cancel()` racing with the first check can never be missed (spec
    /// §4.A: "returns immediately if already cancelled"). `notified()`
    /// only actually registers itself as a waiter once `enable()` (or the
    /// first poll) runs; `cancel()` wakes waiters via `notify_waiters()`,
    /// which has no stored permit for latecomers the way `notify_one()`
    /// does. So `enable()` must run before the second `is_cancelled()`
    /// check — otherwise a `cancel()` landing between that check and the
    /// first poll of `notified` is missed forever.
    pub async fn wait_until_cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.0.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }

    /// Registers an async listener. If the token is already cancelled the
    /// listener runs immediately, before this call returns (spec §4.A:
    /// "the listener is invoked immediately before returning"). Otherwise
    /// it is appended and will run exactly once, in registration order,
    /// the next time `cancel()` succeeds.
    pub async fn register_listener<F, Fut>(&self, listener: F)
    where
        F: Fn(Token) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: Listener = Box::new(move |t: Token| Box::pin(listener(t)) as BoxFuture<'static, ()>);
        let pending = {
            let mut locked = self.0.locked.lock().unwrap();
            if locked.reason.is_some() {
                Some(boxed)
            } else {
                locked.listeners.push(boxed);
                None
            }
        };
        if let Some(cb) = pending {
            self.invoke_listener(cb).await;
        }
    }

    async fn invoke_listener(&self, cb: Listener) {
        let fut = AssertUnwindSafe(cb(self.clone()));
        if fut.catch_unwind().await.is_err() {
            tracing::error!(token_id = %self.0.id, "cancellation listener panicked; swallowed");
        }
    }

    /// Atomically transitions to cancelled and runs every currently
    /// registered listener exactly once, in registration order, awaiting
    /// each to completion before the next runs (spec §4.A, §5). Returns
    /// `true` on the call that performed the transition, `false` on every
    /// subsequent call (idempotent — spec §8 invariant 2).
    pub async fn cancel(&self, reason: Reason, message: Option<String>) -> bool {
        if self.0.cancelled.load(Ordering::Acquire) {
            return false;
        }
        let listeners = {
            let mut locked = self.0.locked.lock().unwrap();
            if locked.reason.is_some() {
                return false;
            }
            locked.reason = Some(reason);
            locked.message = message;
            locked.cancelled_at = Some(Utc::now());
            self.0.cancelled.store(true, Ordering::Release);
            std::mem::take(&mut locked.listeners)
        };
        self.0.notify.notify_waiters();
        tracing::debug!(token_id = %self.0.id, %reason, "token cancelled");
        for listener in listeners {
            self.invoke_listener(listener).await;
        }
        true
    }

    /// Arranges that when `other` fires, `self` also fires (spec §4.A).
    /// Strictly one-way: call twice (swapping arguments) for a
    /// bidirectional link.
    pub async fn link(&self, other: &Token, preserve_reason: bool) {
        let target = self.clone();
        other
            .register_listener(move |fired: Token| {
                let target = target.clone();
                async move {
                    if preserve_reason {
                        let reason = fired.reason().unwrap_or(Reason::Parent);
                        let message = fired.message();
                        target.cancel(reason, message).await;
                    } else {
                        let message = format!("parent token {} cancelled", fired.id());
                        target.cancel(Reason::Parent, Some(message)).await;
                    }
                }
            })
            .await;
    }
}

impl Default for Token {
    fn default() -> Self {
        Token::new()
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let locked = self.0.locked.lock().unwrap();
        f.debug_struct("Token")
            .field("id", &self.0.id)
            .field("cancelled", &self.is_cancelled())
            .field("reason", &locked.reason)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn not_cancelled_by_default() {
        let token = Token::new();
        assert!(!token.is_cancelled());
        assert!(token.raise_if_cancelled().is_ok());
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let token = Token::new();
        assert!(token.cancel(Reason::Manual, Some("stop".into())).await);
        assert!(!token.cancel(Reason::Timeout, Some("too late".into())).await);
        assert_eq!(token.reason(), Some(Reason::Manual));
        assert_eq!(token.message(), Some("stop".into()));
    }

    #[tokio::test]
    async fn raise_if_cancelled_carries_message() {
        let token = Token::new();
        token.cancel(Reason::Manual, Some("bye".into())).await;
        let err = token.raise_if_cancelled().unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.reason(), Some(Reason::Manual));
    }

    #[tokio::test]
    async fn listeners_run_once_in_order() {
        let token = Token::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3u32 {
            let order = order.clone();
            token
                .register_listener(move |_| {
                    let order = order.clone();
                    async move { order.lock().unwrap().push(i) }
                })
                .await;
        }
        token.cancel(Reason::Manual, None).await;
        token.cancel(Reason::Manual, None).await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn late_listener_fires_immediately() {
        let token = Token::new();
        token.cancel(Reason::Signal, Some("SIGTERM".into())).await;
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        token
            .register_listener(move |_| {
                let count2 = count2.clone();
                async move {
                    count2.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wait_until_cancelled_returns_immediately_when_already_cancelled() {
        let token = Token::new();
        token.cancel(Reason::Manual, None).await;
        tokio::time::timeout(std::time::Duration::from_millis(50), token.wait_until_cancelled())
            .await
            .expect("must not block");
    }

    #[tokio::test]
    async fn link_preserving_reason() {
        let upstream = Token::new();
        let downstream = Token::new();
        downstream.link(&upstream, true).await;
        upstream.cancel(Reason::Condition, Some("disk full".into())).await;
        assert!(downstream.is_cancelled());
        assert_eq!(downstream.reason(), Some(Reason::Condition));
        assert_eq!(downstream.message(), Some("disk full".into()));
    }

    #[tokio::test]
    async fn link_without_preserving_reason_uses_parent() {
        let upstream = Token::new();
        let downstream = Token::new();
        downstream.link(&upstream, false).await;
        upstream.cancel(Reason::Timeout, Some("slow".into())).await;
        assert!(downstream.is_cancelled());
        assert_eq!(downstream.reason(), Some(Reason::Parent));
    }

    #[tokio::test]
    async fn panicking_listener_does_not_block_others() {
        let token = Token::new();
        token
            .register_listener(|_| async { panic!("boom") })
            .await;
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        token
            .register_listener(move |_| {
                let ran2 = ran2.clone();
                async move {
                    ran2.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;
        token.cancel(Reason::Manual, None).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
