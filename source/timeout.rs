//! Timeout source (spec §4.C).
//!
//! Directly generalizes `CancellationTokenSource::cancel_after` from
//! `examples/dgrunwald-rust-cancellation/lib.rs`, which spawns a detached
//! thread that sleeps then calls `cancel()`. Here the sleep runs as a
//! `tokio` task on the same loop that owns the token (no cross-thread hop,
//! no bridge needed — spec §5 "all deadlines are relative").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::Source;
use crate::error::CancellationError;
use crate::token::{Reason, Token};

pub struct TimeoutSource {
    duration: Duration,
    triggered: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimeoutSource {
    /// Rejects a non-positive timeout at construction (spec §8 boundary
    /// cases).
    pub fn new(duration: Duration) -> Result<Self, CancellationError> {
        if duration.is_zero() {
            return Err(CancellationError::InvalidConfiguration(
                "timeout must be strictly positive".into(),
            ));
        }
        Ok(TimeoutSource {
            duration,
            triggered: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        })
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }
}

#[async_trait]
impl Source for TimeoutSource {
    fn reason(&self) -> Reason {
        Reason::Timeout
    }

    async fn start_monitoring(&self, token: Token) -> Result<(), CancellationError> {
        let mut guard = self.handle.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let duration = self.duration;
        let triggered = self.triggered.clone();
        let message = format!("timed out after {duration:?}");
        *guard = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            triggered.store(true, Ordering::SeqCst);
            token.cancel(Reason::Timeout, Some(message)).await;
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_zero_duration() {
        assert!(TimeoutSource::new(Duration::ZERO).is_err());
    }

    #[tokio::test]
    async fn fires_after_duration() {
        let source = TimeoutSource::new(Duration::from_millis(20)).unwrap();
        let token = Token::new();
        source.start_monitoring(token.clone()).await.unwrap();
        assert!(!token.is_cancelled());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(token.is_cancelled());
        assert_eq!(token.reason(), Some(Reason::Timeout));
        assert!(source.triggered());
    }

    #[tokio::test]
    async fn stop_monitoring_prevents_firing() {
        let source = TimeoutSource::new(Duration::from_millis(20)).unwrap();
        let token = Token::new();
        source.start_monitoring(token.clone()).await.unwrap();
        source.stop_monitoring().await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!token.is_cancelled());
        assert!(!source.triggered());
    }
}
