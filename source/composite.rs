//! Composite source: `AnyOf`/`AllOf` combination of child sources
//! (spec §4.C, §4.D `combine`).
//!
//! Grounded on `examples/original_source/src/cancelable/sources/
//! composite.py` and the `examples/02_advanced/01_combined_cancelation.py`
//! / `09_all_of_combining.py` samples, which exercise both modes
//! explicitly. spec.md's Open Questions section is explicit that a
//! reimplementation "should expose both modes explicitly; do not assume
//! `combine` silently means ALL" — so `CompositeMode` is a public,
//! required choice rather than an inferred default.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::Source;
use crate::error::CancellationError;
use crate::token::{Reason, Token};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeMode {
    /// Fires when any child fires; inherits the firing child's reason and
    /// message.
    Any,
    /// Fires only once every child has independently fired.
    All,
}

pub struct CompositeSource {
    mode: CompositeMode,
    children: Vec<Arc<dyn Source>>,
    triggered: Arc<AtomicBool>,
    // Private per-child tokens used only in `All` mode, so each child can
    // be observed firing independently without prematurely cancelling the
    // bound (outer) token.
    child_tokens: Mutex<Vec<Token>>,
    all_waiter: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CompositeSource {
    /// `ANY` composite (also referred to as `AnyOf` in spec.md): fires on
    /// the first child to fire.
    pub fn any(children: Vec<Arc<dyn Source>>) -> Result<Self, CancellationError> {
        Self::new(CompositeMode::Any, children)
    }

    /// `ALL` composite (`AllOf`): fires once every child has fired.
    pub fn all(children: Vec<Arc<dyn Source>>) -> Result<Self, CancellationError> {
        Self::new(CompositeMode::All, children)
    }

    fn new(mode: CompositeMode, children: Vec<Arc<dyn Source>>) -> Result<Self, CancellationError> {
        if children.is_empty() {
            return Err(CancellationError::InvalidConfiguration(
                "composite source requires at least one child".into(),
            ));
        }
        Ok(CompositeSource {
            mode,
            children,
            triggered: Arc::new(AtomicBool::new(false)),
            child_tokens: Mutex::new(Vec::new()),
            all_waiter: Mutex::new(None),
        })
    }

    pub fn mode(&self) -> CompositeMode {
        self.mode
    }
}

#[async_trait]
impl Source for CompositeSource {
    fn reason(&self) -> Reason {
        // Only meaningful before any child has fired; once fired the
        // composite's bound token carries the real firing reason (`Any`)
        // or the last-firing child's reason (`All`).
        Reason::Condition
    }

    async fn start_monitoring(&self, token: Token) -> Result<(), CancellationError> {
        match self.mode {
            CompositeMode::Any => {
                // Every child shares the same bound token: `Token::cancel`
                // is idempotent and first-writer-wins on reason/message,
                // so this *is* "fires on first, with that one's reason" —
                // no extra coordination needed (spec §8: "combine(A, B)
                // ... fires on the first of A, B to fire").
                for child in &self.children {
                    child.start_monitoring(token.clone()).await?;
                }
            }
            CompositeMode::All => {
                let mut child_tokens = self.child_tokens.lock().await;
                let mut per_child = Vec::with_capacity(self.children.len());
                for child in &self.children {
                    let child_token = Token::new();
                    child.start_monitoring(child_token.clone()).await?;
                    per_child.push(child_token);
                }
                *child_tokens = per_child.clone();
                drop(child_tokens);

                let triggered = self.triggered.clone();
                let waiter = tokio::spawn(async move {
                    for child_token in &per_child {
                        child_token.wait_until_cancelled().await;
                    }
                    triggered.store(true, Ordering::SeqCst);
                    // The reason of the last child to have been awaited is
                    // not necessarily the last to fire in wall-clock time,
                    // but since every child has fired by this point we
                    // surface whichever reason/message the join order
                    // settled on last (documented Open Question in
                    // DESIGN.md: "collapse to the final observed reason").
                    let (reason, message) = per_child
                        .last()
                        .map(|t| (t.reason().unwrap_or(Reason::Condition), t.message()))
                        .unwrap_or((Reason::Condition, None));
                    token.cancel(reason, message).await;
                });
                *self.all_waiter.lock().await = Some(waiter);
            }
        }
        Ok(())
    }

    async fn stop_monitoring(&self) {
        for child in &self.children {
            child.stop_monitoring().await;
        }
        if let Some(handle) = self.all_waiter.lock().await.take() {
            handle.abort();
        }
    }

    fn triggered(&self) -> bool {
        match self.mode {
            CompositeMode::Any => self.children.iter().any(|c| c.triggered()),
            CompositeMode::All => self.triggered.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::timeout::TimeoutSource;
    use std::time::Duration;

    #[tokio::test]
    async fn any_fires_on_first_child() {
        let fast = Arc::new(TimeoutSource::new(Duration::from_millis(10)).unwrap());
        let slow = Arc::new(TimeoutSource::new(Duration::from_secs(10)).unwrap());
        let composite = CompositeSource::any(vec![fast, slow]).unwrap();
        let token = Token::new();
        composite.start_monitoring(token.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(token.is_cancelled());
        assert_eq!(token.reason(), Some(Reason::Timeout));
    }

    #[tokio::test]
    async fn all_fires_only_once_every_child_has_fired() {
        let a = Arc::new(TimeoutSource::new(Duration::from_millis(10)).unwrap());
        let b = Arc::new(TimeoutSource::new(Duration::from_millis(80)).unwrap());
        let composite = CompositeSource::all(vec![a, b]).unwrap();
        let token = Token::new();
        composite.start_monitoring(token.clone()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!token.is_cancelled(), "must wait for every child");

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn rejects_empty_child_list() {
        assert!(CompositeSource::any(Vec::new()).is_err());
    }
}
