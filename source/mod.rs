//! Cancellation sources (spec §4.C).
//!
//! A `Source` watches some external condition and, when it fires, cancels
//! the [`Token`](crate::token::Token) it was bound to at
//! `start_monitoring`. The teacher crate has no direct analogue (its
//! `CancellationTokenSource::cancel_after` is the single-purpose ancestor
//! of [`timeout::TimeoutSource`]); the trait here generalizes that one
//! case to the four kinds spec.md §4.C names, plus composition.

pub mod composite;
pub mod predicate;
pub mod signal;
pub mod timeout;

pub use composite::{CompositeMode, CompositeSource};
pub use predicate::PredicateSource;
#[cfg(feature = "resource-metrics")]
pub use predicate::ResourcePredicate;
pub use signal::SignalSource;
pub use timeout::TimeoutSource;

use async_trait::async_trait;

use crate::error::CancellationError;
use crate::token::{Reason, Token};

/// Common contract for every cancellation source (spec §4.C).
#[async_trait]
pub trait Source: Send + Sync {
    /// The reason this source reports when it fires.
    fn reason(&self) -> Reason;

    /// Begins watching, binding to `token`. Exactly-once: implementations
    /// should treat a second call as a no-op (mirrors `Scope::enter`
    /// arming each source exactly once).
    async fn start_monitoring(&self, token: Token) -> Result<(), CancellationError>;

    /// Stops watching; after this returns, no further trigger from this
    /// source will reach the bound token. Safe to call more than once.
    async fn stop_monitoring(&self);

    /// Whether this source has already fired (for post-mortem
    /// introspection — spec §4.D terminal-status derivation probes this).
    fn triggered(&self) -> bool;

    /// Cancels the bound token directly, attributing `message` to this
    /// source's `reason()`. Sources call this on themselves once their
    /// watched condition is met; it is also exposed so a `Scope` can force
    /// a source to report precisely, e.g. in tests.
    async fn trigger_cancellation(&self, token: &Token, message: Option<String>) {
        token.cancel(self.reason(), message).await;
    }
}
