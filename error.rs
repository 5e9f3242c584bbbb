//! Error types for the cancellation framework.
//!
//! Grounded on `examples/EffortlessMetrics-agent-backplane`'s per-crate
//! `thiserror` enums (e.g. `abp-error`): one enum, `#[from]` where a
//! conversion is unambiguous, and a dedicated variant for the cancellation
//! condition itself so callers can match on `Reason` without downcasting.

use crate::token::Reason;

/// Unified error type returned by checkpoints and fallible constructors.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CancellationError {
    /// Raised by a checkpoint (`Token::raise_if_cancelled`, stream
    /// iteration, `Scope::run`) once the bound token has transitioned to
    /// cancelled. Always fatal to the enclosing scope body; never retried
    /// by the core (spec §7).
    #[error("operation cancelled ({reason:?}){}", message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
    Cancelled {
        reason: Reason,
        message: Option<String>,
    },

    /// A source was constructed with an invalid parameter (e.g. a
    /// non-positive timeout or poll interval). Rejected at construction
    /// per spec §8 boundary cases.
    #[error("invalid source configuration: {0}")]
    InvalidConfiguration(String),

    /// The thread→loop bridge's queue was full; this is fed back to
    /// callers who explicitly opt into checking the result via
    /// `Bridge::try_call_soon_threadsafe` rather than treating submission
    /// as fire-and-forget (`Bridge::call_soon_threadsafe` only logs it).
    #[error("bridge queue full, callback dropped")]
    BridgeOverflow,
}

impl CancellationError {
    pub fn cancelled(reason: Reason, message: impl Into<Option<String>>) -> Self {
        CancellationError::Cancelled {
            reason,
            message: message.into(),
        }
    }

    /// True if this error is a cancellation (as opposed to a configuration
    /// or infrastructure error produced by this crate itself).
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CancellationError::Cancelled { .. })
    }

    pub fn reason(&self) -> Option<Reason> {
        match self {
            CancellationError::Cancelled { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, CancellationError>;
