//! The hierarchical, lifecycled operation (spec §3/§4.D) — the user-facing
//! object of this crate.
//!
//! The teacher (`examples/dgrunwald-rust-cancellation`) has no scope
//! concept at all; it only has a token plus a synchronous `run()` helper
//! that wires a single `on_cancel` callback to a body closure. `Scope`
//! generalizes that single wiring into the full lifecycle spec.md
//! describes: callback *tables* (not one callback), a cancel *region*,
//! children, attached sources, registry membership, and a terminal-status
//! contract. The shape of that generalization — a builder for
//! construction, an RAII-style guard for the entered region, and an
//! explicit terminal snapshot — follows the structured config/session
//! objects in `examples/EffortlessMetrics-agent-backplane`'s core crates.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::CancellationError;
use crate::source::{CompositeSource, PredicateSource, SignalSource, Source, TimeoutSource};
use crate::token::{Reason, Token};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
type ContextCallback = Arc<dyn Fn(OperationContext) -> BoxFuture<'static, ()> + Send + Sync>;
type ProgressCallback = Arc<dyn Fn(ProgressEvent) -> BoxFuture<'static, ()> + Send + Sync>;

tokio::task_local! {
    static CURRENT_SCOPE: Scope;
}

/// Lifecycle status of a [`Scope`] (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScopeStatus {
    Pending,
    Running,
    /// Transient sub-status of a nested shielded region; never the final
    /// terminal status of the scope that entered it (spec §3, §4.D).
    Shielded,
    Completed,
    Failed,
    Cancelled,
}

/// A progress notification fanned out to `on_progress` callbacks (spec
/// §4.D `report_progress`).
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub scope_id: Uuid,
    pub message: String,
    pub metadata: Option<Value>,
}

/// Observation snapshot of a [`Scope`] (spec §3 `OperationContext`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationContext {
    pub id: Uuid,
    pub name: Option<String>,
    pub parent_id: Option<Uuid>,
    pub metadata: serde_json::Map<String, Value>,
    pub status: ScopeStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub cancel_reason: Option<Reason>,
    pub cancel_message: Option<String>,
    pub error: Option<String>,
    pub partial_result: Option<Value>,
}

impl OperationContext {
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            ScopeStatus::Completed | ScopeStatus::Failed | ScopeStatus::Cancelled
        )
    }
}

struct Callbacks {
    start: Mutex<Vec<ContextCallback>>,
    complete: Mutex<Vec<ContextCallback>>,
    cancel: Mutex<Vec<ContextCallback>>,
    error: Mutex<Vec<ContextCallback>>,
    progress: Mutex<Vec<ProgressCallback>>,
}

impl Default for Callbacks {
    fn default() -> Self {
        Callbacks {
            start: Mutex::new(Vec::new()),
            complete: Mutex::new(Vec::new()),
            cancel: Mutex::new(Vec::new()),
            error: Mutex::new(Vec::new()),
            progress: Mutex::new(Vec::new()),
        }
    }
}

async fn fire_context(list: &Mutex<Vec<ContextCallback>>, ctx: &OperationContext) {
    let callbacks = list.lock().unwrap().clone();
    for cb in callbacks {
        let fut = AssertUnwindSafe(cb(ctx.clone()));
        if fut.catch_unwind().await.is_err() {
            tracing::error!(scope_id = %ctx.id, "scope callback panicked; swallowed");
        }
    }
}

struct ScopeInner {
    id: Uuid,
    name: Option<String>,
    parent: Option<Weak<ScopeInner>>,
    children: Mutex<Vec<Weak<ScopeInner>>>,
    metadata: Mutex<serde_json::Map<String, Value>>,
    token: Token,
    sources: Vec<Arc<dyn Source>>,
    combined: bool,
    component_tokens: Vec<Token>,
    register_globally: bool,
    callbacks: Callbacks,
    status: Mutex<ScopeStatus>,
    start_time: Mutex<Option<DateTime<Utc>>>,
    end_time: Mutex<Option<DateTime<Utc>>>,
    cancel_info: Mutex<Option<(Reason, Option<String>)>>,
    error_text: Mutex<Option<String>>,
    partial_result: Mutex<Option<Value>>,
}

/// A bounded, lifecycled operation: owns a token, a list of attached
/// sources, children, and callback tables (spec §3/§4.D). Cheaply
/// `Clone`-able (an `Arc` wrapper).
#[derive(Clone)]
pub struct Scope(Arc<ScopeInner>);

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.0.id)
            .field("name", &self.0.name)
            .field("status", &*self.0.status.lock().unwrap())
            .finish()
    }
}

impl Scope {
    pub fn builder() -> ScopeBuilder {
        ScopeBuilder::new()
    }

    pub fn id(&self) -> Uuid {
        self.0.id
    }

    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }

    pub fn token(&self) -> &Token {
        &self.0.token
    }

    pub fn status(&self) -> ScopeStatus {
        *self.0.status.lock().unwrap()
    }

    /// The task-local currently-entered scope, if any (spec §6
    /// "task-local current operation").
    pub async fn current() -> Option<Scope> {
        CURRENT_SCOPE.try_with(|s| s.clone()).ok()
    }

    fn parent(&self) -> Option<Scope> {
        self.0.parent.as_ref().and_then(Weak::upgrade).map(Scope)
    }

    fn live_children(&self) -> Vec<Scope> {
        let mut children = self.0.children.lock().unwrap();
        children.retain(|w| w.strong_count() > 0);
        children.iter().filter_map(Weak::upgrade).map(Scope).collect()
    }

    fn add_child(&self, child: &Scope) {
        self.0.children.lock().unwrap().push(Arc::downgrade(&child.0));
    }

    fn remove_child(&self, child: &Scope) {
        self.0
            .children
            .lock()
            .unwrap()
            .retain(|w| w.upgrade().map(|s| s.id()) != Some(child.id()));
    }

    pub fn context(&self) -> OperationContext {
        let (cancel_reason, cancel_message) = self
            .0
            .cancel_info
            .lock()
            .unwrap()
            .clone()
            .map(|(r, m)| (Some(r), m))
            .unwrap_or((None, None));
        OperationContext {
            id: self.0.id,
            name: self.0.name.clone(),
            parent_id: self.parent().map(|p| p.id()),
            metadata: self.0.metadata.lock().unwrap().clone(),
            status: *self.0.status.lock().unwrap(),
            start_time: *self.0.start_time.lock().unwrap(),
            end_time: *self.0.end_time.lock().unwrap(),
            cancel_reason,
            cancel_message,
            error: self.0.error_text.lock().unwrap().clone(),
            partial_result: self.0.partial_result.lock().unwrap().clone(),
        }
    }

    /// Registers a metadata-only snapshot update produced by a stream
    /// wrapper or other internal collaborator (spec §4.F "writes a
    /// `partial_result` ... into the scope's context").
    pub(crate) fn set_partial_result(&self, value: Value) {
        *self.0.partial_result.lock().unwrap() = Some(value);
    }

    pub async fn report_progress(&self, message: impl Into<String>, metadata: Option<Value>) {
        let event = ProgressEvent {
            scope_id: self.0.id,
            message: message.into(),
            metadata,
        };
        let callbacks = self.0.callbacks.progress.lock().unwrap().clone();
        for cb in callbacks {
            let fut = AssertUnwindSafe(cb(event.clone()));
            if fut.catch_unwind().await.is_err() {
                tracing::error!(scope_id = %self.0.id, "progress callback panicked; swallowed");
            }
        }
    }

    pub fn on_start<F, Fut>(&self, cb: F) -> Scope
    where
        F: Fn(OperationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.0.callbacks.start.lock().unwrap().push(wrap_context_cb(cb));
        self.clone()
    }

    pub fn on_complete<F, Fut>(&self, cb: F) -> Scope
    where
        F: Fn(OperationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.0.callbacks.complete.lock().unwrap().push(wrap_context_cb(cb));
        self.clone()
    }

    pub fn on_cancel<F, Fut>(&self, cb: F) -> Scope
    where
        F: Fn(OperationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.0.callbacks.cancel.lock().unwrap().push(wrap_context_cb(cb));
        self.clone()
    }

    pub fn on_error<F, Fut>(&self, cb: F) -> Scope
    where
        F: Fn(OperationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.0.callbacks.error.lock().unwrap().push(wrap_context_cb(cb));
        self.clone()
    }

    pub fn on_progress<F, Fut>(&self, cb: F) -> Scope
    where
        F: Fn(ProgressEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.0
            .callbacks
            .progress
            .lock()
            .unwrap()
            .push(Arc::new(move |e| Box::pin(cb(e)) as BoxFuture<'static, ()>));
        self.clone()
    }

    /// Cancels this scope's token with reason `MANUAL`, propagating to
    /// children by default (spec §4.D).
    pub async fn cancel(&self, message: Option<String>) -> bool {
        self.cancel_with_reason(Reason::Manual, message, true).await
    }

    pub async fn cancel_with_reason(&self, reason: Reason, message: Option<String>, propagate: bool) -> bool {
        let did = self.0.token.cancel(reason, message).await;
        if propagate {
            for child in self.live_children() {
                let msg = Some(format!("parent scope {} cancelled", self.0.id));
                Box::pin(child.cancel_with_reason(Reason::Parent, msg, true)).await;
            }
        }
        did
    }

    /// Enters the scope's lifecycle: registers, installs parent/combined
    /// linking, arms every attached source (spec §4.D `enter`). Returns a
    /// guard whose `exit` must be called on every path out of the body —
    /// [`Scope::run`] does this for you.
    pub async fn enter(&self) -> ScopeGuard {
        *self.0.status.lock().unwrap() = ScopeStatus::Running;
        *self.0.start_time.lock().unwrap() = Some(Utc::now());

        if self.0.register_globally {
            crate::registry::Registry::global().register(self.clone()).await;
        }

        if let Some(parent) = self.parent() {
            parent.add_child(self);
            // Child adopts PARENT on parent cancellation (preserve_reason = false).
            self.0.token.link(&parent.0.token, false).await;
        }
        if self.0.combined {
            // Combined scope surfaces the real firing component (preserve_reason = true).
            for component in &self.0.component_tokens {
                self.0.token.link(component, true).await;
            }
        }

        for source in &self.0.sources {
            if let Err(err) = source.start_monitoring(self.0.token.clone()).await {
                tracing::error!(scope_id = %self.0.id, "failed to arm source: {err}");
            }
        }

        tracing::debug!(scope_id = %self.0.id, name = ?self.0.name, "scope entered");
        fire_context(&self.0.callbacks.start, &self.context()).await;
        ScopeGuard { scope: self.clone() }
    }

    /// Runs `body` inside this scope's lifecycle end-to-end: enters,
    /// publishes the task-local current operation, derives terminal
    /// status from the outcome, and exits on every path (spec §4.D,
    /// §4.G). This is the primary ergonomic entry point; `enter`/`exit`
    /// are exposed separately for callers that need finer control.
    pub async fn run<F, Fut, T>(&self, body: F) -> Result<T, CancellationError>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = Result<T, CancellationError>>,
    {
        let scope = self.clone();
        CURRENT_SCOPE
            .scope(scope.clone(), async move {
                let guard = scope.enter().await;
                let outcome = body(scope.clone()).await;
                guard.exit(outcome).await
            })
            .await
    }

    /// A nested sub-region that suppresses cancellation propagation for
    /// its duration, then forces a single cooperative checkpoint on exit
    /// (spec §4.D "Shielding").
    pub fn shield(&self) -> ShieldGuard {
        let child = ScopeBuilder::new()
            .name(format!(
                "{}.shield",
                self.0.name.clone().unwrap_or_else(|| self.0.id.to_string())
            ))
            .build_detached();
        ShieldGuard {
            parent: self.clone(),
            child,
        }
    }

    /// Returns a new scope whose source list is the concatenation of both
    /// inputs'. Does not alter either input. Links to both components'
    /// tokens with `preserve_reason = true` on entry (spec §4.D
    /// `combine`). This is the canonical `AnyOf` composition at the scope
    /// level — see [`crate::source::CompositeSource`] for composing raw
    /// sources, including `AllOf`.
    pub fn combine(&self, other: &Scope) -> Scope {
        let mut sources = self.0.sources.clone();
        sources.extend(other.0.sources.iter().cloned());
        ScopeBuilder::new()
            .name(format!(
                "combine({}, {})",
                self.0.name.clone().unwrap_or_else(|| self.0.id.to_string()),
                other.0.name.clone().unwrap_or_else(|| other.0.id.to_string())
            ))
            .sources_raw(sources)
            .component_token(self.0.token.clone())
            .component_token(other.0.token.clone())
            .combined(true)
            .build_detached()
    }

    /// Returns a wrapped async function that runs `f` inside this scope
    /// every time it's called (spec §4.D `wrap`). Unlike
    /// [`crate::decorators::cancellable`], which builds a fresh `Scope` per
    /// call, `wrap` always re-enters this same scope — so it's only
    /// meaningful to call the wrapped function once per scope instance
    /// (mirrors `run`, which it's built on).
    pub fn wrap<F, Fut, T>(&self, f: F) -> impl Fn() -> BoxFuture<'static, Result<T, CancellationError>>
    where
        F: Fn(Scope) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<T, CancellationError>> + Send + 'static,
        T: Send + 'static,
    {
        let scope = self.clone();
        move || {
            let scope = scope.clone();
            let f = f.clone();
            Box::pin(async move { scope.run(f).await })
        }
    }

    /// Wraps `iter` as a cancellable, checkpointed, progress-reporting
    /// stream bound to this scope (spec §4.D `stream`, §4.F).
    pub fn stream<S, T>(
        &self,
        iter: S,
        report_every: Option<u64>,
        buffer_partial: bool,
    ) -> impl futures::Stream<Item = Result<T, CancellationError>>
    where
        S: futures::Stream<Item = T> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        crate::stream::cancellable_stream(self, iter, report_every, buffer_partial)
    }

    /// Chunked variant of [`Scope::stream`] (spec §4.F "Chunked variant").
    pub fn stream_chunked<S, T>(
        &self,
        iter: S,
        chunk_size: usize,
        report_every_chunks: Option<u64>,
        buffer_partial: bool,
    ) -> impl futures::Stream<Item = Result<Vec<T>, CancellationError>>
    where
        S: futures::Stream<Item = T> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        crate::stream::cancellable_stream_chunked(self, iter, chunk_size, report_every_chunks, buffer_partial)
    }

    fn derive_cancel_reason(&self, err: &CancellationError) -> (Reason, Option<String>) {
        if let Some(reason) = self.0.token.reason() {
            return (reason, self.0.token.message());
        }
        if let Some(source) = self.0.sources.iter().find(|s| s.triggered()) {
            if let CancellationError::Cancelled { message, .. } = err {
                return (source.reason(), message.clone());
            }
            return (source.reason(), None);
        }
        match err {
            CancellationError::Cancelled { reason, message } => (*reason, message.clone()),
            _ => (Reason::Manual, None),
        }
    }
}

fn wrap_context_cb<F, Fut>(cb: F) -> ContextCallback
where
    F: Fn(OperationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(cb(ctx)) as BoxFuture<'static, ()>)
}

/// Guard returned by [`Scope::enter`]. `exit` must run on every path out
/// of the scope body so the cancel-region is always closed (spec §4.D).
pub struct ScopeGuard {
    scope: Scope,
}

impl ScopeGuard {
    /// Tears the scope down: stops sources in reverse registration order,
    /// derives and records the terminal status from `outcome`, fires the
    /// matching callback table, unregisters from the registry (moving a
    /// snapshot into history), and detaches from the parent's children
    /// set. `outcome` is returned unchanged — cancellation and user
    /// failures always propagate past the scope boundary (spec §4.D, §7).
    pub async fn exit<T>(self, outcome: Result<T, CancellationError>) -> Result<T, CancellationError> {
        let scope = self.scope;

        for source in scope.0.sources.iter().rev() {
            source.stop_monitoring().await;
        }

        *scope.0.end_time.lock().unwrap() = Some(Utc::now());

        match &outcome {
            Ok(_) => {
                *scope.0.status.lock().unwrap() = ScopeStatus::Completed;
                tracing::debug!(scope_id = %scope.0.id, "scope completed");
                fire_context(&scope.0.callbacks.complete, &scope.context()).await;
            }
            Err(err) if err.is_cancelled() => {
                let (reason, message) = scope.derive_cancel_reason(err);
                *scope.0.cancel_info.lock().unwrap() = Some((reason, message));
                *scope.0.status.lock().unwrap() = ScopeStatus::Cancelled;
                tracing::debug!(scope_id = %scope.0.id, %reason, "scope cancelled");
                fire_context(&scope.0.callbacks.cancel, &scope.context()).await;
            }
            Err(err) => {
                *scope.0.error_text.lock().unwrap() = Some(err.to_string());
                *scope.0.status.lock().unwrap() = ScopeStatus::Failed;
                tracing::debug!(scope_id = %scope.0.id, "scope failed: {err}");
                fire_context(&scope.0.callbacks.error, &scope.context()).await;
            }
        }

        if scope.0.register_globally {
            crate::registry::Registry::global().unregister(scope.id()).await;
        }
        if let Some(parent) = scope.parent() {
            parent.remove_child(&scope);
        }

        outcome
    }
}

/// Guard returned by [`Scope::shield`].
pub struct ShieldGuard {
    parent: Scope,
    child: Scope,
}

impl ShieldGuard {
    pub async fn run<F, Fut, T>(self, body: F) -> Result<T, CancellationError>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = Result<T, CancellationError>>,
    {
        let guard = self.child.enter().await;
        // `enter()` unconditionally writes `Running`; re-assert the
        // transient `Shielded` sub-status for the body's duration. `exit`
        // below overwrites this with the real terminal status regardless,
        // so there's nothing to restore afterwards.
        *self.child.0.status.lock().unwrap() = ScopeStatus::Shielded;
        let outcome = body(self.child.clone()).await;
        let outcome = guard.exit(outcome).await;
        // Forced cooperative checkpoint: whatever cancellation was pending
        // on the parent during the shielded body now materialises here,
        // per spec ("a cooperative checkpoint is forced on exit").
        self.parent.0.token.raise_if_cancelled()?;
        outcome
    }
}

/// Builder for [`Scope`] (spec §4.D "Construction options").
#[derive(Default)]
pub struct ScopeBuilder {
    id: Option<Uuid>,
    name: Option<String>,
    parent: Option<Scope>,
    metadata: serde_json::Map<String, Value>,
    register_globally: bool,
    sources: Vec<Arc<dyn Source>>,
    token: Option<Token>,
    component_tokens: Vec<Token>,
    combined: bool,
}

impl ScopeBuilder {
    pub fn new() -> Self {
        ScopeBuilder::default()
    }

    pub fn id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn parent(mut self, parent: &Scope) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn register_globally(mut self, yes: bool) -> Self {
        self.register_globally = yes;
        self
    }

    fn source(mut self, source: Arc<dyn Source>) -> Self {
        self.sources.push(source);
        self
    }

    fn sources_raw(mut self, sources: Vec<Arc<dyn Source>>) -> Self {
        self.sources = sources;
        self
    }

    fn component_token(mut self, token: Token) -> Self {
        self.component_tokens.push(token);
        self
    }

    fn combined(mut self, yes: bool) -> Self {
        self.combined = yes;
        self
    }

    /// Attaches a timeout source (spec §4.D `with_timeout`).
    pub fn with_timeout(duration: std::time::Duration) -> Result<Self, CancellationError> {
        let source = TimeoutSource::new(duration)?;
        Ok(ScopeBuilder::new().source(Arc::new(source)))
    }

    /// Replaces the scope's default token with `token` (spec §4.D
    /// `with_token`).
    pub fn with_token(token: Token) -> Self {
        let mut builder = ScopeBuilder::new();
        builder.token = Some(token);
        builder
    }

    /// Attaches a signal source (spec §4.D `with_signal`).
    pub fn with_signal(signals: impl IntoIterator<Item = crate::source::signal::SignalNumber>) -> Self {
        ScopeBuilder::new().source(Arc::new(SignalSource::new(signals)))
    }

    /// Attaches a predicate/condition source (spec §4.D `with_condition`).
    pub fn with_condition<F, Fut>(
        condition_name: impl Into<String>,
        interval: std::time::Duration,
        predicate: F,
    ) -> Result<Self, CancellationError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let source = PredicateSource::new_async(condition_name, interval, predicate)?;
        Ok(ScopeBuilder::new().source(Arc::new(source)))
    }

    /// Attaches an arbitrary pre-built source (e.g. a
    /// [`CompositeSource`]).
    pub fn with_source(source: Arc<dyn Source>) -> Self {
        ScopeBuilder::new().source(source)
    }

    pub fn build(self) -> Scope {
        let parent_weak = self.parent.as_ref().map(|p| Arc::downgrade(&p.0));
        Scope(Arc::new(ScopeInner {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            name: self.name,
            parent: parent_weak,
            children: Mutex::new(Vec::new()),
            metadata: Mutex::new(self.metadata),
            token: self.token.unwrap_or_default(),
            sources: self.sources,
            combined: self.combined,
            component_tokens: self.component_tokens,
            register_globally: self.register_globally,
            callbacks: Callbacks::default(),
            status: Mutex::new(ScopeStatus::Pending),
            start_time: Mutex::new(None),
            end_time: Mutex::new(None),
            cancel_info: Mutex::new(None),
            error_text: Mutex::new(None),
            partial_result: Mutex::new(None),
        }))
    }

    /// Like [`Self::build`], but ignores any `parent` set on the builder
    /// (used by `combine`/`shield`, which manage parent/child relations
    /// explicitly rather than through the normal parent-link path).
    fn build_detached(mut self) -> Scope {
        self.parent = None;
        self.build()
    }
}

#[allow(dead_code)]
fn _assert_send_sync()
where
    HashMap<Uuid, Scope>: Send,
{
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn completes_normally() {
        let scope = Scope::builder().name("normal").build();
        let result = scope.run(|_s| async { Ok::<_, CancellationError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(scope.status(), ScopeStatus::Completed);
    }

    #[tokio::test]
    async fn records_failure_without_swallowing() {
        let scope = Scope::builder().name("fails").build();
        let result: Result<i32, CancellationError> = scope
            .run(|_s| async { Err(CancellationError::InvalidConfiguration("boom".into())) })
            .await;
        assert!(result.is_err());
        assert_eq!(scope.status(), ScopeStatus::Failed);
        assert!(scope.context().error.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn timeout_cancels_with_reason() {
        let scope = ScopeBuilder::with_timeout(Duration::from_millis(20))
            .unwrap()
            .name("timeout")
            .build();
        let result: Result<(), CancellationError> = scope
            .run(|s| async move {
                loop {
                    s.token().raise_if_cancelled()?;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(scope.status(), ScopeStatus::Cancelled);
        assert_eq!(scope.context().cancel_reason, Some(Reason::Timeout));
    }

    #[tokio::test]
    async fn manual_cancel_beats_timeout() {
        let scope = ScopeBuilder::with_timeout(Duration::from_secs(5))
            .unwrap()
            .name("manual-beats-timeout")
            .build();
        let scope_for_body = scope.clone();
        let canceller = scope.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel(Some("stop".into())).await;
        });
        let result: Result<(), CancellationError> = scope_for_body
            .run(|s| async move {
                loop {
                    s.token().raise_if_cancelled()?;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(scope.context().cancel_reason, Some(Reason::Manual));
        assert_eq!(scope.context().cancel_message, Some("stop".into()));
    }

    #[tokio::test]
    async fn parent_cancellation_propagates_to_child() {
        let parent = Scope::builder().name("parent").build();
        let parent_guard = parent.enter().await;
        let child = Scope::builder().name("child").parent(&parent).build();
        let child_guard = child.enter().await;

        parent.cancel(None).await;
        tokio::task::yield_now().await;

        assert!(child.token().is_cancelled());
        assert_eq!(child.token().reason(), Some(Reason::Parent));

        let _ = child_guard
            .exit(Err::<(), _>(CancellationError::cancelled(Reason::Parent, None)))
            .await;
        let _ = parent_guard.exit(Ok::<_, CancellationError>(())).await;
    }

    #[tokio::test]
    async fn combine_surfaces_firing_component_reason() {
        let timeout_scope = ScopeBuilder::with_timeout(Duration::from_secs(5)).unwrap().build();
        let token_scope = ScopeBuilder::with_token(Token::new()).build();
        let combined = timeout_scope.combine(&token_scope);

        let combined_for_body = combined.clone();
        let canceller = token_scope.token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel(Reason::Manual, Some("stop".into())).await;
        });

        let result: Result<(), CancellationError> = combined_for_body
            .run(|s| async move {
                loop {
                    s.token().raise_if_cancelled()?;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(combined.context().cancel_reason, Some(Reason::Manual));
    }

    #[tokio::test]
    async fn shield_suppresses_then_forces_checkpoint() {
        let scope = Scope::builder().name("shielded-op").build();
        scope.cancel(Some("outer cancel".into())).await;

        let ran_to_completion = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran2 = ran_to_completion.clone();
        let result: Result<(), CancellationError> = scope
            .shield()
            .run(|_s| async move {
                ran2.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(ran_to_completion.load(std::sync::atomic::Ordering::SeqCst));
        assert!(result.is_err(), "pending cancellation must surface at shield exit");
    }

    #[tokio::test]
    async fn wrap_runs_body_inside_this_scope() {
        let scope = Scope::builder().name("wrapped").build();
        let wrapped = scope.wrap(|s: Scope| async move { Ok::<_, CancellationError>(s.id()) });
        let seen = wrapped().await.unwrap();
        assert_eq!(seen, scope.id());
        assert_eq!(scope.status(), ScopeStatus::Completed);
    }

    #[tokio::test]
    async fn current_scope_is_published_during_run() {
        let scope = Scope::builder().name("current").build();
        let seen = scope
            .run(|s| async move {
                let current = Scope::current().await;
                Ok::<_, CancellationError>(current.map(|c| c.id()) == Some(s.id()))
            })
            .await
            .unwrap();
        assert!(seen);
        assert!(Scope::current().await.is_none());
    }
}
