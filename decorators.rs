//! Ergonomic façades wrapping a function in a [`Scope`] (spec §4.G).
//!
//! The teacher crate has no decorator surface (Rust has no `@decorator`
//! syntax); spec §9's Design Notes call for mapping "dynamic callback
//! registration with optional async callables" and source-language
//! decorators onto "an explicit parameter threaded by the wrapper" — so
//! `cancellable`'s Python analogue's "inject the scope by the callee's
//! declared parameter name" becomes "always pass the `Scope` as an
//! explicit argument"; `inject_param_name` is kept only as metadata
//! (surfaced on `OperationContext::metadata`) documenting where a caller
//! *would* bind it, preserving the option's intent without reflection.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use uuid::Uuid;

use crate::error::CancellationError;
use crate::scope::{Scope, ScopeBuilder};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Options for [`cancellable`] (spec §4.G).
#[derive(Clone)]
pub struct CancellableOptions {
    pub timeout: Option<Duration>,
    pub id: Option<Uuid>,
    pub name: Option<String>,
    pub register: bool,
    pub inject_param_name: String,
}

impl Default for CancellableOptions {
    fn default() -> Self {
        CancellableOptions {
            timeout: None,
            id: None,
            name: None,
            register: false,
            inject_param_name: "cancellable".to_string(),
        }
    }
}

fn build_scope(options: &CancellableOptions) -> Result<Scope, CancellationError> {
    let mut builder = match options.timeout {
        Some(duration) => ScopeBuilder::with_timeout(duration)?,
        None => ScopeBuilder::new(),
    };
    if let Some(id) = options.id {
        builder = builder.id(id);
    }
    if let Some(name) = options.name.clone() {
        builder = builder.name(name);
    }
    builder = builder
        .register_globally(options.register)
        .metadata("inject_param_name", options.inject_param_name.clone());
    Ok(builder.build())
}

/// Wraps `body` to run inside a freshly constructed [`Scope`] every time
/// the returned closure is called (spec §4.G `cancellable`).
pub fn cancellable<F, Fut, T>(
    options: CancellableOptions,
    body: F,
) -> impl Fn() -> BoxFuture<Result<T, CancellationError>>
where
    F: Fn(Scope) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<T, CancellationError>> + Send + 'static,
    T: Send + 'static,
{
    move || {
        let options = options.clone();
        let body = body.clone();
        Box::pin(async move {
            let scope = build_scope(&options)?;
            scope.run(body).await
        })
    }
}

/// Like [`cancellable`], but defaults `name` to `"{Type}.{method}"` when
/// unset, mirroring the source's per-method default naming (spec §4.G
/// `cancellable_method`).
pub fn cancellable_method<C, F, Fut, T>(
    method: &str,
    mut options: CancellableOptions,
    body: F,
) -> impl Fn() -> BoxFuture<Result<T, CancellationError>>
where
    F: Fn(Scope) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<T, CancellationError>> + Send + 'static,
    T: Send + 'static,
{
    if options.name.is_none() {
        let type_name = std::any::type_name::<C>().rsplit("::").next().unwrap_or("Unknown");
        options.name = Some(format!("{type_name}.{method}"));
    }
    cancellable(options, body)
}

/// One-shot convenience: runs `coro` inside `Scope::with_timeout(duration)`
/// (spec §4.G `with_timeout`).
pub async fn with_timeout<F, Fut, T>(duration: Duration, coro: F) -> Result<T, CancellationError>
where
    F: FnOnce(Scope) -> Fut,
    Fut: Future<Output = Result<T, CancellationError>>,
{
    let scope = ScopeBuilder::with_timeout(duration)?.build();
    scope.run(coro).await
}

/// Injects the task-local current operation into `body` (spec §4.G
/// `with_current_operation`).
pub async fn with_current_operation<F, Fut, T>(body: F) -> T
where
    F: FnOnce(Option<Scope>) -> Fut,
    Fut: Future<Output = T>,
{
    let current = Scope::current().await;
    body(current).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::ScopeStatus;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn cancellable_wraps_body_in_fresh_scope_each_call() {
        let wrapped = cancellable(CancellableOptions::default(), |s: Scope| async move {
            Ok::<_, CancellationError>(s.id())
        });
        let first = wrapped().await.unwrap();
        let second = wrapped().await.unwrap();
        assert_ne!(first, second, "each call gets a fresh scope");
    }

    #[tokio::test]
    async fn cancellable_honors_timeout() {
        let wrapped = cancellable(
            CancellableOptions {
                timeout: Some(StdDuration::from_millis(20)),
                ..Default::default()
            },
            |s: Scope| async move {
                loop {
                    s.token().raise_if_cancelled()?;
                    tokio::time::sleep(StdDuration::from_millis(5)).await;
                }
            },
        );
        let result: Result<(), CancellationError> = wrapped().await;
        assert!(result.is_err());
    }

    struct Widget;

    #[tokio::test]
    async fn cancellable_method_defaults_name() {
        let seen_name = std::sync::Arc::new(std::sync::Mutex::new(None));
        let seen_name2 = seen_name.clone();
        let wrapped = cancellable_method::<Widget, _, _, _>(
            "render",
            CancellableOptions::default(),
            move |s: Scope| {
                let seen_name2 = seen_name2.clone();
                async move {
                    *seen_name2.lock().unwrap() = s.name().map(|n| n.to_string());
                    Ok::<_, CancellationError>(())
                }
            },
        );
        wrapped().await.unwrap();
        assert_eq!(seen_name.lock().unwrap().as_deref(), Some("Widget.render"));
    }

    #[tokio::test]
    async fn with_timeout_convenience_times_out() {
        let result: Result<(), CancellationError> =
            with_timeout(StdDuration::from_millis(20), |s| async move {
                loop {
                    s.token().raise_if_cancelled()?;
                    tokio::time::sleep(StdDuration::from_millis(5)).await;
                }
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn with_current_operation_sees_nothing_outside_a_scope() {
        let seen = with_current_operation(|current| async move { current.is_none() }).await;
        assert!(seen);
    }

    #[tokio::test]
    async fn with_current_operation_sees_enclosing_scope() {
        let scope = Scope::builder().name("outer").build();
        let id = scope
            .run(|s| async move {
                let seen = with_current_operation(|current| async move { current.map(|c| c.id()) }).await;
                Ok::<_, CancellationError>(seen)
            })
            .await
            .unwrap();
        assert_eq!(id, Some(scope.id()));
        assert_eq!(scope.status(), ScopeStatus::Completed);
    }
}
