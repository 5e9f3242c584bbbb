//! Process-wide operation registry (spec §4.E).
//!
//! Grounded on `examples/original_source/src/hother/cancelable/core/
//! registry.py`: a live map plus a bounded FIFO history, filtered listing,
//! bulk cancel, cleanup, and a statistics summary. The teacher crate has
//! no registry (it has no concept of multiple concurrently-tracked
//! operations at all); this whole module is new surface built in the
//! "single synchronized object with explicit init/teardown" idiom spec §9
//! calls for process-wide state, the same shape `bridge.rs`'s
//! `OnceLock`-backed singleton uses.

use std::collections::{HashMap, VecDeque};
use std::sync::OnceLock;

use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::scope::{OperationContext, Scope, ScopeStatus};
use crate::token::Reason;

/// Default history capacity (spec §3 "default cap 1000").
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

struct State {
    live: HashMap<Uuid, Scope>,
    history: VecDeque<OperationContext>,
    history_capacity: usize,
}

/// Process-wide index of live [`Scope`]s and a bounded history of terminal
/// snapshots (spec §3, §4.E).
pub struct Registry {
    state: Mutex<State>,
}

fn global() -> &'static Registry {
    static INSTANCE: OnceLock<Registry> = OnceLock::new();
    INSTANCE.get_or_init(|| Registry {
        state: Mutex::new(State {
            live: HashMap::new(),
            history: VecDeque::new(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }),
    })
}

/// Breakdown produced by [`Registry::statistics`] (spec §4.E
/// `statistics()`).
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStatistics {
    pub active_by_status: HashMap<String, usize>,
    pub history_by_status: HashMap<String, usize>,
    pub average_success_duration_ms: Option<f64>,
    pub total_successes: usize,
}

fn status_key(status: ScopeStatus) -> &'static str {
    match status {
        ScopeStatus::Pending => "pending",
        ScopeStatus::Running => "running",
        ScopeStatus::Shielded => "shielded",
        ScopeStatus::Completed => "completed",
        ScopeStatus::Failed => "failed",
        ScopeStatus::Cancelled => "cancelled",
    }
}

impl Registry {
    pub fn global() -> &'static Registry {
        global()
    }

    /// Sets the history capacity. Test/config hook; evicts oldest entries
    /// immediately if the new capacity is smaller.
    pub async fn set_history_capacity(&self, capacity: usize) {
        let mut state = self.state.lock().await;
        state.history_capacity = capacity;
        while state.history.len() > capacity {
            state.history.pop_front();
        }
    }

    pub async fn register(&self, scope: Scope) {
        let mut state = self.state.lock().await;
        state.live.insert(scope.id(), scope);
    }

    /// Unregisters `id`, pushing a deep snapshot of its final context into
    /// history (spec §4.E). No-op if `id` isn't live.
    pub async fn unregister(&self, id: Uuid) {
        let mut state = self.state.lock().await;
        if let Some(scope) = state.live.remove(&id) {
            let context = scope.context();
            if state.history.len() >= state.history_capacity {
                state.history.pop_front();
            }
            state.history.push_back(context);
        }
    }

    pub async fn get(&self, id: Uuid) -> Option<Scope> {
        self.state.lock().await.live.get(&id).cloned()
    }

    /// Filtered live view. Copies the live table under the lock, then
    /// filters on the copy (spec §5 "iteration copies the live table under
    /// the lock then works on the copy").
    pub async fn list(
        &self,
        status: Option<ScopeStatus>,
        parent_id: Option<Uuid>,
        name_substring: Option<&str>,
    ) -> Vec<OperationContext> {
        let snapshot: Vec<Scope> = self.state.lock().await.live.values().cloned().collect();
        snapshot
            .into_iter()
            .map(|s| s.context())
            .filter(|ctx| status.is_none_or(|s| ctx.status == s))
            .filter(|ctx| parent_id.is_none_or(|p| ctx.parent_id == Some(p)))
            .filter(|ctx| {
                name_substring.is_none_or(|needle| {
                    ctx.name.as_deref().map(|n| n.contains(needle)).unwrap_or(false)
                })
            })
            .collect()
    }

    /// Resolves and cancels a single scope (spec §4.E `cancel_one`).
    /// Returns `false` if `id` isn't live.
    pub async fn cancel_one(&self, id: Uuid, reason: Reason, message: Option<String>) -> bool {
        let scope = self.state.lock().await.live.get(&id).cloned();
        match scope {
            Some(scope) => scope.cancel_with_reason(reason, message, true).await,
            None => false,
        }
    }

    /// Cancels every live scope matching `status` concurrently (spec §4.E
    /// `cancel_all`). Per-scope failures can't really happen here (cancel
    /// is infallible), so the returned count is simply how many scopes
    /// were attempted.
    pub async fn cancel_all(&self, status: Option<ScopeStatus>, reason: Reason, message: Option<String>) -> usize {
        let snapshot: Vec<Scope> = self
            .state
            .lock()
            .await
            .live
            .values()
            .filter(|s| status.is_none_or(|want| s.status() == want))
            .cloned()
            .collect();
        let count = snapshot.len();
        let mut tasks = Vec::with_capacity(count);
        for scope in snapshot {
            let message = message.clone();
            tasks.push(tokio::spawn(
                async move { scope.cancel_with_reason(reason, message, true).await },
            ));
        }
        for task in tasks {
            if let Err(err) = task.await {
                tracing::error!("cancel_all: a scope cancellation task failed: {err}");
            }
        }
        count
    }

    pub async fn history(
        &self,
        limit: Option<usize>,
        status: Option<ScopeStatus>,
        since: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Vec<OperationContext> {
        let state = self.state.lock().await;
        let mut results: Vec<OperationContext> = state
            .history
            .iter()
            .rev()
            .filter(|ctx| status.is_none_or(|s| ctx.status == s))
            .filter(|ctx| since.is_none_or(|ts| ctx.end_time.map(|e| e >= ts).unwrap_or(false)))
            .cloned()
            .collect();
        if let Some(limit) = limit {
            results.truncate(limit);
        }
        results
    }

    /// Moves terminal live scopes into history (spec §4.E
    /// `cleanup_completed`). If `keep_failed`, `FAILED` scopes are left
    /// live. Returns the number moved.
    pub async fn cleanup_completed(
        &self,
        older_than: Option<chrono::Duration>,
        keep_failed: bool,
    ) -> usize {
        let now = chrono::Utc::now();
        let ids: Vec<Uuid> = {
            let state = self.state.lock().await;
            state
                .live
                .values()
                .filter(|s| {
                    let ctx = s.context();
                    if !ctx.is_terminal() {
                        return false;
                    }
                    if keep_failed && ctx.status == ScopeStatus::Failed {
                        return false;
                    }
                    match (older_than, ctx.end_time) {
                        (Some(age), Some(end)) => now - end >= age,
                        (Some(_), None) => false,
                        (None, _) => true,
                    }
                })
                .map(|s| s.id())
                .collect()
        };
        for id in &ids {
            self.unregister(*id).await;
        }
        ids.len()
    }

    pub async fn statistics(&self) -> RegistryStatistics {
        let state = self.state.lock().await;
        let mut stats = RegistryStatistics::default();
        for scope in state.live.values() {
            *stats
                .active_by_status
                .entry(status_key(scope.status()).to_string())
                .or_insert(0) += 1;
        }
        let mut total_success_ms = 0.0;
        for ctx in &state.history {
            *stats.history_by_status.entry(status_key(ctx.status).to_string()).or_insert(0) += 1;
            if ctx.status == ScopeStatus::Completed {
                if let Some(duration) = ctx.duration() {
                    total_success_ms += duration.num_milliseconds() as f64;
                    stats.total_successes += 1;
                }
            }
        }
        if stats.total_successes > 0 {
            stats.average_success_duration_ms = Some(total_success_ms / stats.total_successes as f64);
        }
        stats
    }

    /// Test-only: empties live and history (spec §4.E `clear_all`).
    pub async fn clear_all(&self) {
        let mut state = self.state.lock().await;
        state.live.clear();
        state.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::Scope as ScopeType;
    use std::time::Duration;

    async fn fresh_registry_state() {
        Registry::global().clear_all().await;
        Registry::global().set_history_capacity(DEFAULT_HISTORY_CAPACITY).await;
    }

    #[tokio::test]
    async fn register_then_unregister_moves_to_history() {
        fresh_registry_state().await;
        let scope = ScopeType::builder().name("tracked").register_globally(true).build();
        let guard = scope.enter().await;
        assert!(Registry::global().get(scope.id()).await.is_some());
        guard.exit(Ok::<_, crate::error::CancellationError>(())).await.unwrap();
        assert!(Registry::global().get(scope.id()).await.is_none());
        let history = Registry::global().history(None, None, None).await;
        assert!(history.iter().any(|ctx| ctx.id == scope.id()));
    }

    #[tokio::test]
    async fn history_respects_capacity() {
        fresh_registry_state().await;
        Registry::global().set_history_capacity(2).await;
        for i in 0..5 {
            let scope = ScopeType::builder()
                .name(format!("s{i}"))
                .register_globally(true)
                .build();
            let guard = scope.enter().await;
            guard.exit(Ok::<_, crate::error::CancellationError>(())).await.unwrap();
        }
        let history = Registry::global().history(None, None, None).await;
        assert_eq!(history.len(), 2);
        Registry::global().set_history_capacity(DEFAULT_HISTORY_CAPACITY).await;
    }

    #[tokio::test]
    async fn bulk_cancel_via_registry() {
        fresh_registry_state().await;
        let mut handles = Vec::new();
        for i in 0..3 {
            let scope = ScopeType::builder()
                .name(format!("bulk{i}"))
                .register_globally(true)
                .build();
            let scope_for_body = scope.clone();
            handles.push(tokio::spawn(async move {
                scope_for_body
                    .run(|s| async move {
                        loop {
                            s.token().raise_if_cancelled()?;
                            tokio::time::sleep(Duration::from_millis(5)).await;
                        }
                    })
                    .await
            }));
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        let cancelled = Registry::global()
            .cancel_all(Some(ScopeStatus::Running), Reason::Manual, Some("bulk stop".into()))
            .await;
        assert_eq!(cancelled, 3);
        for handle in handles {
            let result = handle.await.unwrap();
            assert!(result.is_err());
        }
    }
}
