//! Parameter-driven recomputation.
//!
//! A [`ReactiveSession`] owns one set of parameter bindings and the most
//! recent result computed for them. Every change issues exactly one engine
//! call; a change that arrives while a call is in flight supersedes it, and
//! the superseded result is dropped on arrival by generation check.
//!
//! ```text
//! Idle ──set──▶ Computing ──ok──▶ Ready
//!   ▲              │  ▲             │
//!   └────error─────┘  └─────set─────┘
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{Backend, CancelFlag};
use crate::engine::AggregationEngine;
use crate::error::{ExploreError, Result};
use crate::join::JoinedView;
use crate::model::Literal;
use crate::query::AggregationRequest;
use crate::result::AggregationResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Computing,
    Ready,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Computing => "computing",
            SessionPhase::Ready => "ready",
        };
        f.write_str(s)
    }
}

pub type Params = BTreeMap<String, Literal>;

/// Builds the session's request from its current parameters.
pub type RequestTemplate = Arc<dyn Fn(&Params) -> Result<AggregationRequest> + Send + Sync>;

/// Looks up a parameter a template depends on.
pub fn param<'a>(params: &'a Params, name: &str) -> Result<&'a Literal> {
    params
        .get(name)
        .ok_or_else(|| ExploreError::RequestInvalid(format!("parameter '{name}' is not set")))
}

/// A read-only consumer of session results (a chart, a table, a map).
/// Callbacks run while the session state is locked and must not block.
pub trait Dependent: Send + Sync {
    fn on_ready(&self, result: &Arc<AggregationResult>);

    fn on_error(&self, _error: &ExploreError) {}
}

struct Inner {
    params: Params,
    generation: u64,
    latest: Option<Arc<AggregationResult>>,
    in_flight: Option<(JoinHandle<()>, CancelFlag)>,
    dependents: Vec<Arc<dyn Dependent>>,
    ended: bool,
}

impl Inner {
    fn cancel_in_flight(&mut self) {
        if let Some((handle, cancel)) = self.in_flight.take() {
            cancel.cancel();
            handle.abort();
            debug!(generation = self.generation, "Superseded in-flight computation");
        }
    }
}

struct Shared {
    state: Mutex<Inner>,
    phase_tx: watch::Sender<SessionPhase>,
}

impl Shared {
    fn set_phase(&self, phase: SessionPhase) {
        self.phase_tx.send_replace(phase);
    }

    async fn complete(&self, generation: u64, outcome: Result<AggregationResult>) {
        let mut inner = self.state.lock().await;
        if inner.ended || inner.generation != generation {
            debug!(generation, current = inner.generation, "Discarding stale result");
            return;
        }
        inner.in_flight = None;
        match outcome {
            Ok(result) => {
                let result = Arc::new(result);
                inner.latest = Some(result.clone());
                self.set_phase(SessionPhase::Ready);
                info!(generation, groups = result.len(), "Session ready");
                for dependent in &inner.dependents {
                    dependent.on_ready(&result);
                }
            }
            Err(e) => {
                self.set_phase(SessionPhase::Idle);
                warn!(generation, error = %e, "Session computation failed");
                for dependent in &inner.dependents {
                    dependent.on_error(&e);
                }
            }
        }
    }
}

pub struct ReactiveSession<B> {
    engine: Arc<AggregationEngine<B>>,
    source: JoinedView,
    template: RequestTemplate,
    shared: Arc<Shared>,
}

impl<B: Backend + 'static> ReactiveSession<B> {
    pub fn new(engine: Arc<AggregationEngine<B>>, source: JoinedView, template: RequestTemplate) -> Self {
        let (phase_tx, _) = watch::channel(SessionPhase::Idle);
        Self {
            engine,
            source,
            template,
            shared: Arc::new(Shared {
                state: Mutex::new(Inner {
                    params: Params::new(),
                    generation: 0,
                    latest: None,
                    in_flight: None,
                    dependents: Vec::new(),
                    ended: false,
                }),
                phase_tx,
            }),
        }
    }

    /// Registers a dependent. A session that is already `Ready` hands it
    /// the cached result straight away.
    pub async fn register(&self, dependent: Arc<dyn Dependent>) -> Result<()> {
        let mut inner = self.shared.state.lock().await;
        if inner.ended {
            return Err(ExploreError::SessionEnded);
        }
        if let Some(latest) = &inner.latest {
            dependent.on_ready(latest);
        }
        inner.dependents.push(dependent);
        Ok(())
    }

    pub async fn set_param(&self, name: &str, value: impl Into<Literal>) -> Result<()> {
        self.set_params([(name.to_string(), value.into())]).await
    }

    /// Applies a batch of changes as one change: one computation is issued
    /// however many bindings move.
    pub async fn set_params<I>(&self, changes: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, Literal)>,
    {
        let mut inner = self.shared.state.lock().await;
        if inner.ended {
            return Err(ExploreError::SessionEnded);
        }
        inner.params.extend(changes);
        inner.generation += 1;
        inner.cancel_in_flight();
        inner.latest = None;
        let generation = inner.generation;

        let request = match (self.template)(&inner.params) {
            Ok(request) => request,
            Err(e) => {
                self.shared.set_phase(SessionPhase::Idle);
                warn!(generation, error = %e, "Request template rejected parameters");
                for dependent in &inner.dependents {
                    dependent.on_error(&e);
                }
                return Err(e);
            }
        };

        self.shared.set_phase(SessionPhase::Computing);
        debug!(generation, params = ?inner.params, "Recomputing");

        let cancel = CancelFlag::new();
        let engine = self.engine.clone();
        let source = self.source.clone();
        let shared = self.shared.clone();
        let flag = cancel.clone();
        let handle = tokio::spawn(async move {
            let outcome = engine.execute_with_cancel(&request, &source, flag).await;
            shared.complete(generation, outcome).await;
        });
        inner.in_flight = Some((handle, cancel));
        Ok(())
    }
}

impl<B> ReactiveSession<B> {
    pub fn phase(&self) -> SessionPhase {
        *self.shared.phase_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionPhase> {
        self.shared.phase_tx.subscribe()
    }

    /// Waits until no computation is in flight and returns the phase it
    /// settled in.
    pub async fn settled(&self) -> SessionPhase {
        let mut rx = self.subscribe();
        rx.wait_for(|p| *p != SessionPhase::Computing)
            .await
            .map(|p| *p)
            .unwrap_or(SessionPhase::Idle)
    }

    pub async fn params(&self) -> Params {
        self.shared.state.lock().await.params.clone()
    }

    /// The result for the current bindings, if one has arrived.
    pub async fn latest(&self) -> Option<Arc<AggregationResult>> {
        self.shared.state.lock().await.latest.clone()
    }

    /// Tears the session down: the in-flight call is cancelled, dependents
    /// are released and every later operation fails with `SessionEnded`.
    pub async fn end(&self) {
        let mut inner = self.shared.state.lock().await;
        if inner.ended {
            return;
        }
        inner.ended = true;
        inner.cancel_in_flight();
        inner.params.clear();
        inner.latest = None;
        inner.dependents.clear();
        self.shared.set_phase(SessionPhase::Idle);
        info!(generation = inner.generation, "Session ended");
    }

    pub async fn is_ended(&self) -> bool {
        self.shared.state.lock().await.ended
    }
}

impl<B> Drop for ReactiveSession<B> {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.shared.state.try_lock() {
            inner.ended = true;
            inner.cancel_in_flight();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use crate::query::Predicate;

    fn template() -> RequestTemplate {
        Arc::new(|params: &Params| {
            AggregationRequest::new()
                .filter(Predicate::eq("pickup_zone_id", param(params, "pickup")?.clone()))?
                .count()
        })
    }

    fn session() -> ReactiveSession<LocalBackend> {
        let engine = Arc::new(AggregationEngine::new(LocalBackend::new(2), 100));
        ReactiveSession::new(engine, JoinedView::new("trips_zones", Vec::new()), template())
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(SessionPhase::Computing.to_string(), "computing");
    }

    #[tokio::test]
    async fn test_missing_parameter_is_invalid_request() {
        let s = session();
        let err = s.set_param("dropoff", 2).await.unwrap_err();
        assert!(matches!(err, ExploreError::RequestInvalid(_)));
        assert_eq!(s.phase(), SessionPhase::Idle);
    }

    #[tokio::test]
    async fn test_literal_type_mismatch_is_invalid_request() {
        let s = session();
        let err = s.set_param("pickup", "Midtown").await.unwrap_err();
        assert!(matches!(err, ExploreError::RequestInvalid(_)));
    }

    #[tokio::test]
    async fn test_change_reaches_ready() {
        let s = session();
        s.set_param("pickup", 1).await.unwrap();
        assert_eq!(s.settled().await, SessionPhase::Ready);
        assert!(s.latest().await.is_some());
        assert_eq!(s.params().await.get("pickup"), Some(&Literal::Int(1)));
    }

    #[tokio::test]
    async fn test_ended_session_rejects_changes() {
        let s = session();
        s.end().await;
        assert!(s.is_ended().await);
        assert_eq!(
            s.set_param("pickup", 1).await.unwrap_err(),
            ExploreError::SessionEnded
        );
        assert!(s.params().await.is_empty());
    }
}
