//! The distributed backend contract and its implementations.
//!
//! A backend receives one [`LogicalPlan`] (source view, filters, derived
//! columns, grouping, statistics, optional top-N) and returns only the
//! grouped rows. [`LocalBackend`] runs the plan in-process across a worker
//! pool, [`HttpBackend`] ships it to a remote aggregation service, and
//! [`Deadline`] bounds how long any backend may take.

mod deadline;
pub mod http;
mod local;

pub use deadline::Deadline;
pub use http::{BasicClient, BearerToken, HttpBackend, HttpClient};
pub use local::{LocalBackend, interpolated_percentile};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::error::Result;
use crate::join::JoinedView;
use crate::query::AggregationRequest;
use crate::result::ResultRow;

/// Shared flag a caller raises when it no longer wants a plan's result.
/// Backends check it where they can and stop early.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Everything a backend needs for one round trip.
#[derive(Debug, Clone)]
pub struct LogicalPlan {
    pub source: JoinedView,
    pub request: AggregationRequest,
    /// Maximum number of grouped rows the caller accepts.
    pub row_cap: usize,
    pub cancel: CancelFlag,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Executes `plan` and returns its grouped rows, one per group, with
    /// statistics in request order.
    async fn submit(&self, plan: &LogicalPlan) -> Result<Vec<ResultRow>>;
}

#[async_trait]
impl<B: Backend + ?Sized> Backend for Box<B> {
    async fn submit(&self, plan: &LogicalPlan) -> Result<Vec<ResultRow>> {
        (**self).submit(plan).await
    }
}

#[async_trait]
impl<B: Backend + ?Sized> Backend for Arc<B> {
    async fn submit(&self, plan: &LogicalPlan) -> Result<Vec<ResultRow>> {
        (**self).submit(plan).await
    }
}
