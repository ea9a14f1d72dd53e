use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::{Backend, LogicalPlan};
use crate::error::{ExploreError, Result};
use crate::result::ResultRow;

/// Bounds every submission to `timeout`. An expired plan is cancelled and
/// reported as [`ExploreError::BackendUnavailable`]; it is never retried here.
pub struct Deadline<B> {
    inner: B,
    timeout: Duration,
}

impl<B> Deadline<B> {
    pub fn new(inner: B, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl<B: Backend> Backend for Deadline<B> {
    async fn submit(&self, plan: &LogicalPlan) -> Result<Vec<ResultRow>> {
        match tokio::time::timeout(self.timeout, self.inner.submit(plan)).await {
            Ok(result) => result,
            Err(_) => {
                plan.cancel.cancel();
                warn!(timeout = ?self.timeout, view = plan.source.name(), "Backend deadline expired");
                Err(ExploreError::BackendUnavailable(format!(
                    "no result within {}s",
                    self.timeout.as_secs_f64()
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CancelFlag;
    use crate::join::JoinedView;
    use crate::query::AggregationRequest;

    struct Stalled;

    #[async_trait]
    impl Backend for Stalled {
        async fn submit(&self, _plan: &LogicalPlan) -> Result<Vec<ResultRow>> {
            std::future::pending().await
        }
    }

    struct Instant;

    #[async_trait]
    impl Backend for Instant {
        async fn submit(&self, _plan: &LogicalPlan) -> Result<Vec<ResultRow>> {
            Ok(Vec::new())
        }
    }

    fn plan() -> LogicalPlan {
        LogicalPlan {
            source: JoinedView::new("trips_zones", Vec::new()),
            request: AggregationRequest::new(),
            row_cap: 10,
            cancel: CancelFlag::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_plan_is_cancelled() {
        let p = plan();
        let err = Deadline::new(Stalled, Duration::from_secs(300))
            .submit(&p)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(p.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_fast_plan_passes_through() {
        let p = plan();
        let rows = Deadline::new(Instant, Duration::from_secs(1))
            .submit(&p)
            .await
            .unwrap();
        assert!(rows.is_empty());
        assert!(!p.cancel.is_cancelled());
    }
}
