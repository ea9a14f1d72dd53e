//! Submits validated requests to a backend and assembles labelled results.

use std::time::Instant;

use tracing::{Span, info};

use crate::backend::{Backend, CancelFlag, LogicalPlan};
use crate::error::{ExploreError, Result};
use crate::join::JoinedView;
use crate::query::AggregationRequest;
use crate::result::{AggregationResult, rank_top_n};

pub const DEFAULT_ROW_CAP: usize = 10_000;

pub struct AggregationEngine<B> {
    backend: B,
    row_cap: usize,
}

impl<B: Backend> AggregationEngine<B> {
    pub fn new(backend: B, row_cap: usize) -> Self {
        Self { backend, row_cap }
    }

    pub fn row_cap(&self) -> usize {
        self.row_cap
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub async fn execute(
        &self,
        request: &AggregationRequest,
        source: &JoinedView,
    ) -> Result<AggregationResult> {
        self.execute_with_cancel(request, source, CancelFlag::new())
            .await
    }

    /// Runs `request` over `source` as a single backend operation. `cancel`
    /// lets a caller that lost interest stop the backend early.
    #[tracing::instrument(
        skip_all,
        fields(view = source.name(), sampled = source.is_sampled(), groups)
    )]
    pub async fn execute_with_cancel(
        &self,
        request: &AggregationRequest,
        source: &JoinedView,
        cancel: CancelFlag,
    ) -> Result<AggregationResult> {
        request.validate()?;
        let started = Instant::now();

        let plan = LogicalPlan {
            source: source.clone(),
            request: request.clone(),
            row_cap: self.row_cap,
            cancel,
        };
        let mut rows = self.backend.submit(&plan).await?;

        if rows.len() > self.row_cap {
            return Err(ExploreError::ResultTooLarge {
                rows: rows.len(),
                cap: self.row_cap,
            });
        }
        if let Some(n) = request.top_n_limit() {
            rank_top_n(&mut rows, n);
        }

        Span::current().record("groups", rows.len());
        info!(
            groups = rows.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Aggregation complete"
        );

        Ok(AggregationResult {
            key_columns: request.group_keys().to_vec(),
            stat_columns: request.stat_labels(),
            rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::KeyValue;
    use crate::result::ResultRow;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Returns canned rows and remembers every plan it saw.
    #[derive(Default)]
    struct Canned {
        rows: Vec<ResultRow>,
        seen: Mutex<Vec<AggregationRequest>>,
    }

    #[async_trait]
    impl Backend for Canned {
        async fn submit(&self, plan: &LogicalPlan) -> Result<Vec<ResultRow>> {
            self.seen.lock().unwrap().push(plan.request.clone());
            Ok(self.rows.clone())
        }
    }

    fn row(zone: i64, size: u64) -> ResultRow {
        ResultRow {
            key: vec![KeyValue::Int(zone)],
            size,
            stats: vec![size as f64],
        }
    }

    fn by_dropoff() -> AggregationRequest {
        AggregationRequest::new()
            .group_by(["dropoff_zone_id"])
            .unwrap()
            .count()
            .unwrap()
    }

    fn empty_view() -> JoinedView {
        JoinedView::new("trips_zones", Vec::new())
    }

    #[tokio::test]
    async fn test_result_carries_labels() {
        let engine = AggregationEngine::new(
            Canned {
                rows: vec![row(1, 3)],
                ..Default::default()
            },
            10,
        );
        let result = engine.execute(&by_dropoff(), &empty_view()).await.unwrap();
        assert_eq!(result.key_columns, vec!["dropoff_zone_id"]);
        assert_eq!(result.stat_columns, vec!["count"]);
        assert_eq!(engine.backend().seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_request_never_reaches_backend() {
        let bad: AggregationRequest = serde_json::from_value(serde_json::json!({
            "filters": [],
            "derived": [],
            "group_by": [],
            "statistics": [],
            "top_n": 3
        }))
        .unwrap();
        let engine = AggregationEngine::new(Canned::default(), 10);
        let err = engine.execute(&bad, &empty_view()).await.unwrap_err();
        assert!(matches!(err, ExploreError::RequestInvalid(_)));
        assert!(engine.backend().seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cap_is_rechecked_on_arrival() {
        let engine = AggregationEngine::new(
            Canned {
                rows: (0..5).map(|z| row(z, 1)).collect(),
                ..Default::default()
            },
            4,
        );
        let err = engine.execute(&by_dropoff(), &empty_view()).await.unwrap_err();
        assert_eq!(err, ExploreError::ResultTooLarge { rows: 5, cap: 4 });
    }

    #[tokio::test]
    async fn test_top_n_is_enforced_on_unranked_replies() {
        let engine = AggregationEngine::new(
            Canned {
                rows: vec![row(4, 1), row(2, 9), row(3, 9), row(1, 5)],
                ..Default::default()
            },
            10,
        );
        let request = by_dropoff().top_n(2).unwrap();
        let result = engine.execute(&request, &empty_view()).await.unwrap();
        let keys: Vec<_> = result.rows.iter().map(|r| r.key[0].clone()).collect();
        assert_eq!(keys, vec![KeyValue::Int(2), KeyValue::Int(3)]);
    }
}
