//! Remote execution over HTTP.
//!
//! The plan travels as JSON to `POST {base}/v1/aggregate`. Rows never leave
//! the service: the envelope names the cached view and carries the sample
//! descriptions, and the service answers with grouped rows only.

mod auth;
mod client;

pub use auth::BearerToken;
pub use client::{BasicClient, HttpClient};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, HeaderValue};
use reqwest::{Method, Request, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Backend, LogicalPlan};
use crate::error::{ExploreError, Result};
use crate::partition::SampleSpec;
use crate::query::AggregationRequest;
use crate::result::ResultRow;

/// Wire form of a [`LogicalPlan`].
#[derive(Debug, Serialize, Deserialize)]
pub struct PlanEnvelope {
    pub view: String,
    pub samples: Vec<SampleSpec>,
    pub request: AggregationRequest,
    pub row_cap: usize,
}

impl PlanEnvelope {
    pub fn from_plan(plan: &LogicalPlan) -> Self {
        Self {
            view: plan.source.name().to_string(),
            samples: plan
                .source
                .samples()
                .iter()
                .map(|s| s.spec().clone())
                .collect(),
            request: plan.request.clone(),
            row_cap: plan.row_cap,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    rows: Option<usize>,
}

pub struct HttpBackend<C> {
    client: C,
    endpoint: Url,
}

impl<C: HttpClient> HttpBackend<C> {
    pub fn new(client: C, base_url: &str) -> anyhow::Result<Self> {
        let endpoint = format!("{}/v1/aggregate", base_url.trim_end_matches('/'));
        let endpoint = Url::parse(&endpoint)
            .with_context(|| format!("invalid backend url: {base_url}"))?;
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn build_request(&self, plan: &LogicalPlan) -> Result<Request> {
        let body = serde_json::to_vec(&PlanEnvelope::from_plan(plan))
            .map_err(|e| ExploreError::RequestInvalid(format!("plan is not serializable: {e}")))?;
        let mut req = Request::new(Method::POST, self.endpoint.clone());
        req.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        *req.body_mut() = Some(body.into());
        Ok(req)
    }
}

fn unavailable(e: impl std::fmt::Display) -> ExploreError {
    ExploreError::BackendUnavailable(e.to_string())
}

#[async_trait]
impl<C: HttpClient> Backend for HttpBackend<C> {
    #[tracing::instrument(skip_all, fields(view = plan.source.name(), endpoint = %self.endpoint))]
    async fn submit(&self, plan: &LogicalPlan) -> Result<Vec<ResultRow>> {
        // catch malformed requests before they cost a round trip
        plan.request.validate()?;
        if plan.cancel.is_cancelled() {
            return Err(unavailable("job cancelled"));
        }

        let req = self.build_request(plan)?;
        let resp = self.client.execute(req).await.map_err(|e| {
            warn!(error = %e, "Aggregation service unreachable");
            unavailable(e)
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body: ErrorBody = resp.json().await.unwrap_or_default();
            let message = body.message.unwrap_or_else(|| status.to_string());
            return Err(match status {
                StatusCode::PAYLOAD_TOO_LARGE => ExploreError::ResultTooLarge {
                    rows: body.rows.unwrap_or(plan.row_cap + 1),
                    cap: plan.row_cap,
                },
                StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                    ExploreError::RequestInvalid(message)
                }
                _ => unavailable(format!("{status}: {message}")),
            });
        }

        let rows: Vec<ResultRow> = resp.json().await.map_err(unavailable)?;
        if rows.len() > plan.row_cap {
            return Err(ExploreError::ResultTooLarge {
                rows: rows.len(),
                cap: plan.row_cap,
            });
        }
        debug!(groups = rows.len(), "Remote aggregation finished");
        Ok(rows)
    }
}
