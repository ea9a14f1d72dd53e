//! Hand-off to an external model fitter.
//!
//! Fitting itself is a collaborator's job. This module parses the model
//! formula, checks it against the joined-view columns and passes the
//! `train` partition of a split to a [`ModelFitter`].

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ExploreError, Result};
use crate::join::JoinedView;
use crate::model::Field;

/// Name of the partition handed to the fitter.
pub const TRAIN_PARTITION: &str = "train";

/// `response ~ predictor + predictor ...`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormulaSpec {
    pub response: String,
    pub predictors: Vec<String>,
}

impl FormulaSpec {
    pub fn parse(formula: &str) -> Result<Self> {
        let invalid = || ExploreError::RequestInvalid(format!("malformed formula '{formula}'"));
        let (lhs, rhs) = formula.split_once('~').ok_or_else(invalid)?;
        let response = lhs.trim();
        if response.is_empty() {
            return Err(invalid());
        }
        let predictors: Vec<String> = rhs.split('+').map(|t| t.trim().to_string()).collect();
        if predictors.iter().any(|p| p.is_empty()) {
            return Err(invalid());
        }
        Ok(Self {
            response: response.to_string(),
            predictors,
        })
    }

    /// Response first, then predictors, all resolved to numeric base columns.
    pub fn fields(&self) -> Result<Vec<Field>> {
        std::iter::once(&self.response)
            .chain(&self.predictors)
            .map(|name| {
                let field = Field::from_name(name).ok_or_else(|| {
                    ExploreError::RequestInvalid(format!("unknown column '{name}' in formula"))
                })?;
                if !field.value_type().is_numeric() {
                    return Err(ExploreError::RequestInvalid(format!(
                        "column '{name}' is {} and cannot enter a formula",
                        field.value_type()
                    )));
                }
                Ok(field)
            })
            .collect()
    }
}

impl fmt::Display for FormulaSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ~ {}", self.response, self.predictors.join(" + "))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coefficients {
    pub intercept: f64,
    pub terms: Vec<(String, f64)>,
}

impl Coefficients {
    pub fn term(&self, name: &str) -> Option<f64> {
        self.terms.iter().find(|(n, _)| n == name).map(|(_, c)| *c)
    }
}

#[async_trait]
pub trait ModelFitter: Send + Sync {
    async fn fit(&self, formula: &FormulaSpec, data: &JoinedView) -> anyhow::Result<Coefficients>;
}

/// Fits `formula` on the `train` entry of a split.
#[tracing::instrument(skip_all, fields(formula = %formula))]
pub async fn fit_partition<F: ModelFitter + ?Sized>(
    fitter: &F,
    partitions: &BTreeMap<String, JoinedView>,
    formula: &FormulaSpec,
) -> Result<Coefficients> {
    formula.fields()?;
    let train = partitions.get(TRAIN_PARTITION).ok_or_else(|| {
        ExploreError::RequestInvalid(format!("split has no '{TRAIN_PARTITION}' partition"))
    })?;

    let coefficients = fitter
        .fit(formula, train)
        .await
        .map_err(|e| ExploreError::ModelFit(format!("{e:#}")))?;
    info!(terms = coefficients.terms.len(), "Model fitted");
    Ok(coefficients)
}
