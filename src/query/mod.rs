//! Declarative aggregation requests.
//!
//! An [`AggregationRequest`] is assembled step by step: every builder call
//! validates its input against the joined-view columns and the derived
//! columns declared so far, then returns a *new* request. Earlier requests
//! are never modified, so variants can share a common prefix:
//!
//! ```rust,ignore
//! let route = AggregationRequest::new()
//!     .filter(Predicate::eq("pickup_neighborhood", "Midtown"))?
//!     .derive("pickup_hour", DerivedExpr::hour_of("pickup_datetime"))?;
//! let by_hour = route.group_by(["pickup_hour"])?.count()?;
//! let fares = route.group_by(["pickup_hour"])?.aggregate("fare_amount", Statistic::Mean)?;
//! ```
//!
//! Nothing here touches data. Malformed requests fail with
//! [`ExploreError::RequestInvalid`] before any backend sees them.

pub(crate) mod compile;
pub mod expr;

pub use expr::{
    CompareOp, DerivedColumn, DerivedExpr, Predicate, Statistic, StatisticSpec, TimePart,
};

use serde::{Deserialize, Serialize};

use crate::error::{ExploreError, Result};
use crate::model::{Field, ValueType};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregationRequest {
    filters: Vec<Predicate>,
    derived: Vec<DerivedColumn>,
    group_by: Vec<String>,
    statistics: Vec<StatisticSpec>,
    top_n: Option<usize>,
}

fn invalid(msg: impl Into<String>) -> ExploreError {
    ExploreError::RequestInvalid(msg.into())
}

impl AggregationRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filters(&self) -> &[Predicate] {
        &self.filters
    }

    pub fn derived(&self) -> &[DerivedColumn] {
        &self.derived
    }

    pub fn group_keys(&self) -> &[String] {
        &self.group_by
    }

    pub fn statistics(&self) -> &[StatisticSpec] {
        &self.statistics
    }

    pub fn top_n_limit(&self) -> Option<usize> {
        self.top_n
    }

    pub fn stat_labels(&self) -> Vec<String> {
        self.statistics.iter().map(StatisticSpec::label).collect()
    }

    /// Type of a joined-view or derived column, `None` if unknown.
    pub fn column_type(&self, name: &str) -> Option<ValueType> {
        if let Some(field) = Field::from_name(name) {
            return Some(field.value_type());
        }
        self.derived
            .iter()
            .any(|d| d.name == name)
            .then_some(ValueType::Int)
    }

    fn require_column(&self, name: &str) -> Result<ValueType> {
        self.column_type(name)
            .ok_or_else(|| invalid(format!("unknown column '{name}'")))
    }

    pub fn filter(&self, predicate: Predicate) -> Result<Self> {
        let ty = self.require_column(predicate.column())?;
        if let Predicate::Compare { column, value, .. } = &predicate {
            if !value.fits(ty) {
                return Err(invalid(format!(
                    "cannot compare {ty} column '{column}' with {value}"
                )));
            }
        }
        let mut next = self.clone();
        next.filters.push(predicate);
        Ok(next)
    }

    pub fn derive(&self, name: &str, expr: DerivedExpr) -> Result<Self> {
        if name.is_empty() || name == "*" {
            return Err(invalid(format!("'{name}' is not a usable column name")));
        }
        if self.column_type(name).is_some() {
            return Err(invalid(format!("column '{name}' already exists")));
        }
        for input in expr.inputs() {
            let ty = self.require_column(input)?;
            if ty != ValueType::Timestamp {
                return Err(invalid(format!(
                    "'{input}' is a {ty} column, expected a timestamp"
                )));
            }
        }
        let mut next = self.clone();
        next.derived.push(DerivedColumn {
            name: name.to_string(),
            expr,
        });
        Ok(next)
    }

    pub fn group_by<I, S>(&self, keys: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut next = self.clone();
        for key in keys {
            let key = key.as_ref();
            let ty = self.require_column(key)?;
            if !ty.is_groupable() {
                return Err(invalid(format!("cannot group by {ty} column '{key}'")));
            }
            if next.group_by.iter().any(|k| k == key) {
                return Err(invalid(format!("duplicate group key '{key}'")));
            }
            next.group_by.push(key.to_string());
        }
        Ok(next)
    }

    pub fn aggregate(&self, column: &str, statistic: Statistic) -> Result<Self> {
        match statistic {
            Statistic::Count if column == "*" => {}
            Statistic::Count => {
                self.require_column(column)?;
            }
            Statistic::Mean | Statistic::Percentile(_) => {
                let ty = self.require_column(column)?;
                if !ty.is_numeric() {
                    return Err(invalid(format!(
                        "cannot aggregate {ty} column '{column}' numerically"
                    )));
                }
            }
        }
        if let Statistic::Percentile(q) = statistic {
            if !(0.0..=1.0).contains(&q) {
                return Err(invalid(format!("percentile {q} is outside [0, 1]")));
            }
        }

        let spec = StatisticSpec {
            column: column.to_string(),
            statistic,
        };
        let label = spec.label();
        if self.statistics.iter().any(|s| s.label() == label) {
            return Err(invalid(format!("statistic '{label}' requested twice")));
        }
        let mut next = self.clone();
        next.statistics.push(spec);
        Ok(next)
    }

    /// Rows per group.
    pub fn count(&self) -> Result<Self> {
        self.aggregate("*", Statistic::Count)
    }

    pub fn percentiles(&self, column: &str, quantiles: &[f64]) -> Result<Self> {
        quantiles.iter().try_fold(self.clone(), |req, &q| {
            req.aggregate(column, Statistic::Percentile(q))
        })
    }

    /// Keeps the `n` largest groups, by row count. Ties go to the smaller key.
    pub fn top_n(&self, n: usize) -> Result<Self> {
        if n == 0 {
            return Err(invalid("top-n needs n > 0"));
        }
        if self.group_by.is_empty() {
            return Err(invalid("top-n needs at least one group key"));
        }
        let mut next = self.clone();
        next.top_n = Some(n);
        Ok(next)
    }

    /// Re-runs every builder check. Used for requests that did not come
    /// through the builder, e.g. ones deserialized off the wire.
    pub fn validate(&self) -> Result<()> {
        let mut replay = AggregationRequest::new();
        for d in &self.derived {
            replay = replay.derive(&d.name, d.expr.clone())?;
        }
        for f in &self.filters {
            replay = replay.filter(f.clone())?;
        }
        replay = replay.group_by(&self.group_by)?;
        for s in &self.statistics {
            replay = replay.aggregate(&s.column, s.statistic)?;
        }
        if let Some(n) = self.top_n {
            replay.top_n(n)?;
        }
        Ok(())
    }
}
