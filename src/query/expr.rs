//! The closed vocabulary of predicates, derived expressions and statistics.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::model::Literal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Gt,
}

impl CompareOp {
    pub fn holds(self, ord: Ordering) -> bool {
        match self {
            CompareOp::Eq => ord == Ordering::Equal,
            CompareOp::Ne => ord != Ordering::Equal,
            CompareOp::Lt => ord == Ordering::Less,
            CompareOp::Gt => ord == Ordering::Greater,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Gt => ">",
        }
    }
}

/// A row filter. Comparisons never match a null cell; the null checks are
/// the only predicates that look at nulls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    Compare {
        column: String,
        op: CompareOp,
        value: Literal,
    },
    IsNull {
        column: String,
    },
    IsNotNull {
        column: String,
    },
}

impl Predicate {
    fn compare(column: &str, op: CompareOp, value: impl Into<Literal>) -> Self {
        Predicate::Compare {
            column: column.to_string(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(column: &str, value: impl Into<Literal>) -> Self {
        Self::compare(column, CompareOp::Eq, value)
    }

    pub fn ne(column: &str, value: impl Into<Literal>) -> Self {
        Self::compare(column, CompareOp::Ne, value)
    }

    pub fn lt(column: &str, value: impl Into<Literal>) -> Self {
        Self::compare(column, CompareOp::Lt, value)
    }

    pub fn gt(column: &str, value: impl Into<Literal>) -> Self {
        Self::compare(column, CompareOp::Gt, value)
    }

    pub fn is_null(column: &str) -> Self {
        Predicate::IsNull {
            column: column.to_string(),
        }
    }

    pub fn is_not_null(column: &str) -> Self {
        Predicate::IsNotNull {
            column: column.to_string(),
        }
    }

    pub fn column(&self) -> &str {
        match self {
            Predicate::Compare { column, .. }
            | Predicate::IsNull { column }
            | Predicate::IsNotNull { column } => column,
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Predicate::Compare { column, op, value } => {
                write!(f, "{column} {} {value}", op.symbol())
            }
            Predicate::IsNull { column } => write!(f, "{column} is null"),
            Predicate::IsNotNull { column } => write!(f, "{column} is not null"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimePart {
    Hour,
    /// ISO-8601 week number.
    Week,
    Year,
}

/// Expressions that produce a derived integer column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DerivedExpr {
    /// `end - start`, in whole seconds.
    SecondsBetween { start: String, end: String },
    Extract { part: TimePart, column: String },
}

impl DerivedExpr {
    pub fn seconds_between(start: &str, end: &str) -> Self {
        DerivedExpr::SecondsBetween {
            start: start.to_string(),
            end: end.to_string(),
        }
    }

    pub fn hour_of(column: &str) -> Self {
        Self::extract(TimePart::Hour, column)
    }

    pub fn week_of(column: &str) -> Self {
        Self::extract(TimePart::Week, column)
    }

    pub fn year_of(column: &str) -> Self {
        Self::extract(TimePart::Year, column)
    }

    fn extract(part: TimePart, column: &str) -> Self {
        DerivedExpr::Extract {
            part,
            column: column.to_string(),
        }
    }

    pub fn inputs(&self) -> Vec<&str> {
        match self {
            DerivedExpr::SecondsBetween { start, end } => vec![start.as_str(), end.as_str()],
            DerivedExpr::Extract { column, .. } => vec![column.as_str()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedColumn {
    pub name: String,
    pub expr: DerivedExpr,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "q", rename_all = "snake_case")]
pub enum Statistic {
    Count,
    Mean,
    /// Quantile in `[0, 1]`.
    Percentile(f64),
}

/// One requested statistic over one column. `*` is only valid for counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticSpec {
    pub column: String,
    pub statistic: Statistic,
}

impl StatisticSpec {
    /// Output column name: `count`, `count_fare_amount`, `mean_trip_time`,
    /// `p50_trip_time`, `p2.5_trip_time`.
    pub fn label(&self) -> String {
        match self.statistic {
            Statistic::Count if self.column == "*" => "count".to_string(),
            Statistic::Count => format!("count_{}", self.column),
            Statistic::Mean => format!("mean_{}", self.column),
            Statistic::Percentile(q) => {
                let pct = (q * 100.0 * 1e6).round() / 1e6;
                format!("p{pct}_{}", self.column)
            }
        }
    }
}
