//! Resolves a validated request into column slots that can be evaluated
//! row by row without string lookups.

use chrono::NaiveDateTime;

use super::{AggregationRequest, CompareOp, DerivedExpr, Predicate, Statistic, TimePart};
use crate::error::{ExploreError, Result};
use crate::model::{self, Field, JoinedTrip, KeyValue, Literal, Value};

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Slot {
    Base(Field),
    Derived(usize),
}

impl Slot {
    fn value<'a>(self, row: &'a JoinedTrip, derived: &[i64]) -> Value<'a> {
        match self {
            Slot::Base(field) => field.value(row),
            Slot::Derived(i) => Value::Int(derived[i]),
        }
    }
}

#[derive(Debug, Clone)]
enum CompiledDerived {
    SecondsBetween(Field, Field),
    Extract(TimePart, Field),
}

impl CompiledDerived {
    fn eval(&self, row: &JoinedTrip) -> Option<i64> {
        let ts = |f: Field| -> Option<NaiveDateTime> { f.value(row).as_timestamp() };
        match *self {
            CompiledDerived::SecondsBetween(start, end) => {
                Some((ts(end)? - ts(start)?).num_seconds())
            }
            CompiledDerived::Extract(TimePart::Hour, f) => ts(f).map(model::extract_hour),
            CompiledDerived::Extract(TimePart::Week, f) => ts(f).map(model::extract_week),
            CompiledDerived::Extract(TimePart::Year, f) => ts(f).map(model::extract_year),
        }
    }
}

#[derive(Debug, Clone)]
enum Test {
    Compare(CompareOp, Literal),
    IsNull,
    IsNotNull,
}

#[derive(Debug, Clone)]
pub(crate) struct CompiledPredicate {
    slot: Slot,
    test: Test,
}

impl CompiledPredicate {
    fn new(predicate: &Predicate, slot: Slot) -> Self {
        let test = match predicate {
            Predicate::Compare { op, value, .. } => Test::Compare(*op, value.clone()),
            Predicate::IsNull { .. } => Test::IsNull,
            Predicate::IsNotNull { .. } => Test::IsNotNull,
        };
        Self { slot, test }
    }

    /// Compiles a predicate that may only reference joined-view columns.
    pub(crate) fn base(predicate: &Predicate) -> Result<Self> {
        AggregationRequest::new().filter(predicate.clone())?;
        let field = Field::from_name(predicate.column()).ok_or_else(|| {
            ExploreError::RequestInvalid(format!("unknown column '{}'", predicate.column()))
        })?;
        Ok(Self::new(predicate, Slot::Base(field)))
    }

    pub(crate) fn matches(&self, row: &JoinedTrip, derived: &[i64]) -> bool {
        let value = self.slot.value(row, derived);
        match &self.test {
            Test::Compare(op, literal) => value.compare(literal).is_some_and(|o| op.holds(o)),
            Test::IsNull => value.is_null(),
            Test::IsNotNull => !value.is_null(),
        }
    }
}

/// A statistic bound to the measure it reads.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum CompiledStat {
    /// Rows in the group.
    Count,
    Mean(usize),
    Percentile(usize, f64),
}

/// A request lowered to slots. Rows are admitted in three steps: derived
/// columns (a null input drops the row), filters, then keys and measures
/// (a null drops the row).
#[derive(Debug, Clone)]
pub(crate) struct CompiledRequest {
    derived: Vec<CompiledDerived>,
    filters: Vec<CompiledPredicate>,
    keys: Vec<Slot>,
    /// Distinct columns read by the statistics.
    measures: Vec<Slot>,
    /// One entry per requested statistic, in request order.
    pub(crate) stats: Vec<CompiledStat>,
    /// Whether a measure needs its raw values kept for percentiles.
    pub(crate) keep_values: Vec<bool>,
    pub(crate) top_n: Option<usize>,
}

impl CompiledRequest {
    pub(crate) fn new(request: &AggregationRequest) -> Result<Self> {
        request.validate()?;

        let slot_of = |name: &str| -> Result<Slot> {
            if let Some(field) = Field::from_name(name) {
                return Ok(Slot::Base(field));
            }
            request
                .derived()
                .iter()
                .position(|d| d.name == name)
                .map(Slot::Derived)
                .ok_or_else(|| ExploreError::RequestInvalid(format!("unknown column '{name}'")))
        };
        let field_of = |name: &str| -> Result<Field> {
            Field::from_name(name)
                .ok_or_else(|| ExploreError::RequestInvalid(format!("'{name}' is not a base column")))
        };

        let derived = request
            .derived()
            .iter()
            .map(|d| match &d.expr {
                DerivedExpr::SecondsBetween { start, end } => Ok(CompiledDerived::SecondsBetween(
                    field_of(start.as_str())?,
                    field_of(end.as_str())?,
                )),
                DerivedExpr::Extract { part, column } => {
                    Ok(CompiledDerived::Extract(*part, field_of(column.as_str())?))
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let filters = request
            .filters()
            .iter()
            .map(|p| Ok(CompiledPredicate::new(p, slot_of(p.column())?)))
            .collect::<Result<Vec<_>>>()?;

        let keys = request
            .group_keys()
            .iter()
            .map(|k| slot_of(k.as_str()))
            .collect::<Result<Vec<_>>>()?;

        let mut measures: Vec<Slot> = Vec::new();
        let mut keep_values: Vec<bool> = Vec::new();
        let mut stats = Vec::with_capacity(request.statistics().len());
        for spec in request.statistics() {
            if spec.column == "*" {
                stats.push(CompiledStat::Count);
                continue;
            }
            let slot = slot_of(spec.column.as_str())?;
            let idx = match measures.iter().position(|m| *m == slot) {
                Some(idx) => idx,
                None => {
                    measures.push(slot);
                    keep_values.push(false);
                    measures.len() - 1
                }
            };
            stats.push(match spec.statistic {
                Statistic::Count => CompiledStat::Count,
                Statistic::Mean => CompiledStat::Mean(idx),
                Statistic::Percentile(q) => {
                    keep_values[idx] = true;
                    CompiledStat::Percentile(idx, q)
                }
            });
        }

        Ok(Self {
            derived,
            filters,
            keys,
            measures,
            stats,
            keep_values,
            top_n: request.top_n_limit(),
        })
    }

    pub(crate) fn measure_count(&self) -> usize {
        self.measures.len()
    }

    /// Evaluates one row. Returns the group key, with the measure values
    /// written into `measures`, or `None` if the row is excluded.
    pub(crate) fn admit(
        &self,
        row: &JoinedTrip,
        derived: &mut Vec<i64>,
        measures: &mut Vec<f64>,
    ) -> Option<Vec<KeyValue>> {
        derived.clear();
        for d in &self.derived {
            derived.push(d.eval(row)?);
        }
        let derived: &[i64] = derived;
        if !self.filters.iter().all(|f| f.matches(row, derived)) {
            return None;
        }
        let key = self
            .keys
            .iter()
            .map(|k| k.value(row, derived).to_key())
            .collect::<Option<Vec<_>>>()?;
        measures.clear();
        for m in &self.measures {
            match m.value(row, derived) {
                Value::Null => return None,
                v => match v.as_f64() {
                    Some(x) if x.is_finite() => measures.push(x),
                    // NaN and infinities are treated as missing
                    Some(_) => return None,
                    // non-numeric measures only ever feed counts
                    None => measures.push(0.0),
                },
            }
        }
        Some(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Trip, Zone};
    use chrono::NaiveDate;
    use std::sync::Arc;

    fn row(pickup: (u32, u32), dropoff: (u32, u32), tip: Option<f64>) -> JoinedTrip {
        let at = |(h, m): (u32, u32)| {
            NaiveDate::from_ymd_opt(2015, 1, 5)
                .unwrap()
                .and_hms_opt(h, m, 0)
        };
        let zone = |id: i64, name: &str| {
            Arc::new(Zone {
                zone_id: id,
                borough: "Manhattan".into(),
                neighborhood: name.into(),
            })
        };
        JoinedTrip {
            trip: Trip {
                trip_id: 1,
                pickup_datetime: at(pickup),
                dropoff_datetime: at(dropoff),
                tip_amount: tip,
                vendor_id: Some("CMT".into()),
                ..Default::default()
            },
            pickup: zone(1, "Midtown"),
            dropoff: zone(2, "Airport"),
        }
    }

    fn request() -> AggregationRequest {
        AggregationRequest::new()
            .derive("pickup_hour", DerivedExpr::hour_of("pickup_datetime"))
            .unwrap()
            .derive(
                "trip_time",
                DerivedExpr::seconds_between("pickup_datetime", "dropoff_datetime"),
            )
            .unwrap()
            .filter(Predicate::gt("trip_time", 0))
            .unwrap()
            .group_by(["pickup_hour", "dropoff_neighborhood"])
            .unwrap()
            .count()
            .unwrap()
            .aggregate("trip_time", Statistic::Mean)
            .unwrap()
            .aggregate("trip_time", Statistic::Percentile(0.5))
            .unwrap()
    }

    #[test]
    fn test_admit_produces_key_and_measures() {
        let compiled = CompiledRequest::new(&request()).unwrap();
        let (mut d, mut m) = (Vec::new(), Vec::new());
        let key = compiled.admit(&row((8, 10), (8, 40), None), &mut d, &mut m);
        assert_eq!(
            key,
            Some(vec![KeyValue::Int(8), KeyValue::Text("Airport".into())])
        );
        assert_eq!(m, vec![1800.0]);
        assert_eq!(compiled.measure_count(), 1);
        assert_eq!(compiled.keep_values, vec![true]);
        assert_eq!(
            compiled.stats,
            vec![
                CompiledStat::Count,
                CompiledStat::Mean(0),
                CompiledStat::Percentile(0, 0.5)
            ]
        );
    }

    #[test]
    fn test_filter_excludes_row() {
        let compiled = CompiledRequest::new(&request()).unwrap();
        let (mut d, mut m) = (Vec::new(), Vec::new());
        assert!(compiled.admit(&row((8, 40), (8, 10), None), &mut d, &mut m).is_none());
    }

    #[test]
    fn test_null_measure_excludes_row() {
        let req = request().aggregate("tip_amount", Statistic::Mean).unwrap();
        let compiled = CompiledRequest::new(&req).unwrap();
        let (mut d, mut m) = (Vec::new(), Vec::new());
        assert!(compiled.admit(&row((8, 10), (8, 40), None), &mut d, &mut m).is_none());
        assert!(compiled
            .admit(&row((8, 10), (8, 40), Some(2.0)), &mut d, &mut m)
            .is_some());
    }

    #[test]
    fn test_non_finite_measure_excludes_row() {
        let req = request().aggregate("tip_amount", Statistic::Mean).unwrap();
        let compiled = CompiledRequest::new(&req).unwrap();
        let (mut d, mut m) = (Vec::new(), Vec::new());
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let r = row((8, 10), (8, 40), Some(bad));
            assert!(compiled.admit(&r, &mut d, &mut m).is_none(), "{bad}");
        }
    }

    #[test]
    fn test_column_count_drops_null_rows_from_group() {
        let req = AggregationRequest::new()
            .group_by(["dropoff_neighborhood"])
            .unwrap()
            .count()
            .unwrap()
            .aggregate("tip_amount", Statistic::Count)
            .unwrap();
        let compiled = CompiledRequest::new(&req).unwrap();
        let (mut d, mut m) = (Vec::new(), Vec::new());
        // a null tip removes the row from both counts at once
        assert!(compiled.admit(&row((8, 10), (8, 40), None), &mut d, &mut m).is_none());
        assert!(compiled
            .admit(&row((8, 10), (8, 40), Some(0.5)), &mut d, &mut m)
            .is_some());
        assert_eq!(
            compiled.stats,
            vec![CompiledStat::Count, CompiledStat::Count]
        );
    }

    #[test]
    fn test_null_derived_input_excludes_row() {
        let compiled = CompiledRequest::new(&request()).unwrap();
        let mut r = row((8, 10), (8, 40), None);
        r.trip.dropoff_datetime = None;
        let (mut d, mut m) = (Vec::new(), Vec::new());
        assert!(compiled.admit(&r, &mut d, &mut m).is_none());
    }

    #[test]
    fn test_is_null_predicate_sees_nulls() {
        let pred = CompiledPredicate::base(&Predicate::is_null("tip_amount")).unwrap();
        assert!(pred.matches(&row((8, 10), (8, 40), None), &[]));
        assert!(!pred.matches(&row((8, 10), (8, 40), Some(1.0)), &[]));
    }

    #[test]
    fn test_base_predicate_rejects_unknown_column() {
        assert!(CompiledPredicate::base(&Predicate::gt("trip_time", 0)).is_err());
    }
}
