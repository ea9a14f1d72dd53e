//! Deterministic train/validation splits.
//!
//! Membership is a pure function of `(trip_id, seed)`: each row hashes to a
//! point in `[0, 1)` and lands in the partition whose cumulative fraction
//! range contains it. A partition is therefore described by a small
//! [`SampleSpec`] instead of a row list, and any backend can evaluate it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ExploreError, Result};
use crate::join::JoinedView;
use crate::model::JoinedTrip;
use crate::query::Predicate;
use crate::query::compile::CompiledPredicate;

const FRACTION_TOLERANCE: f64 = 1e-9;

/// Serializable description of one partition of a view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleSpec {
    pub partition: String,
    pub seed: u64,
    /// Inclusive lower bound of the hash range.
    pub lower: f64,
    /// Exclusive upper bound of the hash range.
    pub upper: f64,
    pub filters: Vec<Predicate>,
}

#[derive(Debug)]
pub struct Sample {
    spec: SampleSpec,
    filters: Vec<CompiledPredicate>,
}

impl Sample {
    pub fn new(spec: SampleSpec) -> Result<Self> {
        let filters = spec
            .filters
            .iter()
            .map(CompiledPredicate::base)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { spec, filters })
    }

    pub fn spec(&self) -> &SampleSpec {
        &self.spec
    }

    pub fn contains(&self, row: &JoinedTrip) -> bool {
        if !self.filters.iter().all(|f| f.matches(row, &[])) {
            return false;
        }
        let point = unit_hash(row.trip.trip_id, self.spec.seed);
        point >= self.spec.lower && point < self.spec.upper
    }
}

fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Maps `(row_id, seed)` uniformly onto `[0, 1)`.
pub fn unit_hash(row_id: u64, seed: u64) -> f64 {
    let mixed = splitmix64(row_id ^ splitmix64(seed));
    // top 53 bits fill an f64 mantissa exactly
    (mixed >> 11) as f64 / (1u64 << 53) as f64
}

pub struct PartitionSampler;

impl PartitionSampler {
    /// Splits the rows of `view` that satisfy `filter` into named, disjoint
    /// partitions of approximately the requested fractions. Rows left over
    /// when the fractions sum below 1.0 belong to no partition.
    pub fn split(
        view: &JoinedView,
        filter: &[Predicate],
        fractions: &[(&str, f64)],
        seed: u64,
    ) -> Result<BTreeMap<String, JoinedView>> {
        validate_fractions(fractions)?;

        let mut partitions = BTreeMap::new();
        let mut lower = 0.0;
        for &(name, fraction) in fractions {
            let upper = lower + fraction;
            let sample = Sample::new(SampleSpec {
                partition: name.to_string(),
                seed,
                lower,
                upper,
                filters: filter.to_vec(),
            })?;
            debug!(partition = name, lower, upper, seed, "Partition range");
            partitions.insert(name.to_string(), view.with_sample(sample));
            lower = upper;
        }
        Ok(partitions)
    }
}

fn validate_fractions(fractions: &[(&str, f64)]) -> Result<()> {
    let invalid = |msg: String| Err(ExploreError::InvalidFractions(msg));

    if fractions.is_empty() {
        return invalid("at least one partition is required".into());
    }
    let mut sum = 0.0;
    for (i, &(name, fraction)) in fractions.iter().enumerate() {
        if name.is_empty() {
            return invalid("partition names must not be empty".into());
        }
        if fractions[..i].iter().any(|(n, _)| *n == name) {
            return invalid(format!("partition '{name}' given twice"));
        }
        if !fraction.is_finite() || fraction < 0.0 {
            return invalid(format!("fraction {fraction} for '{name}' is not a non-negative number"));
        }
        sum += fraction;
    }
    if sum > 1.0 + FRACTION_TOLERANCE {
        return invalid(format!("fractions sum to {sum}, more than 1.0"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Trip, Zone};
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn view(rows: u64) -> JoinedView {
        let zone = Arc::new(Zone {
            zone_id: 1,
            borough: "Manhattan".into(),
            neighborhood: "Midtown".into(),
        });
        let rows = (0..rows)
            .map(|id| JoinedTrip {
                trip: Trip {
                    trip_id: id,
                    passenger_count: Some((id % 4) as i64),
                    ..Default::default()
                },
                pickup: zone.clone(),
                dropoff: zone.clone(),
            })
            .collect();
        JoinedView::new("trips", rows)
    }

    #[test]
    fn test_split_is_reproducible() {
        let v = view(1_000);
        let a = PartitionSampler::split(&v, &[], &[("train", 0.8), ("test", 0.2)], 42).unwrap();
        let b = PartitionSampler::split(&v, &[], &[("train", 0.8), ("test", 0.2)], 42).unwrap();
        for name in ["train", "test"] {
            assert_eq!(a[name].row_ids(), b[name].row_ids());
        }
    }

    #[test]
    fn test_partitions_are_disjoint_and_cover() {
        let v = view(1_000);
        let parts = PartitionSampler::split(&v, &[], &[("train", 0.7), ("test", 0.3)], 7).unwrap();
        let train = parts["train"].row_ids();
        let test = parts["test"].row_ids();
        assert!(train.is_disjoint(&test));
        assert_eq!(train.len() + test.len(), 1_000);
    }

    #[test]
    fn test_seed_changes_membership() {
        let v = view(1_000);
        let a = PartitionSampler::split(&v, &[], &[("train", 0.5)], 1).unwrap();
        let b = PartitionSampler::split(&v, &[], &[("train", 0.5)], 2).unwrap();
        assert_ne!(a["train"].row_ids(), b["train"].row_ids());
    }

    #[test]
    fn test_sizes_approach_fractions() {
        let v = view(20_000);
        let parts = PartitionSampler::split(&v, &[], &[("train", 0.8), ("test", 0.2)], 99).unwrap();
        let train = parts["train"].len() as f64 / 20_000.0;
        assert!((train - 0.8).abs() < 0.02, "train share {train}");
    }

    #[test]
    fn test_filter_applies_before_split() {
        let v = view(400);
        let parts = PartitionSampler::split(
            &v,
            &[Predicate::eq("passenger_count", 1)],
            &[("train", 1.0)],
            3,
        )
        .unwrap();
        let expected: BTreeSet<u64> = (0..400).filter(|id| id % 4 == 1).collect();
        assert_eq!(parts["train"].row_ids(), expected);
    }

    #[test]
    fn test_nested_split_respects_parent() {
        let v = view(2_000);
        let outer = PartitionSampler::split(&v, &[], &[("train", 0.5)], 11).unwrap();
        let inner =
            PartitionSampler::split(&outer["train"], &[], &[("fit", 0.5), ("tune", 0.5)], 12)
                .unwrap();
        let parent = outer["train"].row_ids();
        let fit = inner["fit"].row_ids();
        let tune = inner["tune"].row_ids();
        assert!(fit.is_subset(&parent));
        assert!(fit.is_disjoint(&tune));
        assert_eq!(fit.len() + tune.len(), parent.len());
    }

    #[test]
    fn test_invalid_fractions() {
        let v = view(10);
        for fractions in [
            vec![("train", 0.8), ("test", 0.3)],
            vec![("train", -0.1)],
            vec![("train", f64::NAN)],
            vec![("train", 0.5), ("train", 0.2)],
            vec![("", 0.5)],
            vec![],
        ] {
            let err = PartitionSampler::split(&v, &[], &fractions, 1).unwrap_err();
            assert!(matches!(err, ExploreError::InvalidFractions(_)), "{fractions:?}");
        }
    }

    #[test]
    fn test_filter_on_unknown_column_is_invalid_request() {
        let err = PartitionSampler::split(&view(10), &[Predicate::gt("trip_time", 0)], &[("a", 1.0)], 1)
            .unwrap_err();
        assert!(matches!(err, ExploreError::RequestInvalid(_)));
    }

    #[test]
    fn test_unit_hash_range() {
        for id in 0..10_000 {
            let p = unit_hash(id, 5);
            assert!((0.0..1.0).contains(&p));
        }
    }
}
