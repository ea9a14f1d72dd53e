//! The canonical trip ⋈ zone view and its process-wide cache.
//!
//! [`GeoJoinView`] joins the fact table to the zone table twice (pickup and
//! dropoff), drops trips whose endpoints cannot be resolved, and caches the
//! result under a logical name. Cached views are immutable and shared by
//! reference, so any number of sessions can read them concurrently.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{debug, info, warn};

use crate::error::{ExploreError, Result};
use crate::model::{FactTable, Field, JoinedTrip, Zone, ZoneTable};
use crate::partition::Sample;

/// Fact columns the join and the query vocabulary rely on. Coordinates and
/// `trip_id` are optional.
pub const REQUIRED_FACT_COLUMNS: [&str; 9] = [
    "vendor_id",
    "pickup_datetime",
    "dropoff_datetime",
    "pickup_zone_id",
    "dropoff_zone_id",
    "passenger_count",
    "trip_distance",
    "fare_amount",
    "tip_amount",
];

/// A handle on joined rows, optionally narrowed by one or more samples.
/// Cloning is cheap: rows are shared.
#[derive(Debug, Clone)]
pub struct JoinedView {
    name: Arc<str>,
    rows: Arc<[JoinedTrip]>,
    samples: Vec<Arc<Sample>>,
}

impl JoinedView {
    pub fn new(name: &str, rows: Vec<JoinedTrip>) -> Self {
        Self {
            name: Arc::from(name),
            rows: Arc::from(rows),
            samples: Vec::new(),
        }
    }

    /// Logical name of the cached view these rows come from.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn samples(&self) -> &[Arc<Sample>] {
        &self.samples
    }

    pub fn is_sampled(&self) -> bool {
        !self.samples.is_empty()
    }

    /// All joined rows, ignoring samples.
    pub(crate) fn base_rows(&self) -> &Arc<[JoinedTrip]> {
        &self.rows
    }

    pub fn base_len(&self) -> usize {
        self.rows.len()
    }

    pub fn contains(&self, row: &JoinedTrip) -> bool {
        self.samples.iter().all(|s| s.contains(row))
    }

    pub fn iter(&self) -> impl Iterator<Item = &JoinedTrip> + '_ {
        self.rows.iter().filter(move |row| self.contains(row))
    }

    /// Number of visible rows. Linear in the base size for sampled views.
    pub fn len(&self) -> usize {
        if self.samples.is_empty() {
            self.rows.len()
        } else {
            self.iter().count()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn row_ids(&self) -> BTreeSet<u64> {
        self.iter().map(|row| row.trip.trip_id).collect()
    }

    /// Numeric columns of every visible row with no nulls among `fields`.
    /// Non-numeric fields make every row drop out.
    pub fn numeric_rows(&self, fields: &[Field]) -> Vec<Vec<f64>> {
        self.iter()
            .filter_map(|row| {
                fields
                    .iter()
                    .map(|f| f.value(row).as_f64())
                    .collect::<Option<Vec<_>>>()
            })
            .collect()
    }

    pub(crate) fn with_sample(&self, sample: Sample) -> Self {
        let mut samples = self.samples.clone();
        samples.push(Arc::new(sample));
        Self {
            name: self.name.clone(),
            rows: self.rows.clone(),
            samples,
        }
    }
}

/// Write-once cache of joined views, keyed by logical name.
///
/// Builders of one name serialize on a per-name lock, so the join runs once.
/// The map lock is only taken for lookups and inserts, never across a join.
#[derive(Debug, Default)]
pub struct GeoJoinView {
    cache: RwLock<HashMap<String, JoinedView>>,
    building: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl GeoJoinView {
    pub fn new() -> Self {
        Self::default()
    }

    fn build_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.building
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    fn insert(&self, name: &str, view: &JoinedView) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), view.clone());
    }

    /// Returns the view cached under `name`, joining `facts` with `zones`
    /// first if nothing is cached yet. A cache hit never re-runs the join.
    #[tracing::instrument(
        skip(self, facts, zones),
        fields(facts = facts.trips.len(), zones = zones.zones.len())
    )]
    pub fn build(&self, name: &str, facts: &FactTable, zones: &ZoneTable) -> Result<JoinedView> {
        if let Some(view) = self.get(name) {
            debug!("Joined view already cached");
            return Ok(view);
        }

        let lock = self.build_lock(name);
        let _building = lock.lock().unwrap_or_else(PoisonError::into_inner);
        // another builder may have finished while we waited
        if let Some(view) = self.get(name) {
            return Ok(view);
        }
        let view = join(name, facts, zones)?;
        self.insert(name, &view);
        Ok(view)
    }

    /// Joins again and replaces whatever is cached under `name`.
    #[tracing::instrument(skip(self, facts, zones))]
    pub fn rebuild(&self, name: &str, facts: &FactTable, zones: &ZoneTable) -> Result<JoinedView> {
        let lock = self.build_lock(name);
        let _building = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let view = join(name, facts, zones)?;
        self.insert(name, &view);
        Ok(view)
    }

    pub fn get(&self, name: &str) -> Option<JoinedView> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn evict(&self, name: &str) -> bool {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }
}

fn require_columns(table: &str, present: &[String], required: &[&str]) -> Result<()> {
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|col| !present.iter().any(|p| p == col))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ExploreError::SchemaMismatch(format!(
            "{table} table is missing column(s): {}",
            missing.join(", ")
        )))
    }
}

fn join(name: &str, facts: &FactTable, zones: &ZoneTable) -> Result<JoinedView> {
    require_columns("fact", &facts.columns, &REQUIRED_FACT_COLUMNS)?;
    require_columns("zone", &zones.columns, &ZoneTable::COLUMNS)?;

    let mut lookup: HashMap<i64, Arc<Zone>> = HashMap::with_capacity(zones.zones.len());
    for zone in &zones.zones {
        if lookup.insert(zone.zone_id, Arc::new(zone.clone())).is_some() {
            return Err(ExploreError::SchemaMismatch(format!(
                "zone_id {} appears more than once in the zone table",
                zone.zone_id
            )));
        }
    }

    let mut null_ids = 0usize;
    let mut unmatched = 0usize;
    let mut rows = Vec::with_capacity(facts.trips.len());

    for trip in &facts.trips {
        let (Some(pickup_id), Some(dropoff_id)) = (trip.pickup_zone_id, trip.dropoff_zone_id)
        else {
            null_ids += 1;
            continue;
        };
        match (lookup.get(&pickup_id), lookup.get(&dropoff_id)) {
            (Some(pickup), Some(dropoff)) => rows.push(JoinedTrip {
                trip: trip.clone(),
                pickup: pickup.clone(),
                dropoff: dropoff.clone(),
            }),
            _ => unmatched += 1,
        }
    }

    if unmatched > 0 {
        warn!(
            unmatched,
            "Trips reference zone ids missing from the zone table, excluded"
        );
    }
    info!(view = name, rows = rows.len(), null_ids, "Joined view built");

    Ok(JoinedView::new(name, rows))
}
