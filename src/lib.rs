//! Interactive grouped statistics over a large trip dataset joined to a
//! zone dimension table.
//!
//! The pieces, leaf first: [`join::GeoJoinView`] builds and caches the
//! joined view, [`query::AggregationRequest`] describes a grouped
//! aggregation without running it, [`engine::AggregationEngine`] hands the
//! request to a [`backend::Backend`] as one job, [`partition`] carves
//! reproducible train/validation splits and [`session::ReactiveSession`]
//! recomputes and republishes results when parameters change.

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod fit;
pub mod join;
pub mod loader;
pub mod model;
pub mod output;
pub mod partition;
pub mod query;
pub mod result;
pub mod session;

pub use error::{ExploreError, Result};
