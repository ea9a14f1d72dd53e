//! CSV loading for the fact and zone tables. Files ending in `.gz` are
//! decompressed on the fly.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use tracing::{debug, info};

use crate::model::{FactTable, Trip, Zone, ZoneTable};

fn open(path: &Path) -> Result<Box<dyn Read>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = BufReader::new(file);
    if path.extension().and_then(|e| e.to_str()) == Some("gz") {
        debug!(path = %path.display(), "Reading gzip-compressed CSV");
        Ok(Box::new(GzDecoder::new(reader)))
    } else {
        Ok(Box::new(reader))
    }
}

fn header(rdr: &mut csv::Reader<Box<dyn Read>>, path: &Path) -> Result<Vec<String>> {
    Ok(rdr
        .headers()
        .with_context(|| format!("reading header of {}", path.display()))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect())
}

/// Reads the trip fact table. The header is kept so the join can report
/// missing columns. Without a `trip_id` column, rows are numbered in file
/// order.
pub fn load_trips(path: impl AsRef<Path>) -> Result<FactTable> {
    let path = path.as_ref();
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(open(path)?);
    let columns = header(&mut rdr, path)?;
    let numbered = columns.iter().any(|c| c == "trip_id");

    let mut trips = Vec::new();
    for (i, result) in rdr.deserialize().enumerate() {
        let mut trip: Trip =
            result.with_context(|| format!("parsing trip {} of {}", i + 1, path.display()))?;
        if !numbered {
            trip.trip_id = i as u64;
        }
        trips.push(trip);
    }

    info!(path = %path.display(), rows = trips.len(), "Loaded trips");
    Ok(FactTable::new(columns, trips))
}

pub fn load_zones(path: impl AsRef<Path>) -> Result<ZoneTable> {
    let path = path.as_ref();
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(open(path)?);
    let columns = header(&mut rdr, path)?;

    let mut zones = Vec::new();
    for (i, result) in rdr.deserialize().enumerate() {
        let zone: Zone =
            result.with_context(|| format!("parsing zone {} of {}", i + 1, path.display()))?;
        zones.push(zone);
    }

    info!(path = %path.display(), rows = zones.len(), "Loaded zones");
    Ok(ZoneTable::new(columns, zones))
}
