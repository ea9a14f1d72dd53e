//! Trip and zone records, the closed column vocabulary and typed cell values.

use chrono::{Datelike, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// A single trip from the fact table. Every attribute except the row
/// identity may be null in the source data.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Trip {
    #[serde(default)]
    pub trip_id: u64,
    #[serde(default)]
    pub vendor_id: Option<String>,
    #[serde(default, with = "timestamp_format")]
    pub pickup_datetime: Option<NaiveDateTime>,
    #[serde(default, with = "timestamp_format")]
    pub dropoff_datetime: Option<NaiveDateTime>,
    #[serde(default)]
    pub pickup_longitude: Option<f64>,
    #[serde(default)]
    pub pickup_latitude: Option<f64>,
    #[serde(default)]
    pub dropoff_longitude: Option<f64>,
    #[serde(default)]
    pub dropoff_latitude: Option<f64>,
    #[serde(default)]
    pub pickup_zone_id: Option<i64>,
    #[serde(default)]
    pub dropoff_zone_id: Option<i64>,
    #[serde(default)]
    pub passenger_count: Option<i64>,
    #[serde(default)]
    pub trip_distance: Option<f64>,
    #[serde(default)]
    pub fare_amount: Option<f64>,
    #[serde(default)]
    pub tip_amount: Option<f64>,
}

/// A row of the zone dimension table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Zone {
    pub zone_id: i64,
    pub borough: String,
    pub neighborhood: String,
}

/// A trip with both endpoint zones resolved. Only constructed by the
/// geo join, which guarantees both zones exist.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedTrip {
    pub trip: Trip,
    pub pickup: Arc<Zone>,
    pub dropoff: Arc<Zone>,
}

/// The fact table together with the header it was read with.
#[derive(Debug, Clone, Default)]
pub struct FactTable {
    pub columns: Vec<String>,
    pub trips: Vec<Trip>,
}

impl FactTable {
    pub fn new(columns: Vec<String>, trips: Vec<Trip>) -> Self {
        Self { columns, trips }
    }

    /// Wraps in-memory trips with the complete fact schema.
    pub fn from_trips(trips: Vec<Trip>) -> Self {
        let columns = Field::ALL
            .iter()
            .filter(|f| f.is_fact())
            .map(|f| f.name().to_string())
            .collect();
        Self { columns, trips }
    }
}

/// The zone dimension table together with the header it was read with.
#[derive(Debug, Clone, Default)]
pub struct ZoneTable {
    pub columns: Vec<String>,
    pub zones: Vec<Zone>,
}

impl ZoneTable {
    pub const COLUMNS: [&'static str; 3] = ["zone_id", "borough", "neighborhood"];

    pub fn new(columns: Vec<String>, zones: Vec<Zone>) -> Self {
        Self { columns, zones }
    }

    pub fn from_zones(zones: Vec<Zone>) -> Self {
        let columns = Self::COLUMNS.iter().map(|c| c.to_string()).collect();
        Self { columns, zones }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Int,
    Float,
    Text,
    Timestamp,
}

impl ValueType {
    pub fn is_numeric(self) -> bool {
        matches!(self, ValueType::Int | ValueType::Float)
    }

    /// Floats and timestamps make poor group keys and are rejected.
    pub fn is_groupable(self) -> bool {
        matches!(self, ValueType::Int | ValueType::Text)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ValueType::Int => "int",
            ValueType::Float => "float",
            ValueType::Text => "text",
            ValueType::Timestamp => "timestamp",
        };
        f.write_str(name)
    }
}

/// Columns of the joined view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    TripId,
    VendorId,
    PickupDatetime,
    DropoffDatetime,
    PickupLongitude,
    PickupLatitude,
    DropoffLongitude,
    DropoffLatitude,
    PickupZoneId,
    DropoffZoneId,
    PassengerCount,
    TripDistance,
    FareAmount,
    TipAmount,
    PickupBorough,
    PickupNeighborhood,
    DropoffBorough,
    DropoffNeighborhood,
}

impl Field {
    pub const ALL: [Field; 18] = [
        Field::TripId,
        Field::VendorId,
        Field::PickupDatetime,
        Field::DropoffDatetime,
        Field::PickupLongitude,
        Field::PickupLatitude,
        Field::DropoffLongitude,
        Field::DropoffLatitude,
        Field::PickupZoneId,
        Field::DropoffZoneId,
        Field::PassengerCount,
        Field::TripDistance,
        Field::FareAmount,
        Field::TipAmount,
        Field::PickupBorough,
        Field::PickupNeighborhood,
        Field::DropoffBorough,
        Field::DropoffNeighborhood,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Field::TripId => "trip_id",
            Field::VendorId => "vendor_id",
            Field::PickupDatetime => "pickup_datetime",
            Field::DropoffDatetime => "dropoff_datetime",
            Field::PickupLongitude => "pickup_longitude",
            Field::PickupLatitude => "pickup_latitude",
            Field::DropoffLongitude => "dropoff_longitude",
            Field::DropoffLatitude => "dropoff_latitude",
            Field::PickupZoneId => "pickup_zone_id",
            Field::DropoffZoneId => "dropoff_zone_id",
            Field::PassengerCount => "passenger_count",
            Field::TripDistance => "trip_distance",
            Field::FareAmount => "fare_amount",
            Field::TipAmount => "tip_amount",
            Field::PickupBorough => "pickup_borough",
            Field::PickupNeighborhood => "pickup_neighborhood",
            Field::DropoffBorough => "dropoff_borough",
            Field::DropoffNeighborhood => "dropoff_neighborhood",
        }
    }

    pub fn from_name(name: &str) -> Option<Field> {
        Self::ALL.iter().copied().find(|f| f.name() == name)
    }

    pub fn value_type(self) -> ValueType {
        match self {
            Field::TripId | Field::PickupZoneId | Field::DropoffZoneId | Field::PassengerCount => {
                ValueType::Int
            }
            Field::PickupDatetime | Field::DropoffDatetime => ValueType::Timestamp,
            Field::PickupLongitude
            | Field::PickupLatitude
            | Field::DropoffLongitude
            | Field::DropoffLatitude
            | Field::TripDistance
            | Field::FareAmount
            | Field::TipAmount => ValueType::Float,
            Field::VendorId
            | Field::PickupBorough
            | Field::PickupNeighborhood
            | Field::DropoffBorough
            | Field::DropoffNeighborhood => ValueType::Text,
        }
    }

    /// `true` for columns sourced from the fact table rather than the zones.
    pub fn is_fact(self) -> bool {
        !matches!(
            self,
            Field::PickupBorough
                | Field::PickupNeighborhood
                | Field::DropoffBorough
                | Field::DropoffNeighborhood
        )
    }

    pub fn value(self, row: &JoinedTrip) -> Value<'_> {
        let t = &row.trip;
        match self {
            Field::TripId => Value::Int(t.trip_id as i64),
            Field::VendorId => t.vendor_id.as_deref().map_or(Value::Null, Value::Text),
            Field::PickupDatetime => t.pickup_datetime.map_or(Value::Null, Value::Timestamp),
            Field::DropoffDatetime => t.dropoff_datetime.map_or(Value::Null, Value::Timestamp),
            Field::PickupLongitude => t.pickup_longitude.map_or(Value::Null, Value::Float),
            Field::PickupLatitude => t.pickup_latitude.map_or(Value::Null, Value::Float),
            Field::DropoffLongitude => t.dropoff_longitude.map_or(Value::Null, Value::Float),
            Field::DropoffLatitude => t.dropoff_latitude.map_or(Value::Null, Value::Float),
            Field::PickupZoneId => t.pickup_zone_id.map_or(Value::Null, Value::Int),
            Field::DropoffZoneId => t.dropoff_zone_id.map_or(Value::Null, Value::Int),
            Field::PassengerCount => t.passenger_count.map_or(Value::Null, Value::Int),
            Field::TripDistance => t.trip_distance.map_or(Value::Null, Value::Float),
            Field::FareAmount => t.fare_amount.map_or(Value::Null, Value::Float),
            Field::TipAmount => t.tip_amount.map_or(Value::Null, Value::Float),
            Field::PickupBorough => Value::Text(&row.pickup.borough),
            Field::PickupNeighborhood => Value::Text(&row.pickup.neighborhood),
            Field::DropoffBorough => Value::Text(&row.dropoff.borough),
            Field::DropoffNeighborhood => Value::Text(&row.dropoff.neighborhood),
        }
    }
}

/// A cell value borrowed from a joined row or produced by a derived column.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value<'a> {
    Null,
    Int(i64),
    Float(f64),
    Text(&'a str),
    Timestamp(NaiveDateTime),
}

impl Value<'_> {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Int(v) => Some(v as f64),
            Value::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match *self {
            Value::Timestamp(ts) => Some(ts),
            _ => None,
        }
    }

    pub fn to_key(&self) -> Option<KeyValue> {
        match *self {
            Value::Int(v) => Some(KeyValue::Int(v)),
            Value::Text(s) => Some(KeyValue::Text(s.to_string())),
            _ => None,
        }
    }

    /// Orders a cell against a literal. `None` when either side is null or
    /// the types are incomparable.
    pub fn compare(&self, literal: &Literal) -> Option<Ordering> {
        match (*self, literal) {
            (Value::Int(a), Literal::Int(b)) => Some(a.cmp(b)),
            (Value::Int(_) | Value::Float(_), Literal::Int(_) | Literal::Float(_)) => {
                self.as_f64()?.partial_cmp(&literal.as_f64()?)
            }
            (Value::Text(a), Literal::Text(b)) => Some(a.cmp(&b.as_str())),
            (Value::Timestamp(a), Literal::Timestamp(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

/// A constant used on the right-hand side of a predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Literal {
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(NaiveDateTime),
}

impl Literal {
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Literal::Int(v) => Some(v as f64),
            Literal::Float(v) => Some(v),
            _ => None,
        }
    }

    /// Whether this literal can be compared against a column of `ty`.
    pub fn fits(&self, ty: ValueType) -> bool {
        match self {
            Literal::Int(_) | Literal::Float(_) => ty.is_numeric(),
            Literal::Text(_) => ty == ValueType::Text,
            Literal::Timestamp(_) => ty == ValueType::Timestamp,
        }
    }
}

impl From<i64> for Literal {
    fn from(v: i64) -> Self {
        Literal::Int(v)
    }
}

impl From<i32> for Literal {
    fn from(v: i32) -> Self {
        Literal::Int(v as i64)
    }
}

impl From<f64> for Literal {
    fn from(v: f64) -> Self {
        Literal::Float(v)
    }
}

impl From<&str> for Literal {
    fn from(v: &str) -> Self {
        Literal::Text(v.to_string())
    }
}

impl From<String> for Literal {
    fn from(v: String) -> Self {
        Literal::Text(v)
    }
}

impl From<NaiveDateTime> for Literal {
    fn from(v: NaiveDateTime) -> Self {
        Literal::Timestamp(v)
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Literal::Int(v) => write!(f, "{v}"),
            Literal::Float(v) => write!(f, "{v}"),
            Literal::Text(v) => write!(f, "'{v}'"),
            Literal::Timestamp(v) => write!(f, "{v}"),
        }
    }
}

/// One component of a group key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyValue {
    Int(i64),
    Text(String),
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KeyValue::Int(v) => write!(f, "{v}"),
            KeyValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for KeyValue {
    fn from(v: i64) -> Self {
        KeyValue::Int(v)
    }
}

impl From<&str> for KeyValue {
    fn from(v: &str) -> Self {
        KeyValue::Text(v.to_string())
    }
}

pub(crate) fn extract_hour(ts: NaiveDateTime) -> i64 {
    ts.hour() as i64
}

pub(crate) fn extract_week(ts: NaiveDateTime) -> i64 {
    ts.iso_week().week() as i64
}

pub(crate) fn extract_year(ts: NaiveDateTime) -> i64 {
    ts.year() as i64
}

/// Accepts `YYYY-MM-DD HH:MM:SS` (the usual trip-record layout) as well as
/// ISO `YYYY-MM-DDTHH:MM:SS`; empty cells are null.
pub(crate) mod timestamp_format {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, de::Error};

    const FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

    pub fn parse(raw: &str) -> Option<NaiveDateTime> {
        FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Option<NaiveDateTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(d)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(s) => parse(s)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("unparseable timestamp '{s}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2015, 1, 5)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn joined() -> JoinedTrip {
        JoinedTrip {
            trip: Trip {
                trip_id: 7,
                pickup_datetime: Some(ts(8, 10)),
                fare_amount: Some(12.5),
                ..Default::default()
            },
            pickup: Arc::new(Zone {
                zone_id: 1,
                borough: "Manhattan".into(),
                neighborhood: "Midtown".into(),
            }),
            dropoff: Arc::new(Zone {
                zone_id: 2,
                borough: "Queens".into(),
                neighborhood: "Airport".into(),
            }),
        }
    }

    #[test]
    fn test_field_names_round_trip() {
        for field in Field::ALL {
            assert_eq!(Field::from_name(field.name()), Some(field));
        }
        assert_eq!(Field::from_name("trip_time"), None);
    }

    #[test]
    fn test_field_values_from_joined_row() {
        let row = joined();
        assert_eq!(Field::TripId.value(&row), Value::Int(7));
        assert_eq!(Field::FareAmount.value(&row), Value::Float(12.5));
        assert_eq!(Field::TipAmount.value(&row), Value::Null);
        assert_eq!(Field::DropoffNeighborhood.value(&row), Value::Text("Airport"));
    }

    #[test]
    fn test_compare_numeric_across_int_and_float() {
        assert_eq!(
            Value::Int(3).compare(&Literal::Float(2.5)),
            Some(Ordering::Greater)
        );
        assert_eq!(Value::Float(1.0).compare(&Literal::Int(1)), Some(Ordering::Equal));
        assert_eq!(Value::Null.compare(&Literal::Int(1)), None);
        assert_eq!(Value::Text("a").compare(&Literal::Int(1)), None);
    }

    #[test]
    fn test_literal_fits_column_type() {
        assert!(Literal::Int(1).fits(ValueType::Float));
        assert!(!Literal::Text("x".into()).fits(ValueType::Int));
        assert!(Literal::Timestamp(ts(1, 0)).fits(ValueType::Timestamp));
    }

    #[test]
    fn test_timestamp_formats() {
        assert_eq!(timestamp_format::parse("2015-01-05 08:10:00"), Some(ts(8, 10)));
        assert_eq!(timestamp_format::parse("2015-01-05T08:10:00"), Some(ts(8, 10)));
        assert_eq!(timestamp_format::parse("yesterday"), None);
    }

    #[test]
    fn test_extractors() {
        let t = ts(17, 45);
        assert_eq!(extract_hour(t), 17);
        assert_eq!(extract_week(t), 2);
        assert_eq!(extract_year(t), 2015);
    }
}
