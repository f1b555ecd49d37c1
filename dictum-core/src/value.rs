//! Typed scalar values stored in dictionaries.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::{SourceError, Timestamp};

/// Declared type of a key field, range column or attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeType {
    UInt64,
    Int64,
    Float64,
    String,
    Bool,
    DateTime,
    /// Only valid as the key field of a polygon dictionary.
    Polygon,
}

impl AttributeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UInt64 => "UInt64",
            Self::Int64 => "Int64",
            Self::Float64 => "Float64",
            Self::String => "String",
            Self::Bool => "Bool",
            Self::DateTime => "DateTime",
            Self::Polygon => "Polygon",
        }
    }

    /// Whether values of this type are usable as range bounds.
    pub fn is_orderable_scalar(&self) -> bool {
        matches!(
            self,
            Self::UInt64 | Self::Int64 | Self::Float64 | Self::DateTime
        )
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A 2D point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A simple polygon: one exterior ring plus optional holes.
///
/// Rings are implicitly closed; a trailing point equal to the first one is
/// accepted and ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    pub exterior: Vec<Point>,
    #[serde(default)]
    pub holes: Vec<Vec<Point>>,
}

impl Polygon {
    pub fn new(exterior: Vec<Point>) -> Self {
        Self {
            exterior,
            holes: Vec::new(),
        }
    }

    pub fn with_hole(mut self, hole: Vec<Point>) -> Self {
        self.holes.push(hole);
        self
    }

    fn rings(&self) -> impl Iterator<Item = &Vec<Point>> {
        std::iter::once(&self.exterior).chain(self.holes.iter())
    }
}

/// A single dictionary value.
///
/// Values of one type are totally ordered (floats by IEEE total order);
/// values of different types order by type rank. Equality and hashing agree
/// with that order, so values can be used inside hash-map keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    UInt64(u64),
    Int64(i64),
    Float64(f64),
    String(String),
    Bool(bool),
    DateTime(Timestamp),
    Polygon(Polygon),
}

impl Value {
    pub fn value_type(&self) -> Option<AttributeType> {
        match self {
            Self::Null => None,
            Self::UInt64(_) => Some(AttributeType::UInt64),
            Self::Int64(_) => Some(AttributeType::Int64),
            Self::Float64(_) => Some(AttributeType::Float64),
            Self::String(_) => Some(AttributeType::String),
            Self::Bool(_) => Some(AttributeType::Bool),
            Self::DateTime(_) => Some(AttributeType::DateTime),
            Self::Polygon(_) => Some(AttributeType::Polygon),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::UInt64(v) => Some(*v),
            Self::Int64(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int64(v) => Some(*v),
            Self::UInt64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float64(v) => Some(*v),
            Self::UInt64(v) => Some(*v as f64),
            Self::Int64(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_polygon(&self) -> Option<&Polygon> {
        match self {
            Self::Polygon(p) => Some(p),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::UInt64(_) => 2,
            Self::Int64(_) => 3,
            Self::Float64(_) => 4,
            Self::String(_) => 5,
            Self::DateTime(_) => 6,
            Self::Polygon(_) => 7,
        }
    }

    /// Parse a textual cell into a value of the declared type.
    ///
    /// NULL markers are format-specific and must be handled by the caller.
    pub fn parse(ty: AttributeType, text: &str) -> Result<Value, SourceError> {
        let bad = |reason: &str| SourceError::data(format!("cannot parse {text:?} as {ty}: {reason}"));
        match ty {
            AttributeType::UInt64 => text
                .trim()
                .parse::<u64>()
                .map(Value::UInt64)
                .map_err(|e| bad(&e.to_string())),
            AttributeType::Int64 => text
                .trim()
                .parse::<i64>()
                .map(Value::Int64)
                .map_err(|e| bad(&e.to_string())),
            AttributeType::Float64 => text
                .trim()
                .parse::<f64>()
                .map(Value::Float64)
                .map_err(|e| bad(&e.to_string())),
            AttributeType::String => Ok(Value::String(text.to_string())),
            AttributeType::Bool => match text.trim() {
                "1" | "true" | "TRUE" | "True" => Ok(Value::Bool(true)),
                "0" | "false" | "FALSE" | "False" => Ok(Value::Bool(false)),
                _ => Err(bad("expected 0/1/true/false")),
            },
            AttributeType::DateTime => parse_datetime(text.trim())
                .map(Value::DateTime)
                .ok_or_else(|| bad("expected RFC 3339, 'YYYY-MM-DD HH:MM:SS' or unix seconds")),
            AttributeType::Polygon => {
                let json: serde_json::Value =
                    serde_json::from_str(text).map_err(|e| bad(&e.to_string()))?;
                Value::from_json(ty, &json)
            }
        }
    }

    /// Convert a JSON cell into a value of the declared type.
    pub fn from_json(ty: AttributeType, json: &serde_json::Value) -> Result<Value, SourceError> {
        use serde_json::Value as J;

        if json.is_null() {
            return Ok(Value::Null);
        }
        let bad = || SourceError::data(format!("cannot convert JSON {json} to {ty}"));
        match (ty, json) {
            (AttributeType::UInt64, J::Number(n)) => n.as_u64().map(Value::UInt64).ok_or_else(bad),
            (AttributeType::Int64, J::Number(n)) => n.as_i64().map(Value::Int64).ok_or_else(bad),
            (AttributeType::Float64, J::Number(n)) => {
                n.as_f64().map(Value::Float64).ok_or_else(bad)
            }
            (AttributeType::Bool, J::Bool(b)) => Ok(Value::Bool(*b)),
            (AttributeType::Bool, J::Number(n)) => match n.as_u64() {
                Some(0) => Ok(Value::Bool(false)),
                Some(1) => Ok(Value::Bool(true)),
                _ => Err(bad()),
            },
            (AttributeType::DateTime, J::Number(n)) => n
                .as_i64()
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
                .map(Value::DateTime)
                .ok_or_else(bad),
            (AttributeType::String, J::String(s)) => Ok(Value::String(s.clone())),
            (AttributeType::String, other) => Ok(Value::String(other.to_string())),
            (AttributeType::Polygon, J::Object(_)) => serde_json::from_value::<Polygon>(json.clone())
                .map(Value::Polygon)
                .map_err(|_| bad()),
            (AttributeType::Polygon, J::Array(rings)) => polygon_from_json_array(rings)
                .map(Value::Polygon)
                .ok_or_else(bad),
            (_, J::String(s)) => Value::parse(ty, s),
            _ => Err(bad()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            Self::Null => J::Null,
            Self::UInt64(v) => J::from(*v),
            Self::Int64(v) => J::from(*v),
            Self::Float64(v) => serde_json::Number::from_f64(*v)
                .map(J::Number)
                .unwrap_or(J::Null),
            Self::String(s) => J::String(s.clone()),
            Self::Bool(b) => J::Bool(*b),
            Self::DateTime(ts) => J::String(ts.format("%Y-%m-%d %H:%M:%S").to_string()),
            Self::Polygon(p) => serde_json::to_value(p).unwrap_or(J::Null),
        }
    }

    /// Coerce a value produced by a connector into the declared type.
    ///
    /// Lossless numeric widening and string parsing are accepted; anything
    /// else is a data error.
    pub fn coerce(self, ty: AttributeType) -> Result<Value, SourceError> {
        if self.is_null() || self.value_type() == Some(ty) {
            return Ok(self);
        }
        let fail = |v: &Value| SourceError::data(format!("cannot coerce {v} to {ty}"));
        match (ty, &self) {
            (AttributeType::UInt64, Value::Int64(_)) => {
                self.as_u64().map(Value::UInt64).ok_or_else(|| fail(&self))
            }
            (AttributeType::Int64, Value::UInt64(_)) => {
                self.as_i64().map(Value::Int64).ok_or_else(|| fail(&self))
            }
            (AttributeType::Float64, Value::UInt64(_) | Value::Int64(_)) => {
                self.as_f64().map(Value::Float64).ok_or_else(|| fail(&self))
            }
            (AttributeType::String, _) => Ok(Value::String(self.to_string())),
            (_, Value::String(s)) => Value::parse(ty, s),
            _ => Err(fail(&self)),
        }
    }

    /// Append a canonical, platform-independent encoding of this value.
    pub fn write_canonical(&self, buf: &mut Vec<u8>) {
        buf.push(self.rank());
        match self {
            Self::Null => {}
            Self::UInt64(v) => buf.extend_from_slice(&v.to_be_bytes()),
            Self::Int64(v) => buf.extend_from_slice(&v.to_be_bytes()),
            Self::Float64(v) => buf.extend_from_slice(&v.to_bits().to_be_bytes()),
            Self::String(s) => {
                buf.extend_from_slice(&(s.len() as u64).to_be_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
            Self::Bool(b) => buf.push(u8::from(*b)),
            Self::DateTime(ts) => {
                buf.extend_from_slice(&ts.timestamp_micros().to_be_bytes());
            }
            Self::Polygon(p) => {
                buf.extend_from_slice(&(p.holes.len() as u64 + 1).to_be_bytes());
                for ring in p.rings() {
                    buf.extend_from_slice(&(ring.len() as u64).to_be_bytes());
                    for pt in ring {
                        buf.extend_from_slice(&pt.x.to_bits().to_be_bytes());
                        buf.extend_from_slice(&pt.y.to_bits().to_be_bytes());
                    }
                }
            }
        }
    }
}

fn parse_datetime(text: &str) -> Option<Timestamp> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    text.parse::<i64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

fn ring_from_json(json: &serde_json::Value) -> Option<Vec<Point>> {
    json.as_array()?
        .iter()
        .map(|pt| {
            let pair = pt.as_array()?;
            match pair.as_slice() {
                [x, y] => Some(Point::new(x.as_f64()?, y.as_f64()?)),
                _ => None,
            }
        })
        .collect()
}

/// Accepts either a single ring `[[x, y], ...]` or a list of rings
/// `[[[x, y], ...], [hole...], ...]`.
fn polygon_from_json_array(rings: &[serde_json::Value]) -> Option<Polygon> {
    let first = rings.first()?;
    let is_single_ring = first
        .as_array()
        .and_then(|pt| pt.first())
        .is_some_and(|c| c.is_number());
    if is_single_ring {
        let exterior = ring_from_json(&serde_json::Value::Array(rings.to_vec()))?;
        return Some(Polygon::new(exterior));
    }
    let mut parsed = rings.iter().map(ring_from_json);
    let exterior = parsed.next()??;
    let holes = parsed.collect::<Option<Vec<_>>>()?;
    Some(Polygon { exterior, holes })
}

fn cmp_points(a: &[Point], b: &[Point]) -> Ordering {
    for (pa, pb) in a.iter().zip(b.iter()) {
        let ord = pa.x.total_cmp(&pb.x).then(pa.y.total_cmp(&pb.y));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::UInt64(a), Self::UInt64(b)) => a.cmp(b),
            (Self::Int64(a), Self::Int64(b)) => a.cmp(b),
            (Self::Float64(a), Self::Float64(b)) => a.total_cmp(b),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::DateTime(a), Self::DateTime(b)) => a.cmp(b),
            (Self::Polygon(a), Self::Polygon(b)) => {
                let mut ra = a.rings();
                let mut rb = b.rings();
                loop {
                    match (ra.next(), rb.next()) {
                        (Some(x), Some(y)) => match cmp_points(x, y) {
                            Ordering::Equal => continue,
                            ord => return ord,
                        },
                        (None, None) => return Ordering::Equal,
                        (None, Some(_)) => return Ordering::Less,
                        (Some(_), None) => return Ordering::Greater,
                    }
                }
            }
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let mut buf = Vec::with_capacity(16);
        self.write_canonical(&mut buf);
        state.write(&buf);
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::UInt64(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::String(s) => f.write_str(s),
            Self::Bool(b) => f.write_str(if *b { "1" } else { "0" }),
            Self::DateTime(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S")),
            Self::Polygon(p) => write!(f, "{}", serde_json::to_string(p).unwrap_or_default()),
        }
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::UInt64(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<Timestamp> for Value {
    fn from(v: Timestamp) -> Self {
        Self::DateTime(v)
    }
}

impl From<Polygon> for Value {
    fn from(v: Polygon) -> Self {
        Self::Polygon(v)
    }
}

// =============================================================================
// TESTS
// =============================================================================
