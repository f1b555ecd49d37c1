//! Polygon layout: point-in-polygon lookup.
//!
//! Rows are keyed by a single `Polygon` field; lookups pass the point as a
//! two-field numeric key `(x, y)`. Candidates are pre-filtered by bounding
//! box and tested in load order, so where polygons overlap the first one
//! loaded wins. Points on a boundary (exterior or hole) count as inside.

use dictum_core::{Attributes, Key, KeyModel, LookupError, Point, Polygon, Row, SourceError, Value};

use super::snapshot::{SnapshotBuilder, SnapshotData};
use super::Probe;

#[derive(Debug, Clone, Copy, PartialEq)]
struct BoundingBox {
    min: Point,
    max: Point,
}

impl BoundingBox {
    fn of(ring: &[Point]) -> Option<Self> {
        let first = ring.first()?;
        let mut bbox = BoundingBox {
            min: *first,
            max: *first,
        };
        for p in &ring[1..] {
            bbox.min.x = bbox.min.x.min(p.x);
            bbox.min.y = bbox.min.y.min(p.y);
            bbox.max.x = bbox.max.x.max(p.x);
            bbox.max.y = bbox.max.y.max(p.y);
        }
        Some(bbox)
    }

    fn contains(&self, p: Point) -> bool {
        self.min.x <= p.x && p.x <= self.max.x && self.min.y <= p.y && p.y <= self.max.y
    }
}

#[derive(Debug, Clone)]
struct Entry {
    polygon: Polygon,
    bbox: BoundingBox,
    attrs: Attributes,
}

#[derive(Debug, Clone, Default)]
pub struct PolygonData {
    entries: Vec<Entry>,
}

impl PolygonData {
    pub fn builder() -> PolygonBuilder {
        PolygonBuilder::default()
    }

    /// First polygon, in load order, containing `point`.
    pub fn find(&self, point: Point) -> Option<&Attributes> {
        self.entries
            .iter()
            .filter(|e| e.bbox.contains(point))
            .find(|e| polygon_contains(&e.polygon, point))
            .map(|e| &e.attrs)
    }
}

impl SnapshotData for PolygonData {
    type Builder = PolygonBuilder;

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn to_builder(&self) -> PolygonBuilder {
        PolygonBuilder {
            entries: self.entries.clone(),
        }
    }

    fn get(&self, probe: Probe<'_>) -> Option<Attributes> {
        let point = point_of(probe.key)?;
        self.find(point).cloned()
    }

    fn check_key(_model: &KeyModel, key: &Key) -> Result<(), LookupError> {
        point_of(key).map(|_| ()).ok_or_else(|| LookupError::KeyMismatch {
            expected: "(x Float64, y Float64)".to_string(),
            got: key.to_string(),
        })
    }
}

#[derive(Debug, Default)]
pub struct PolygonBuilder {
    entries: Vec<Entry>,
}

impl SnapshotBuilder for PolygonBuilder {
    type Output = PolygonData;

    fn insert(&mut self, row: Row) -> Result<(), SourceError> {
        let polygon = match row.key.fields() {
            Some([Value::Polygon(p)]) => p.clone(),
            _ => {
                return Err(SourceError::data(format!(
                    "polygon key must be one Polygon field, got {}",
                    row.key
                )))
            }
        };
        if polygon.exterior.len() < 3 {
            return Err(SourceError::data(format!(
                "polygon exterior needs at least 3 points, got {}",
                polygon.exterior.len()
            )));
        }
        let bbox = BoundingBox::of(&polygon.exterior)
            .ok_or_else(|| SourceError::data("polygon exterior is empty"))?;
        self.entries.push(Entry {
            polygon,
            bbox,
            attrs: row.into_attributes(),
        });
        Ok(())
    }

    fn finish(self) -> Result<PolygonData, SourceError> {
        Ok(PolygonData {
            entries: self.entries,
        })
    }
}

fn point_of(key: &Key) -> Option<Point> {
    match key.fields()? {
        [x, y] => Some(Point::new(x.as_f64()?, y.as_f64()?)),
        _ => None,
    }
}

enum RingPosition {
    Inside,
    Boundary,
    Outside,
}

fn polygon_contains(polygon: &Polygon, point: Point) -> bool {
    if matches!(ring_position(&polygon.exterior, point), RingPosition::Outside) {
        return false;
    }
    !polygon
        .holes
        .iter()
        .any(|hole| matches!(ring_position(hole, point), RingPosition::Inside))
}

/// Even-odd ray cast, with an explicit on-segment check first.
fn ring_position(ring: &[Point], p: Point) -> RingPosition {
    let n = ring.len();
    if n == 0 {
        return RingPosition::Outside;
    }
    let mut inside = false;
    for i in 0..n {
        let a = ring[i];
        let b = ring[(i + 1) % n];
        if on_segment(a, b, p) {
            return RingPosition::Boundary;
        }
        if (a.y > p.y) != (b.y > p.y) {
            let x_cross = a.x + (p.y - a.y) * (b.x - a.x) / (b.y - a.y);
            if p.x < x_cross {
                inside = !inside;
            }
        }
    }
    if inside {
        RingPosition::Inside
    } else {
        RingPosition::Outside
    }
}

fn on_segment(a: Point, b: Point, p: Point) -> bool {
    let cross = (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x);
    let scale = (b.x - a.x).abs().max((b.y - a.y).abs()).max(1.0);
    if cross.abs() > f64::EPSILON * 16.0 * scale * scale {
        return false;
    }
    p.x >= a.x.min(b.x) && p.x <= a.x.max(b.x) && p.y >= a.y.min(b.y) && p.y <= a.y.max(b.y)
}
