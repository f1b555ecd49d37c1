//! Rows produced by sources and the attribute tuples layouts store.

use std::ops::Deref;
use std::sync::Arc;

use crate::{Key, Value};

/// Attribute values of one key, in the dictionary's declared attribute
/// order. Cheap to clone: layouts and callers share the same allocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Attributes(Arc<[Value]>);

impl Attributes {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values.into())
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    /// Whether two handles point at the same stored tuple.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Deref for Attributes {
    type Target = [Value];

    fn deref(&self) -> &[Value] {
        &self.0
    }
}

impl From<Vec<Value>> for Attributes {
    fn from(values: Vec<Value>) -> Self {
        Self::new(values)
    }
}

/// Closed interval `[start, end]` of a range dictionary row.
///
/// A NULL bound is unbounded on that side.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Interval {
    pub start: Value,
    pub end: Value,
}

impl Interval {
    pub fn new(start: impl Into<Value>, end: impl Into<Value>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    pub fn contains(&self, point: &Value) -> bool {
        (self.start.is_null() || &self.start <= point) && (self.end.is_null() || point <= &self.end)
    }

    /// Whether `start > end` with both bounds present.
    pub fn is_inverted(&self) -> bool {
        !self.start.is_null() && !self.end.is_null() && self.start > self.end
    }

    /// Inclusive intervals overlap when neither ends before the other starts.
    pub fn overlaps(&self, other: &Interval) -> bool {
        let self_ends_before = !self.end.is_null() && !other.start.is_null() && self.end < other.start;
        let other_ends_before =
            !other.end.is_null() && !self.start.is_null() && other.end < self.start;
        !(self_ends_before || other_ends_before)
    }
}

/// One decoded source row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub key: Key,
    pub range: Option<Interval>,
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(key: impl Into<Key>, values: Vec<Value>) -> Self {
        Self {
            key: key.into(),
            range: None,
            values,
        }
    }

    pub fn with_range(mut self, range: Interval) -> Self {
        self.range = Some(range);
        self
    }

    pub fn into_attributes(self) -> Attributes {
        Attributes::new(self.values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_contains_inclusive_and_unbounded() {
        let bounded = Interval::new(10i64, 20i64);
        assert!(bounded.contains(&Value::Int64(10)));
        assert!(bounded.contains(&Value::Int64(20)));
        assert!(!bounded.contains(&Value::Int64(21)));

        let open_start = Interval::new(Value::Null, 5i64);
        assert!(open_start.contains(&Value::Int64(i64::MIN)));
        assert!(!open_start.contains(&Value::Int64(6)));
    }

    #[test]
    fn test_interval_overlap() {
        let a = Interval::new(1i64, 5i64);
        assert!(a.overlaps(&Interval::new(5i64, 9i64)));
        assert!(!a.overlaps(&Interval::new(6i64, 9i64)));
        assert!(a.overlaps(&Interval::new(Value::Null, Value::Null)));
        assert!(Interval::new(9i64, 1i64).is_inverted());
    }

    #[test]
    fn test_attributes_share_storage() {
        let attrs = Attributes::new(vec![Value::from("x")]);
        let clone = attrs.clone();
        assert!(attrs.ptr_eq(&clone));
        assert_eq!(clone.get(0), Some(&Value::from("x")));
    }
}
