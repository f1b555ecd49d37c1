//! Range layouts: key → ordered, disjoint, inclusive intervals.
//!
//! Serves both `range_hashed` (simple keys) and `complex_key_range_hashed`.
//! An interval re-delivered with identical bounds replaces the earlier row;
//! any other overlap for the same key aborts the load.

use std::collections::HashMap;

use dictum_core::{Attributes, Interval, Key, Row, SourceError};

use super::snapshot::{SnapshotBuilder, SnapshotData};
use super::Probe;

#[derive(Debug, Clone, Default)]
pub struct RangeData {
    /// Per key, sorted by start (NULL start first).
    map: HashMap<Key, Vec<(Interval, Attributes)>>,
    len: usize,
}

impl RangeData {
    pub fn builder() -> RangeBuilder {
        RangeBuilder::default()
    }

    /// Intervals stored for one key, in order.
    pub fn intervals(&self, key: &Key) -> Option<&[(Interval, Attributes)]> {
        self.map.get(key).map(Vec::as_slice)
    }
}

impl SnapshotData for RangeData {
    type Builder = RangeBuilder;

    fn len(&self) -> usize {
        self.len
    }

    fn to_builder(&self) -> RangeBuilder {
        let mut builder = RangeBuilder::default();
        for (key, intervals) in &self.map {
            let entries = intervals
                .iter()
                .map(|(interval, attrs)| {
                    builder.sequence += 1;
                    Entry {
                        interval: interval.clone(),
                        attrs: attrs.clone(),
                        sequence: builder.sequence,
                    }
                })
                .collect();
            builder.pending.insert(key.clone(), entries);
        }
        builder
    }

    fn get(&self, probe: Probe<'_>) -> Option<Attributes> {
        let point = probe.at?;
        if point.is_null() {
            return None;
        }
        let intervals = self.map.get(probe.key)?;
        let after = intervals.partition_point(|(iv, _)| iv.start.is_null() || &iv.start <= point);
        let (interval, attrs) = intervals.get(after.checked_sub(1)?)?;
        interval.contains(point).then(|| attrs.clone())
    }
}

#[derive(Debug, Clone)]
struct Entry {
    interval: Interval,
    attrs: Attributes,
    sequence: u64,
}

#[derive(Debug, Default)]
pub struct RangeBuilder {
    pending: HashMap<Key, Vec<Entry>>,
    sequence: u64,
}

impl SnapshotBuilder for RangeBuilder {
    type Output = RangeData;

    fn insert(&mut self, row: Row) -> Result<(), SourceError> {
        let Some(interval) = row.range.clone() else {
            return Err(SourceError::data(format!(
                "range layout row for key {} has no interval",
                row.key
            )));
        };
        if interval.is_inverted() {
            return Err(SourceError::data(format!(
                "inverted interval [{}, {}] for key {}",
                interval.start, interval.end, row.key
            )));
        }
        self.sequence += 1;
        let key = row.key.clone();
        self.pending.entry(key).or_default().push(Entry {
            interval,
            attrs: row.into_attributes(),
            sequence: self.sequence,
        });
        Ok(())
    }

    fn finish(self) -> Result<RangeData, SourceError> {
        let mut map = HashMap::with_capacity(self.pending.len());
        let mut len = 0;
        for (key, mut entries) in self.pending {
            // Identical bounds sort together; the highest sequence is kept.
            entries.sort_by(|a, b| {
                a.interval
                    .start
                    .cmp(&b.interval.start)
                    .then_with(|| a.interval.end.cmp(&b.interval.end))
                    .then_with(|| b.sequence.cmp(&a.sequence))
            });
            entries.dedup_by(|later, kept| later.interval == kept.interval);

            for pair in entries.windows(2) {
                if pair[0].interval.overlaps(&pair[1].interval) {
                    return Err(SourceError::data(format!(
                        "overlapping intervals [{}, {}] and [{}, {}] for key {key}",
                        pair[0].interval.start,
                        pair[0].interval.end,
                        pair[1].interval.start,
                        pair[1].interval.end
                    )));
                }
            }
            len += entries.len();
            map.insert(
                key,
                entries.into_iter().map(|e| (e.interval, e.attrs)).collect(),
            );
        }
        Ok(RangeData { map, len })
    }
}
