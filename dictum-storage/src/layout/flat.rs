//! Flat layout: a dense array indexed directly by a simple key.

use dictum_core::{Attributes, Key, Row, SourceError};
use serde::Deserialize;

use super::snapshot::{SnapshotBuilder, SnapshotData};
use super::Probe;

pub const DEFAULT_MAX_ARRAY_SIZE: u64 = 500_000;
pub const DEFAULT_INITIAL_ARRAY_SIZE: usize = 1024;

fn default_max_array_size() -> u64 {
    DEFAULT_MAX_ARRAY_SIZE
}

fn default_initial_array_size() -> usize {
    DEFAULT_INITIAL_ARRAY_SIZE
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct FlatParams {
    #[serde(default = "default_max_array_size")]
    pub max_array_size: u64,
    #[serde(default = "default_initial_array_size")]
    pub initial_array_size: usize,
}

impl Default for FlatParams {
    fn default() -> Self {
        Self {
            max_array_size: DEFAULT_MAX_ARRAY_SIZE,
            initial_array_size: DEFAULT_INITIAL_ARRAY_SIZE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlatData {
    slots: Vec<Option<Attributes>>,
    len: usize,
    max_array_size: u64,
}

impl FlatData {
    pub fn builder(params: FlatParams) -> FlatBuilder {
        FlatBuilder {
            slots: Vec::with_capacity(params.initial_array_size.min(params.max_array_size as usize)),
            len: 0,
            max_array_size: params.max_array_size,
        }
    }
}

impl SnapshotData for FlatData {
    type Builder = FlatBuilder;

    fn len(&self) -> usize {
        self.len
    }

    fn to_builder(&self) -> FlatBuilder {
        FlatBuilder {
            slots: self.slots.clone(),
            len: self.len,
            max_array_size: self.max_array_size,
        }
    }

    fn get(&self, probe: Probe<'_>) -> Option<Attributes> {
        let id = probe.key.as_simple()?;
        let index = usize::try_from(id).ok()?;
        self.slots.get(index).cloned().flatten()
    }
}

#[derive(Debug)]
pub struct FlatBuilder {
    slots: Vec<Option<Attributes>>,
    len: usize,
    max_array_size: u64,
}

impl SnapshotBuilder for FlatBuilder {
    type Output = FlatData;

    fn insert(&mut self, row: Row) -> Result<(), SourceError> {
        let Key::Simple(id) = row.key else {
            return Err(SourceError::data(format!(
                "flat layout requires simple keys, got {}",
                row.key
            )));
        };
        if id >= self.max_array_size {
            return Err(SourceError::data(format!(
                "key {id} exceeds max_array_size {}",
                self.max_array_size
            )));
        }
        let index = id as usize;
        if index >= self.slots.len() {
            self.slots.resize(index + 1, None);
        }
        if self.slots[index].is_none() {
            self.len += 1;
        }
        self.slots[index] = Some(row.into_attributes());
        Ok(())
    }

    fn finish(self) -> Result<FlatData, SourceError> {
        Ok(FlatData {
            slots: self.slots,
            len: self.len,
            max_array_size: self.max_array_size,
        })
    }
}
