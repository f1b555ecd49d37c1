//! Hashed and complex-key hashed layouts.

use std::collections::HashMap;

use dictum_core::{Attributes, Key, Row, SourceError};

use super::snapshot::{SnapshotBuilder, SnapshotData};
use super::Probe;

/// Key → attributes. On duplicate keys the last loaded row wins.
#[derive(Debug, Clone, Default)]
pub struct HashedData {
    map: HashMap<Key, Attributes>,
}

impl HashedData {
    pub fn builder() -> HashedBuilder {
        HashedBuilder::default()
    }
}

impl SnapshotData for HashedData {
    type Builder = HashedBuilder;

    fn len(&self) -> usize {
        self.map.len()
    }

    fn to_builder(&self) -> HashedBuilder {
        HashedBuilder {
            map: self.map.clone(),
        }
    }

    fn get(&self, probe: Probe<'_>) -> Option<Attributes> {
        self.map.get(probe.key).cloned()
    }
}

#[derive(Debug, Default)]
pub struct HashedBuilder {
    map: HashMap<Key, Attributes>,
}

impl SnapshotBuilder for HashedBuilder {
    type Output = HashedData;

    fn insert(&mut self, row: Row) -> Result<(), SourceError> {
        let key = row.key.clone();
        self.map.insert(key, row.into_attributes());
        Ok(())
    }

    fn finish(self) -> Result<HashedData, SourceError> {
        Ok(HashedData { map: self.map })
    }
}
