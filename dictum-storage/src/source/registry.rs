//! Source registry: kind name → constructor.
//!
//! Names are registered exactly once; there is no runtime unregistration.
//! [`SourceRegistry::global`] is pre-populated with every built-in kind.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use dictum_core::{ConfigError, RegistryKind};
use parking_lot::RwLock;

use super::{
    DictionarySource, ExecutableSource, FileSource, HttpSource, KeyValueSource, LibrarySource,
    MemorySource, SourceArgs, SqlSource,
};

pub type SourceConstructor =
    Arc<dyn Fn(SourceArgs<'_>) -> Result<Arc<dyn DictionarySource>, ConfigError> + Send + Sync>;

static GLOBAL: LazyLock<SourceRegistry> = LazyLock::new(SourceRegistry::with_builtins);

#[derive(Default)]
pub struct SourceRegistry {
    constructors: RwLock<HashMap<String, SourceConstructor>>,
}

impl SourceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in source kind.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        let builtins: [(&str, SourceConstructor); 11] = [
            ("memory", Arc::new(MemorySource::from_args)),
            ("file", Arc::new(FileSource::from_args)),
            ("executable", Arc::new(ExecutableSource::from_args)),
            ("http", Arc::new(HttpSource::from_args)),
            ("mysql", Arc::new(SqlSource::from_args)),
            ("clickhouse", Arc::new(SqlSource::from_args)),
            ("odbc", Arc::new(SqlSource::from_args)),
            ("jdbc", Arc::new(SqlSource::from_args)),
            ("mongodb", Arc::new(KeyValueSource::from_args)),
            ("redis", Arc::new(KeyValueSource::from_args)),
            ("library", Arc::new(LibrarySource::from_args)),
        ];
        let mut constructors = registry.constructors.write();
        for (name, constructor) in builtins {
            constructors.insert(name.to_string(), constructor);
        }
        drop(constructors);
        registry
    }

    /// Process-wide registry with the built-ins.
    pub fn global() -> &'static SourceRegistry {
        &GLOBAL
    }

    pub fn register(&self, name: &str, constructor: SourceConstructor) -> Result<(), ConfigError> {
        let mut constructors = self.constructors.write();
        if constructors.contains_key(name) {
            return Err(ConfigError::DuplicateKind {
                registry: RegistryKind::Source,
                name: name.to_string(),
            });
        }
        constructors.insert(name.to_string(), constructor);
        Ok(())
    }

    pub fn create(&self, args: SourceArgs<'_>) -> Result<Arc<dyn DictionarySource>, ConfigError> {
        let constructor = self
            .constructors
            .read()
            .get(&args.config.kind)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownKind {
                registry: RegistryKind::Source,
                name: args.config.kind.clone(),
            })?;
        constructor(args)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.read().contains_key(name)
    }

    /// Registered kind names, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.constructors.read().keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceContext;
    use dictum_core::{AttributeSpec, AttributeType, DictionaryStructure, KeyModel, SourceConfig};

    fn structure() -> DictionaryStructure {
        DictionaryStructure::new(
            KeyModel::simple("id"),
            vec![AttributeSpec::new("name", AttributeType::String)],
        )
    }

    #[test]
    fn test_builtins_cover_every_kind() {
        let kinds = SourceRegistry::global().kinds();
        for kind in [
            "clickhouse", "executable", "file", "http", "jdbc", "library", "memory", "mongodb",
            "mysql", "odbc", "redis",
        ] {
            assert!(kinds.contains(&kind.to_string()), "missing {kind}");
        }
    }

    #[test]
    fn test_unknown_kind() {
        let structure = structure();
        let config = SourceConfig::new("carrier-pigeon");
        let context = SourceContext::new();
        let result = SourceRegistry::global().create(SourceArgs {
            config: &config,
            structure: &structure,
            update_field: None,
            context: &context,
        });
        assert!(matches!(
            result,
            Err(ConfigError::UnknownKind {
                registry: RegistryKind::Source,
                ..
            })
        ));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = SourceRegistry::with_builtins();
        let err = registry
            .register("file", Arc::new(FileSource::from_args))
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateKind { .. }));

        registry
            .register("static", Arc::new(MemorySource::from_args))
            .unwrap();
        assert!(registry.contains("static"));
    }
}
