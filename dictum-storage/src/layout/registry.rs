//! Layout registry: kind name → constructor.
//!
//! Built-in constructors reject key models their layout cannot serve, so a
//! misconfigured dictionary fails at creation rather than on first load.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use dictum_core::{
    AttributeType, ConfigError, DictionaryStructure, KeyModel, LayoutConfig, Lifetime,
    RegistryKind,
};
use parking_lot::RwLock;

use super::cache::CacheParams;
use super::flat::FlatParams;
use super::{
    BulkLayout, CacheLayout, DictionaryLayout, FlatData, HashedData, LayoutKind, PolygonData,
    RangeData, TrieData,
};

/// Everything a layout constructor receives.
#[derive(Debug, Clone, Copy)]
pub struct LayoutArgs<'a> {
    pub name: &'a str,
    pub structure: &'a DictionaryStructure,
    pub config: &'a LayoutConfig,
    pub lifetime: Lifetime,
}

pub type LayoutConstructor =
    Arc<dyn Fn(LayoutArgs<'_>) -> Result<Arc<dyn DictionaryLayout>, ConfigError> + Send + Sync>;

static GLOBAL: LazyLock<LayoutRegistry> = LazyLock::new(LayoutRegistry::with_builtins);

#[derive(Default)]
pub struct LayoutRegistry {
    constructors: RwLock<HashMap<String, LayoutConstructor>>,
}

impl LayoutRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in layout kind.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        let builtins: [(LayoutKind, LayoutConstructor); 9] = [
            (LayoutKind::Flat, Arc::new(flat)),
            (LayoutKind::Hashed, Arc::new(hashed)),
            (LayoutKind::ComplexKeyHashed, Arc::new(complex_key_hashed)),
            (LayoutKind::Cache, Arc::new(cache)),
            (LayoutKind::ComplexKeyCache, Arc::new(complex_key_cache)),
            (LayoutKind::RangeHashed, Arc::new(range_hashed)),
            (LayoutKind::ComplexKeyRangeHashed, Arc::new(complex_key_range_hashed)),
            (LayoutKind::Trie, Arc::new(trie)),
            (LayoutKind::Polygon, Arc::new(polygon)),
        ];
        let mut constructors = registry.constructors.write();
        for (kind, constructor) in builtins {
            constructors.insert(kind.as_str().to_string(), constructor);
        }
        drop(constructors);
        registry
    }

    /// Process-wide registry with the built-ins.
    pub fn global() -> &'static LayoutRegistry {
        &GLOBAL
    }

    pub fn register(&self, name: &str, constructor: LayoutConstructor) -> Result<(), ConfigError> {
        let mut constructors = self.constructors.write();
        if constructors.contains_key(name) {
            return Err(ConfigError::DuplicateKind {
                registry: RegistryKind::Layout,
                name: name.to_string(),
            });
        }
        constructors.insert(name.to_string(), constructor);
        Ok(())
    }

    pub fn create(&self, args: LayoutArgs<'_>) -> Result<Arc<dyn DictionaryLayout>, ConfigError> {
        let constructor = self
            .constructors
            .read()
            .get(&args.config.kind)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownKind {
                registry: RegistryKind::Layout,
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

impl std::fmt::Debug for LayoutRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayoutRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

fn incompatible(kind: LayoutKind, detail: String) -> ConfigError {
    ConfigError::IncompatibleOptions {
        option_a: format!("layout {kind}"),
        option_b: detail,
    }
}

fn expect_key_shape(kind: LayoutKind, key: &KeyModel, complex: bool) -> Result<(), ConfigError> {
    if key.is_complex() == complex {
        return Ok(());
    }
    let wanted = if complex { "composite" } else { "simple UInt64" };
    Err(incompatible(
        kind,
        format!("key {} (needs a {wanted} key)", key.describe()),
    ))
}

/// Trie and polygon keys are one field of a fixed type.
fn expect_single_field(kind: LayoutKind, key: &KeyModel, ty: AttributeType) -> Result<(), ConfigError> {
    if key.is_complex() && key.field_types() == [ty] {
        return Ok(());
    }
    Err(incompatible(
        kind,
        format!("key {} (needs exactly one {ty} field)", key.describe()),
    ))
}

fn flat(args: LayoutArgs<'_>) -> Result<Arc<dyn DictionaryLayout>, ConfigError> {
    expect_key_shape(LayoutKind::Flat, &args.structure.key, false)?;
    let params: FlatParams = args.config.params_as()?;
    if params.max_array_size == 0 {
        return Err(ConfigError::invalid(
            "max_array_size",
            params.max_array_size,
            "must be positive",
        ));
    }
    Ok(Arc::new(BulkLayout::<FlatData>::new(args.name, LayoutKind::Flat, move || {
        FlatData::builder(params)
    })))
}

fn hashed_kind(args: LayoutArgs<'_>, kind: LayoutKind) -> Result<Arc<dyn DictionaryLayout>, ConfigError> {
    expect_key_shape(kind, &args.structure.key, kind == LayoutKind::ComplexKeyHashed)?;
    Ok(Arc::new(BulkLayout::<HashedData>::new(args.name, kind, HashedData::builder)))
}

fn hashed(args: LayoutArgs<'_>) -> Result<Arc<dyn DictionaryLayout>, ConfigError> {
    hashed_kind(args, LayoutKind::Hashed)
}

fn complex_key_hashed(args: LayoutArgs<'_>) -> Result<Arc<dyn DictionaryLayout>, ConfigError> {
    hashed_kind(args, LayoutKind::ComplexKeyHashed)
}

fn cache_kind(args: LayoutArgs<'_>, kind: LayoutKind) -> Result<Arc<dyn DictionaryLayout>, ConfigError> {
    expect_key_shape(kind, &args.structure.key, kind == LayoutKind::ComplexKeyCache)?;
    let params: CacheParams = args.config.params_as()?;
    Ok(Arc::new(CacheLayout::new(args.name, kind, params, args.lifetime)?))
}

fn cache(args: LayoutArgs<'_>) -> Result<Arc<dyn DictionaryLayout>, ConfigError> {
    cache_kind(args, LayoutKind::Cache)
}

fn complex_key_cache(args: LayoutArgs<'_>) -> Result<Arc<dyn DictionaryLayout>, ConfigError> {
    cache_kind(args, LayoutKind::ComplexKeyCache)
}

fn range_kind(args: LayoutArgs<'_>, kind: LayoutKind) -> Result<Arc<dyn DictionaryLayout>, ConfigError> {
    expect_key_shape(kind, &args.structure.key, kind == LayoutKind::ComplexKeyRangeHashed)?;
    if args.structure.range.is_none() {
        return Err(incompatible(kind, "structure without range columns".to_string()));
    }
    Ok(Arc::new(BulkLayout::<RangeData>::new(args.name, kind, RangeData::builder)))
}

fn range_hashed(args: LayoutArgs<'_>) -> Result<Arc<dyn DictionaryLayout>, ConfigError> {
    range_kind(args, LayoutKind::RangeHashed)
}

fn complex_key_range_hashed(args: LayoutArgs<'_>) -> Result<Arc<dyn DictionaryLayout>, ConfigError> {
    range_kind(args, LayoutKind::ComplexKeyRangeHashed)
}

fn trie(args: LayoutArgs<'_>) -> Result<Arc<dyn DictionaryLayout>, ConfigError> {
    expect_single_field(LayoutKind::Trie, &args.structure.key, AttributeType::String)?;
    Ok(Arc::new(BulkLayout::<TrieData>::new(args.name, LayoutKind::Trie, TrieData::builder)))
}

fn polygon(args: LayoutArgs<'_>) -> Result<Arc<dyn DictionaryLayout>, ConfigError> {
    expect_single_field(LayoutKind::Polygon, &args.structure.key, AttributeType::Polygon)?;
    Ok(Arc::new(BulkLayout::<PolygonData>::new(
        args.name,
        LayoutKind::Polygon,
        PolygonData::builder,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::LayoutState;
    use dictum_core::{AttributeSpec, KeyField};

    fn attrs() -> Vec<AttributeSpec> {
        vec![AttributeSpec::new("name", AttributeType::String)]
    }

    fn simple() -> DictionaryStructure {
        DictionaryStructure::new(KeyModel::simple("id"), attrs())
    }

    fn complex(types: &[AttributeType]) -> DictionaryStructure {
        let fields = types
            .iter()
            .enumerate()
            .map(|(i, ty)| KeyField::new(format!("k{i}"), *ty))
            .collect();
        DictionaryStructure::new(KeyModel::Complex(fields), attrs())
    }

    fn create(structure: &DictionaryStructure, config: &LayoutConfig) -> Result<Arc<dyn DictionaryLayout>, ConfigError> {
        LayoutRegistry::global().create(LayoutArgs {
            name: "d",
            structure,
            config,
            lifetime: Lifetime::NEVER,
        })
    }

    #[test]
    fn test_builtins_registered() {
        let kinds = LayoutRegistry::global().kinds();
        for kind in LayoutKind::ALL {
            assert!(kinds.contains(&kind.as_str().to_string()), "missing {kind}");
        }
    }

    #[test]
    fn test_unknown_layout_kind() {
        let result = create(&simple(), &LayoutConfig::new("btree"));
        assert!(matches!(
            result,
            Err(ConfigError::UnknownKind {
                registry: RegistryKind::Layout,
                ..
            })
        ));
    }

    #[test]
    fn test_key_model_compatibility() {
        let composite = complex(&[AttributeType::String, AttributeType::UInt64]);
        assert!(create(&simple(), &LayoutConfig::new("hashed")).is_ok());
        assert!(matches!(
            create(&composite, &LayoutConfig::new("hashed")),
            Err(ConfigError::IncompatibleOptions { .. })
        ));
        assert!(create(&composite, &LayoutConfig::new("complex_key_hashed")).is_ok());
        assert!(create(&simple(), &LayoutConfig::new("complex_key_hashed")).is_err());
        assert!(create(&simple(), &LayoutConfig::new("range_hashed")).is_err());

        let ranged = simple().with_range("valid_from", "valid_to", AttributeType::DateTime);
        assert!(create(&ranged, &LayoutConfig::new("range_hashed")).is_ok());

        assert!(create(&complex(&[AttributeType::String]), &LayoutConfig::new("trie")).is_ok());
        assert!(create(&composite, &LayoutConfig::new("trie")).is_err());
        assert!(create(&complex(&[AttributeType::Polygon]), &LayoutConfig::new("polygon")).is_ok());
        assert!(create(&simple(), &LayoutConfig::new("polygon")).is_err());
    }

    #[test]
    fn test_bulk_layouts_start_empty() {
        let ranged = simple().with_range("valid_from", "valid_to", AttributeType::DateTime);
        let cases = [
            (simple(), "flat", LayoutKind::Flat),
            (simple(), "hashed", LayoutKind::Hashed),
            (ranged, "range_hashed", LayoutKind::RangeHashed),
            (complex(&[AttributeType::String]), "trie", LayoutKind::Trie),
            (complex(&[AttributeType::Polygon]), "polygon", LayoutKind::Polygon),
        ];
        for (structure, name, kind) in cases {
            let layout = create(&structure, &LayoutConfig::new(name)).unwrap();
            assert_eq!(layout.kind(), kind);
            assert!(!layout.is_loaded());
            assert_eq!(layout.status().state, LayoutState::Empty);
        }
    }

    #[test]
    fn test_cache_requires_capacity() {
        assert!(create(&simple(), &LayoutConfig::new("cache")).is_err());
        let config = LayoutConfig::new("cache").with_param("size_in_cells", 100);
        let layout = create(&simple(), &config).unwrap();
        assert_eq!(layout.kind(), LayoutKind::Cache);
        assert!(layout.is_loaded());
    }

    #[test]
    fn test_flat_params() {
        let config = LayoutConfig::new("flat").with_param("max_array_size", 0);
        assert!(create(&simple(), &config).is_err());
        let config = LayoutConfig::new("flat").with_param("max_array_size", 10);
        assert!(create(&simple(), &config).is_ok());
    }

    #[test]
    fn test_custom_layout_registration() {
        let registry = LayoutRegistry::with_builtins();
        let err = registry
            .register("hashed", Arc::new(hashed))
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateKind { .. }));
        registry
            .register("sparse_hashed", Arc::new(hashed))
            .unwrap();
        assert!(registry.contains("sparse_hashed"));
    }
}
