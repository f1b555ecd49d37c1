//! Configuration types
//!
//! Declarative, serde-friendly description of one dictionary. Source and
//! layout parameters stay untyped here; each constructor decodes them into
//! its own params struct with [`SourceConfig::params_as`] /
//! [`LayoutConfig::params_as`].

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::*;

type Params = serde_json::Map<String, serde_json::Value>;

/// One attribute column as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: AttributeType,
    #[serde(default)]
    pub null_value: Option<serde_json::Value>,
    #[serde(default)]
    pub hierarchical: bool,
    #[serde(default)]
    pub injective: bool,
}

impl AttributeConfig {
    pub fn new(name: impl Into<String>, ty: AttributeType) -> Self {
        Self {
            name: name.into(),
            ty,
            null_value: None,
            hierarchical: false,
            injective: false,
        }
    }

    pub fn with_null_value(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.null_value = Some(value.into());
        self
    }

    pub fn hierarchical(mut self) -> Self {
        self.hierarchical = true;
        self
    }
}

/// Range columns as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeConfig {
    pub min: String,
    pub max: String,
    #[serde(rename = "type")]
    pub ty: AttributeType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureConfig {
    pub key: KeyModel,
    #[serde(default)]
    pub range: Option<RangeConfig>,
    pub attributes: Vec<AttributeConfig>,
}

impl StructureConfig {
    pub fn new(key: KeyModel, attributes: Vec<AttributeConfig>) -> Self {
        Self {
            key,
            range: None,
            attributes,
        }
    }

    pub fn with_range(mut self, min: &str, max: &str, ty: AttributeType) -> Self {
        self.range = Some(RangeConfig {
            min: min.to_string(),
            max: max.to_string(),
            ty,
        });
        self
    }

    /// Resolve configured defaults into typed values.
    pub fn resolve(&self) -> Result<DictionaryStructure, ConfigError> {
        let attributes = self
            .attributes
            .iter()
            .map(|a| {
                let null_value = match &a.null_value {
                    None => Value::Null,
                    Some(json) => Value::from_json(a.ty, json).map_err(|e| {
                        ConfigError::invalid("structure.attributes.null_value", json, &e.to_string())
                    })?,
                };
                Ok(AttributeSpec {
                    name: a.name.clone(),
                    ty: a.ty,
                    null_value,
                    hierarchical: a.hierarchical,
                    injective: a.injective,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        let structure = DictionaryStructure {
            key: self.key.clone(),
            range: self.range.as_ref().map(|r| RangeSpec {
                min: r.min.clone(),
                max: r.max.clone(),
                ty: r.ty,
            }),
            attributes,
        };
        structure.validate()?;
        Ok(structure)
    }
}

fn decode_params<T: DeserializeOwned>(section: &str, kind: &str, params: &Params) -> Result<T, ConfigError> {
    serde_json::from_value(serde_json::Value::Object(params.clone())).map_err(|e| {
        ConfigError::InvalidValue {
            field: format!("{section}.{kind}"),
            value: serde_json::Value::Object(params.clone()).to_string(),
            reason: e.to_string(),
        }
    })
}

/// Source selection: a registered kind plus kind-specific parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub kind: String,
    #[serde(flatten)]
    pub params: Params,
}

impl SourceConfig {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: Params::new(),
        }
    }

    pub fn with_param(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }

    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        decode_params("source", &self.kind, &self.params)
    }
}

/// Layout selection: a registered kind plus kind-specific parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutConfig {
    pub kind: String,
    #[serde(flatten)]
    pub params: Params,
}

impl LayoutConfig {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: Params::new(),
        }
    }

    pub fn with_param(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }

    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        decode_params("layout", &self.kind, &self.params)
    }
}

/// Lifetime bounds in seconds; both zero means "never refresh".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifetimeConfig {
    #[serde(default)]
    pub min_secs: u64,
    #[serde(default)]
    pub max_secs: u64,
}

impl LifetimeConfig {
    pub fn to_lifetime(&self) -> Lifetime {
        Lifetime::range(
            Duration::from_secs(self.min_secs),
            Duration::from_secs(self.max_secs),
        )
    }
}

/// Master configuration for one dictionary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DictionaryConfig {
    pub name: String,
    pub structure: StructureConfig,
    pub source: SourceConfig,
    pub layout: LayoutConfig,
    #[serde(default)]
    pub lifetime: LifetimeConfig,
    /// Column used for incremental refresh, when the source supports it.
    #[serde(default)]
    pub update_field: Option<String>,
}

impl DictionaryConfig {
    pub fn new(
        name: impl Into<String>,
        structure: StructureConfig,
        source: SourceConfig,
        layout: LayoutConfig,
    ) -> Self {
        Self {
            name: name.into(),
            structure,
            source,
            layout,
            lifetime: LifetimeConfig::default(),
            update_field: None,
        }
    }

    pub fn with_lifetime(mut self, min_secs: u64, max_secs: u64) -> Self {
        self.lifetime = LifetimeConfig { min_secs, max_secs };
        self
    }

    /// Parse a single dictionary declaration from TOML.
    pub fn from_toml_str(text: &str) -> DictResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::InvalidValue {
            field: "toml".to_string(),
            value: text.lines().next().unwrap_or_default().to_string(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn lifetime(&self) -> Lifetime {
        self.lifetime.to_lifetime()
    }

    /// Validate the configuration.
    /// Returns Ok(()) if valid, Err(DictionaryError::Config) if invalid.
    ///
    /// Validates:
    /// - name, source.kind and layout.kind are non-empty
    /// - lifetime.min_secs <= lifetime.max_secs
    /// - update_field, if set, is non-empty
    /// - the structure resolves (defaults typed, names unique)
    pub fn validate(&self) -> DictResult<()> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "name".to_string(),
            }
            .into());
        }
        if self.source.kind.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "source.kind".to_string(),
            }
            .into());
        }
        if self.layout.kind.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "layout.kind".to_string(),
            }
            .into());
        }
        if self.lifetime.min_secs > self.lifetime.max_secs {
            return Err(ConfigError::InvalidValue {
                field: "lifetime".to_string(),
                value: format!("{}..{}", self.lifetime.min_secs, self.lifetime.max_secs),
                reason: "lifetime.min_secs must not exceed lifetime.max_secs".to_string(),
            }
            .into());
        }
        if let Some(field) = &self.update_field {
            if field.trim().is_empty() {
                return Err(ConfigError::invalid(
                    "update_field",
                    "\"\"",
                    "update_field must name a column",
                )
                .into());
            }
        }
        self.structure.resolve()?;
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const REGIONS: &str = r#"
name = "regions"
update_field = "updated_at"

[structure]
key = { simple = "id" }

[[structure.attributes]]
name = "name"
type = "String"
null_value = "unknown"

[[structure.attributes]]
name = "parent"
type = "UInt64"
null_value = 0
hierarchical = true

[source]
kind = "file"
path = "/tmp/regions.tsv"
format = "TabSeparated"

[layout]
kind = "hashed"

[lifetime]
min_secs = 300
max_secs = 360
"#;

    #[derive(Debug, Deserialize)]
    struct FileParams {
        path: String,
        format: String,
    }

    #[test]
    fn test_parse_toml_declaration() {
        let config = DictionaryConfig::from_toml_str(REGIONS).unwrap();
        assert_eq!(config.name, "regions");
        assert_eq!(config.layout.kind, "hashed");
        assert_eq!(config.update_field.as_deref(), Some("updated_at"));
        assert_eq!(
            config.lifetime(),
            Lifetime::range(Duration::from_secs(300), Duration::from_secs(360))
        );

        let params: FileParams = config.source.params_as().unwrap();
        assert_eq!(params.path, "/tmp/regions.tsv");
        assert_eq!(params.format, "TabSeparated");

        let structure = config.structure.resolve().unwrap();
        assert_eq!(structure.attributes[0].null_value, Value::from("unknown"));
        assert_eq!(structure.hierarchical_index(), Some(1));
    }

    #[test]
    fn test_complex_key_toml() {
        let text = r#"
name = "zips"
[structure]
key = { complex = [{ name = "country", type = "String" }, { name = "zip", type = "UInt64" }] }
[[structure.attributes]]
name = "city"
type = "String"
[source]
kind = "memory"
[layout]
kind = "complex_key_hashed"
"#;
        let config = DictionaryConfig::from_toml_str(text).unwrap();
        assert!(config.structure.key.is_complex());
        assert!(config.lifetime().is_never());
    }

    #[test]
    fn test_validate_rejects_inverted_lifetime() {
        let mut config = DictionaryConfig::from_toml_str(REGIONS).unwrap();
        config.lifetime = LifetimeConfig {
            min_secs: 10,
            max_secs: 5,
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            DictionaryError::Config(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_empty_kind() {
        let mut config = DictionaryConfig::from_toml_str(REGIONS).unwrap();
        config.source.kind = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_params_are_config_errors() {
        let source = SourceConfig::new("file").with_param("path", 7);
        let result: Result<FileParams, _> = source.params_as();
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_mistyped_null_value_fails_resolution() {
        let text = REGIONS.replace("null_value = 0", "null_value = \"zero\"");
        assert!(DictionaryConfig::from_toml_str(&text).is_err());
    }
}
