//! Dictionary structure: key model, optional range columns and attributes.

use std::collections::HashSet;

use crate::{
    AttributeType, Attributes, ConfigError, Interval, KeyModel, Row, SourceError, Value,
};

/// Declaration of one attribute column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeSpec {
    pub name: String,
    pub ty: AttributeType,
    /// Value stored when the source yields NULL, and the fallback returned by
    /// default-aware lookups.
    pub null_value: Value,
    /// Attribute holds the parent key of a simple-key dictionary.
    pub hierarchical: bool,
    pub injective: bool,
}

impl AttributeSpec {
    pub fn new(name: impl Into<String>, ty: AttributeType) -> Self {
        Self {
            name: name.into(),
            ty,
            null_value: Value::Null,
            hierarchical: false,
            injective: false,
        }
    }

    pub fn with_null_value(mut self, value: impl Into<Value>) -> Self {
        self.null_value = value.into();
        self
    }

    pub fn hierarchical(mut self) -> Self {
        self.hierarchical = true;
        self
    }
}

/// Range columns of a range dictionary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeSpec {
    pub min: String,
    pub max: String,
    pub ty: AttributeType,
}

/// The complete column layout of a dictionary.
///
/// Source rows are ordered as key fields, then range min/max (when present),
/// then attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DictionaryStructure {
    pub key: KeyModel,
    pub range: Option<RangeSpec>,
    pub attributes: Vec<AttributeSpec>,
}

impl DictionaryStructure {
    pub fn new(key: KeyModel, attributes: Vec<AttributeSpec>) -> Self {
        Self {
            key,
            range: None,
            attributes,
        }
    }

    pub fn with_range(mut self, min: &str, max: &str, ty: AttributeType) -> Self {
        self.range = Some(RangeSpec {
            min: min.to_string(),
            max: max.to_string(),
            ty,
        });
        self
    }

    pub fn attribute_index(&self, name: &str) -> Option<usize> {
        self.attributes.iter().position(|a| a.name == name)
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeSpec> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Index of the hierarchical (parent-key) attribute, if declared.
    pub fn hierarchical_index(&self) -> Option<usize> {
        self.attributes.iter().position(|a| a.hierarchical)
    }

    pub fn column_names(&self) -> Vec<&str> {
        let mut names = self.key.field_names();
        if let Some(range) = &self.range {
            names.push(range.min.as_str());
            names.push(range.max.as_str());
        }
        names.extend(self.attributes.iter().map(|a| a.name.as_str()));
        names
    }

    pub fn column_types(&self) -> Vec<AttributeType> {
        let mut types = self.key.field_types();
        if let Some(range) = &self.range {
            types.push(range.ty);
            types.push(range.ty);
        }
        types.extend(self.attributes.iter().map(|a| a.ty));
        types
    }

    pub fn column_count(&self) -> usize {
        self.key.arity() + if self.range.is_some() { 2 } else { 0 } + self.attributes.len()
    }

    /// The configured null values of every attribute.
    pub fn default_attributes(&self) -> Attributes {
        Attributes::new(self.attributes.iter().map(|a| a.null_value.clone()).collect())
    }

    /// Decode a raw row laid out in column order.
    pub fn decode_row(&self, raw: Vec<Value>) -> Result<Row, SourceError> {
        if raw.len() != self.column_count() {
            return Err(SourceError::data(format!(
                "row has {} columns, expected {} ({})",
                raw.len(),
                self.column_count(),
                self.column_names().join(", ")
            )));
        }
        let mut cells = raw.into_iter();
        let key_fields: Vec<Value> = cells.by_ref().take(self.key.arity()).collect();
        let key = self.key.encode(key_fields)?;

        let range = match &self.range {
            Some(spec) => {
                let start = cells.next().unwrap_or(Value::Null).coerce(spec.ty)?;
                let end = cells.next().unwrap_or(Value::Null).coerce(spec.ty)?;
                let interval = Interval { start, end };
                if interval.is_inverted() {
                    return Err(SourceError::data(format!(
                        "inverted range [{}, {}] for key {key}",
                        interval.start, interval.end
                    )));
                }
                Some(interval)
            }
            None => None,
        };

        let mut values = Vec::with_capacity(self.attributes.len());
        for (spec, cell) in self.attributes.iter().zip(cells) {
            let value = cell.coerce(spec.ty)?;
            values.push(if value.is_null() {
                spec.null_value.clone()
            } else {
                value
            });
        }
        Ok(Row { key, range, values })
    }

    /// Structural checks independent of the chosen layout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.attributes.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "structure.attributes".to_string(),
            });
        }
        let mut seen = HashSet::new();
        for name in self.column_names() {
            if !seen.insert(name) {
                return Err(ConfigError::invalid(
                    "structure",
                    name,
                    "column names must be unique",
                ));
            }
        }
        for attr in &self.attributes {
            if attr.ty == AttributeType::Polygon {
                return Err(ConfigError::invalid(
                    "structure.attributes.type",
                    &attr.name,
                    "Polygon is only valid as a key field",
                ));
            }
            if !attr.null_value.is_null() && attr.null_value.value_type() != Some(attr.ty) {
                return Err(ConfigError::invalid(
                    "structure.attributes.null_value",
                    &attr.null_value,
                    "null_value must match the attribute type",
                ));
            }
            if attr.hierarchical && (self.key.is_complex() || attr.ty != AttributeType::UInt64) {
                return Err(ConfigError::invalid(
                    "structure.attributes.hierarchical",
                    &attr.name,
                    "hierarchical attributes must be UInt64 on a simple-key dictionary",
                ));
            }
        }
        if self.attributes.iter().filter(|a| a.hierarchical).count() > 1 {
            return Err(ConfigError::IncompatibleOptions {
                option_a: "hierarchical".to_string(),
                option_b: "more than one attribute".to_string(),
            });
        }
        if let Some(range) = &self.range {
            if !range.ty.is_orderable_scalar() {
                return Err(ConfigError::invalid(
                    "structure.range.type",
                    range.ty,
                    "range columns must be numeric or DateTime",
                ));
            }
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
