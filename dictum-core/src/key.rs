//! Dictionary keys and the key model.
//!
//! A dictionary is keyed either by a single `u64` (a *simple* key) or by an
//! ordered tuple of typed fields (a *complex* key). The model is fixed for
//! the lifetime of a dictionary; rows and lookup keys are checked against it.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{AttributeType, LookupError, SourceError, Value};

/// A lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Key {
    Simple(u64),
    Complex(Vec<Value>),
}

impl Key {
    pub fn complex(fields: impl IntoIterator<Item = Value>) -> Self {
        Self::Complex(fields.into_iter().collect())
    }

    pub fn as_simple(&self) -> Option<u64> {
        match self {
            Self::Simple(id) => Some(*id),
            Self::Complex(_) => None,
        }
    }

    pub fn fields(&self) -> Option<&[Value]> {
        match self {
            Self::Simple(_) => None,
            Self::Complex(fields) => Some(fields),
        }
    }

    pub fn arity(&self) -> usize {
        match self {
            Self::Simple(_) => 1,
            Self::Complex(fields) => fields.len(),
        }
    }

    /// Key fields as values, in declaration order.
    pub fn to_values(&self) -> Vec<Value> {
        match self {
            Self::Simple(id) => vec![Value::UInt64(*id)],
            Self::Complex(fields) => fields.clone(),
        }
    }
}

impl From<u64> for Key {
    fn from(id: u64) -> Self {
        Self::Simple(id)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simple(id) => write!(f, "{id}"),
            Self::Complex(fields) => {
                f.write_str("(")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{field}")?;
                }
                f.write_str(")")
            }
        }
    }
}

/// Fixed-width, byte-stable key digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyDigest(pub [u8; 16]);

/// One field of a complex key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyField {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: AttributeType,
}

impl KeyField {
    pub fn new(name: impl Into<String>, ty: AttributeType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// Shape of the keys of one dictionary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyModel {
    /// Single unsigned 64-bit id column.
    Simple(String),
    /// Ordered tuple of typed fields.
    Complex(Vec<KeyField>),
}

impl KeyModel {
    pub fn simple(name: impl Into<String>) -> Self {
        Self::Simple(name.into())
    }

    pub fn is_complex(&self) -> bool {
        matches!(self, Self::Complex(_))
    }

    pub fn arity(&self) -> usize {
        match self {
            Self::Simple(_) => 1,
            Self::Complex(fields) => fields.len(),
        }
    }

    pub fn field_names(&self) -> Vec<&str> {
        match self {
            Self::Simple(name) => vec![name.as_str()],
            Self::Complex(fields) => fields.iter().map(|f| f.name.as_str()).collect(),
        }
    }

    pub fn field_types(&self) -> Vec<AttributeType> {
        match self {
            Self::Simple(_) => vec![AttributeType::UInt64],
            Self::Complex(fields) => fields.iter().map(|f| f.ty).collect(),
        }
    }

    /// Encode raw field values into a key.
    ///
    /// Deterministic: the same input always yields the same key. Ill-typed
    /// input is a data error.
    pub fn encode(&self, raw: Vec<Value>) -> Result<Key, SourceError> {
        if raw.len() != self.arity() {
            return Err(SourceError::data(format!(
                "key arity mismatch: expected {}, got {}",
                self.arity(),
                raw.len()
            )));
        }
        match self {
            Self::Simple(name) => {
                let value = raw.into_iter().next().unwrap_or(Value::Null);
                match value.coerce(AttributeType::UInt64)? {
                    Value::UInt64(id) => Ok(Key::Simple(id)),
                    other => Err(SourceError::data(format!(
                        "key column {name} must be a non-null UInt64, got {other}"
                    ))),
                }
            }
            Self::Complex(fields) => {
                let mut encoded = Vec::with_capacity(fields.len());
                for (field, value) in fields.iter().zip(raw) {
                    let value = value.coerce(field.ty)?;
                    if value.is_null() {
                        return Err(SourceError::data(format!(
                            "key column {} must not be NULL",
                            field.name
                        )));
                    }
                    encoded.push(value);
                }
                Ok(Key::Complex(encoded))
            }
        }
    }

    /// Validate a caller-supplied lookup key against this model.
    pub fn check(&self, key: &Key) -> Result<(), LookupError> {
        let mismatch = || LookupError::KeyMismatch {
            expected: self.describe(),
            got: key.to_string(),
        };
        match (self, key) {
            (Self::Simple(_), Key::Simple(_)) => Ok(()),
            (Self::Complex(fields), Key::Complex(values)) => {
                if fields.len() != values.len() {
                    return Err(mismatch());
                }
                let types_match = fields
                    .iter()
                    .zip(values)
                    .all(|(f, v)| v.value_type() == Some(f.ty));
                if types_match {
                    Ok(())
                } else {
                    Err(mismatch())
                }
            }
            _ => Err(mismatch()),
        }
    }

    /// Field-wise comparison; simple keys compare numerically.
    pub fn compare(&self, a: &Key, b: &Key) -> Ordering {
        a.cmp(b)
    }

    /// Byte-stable digest of a key: SHA-256 over the canonical field encoding,
    /// truncated to 128 bits.
    pub fn hash(&self, key: &Key) -> KeyDigest {
        let mut buf = Vec::with_capacity(32);
        match key {
            Key::Simple(id) => Value::UInt64(*id).write_canonical(&mut buf),
            Key::Complex(fields) => {
                for field in fields {
                    field.write_canonical(&mut buf);
                }
            }
        }
        let digest = Sha256::digest(&buf);
        let mut out = [0u8; 16];
        out.copy_from_slice(&digest[..16]);
        KeyDigest(out)
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Simple(name) => format!("{name} UInt64"),
            Self::Complex(fields) => {
                let parts: Vec<String> = fields
                    .iter()
                    .map(|f| format!("{} {}", f.name, f.ty))
                    .collect();
                format!("({})", parts.join(", "))
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
