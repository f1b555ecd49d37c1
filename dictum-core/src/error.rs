//! Error types for dictionary operations

use thiserror::Error;

/// Which registry a kind name was looked up in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistryKind {
    Layout,
    Source,
}

impl std::fmt::Display for RegistryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Layout => f.write_str("layout"),
            Self::Source => f.write_str("source"),
        }
    }
}

/// Errors raised by a dictionary source while loading rows.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    /// Connection or protocol failure. Transient: retried with backoff.
    #[error("Source {source_kind} unavailable: {reason}")]
    Unavailable { source_kind: String, reason: String },

    /// Malformed or invariant-violating rows. Aborts the load in progress.
    #[error("Source data error: {reason}")]
    Data { reason: String },

    #[error("Source {source_kind} does not support {operation}")]
    Unsupported {
        source_kind: String,
        operation: String,
    },
}

impl SourceError {
    pub fn unavailable(source_kind: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            source_kind: source_kind.into(),
            reason: reason.to_string(),
        }
    }

    pub fn data(reason: impl std::fmt::Display) -> Self {
        Self::Data {
            reason: reason.to_string(),
        }
    }

    pub fn unsupported(source_kind: impl Into<String>, operation: &str) -> Self {
        Self::Unsupported {
            source_kind: source_kind.into(),
            operation: operation.to_string(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },

    #[error("Unknown {registry} kind: {name}")]
    UnknownKind { registry: RegistryKind, name: String },

    #[error("Duplicate {registry} kind: {name}")]
    DuplicateKind { registry: RegistryKind, name: String },
}

impl ConfigError {
    pub fn invalid(field: &str, value: impl std::fmt::Display, reason: &str) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Per-call lookup errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LookupError {
    /// Key absent from a successfully loaded dictionary.
    #[error("Key not found in dictionary {dictionary}")]
    NotFound { dictionary: String },

    /// No snapshot has ever been published.
    #[error("Dictionary {dictionary} is not loaded")]
    NotLoaded { dictionary: String },

    #[error("Key mismatch: expected {expected}, got {got}")]
    KeyMismatch { expected: String, got: String },

    #[error("Dictionary {dictionary} has no attribute {attribute}")]
    UnknownAttribute {
        dictionary: String,
        attribute: String,
    },

    #[error("Dictionary not found: {name}")]
    UnknownDictionary { name: String },

    #[error("Dictionary {dictionary} requires a range point for lookups")]
    RangeRequired { dictionary: String },
}

/// Master error type for all dictionary errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DictionaryError {
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Lookup error: {0}")]
    Lookup(#[from] LookupError),

    /// The background task running a load panicked or was cancelled.
    #[error("Load of dictionary {dictionary} aborted: {reason}")]
    LoadAborted { dictionary: String, reason: String },
}

impl DictionaryError {
    /// `true` for the normal negative result of a lookup.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Lookup(LookupError::NotFound { .. }))
    }

    pub fn is_not_loaded(&self) -> bool {
        matches!(self, Self::Lookup(LookupError::NotLoaded { .. }))
    }

    /// Failures the scheduler retries without operator intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Source(SourceError::Unavailable { .. }))
    }
}

/// Result type alias for dictionary operations.
pub type DictResult<T> = Result<T, DictionaryError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_error_display_unavailable() {
        let err = SourceError::unavailable("mysql", "connection refused");
        let msg = format!("{}", err);
        assert!(msg.contains("mysql"));
        assert!(msg.contains("connection refused"));
    }

    #[test]
    fn test_config_error_display_unknown_kind() {
        let err = ConfigError::UnknownKind {
            registry: RegistryKind::Layout,
            name: "btree".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Unknown layout kind"));
        assert!(msg.contains("btree"));
    }

    #[test]
    fn test_lookup_error_display_not_loaded() {
        let err = LookupError::NotLoaded {
            dictionary: "regions".to_string(),
        };
        assert_eq!(format!("{}", err), "Dictionary regions is not loaded");
    }

    #[test]
    fn test_dictionary_error_from_variants() {
        let source = DictionaryError::from(SourceError::data("bad row"));
        assert!(matches!(source, DictionaryError::Source(_)));
        assert!(!source.is_transient());

        let config = DictionaryError::from(ConfigError::MissingRequired {
            field: "name".to_string(),
        });
        assert!(matches!(config, DictionaryError::Config(_)));

        let lookup = DictionaryError::from(LookupError::NotFound {
            dictionary: "d".to_string(),
        });
        assert!(lookup.is_not_found());
        assert!(!lookup.is_not_loaded());
    }

    #[test]
    fn test_load_aborted_display() {
        let err = DictionaryError::LoadAborted {
            dictionary: "regions".to_string(),
            reason: "task panicked".to_string(),
        };
        assert_eq!(
            format!("{}", err),
            "Load of dictionary regions aborted: task panicked"
        );
        assert!(!err.is_transient());
    }

    #[test]
    fn test_unavailable_is_transient() {
        let err = DictionaryError::from(SourceError::unavailable("http", "timeout"));
        assert!(err.is_transient());
    }
}
