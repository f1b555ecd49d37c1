//! DICTUM Storage - Sources, Layouts and Dictionaries
//!
//! Loads external datasets into in-memory lookup structures and keeps them
//! fresh. Types shared with callers (keys, values, rows, config, errors)
//! live in `dictum-core`.

pub mod catalog;
pub mod dictionary;
pub mod layout;
pub mod scheduler;
pub mod source;

pub use catalog::{is_unknown_dictionary, DictionaryCatalog};
pub use dictionary::{Dictionary, DictionaryInfo, MAX_HIERARCHY_DEPTH};

pub use layout::{
    CacheLayout, CacheStats, DictionaryLayout, LayoutArgs, LayoutKind, LayoutRegistry,
    LayoutState, LayoutStatus, Probe, RefreshMode, RefreshOutcome,
};

pub use scheduler::{
    RefreshQueue, SchedulerConfig, SchedulerHandle, SchedulerMetrics, SchedulerSnapshot,
};

pub use source::{
    collect_rows, rows_stream, DictionarySource, FileSource, MemorySource, RowFormat, RowStream,
    SourceArgs, SourceContext, SourceRegistry,
};
