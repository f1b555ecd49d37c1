//! DICTUM Core - Dictionary Data Types
//!
//! Keys, values, rows, structure and configuration shared by every other
//! crate. No I/O and no async: loading and serving live in `dictum-storage`.

use chrono::{DateTime, Utc};

mod config;
mod error;
mod key;
mod lifetime;
mod row;
mod structure;
mod value;

pub use config::*;
pub use error::*;
pub use key::*;
pub use lifetime::*;
pub use row::*;
pub use structure::*;
pub use value::*;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;
