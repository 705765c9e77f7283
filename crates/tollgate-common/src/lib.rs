//! Shared configuration and error types for tollgate.
//!
//! This crate carries no IO: it holds the merged global configuration, the
//! runtime option flags and ratio tables (read through `ArcSwap` snapshots in
//! the core crate), and the relay error taxonomy every layer speaks.

pub mod config;
pub mod error;
pub mod options;

pub use config::{GlobalConfig, GlobalConfigError, GlobalConfigPatch};
pub use error::{RelayError, RelayResult};
pub use options::{OptionFlags, RatioTables};
