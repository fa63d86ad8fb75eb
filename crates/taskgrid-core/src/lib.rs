//! taskgrid-core — task model, wire tags, and configuration shared by all TaskGrid crates.

pub mod config;
pub mod types;

pub use config::GridConfig;
pub use types::*;
