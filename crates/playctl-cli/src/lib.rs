//! Library surface of the `playctl` binary

pub mod config;

pub use config::{ConfigManager, PlayctlConfig};
