//! Configuration module
//!
//! Handles loading shell settings from TOML.

mod settings;

pub use settings::*;
