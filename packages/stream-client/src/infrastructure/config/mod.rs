//! Configuration Module
//!
//! Connection tuning, credentials, and environment loading for the client.

mod settings;

pub use settings::{ConfigError, Credentials, StreamConfig};
