//! # bridge-settings
//!
//! Layered configuration for the RPC bridge, in priority order:
//! 1. **Compiled defaults**: [`BridgeSettings::default()`]
//! 2. **User file**: `~/.rpc-bridge/settings.json`, deep-merged over defaults
//! 3. **Environment variables**: `BRIDGE_*` overrides
//!
//! Command-line flags are applied on top by the binary.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_overrides, deep_merge, load_settings, load_settings_from_path, settings_path, validate,
};
pub use types::*;
