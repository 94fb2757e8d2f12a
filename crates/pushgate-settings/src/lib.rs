//! # pushgate-settings
//!
//! Configuration management with layered sources for the pushgate server.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`PushSettings::default()`]
//! 2. **User file**: `~/.pushgate/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `PUSHGATE_*` overrides (highest priority)
//!
//! The binary applies command-line flags on top of the loaded value. There is
//! no global instance: the caller owns the loaded settings and hands the
//! relevant pieces to the server and logging crates.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
