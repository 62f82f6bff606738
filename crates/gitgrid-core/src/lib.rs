//! gitgrid-core — configuration shared by every GitGrid subsystem.
//!
//! The daemon reads a single `gitgrid.toml`; each subsystem receives the
//! section it needs at construction time.

pub mod config;

pub use config::*;
