//! Shared domain types for the VaultAgent runtime.
//!
//! Everything the other crates agree on lives here: the error taxonomy with
//! its stable machine-readable codes, the transcript message model, the
//! `LlmHandler` / `ToolExecutor` capability traits, and the configuration
//! tree loaded from `<vault>/config.toml`.

pub mod config;
pub mod error;
pub mod handler;
pub mod message;
pub mod trace;

pub use error::{Error, ErrorCode, Result};
