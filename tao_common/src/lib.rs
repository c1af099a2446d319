//! TAO Common Library
//!
//! Shared constants, error kinds, wire-stable type tags, and configuration
//! loading shared by every crate in the TAO workspace.
//!
//! # Module Structure
//!
//! - [`consts`] - magic numbers, type tags, size limits
//! - [`error`] - result codes, error kinds, thread-local last-error record
//! - [`types`] - element types and the pixel encoding tag
//! - [`config`] - runtime-configurable defaults (TOML-loadable)
//!
//! Add to your `Cargo.toml` with an alias for shorter imports:
//! ```toml
//! [dependencies]
//! tao = { package = "tao_common", path = "../tao_common" }
//! ```

pub mod config;
pub mod consts;
pub mod error;
pub mod types;

pub use error::{Status, TaoError, TaoResult};
