//! FunnelDeck Common Library
//!
//! Shared domain types and error handling for the FunnelDeck control plane.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::*;

/// FunnelDeck version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
