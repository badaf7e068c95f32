//! Thin logging facade for the pool crates.
//!
//! Re-exports the `log` macros so call sites only need one `use`, and adds
//! a couple of timing helpers used by the worker loop.

#[macro_use]
pub mod macros;

pub use log::{debug, error, info, trace, warn};
