//! The inevitable catchall "utils" crate. Generally only add
//! things here that only depend on the standard library and
//! "core" crates.
//!
mod command;
pub use command::*;
mod tracing_util;
pub use tracing_util::*;
/// Locating our own executable, e.g. to re-invoke it inside the sandbox
pub mod reexec;
mod result_ext;
pub use result_ext::*;
