use std::path::PathBuf;

use anyhow::Result;

/// Environment variable holding a reference to our original binary
pub const ORIG: &str = "_OSBAKE_ORIG_EXE";

/// Return the path to our own executable. When running inside the
/// sandbox the binary may be reached through a different path and
/// this environment variable will hold the path to the original binary.
pub fn executable_path() -> Result<PathBuf> {
    if let Some(p) = std::env::var_os(ORIG) {
        Ok(p.into())
    } else {
        std::env::current_exe().map_err(Into::into)
    }
}
