//! The main entrypoint for osbake, which just performs global initialization
//! and then calls out into the library.

use anyhow::Result;
use owo_colors::OwoColorize;
use std::io::Write as _;

async fn run() -> Result<()> {
    osbake_lib::cli::run_from_iter(std::env::args()).await
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(e) = run().await {
        tracing::debug!("exiting with error: {e:?}");
        let mut stderr = anstream::stderr();
        // Nothing more we can do if stderr is gone
        let _ = writeln!(stderr, "{}{:#}", "error: ".red(), e);
        std::process::exit(1);
    }
}
