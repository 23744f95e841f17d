#![forbid(unsafe_code)]
#![deny(
    unused_must_use,
    unreachable_pub,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]

//! Binary entrypoint that wires the Vidra services together.

use anyhow::Result;

/// Bootstraps the Vidra application and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<()> {
    vidra_app::run_app().await?;
    Ok(())
}
