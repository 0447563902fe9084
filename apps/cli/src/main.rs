//! kbforge CLI: turn a directory of documents into a tagged knowledge base.
//!
//! Walks an input tree, extracts each changed file, rebuilds its heading
//! hierarchy, and replaces its records in the knowledge store.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
