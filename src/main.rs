mod cli;
mod config;
mod deploy;
mod error;
mod fomod;
mod importer;
mod plan;
mod registry;
mod source;
mod tree;

use anyhow::Result;

fn main() -> Result<()> {
    cli::run()
}
