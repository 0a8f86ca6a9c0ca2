//! Headless sweep runner for the built-in demonstration model.

use clap::Parser;

use tephra_run::cli::{self, SweepArgs};

fn main() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = SweepArgs::parse();
    match cli::run(&args) {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            eprintln!("sweep failed: {error}");
            std::process::exit(2);
        }
    }
}
