//! parley CLI binary entry point.

use clap::Parser;
use parley::cli::{init_tracing, run, Cli};

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        if e.is_retryable() {
            eprintln!("(this error is transient; retrying may help)");
        }
        std::process::exit(1);
    }
}
