use clap::Parser;
use queue_broker_cli::{run_cli, Cli};
use tracing::error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Run CLI and handle errors
    if let Err(e) = run_cli(cli).await {
        error!(error = %e, "CLI error");
        eprintln!("Error: {}", e);

        std::process::exit(e.exit_code());
    }
}
