//! Tarmac CLI entrypoint.

use clap::Parser;

mod commands;
mod workflow_file;

#[derive(Parser)]
#[command(name = "tarmac")]
#[command(author, version, about = "tarmac, a cache-aware local CI runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let code = commands::dispatch(cli.command).await;
    std::process::exit(code);
}
