mod cli;
mod config;
mod engine;
mod routes;
mod state;

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    //  Logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,llama_bridge=debug")),
        )
        .init();

    let args = cli::Cli::parse();
    let config_path = args.global.config_path();

    match args.command {
        cli::Commands::Info => cli::info::execute(args.global).await,
        cli::Commands::Inspect(a) => cli::inspect::execute(args.global, a).await,
        cli::Commands::Generate(a) => cli::generate::execute(args.global, &config_path, a).await,
        cli::Commands::Quantize(a) => cli::quantize::execute(args.global, a).await,
        cli::Commands::Serve(a) => cli::serve::execute(args.global, &config_path, a).await,
        cli::Commands::Config(c) => cli::config_cmd::execute(&config_path, c).await,
    }
}
