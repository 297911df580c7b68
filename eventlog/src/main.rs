use clap::Parser;
use eyre::Result;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = eventlog::cli::Cli::parse();
    eventlog::cli::run(cli)
}
