use anyhow::Result;
use clap::Parser;
use sealsearch::app;
use sealsearch::cli::Cli;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "sealsearch=warn,sqlx=error";

#[tokio::main]
async fn main() -> Result<()> {
    // SEALSEARCH_* overrides and RUST_LOG may live in a local .env.
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    app::run(cli).await
}

/// Logs go to stderr so command output on stdout stays scriptable.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
