use clap::Parser;
use evalbot::config::Config;

#[derive(Parser)]
#[command(name = "evalbot")]
#[command(about = "Firehose code-evaluation bot")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Run the bot against the firehose
    Run,
    /// Evaluate lines interactively under the local principal
    Repl,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(error) => {
            tracing::error!("configuration error: {error}");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => evalbot::bot::run(config).await,
        Commands::Repl => evalbot::repl::run(config).await,
    };

    if let Err(error) = result {
        tracing::error!("fatal: {error:#}");
        std::process::exit(1);
    }
}
