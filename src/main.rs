use clap::Parser;

use projfs::cli::{Cli, Commands, commands};
use projfs::config::Settings;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    }
    .unwrap_or_else(|e| {
        eprintln!("Configuration error: {e}");
        Settings::default()
    });

    projfs::logging::init_with_config(&settings.logging);

    let result = match cli.command {
        Commands::Scan { dir, files } => commands::scan::run(&dir, settings, files).await,
        Commands::Watch { dir } => commands::watch::run(&dir, settings).await,
        Commands::Config => commands::config::run(&settings),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
