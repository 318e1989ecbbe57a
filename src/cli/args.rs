//! CLI argument parsing using clap.

use clap::{
    Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use std::path::PathBuf;

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// In-memory project tree index
#[derive(Parser, Debug)]
#[command(
    name = "projfs",
    version = env!("CARGO_PKG_VERSION"),
    about = "In-memory project tree index",
    long_about = "Crawl project directories, track package manifests and follow file changes.",
    next_line_help = true,
    styles = clap_cargo_style()
)]
pub struct Cli {
    /// Path to custom settings.toml file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Crawl a directory once and summarize what was indexed
    Scan {
        /// Directory to crawl
        #[arg(default_value = ".")]
        dir: PathBuf,

        /// Also list every indexed file
        #[arg(long)]
        files: bool,
    },

    /// Watch a directory and print file events until interrupted
    Watch {
        /// Directory to watch
        #[arg(default_value = ".")]
        dir: PathBuf,
    },

    /// Display active settings
    Config,
}
