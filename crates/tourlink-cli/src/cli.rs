//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a simulated tour: one guide and one attendee per language
    Simulate {
        /// Tour identifier
        #[arg(short, long, default_value = "demo-tour")]
        tour: String,
        /// Comma-separated language channels
        #[arg(short, long, value_delimiter = ',', default_value = "en")]
        languages: Vec<String>,
        /// How long to keep the links up before reporting
        #[arg(short, long, default_value_t = 5)]
        duration_secs: u64,
        /// Seconds the guide waits for its attendee before giving up
        #[arg(long, default_value_t = 10)]
        peer_timeout_secs: u64,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_languages_split_on_commas() {
        let cli = Cli::parse_from(["tourlink", "simulate", "--languages", "en,de,fr", "-v"]);
        assert!(cli.verbose);
        match cli.command {
            Commands::Simulate { languages, tour, .. } => {
                assert_eq!(languages, vec!["en", "de", "fr"]);
                assert_eq!(tour, "demo-tour");
            }
            Commands::Config => panic!("expected simulate"),
        }
    }
}
