//! Command-line arguments

use std::path::PathBuf;

use clap::Parser;

/// CLI arguments for the ebbtide client
#[derive(Debug, Parser)]
#[command(name = "ebbtide")]
#[command(about = "A BitTorrent client core", long_about = None)]
pub struct CliArgs {
    /// Listening port for incoming peer connections
    #[arg(value_name = "PORT")]
    pub port: u16,

    /// Path to the .torrent file
    #[arg(value_name = "TORRENT_FILE")]
    pub torrent_file: PathBuf,

    /// Download directory, created if missing
    #[arg(value_name = "DOWNLOAD_DIR")]
    pub download_dir: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet mode (errors only)
    #[arg(short, long)]
    pub quiet: bool,
}

impl CliArgs {
    /// Log level chosen by the verbosity flags
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positional_arguments() {
        let args =
            CliArgs::try_parse_from(["ebbtide", "6881", "a.torrent", "downloads"]).unwrap();
        assert_eq!(args.port, 6881);
        assert_eq!(args.torrent_file, PathBuf::from("a.torrent"));
        assert_eq!(args.download_dir, PathBuf::from("downloads"));
        assert!(!args.verbose);
    }

    #[test]
    fn test_missing_arguments_rejected() {
        assert!(CliArgs::try_parse_from(["ebbtide", "6881"]).is_err());
    }

    #[test]
    fn test_non_numeric_port_rejected() {
        assert!(CliArgs::try_parse_from(["ebbtide", "p", "a.torrent", "d"]).is_err());
    }

    #[test]
    fn test_log_level() {
        let mut args =
            CliArgs::try_parse_from(["ebbtide", "6881", "a.torrent", "downloads"]).unwrap();
        assert_eq!(args.log_level(), tracing::Level::INFO);
        args.verbose = true;
        assert_eq!(args.log_level(), tracing::Level::DEBUG);
        args.verbose = false;
        args.quiet = true;
        assert_eq!(args.log_level(), tracing::Level::ERROR);
    }
}
