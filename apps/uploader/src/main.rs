//! WeDrive uploader entry point.

mod app;
mod config;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "wedrive-uploader")]
#[command(about = "Chunked, deduplicating uploads to WeCom WeDrive")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(long, global = true, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Cancel everything still running after this many seconds
    #[arg(long, global = true)]
    deadline: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Upload files into the configured space
    Upload {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Upload every file of a folder, moving successes to another
    Sweep {
        /// Folder to upload from
        #[arg(long, default_value = "a")]
        source: PathBuf,
        /// Folder that receives uploaded files
        #[arg(long, default_value = "b")]
        done: PathBuf,
    },
    /// Print the current access token's lifetime
    Token {
        /// Refresh even if the cached token is still fresh
        #[arg(long, default_value_t = false)]
        force: bool,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting wedrive uploader");

    let config = config::Config::load(&cli.config)?;
    tracing::info!(
        path = %cli.config.display(),
        space_id = %config.space_id,
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(
        cli.config,
        config,
        cli.command,
        cli.deadline.map(Duration::from_secs),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_upload_with_global_flags() {
        let cli = Cli::parse_from([
            "wedrive-uploader",
            "upload",
            "a.bin",
            "b.bin",
            "--deadline",
            "30",
            "--config",
            "/etc/wd.json",
        ]);
        assert_eq!(cli.deadline, Some(30));
        assert_eq!(cli.config, PathBuf::from("/etc/wd.json"));
        match cli.command {
            Command::Upload { files } => {
                assert_eq!(files, vec![PathBuf::from("a.bin"), PathBuf::from("b.bin")])
            }
            _ => panic!("expected upload"),
        }
    }

    #[test]
    fn sweep_defaults_to_a_and_b() {
        let cli = Cli::parse_from(["wedrive-uploader", "sweep"]);
        assert_eq!(cli.config, PathBuf::from(config::DEFAULT_CONFIG_PATH));
        match cli.command {
            Command::Sweep { source, done } => {
                assert_eq!(source, PathBuf::from("a"));
                assert_eq!(done, PathBuf::from("b"));
            }
            _ => panic!("expected sweep"),
        }
    }

    #[test]
    fn upload_requires_files() {
        assert!(Cli::try_parse_from(["wedrive-uploader", "upload"]).is_err());
    }
}
