//! Tribe CLI - Command-line interface
//!
//! Plays source descriptors through a local P2P engine. Built with the
//! `simulation` feature it also runs failover scenarios against the
//! simulators.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use tribe_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "tribe")]
#[command(about = "Bridge P2P media engines to ordinary streams")]
#[command(version)]
struct Cli {
    /// Console log level
    #[arg(long, global = true, value_enum, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,

    /// Directory for the full trace of the run
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.log_level, cli.logs_dir.as_deref()) {
        eprintln!("Logging disabled: {e}");
    }

    commands::handle_command(cli.command).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::Commands;

    #[test]
    #[allow(irrefutable_let_patterns)]
    fn test_play_takes_descriptor_and_output() {
        let cli = Cli::try_parse_from(["tribe", "play", "a.torrent", "-o", "out.ogg"]).unwrap();
        let Commands::Play { descriptor, output } = cli.command else {
            panic!("expected play");
        };
        assert_eq!(descriptor, "a.torrent");
        assert_eq!(output, Some(PathBuf::from("out.ogg")));
        assert_eq!(cli.log_level, CliLogLevel::Info);
    }

    #[cfg(not(feature = "simulation"))]
    #[test]
    fn test_simulate_needs_simulation_feature() {
        assert!(Cli::try_parse_from(["tribe", "simulate"]).is_err());
    }

    #[cfg(feature = "simulation")]
    #[test]
    fn test_simulate_parses_mirror_mode() {
        let cli = Cli::try_parse_from(["tribe", "simulate", "--mirror", "ignore"]).unwrap();
        let Commands::Simulate {
            length,
            deliver,
            mirror,
        } = cli.command
        else {
            panic!("expected simulate");
        };
        assert_eq!((length, deliver), (1_048_576, 400_000));
        assert_eq!(mirror, tribe_sim::MirrorMode::Ignore);
    }
}
