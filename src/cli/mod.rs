use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::LevelFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Verbosity of the command output.
    #[arg(long)]
    pub verbose: Option<LevelFilter>,

    /// Configuration of the backup job. A default one is written if missing.
    #[arg(long, short = 'c', env = "RBACKUP_CONFIG", default_value = "/etc/rbackup.toml")]
    pub config: PathBuf,

    /// Abandon storing after this many seconds. Overrides the config.
    #[arg(long)]
    pub timeout: Option<u64>,

    #[command(subcommand)]
    pub action: Option<Action>,
}

#[derive(Subcommand, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Build, store, cycle and notify. (Default)
    #[default]
    Perform,
    /// List the packages on every storage target.
    List,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perform_is_the_default() {
        let cli = Cli::try_parse_from(["rbackup", "--config", "/tmp/job.toml"]).unwrap();
        assert_eq!(cli.action.unwrap_or_default(), Action::Perform);
        assert_eq!(cli.config, PathBuf::from("/tmp/job.toml"));
    }

    #[test]
    fn list_with_verbosity() {
        let cli = Cli::try_parse_from(["rbackup", "--verbose", "debug", "list"]).unwrap();
        assert_eq!(cli.action, Some(Action::List));
        assert_eq!(cli.verbose, Some(LevelFilter::Debug));
    }
}
