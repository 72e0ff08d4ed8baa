use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use rbackup_lib::cli::{Action, Cli};
use rbackup_lib::job::{ConfigError, Job, JobConfig};
use rbackup_lib::model::Status;
use rbackup_lib::util::cancel::CancelToken;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // init logger
    let mut env_logger = env_logger::builder();
    if let Some(level) = cli.verbose {
        env_logger.filter_level(level);
    }
    env_logger.try_init().expect("env_logger should not fail");

    let mut config = match JobConfig::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(ConfigError::Read(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            log::debug!(
                "Writing default config to {} because it doesn't exist yet",
                cli.config.display()
            );
            let default_config = JobConfig::default();
            let config_str = toml::to_string_pretty(&default_config)
                .expect("default config should be serializable");
            if let Err(e) = std::fs::write(&cli.config, config_str) {
                log::warn!(
                    "Writing default config to {} failed {e}",
                    cli.config.display(),
                );
            }
            log::info!("Adjust the config to your needs and run again");
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            log::error!("{e}");
            return exit_code(Status::Failure);
        }
    };
    if cli.timeout.is_some() {
        config.timeout = cli.timeout;
    }

    let job = config.build();
    match cli.action.unwrap_or_default() {
        Action::Perform => {
            let report = job.perform(&config.cancel_token());
            exit_code(report.status)
        }
        Action::List => exit_code(list(&job)),
    }
}

/// Prints the packages of every storage target.
fn list(job: &Job) -> Status {
    let cancel = CancelToken::with_timeout(Duration::from_secs(300));
    let mut status = Status::Success;

    for storage in job.storages() {
        match storage.list(&cancel) {
            Ok(packages) => {
                for package in packages {
                    println!(
                        "{}\t{}\t{} chunk(s)",
                        storage.name(),
                        package.id(),
                        package.chunks().len()
                    );
                }
            }
            Err(e) => {
                log::error!(target: "storage", "Listing packages on {} failed: {e}", storage.name());
                status = Status::Failure;
            }
        }
    }

    status
}

fn exit_code(status: Status) -> ExitCode {
    ExitCode::from(u8::try_from(status.exit_code()).unwrap_or(2))
}
