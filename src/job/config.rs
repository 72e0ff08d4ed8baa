//! Configuration file of a [Job].

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use derive_more::{Display, Error, From};

use super::Job;
use crate::builder::CompressConfig;
use crate::model::Model;
use crate::notifier::{ChannelConfig, NotifierConfig};
use crate::storage::{BackendConfig, StorageConfig};
use crate::util::cancel::CancelToken;

#[derive(Debug, Display, Error, From)]
/// Errors on loading a [JobConfig].
pub enum ConfigError {
    #[display("Reading the config file failed: {_0}")]
    Read(io::Error),
    #[display("Parsing the config file failed: {_0}")]
    Parse(toml::de::Error),
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
/// Configuration of a backup job.
pub struct JobConfig {
    /// Identifier of the job. Names the packages and their directories.
    pub trigger: String,

    /// Human readable name used in notifications.
    pub label: String,

    /// Store to all targets and notify concurrently.
    #[serde(default)]
    pub parallel: bool,

    /// Seconds after which storing and cycling are abandoned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// What to back up, see [CompressConfig].
    pub archive: CompressConfig,

    #[serde(default, rename = "storage")]
    pub storages: Vec<StorageConfig>,

    #[serde(default, rename = "notifier")]
    pub notifiers: Vec<NotifierConfig>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            trigger: "database".to_string(),
            label: "Database".to_string(),
            parallel: false,
            timeout: None,
            archive: CompressConfig::default(),
            storages: vec![StorageConfig {
                name: "local".to_string(),
                keep: 5,
                max_retries: 10,
                retry_wait: 30,
                backend: BackendConfig::Local {
                    path: PathBuf::from("/var/backups/rbackup"),
                },
            }],
            notifiers: vec![NotifierConfig {
                name: "log".to_string(),
                on_success: true,
                on_warning: true,
                on_failure: true,
                max_retries: 10,
                retry_wait: 30,
                message: None,
                channel: ChannelConfig::JsonFile {
                    path: PathBuf::from("/var/log/rbackup/notifications.jsonl"),
                },
            }],
        }
    }
}

impl JobConfig {
    /// Reads the configuration from the TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn model(&self) -> Model {
        Model::new(&self.trigger, &self.label)
    }

    pub fn build(&self) -> Job {
        let builder = Box::new(self.archive.build());
        let job = Job::new(self.model(), builder).parallel(self.parallel);

        let job = self
            .storages
            .iter()
            .fold(job, |job, cfg| job.store_with(cfg.build(&self.trigger)));
        self.notifiers
            .iter()
            .fold(job, |job, cfg| job.notify_by(cfg.build()))
    }

    /// Token cancelling a run once the configured timeout elapsed.
    pub fn cancel_token(&self) -> CancelToken {
        match self.timeout {
            Some(secs) => CancelToken::with_timeout(Duration::from_secs(secs)),
            None => CancelToken::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
        trigger = "db"
        label = "Database"
        parallel = true
        timeout = 3600

        [archive]
        source = "/srv/dump.sql"
        chunk_size = 100

        [[storage]]
        name = "nas"
        type = "local"
        path = "/mnt/nas"
        keep = 7

        [[storage]]
        name = "scratch"
        type = "memory"

        [[notifier]]
        name = "ops"
        type = "command"
        program = "notify-send"
        args = ["--urgency=low"]
        on_success = false
    "#;

    #[test]
    fn parse() {
        let cfg: JobConfig = toml::from_str(CONFIG).unwrap();

        assert!(cfg.parallel);
        assert_eq!(cfg.timeout, Some(3600));
        assert_eq!(cfg.archive.chunk_size, Some(100));
        assert_eq!(cfg.storages.len(), 2);
        assert_eq!(cfg.storages[0].keep, 7);
        assert_eq!(cfg.storages[1].keep, 0);
        assert_eq!(cfg.notifiers[0].name, "ops");

        let job = cfg.build();
        assert_eq!(job.model().trigger, "db");
        let names: Vec<_> = job.storages().iter().map(|s| s.name()).collect();
        assert_eq!(names, ["nas", "scratch"]);
    }

    #[test]
    fn minimal() {
        let cfg: JobConfig = toml::from_str(
            r#"
            trigger = "db"
            label = "Database"

            [archive]
            source = "/srv/dump.sql"
            "#,
        )
        .unwrap();

        assert!(!cfg.parallel);
        assert!(cfg.storages.is_empty());
        assert!(cfg.notifiers.is_empty());
        assert!(!cfg.cancel_token().is_cancelled());
    }

    #[test]
    fn default_config_round_trips() {
        let content = toml::to_string_pretty(&JobConfig::default()).unwrap();
        let cfg: JobConfig = toml::from_str(&content).unwrap();

        assert_eq!(cfg.trigger, "database");
        assert_eq!(cfg.storages[0].keep, 5);
        assert!(matches!(cfg.storages[0].backend, BackendConfig::Local { .. }));
        assert!(matches!(cfg.notifiers[0].channel, ChannelConfig::JsonFile { .. }));
    }

    #[test]
    fn load_reports_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let err = JobConfig::load(&tmp.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read(_)));
    }

    #[test]
    fn load_reports_invalid_toml() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "trigger = ").unwrap();

        let err = JobConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
