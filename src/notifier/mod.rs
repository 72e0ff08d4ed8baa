//! Notifications about the outcome of a backup run.
//!
//! A [Notifier] decides from its `on_*` flags whether a run is worth a
//! message, renders the message and hands it to a [NotificationChannel].
//! Sending is retried; failures are logged and never reach the caller.
//!
//! Available channels:
//!
//! - [CommandChannel]: Runs a program with the message as last argument.
//! - [JsonFileChannel]: Appends a JSON record per notification to a file.
//! - [MemoryChannel]: Collects messages in memory.

pub mod command;
pub mod json_file;
pub mod memory;

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use derive_more::{Display, Error, From};
use regex::{Captures, Regex};

pub use command::CommandChannel;
pub use json_file::JsonFileChannel;
pub use memory::MemoryChannel;

use crate::model::{Model, Status};
use crate::util::cancel::CancelToken;
use crate::util::retry::{Failure, RetryError, RetryExecutor, DEFAULT_MAX_RETRIES};

/// Template used when a notifier doesn't configure its own message.
pub const DEFAULT_TEMPLATE: &str = "[{status}] {label} ({trigger})";

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{(\w+)\}").expect("placeholder regex is valid"));

/// Status details handed to message templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusData {
    pub status: Status,
    /// Human readable form of the status.
    pub message: &'static str,
}

impl From<Status> for StatusData {
    fn from(status: Status) -> Self {
        let message = match status {
            Status::Success => "Success",
            Status::Warning => "Warning",
            Status::Failure => "Failure",
        };
        Self { status, message }
    }
}

/// Renders the text of a notification.
pub type MessageFn = Arc<dyn Fn(&Model, &StatusData) -> String + Send + Sync>;

/// Message function rendering `template`.
///
/// `{status}`, `{label}` and `{trigger}` are replaced, other placeholders are
/// kept verbatim.
pub fn template(template: impl Into<String>) -> MessageFn {
    let template = template.into();
    Arc::new(move |model: &Model, data: &StatusData| {
        PLACEHOLDER
            .replace_all(&template, |caps: &Captures| match &caps[1] {
                "status" => data.message.to_string(),
                "label" => model.label.clone(),
                "trigger" => model.trigger.clone(),
                _ => caps[0].to_string(),
            })
            .into_owned()
    })
}

#[derive(Debug, Display, Error, From)]
/// Errors of a [NotificationChannel].
pub enum ChannelError {
    /// Talking to the channel failed.
    #[display("{_0}")]
    #[from]
    Io(io::Error),
    /// The notification command reported an error.
    #[display("{program} exited with {status}: {stderr}")]
    Command {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
    /// The notification couldn't be encoded.
    #[display("{_0}")]
    #[from]
    Json(serde_json::Error),
}

/// A way to deliver a notification.
pub trait NotificationChannel: Send + Sync {
    /// Delivers `message` about a run that ended with `status`.
    ///
    /// Classifies its own failures; only [Failure::Transient] ones are retried.
    fn send(&self, message: &str, status: Status) -> Result<(), Failure<ChannelError>>;
}

#[derive(Debug, Display, Error)]
/// Sending a notification failed for good.
#[display("{notifier} Failed! {source}")]
pub struct NotifyError {
    pub notifier: String,
    pub source: RetryError<ChannelError>,
}

/// Result of [Notifier::perform].
#[derive(Debug)]
pub enum NotifyOutcome {
    /// The flags of the notifier don't ask for a message about this run.
    Skipped,
    /// The message was delivered.
    Sent(Status),
    /// Delivery failed, the error has been logged.
    Failed(NotifyError),
    /// The channel panicked.
    Panicked,
}

/// Sends a message about the outcome of a run through a channel.
pub struct Notifier {
    name: String,
    on_success: bool,
    on_warning: bool,
    on_failure: bool,
    retry: RetryExecutor,
    message: MessageFn,
    channel: Box<dyn NotificationChannel>,
}

impl Notifier {
    /// Notifier sending on every outcome with the default retry policy.
    pub fn new(name: impl Into<String>, channel: Box<dyn NotificationChannel>) -> Self {
        Self {
            name: name.into(),
            on_success: true,
            on_warning: true,
            on_failure: true,
            retry: RetryExecutor::default(),
            message: template(DEFAULT_TEMPLATE),
            channel,
        }
    }

    pub fn on_success(mut self, on_success: bool) -> Self {
        self.on_success = on_success;
        self
    }

    pub fn on_warning(mut self, on_warning: bool) -> Self {
        self.on_warning = on_warning;
        self
    }

    pub fn on_failure(mut self, on_failure: bool) -> Self {
        self.on_failure = on_failure;
        self
    }

    pub fn with_retry(mut self, retry: RetryExecutor) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_message(mut self, message: MessageFn) -> Self {
        self.message = message;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Status to notify about for a run that exited with `exit_code`.
    ///
    /// A warning is a degraded success, so `on_success` alone opts in to
    /// warnings as well.
    pub fn status_for(&self, exit_code: i32) -> Option<Status> {
        match Status::from_exit_code(exit_code) {
            Status::Success if self.on_success => Some(Status::Success),
            Status::Warning if self.on_success || self.on_warning => Some(Status::Warning),
            Status::Failure if self.on_failure => Some(Status::Failure),
            _ => None,
        }
    }

    /// Notifies about a run of `model` that exited with `exit_code`.
    ///
    /// Never fails: delivery errors are logged and returned as
    /// [NotifyOutcome::Failed].
    pub fn perform(&self, model: &Model, exit_code: i32, cancel: &CancelToken) -> NotifyOutcome {
        let Some(status) = self.status_for(exit_code) else {
            log::debug!(target: "notifier", "{}: nothing to send for exit code {exit_code}", self.name);
            return NotifyOutcome::Skipped;
        };

        let message = (self.message)(model, &StatusData::from(status));
        log::info!(target: "notifier", "Sending notification using {}...", self.name);

        let what = format!("Notification using {}", self.name);
        match self
            .retry
            .execute(&what, cancel, || self.channel.send(&message, status))
        {
            Ok(()) => NotifyOutcome::Sent(status),
            Err(source) => {
                let err = NotifyError {
                    notifier: self.name.clone(),
                    source,
                };
                log::error!(target: "notifier", "{err}");
                NotifyOutcome::Failed(err)
            }
        }
    }
}

fn yes() -> bool {
    true
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_wait() -> u64 {
    30
}

/// Configuration of one notifier.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NotifierConfig {
    /// Name of the notifier in log lines.
    pub name: String,

    /// Notify about successful runs (and runs with warnings).
    #[serde(default = "yes")]
    pub on_success: bool,

    /// Notify about runs with warnings.
    #[serde(default = "yes")]
    pub on_warning: bool,

    /// Notify about failed runs.
    #[serde(default = "yes")]
    pub on_failure: bool,

    /// Retries of a failed delivery.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Seconds to wait before a retry.
    #[serde(default = "default_retry_wait")]
    pub retry_wait: u64,

    /// Message template, see [template].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(flatten)]
    pub channel: ChannelConfig,
}

/// Channel specific configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelConfig {
    /// See [CommandChannel].
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// See [JsonFileChannel].
    JsonFile { path: PathBuf },
}

impl NotifierConfig {
    pub fn build(&self) -> Notifier {
        let channel: Box<dyn NotificationChannel> = match &self.channel {
            ChannelConfig::Command { program, args } => {
                Box::new(CommandChannel::new(program, args.clone()))
            }
            ChannelConfig::JsonFile { path } => Box::new(JsonFileChannel::new(path)),
        };

        let message = template(self.message.as_deref().unwrap_or(DEFAULT_TEMPLATE));
        let retry = RetryExecutor::new(self.max_retries, Duration::from_secs(self.retry_wait));

        Notifier::new(&self.name, channel)
            .on_success(self.on_success)
            .on_warning(self.on_warning)
            .on_failure(self.on_failure)
            .with_retry(retry)
            .with_message(message)
    }
}
