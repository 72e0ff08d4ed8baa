//! Notification by running an external program using [CommandChannel].

use std::io;
use std::process::Command;

use super::{ChannelError, NotificationChannel};
use crate::model::Status;
use crate::util::retry::Failure;

/// Environment variable holding the status of the run.
pub const STATUS_ENV: &str = "RBACKUP_STATUS";

/// Runs `program args... <message>` for every notification.
///
/// The status is additionally passed in [`RBACKUP_STATUS`](STATUS_ENV).
/// A program that can't be found or executed is a configuration error and
/// not retried; a program exiting unsuccessfully is.
#[derive(Debug, Clone)]
pub struct CommandChannel {
    program: String,
    args: Vec<String>,
}

impl CommandChannel {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl NotificationChannel for CommandChannel {
    fn send(&self, message: &str, status: Status) -> Result<(), Failure<ChannelError>> {
        log::trace!(target: "notifier::command", "Running: {} {} {message:?}", self.program, self.args.join(" "));

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(message)
            .env(STATUS_ENV, status.to_string())
            .output()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
                    Failure::Fatal(ChannelError::Io(e))
                }
                _ => Failure::Transient(ChannelError::Io(e)),
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(Failure::Transient(ChannelError::Command {
                program: self.program.clone(),
                status: output.status,
                stderr: stderr.trim_end().to_string(),
            }));
        }

        // relay stderr
        if !stderr.is_empty() {
            log::warn!(target: "notifier::command", "{}", stderr.trim_end());
        }

        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn successful_command() {
        let script = r#"test "$1" = hello && test "$RBACKUP_STATUS" = Warning"#;
        let channel = CommandChannel::new("sh", vec!["-c".into(), script.into(), "sh".into()]);
        channel.send("hello", Status::Warning).unwrap();
    }

    #[test]
    fn failing_command_is_transient() {
        let channel = CommandChannel::new("sh", vec!["-c".into(), "echo nope >&2; exit 3".into()]);
        let err = channel.send("hello", Status::Success).unwrap_err();

        assert!(err.is_transient());
        let ChannelError::Command { stderr, .. } = err.into_inner() else {
            panic!("expected command error");
        };
        assert_eq!(stderr, "nope");
    }

    #[test]
    fn missing_program_is_fatal() {
        let channel = CommandChannel::new("/nonexistent/notify", vec![]);
        let err = channel.send("hello", Status::Failure).unwrap_err();
        assert!(!err.is_transient());
    }
}
