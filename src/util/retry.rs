//! Bounded retry of operations against unreliable remote systems.
//!
//! Every remote-facing call (store, list, delete, notify) goes through
//! [`RetryExecutor::execute`]. The wrapped operation classifies its own
//! failures as [`Failure::Transient`] or [`Failure::Fatal`]; only transient
//! failures are retried.

use std::fmt;
use std::io;
use std::time::Duration;

use derive_more::{Display, Error};

use super::cancel::CancelToken;

/// Default number of retries after the first failed attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Default pause between two attempts.
pub const DEFAULT_RETRY_WAIT: Duration = Duration::from_secs(30);

/// Failure of a single attempt, classified by the operation itself.
#[derive(Debug)]
pub enum Failure<E> {
    /// Timeouts and recoverable I/O problems. Worth another attempt.
    Transient(E),
    /// Authentication, configuration or programmer errors. Never retried.
    Fatal(E),
}

impl<E> Failure<E> {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn into_inner(self) -> E {
        match self {
            Self::Transient(e) | Self::Fatal(e) => e,
        }
    }

    /// Maps the inner error while keeping the classification.
    pub fn map<F>(self, f: impl FnOnce(E) -> F) -> Failure<F> {
        match self {
            Self::Transient(e) => Failure::Transient(f(e)),
            Self::Fatal(e) => Failure::Fatal(f(e)),
        }
    }
}

/// Classifies an I/O error as worth retrying or not.
///
/// Missing files, permission problems and invalid input won't go away by
/// trying again. Everything else (timeouts, interrupted or reset
/// connections, full buffers, ...) is assumed to be transient.
pub fn classify(err: io::Error) -> Failure<io::Error> {
    use io::ErrorKind::*;

    match err.kind() {
        NotFound | PermissionDenied | InvalidInput | InvalidData | Unsupported => {
            Failure::Fatal(err)
        }
        _ => Failure::Transient(err),
    }
}

#[derive(Debug, Display, Error)]
/// Final error of [`RetryExecutor::execute`].
pub enum RetryError<E> {
    /// The operation kept failing transiently until the retries ran out.
    #[display("{source} (gave up after {attempts} attempts)")]
    Exhausted {
        attempts: u32,
        source: E,
    },
    /// The operation failed with a non-retryable error.
    #[display("{source}")]
    Fatal { source: E },
    /// Cancellation was observed before the next attempt.
    #[display("cancelled after {attempts} attempts")]
    Cancelled {
        #[error(ignore)]
        attempts: u32,
        #[error(ignore)]
        last: Option<E>,
    },
}

impl<E> RetryError<E> {
    /// Number of times the operation was invoked.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::Cancelled { attempts, .. } => *attempts,
            Self::Fatal { .. } => 1,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// The last error returned by the operation, if any.
    pub fn into_source(self) -> Option<E> {
        match self {
            Self::Exhausted { source, .. } | Self::Fatal { source } => Some(source),
            Self::Cancelled { last, .. } => last,
        }
    }
}

/// Executes operations with a fixed number of retries and a fixed wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryExecutor {
    max_retries: u32,
    retry_wait: Duration,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WAIT)
    }
}

impl RetryExecutor {
    pub fn new(max_retries: u32, retry_wait: Duration) -> Self {
        Self {
            max_retries,
            retry_wait,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retry_wait(&self) -> Duration {
        self.retry_wait
    }

    /// Runs `operation` until it succeeds, fails fatally, exhausts the
    /// retries or `cancel` fires.
    ///
    /// `what` names the operation in log lines. The operation is invoked at
    /// most `max_retries + 1` times. Cancellation is checked before every
    /// invocation and interrupts the wait between two attempts.
    pub fn execute<T, E, F>(
        &self,
        what: &str,
        cancel: &CancelToken,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        E: fmt::Display,
        F: FnMut() -> Result<T, Failure<E>>,
    {
        let mut retries = 0;
        let mut last = None;

        loop {
            if cancel.is_cancelled() {
                log::warn!(target: "retry", "{what}: cancelled after {retries} attempts");
                return Err(RetryError::Cancelled {
                    attempts: retries,
                    last,
                });
            }

            match operation() {
                Ok(value) => return Ok(value),
                Err(Failure::Fatal(source)) => {
                    log::debug!(target: "retry", "{what}: not retrying: {source}");
                    return Err(RetryError::Fatal { source });
                }
                Err(Failure::Transient(source)) => {
                    retries += 1;
                    if retries > self.max_retries {
                        return Err(RetryError::Exhausted {
                            attempts: retries,
                            source,
                        });
                    }

                    log::info!(
                        target: "retry",
                        "{what}: {source}. Retry #{retries} of {}.",
                        self.max_retries
                    );
                    last = Some(source);

                    if !cancel.wait(self.retry_wait) {
                        log::warn!(target: "retry", "{what}: cancelled after {retries} attempts");
                        return Err(RetryError::Cancelled {
                            attempts: retries,
                            last,
                        });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn executor(max_retries: u32) -> RetryExecutor {
        RetryExecutor::new(max_retries, Duration::ZERO)
    }

    fn flaky(fail_times: u32, calls: &mut u32) -> Result<&'static str, Failure<io::Error>> {
        *calls += 1;
        if *calls <= fail_times {
            Err(Failure::Transient(io::Error::from(io::ErrorKind::TimedOut)))
        } else {
            Ok("done")
        }
    }

    #[rstest]
    #[case(io::ErrorKind::NotFound, false)]
    #[case(io::ErrorKind::PermissionDenied, false)]
    #[case(io::ErrorKind::InvalidInput, false)]
    #[case(io::ErrorKind::TimedOut, true)]
    #[case(io::ErrorKind::ConnectionReset, true)]
    #[case(io::ErrorKind::Interrupted, true)]
    fn io_error_classification(#[case] kind: io::ErrorKind, #[case] transient: bool) {
        assert_eq!(classify(io::Error::from(kind)).is_transient(), transient);
    }

    #[test]
    fn defaults() {
        let retry = RetryExecutor::default();
        assert_eq!(retry.max_retries(), 10);
        assert_eq!(retry.retry_wait(), Duration::from_secs(30));
    }

    #[rstest]
    #[case::no_retries(0)]
    #[case::two(2)]
    #[case::ten(10)]
    fn succeeds_after_max_retries_transient_failures(#[case] max_retries: u32) {
        let mut calls = 0;
        let res = executor(max_retries).execute("op", &CancelToken::new(), || {
            flaky(max_retries, &mut calls)
        });

        assert_eq!(res.unwrap(), "done");
        assert_eq!(calls, max_retries + 1);
    }

    #[rstest]
    #[case::no_retries(0)]
    #[case::two(2)]
    #[case::ten(10)]
    fn gives_up_after_max_retries_plus_one_attempts(#[case] max_retries: u32) {
        let mut calls = 0;
        let res = executor(max_retries).execute("op", &CancelToken::new(), || {
            flaky(max_retries + 1, &mut calls)
        });

        let err = res.unwrap_err();
        assert!(matches!(err, RetryError::Exhausted { .. }));
        assert_eq!(err.attempts(), max_retries + 1);
        assert_eq!(calls, max_retries + 1);
    }

    #[test]
    fn fatal_failure_is_not_retried() {
        let mut calls = 0;
        // A wait this long would hang the test if the executor slept.
        let retry = RetryExecutor::new(5, Duration::from_secs(3600));
        let res: Result<(), _> = retry.execute("op", &CancelToken::new(), || {
            calls += 1;
            Err(Failure::Fatal(io::Error::from(io::ErrorKind::PermissionDenied)))
        });

        let err = res.unwrap_err();
        assert!(matches!(err, RetryError::Fatal { .. }));
        assert_eq!(err.attempts(), 1);
        assert_eq!(calls, 1);
    }

    #[test]
    fn cancelled_token_prevents_any_attempt() {
        let cancel = CancelToken::new();
        cancel.cancel();

        let mut calls = 0;
        let res: Result<(), RetryError<io::Error>> = executor(3).execute("op", &cancel, || {
            calls += 1;
            Ok(())
        });

        assert!(res.unwrap_err().is_cancelled());
        assert_eq!(calls, 0);
    }

    #[test]
    fn cancellation_between_attempts_stops_retrying() {
        let cancel = CancelToken::new();
        let mut calls = 0;
        let res: Result<(), _> = executor(5).execute("op", &cancel, || {
            calls += 1;
            cancel.cancel();
            Err(Failure::Transient(io::Error::from(io::ErrorKind::TimedOut)))
        });

        let err = res.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.attempts(), 1);
        assert!(err.into_source().is_some());
        assert_eq!(calls, 1);
    }

    #[test]
    fn exhausted_error_mentions_attempts() {
        let res: Result<(), _> = executor(1).execute("op", &CancelToken::new(), || {
            Err(Failure::Transient(io::Error::other("boom")))
        });
        assert_eq!(
            res.unwrap_err().to_string(),
            "boom (gave up after 2 attempts)"
        );
    }
}
