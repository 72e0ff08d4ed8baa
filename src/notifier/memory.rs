//! In-memory [NotificationChannel].

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{ChannelError, NotificationChannel};
use crate::model::Status;
use crate::util::retry::Failure;

/// Collects delivered messages. Clones share the same messages.
///
/// Delivery failures can be injected with [fail](Self::fail).
#[derive(Debug, Clone, Default)]
pub struct MemoryChannel {
    state: Arc<Mutex<State>>,
}

#[derive(Debug, Default)]
struct State {
    sent: Vec<(Status, String)>,
    attempts: usize,
    failure: Option<(bool, Option<usize>)>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lets the next `times` deliveries fail, or every delivery if [None].
    pub fn fail(&self, transient: bool, times: Option<usize>) {
        self.lock().failure = Some((transient, times));
    }

    /// Delivered messages in order.
    pub fn sent(&self) -> Vec<(Status, String)> {
        self.lock().sent.clone()
    }

    /// Number of delivery attempts, including failed ones.
    pub fn attempts(&self) -> usize {
        self.lock().attempts
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl NotificationChannel for MemoryChannel {
    fn send(&self, message: &str, status: Status) -> Result<(), Failure<ChannelError>> {
        let mut state = self.lock();
        state.attempts += 1;

        if let Some((transient, remaining)) = &mut state.failure {
            let fail = match remaining {
                Some(0) => false,
                Some(n) => {
                    *n -= 1;
                    true
                }
                None => true,
            };

            if fail {
                let err = ChannelError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "injected delivery failure",
                ));
                return Err(if *transient {
                    Failure::Transient(err)
                } else {
                    Failure::Fatal(err)
                });
            }
        }

        state.sent.push((status, message.to_string()));
        Ok(())
    }
}
