//! Building blocks shared by storage targets, notifiers and jobs.

pub mod cancel;
pub mod clock;
pub mod cycler;
pub mod retry;
