//! Library to back up data as packages and ship them to storage targets.
//!
//! A [Job](job::Job) builds a [Package](package::Package) of one or more
//! chunks, stores it on every configured [storage] target, cycles out
//! packages exceeding the retention of each target and finally informs
//! every [notifier] about the outcome. Transient failures of targets and
//! notifiers are retried, see [RetryExecutor](util::retry::RetryExecutor).

#![forbid(unsafe_code)]

pub mod builder;
pub mod cli;
pub mod job;
pub mod model;
pub mod notifier;
pub mod package;
pub mod storage;
pub mod util;
