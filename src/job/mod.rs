//! Orchestration of a single backup run.
//!
//! A [Job] builds the package, stores it to every configured [Storage],
//! cycles out old packages on each target the package was stored to and
//! finally notifies every [Notifier] exactly once about the aggregated
//! [Status].

pub mod config;

use std::panic::{self, AssertUnwindSafe};
use std::thread;

pub use config::{ConfigError, JobConfig};

use crate::builder::{BuildError, PackageBuilder};
use crate::model::{Model, Status};
use crate::notifier::{Notifier, NotifyOutcome};
use crate::package::{IdGenerator, Package, PackageId, PackageStatus};
use crate::storage::{Storage, StorageError};
use crate::util::cancel::CancelToken;
use crate::util::clock::{Clock, SystemClock};
use crate::util::cycler::{CycleError, Cycler};
use crate::util::retry::RetryError;

/// What happened on one storage target.
#[derive(Debug)]
pub enum TargetOutcome {
    /// The package was stored. Cycling problems don't affect the run.
    Stored {
        removed: Vec<PackageId>,
        cycle_error: Option<CycleError>,
    },
    /// Storing failed after exhausting the retries (or for good).
    Failed(RetryError<StorageError>),
    /// The run was cancelled before the target was attempted.
    Skipped,
    /// The target panicked while storing.
    Panicked,
}

#[derive(Debug)]
pub struct TargetReport {
    pub target: String,
    pub outcome: TargetOutcome,
}

impl TargetReport {
    pub fn is_stored(&self) -> bool {
        matches!(self.outcome, TargetOutcome::Stored { .. })
    }

    fn status(&self) -> Status {
        if self.is_stored() {
            Status::Success
        } else {
            Status::Failure
        }
    }
}

/// Summary of a run.
#[derive(Debug)]
pub struct JobReport {
    pub id: PackageId,
    /// The built package. [None] if building failed.
    pub package: Option<Package>,
    pub build_error: Option<BuildError>,
    pub warnings: Vec<String>,
    pub targets: Vec<TargetReport>,
    pub notifications: Vec<(String, NotifyOutcome)>,
    /// Worst outcome of all steps, reported to the notifiers.
    pub status: Status,
}

impl JobReport {
    fn new(id: PackageId) -> Self {
        Self {
            id,
            package: None,
            build_error: None,
            warnings: Vec::new(),
            targets: Vec::new(),
            notifications: Vec::new(),
            status: Status::Success,
        }
    }

    fn aggregate(&self) -> Status {
        let build = if self.build_error.is_some() {
            Status::Failure
        } else if !self.warnings.is_empty() {
            Status::Warning
        } else {
            Status::Success
        };

        self.targets
            .iter()
            .map(TargetReport::status)
            .fold(build, Status::worst)
    }
}

/// A configured backup job.
pub struct Job {
    model: Model,
    builder: Box<dyn PackageBuilder>,
    storages: Vec<Storage>,
    notifiers: Vec<Notifier>,
    clock: Box<dyn Clock>,
    ids: IdGenerator,
    parallel: bool,
}

impl Job {
    pub fn new(model: Model, builder: Box<dyn PackageBuilder>) -> Self {
        Self {
            model,
            builder,
            storages: Vec::new(),
            notifiers: Vec::new(),
            clock: Box::new(SystemClock),
            ids: IdGenerator::new(),
            parallel: false,
        }
    }

    /// Adds a target the package is stored to.
    pub fn store_with(mut self, storage: Storage) -> Self {
        self.storages.push(storage);
        self
    }

    /// Adds a notifier informed about the outcome.
    pub fn notify_by(mut self, notifier: Notifier) -> Self {
        self.notifiers.push(notifier);
        self
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Store to the targets and notify concurrently, one thread each.
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn storages(&self) -> &[Storage] {
        &self.storages
    }

    /// Runs the job.
    ///
    /// Never fails: every problem is recorded in the returned [JobReport].
    /// `cancel` is observed while storing and cycling. Notifications are
    /// always sent, even for a cancelled run.
    pub fn perform(&self, cancel: &CancelToken) -> JobReport {
        self.seed_ids(cancel);
        let id = self.ids.next(&self.model.trigger, self.clock.now());
        log::info!(target: "job", "Performing backup {} ({id})", self.model.label);

        let mut report = JobReport::new(id.clone());
        let built = unwind(|| self.builder.build(id)).unwrap_or(Err(BuildError::Panicked));
        match built {
            Ok(built) => {
                for warning in &built.warnings {
                    log::warn!(target: "job", "{warning}");
                }
                report.warnings.extend(built.warnings);

                let mut package = built.package;
                report.targets = self.store(&package, cancel);
                self.finish_package(&mut package, &report.targets, &mut report.warnings);
                report.package = Some(package);
            }
            Err(e) => {
                log::error!(target: "job", "Building package {} failed: {e}", report.id);
                report.build_error = Some(e);
            }
        }

        report.status = report.aggregate();
        report.notifications = self.notify(report.status);

        match report.status {
            Status::Success => log::info!(target: "job", "Backup {} finished successfully", self.model.label),
            Status::Warning => log::warn!(target: "job", "Backup {} finished with warnings", self.model.label),
            Status::Failure => log::error!(target: "job", "Backup {} failed", self.model.label),
        }
        report
    }

    /// Makes sure the next id sorts after every package already stored.
    ///
    /// Other processes may have stored packages of the same trigger, possibly
    /// with a clock ahead of ours.
    fn seed_ids(&self, cancel: &CancelToken) {
        for storage in &self.storages {
            match unwind(|| storage.list(cancel)) {
                Some(Ok(packages)) => {
                    if let Some(latest) = packages.iter().map(Package::id).max() {
                        self.ids.observe(latest);
                    }
                }
                Some(Err(e)) => {
                    log::warn!(target: "job", "Listing packages on {} failed: {e}", storage.name());
                }
                None => {
                    log::warn!(target: "job", "Listing packages on {} panicked", storage.name());
                }
            }
        }
    }

    fn store(&self, package: &Package, cancel: &CancelToken) -> Vec<TargetReport> {
        if self.storages.is_empty() {
            log::warn!(target: "job", "No storage configured for {}", self.model.trigger);
            return Vec::new();
        }

        if !self.parallel {
            return self
                .storages
                .iter()
                .map(|storage| self.store_to(storage, package, cancel))
                .collect();
        }

        thread::scope(|scope| {
            let handles: Vec<_> = self
                .storages
                .iter()
                .map(|storage| scope.spawn(move || self.store_to(storage, package, cancel)))
                .collect();

            handles
                .into_iter()
                .zip(&self.storages)
                .map(|(handle, storage)| handle.join().unwrap_or_else(|_| panicked(storage)))
                .collect()
        })
    }

    fn store_to(&self, storage: &Storage, package: &Package, cancel: &CancelToken) -> TargetReport {
        unwind(|| self.store_and_cycle(storage, package, cancel))
            .unwrap_or_else(|| panicked(storage))
    }

    /// Stores `package` on one target and cycles the target afterwards.
    fn store_and_cycle(
        &self,
        storage: &Storage,
        package: &Package,
        cancel: &CancelToken,
    ) -> TargetReport {
        let target = storage.name().to_string();

        if cancel.is_cancelled() {
            log::warn!(target: "job", "Cancelled, skipping storage {target}");
            return TargetReport {
                target,
                outcome: TargetOutcome::Skipped,
            };
        }

        if let Err(e) = storage.store(package, cancel) {
            log::error!(target: "job", "Storing {} on {target} failed: {e}", package.id());
            if let Err(e) = storage.abort(package) {
                log::warn!(target: "job", "Cleaning up on {target} failed: {e}");
            }
            return TargetReport {
                target,
                outcome: TargetOutcome::Failed(e),
            };
        }
        log::info!(target: "job", "Stored {} on {target}", package.id());

        // only cycle once the new package is safely stored
        let cycler = Cycler::new(storage.retry(), cancel);
        let cycled = cycler.cycle(storage.target(), storage.keep(), package.id());
        let (removed, cycle_error) = match cycled {
            Ok(removed) => (removed, None),
            Err(e) => {
                log::warn!(target: "job", "Cycling {target} failed, old packages remain: {e}");
                let removed = match &e {
                    CycleError::Incomplete { removed, .. } => removed.clone(),
                    CycleError::List { .. } => Vec::new(),
                };
                (removed, Some(e))
            }
        };

        TargetReport {
            target,
            outcome: TargetOutcome::Stored {
                removed: removed.iter().map(|p| p.id().clone()).collect(),
                cycle_error,
            },
        }
    }

    /// Settles the package status and removes its local files.
    fn finish_package(
        &self,
        package: &mut Package,
        targets: &[TargetReport],
        warnings: &mut Vec<String>,
    ) {
        let next = if targets.iter().any(TargetReport::is_stored) {
            PackageStatus::Stored
        } else {
            PackageStatus::Failed
        };
        if let Err(e) = package.set_status(next) {
            log::debug!(target: "job", "{e}");
        }

        let cleanup = unwind(|| self.builder.cleanup(package)).unwrap_or(Err(BuildError::Panicked));
        if let Err(e) = cleanup {
            let warning = format!("Removing local files of {} failed: {e}", package.id());
            log::warn!(target: "job", "{warning}");
            warnings.push(warning);
        }
    }

    /// Informs every notifier. Nothing a notifier does escapes.
    fn notify(&self, status: Status) -> Vec<(String, NotifyOutcome)> {
        let exit_code = status.exit_code();
        // notifications aren't subject to the run's cancellation
        let cancel = CancelToken::new();
        let notify = |notifier: &Notifier| {
            let outcome = unwind(|| notifier.perform(&self.model, exit_code, &cancel))
                .unwrap_or_else(|| {
                    log::error!(target: "notifier", "{} Failed! The notifier panicked", notifier.name());
                    NotifyOutcome::Panicked
                });
            (notifier.name().to_string(), outcome)
        };

        if !self.parallel {
            return self.notifiers.iter().map(notify).collect();
        }

        thread::scope(|scope| {
            let handles: Vec<_> = self
                .notifiers
                .iter()
                .map(|notifier| scope.spawn(move || notify(notifier)))
                .collect();

            handles
                .into_iter()
                .zip(&self.notifiers)
                .map(|(handle, notifier)| {
                    handle
                        .join()
                        .unwrap_or_else(|_| (notifier.name().to_string(), NotifyOutcome::Panicked))
                })
                .collect()
        })
    }
}

/// Runs `f`, turning a panic into [None].
fn unwind<T>(f: impl FnOnce() -> T) -> Option<T> {
    panic::catch_unwind(AssertUnwindSafe(f)).ok()
}

fn panicked(storage: &Storage) -> TargetReport {
    log::error!(target: "job", "Storing on {} panicked", storage.name());
    TargetReport {
        target: storage.name().to_string(),
        outcome: TargetOutcome::Panicked,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::NaiveDate;
    use rstest::rstest;

    use super::*;
    use crate::builder::{Built, FixedBuilder};
    use crate::model::Status;
    use crate::notifier::{MemoryChannel, NotificationChannel};
    use crate::storage::{MemoryTarget, StorageOp};
    use crate::util::clock::FixedClock;
    use crate::util::retry::{Failure, RetryExecutor};

    fn retry(max_retries: u32) -> RetryExecutor {
        RetryExecutor::new(max_retries, Duration::ZERO)
    }

    fn storage(target: &MemoryTarget, keep: usize) -> Storage {
        Storage::new(Box::new(target.clone()), keep, retry(2))
    }

    fn notifier(channel: &MemoryChannel) -> Notifier {
        Notifier::new("mem", Box::new(channel.clone())).with_retry(retry(2))
    }

    fn job() -> Job {
        Job::new(
            Model::new("db", "Database"),
            Box::new(FixedBuilder::new("db.gz", 2)),
        )
    }

    struct FailingBuilder;

    impl PackageBuilder for FailingBuilder {
        fn build(&self, _id: PackageId) -> Result<Built, BuildError> {
            Err(BuildError::Io(std::io::Error::other("disk full")))
        }
    }

    struct PanickingBuilder;

    impl PackageBuilder for PanickingBuilder {
        fn build(&self, _id: PackageId) -> Result<Built, BuildError> {
            panic!("builder exploded")
        }
    }

    struct PanickingTarget;

    impl crate::storage::StorageTarget for PanickingTarget {
        fn name(&self) -> &str {
            "boom"
        }

        fn store(&self, _package: &Package) -> Result<(), Failure<StorageError>> {
            panic!("target exploded")
        }

        fn list(&self) -> Result<Vec<Package>, Failure<StorageError>> {
            Ok(Vec::new())
        }

        fn delete(&self, _package: &Package) -> Result<(), Failure<StorageError>> {
            Ok(())
        }
    }

    struct PanickingChannel;

    impl NotificationChannel for PanickingChannel {
        fn send(
            &self,
            _message: &str,
            _status: Status,
        ) -> Result<(), Failure<crate::notifier::ChannelError>> {
            panic!("channel exploded")
        }
    }

    #[test]
    fn keep_two_over_three_runs() {
        let target = MemoryTarget::new("mem");
        let job = job().store_with(storage(&target, 2));
        let cancel = CancelToken::new();

        let p1 = job.perform(&cancel).id;
        assert_eq!(target.ids(), [p1.clone()]);

        let p2 = job.perform(&cancel).id;
        assert_eq!(target.ids(), [p1.clone(), p2.clone()]);

        let report = job.perform(&cancel);
        let p3 = report.id.clone();
        assert!(p1 < p2 && p2 < p3);
        assert_eq!(target.ids(), [p2, p3]);

        let TargetOutcome::Stored { removed, .. } = &report.targets[0].outcome else {
            panic!("package should have been stored");
        };
        assert_eq!(removed, &[p1]);
        assert_eq!(report.status, Status::Success);
    }

    #[test]
    fn runs_within_the_same_second_get_distinct_ids() {
        let time = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(3, 0, 0)
            .unwrap();
        let target = MemoryTarget::new("mem");
        let job = job()
            .with_clock(Box::new(FixedClock(time)))
            .store_with(storage(&target, 2));
        let cancel = CancelToken::new();

        let ids: Vec<_> = (0..3).map(|_| job.perform(&cancel).id).collect();

        assert!(ids[0] < ids[1] && ids[1] < ids[2]);
        assert_eq!(target.ids(), &ids[1..]);
    }

    fn at(hour: u32) -> FixedClock {
        FixedClock(
            NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(hour, 0, 0)
                .unwrap(),
        )
    }

    #[test]
    fn clock_behind_the_stored_packages_still_gets_a_newer_id() {
        let target = MemoryTarget::new("mem");
        let ahead = job().with_clock(Box::new(at(10))).store_with(storage(&target, 1));
        let behind = job().with_clock(Box::new(at(9))).store_with(storage(&target, 1));
        let cancel = CancelToken::new();

        let first = ahead.perform(&cancel).id;
        let report = behind.perform(&cancel);

        assert_eq!(report.status, Status::Success);
        assert!(report.id > first);
        assert_eq!(target.ids(), [report.id.clone()]);
    }

    #[test]
    fn separate_jobs_in_the_same_second_get_distinct_ids() {
        let target = MemoryTarget::new("mem");
        let one = job().with_clock(Box::new(at(3))).store_with(storage(&target, 2));
        let other = job().with_clock(Box::new(at(3))).store_with(storage(&target, 2));
        let cancel = CancelToken::new();

        let first = one.perform(&cancel).id;
        let second = other.perform(&cancel).id;

        assert!(first < second);
        assert_eq!(target.ids(), [first, second]);
    }

    #[rstest]
    #[case::sequential(false)]
    #[case::parallel(true)]
    fn one_failing_target_fails_the_job(#[case] parallel: bool) {
        let (a, b) = (MemoryTarget::new("a"), MemoryTarget::new("b"));
        a.fail(StorageOp::Store, false, None);
        let channel = MemoryChannel::new();

        let job = job()
            .store_with(storage(&a, 1))
            .store_with(storage(&b, 1))
            .notify_by(notifier(&channel))
            .parallel(parallel);

        let report = job.perform(&CancelToken::new());

        assert_eq!(report.status, Status::Failure);
        assert!(matches!(
            report.targets[0].outcome,
            TargetOutcome::Failed(RetryError::Fatal { .. })
        ));
        assert!(report.targets[1].is_stored());
        assert_eq!(a.calls(StorageOp::Store), 1);
        assert_eq!(a.calls(StorageOp::Abort), 1);
        assert_eq!(b.calls(StorageOp::Abort), 0);
        // once before building, once more for cycling
        assert_eq!(a.calls(StorageOp::List), 1);
        assert_eq!(b.calls(StorageOp::List), 2);
        assert_eq!(b.ids(), [report.id.clone()]);
        assert_eq!(
            report.package.as_ref().map(Package::status),
            Some(PackageStatus::Stored)
        );
        assert_eq!(channel.sent(), [(Status::Failure, "[Failure] Database (db)".to_string())]);
    }

    #[test]
    fn transient_store_failures_are_retried() {
        let target = MemoryTarget::new("mem");
        target.fail(StorageOp::Store, true, Some(2));

        let report = job().store_with(storage(&target, 0)).perform(&CancelToken::new());

        assert_eq!(report.status, Status::Success);
        assert_eq!(target.calls(StorageOp::Store), 3);
        assert_eq!(target.ids().len(), 1);
    }

    #[test]
    fn exhausted_store_retries_fail_the_package() {
        let target = MemoryTarget::new("mem");
        target.fail(StorageOp::Store, true, None);

        let report = job().store_with(storage(&target, 1)).perform(&CancelToken::new());

        assert_eq!(report.status, Status::Failure);
        assert_eq!(target.calls(StorageOp::Store), 3);
        assert_eq!(target.calls(StorageOp::List), 1);
        assert_eq!(target.calls(StorageOp::Abort), 1);
        assert_eq!(
            report.package.as_ref().map(Package::status),
            Some(PackageStatus::Failed)
        );
    }

    #[test]
    fn cycle_failure_does_not_downgrade_the_status() {
        let target = MemoryTarget::new("mem");
        let job = job().store_with(storage(&target, 1));
        let cancel = CancelToken::new();
        job.perform(&cancel);

        target.fail(StorageOp::Delete, false, None);
        let report = job.perform(&cancel);

        assert_eq!(report.status, Status::Success);
        let TargetOutcome::Stored { cycle_error, .. } = &report.targets[0].outcome else {
            panic!("package should have been stored");
        };
        assert!(matches!(cycle_error, Some(CycleError::Incomplete { .. })));
        assert_eq!(target.ids().len(), 2);
    }

    #[test]
    fn build_failure_skips_storage_and_notifies_failure() {
        let target = MemoryTarget::new("mem");
        let channel = MemoryChannel::new();
        let job = Job::new(Model::new("db", "Database"), Box::new(FailingBuilder))
            .store_with(storage(&target, 1))
            .notify_by(notifier(&channel));

        let report = job.perform(&CancelToken::new());

        assert_eq!(report.status, Status::Failure);
        assert!(report.package.is_none());
        assert!(report.build_error.is_some());
        assert_eq!(target.calls(StorageOp::Store), 0);
        assert_eq!(channel.sent().len(), 1);
        assert_eq!(channel.sent()[0].0, Status::Failure);
    }

    #[test]
    fn builder_warning_downgrades_to_warning() {
        let target = MemoryTarget::new("mem");
        let channel = MemoryChannel::new();
        let job = Job::new(
            Model::new("db", "Database"),
            Box::new(FixedBuilder::new("db.gz", 1).with_warning("source is empty")),
        )
        .store_with(storage(&target, 1))
        .notify_by(notifier(&channel).on_success(false));

        let report = job.perform(&CancelToken::new());

        assert_eq!(report.status, Status::Warning);
        assert_eq!(channel.sent()[0].0, Status::Warning);
    }

    #[test]
    fn always_failing_notifier_does_not_escape() {
        let target = MemoryTarget::new("mem");
        let channel = MemoryChannel::new();
        channel.fail(true, None);
        let other = MemoryChannel::new();

        let job = job()
            .store_with(storage(&target, 1))
            .notify_by(notifier(&channel))
            .notify_by(notifier(&other));

        let report = job.perform(&CancelToken::new());

        assert_eq!(report.status, Status::Success);
        assert_eq!(channel.attempts(), 3);
        assert!(matches!(report.notifications[0].1, NotifyOutcome::Failed(_)));
        assert!(matches!(report.notifications[1].1, NotifyOutcome::Sent(Status::Success)));
        assert_eq!(other.sent().len(), 1);
    }

    #[rstest]
    #[case::sequential(false)]
    #[case::parallel(true)]
    fn panicking_notifier_does_not_escape(#[case] parallel: bool) {
        let channel = MemoryChannel::new();
        let job = job()
            .store_with(storage(&MemoryTarget::new("mem"), 1))
            .notify_by(Notifier::new("boom", Box::new(PanickingChannel)))
            .notify_by(notifier(&channel))
            .parallel(parallel);

        let report = job.perform(&CancelToken::new());

        assert_eq!(report.status, Status::Success);
        assert!(matches!(report.notifications[0].1, NotifyOutcome::Panicked));
        assert_eq!(channel.sent().len(), 1);
    }

    #[test]
    fn panicking_builder_fails_the_job() {
        let channel = MemoryChannel::new();
        let job = Job::new(Model::new("db", "Database"), Box::new(PanickingBuilder))
            .notify_by(notifier(&channel));

        let report = job.perform(&CancelToken::new());

        assert_eq!(report.status, Status::Failure);
        assert!(matches!(report.build_error, Some(BuildError::Panicked)));
        assert_eq!(channel.sent()[0].0, Status::Failure);
    }

    #[rstest]
    #[case::sequential(false)]
    #[case::parallel(true)]
    fn panicking_target_does_not_stop_the_others(#[case] parallel: bool) {
        let target = MemoryTarget::new("mem");
        let job = job()
            .store_with(Storage::new(Box::new(PanickingTarget), 1, retry(2)))
            .store_with(storage(&target, 1))
            .parallel(parallel);

        let report = job.perform(&CancelToken::new());

        assert_eq!(report.status, Status::Failure);
        assert!(matches!(report.targets[0].outcome, TargetOutcome::Panicked));
        assert!(report.targets[1].is_stored());
        assert_eq!(target.ids(), [report.id.clone()]);
    }

    #[test]
    fn cancelled_run_skips_targets_but_still_notifies() {
        let target = MemoryTarget::new("mem");
        let channel = MemoryChannel::new();
        let job = job()
            .store_with(storage(&target, 1))
            .notify_by(notifier(&channel));

        let cancel = CancelToken::new();
        cancel.cancel();
        let report = job.perform(&cancel);

        assert_eq!(report.status, Status::Failure);
        assert!(matches!(report.targets[0].outcome, TargetOutcome::Skipped));
        assert_eq!(target.calls(StorageOp::Store), 0);
        assert_eq!(channel.sent().len(), 1);
    }

    #[test]
    fn no_storage_is_still_a_success() {
        let channel = MemoryChannel::new();
        let report = job().notify_by(notifier(&channel)).perform(&CancelToken::new());

        assert_eq!(report.status, Status::Success);
        assert!(report.targets.is_empty());
        assert_eq!(channel.sent().len(), 1);
    }
}
