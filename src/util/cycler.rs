//! Retention of stored packages.
//!
//! After a package was stored successfully, the [Cycler] removes the oldest
//! packages of the target until at most `keep` remain. The package just
//! stored always takes one of the `keep` slots, whatever its id. Packages
//! missing chunks don't take a slot; they are removed once they are older
//! than the oldest kept package.

use derive_more::{Display, Error};

use crate::package::{Package, PackageId, PackageStatus};
use crate::storage::{StorageError, StorageTarget};
use crate::util::cancel::CancelToken;
use crate::util::retry::{RetryError, RetryExecutor};

#[derive(Debug, Display, Error)]
/// Errors while cycling out old packages.
///
/// None of them affect the package stored before cycling.
pub enum CycleError {
    /// The stored packages couldn't be enumerated, nothing was deleted.
    #[display("Listing packages failed: {source}")]
    List { source: RetryError<StorageError> },
    /// Some stale packages couldn't be deleted.
    #[display("{} of {} stale package(s) couldn't be removed", failed.len(), failed.len() + removed.len())]
    Incomplete {
        removed: Vec<Package>,
        failed: Vec<(PackageId, RetryError<StorageError>)>,
    },
}

/// Applies a keep-count retention to a [StorageTarget].
#[derive(Debug, Clone, Copy)]
pub struct Cycler<'a> {
    retry: &'a RetryExecutor,
    cancel: &'a CancelToken,
}

impl<'a> Cycler<'a> {
    pub fn new(retry: &'a RetryExecutor, cancel: &'a CancelToken) -> Self {
        Self { retry, cancel }
    }

    /// Deletes all but the `keep` most recent packages of `target`, counting
    /// `current` (the package just stored) as one of them.
    ///
    /// `keep == 0` keeps everything. Returns the removed packages in
    /// ascending order. A failed deletion doesn't stop the remaining stale
    /// packages from being removed.
    pub fn cycle(
        &self,
        target: &dyn StorageTarget,
        keep: usize,
        current: &PackageId,
    ) -> Result<Vec<Package>, CycleError> {
        if keep == 0 {
            log::trace!(target: "cycler", "No retention configured for {}", target.name());
            return Ok(Vec::new());
        }

        let what = format!("Listing packages on {}", target.name());
        let mut packages = self
            .retry
            .execute(&what, self.cancel, || target.list())
            .map_err(|source| CycleError::List { source })?;
        packages.retain(|p| p.id() != current);
        packages.sort_by(|a, b| a.id().cmp(b.id()));

        for package in packages.iter().filter(|p| !p.is_complete()) {
            log::warn!(target: "cycler", "{} on {} is incomplete and doesn't count as a kept copy", package.id(), target.name());
        }

        // one slot is taken by the current package
        let kept: Vec<PackageId> = packages
            .iter()
            .rev()
            .filter(|p| p.is_complete())
            .take(keep - 1)
            .map(|p| p.id().clone())
            .collect();
        let complete = packages.iter().filter(|p| p.is_complete()).count();
        if complete <= kept.len() {
            log::debug!(target: "cycler", "{} holds {} of {keep} package(s), nothing to cycle", target.name(), complete + 1);
            return Ok(Vec::new());
        }

        let oldest_kept = kept.last().unwrap_or(current).min(current).clone();
        let stale: Vec<Package> = packages
            .into_iter()
            .filter(|p| {
                if p.is_complete() {
                    !kept.contains(p.id())
                } else {
                    *p.id() < oldest_kept
                }
            })
            .collect();
        if stale.is_empty() {
            return Ok(Vec::new());
        }
        log::info!(target: "cycler", "Cycling {} package(s) out of {}", stale.len(), target.name());

        let mut removed = Vec::with_capacity(stale.len());
        let mut failed = Vec::new();
        for mut package in stale {
            let what = format!("Deleting {} from {}", package.id(), target.name());
            match self.retry.execute(&what, self.cancel, || target.delete(&package)) {
                Ok(()) => {
                    if let Err(e) = package.set_status(PackageStatus::CycledOut) {
                        log::debug!(target: "cycler", "{e}");
                    }
                    removed.push(package);
                }
                Err(e) => {
                    log::warn!(target: "cycler", "There was a problem removing {}: {e}", package.id());
                    failed.push((package.id().clone(), e));
                }
            }
        }

        if failed.is_empty() {
            Ok(removed)
        } else {
            Err(CycleError::Incomplete { removed, failed })
        }
    }
}
