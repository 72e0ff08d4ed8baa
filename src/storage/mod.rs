//! Storage targets packages are shipped to.
//!
//! Currently the following targets are implemented:
//!
//! - [LocalTarget]: A directory, e.g. a mounted network share.
//! - [MemoryTarget]: Keeps packages in memory. Useful for dry runs and tests.
//!
//! Targets don't retry on their own. Callers run every operation through a
//! [RetryExecutor], see [Storage].

pub mod local;
pub mod memory;

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use derive_more::{Display, Error};

pub use local::LocalTarget;
pub use memory::MemoryTarget;

use crate::package::{Package, PackageId};
use crate::util::cancel::CancelToken;
use crate::util::retry::{Failure, RetryError, RetryExecutor, DEFAULT_MAX_RETRIES};

/// Operation on a [StorageTarget].
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageOp {
    #[display("store")]
    Store,
    #[display("list")]
    List,
    #[display("delete")]
    Delete,
    #[display("abort")]
    Abort,
}

#[derive(Debug, Display, Error)]
/// Errors of a single [StorageTarget] operation.
pub enum StorageError {
    /// Uploading the chunks of a package failed.
    #[display("Storing {id} on {target} failed: {source}")]
    Store {
        target: String,
        id: PackageId,
        source: io::Error,
    },
    /// Enumerating the packages of a target failed.
    #[display("Listing packages on {target} failed: {source}")]
    List { target: String, source: io::Error },
    /// Removing the chunks of a package failed.
    #[display("Deleting {id} from {target} failed: {source}")]
    Delete {
        target: String,
        id: PackageId,
        source: io::Error,
    },
}

impl StorageError {
    pub fn op(&self) -> StorageOp {
        match self {
            Self::Store { .. } => StorageOp::Store,
            Self::List { .. } => StorageOp::List,
            Self::Delete { .. } => StorageOp::Delete,
        }
    }
}

/// A remote location packages are stored in.
///
/// Each target owns the namespace of one trigger; packages of other triggers
/// are never listed nor touched.
pub trait StorageTarget: Send + Sync {
    /// Name used in log lines and reports.
    fn name(&self) -> &str;

    /// Uploads every chunk of `package`.
    ///
    /// Must be safe to call again after a failed attempt: chunks uploaded
    /// before are completed or overwritten, never duplicated. The package
    /// only becomes visible to [list](Self::list) once all chunks are there.
    fn store(&self, package: &Package) -> Result<(), Failure<StorageError>>;

    /// All complete packages on the target, ordered by id ascending.
    fn list(&self) -> Result<Vec<Package>, Failure<StorageError>>;

    /// Removes all chunks of `package`. Deleting an absent package succeeds.
    fn delete(&self, package: &Package) -> Result<(), Failure<StorageError>>;

    /// Discards what a failed [store](Self::store) of `package` left behind.
    ///
    /// Called once after storing failed for good; ids aren't reused, so
    /// nothing would ever resume that upload.
    fn abort(&self, _package: &Package) -> Result<(), Failure<StorageError>> {
        Ok(())
    }
}

/// A [StorageTarget] together with its retention and retry settings.
pub struct Storage {
    target: Box<dyn StorageTarget>,
    keep: usize,
    retry: RetryExecutor,
}

impl Storage {
    pub fn new(target: Box<dyn StorageTarget>, keep: usize, retry: RetryExecutor) -> Self {
        Self {
            target,
            keep,
            retry,
        }
    }

    pub fn name(&self) -> &str {
        self.target.name()
    }

    pub fn target(&self) -> &dyn StorageTarget {
        self.target.as_ref()
    }

    /// Number of packages to keep. `0` keeps everything.
    pub fn keep(&self) -> usize {
        self.keep
    }

    pub fn retry(&self) -> &RetryExecutor {
        &self.retry
    }

    pub fn store(
        &self,
        package: &Package,
        cancel: &CancelToken,
    ) -> Result<(), RetryError<StorageError>> {
        let what = format!("Storing {} on {}", package.id(), self.name());
        self.retry
            .execute(&what, cancel, || self.target.store(package))
    }

    pub fn list(&self, cancel: &CancelToken) -> Result<Vec<Package>, RetryError<StorageError>> {
        let what = format!("Listing packages on {}", self.name());
        self.retry.execute(&what, cancel, || self.target.list())
    }

    /// Cleans up after a failed [store](Self::store). Not retried.
    pub fn abort(&self, package: &Package) -> Result<(), StorageError> {
        self.target.abort(package).map_err(Failure::into_inner)
    }
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_wait() -> u64 {
    30
}

/// Configuration of one storage target.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StorageConfig {
    /// Name of the target in log lines and reports.
    pub name: String,

    /// Number of packages to keep on the target. `0` disables cycling.
    #[serde(default)]
    pub keep: usize,

    /// Retries of a failed store, list or delete.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Seconds to wait before a retry.
    #[serde(default = "default_retry_wait")]
    pub retry_wait: u64,

    #[serde(flatten)]
    pub backend: BackendConfig,
}

/// Backend specific configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// See [LocalTarget].
    Local {
        /// Directory holding one sub-directory per trigger.
        path: PathBuf,
    },
    /// See [MemoryTarget].
    Memory,
}

impl StorageConfig {
    /// Creates the configured target for the packages of `trigger`.
    pub fn build(&self, trigger: &str) -> Storage {
        let target: Box<dyn StorageTarget> = match &self.backend {
            BackendConfig::Local { path } => {
                if path.is_relative() {
                    log::warn!(target: "storage", "Path of storage {} is relative: {}", self.name, path.display());
                }
                Box::new(LocalTarget::new(&self.name, path, trigger))
            }
            BackendConfig::Memory => Box::new(MemoryTarget::new(&self.name)),
        };

        let retry = RetryExecutor::new(self.max_retries, Duration::from_secs(self.retry_wait));
        Storage::new(target, self.keep, retry)
    }
}
