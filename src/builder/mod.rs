//! Builders producing the [Package] of a run.
//!
//! - [CompressBuilder]: Gzip compressed copy of a source file, optionally
//!   split into chunks.
//! - [FixedBuilder]: A package with a fixed chunk list and no content.

pub mod compress;

use std::io;
use std::path::PathBuf;

use derive_more::{Display, Error, From};

pub use compress::{CompressBuilder, CompressConfig};

use crate::package::{Chunk, Package, PackageError, PackageId};

#[derive(Debug, Display, Error, From)]
/// Errors on building a package.
pub enum BuildError {
    /// The data to back up couldn't be read.
    #[display("Reading the backup source {} failed: {source}", path.display())]
    Source { path: PathBuf, source: io::Error },
    /// Writing the package failed.
    #[display("Writing the package failed: {_0}")]
    #[from]
    Io(io::Error),
    /// The package can't be laid out.
    #[display("{_0}")]
    #[from]
    Package(PackageError),
    /// The builder panicked.
    #[display("The package builder panicked")]
    Panicked,
}

/// Result of a successful build.
#[derive(Debug)]
pub struct Built {
    pub package: Package,
    /// Problems that didn't prevent the build but degrade the run.
    pub warnings: Vec<String>,
}

impl From<Package> for Built {
    fn from(package: Package) -> Self {
        Self {
            package,
            warnings: Vec::new(),
        }
    }
}

/// Produces the package of a run.
pub trait PackageBuilder: Send + Sync {
    /// Builds the package `id`. Its chunks must be complete on return.
    fn build(&self, id: PackageId) -> Result<Built, BuildError>;

    /// Removes local files of `package` once every target was attempted.
    fn cleanup(&self, _package: &Package) -> Result<(), BuildError> {
        Ok(())
    }
}

/// Builds packages consisting of a fixed set of chunks without content.
#[derive(Debug, Clone)]
pub struct FixedBuilder {
    base: String,
    chunks: usize,
    warnings: Vec<String>,
}

impl FixedBuilder {
    /// Packages of `chunks` chunks named after `base`.
    pub fn new(base: impl Into<String>, chunks: usize) -> Self {
        Self {
            base: base.into(),
            chunks,
            warnings: Vec::new(),
        }
    }

    /// Reports `warning` with every build.
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

impl PackageBuilder for FixedBuilder {
    fn build(&self, id: PackageId) -> Result<Built, BuildError> {
        let split = self.chunks > 1;
        let chunks = (0..self.chunks)
            .map(|i| Chunk::new(&self.base, i, split))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Built {
            package: Package::new(id, chunks),
            warnings: self.warnings.clone(),
        })
    }
}
