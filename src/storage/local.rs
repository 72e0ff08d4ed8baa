//! Stores packages in a local directory using [LocalTarget].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::{StorageError, StorageTarget};
use crate::package::{Package, PackageId};
use crate::util::retry::{classify, Failure};

const PARTIAL_SUFFIX: &str = ".partial";

/// The [LocalTarget] stores packages below a directory, typically a mounted
/// network share or an external drive.
///
/// Layout: `<path>/<trigger>/<stamp>/<chunk>`. A package is assembled in the
/// hidden directory `<path>/<trigger>/.<stamp>.partial` and renamed into
/// place once every chunk has been copied, so listing never sees half a
/// package. A store that failed half-way is resumed from that directory;
/// once it failed for good, [abort](StorageTarget::abort) removes it.
#[derive(Debug, Clone)]
pub struct LocalTarget {
    name: String,
    trigger: String,
    root: PathBuf,
}

impl LocalTarget {
    /// Create a new [LocalTarget] for the packages of `trigger` below `path`.
    pub fn new(name: impl Into<String>, path: &Path, trigger: &str) -> Self {
        Self {
            name: name.into(),
            trigger: trigger.to_string(),
            root: path.join(trigger),
        }
    }

    /// Directory holding the packages of the trigger.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn package_dir(&self, id: &PackageId) -> PathBuf {
        self.root.join(id.stamp())
    }

    fn partial_dir(&self, id: &PackageId) -> PathBuf {
        self.root.join(format!(".{}{PARTIAL_SUFFIX}", id.stamp()))
    }

    fn store_chunks(&self, package: &Package) -> io::Result<()> {
        let final_dir = self.package_dir(package.id());
        // a package that is already complete is refreshed in place, only a
        // resumed upload may keep chunks copied before
        let (dir, resume) = if final_dir.is_dir() {
            log::debug!(target: "storage::local", "{} already exists on {}, overwriting", package.id(), self.name);
            (final_dir.clone(), false)
        } else {
            (self.partial_dir(package.id()), true)
        };
        fs::create_dir_all(&dir)?;

        for chunk in package.chunks() {
            let source = chunk.local().ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("chunk {} has no local file", chunk.name()),
                )
            })?;
            let dest = dir.join(chunk.name());

            let source_len = fs::metadata(source)?.len();
            if resume && fs::metadata(&dest).is_ok_and(|meta| meta.len() == source_len) {
                log::trace!(target: "storage::local", "Chunk {} already uploaded, skipping", chunk.name());
                continue;
            }

            log::debug!(target: "storage::local", "Copy {} to {}", source.display(), dest.display());
            let tmp = dir.join(format!(".{}.tmp", chunk.name()));
            fs::copy(source, &tmp)?;
            fs::rename(&tmp, &dest)?;
        }

        if dir != final_dir {
            fs::rename(&dir, &final_dir)?;
            return Ok(());
        }

        // chunks of the replaced content
        for name in chunk_names(&dir)? {
            if package.chunks().iter().all(|chunk| chunk.name() != name) {
                log::debug!(target: "storage::local", "Removing outdated chunk {name} of {}", package.id());
                fs::remove_file(dir.join(name))?;
            }
        }
        Ok(())
    }

    fn read_package(&self, dir: &Path, stamp: &str) -> Option<Package> {
        let id = match PackageId::parse(&self.trigger, stamp) {
            Ok(id) => id,
            Err(e) => {
                log::warn!(target: "storage::local", "Ignoring {}: {e}", dir.display());
                return None;
            }
        };

        let names = match chunk_names(dir) {
            Ok(names) => names,
            Err(e) => {
                log::warn!(target: "storage::local", "Reading {} failed: {e}", dir.display());
                return None;
            }
        };

        let package = match Package::from_chunk_names(id, names) {
            Ok(package) => package,
            Err(e) => {
                log::warn!(target: "storage::local", "Ignoring {}: {e}", dir.display());
                return None;
            }
        };

        if !package.is_complete() {
            log::warn!(target: "storage::local", "Package {} on {} is missing chunks", package.id(), self.name);
        }
        Some(package)
    }

    fn list_packages(&self) -> io::Result<Vec<Package>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut packages = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }

            let file_name = entry.file_name();
            let Some(stamp) = file_name.to_str() else {
                continue;
            };
            if stamp.starts_with('.') {
                continue;
            }

            packages.extend(self.read_package(&entry.path(), stamp));
        }

        packages.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(packages)
    }

    fn delete_package(&self, package: &Package) -> io::Result<()> {
        for dir in [
            self.package_dir(package.id()),
            self.partial_dir(package.id()),
        ] {
            match fs::remove_dir_all(&dir) {
                Ok(()) => log::debug!(target: "storage::local", "Removed {}", dir.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Visible files of a package directory.
fn chunk_names(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if !name.starts_with('.') {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}

impl StorageTarget for LocalTarget {
    fn abort(&self, package: &Package) -> Result<(), Failure<StorageError>> {
        let partial = self.partial_dir(package.id());
        log::debug!(target: "storage::local", "Removing {}", partial.display());
        match fs::remove_dir_all(&partial) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(classify(e).map(|source| {
                StorageError::Delete {
                    target: self.name.clone(),
                    id: package.id().clone(),
                    source,
                }
            })),
            _ => Ok(()),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn store(&self, package: &Package) -> Result<(), Failure<StorageError>> {
        log::info!(target: "storage::local", "Storing {} on {}", package.id(), self.name);
        self.store_chunks(package).map_err(|e| {
            classify(e).map(|source| StorageError::Store {
                target: self.name.clone(),
                id: package.id().clone(),
                source,
            })
        })
    }

    fn list(&self) -> Result<Vec<Package>, Failure<StorageError>> {
        self.list_packages().map_err(|e| {
            classify(e).map(|source| StorageError::List {
                target: self.name.clone(),
                source,
            })
        })
    }

    fn delete(&self, package: &Package) -> Result<(), Failure<StorageError>> {
        log::info!(target: "storage::local", "Deleting {} from {}", package.id(), self.name);
        self.delete_package(package).map_err(|e| {
            classify(e).map(|source| StorageError::Delete {
                target: self.name.clone(),
                id: package.id().clone(),
                source,
            })
        })
    }
}
