//! In-memory [StorageTarget].

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{StorageError, StorageOp, StorageTarget};
use crate::package::{Package, PackageId};
use crate::util::retry::Failure;

/// Keeps packages in memory.
///
/// Clones share the same contents, so a handle kept aside can inspect a
/// target after it was handed to a job. Failures can be injected per
/// operation with [fail](Self::fail).
#[derive(Debug, Clone)]
pub struct MemoryTarget {
    name: String,
    state: Arc<Mutex<State>>,
}

#[derive(Debug, Default)]
struct State {
    packages: BTreeMap<PackageId, Vec<String>>,
    injected: HashMap<StorageOp, Injected>,
    calls: HashMap<StorageOp, usize>,
}

#[derive(Debug, Clone, Copy)]
struct Injected {
    transient: bool,
    remaining: Option<usize>,
}

impl MemoryTarget {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Default::default(),
        }
    }

    /// Lets the next `times` calls of `op` fail, or every call if [None].
    pub fn fail(&self, op: StorageOp, transient: bool, times: Option<usize>) {
        self.lock().injected.insert(
            op,
            Injected {
                transient,
                remaining: times,
            },
        );
    }

    /// Number of times `op` was invoked, including failed invocations.
    pub fn calls(&self, op: StorageOp) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or_default()
    }

    /// Ids of the stored packages in ascending order.
    pub fn ids(&self) -> Vec<PackageId> {
        self.lock().packages.keys().cloned().collect()
    }

    /// Puts a package in place without going through [store](StorageTarget::store).
    pub fn insert(&self, package: &Package) {
        self.lock()
            .packages
            .insert(package.id().clone(), chunk_names(package));
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Counts the call and fails it if a failure was injected.
    fn enter(&self, state: &mut State, op: StorageOp) -> Result<(), Failure<io::Error>> {
        *state.calls.entry(op).or_default() += 1;

        let Some(injected) = state.injected.get_mut(&op) else {
            return Ok(());
        };
        match &mut injected.remaining {
            Some(0) => return Ok(()),
            Some(remaining) => *remaining -= 1,
            None => {}
        }

        log::trace!(target: "storage::memory", "Injecting {op} failure into {}", self.name);
        let err = io::Error::other(format!("injected {op} failure"));
        if injected.transient {
            Err(Failure::Transient(err))
        } else {
            Err(Failure::Fatal(err))
        }
    }
}

fn chunk_names(package: &Package) -> Vec<String> {
    package
        .chunks()
        .iter()
        .map(|chunk| chunk.name().to_string())
        .collect()
}

impl StorageTarget for MemoryTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn store(&self, package: &Package) -> Result<(), Failure<StorageError>> {
        let mut state = self.lock();
        self.enter(&mut state, StorageOp::Store).map_err(|f| {
            f.map(|source| StorageError::Store {
                target: self.name.clone(),
                id: package.id().clone(),
                source,
            })
        })?;

        state
            .packages
            .insert(package.id().clone(), chunk_names(package));
        Ok(())
    }

    fn list(&self) -> Result<Vec<Package>, Failure<StorageError>> {
        let mut state = self.lock();
        self.enter(&mut state, StorageOp::List).map_err(|f| {
            f.map(|source| StorageError::List {
                target: self.name.clone(),
                source,
            })
        })?;

        state
            .packages
            .iter()
            .map(|(id, names)| Package::from_chunk_names(id.clone(), names))
            .collect::<Result<_, _>>()
            .map_err(|e| {
                Failure::Fatal(StorageError::List {
                    target: self.name.clone(),
                    source: io::Error::new(io::ErrorKind::InvalidData, e),
                })
            })
    }

    fn delete(&self, package: &Package) -> Result<(), Failure<StorageError>> {
        let mut state = self.lock();
        self.enter(&mut state, StorageOp::Delete).map_err(|f| {
            f.map(|source| StorageError::Delete {
                target: self.name.clone(),
                id: package.id().clone(),
                source,
            })
        })?;

        state.packages.remove(package.id());
        Ok(())
    }

    fn abort(&self, package: &Package) -> Result<(), Failure<StorageError>> {
        let mut state = self.lock();
        self.enter(&mut state, StorageOp::Abort).map_err(|f| {
            f.map(|source| StorageError::Delete {
                target: self.name.clone(),
                id: package.id().clone(),
                source,
            })
        })
    }
}
