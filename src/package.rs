//! The [Package]: the artifact produced by one backup run.
//!
//! A package is identified by its [PackageId] and consists of one or more
//! [Chunk]s. Split packages name their chunks after the unsplit file with a
//! three letter sequence suffix (`db.gz-aaa`, `db.gz-aab`, ...), the same
//! way `split(1)` does.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex, PoisonError};

use chrono::{NaiveDateTime, TimeDelta, Timelike};
use derive_more::{Display, Error};
use regex::Regex;

/// Timestamp format of package ids. Sorts lexicographically in time order.
pub const TIME_FORMAT: &str = "%Y.%m.%d.%H.%M.%S";

const SUFFIX_LEN: u32 = 3;

/// Largest sequence number of ids sharing a second. Keeps stamps at a fixed
/// width so they sort like the ids.
pub const MAX_SEQ: u32 = 999;

/// Largest number of chunks a single package can be split into.
pub const MAX_CHUNKS: usize = 26usize.pow(SUFFIX_LEN);

static CHUNK_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?<base>.+?)(?:-(?<suffix>[a-z]{3}))?$").expect("chunk name regex is valid")
});

#[derive(Debug, Display, Error, PartialEq, Eq)]
pub enum PackageError {
    /// The name doesn't look like a package id.
    #[display("Invalid package id: {_0}")]
    InvalidId(#[error(ignore)] String),
    /// The name doesn't look like a chunk of a package.
    #[display("Invalid chunk name: {_0}")]
    InvalidChunkName(#[error(ignore)] String),
    /// A package can't be split into that many chunks.
    #[display("Too many chunks: {_0} (at most {})", MAX_CHUNKS)]
    TooManyChunks(#[error(ignore)] usize),
    /// The requested lifecycle transition isn't allowed.
    #[display("Package {id} can't change from {from} to {to}")]
    InvalidTransition {
        id: PackageId,
        from: PackageStatus,
        to: PackageStatus,
    },
}

/// Identity of a package.
///
/// Ids order chronologically; ids created within the same second are
/// disambiguated by an increasing sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackageId {
    time: NaiveDateTime,
    seq: u32,
    trigger: String,
}

impl PackageId {
    /// Creates an id for `trigger` at `time`, truncated to whole seconds.
    pub fn new(trigger: impl Into<String>, time: NaiveDateTime) -> Self {
        Self {
            time: time.with_nanosecond(0).unwrap_or(time),
            seq: 0,
            trigger: trigger.into(),
        }
    }

    /// Parses the [stamp](Self::stamp) of a package stored for `trigger`.
    pub fn parse(trigger: &str, stamp: &str) -> Result<Self, PackageError> {
        let invalid = || PackageError::InvalidId(stamp.to_string());

        let (time, seq) = match stamp.split_once('-') {
            Some((time, seq)) => {
                // only the exact form `stamp` renders, e.g. `-007`
                if seq.len() != 3 || !seq.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(invalid());
                }
                let seq = seq
                    .parse()
                    .ok()
                    .filter(|&seq| seq > 0)
                    .ok_or_else(invalid)?;
                (time, seq)
            }
            None => (stamp, 0),
        };
        let time = NaiveDateTime::parse_from_str(time, TIME_FORMAT).map_err(|_| invalid())?;

        Ok(Self {
            time,
            seq,
            trigger: trigger.to_string(),
        })
    }

    pub fn trigger(&self) -> &str {
        &self.trigger
    }

    pub fn time(&self) -> NaiveDateTime {
        self.time
    }

    /// Name of the package inside the trigger's namespace.
    pub fn stamp(&self) -> String {
        let time = self.time.format(TIME_FORMAT);
        if self.seq == 0 {
            time.to_string()
        } else {
            format!("{time}-{:03}", self.seq)
        }
    }

    /// Smallest id of the same trigger sorting after this one.
    fn successor(&self) -> Self {
        if self.seq < MAX_SEQ {
            return Self {
                time: self.time,
                seq: self.seq + 1,
                trigger: self.trigger.clone(),
            };
        }

        Self {
            time: self.time + TimeDelta::seconds(1),
            seq: 0,
            trigger: self.trigger.clone(),
        }
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.trigger, self.stamp())
    }
}

/// Hands out strictly increasing [PackageId]s.
#[derive(Debug, Default)]
pub struct IdGenerator {
    last: Mutex<Option<PackageId>>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id for `trigger` at `now`.
    ///
    /// If `now` isn't later than the last id handed out for the same
    /// trigger, the last id's sequence number is incremented instead.
    pub fn next(&self, trigger: &str, now: NaiveDateTime) -> PackageId {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let candidate = PackageId::new(trigger, now);

        let id = match last.as_ref() {
            Some(prev) if prev.trigger == candidate.trigger && prev.time >= candidate.time => {
                log::debug!(target: "package", "Package id collision with {prev}, adding sequence number");
                prev.successor()
            }
            _ => candidate,
        };

        *last = Some(id.clone());
        id
    }

    /// Makes every id handed out afterwards sort after `id`.
    ///
    /// Used with the ids found on storage targets, so runs of separate
    /// processes don't collide with or sort before stored packages.
    pub fn observe(&self, id: &PackageId) {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        match last.as_ref() {
            Some(prev) if prev.trigger == id.trigger && *prev >= *id => {}
            _ => *last = Some(id.clone()),
        }
    }
}

/// Lifecycle of a [Package].
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageStatus {
    #[display("pending")]
    Pending,
    #[display("stored")]
    Stored,
    #[display("failed")]
    Failed,
    #[display("cycled-out")]
    CycledOut,
}

impl PackageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::CycledOut)
    }

    fn can_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Stored)
                | (Self::Pending, Self::Failed)
                | (Self::Stored, Self::CycledOut)
        )
    }
}

/// One file of a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    index: usize,
    name: String,
    local: Option<PathBuf>,
}

impl Chunk {
    /// Chunk `index` of the file `base`. `split` selects the suffixed name.
    pub fn new(base: &str, index: usize, split: bool) -> Result<Self, PackageError> {
        let name = if split {
            format!("{base}-{}", suffix(index)?)
        } else {
            base.to_string()
        };

        Ok(Self {
            index,
            name,
            local: None,
        })
    }

    /// Parses the name of a stored chunk.
    pub fn parse(name: &str) -> Result<Self, PackageError> {
        let captures = CHUNK_NAME
            .captures(name)
            .ok_or_else(|| PackageError::InvalidChunkName(name.to_string()))?;
        let index = captures
            .name("suffix")
            .map(|suffix| suffix_index(suffix.as_str()))
            .unwrap_or(0);

        Ok(Self {
            index,
            name: name.to_string(),
            local: None,
        })
    }

    /// Attaches the local file holding the chunk's content.
    pub fn with_local(mut self, path: impl Into<PathBuf>) -> Self {
        self.local = Some(path.into());
        self
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Local file of a freshly built chunk. [None] for listed chunks.
    pub fn local(&self) -> Option<&Path> {
        self.local.as_deref()
    }
}

fn suffix(index: usize) -> Result<String, PackageError> {
    if index >= MAX_CHUNKS {
        return Err(PackageError::TooManyChunks(index + 1));
    }

    let mut rest = index;
    let mut letters = [b'a'; SUFFIX_LEN as usize];
    for letter in letters.iter_mut().rev() {
        *letter = b'a' + (rest % 26) as u8;
        rest /= 26;
    }

    Ok(letters.iter().map(|&b| char::from(b)).collect())
}

fn suffix_index(suffix: &str) -> usize {
    suffix
        .bytes()
        .fold(0, |acc, b| acc * 26 + usize::from(b - b'a'))
}

/// Artifact of one backup run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    id: PackageId,
    chunks: Vec<Chunk>,
    status: PackageStatus,
}

impl Package {
    /// A freshly built, not yet stored package.
    pub fn new(id: PackageId, chunks: Vec<Chunk>) -> Self {
        Self::with_status(id, chunks, PackageStatus::Pending)
    }

    /// A package found on a storage target.
    pub fn stored(id: PackageId, chunks: Vec<Chunk>) -> Self {
        Self::with_status(id, chunks, PackageStatus::Stored)
    }

    /// Reconstructs a stored package from the names of its chunks.
    pub fn from_chunk_names<I, S>(id: PackageId, names: I) -> Result<Self, PackageError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let chunks = names
            .into_iter()
            .map(|name| Chunk::parse(name.as_ref()))
            .collect::<Result<_, _>>()?;
        Ok(Self::stored(id, chunks))
    }

    fn with_status(id: PackageId, mut chunks: Vec<Chunk>, status: PackageStatus) -> Self {
        chunks.sort_by_key(Chunk::index);
        Self { id, chunks, status }
    }

    pub fn id(&self) -> &PackageId {
        &self.id
    }

    /// Chunks in sequence order.
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn status(&self) -> PackageStatus {
        self.status
    }

    /// Whether the chunk indices form the gapless sequence `0..n`.
    pub fn is_complete(&self) -> bool {
        !self.chunks.is_empty()
            && self
                .chunks
                .iter()
                .enumerate()
                .all(|(i, chunk)| chunk.index == i)
    }

    /// Moves the package along its lifecycle.
    pub fn set_status(&mut self, next: PackageStatus) -> Result<(), PackageError> {
        if !self.status.can_become(next) {
            return Err(PackageError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }

        log::trace!(target: "package", "Package {}: {} -> {next}", self.id, self.status);
        self.status = next;
        Ok(())
    }
}
