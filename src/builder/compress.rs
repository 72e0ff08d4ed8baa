//! Gzip compressed packages using [CompressBuilder].

use std::fs::{self, File};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;

use super::{BuildError, Built, PackageBuilder};
use crate::package::{Chunk, Package, PackageId};

const MIB: u64 = 1024 * 1024;

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("rbackup")
}

/// Configuration of the [CompressBuilder].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CompressConfig {
    /// File to back up, e.g. a database dump.
    pub source: PathBuf,

    /// Split the package into chunks of this many MiB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,

    /// Directory the package is assembled in before it is stored.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

impl Default for CompressConfig {
    fn default() -> Self {
        Self {
            source: PathBuf::from("/var/backups/database.sql"),
            chunk_size: None,
            work_dir: default_work_dir(),
        }
    }
}

impl CompressConfig {
    pub fn build(&self) -> CompressBuilder {
        let mut builder = CompressBuilder::new(&self.source, &self.work_dir);
        if let Some(mib) = self.chunk_size.filter(|&mib| mib > 0) {
            builder = builder.split_into_chunks_of(mib * MIB);
        }
        builder
    }
}

/// Compresses a source file with gzip into `<work_dir>/<trigger>/<stamp>/`.
///
/// With a chunk size the compressed stream is split into chunks
/// `<trigger>.gz-aaa`, `<trigger>.gz-aab`, ... while it is written. Output
/// fitting into a single chunk keeps the unsplit name.
#[derive(Debug, Clone)]
pub struct CompressBuilder {
    source: PathBuf,
    work_dir: PathBuf,
    chunk_size: Option<u64>,
}

impl CompressBuilder {
    pub fn new(source: &Path, work_dir: &Path) -> Self {
        if work_dir.is_relative() {
            log::warn!(target: "builder::compress", "work_dir is relative: {}", work_dir.display());
        }

        Self {
            source: source.to_path_buf(),
            work_dir: work_dir.to_path_buf(),
            chunk_size: None,
        }
    }

    /// Splits packages into chunks of at most `bytes` bytes.
    pub fn split_into_chunks_of(mut self, bytes: u64) -> Self {
        self.chunk_size = Some(bytes);
        self
    }

    fn package_dir(&self, id: &PackageId) -> PathBuf {
        self.work_dir.join(id.trigger()).join(id.stamp())
    }

    /// Writes the compressed chunks into `dir`. Returns the bytes read.
    fn compress(
        &self,
        source: File,
        dir: &Path,
        id: &PackageId,
    ) -> Result<(u64, Vec<Chunk>), BuildError> {
        let mut reader = BufReader::new(source);
        let base = format!("{}.gz", id.trigger());

        let writer = ChunkWriter::new(dir, &base, self.chunk_size);
        let mut encoder = GzEncoder::new(writer, Compression::default());
        let read = io::copy(&mut reader, &mut encoder).map_err(|source| BuildError::Source {
            path: self.source.clone(),
            source,
        })?;
        let chunks = encoder.finish()?.finish()?;
        Ok((read, chunks))
    }
}

impl PackageBuilder for CompressBuilder {
    fn build(&self, id: PackageId) -> Result<Built, BuildError> {
        log::info!(target: "builder::compress", "Compressing {} into package {id}", self.source.display());

        let source = File::open(&self.source).map_err(|source| BuildError::Source {
            path: self.source.clone(),
            source,
        })?;

        let dir = self.package_dir(&id);
        fs::create_dir_all(&dir)?;
        let (read, chunks) = match self.compress(source, &dir, &id) {
            Ok(compressed) => compressed,
            Err(e) => {
                if let Err(e) = fs::remove_dir_all(&dir) {
                    log::warn!(target: "builder::compress", "Removing {} failed: {e}", dir.display());
                }
                return Err(e);
            }
        };

        let mut warnings = Vec::new();
        if read == 0 {
            let warning = format!("Backup source {} is empty", self.source.display());
            log::warn!(target: "builder::compress", "{warning}");
            warnings.push(warning);
        }

        log::info!(target: "builder::compress", "Finished package {id} ({} chunk(s))", chunks.len());
        Ok(Built {
            package: Package::new(id, chunks),
            warnings,
        })
    }

    fn cleanup(&self, package: &Package) -> Result<(), BuildError> {
        let dir = self.package_dir(package.id());
        log::debug!(target: "builder::compress", "Removing local package {}", dir.display());
        match fs::remove_dir_all(&dir) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// Writes a byte stream into consecutive chunk files.
struct ChunkWriter {
    dir: PathBuf,
    base: String,
    limit: Option<u64>,
    chunks: Vec<Chunk>,
    current: Option<File>,
    current_len: u64,
}

impl ChunkWriter {
    fn new(dir: &Path, base: &str, limit: Option<u64>) -> Self {
        Self {
            dir: dir.to_path_buf(),
            base: base.to_string(),
            limit,
            chunks: Vec::new(),
            current: None,
            current_len: 0,
        }
    }

    fn open_next(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.current.take() {
            file.flush()?;
        }

        let split = self.limit.is_some();
        let chunk = Chunk::new(&self.base, self.chunks.len(), split)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let path = self.dir.join(chunk.name());
        log::trace!(target: "builder::compress", "Writing chunk {}", path.display());

        let file = File::create(&path)?;
        self.chunks.push(chunk.with_local(path));
        self.current = Some(file);
        self.current_len = 0;
        Ok(())
    }

    /// Closes the last chunk and returns all chunks in order.
    fn finish(mut self) -> io::Result<Vec<Chunk>> {
        if let Some(mut file) = self.current.take() {
            file.flush()?;
        }
        if self.chunks.is_empty() {
            self.open_next()?;
            self.current = None;
        }

        // a single chunk doesn't need a sequence suffix
        if let [chunk] = self.chunks.as_slice() {
            if let Some(path) = chunk.local().filter(|_| self.limit.is_some()) {
                let unsplit = self.dir.join(&self.base);
                fs::rename(path, &unsplit)?;
                let chunk = Chunk::new(&self.base, 0, false)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                return Ok(vec![chunk.with_local(unsplit)]);
            }
        }

        Ok(self.chunks)
    }
}

impl Write for ChunkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let full = self.limit.is_some_and(|limit| self.current_len >= limit);
        if full || self.current.is_none() {
            self.open_next()?;
        }

        let room = match self.limit {
            Some(limit) => {
                let left = limit.saturating_sub(self.current_len);
                buf.len().min(usize::try_from(left).unwrap_or(usize::MAX))
            }
            None => buf.len(),
        };

        let Some(file) = self.current.as_mut() else {
            return Err(io::Error::other("no chunk open for writing"));
        };
        let written = file.write(&buf[..room])?;
        self.current_len += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.current.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}
