//! Archive engine: streaming tar compression, extraction and listing.
//!
//! All work runs on the blocking pool with the synchronous `tar` crate.
//! Reads and writes move in bounded chunks; after every chunk the engine
//! reports `(processed, total)` and passes a cancellation checkpoint.
//! Archives are written to a temp file next to the destination and renamed
//! into place only after the encoder has been finished, so a cancelled or
//! failed run never leaves a truncated archive at the final path.

mod codec;
mod filter;

pub use codec::{Compression, SNIFF_LEN};
pub use filter::{DEFAULT_EXCLUDES, ExcludeFilter};

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Component as PathComponent, Path, PathBuf};
use std::time::{Duration, Instant};

use bytes::Bytes;
use sha2::{Digest, Sha256};
use stowage_schema::{FileRecord, Sha256Digest};
use thiserror::Error;
use walkdir::WalkDir;

use crate::cancel::{CancelToken, Cancelled};
use crate::checksum::CHUNK_SIZE;
use crate::reporter::ProgressFn;
use codec::{Encoder, decoder};

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("No sources given to archive")]
    EmptySource,

    #[error("Source not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error(
        "{algorithm} compression is not available in this build (enable the `{feature}` feature); available: {available}"
    )]
    Unavailable {
        algorithm: &'static str,
        feature: &'static str,
        available: String,
    },

    #[error("Invalid compression level {level} for {algorithm} (expected {min}..={max})")]
    InvalidLevel {
        algorithm: &'static str,
        level: u32,
        min: u32,
        max: u32,
    },

    #[error("Unknown compression algorithm '{0}'")]
    UnknownAlgorithm(String),

    #[error("Invalid exclude pattern '{pattern}': {message}")]
    Pattern { pattern: String, message: String },

    #[error("Unsafe path in archive: {0}")]
    UnsafePath(String),

    #[error("Operation cancelled by user")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Archive task failed: {0}")]
    Task(String),
}

impl From<Cancelled> for ArchiveError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

impl ArchiveError {
    /// Unwrap I/O errors that carry a [`Cancelled`] raised inside a reader.
    fn from_io(err: io::Error, cancel: &CancelToken) -> Self {
        if cancel.is_cancelled() || err.get_ref().is_some_and(|e| e.is::<Cancelled>()) {
            Self::Cancelled
        } else {
            Self::Io(err)
        }
    }
}

/// Where a compressed archive goes.
#[derive(Debug, Clone)]
pub enum Destination {
    File(PathBuf),
    Memory,
}

/// Where an archive is read from.
#[derive(Debug, Clone)]
pub enum Source {
    File(PathBuf),
    Memory(Bytes),
}

/// One entry as reported by [`Archiver::list_contents`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
}

/// Outcome of a compression run.
#[derive(Debug, Clone)]
pub struct ArchiveStats {
    pub compression: Compression,
    pub files: u64,
    pub dirs: u64,
    /// Uncompressed payload bytes.
    pub bytes_in: u64,
    /// Archive bytes written.
    pub bytes_out: u64,
    pub elapsed: Duration,
    /// Regular files in archive order, with digests.
    pub entries: Vec<FileRecord>,
}

impl ArchiveStats {
    /// `bytes_out / bytes_in`, or 1.0 for an empty payload.
    pub fn ratio(&self) -> f64 {
        if self.bytes_in == 0 {
            1.0
        } else {
            self.bytes_out as f64 / self.bytes_in as f64
        }
    }
}

/// Result of [`Archiver::compress`]; `bytes` is set for [`Destination::Memory`].
#[derive(Debug, Clone)]
pub struct ArchiveOutput {
    pub stats: ArchiveStats,
    pub path: Option<PathBuf>,
    pub bytes: Option<Bytes>,
}

/// Outcome of an extraction.
#[derive(Debug, Clone, Default)]
pub struct ExtractStats {
    pub compression: Option<Compression>,
    pub files: u64,
    pub dirs: u64,
    pub bytes: u64,
    /// Regular files written, relative to the output directory.
    pub entries: Vec<FileRecord>,
}

#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    pub compression: Compression,
    /// `None` uses the codec default.
    pub level: Option<u32>,
    /// Archive symlink targets by content (default) instead of as links.
    pub follow_symlinks: bool,
    pub chunk_size: usize,
    pub exclude: ExcludeFilter,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            compression: Compression::Gzip,
            level: None,
            follow_symlinks: true,
            chunk_size: CHUNK_SIZE,
            exclude: ExcludeFilter::none(),
        }
    }
}

impl ArchiveOptions {
    pub fn new(compression: Compression) -> Self {
        Self {
            compression,
            ..Self::default()
        }
    }

    pub fn level(mut self, level: u32) -> Self {
        self.level = Some(level);
        self
    }

    pub fn exclude(mut self, exclude: ExcludeFilter) -> Self {
        self.exclude = exclude;
        self
    }

    pub fn preserve_symlinks(mut self) -> Self {
        self.follow_symlinks = false;
        self
    }
}

/// Entry point of the archive engine.
#[derive(Clone)]
pub struct Archiver {
    options: ArchiveOptions,
    cancel: CancelToken,
    progress: Option<ProgressFn>,
}

impl std::fmt::Debug for Archiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archiver")
            .field("options", &self.options)
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}

impl Default for Archiver {
    fn default() -> Self {
        Self::new(ArchiveOptions::default())
    }
}

impl Archiver {
    pub fn new(options: ArchiveOptions) -> Self {
        Self {
            options,
            cancel: CancelToken::new(),
            progress: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn options(&self) -> &ArchiveOptions {
        &self.options
    }

    /// Pack `sources` into a tar stream compressed per the options.
    ///
    /// A single directory source contributes its contents at the archive
    /// root; otherwise every source keeps its own name as a prefix.
    pub async fn compress(
        &self,
        sources: &[PathBuf],
        dest: Destination,
    ) -> Result<ArchiveOutput, ArchiveError> {
        let compression = self.options.compression;
        compression.ensure_available()?;
        let level = compression.resolve_level(self.options.level)?;

        let sources = sources.to_vec();
        let options = self.options.clone();
        let meter = Meter::new(self.cancel.clone(), self.progress.clone(), options.chunk_size);

        tracing::debug!(%compression, level, sources = sources.len(), "compressing");
        let out = tokio::task::spawn_blocking(move || {
            compress_blocking(&sources, &dest, &options, level, meter)
        })
        .await
        .map_err(|e| ArchiveError::Task(e.to_string()))??;

        tracing::info!(
            files = out.stats.files,
            bytes_in = out.stats.bytes_in,
            bytes_out = out.stats.bytes_out,
            "archive written"
        );
        Ok(out)
    }

    /// Extract `source` into `out_dir`.
    ///
    /// With `compression == None` the codec is detected from the file
    /// extension, then from the first [`SNIFF_LEN`] bytes.
    pub async fn decompress(
        &self,
        source: Source,
        out_dir: &Path,
        compression: Option<Compression>,
    ) -> Result<ExtractStats, ArchiveError> {
        let out_dir = out_dir.to_path_buf();
        let meter = Meter::new(
            self.cancel.clone(),
            self.progress.clone(),
            self.options.chunk_size,
        );
        tokio::task::spawn_blocking(move || extract_blocking(&source, &out_dir, compression, meter))
            .await
            .map_err(|e| ArchiveError::Task(e.to_string()))?
    }

    /// Enumerate entries without extracting.
    pub async fn list_contents(
        &self,
        source: Source,
        compression: Option<Compression>,
    ) -> Result<Vec<ArchiveEntry>, ArchiveError> {
        let cancel = self.cancel.clone();
        tokio::task::spawn_blocking(move || list_blocking(&source, compression, &cancel))
            .await
            .map_err(|e| ArchiveError::Task(e.to_string()))?
    }
}

/// Byte counter shared by every reader of one run.
struct Meter {
    cancel: CancelToken,
    progress: Option<ProgressFn>,
    chunk: u64,
    total: u64,
    processed: u64,
    since_checkpoint: u64,
}

impl Meter {
    fn new(cancel: CancelToken, progress: Option<ProgressFn>, chunk: usize) -> Self {
        Self {
            cancel,
            progress,
            chunk: chunk.max(1) as u64,
            total: 0,
            processed: 0,
            since_checkpoint: 0,
        }
    }

    fn advance(&mut self, n: usize) -> io::Result<()> {
        self.processed += n as u64;
        self.since_checkpoint += n as u64;
        if self.since_checkpoint >= self.chunk {
            self.since_checkpoint = 0;
            self.report();
            self.checkpoint()?;
        }
        Ok(())
    }

    fn report(&self) {
        if let Some(progress) = &self.progress {
            progress(self.processed, self.total.max(self.processed));
        }
    }

    fn checkpoint(&self) -> io::Result<()> {
        self.cancel.checkpoint().map_err(io::Error::other)
    }
}

/// Counts bytes (and optionally hashes them) as they are read.
struct MeteredReader<'a, R> {
    inner: R,
    meter: &'a mut Meter,
    hasher: Option<&'a mut Sha256>,
}

impl<R: Read> Read for MeteredReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if let Some(h) = self.hasher.as_deref_mut() {
            h.update(&buf[..n]);
        }
        self.meter.advance(n)?;
        Ok(n)
    }
}

enum Kind {
    File,
    Dir,
    Symlink(PathBuf),
}

struct Planned {
    src: PathBuf,
    name: String,
    kind: Kind,
    size: u64,
}

fn join_name(prefix: &str, rel: &Path) -> String {
    let mut parts: Vec<String> = Vec::new();
    if !prefix.is_empty() {
        parts.push(prefix.to_string());
    }
    parts.extend(
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned()),
    );
    parts.join("/")
}

fn plan(sources: &[PathBuf], options: &ArchiveOptions) -> Result<Vec<Planned>, ArchiveError> {
    if sources.is_empty() {
        return Err(ArchiveError::EmptySource);
    }

    let single_dir = sources.len() == 1 && sources[0].is_dir();
    let mut planned = Vec::new();

    for src in sources {
        let meta = std::fs::metadata(src).map_err(|_| ArchiveError::SourceNotFound(src.clone()))?;
        let base = src
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if meta.is_file() {
            planned.push(Planned {
                src: src.clone(),
                name: base,
                kind: Kind::File,
                size: meta.len(),
            });
            continue;
        }

        let prefix = if single_dir { String::new() } else { base };
        if !prefix.is_empty() {
            planned.push(Planned {
                src: src.clone(),
                name: prefix.clone(),
                kind: Kind::Dir,
                size: 0,
            });
        }

        let walker = WalkDir::new(src)
            .follow_links(options.follow_symlinks)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                let rel = e.path().strip_prefix(src).unwrap_or(e.path());
                !options.exclude.is_excluded(rel, e.file_type().is_dir())
            });

        for entry in walker {
            let entry = entry.map_err(|e| ArchiveError::Io(e.into()))?;
            let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
            let name = join_name(&prefix, rel);
            let ft = entry.file_type();

            let (kind, size) = if ft.is_dir() {
                (Kind::Dir, 0)
            } else if ft.is_symlink() {
                (Kind::Symlink(std::fs::read_link(entry.path())?), 0)
            } else {
                (Kind::File, entry.metadata().map_err(|e| ArchiveError::Io(e.into()))?.len())
            };
            planned.push(Planned {
                src: entry.path().to_path_buf(),
                name,
                kind,
                size,
            });
        }
    }

    Ok(planned)
}

fn header_for(src: &Path, entry_type: tar::EntryType, size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_size(size);
    let meta = if entry_type.is_symlink() {
        std::fs::symlink_metadata(src).ok()
    } else {
        std::fs::metadata(src).ok()
    };
    let mtime = meta
        .as_ref()
        .and_then(|m| m.modified().ok())
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs());
    header.set_mtime(mtime);
    header.set_mode(mode_of(meta.as_ref(), entry_type));
    header
}

#[cfg(unix)]
fn mode_of(meta: Option<&std::fs::Metadata>, _entry_type: tar::EntryType) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.map_or(0o644, |m| m.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn mode_of(_meta: Option<&std::fs::Metadata>, entry_type: tar::EntryType) -> u32 {
    if entry_type.is_dir() { 0o755 } else { 0o644 }
}

fn write_archive<W: Write>(
    sink: W,
    planned: &[Planned],
    compression: Compression,
    level: u32,
    meter: &mut Meter,
) -> Result<(W, Vec<FileRecord>), ArchiveError> {
    let encoder = Encoder::new(sink, compression, level)?;
    let mut builder = tar::Builder::new(encoder);
    let mut records = Vec::new();
    let cancel = meter.cancel.clone();

    for item in planned {
        meter.checkpoint().map_err(|e| ArchiveError::from_io(e, &cancel))?;
        match &item.kind {
            Kind::Dir => {
                let mut header = header_for(&item.src, tar::EntryType::Directory, 0);
                builder
                    .append_data(&mut header, format!("{}/", item.name), io::empty())
                    .map_err(|e| ArchiveError::from_io(e, &cancel))?;
            }
            Kind::Symlink(target) => {
                let mut header = header_for(&item.src, tar::EntryType::Symlink, 0);
                builder
                    .append_link(&mut header, &item.name, target)
                    .map_err(|e| ArchiveError::from_io(e, &cancel))?;
            }
            Kind::File => {
                let file = File::open(&item.src)?;
                let mut header = header_for(&item.src, tar::EntryType::Regular, item.size);
                let mut hasher = Sha256::new();
                let reader = MeteredReader {
                    inner: file.take(item.size),
                    meter: &mut *meter,
                    hasher: Some(&mut hasher),
                };
                builder
                    .append_data(&mut header, &item.name, reader)
                    .map_err(|e| ArchiveError::from_io(e, &cancel))?;
                let digest: [u8; 32] = hasher.finalize().into();
                records.push(FileRecord {
                    path: item.name.clone(),
                    size: item.size,
                    sha256: Some(Sha256Digest::from_bytes(&digest)),
                });
                meter.report();
            }
        }
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| ArchiveError::from_io(e, &cancel))?;
    let sink = encoder.finish()?;
    Ok((sink, records))
}

fn compress_blocking(
    sources: &[PathBuf],
    dest: &Destination,
    options: &ArchiveOptions,
    level: u32,
    mut meter: Meter,
) -> Result<ArchiveOutput, ArchiveError> {
    let start = Instant::now();
    let planned = plan(sources, options)?;
    meter.total = planned.iter().map(|p| p.size).sum();
    meter.report();

    let files = planned.iter().filter(|p| matches!(p.kind, Kind::File)).count() as u64;
    let dirs = planned.iter().filter(|p| matches!(p.kind, Kind::Dir)).count() as u64;
    let bytes_in = meter.total;
    let compression = options.compression;

    let (bytes_out, entries, path, bytes) = match dest {
        Destination::File(path) => {
            let parent = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(parent)?;
            let tmp = tempfile::Builder::new()
                .prefix(".stowage-")
                .suffix(".partial")
                .tempfile_in(parent)?;
            let writer = io::BufWriter::with_capacity(options.chunk_size, tmp);
            let (writer, entries) =
                write_archive(writer, &planned, compression, level, &mut meter)?;
            let tmp = writer.into_inner().map_err(|e| e.into_error())?;
            tmp.as_file().sync_all()?;
            let size = tmp.as_file().metadata()?.len();
            // Dropping `tmp` on any earlier error removes the partial file.
            tmp.persist(path).map_err(|e| e.error)?;
            (size, entries, Some(path.clone()), None)
        }
        Destination::Memory => {
            let (buf, entries) =
                write_archive(Vec::new(), &planned, compression, level, &mut meter)?;
            (buf.len() as u64, entries, None, Some(Bytes::from(buf)))
        }
    };

    Ok(ArchiveOutput {
        stats: ArchiveStats {
            compression,
            files,
            dirs,
            bytes_in,
            bytes_out,
            elapsed: start.elapsed(),
            entries,
        },
        path,
        bytes,
    })
}

fn open_source(
    source: &Source,
    compression: Option<Compression>,
) -> Result<(Box<dyn Read + Send>, u64, Compression), ArchiveError> {
    match source {
        Source::File(path) => {
            let mut file = File::open(path)?;
            let total = file.metadata()?.len();
            let compression = match compression.or_else(|| Compression::from_path(path)) {
                Some(c) => c,
                None => {
                    let mut head = [0u8; SNIFF_LEN];
                    let n = read_head(&mut file, &mut head)?;
                    drop(file);
                    file = File::open(path)?;
                    Compression::from_magic(&head[..n])
                }
            };
            Ok((Box::new(io::BufReader::with_capacity(CHUNK_SIZE, file)), total, compression))
        }
        Source::Memory(bytes) => {
            let compression =
                compression.unwrap_or_else(|| Compression::from_magic(&bytes[..bytes.len().min(SNIFF_LEN)]));
            Ok((Box::new(io::Cursor::new(bytes.clone())), bytes.len() as u64, compression))
        }
    }
}

fn read_head(file: &mut File, head: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < head.len() {
        let n = file.read(&mut head[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Resolve an archive member path under `root`, rejecting absolute paths
/// and parent-directory traversal.
fn safe_join(root: &Path, member: &Path) -> Result<PathBuf, ArchiveError> {
    let mut out = root.to_path_buf();
    for part in member.components() {
        match part {
            PathComponent::Normal(p) => out.push(p),
            PathComponent::CurDir => {}
            PathComponent::ParentDir | PathComponent::RootDir | PathComponent::Prefix(_) => {
                return Err(ArchiveError::UnsafePath(member.display().to_string()));
            }
        }
    }
    Ok(out)
}

fn extract_blocking(
    source: &Source,
    out_dir: &Path,
    compression: Option<Compression>,
    mut meter: Meter,
) -> Result<ExtractStats, ArchiveError> {
    let (raw, total, compression) = open_source(source, compression)?;
    compression.ensure_available()?;
    meter.total = total;
    let cancel = meter.cancel.clone();
    let chunk = meter.chunk as usize;

    std::fs::create_dir_all(out_dir)?;
    tracing::debug!(%compression, out = %out_dir.display(), "extracting");

    let counted = MeteredReader {
        inner: raw,
        meter: &mut meter,
        hasher: None,
    };
    let mut archive = tar::Archive::new(decoder(counted, compression)?);
    let mut stats = ExtractStats {
        compression: Some(compression),
        ..ExtractStats::default()
    };
    let mut buf = vec![0u8; chunk];

    for entry in archive
        .entries()
        .map_err(|e| ArchiveError::from_io(e, &cancel))?
    {
        let mut entry = entry.map_err(|e| ArchiveError::from_io(e, &cancel))?;
        let member = entry.path()?.into_owned();
        let dest = safe_join(out_dir, &member)?;
        if dest == out_dir {
            continue;
        }
        let entry_type = entry.header().entry_type();

        if entry_type.is_dir() {
            std::fs::create_dir_all(&dest)?;
            stats.dirs += 1;
        } else if entry_type.is_file() {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&dest)?;
            let mut hasher = Sha256::new();
            let mut written = 0u64;
            loop {
                let n = entry
                    .read(&mut buf)
                    .map_err(|e| ArchiveError::from_io(e, &cancel))?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n])?;
                hasher.update(&buf[..n]);
                written += n as u64;
            }
            out.flush()?;
            if let Err(e) = set_mode(&dest, entry.header().mode().ok()) {
                tracing::warn!(path = %dest.display(), "could not restore permissions: {e}");
            }
            let digest: [u8; 32] = hasher.finalize().into();
            stats.entries.push(FileRecord {
                path: member
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/"),
                size: written,
                sha256: Some(Sha256Digest::from_bytes(&digest)),
            });
            stats.files += 1;
            stats.bytes += written;
        } else if entry_type.is_symlink() {
            let Some(target) = entry.link_name()? else {
                continue;
            };
            // Link targets must stay inside the extraction root.
            let resolved = dest
                .parent()
                .map(|p| p.join(&target))
                .unwrap_or_else(|| target.to_path_buf());
            if target.is_absolute() || !normalize(&resolved).starts_with(normalize(out_dir)) {
                return Err(ArchiveError::UnsafePath(format!(
                    "{} -> {}",
                    member.display(),
                    target.display()
                )));
            }
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            make_symlink(&target, &dest)?;
        } else {
            tracing::debug!(member = %member.display(), ?entry_type, "skipping unsupported entry");
        }
    }

    drop(archive);
    meter.processed = meter.total;
    meter.report();
    Ok(stats)
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for part in path.components() {
        match part {
            PathComponent::ParentDir => {
                out.pop();
            }
            PathComponent::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: Option<u32>) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    match mode {
        Some(mode) => std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777)),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: Option<u32>) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn make_symlink(_target: &Path, link: &Path) -> io::Result<()> {
    Err(io::Error::other(format!(
        "cannot create symlink {} on this platform",
        link.display()
    )))
}

fn list_blocking(
    source: &Source,
    compression: Option<Compression>,
    cancel: &CancelToken,
) -> Result<Vec<ArchiveEntry>, ArchiveError> {
    let (raw, _, compression) = open_source(source, compression)?;
    let mut archive = tar::Archive::new(decoder(raw, compression)?);
    let mut out = Vec::new();
    for entry in archive.entries()? {
        cancel.checkpoint()?;
        let entry = entry?;
        let name = entry
            .path()?
            .to_string_lossy()
            .trim_end_matches('/')
            .to_string();
        out.push(ArchiveEntry {
            name,
            size: entry.header().size()?,
            is_dir: entry.header().entry_type().is_dir(),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn sample_tree(root: &Path) -> PathBuf {
        let src = root.join("src");
        std::fs::create_dir_all(src.join("nested/deeper")).unwrap();
        std::fs::create_dir_all(src.join("empty")).unwrap();
        std::fs::write(src.join("a.txt"), b"alpha").unwrap();
        std::fs::write(src.join("zero.bin"), b"").unwrap();
        std::fs::write(src.join("nested/b.txt"), vec![7u8; 300_000]).unwrap();
        std::fs::write(src.join("nested/deeper/c.txt"), b"gamma").unwrap();
        src
    }

    fn read_tree(root: &Path) -> Vec<(String, Vec<u8>)> {
        let mut files: Vec<_> = WalkDir::new(root)
            .min_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                let rel = e.path().strip_prefix(root).unwrap();
                (join_name("", rel), std::fs::read(e.path()).unwrap())
            })
            .collect();
        files.sort();
        files
    }

    #[tokio::test]
    async fn test_round_trip_all_available_codecs() {
        let dir = tempfile::tempdir().unwrap();
        let src = sample_tree(dir.path());

        for compression in Compression::available() {
            let out = dir
                .path()
                .join(format!("out{}", compression.archive_suffix()));
            let archiver = Archiver::new(ArchiveOptions::new(compression));
            let written = archiver
                .compress(&[src.clone()], Destination::File(out.clone()))
                .await
                .unwrap();
            assert_eq!(written.stats.files, 4, "{compression}");
            assert_eq!(written.stats.bytes_in, 300_010);

            let extract_dir = dir.path().join(format!("x-{compression}"));
            let stats = archiver
                .decompress(Source::File(out), &extract_dir, None)
                .await
                .unwrap();
            assert_eq!(stats.compression, Some(compression));
            assert_eq!(read_tree(&extract_dir), read_tree(&src), "{compression}");
            assert!(extract_dir.join("empty").is_dir());
        }
    }

    #[tokio::test]
    async fn test_memory_destination_and_magic_detection() {
        let dir = tempfile::tempdir().unwrap();
        let src = sample_tree(dir.path());
        let archiver = Archiver::new(ArchiveOptions::new(Compression::Zstd));

        let out = archiver.compress(&[src], Destination::Memory).await.unwrap();
        let bytes = out.bytes.unwrap();
        assert_eq!(out.stats.bytes_out, bytes.len() as u64);

        let entries = archiver
            .list_contents(Source::Memory(bytes.clone()), None)
            .await
            .unwrap();
        let zero = entries.iter().find(|e| e.name == "zero.bin").unwrap();
        assert_eq!(zero.size, 0);
        assert!(entries.iter().any(|e| e.name == "nested" && e.is_dir));

        let extract_dir = dir.path().join("x");
        let stats = archiver
            .decompress(Source::Memory(bytes), &extract_dir, None)
            .await
            .unwrap();
        assert_eq!(stats.compression, Some(Compression::Zstd));
        assert_eq!(stats.files, 4);
    }

    #[tokio::test]
    async fn test_unknown_extension_falls_back_to_magic() {
        let dir = tempfile::tempdir().unwrap();
        let src = sample_tree(dir.path());
        let out = dir.path().join("blob.bin");
        Archiver::new(ArchiveOptions::new(Compression::Gzip))
            .compress(&[src], Destination::File(out.clone()))
            .await
            .unwrap();

        let entries = Archiver::default()
            .list_contents(Source::File(out), None)
            .await
            .unwrap();
        assert!(entries.iter().any(|e| e.name == "a.txt"));
    }

    #[tokio::test]
    async fn test_multiple_sources_keep_names() {
        let dir = tempfile::tempdir().unwrap();
        let src = sample_tree(dir.path());
        let extra = dir.path().join("README");
        std::fs::write(&extra, b"readme").unwrap();

        let out = Archiver::default()
            .compress(&[src, extra], Destination::Memory)
            .await
            .unwrap();
        let names: Vec<_> = out.stats.entries.iter().map(|e| e.path.as_str()).collect();
        assert!(names.contains(&"src/a.txt"));
        assert!(names.contains(&"README"));
    }

    #[tokio::test]
    async fn test_empty_and_missing_sources() {
        let archiver = Archiver::default();
        assert!(matches!(
            archiver.compress(&[], Destination::Memory).await,
            Err(ArchiveError::EmptySource)
        ));
        assert!(matches!(
            archiver
                .compress(&[PathBuf::from("/definitely/not/here")], Destination::Memory)
                .await,
            Err(ArchiveError::SourceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_excludes_are_honored() {
        let dir = tempfile::tempdir().unwrap();
        let src = sample_tree(dir.path());
        std::fs::write(src.join("debug.log"), b"noise").unwrap();

        let options = ArchiveOptions::default().exclude(ExcludeFilter::defaults());
        let out = Archiver::new(options)
            .compress(&[src], Destination::Memory)
            .await
            .unwrap();
        assert!(out.stats.entries.iter().all(|e| e.path != "debug.log"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinks_archived_by_content() {
        let dir = tempfile::tempdir().unwrap();
        let src = sample_tree(dir.path());
        std::os::unix::fs::symlink(src.join("a.txt"), src.join("link.txt")).unwrap();

        let archiver = Archiver::default();
        let out = archiver.compress(&[src], Destination::Memory).await.unwrap();
        let extract_dir = dir.path().join("x");
        archiver
            .decompress(Source::Memory(out.bytes.unwrap()), &extract_dir, None)
            .await
            .unwrap();
        let link = extract_dir.join("link.txt");
        assert!(!std::fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(std::fs::read(link).unwrap(), b"alpha");
    }

    #[tokio::test]
    async fn test_cancel_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let src = sample_tree(dir.path());
        let out = dir.path().join("out.tar.gz");

        let token = CancelToken::new();
        token.interrupt();
        let mut options = ArchiveOptions::default();
        options.chunk_size = 1024;

        let result = Archiver::new(options)
            .with_cancel(token)
            .compress(&[src], Destination::File(out.clone()))
            .await;
        assert!(matches!(result, Err(ArchiveError::Cancelled)));
        assert!(!out.exists());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_progress_reaches_total() {
        let dir = tempfile::tempdir().unwrap();
        let src = sample_tree(dir.path());
        let last = Arc::new(AtomicU64::new(0));
        let seen = last.clone();

        Archiver::default()
            .with_progress(Arc::new(move |done, total| {
                assert!(done <= total);
                seen.store(done, Ordering::SeqCst);
            }))
            .compress(&[src], Destination::Memory)
            .await
            .unwrap();
        assert_eq!(last.load(Ordering::SeqCst), 300_010);
    }

    #[test]
    fn test_safe_join_rejects_traversal() {
        let root = Path::new("/out");
        assert!(safe_join(root, Path::new("../etc/passwd")).is_err());
        assert!(safe_join(root, Path::new("/etc/passwd")).is_err());
        assert_eq!(
            safe_join(root, Path::new("./a/b")).unwrap(),
            Path::new("/out/a/b")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_set_mode_reports_failure() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("run.sh");
        std::fs::write(&file, b"#!/bin/sh\n").unwrap();

        set_mode(&file, Some(0o100_750)).unwrap();
        let mode = std::fs::metadata(&file).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o750);

        assert!(set_mode(&tmp.path().join("gone"), Some(0o644)).is_err());
        assert!(set_mode(&tmp.path().join("gone"), None).is_ok());
    }
}
