//! Compression algorithms, detection and stream adapters.

use std::fmt;
use std::io::{self, Read, Write};
use std::ops::RangeInclusive;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::ArchiveError;

/// Compression applied on top of the tar stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Plain `.tar`.
    None,
    #[default]
    Gzip,
    Bzip2,
    Xz,
    Lz4,
    Zstd,
}

const GZIP_MAGIC: &[u8] = &[0x1F, 0x8B];
const BZIP2_MAGIC: &[u8] = b"BZh";
const XZ_MAGIC: &[u8] = &[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00];
const LZ4_MAGIC: &[u8] = &[0x04, 0x22, 0x4D, 0x18];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xB5, 0x2F, 0xFD];

/// Bytes read from the head of an archive for sniffing.
pub const SNIFF_LEN: usize = 16;

impl Compression {
    pub const ALL: [Self; 6] = [
        Self::None,
        Self::Gzip,
        Self::Bzip2,
        Self::Xz,
        Self::Lz4,
        Self::Zstd,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Bzip2 => "bzip2",
            Self::Xz => "xz",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        }
    }

    /// Compression extension alone: `.gz`, `.bz2`, ... or empty.
    pub fn extension(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Gzip => ".gz",
            Self::Bzip2 => ".bz2",
            Self::Xz => ".xz",
            Self::Lz4 => ".lz4",
            Self::Zstd => ".zst",
        }
    }

    /// Full archive suffix: `.tar` plus [`Compression::extension`].
    pub fn archive_suffix(self) -> String {
        format!(".tar{}", self.extension())
    }

    /// Cargo feature that provides this codec, for codecs that are optional.
    pub fn feature(self) -> Option<&'static str> {
        match self {
            Self::Bzip2 => Some("bzip2"),
            Self::Xz => Some("xz"),
            Self::Lz4 => Some("lz4"),
            Self::None | Self::Gzip | Self::Zstd => None,
        }
    }

    /// Whether this build can encode and decode the algorithm.
    pub fn is_available(self) -> bool {
        match self {
            Self::None | Self::Gzip | Self::Zstd => true,
            Self::Bzip2 => cfg!(feature = "bzip2"),
            Self::Xz => cfg!(feature = "xz"),
            Self::Lz4 => cfg!(feature = "lz4"),
        }
    }

    /// All algorithms this build supports.
    pub fn available() -> Vec<Self> {
        Self::ALL.into_iter().filter(|c| c.is_available()).collect()
    }

    /// Fail with a diagnostic naming the missing feature and the
    /// algorithms that would work instead.
    pub fn ensure_available(self) -> Result<(), ArchiveError> {
        if self.is_available() {
            return Ok(());
        }
        let available = Self::available()
            .into_iter()
            .map(Self::name)
            .collect::<Vec<_>>()
            .join(", ");
        Err(ArchiveError::Unavailable {
            algorithm: self.name(),
            feature: self.feature().unwrap_or("default"),
            available,
        })
    }

    /// Accepted level range, or `None` if the codec has no levels.
    pub fn level_range(self) -> Option<RangeInclusive<u32>> {
        match self {
            Self::Gzip | Self::Bzip2 => Some(1..=9),
            Self::Xz => Some(0..=9),
            Self::Zstd => Some(1..=22),
            Self::None | Self::Lz4 => None,
        }
    }

    pub fn default_level(self) -> u32 {
        match self {
            Self::Gzip | Self::Bzip2 | Self::Xz => 6,
            Self::Zstd => 3,
            Self::None | Self::Lz4 => 0,
        }
    }

    /// Resolve an optional requested level against this codec.
    pub fn resolve_level(self, level: Option<u32>) -> Result<u32, ArchiveError> {
        let Some(range) = self.level_range() else {
            return Ok(0);
        };
        let level = level.unwrap_or_else(|| self.default_level());
        if range.contains(&level) {
            Ok(level)
        } else {
            Err(ArchiveError::InvalidLevel {
                algorithm: self.name(),
                level,
                min: *range.start(),
                max: *range.end(),
            })
        }
    }

    /// Detect from a file name. `None` means the name is inconclusive.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_lowercase();
        let table: [(&[&str], Self); 6] = [
            (&[".tar.gz", ".tgz"], Self::Gzip),
            (&[".tar.bz2", ".tbz", ".tbz2"], Self::Bzip2),
            (&[".tar.xz", ".txz"], Self::Xz),
            (&[".tar.lz4", ".tlz4"], Self::Lz4),
            (&[".tar.zst", ".tzst"], Self::Zstd),
            (&[".tar"], Self::None),
        ];
        table
            .into_iter()
            .find(|(suffixes, _)| suffixes.iter().any(|s| name.ends_with(s)))
            .map(|(_, c)| c)
    }

    /// Detect from the leading bytes. Unknown headers mean plain tar.
    pub fn from_magic(head: &[u8]) -> Self {
        if head.starts_with(GZIP_MAGIC) {
            Self::Gzip
        } else if head.starts_with(BZIP2_MAGIC) {
            Self::Bzip2
        } else if head.starts_with(XZ_MAGIC) {
            Self::Xz
        } else if head.starts_with(LZ4_MAGIC) {
            Self::Lz4
        } else if head.starts_with(ZSTD_MAGIC) {
            Self::Zstd
        } else {
            Self::None
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Compression {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" | "tar" => Ok(Self::None),
            "gzip" | "gz" => Ok(Self::Gzip),
            "bzip2" | "bz2" => Ok(Self::Bzip2),
            "xz" | "lzma" => Ok(Self::Xz),
            "lz4" => Ok(Self::Lz4),
            "zstd" | "zst" => Ok(Self::Zstd),
            other => Err(ArchiveError::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// Compressing writer over any sink.
pub(crate) enum Encoder<W: Write> {
    Plain(W),
    Gzip(flate2::write::GzEncoder<W>),
    #[cfg(feature = "bzip2")]
    Bzip2(bzip2::write::BzEncoder<W>),
    #[cfg(feature = "xz")]
    Xz(xz2::write::XzEncoder<W>),
    #[cfg(feature = "lz4")]
    Lz4(lz4_flex::frame::FrameEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> Encoder<W> {
    pub(crate) fn new(sink: W, compression: Compression, level: u32) -> Result<Self, ArchiveError> {
        compression.ensure_available()?;
        Ok(match compression {
            Compression::None => Self::Plain(sink),
            Compression::Gzip => {
                Self::Gzip(flate2::write::GzEncoder::new(sink, flate2::Compression::new(level)))
            }
            #[cfg(feature = "bzip2")]
            Compression::Bzip2 => {
                Self::Bzip2(bzip2::write::BzEncoder::new(sink, bzip2::Compression::new(level)))
            }
            #[cfg(feature = "xz")]
            Compression::Xz => Self::Xz(xz2::write::XzEncoder::new(sink, level)),
            #[cfg(feature = "lz4")]
            Compression::Lz4 => Self::Lz4(lz4_flex::frame::FrameEncoder::new(sink)),
            Compression::Zstd => Self::Zstd(zstd::stream::write::Encoder::new(sink, level as i32)?),
            #[allow(unreachable_patterns)]
            other => return Err(unavailable(other)),
        })
    }

    /// Flush trailers and hand back the sink.
    pub(crate) fn finish(self) -> io::Result<W> {
        match self {
            Self::Plain(w) => Ok(w),
            Self::Gzip(e) => e.finish(),
            #[cfg(feature = "bzip2")]
            Self::Bzip2(e) => e.finish(),
            #[cfg(feature = "xz")]
            Self::Xz(e) => e.finish(),
            #[cfg(feature = "lz4")]
            Self::Lz4(e) => e.finish().map_err(io::Error::other),
            Self::Zstd(e) => e.finish(),
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(w) => w.write(buf),
            Self::Gzip(e) => e.write(buf),
            #[cfg(feature = "bzip2")]
            Self::Bzip2(e) => e.write(buf),
            #[cfg(feature = "xz")]
            Self::Xz(e) => e.write(buf),
            #[cfg(feature = "lz4")]
            Self::Lz4(e) => e.write(buf),
            Self::Zstd(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(w) => w.flush(),
            Self::Gzip(e) => e.flush(),
            #[cfg(feature = "bzip2")]
            Self::Bzip2(e) => e.flush(),
            #[cfg(feature = "xz")]
            Self::Xz(e) => e.flush(),
            #[cfg(feature = "lz4")]
            Self::Lz4(e) => e.flush(),
            Self::Zstd(e) => e.flush(),
        }
    }
}

/// Decompressing reader over any source.
pub(crate) fn decoder<'a, R: Read + 'a>(
    source: R,
    compression: Compression,
) -> Result<Box<dyn Read + 'a>, ArchiveError> {
    compression.ensure_available()?;
    Ok(match compression {
        Compression::None => Box::new(source),
        Compression::Gzip => Box::new(flate2::read::MultiGzDecoder::new(source)),
        #[cfg(feature = "bzip2")]
        Compression::Bzip2 => Box::new(bzip2::read::MultiBzDecoder::new(source)),
        #[cfg(feature = "xz")]
        Compression::Xz => Box::new(xz2::read::XzDecoder::new_multi_decoder(source)),
        #[cfg(feature = "lz4")]
        Compression::Lz4 => Box::new(lz4_flex::frame::FrameDecoder::new(source)),
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(source)?),
        #[allow(unreachable_patterns)]
        other => return Err(unavailable(other)),
    })
}

fn unavailable(compression: Compression) -> ArchiveError {
    match compression.ensure_available() {
        Err(e) => e,
        Ok(()) => ArchiveError::UnknownAlgorithm(compression.name().to_string()),
    }
}
