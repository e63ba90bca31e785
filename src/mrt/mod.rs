pub mod parse;

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use flate2::bufread::MultiGzDecoder;
use thiserror::Error;

use crate::engine::aggregate::Contributions;

use self::parse::{parse_stream, ParseError};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const GZIP_HEADER_LEN: usize = 10;
const GZIP_CM_DEFLATE: u8 = 8;
const GZIP_FLG_RESERVED: u8 = 0xe0;
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Errors returned when decoding a cached snapshot file.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// The file is not a gzip container. Purging it lets the next run fetch
    /// a fresh copy.
    #[error("{}: invalid container header", .path.display())]
    MalformedContainer { path: PathBuf },

    #[error("decoding {}: {source}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: ParseError,
    },

    #[error("reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Turns one cached snapshot file into per-key observation counts.
///
/// Decoding is CPU bound and synchronous; callers run it on the blocking
/// pool.
pub trait Decoder: Send + Sync + 'static {
    fn decode(&self, path: &Path) -> Result<Contributions, DecodeError>;
}

/// Decoder for gzip-compressed MRT update archives.
#[derive(Debug, Default, Clone, Copy)]
pub struct MrtDecoder;

impl MrtDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for MrtDecoder {
    fn decode(&self, path: &Path) -> Result<Contributions, DecodeError> {
        let io_err = |source| DecodeError::Io {
            path: path.to_path_buf(),
            source,
        };

        let file = File::open(path).map_err(io_err)?;
        let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, file);

        if !is_gzip_header(reader.fill_buf().map_err(io_err)?) {
            return Err(DecodeError::MalformedContainer {
                path: path.to_path_buf(),
            });
        }

        let inflated = BufReader::with_capacity(READ_BUFFER_SIZE, MultiGzDecoder::new(reader));

        let mut out = Contributions::new();
        let summary = parse_stream(inflated, &mut out).map_err(|e| match e {
            // A later member with a bad header, e.g. trailing junk.
            ParseError::Io(source) if is_bad_member_header(&source) => {
                DecodeError::MalformedContainer {
                    path: path.to_path_buf(),
                }
            }
            // Inflate failures surface as I/O errors from the decoder.
            ParseError::Io(source) if !is_corrupt_stream(&source) => DecodeError::Io {
                path: path.to_path_buf(),
                source,
            },
            source => DecodeError::Decode {
                path: path.to_path_buf(),
                source,
            },
        })?;

        tracing::debug!(
            file = %path.display(),
            records = summary.records,
            updates = summary.updates,
            skipped = summary.skipped,
            prefixes = summary.prefixes,
            keys = out.len(),
            "Snapshot decoded"
        );

        Ok(out)
    }
}

/// Magic, deflate compression method and no reserved flag bits.
fn is_gzip_header(buf: &[u8]) -> bool {
    buf.len() >= GZIP_HEADER_LEN
        && buf.starts_with(&GZIP_MAGIC)
        && buf[2] == GZIP_CM_DEFLATE
        && buf[3] & GZIP_FLG_RESERVED == 0
}

/// flate2 reports an unparsable member header as `InvalidInput` with this
/// message; inflate and checksum failures use other messages.
fn is_bad_member_header(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::InvalidInput && e.to_string().contains("invalid gzip header")
}

fn is_corrupt_stream(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof
    )
}
