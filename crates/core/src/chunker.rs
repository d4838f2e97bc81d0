//! Content addressing: split a byte stream into hashed chunks
//!
//! Fixed-size chunking is the default. Content-defined chunking (FastCDC) picks
//! boundaries from the bytes already seen, so an unmodified prefix always
//! re-chunks to the same boundaries and hashes.

use std::io::Read;
use std::path::Path;

use bytes::Bytes;
use fastcdc::v2020::{Normalization, StreamCDC};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};
use crate::hash::{ContentHash, FileHasher};

/// Largest chunk any plan may carry
pub const MAX_CHUNK_SIZE: u32 = 64 * 1024 * 1024;

/// Default fixed chunk size (4 MiB)
pub const DEFAULT_CHUNK_SIZE: u32 = 4 * 1024 * 1024;

// FastCDC accepts only these bounds and panics outside them.
const CDC_MIN_RANGE: (u32, u32) = (64, 1_048_576);
const CDC_AVG_RANGE: (u32, u32) = (256, 4_194_304);
const CDC_MAX_RANGE: (u32, u32) = (1024, 16_777_216);

/// How a stream gets split into chunks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "kebab-case")]
pub enum ChunkConfig {
    /// Cut every `chunk_size` bytes
    Fixed {
        #[serde(default = "default_chunk_size")]
        chunk_size: u32,
    },
    /// FastCDC boundaries
    ContentDefined {
        min_size: u32,
        avg_size: u32,
        max_size: u32,
    },
}

fn default_chunk_size() -> u32 {
    DEFAULT_CHUNK_SIZE
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self::Fixed {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl ChunkConfig {
    #[must_use]
    pub fn fixed(chunk_size: u32) -> Self {
        Self::Fixed { chunk_size }
    }

    /// Content-defined chunking averaging 4 MiB
    #[must_use]
    pub fn content_defined() -> Self {
        Self::ContentDefined {
            min_size: 1024 * 1024,
            avg_size: 4 * 1024 * 1024,
            max_size: 16 * 1024 * 1024,
        }
    }

    /// Check the sizes are usable.
    ///
    /// # Errors
    /// Returns [`VaultError::Config`] describing the first bad value.
    pub fn validate(&self) -> Result<()> {
        match *self {
            Self::Fixed { chunk_size } => {
                if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
                    return Err(VaultError::Config(format!(
                        "chunk_size must be in 1..={MAX_CHUNK_SIZE}, got {chunk_size}"
                    )));
                }
            }
            Self::ContentDefined {
                min_size,
                avg_size,
                max_size,
            } => {
                let in_range = |v: u32, (lo, hi): (u32, u32)| (lo..=hi).contains(&v);
                if !in_range(min_size, CDC_MIN_RANGE)
                    || !in_range(avg_size, CDC_AVG_RANGE)
                    || !in_range(max_size, CDC_MAX_RANGE)
                {
                    return Err(VaultError::Config(format!(
                        "content-defined sizes out of range: min={min_size} avg={avg_size} max={max_size}"
                    )));
                }
                if !(min_size <= avg_size && avg_size <= max_size) {
                    return Err(VaultError::Config(
                        "content-defined sizes must satisfy min <= avg <= max".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// A chunk's location in its file and its hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Byte offset in the source data
    pub offset: u64,
    /// Length of this chunk in bytes
    pub length: u32,
    /// BLAKE3 hash of the chunk content
    pub hash: ContentHash,
}

/// A chunk together with its bytes
#[derive(Debug, Clone)]
pub struct ChunkData {
    pub chunk: Chunk,
    pub data: Bytes,
}

enum Splitter<R: Read> {
    Fixed { reader: R, chunk_size: usize },
    Cdc(StreamCDC<R>),
}

/// Lazily splits a reader into hashed chunks while hashing the whole stream.
///
/// Restart by building a new addressor over a fresh reader; there is no seeking.
pub struct ContentAddressor<R: Read> {
    splitter: Splitter<R>,
    offset: u64,
    file_hasher: FileHasher,
    done: bool,
}

impl<R: Read> ContentAddressor<R> {
    /// # Panics
    /// Content-defined sizes must have passed [`ChunkConfig::validate`].
    pub fn new(reader: R, config: &ChunkConfig) -> Self {
        let splitter = match *config {
            ChunkConfig::Fixed { chunk_size } => Splitter::Fixed {
                reader,
                chunk_size: chunk_size.max(1) as usize,
            },
            ChunkConfig::ContentDefined {
                min_size,
                avg_size,
                max_size,
            } => Splitter::Cdc(StreamCDC::with_level(
                reader,
                min_size,
                avg_size,
                max_size,
                Normalization::Level1,
            )),
        };

        Self {
            splitter,
            offset: 0,
            file_hasher: FileHasher::new(),
            done: false,
        }
    }

    /// Hash of every byte consumed so far
    #[must_use]
    pub fn file_hash(&self) -> ContentHash {
        self.file_hasher.finalize()
    }

    /// Number of bytes consumed so far
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.offset
    }

    fn next_raw(&mut self) -> Result<Option<Vec<u8>>> {
        match &mut self.splitter {
            Splitter::Fixed { reader, chunk_size } => {
                let mut buf = vec![0u8; *chunk_size];
                let mut filled = 0;
                while filled < buf.len() {
                    match reader.read(&mut buf[filled..]) {
                        Ok(0) => break,
                        Ok(n) => filled += n,
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                        Err(source) => {
                            return Err(VaultError::StreamRead {
                                offset: self.offset + filled as u64,
                                source,
                            });
                        }
                    }
                }
                if filled == 0 {
                    return Ok(None);
                }
                buf.truncate(filled);
                Ok(Some(buf))
            }
            Splitter::Cdc(stream) => match stream.next() {
                None => Ok(None),
                Some(Ok(entry)) => Ok(Some(entry.data)),
                Some(Err(fastcdc::v2020::Error::IoError(source))) => Err(VaultError::StreamRead {
                    offset: self.offset,
                    source,
                }),
                Some(Err(other)) => Err(VaultError::StreamRead {
                    offset: self.offset,
                    source: std::io::Error::other(other.to_string()),
                }),
            },
        }
    }
}

impl<R: Read> Iterator for ContentAddressor<R> {
    type Item = Result<ChunkData>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.next_raw() {
            Ok(Some(data)) => {
                self.file_hasher.update(&data);
                let chunk = Chunk {
                    offset: self.offset,
                    length: u32::try_from(data.len()).unwrap_or(u32::MAX),
                    hash: ContentHash::from_bytes(&data),
                };
                self.offset += data.len() as u64;
                Some(Ok(ChunkData {
                    chunk,
                    data: Bytes::from(data),
                }))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl<R: Read> std::iter::FusedIterator for ContentAddressor<R> {}

/// Chunk list and whole-file hash of one file, without the bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePlan {
    pub chunks: Vec<Chunk>,
    pub file_hash: ContentHash,
    pub total_size: u64,
}

/// Run a reader through the addressor, keeping only chunk metadata.
///
/// # Errors
/// Returns [`VaultError::StreamRead`] if the reader fails.
pub fn plan_reader<R: Read>(reader: R, config: &ChunkConfig) -> Result<FilePlan> {
    let mut addressor = ContentAddressor::new(reader, config);
    let mut chunks = Vec::new();
    for item in addressor.by_ref() {
        chunks.push(item?.chunk);
    }
    Ok(FilePlan {
        chunks,
        file_hash: addressor.file_hash(),
        total_size: addressor.total_bytes(),
    })
}

/// Plan a file on disk.
///
/// # Errors
/// Returns [`VaultError::StreamRead`] if the file cannot be opened or read.
pub fn plan_file(path: &Path, config: &ChunkConfig) -> Result<FilePlan> {
    let file =
        std::fs::File::open(path).map_err(|source| VaultError::StreamRead { offset: 0, source })?;
    plan_reader(std::io::BufReader::new(file), config)
}

/// Chunk an in-memory buffer (convenience function)
///
/// # Errors
/// Only fails for invalid content-defined bounds surfaced by the reader.
pub fn chunk_bytes(data: &[u8], config: &ChunkConfig) -> Result<Vec<ChunkData>> {
    ContentAddressor::new(data, config).collect()
}
