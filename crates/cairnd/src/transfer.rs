//! File transfer plumbing: sender-side chunking and receiver-side assembly.
//!
//! A chunk stream carries `data_size`-byte payloads; the first short block
//! (possibly empty) is the final chunk. A file of exactly `n * data_size`
//! bytes therefore produces `n + 1` chunks, the last one zero-length.
//! Received chunks are flushed in sequence order into a dot-prefixed part
//! file that is renamed into place once the final chunk lands.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;

/// Chunk sequence space: a stream may use at most 2^16 sequence numbers.
const MAX_CHUNKS: u64 = 1 << 16;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("no such file: {0}")]
    NoSuchFile(PathBuf),

    #[error("{path} needs {chunks} chunks, more than the 16-bit sequence space")]
    FileTooLarge { path: PathBuf, chunks: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One payload pulled from a [`ChunkReader`].
#[derive(Debug, Clone)]
pub struct Chunk {
    pub payload: Bytes,
    pub has_next: bool,
}

/// Sequential reader producing the chunk stream for one file.
#[derive(Debug)]
pub struct ChunkReader {
    file: File,
    data_size: usize,
    finished: bool,
}

impl ChunkReader {
    /// Open a file for chunking. Fails with [`TransferError::NoSuchFile`]
    /// when the file vanished between scheduling and reading, and with
    /// [`TransferError::FileTooLarge`] when the stream would not fit the
    /// sequence space.
    pub fn open(path: &Path, data_size: usize) -> Result<Self, TransferError> {
        let meta = fs::metadata(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TransferError::NoSuchFile(path.to_path_buf())
            } else {
                TransferError::Io(e)
            }
        })?;

        let chunks = meta.len() / data_size as u64 + 1;
        if chunks > MAX_CHUNKS {
            return Err(TransferError::FileTooLarge {
                path: path.to_path_buf(),
                chunks,
            });
        }

        let file = File::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TransferError::NoSuchFile(path.to_path_buf())
            } else {
                TransferError::Io(e)
            }
        })?;

        Ok(ChunkReader {
            file,
            data_size,
            finished: false,
        })
    }

    /// Whether the final chunk has been produced.
    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Pull the next payload. A full block means more follow; the first
    /// short block ends the stream.
    pub fn next_chunk(&mut self) -> Result<Chunk, TransferError> {
        let mut buf = vec![0u8; self.data_size];
        let mut filled = 0;
        while filled < self.data_size {
            let n = self.file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        buf.truncate(filled);
        let has_next = filled == self.data_size;
        if !has_next {
            self.finished = true;
        }

        Ok(Chunk {
            payload: Bytes::from(buf),
            has_next,
        })
    }
}

/// What [`Assembly::accept`] did with a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyStatus {
    /// Buffered or flushed; more chunks are expected.
    InProgress,
    /// The final chunk was flushed and the file renamed into place.
    Complete,
    /// Already flushed earlier; re-acknowledge and move on.
    Duplicate,
}

/// Receive-side reassembly of one file.
///
/// Chunks may arrive out of order; they are buffered by sequence number
/// and written once the contiguous prefix reaches them. The part file
/// carries a dot prefix so the directory monitor never announces it.
pub struct Assembly {
    name: String,
    part_path: PathBuf,
    final_path: PathBuf,
    file: File,
    /// Next sequence number to write.
    next_flush: u32,
    /// Chunks received ahead of the contiguous prefix.
    pending: BTreeMap<u32, Chunk>,
    /// Sequence number of the final chunk, once seen.
    last_seq: Option<u32>,
}

impl Assembly {
    pub fn create(dir: &Path, filename: &str, init_seq: u32) -> std::io::Result<Self> {
        let part_path = dir.join(format!(".{filename}.part"));
        let final_path = dir.join(filename);
        let file = File::create(&part_path)?;
        Ok(Assembly {
            name: filename.to_owned(),
            part_path,
            final_path,
            file,
            next_flush: init_seq,
            pending: BTreeMap::new(),
            last_seq: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.final_path
    }

    /// Take in one chunk, flush whatever became contiguous, and finish the
    /// file when the final chunk has been written.
    pub fn accept(&mut self, seq: u32, chunk: Chunk) -> std::io::Result<AssemblyStatus> {
        if seq < self.next_flush {
            return Ok(AssemblyStatus::Duplicate);
        }
        if !chunk.has_next {
            self.last_seq = Some(seq);
        }
        self.pending.insert(seq, chunk);

        while let Some(chunk) = self.pending.remove(&self.next_flush) {
            self.file.write_all(&chunk.payload)?;
            self.next_flush += 1;
        }

        if self.last_seq.is_some_and(|last| last < self.next_flush) {
            self.file.sync_all()?;
            fs::rename(&self.part_path, &self.final_path)?;
            return Ok(AssemblyStatus::Complete);
        }
        Ok(AssemblyStatus::InProgress)
    }

    /// Remove the part file after an aborted transfer.
    pub fn discard(self) {
        let _ = fs::remove_file(&self.part_path);
    }
}
