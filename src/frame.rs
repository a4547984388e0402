//! Length-prefixed frames for per-worker shard files.
//!
//! ```text
//! [u32 big-endian payload length][u8 compressed flag][payload]
//! ```
//!
//! The payload is a CBOR array of [`MessageRecord`]s, zlib-compressed when
//! that makes it smaller. One frame holds exactly one committed chunk, sorted
//! ascending by ID. A frame is assembled in memory and handed to the file in
//! a single write, so a reader only ever sees a short frame at the very end
//! of a shard whose writer died mid-write.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::model::MessageRecord;

pub const HEADER_LEN: usize = 5;
const FLAG_RAW: u8 = 0;
const FLAG_COMPRESSED: u8 = 1;
/// Upper bound on a sane payload; anything larger is a corrupt header.
const MAX_PAYLOAD_LEN: u32 = 1 << 30;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("truncated frame at offset {offset}")]
    Truncated { offset: u64 },
    #[error("corrupt frame at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },
    #[error("failed to encode record batch: {0}")]
    Encode(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Encode a batch into a complete frame (header included).
pub fn encode_frame(records: &[MessageRecord], compress: bool) -> Result<Vec<u8>, FrameError> {
    let mut encoded = Vec::with_capacity(records.len() * 64);
    ciborium::into_writer(records, &mut encoded)
        .map_err(|err| FrameError::Encode(err.to_string()))?;

    let (flag, payload) = if compress {
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(encoded.len() / 2), Compression::fast());
        encoder.write_all(&encoded)?;
        let compressed = encoder.finish()?;
        if compressed.len() < encoded.len() {
            (FLAG_COMPRESSED, compressed)
        } else {
            (FLAG_RAW, encoded)
        }
    } else {
        (FLAG_RAW, encoded)
    };

    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_PAYLOAD_LEN)
        .ok_or_else(|| FrameError::Encode(format!("payload of {} bytes is too large", payload.len())))?;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.push(flag);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// A frame read back from disk, payload still encoded.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub offset: u64,
    pub compressed: bool,
    pub payload: Vec<u8>,
}

impl RawFrame {
    pub fn encoded_len(&self) -> u64 {
        (HEADER_LEN + self.payload.len()) as u64
    }

    pub fn decode(&self) -> Result<Vec<MessageRecord>, FrameError> {
        let decoded: Result<Vec<MessageRecord>, _> = if self.compressed {
            ciborium::from_reader(ZlibDecoder::new(self.payload.as_slice()))
        } else {
            ciborium::from_reader(self.payload.as_slice())
        };
        decoded.map_err(|err| FrameError::Corrupt {
            offset: self.offset,
            reason: format!("undecodable payload: {err}"),
        })
    }
}

/// Summary of one closed shard file.
#[derive(Debug, Clone)]
pub struct ShardSummary {
    pub path: PathBuf,
    pub frames: usize,
    pub bytes: u64,
}

/// Append-only writer for one worker's shard file.
pub struct FrameWriter {
    path: PathBuf,
    file: tokio::fs::File,
    compress: bool,
    frames: usize,
    bytes: u64,
}

impl FrameWriter {
    pub async fn create(path: &Path, compress: bool) -> Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .await
            .with_context(|| format!("failed to open shard file {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            compress,
            frames: 0,
            bytes: 0,
        })
    }

    /// Write one chunk's records as a single frame. Returns the bytes written.
    pub async fn write_batch(&mut self, records: &[MessageRecord]) -> Result<u64> {
        let frame = encode_frame(records, self.compress)
            .with_context(|| format!("failed to encode frame for {}", self.path.display()))?;
        self.file
            .write_all(&frame)
            .await
            .with_context(|| format!("failed to write frame to {}", self.path.display()))?;
        self.file
            .flush()
            .await
            .with_context(|| format!("failed to flush {}", self.path.display()))?;
        self.frames += 1;
        self.bytes += frame.len() as u64;
        Ok(frame.len() as u64)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn finish(mut self) -> Result<ShardSummary> {
        self.file
            .flush()
            .await
            .with_context(|| format!("failed to flush {}", self.path.display()))?;
        self.file
            .sync_all()
            .await
            .with_context(|| format!("failed to sync {}", self.path.display()))?;
        Ok(ShardSummary {
            path: self.path,
            frames: self.frames,
            bytes: self.bytes,
        })
    }
}

/// Sequential frame reader with seek support.
pub struct FrameReader<R> {
    inner: R,
    offset: u64,
}

impl FrameReader<io::BufReader<std::fs::File>> {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = std::fs::File::open(path)?;
        Ok(Self::new(io::BufReader::new(file)))
    }
}

impl<R: Read + Seek> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, offset: 0 }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn seek_to(&mut self, offset: u64) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(offset))?;
        self.offset = offset;
        Ok(())
    }

    /// Read the next frame. `Ok(None)` on a clean end of file.
    pub fn next_frame(&mut self) -> Result<Option<RawFrame>, FrameError> {
        let start = self.offset;
        let mut header = [0u8; HEADER_LEN];
        let got = read_full(&mut self.inner, &mut header)?;
        if got == 0 {
            return Ok(None);
        }
        if got < HEADER_LEN {
            return Err(FrameError::Truncated { offset: start });
        }

        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let compressed = match header[4] {
            FLAG_RAW => false,
            FLAG_COMPRESSED => true,
            other => {
                return Err(FrameError::Corrupt {
                    offset: start,
                    reason: format!("unknown compression flag {other}"),
                })
            }
        };
        if len > MAX_PAYLOAD_LEN {
            return Err(FrameError::Corrupt {
                offset: start,
                reason: format!("declared length {len} exceeds limit"),
            });
        }

        let mut payload = vec![0u8; len as usize];
        let got = read_full(&mut self.inner, &mut payload)?;
        if got < payload.len() {
            return Err(FrameError::Truncated { offset: start });
        }
        self.offset = start + (HEADER_LEN + payload.len()) as u64;
        Ok(Some(RawFrame {
            offset: start,
            compressed,
            payload,
        }))
    }
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0usize;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}
