use std::io::Read;
use std::time::Instant;

use flate2::bufread::GzDecoder;
use xz2::read::XzDecoder;

use crate::runner::cancelled;

const CHUNK_SIZE: usize = 64 * 1024;

/// Why a decode stopped without producing a usable result.
#[derive(Debug)]
pub enum DecodeError {
    TimedOut,
    Cancelled,
    Corrupt(std::io::Error),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::TimedOut => write!(f, "decode timed out"),
            DecodeError::Cancelled => write!(f, "decode cancelled"),
            DecodeError::Corrupt(err) => write!(f, "corrupt stream - {err}"),
        }
    }
}

/// Decompress an xz/lzma stream, tolerating truncated input.
///
/// A short fetch cuts the stream mid-block, so decode errors past the
/// first byte are expected: whatever decoded cleanly up to that point is
/// returned. The deadline and the cancellation flag are polled between
/// chunks.
pub fn decompress_xz(data: &[u8], deadline: Instant) -> Result<Vec<u8>, DecodeError> {
    let mut decoder = XzDecoder::new_multi_decoder(data);
    let mut out = Vec::new();
    let mut chunk = vec![0u8; CHUNK_SIZE];

    loop {
        if Instant::now() >= deadline {
            return Err(DecodeError::TimedOut);
        }
        if cancelled() {
            return Err(DecodeError::Cancelled);
        }
        match decoder.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&chunk[..n]),
            // Truncated or damaged block: keep the decoded prefix.
            Err(_) => break,
        }
    }

    Ok(out)
}

/// Decompress a gzip/DEFLATE stream.
///
/// Unlike the outer xz stream this one is always fetched whole, so a
/// decode error means the payload is unusable and is reported as such.
pub fn decompress_gz(data: &[u8], deadline: Instant) -> Result<Vec<u8>, DecodeError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    let mut chunk = vec![0u8; CHUNK_SIZE];

    loop {
        if Instant::now() >= deadline {
            return Err(DecodeError::TimedOut);
        }
        if cancelled() {
            return Err(DecodeError::Cancelled);
        }
        match decoder.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&chunk[..n]),
            Err(err) => return Err(DecodeError::Corrupt(err)),
        }
    }

    Ok(out)
}
