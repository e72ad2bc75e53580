//! # Turn Audio Buffer
//!
//! Accumulates the raw audio a browser client streams during one conversational
//! turn, so it can be forwarded to the AI service as a single batch when the
//! client signals the end of the turn.
//!
//! ## Key Features:
//! - **Bounded**: an append that would exceed the byte limit is rejected whole,
//!   never truncated
//! - **Order preserving**: `flush` returns chunks concatenated in append order
//! - **Thread safe**: one internal mutex, independent of any session lock

use parking_lot::Mutex;
use thiserror::Error;

/// Errors produced by [`AudioBuffer`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("Audio buffer full (max {max_size} bytes)")]
    Full { max_size: usize },
}

#[derive(Debug, Default)]
struct BufferInner {
    chunks: Vec<Vec<u8>>,
    total: usize,
}

/// Thread-safe, size-limited accumulator of audio chunks.
///
/// ## Invariants:
/// - `size()` always equals the sum of the stored chunk lengths
/// - `size()` never exceeds `max_size()`
#[derive(Debug)]
pub struct AudioBuffer {
    inner: Mutex<BufferInner>,
    max_size: usize,
}

impl AudioBuffer {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(BufferInner::default()),
            max_size,
        }
    }

    /// Append a chunk, or reject it if the total would exceed the limit.
    ///
    /// A rejected chunk leaves the buffer exactly as it was.
    pub fn append(&self, chunk: &[u8]) -> Result<(), BufferError> {
        let mut inner = self.inner.lock();
        if inner.total + chunk.len() > self.max_size {
            return Err(BufferError::Full {
                max_size: self.max_size,
            });
        }
        inner.total += chunk.len();
        inner.chunks.push(chunk.to_vec());
        Ok(())
    }

    /// Take everything accumulated so far, leaving the buffer empty.
    ///
    /// Returns `None` when there is nothing to flush.
    pub fn flush(&self) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock();
        if inner.total == 0 {
            return None;
        }
        let taken = std::mem::take(&mut *inner);
        drop(inner);

        let mut out = Vec::with_capacity(taken.total);
        for chunk in taken.chunks {
            out.extend_from_slice(&chunk);
        }
        Some(out)
    }

    /// Drop all accumulated audio.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.chunks.clear();
        inner.total = 0;
    }

    pub fn size(&self) -> usize {
        self.inner.lock().total
    }

    pub fn chunk_count(&self) -> usize {
        self.inner.lock().chunks.len()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}
