//! Shared-memory channel that gives a worker blocking reads of stdin.
//!
//! Input arrives asynchronously (keystrokes relayed from a terminal, or a
//! string supplied up front) but a running program expects `read(0, ..)`
//! to block until bytes are available. The channel bridges the two with a
//! single append-only buffer shared between one producer and one consumer.
//!
//! # Layout
//!
//! ```text
//! header: [write cursor | read cursor | end-of-input | signal]   (4 words)
//! data:   [u8; capacity]                                          (append-only)
//! ```
//!
//! Invariants: `read cursor <= write cursor <= capacity`, and the
//! end-of-input word goes from 0 to 1 exactly once. The signal word is bumped
//! on every write and on close; a blocked reader sleeps until it changes.
//!
//! The producer side ([`StdinWriter`]) is not `Clone`, so there is only ever
//! one writer. Dropping it closes the channel, which releases any reader
//! still blocked on it.

use std::io;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

/// Number of header words preceding the data region.
pub const HEADER_WORDS: usize = 4;

const WRITE_CURSOR: usize = 0;
const READ_CURSOR: usize = 1;
const END_OF_INPUT: usize = 2;
const SIGNAL: usize = 3;

/// Default data-region size for a run's stdin.
pub const DEFAULT_CAPACITY: usize = 64 * 1024;

/// Errors reported to the stdin producer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StdinError {
    /// The write does not fit in the remaining capacity.
    #[error("stdin buffer full: {requested} bytes requested, {available} available")]
    BufferFull {
        /// Size of the rejected write.
        requested: usize,
        /// Bytes left in the data region.
        available: usize,
    },
    /// End-of-input was already signaled.
    #[error("stdin already closed")]
    Closed,
}

/// Outcome of a blocking read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdinRead {
    /// Bytes that had not been read before.
    Data(Vec<u8>),
    /// Input is closed and fully drained.
    EndOfStream,
}

struct SharedBuffer {
    header: [AtomicUsize; HEADER_WORDS],
    data: Box<[AtomicU8]>,
    lock: Mutex<()>,
    wakeup: Condvar,
}

impl SharedBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            header: std::array::from_fn(|_| AtomicUsize::new(0)),
            data: (0..capacity).map(|_| AtomicU8::new(0)).collect(),
            lock: Mutex::new(()),
            wakeup: Condvar::new(),
        }
    }

    fn word(&self, index: usize) -> &AtomicUsize {
        &self.header[index]
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bump the signal word and wake every waiter.
    fn notify(&self) {
        let _guard = self.guard();
        self.word(SIGNAL).fetch_add(1, Ordering::Release);
        self.wakeup.notify_all();
    }

    /// Sleep until the signal word differs from `seen`.
    fn wait(&self, seen: usize) {
        let mut guard = self.guard();
        while self.word(SIGNAL).load(Ordering::Acquire) == seen {
            guard = self
                .wakeup
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn close(&self) {
        if self.word(END_OF_INPUT).swap(1, Ordering::AcqRel) == 0 {
            self.notify();
        }
    }

    fn is_closed(&self) -> bool {
        self.word(END_OF_INPUT).load(Ordering::Acquire) != 0
    }

    fn copy_out(&self, range: std::ops::Range<usize>) -> Vec<u8> {
        self.data[range]
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect()
    }
}

/// Allocate a channel with a data region of `capacity` bytes.
pub fn stdin_channel(capacity: usize) -> (StdinWriter, StdinReader) {
    let shared = Arc::new(SharedBuffer::new(capacity));
    (
        StdinWriter {
            shared: Arc::clone(&shared),
        },
        StdinReader { shared },
    )
}

/// Producer half. Writes never block.
pub struct StdinWriter {
    shared: Arc<SharedBuffer>,
}

impl std::fmt::Debug for StdinWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdinWriter")
            .field("written", &self.written())
            .field("capacity", &self.capacity())
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}

impl StdinWriter {
    /// Append UTF-8 `text` and wake the reader.
    pub fn write(&mut self, text: &str) -> Result<(), StdinError> {
        self.write_bytes(text.as_bytes())
    }

    /// Append raw bytes and wake the reader.
    ///
    /// The bytes of one call land contiguously; a write that does not fit is
    /// rejected whole.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), StdinError> {
        if self.shared.is_closed() {
            return Err(StdinError::Closed);
        }

        let start = self.shared.word(WRITE_CURSOR).load(Ordering::Relaxed);
        let available = self.capacity() - start;
        if bytes.len() > available {
            return Err(StdinError::BufferFull {
                requested: bytes.len(),
                available,
            });
        }

        for (slot, byte) in self.shared.data[start..start + bytes.len()]
            .iter()
            .zip(bytes)
        {
            slot.store(*byte, Ordering::Relaxed);
        }
        self.shared
            .word(WRITE_CURSOR)
            .store(start + bytes.len(), Ordering::Release);
        self.shared.notify();
        Ok(())
    }

    /// Signal end-of-input. Idempotent.
    pub fn close(&mut self) {
        self.shared.close();
    }

    /// Total bytes written so far.
    pub fn written(&self) -> usize {
        self.shared.word(WRITE_CURSOR).load(Ordering::Acquire)
    }

    /// Size of the data region.
    pub fn capacity(&self) -> usize {
        self.shared.data.len()
    }

    /// A handle that can close the channel and read back what was written.
    pub fn control(&self) -> StdinControl {
        StdinControl {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for StdinWriter {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// Consumer half. Owned by the worker thread running the program.
pub struct StdinReader {
    shared: Arc<SharedBuffer>,
}

impl std::fmt::Debug for StdinReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdinReader")
            .field(
                "read",
                &self.shared.word(READ_CURSOR).load(Ordering::Relaxed),
            )
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}

impl StdinReader {
    /// Read up to `max_bytes`, blocking the calling thread until input is
    /// available or the channel is closed.
    ///
    /// Unread bytes are always returned before [`StdinRead::EndOfStream`].
    /// Must not be called from the thread that would perform the unblocking
    /// write.
    pub fn read(&mut self, max_bytes: usize) -> StdinRead {
        if max_bytes == 0 {
            return StdinRead::Data(Vec::new());
        }

        loop {
            let seen = self.shared.word(SIGNAL).load(Ordering::Acquire);
            let write = self.shared.word(WRITE_CURSOR).load(Ordering::Acquire);
            let read = self.shared.word(READ_CURSOR).load(Ordering::Relaxed);

            if read < write {
                let end = read + max_bytes.min(write - read);
                let bytes = self.shared.copy_out(read..end);
                self.shared.word(READ_CURSOR).store(end, Ordering::Release);
                return StdinRead::Data(bytes);
            }
            if self.shared.is_closed() {
                return StdinRead::EndOfStream;
            }
            self.shared.wait(seen);
        }
    }

    /// Read whatever is available without blocking.
    ///
    /// Returns `None` when nothing is buffered and input is still open.
    pub fn try_read(&mut self, max_bytes: usize) -> Option<StdinRead> {
        let write = self.shared.word(WRITE_CURSOR).load(Ordering::Acquire);
        let read = self.shared.word(READ_CURSOR).load(Ordering::Relaxed);
        if read < write || self.shared.is_closed() {
            Some(self.read(max_bytes))
        } else {
            None
        }
    }

    /// A handle that can close the channel and read back what was written.
    pub fn control(&self) -> StdinControl {
        StdinControl {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl io::Read for StdinReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match StdinReader::read(self, buf.len()) {
            StdinRead::Data(bytes) => {
                buf[..bytes.len()].copy_from_slice(&bytes);
                Ok(bytes.len())
            }
            StdinRead::EndOfStream => Ok(0),
        }
    }
}

/// Out-of-band handle held by whoever owns the run.
///
/// Closing through the control handle is how a cancelled run releases a
/// worker blocked in [`StdinReader::read`]. It cannot write data.
#[derive(Clone)]
pub struct StdinControl {
    shared: Arc<SharedBuffer>,
}

impl std::fmt::Debug for StdinControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdinControl")
            .field("closed", &self.shared.is_closed())
            .finish_non_exhaustive()
    }
}

impl StdinControl {
    /// Signal end-of-input. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Whether end-of-input has been signaled.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Everything written to the channel so far, decoded lossily.
    pub fn written_text(&self) -> String {
        let end = self.shared.word(WRITE_CURSOR).load(Ordering::Acquire);
        String::from_utf8_lossy(&self.shared.copy_out(0..end)).into_owned()
    }
}
