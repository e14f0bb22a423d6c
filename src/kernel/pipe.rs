//! Pipes - bounded single-producer/single-consumer byte streams
//!
//! A pipe is a fixed-capacity ring buffer with one reader end and one writer
//! end. Readers block while the buffer is empty and a writer still exists;
//! writers block while it is full and a reader still exists.
//!
//! Closing is per end:
//! - closing the writer lets the reader drain what is buffered, then read 0
//! - closing the reader makes any pending or future write fail
//! - the control block is released only once both ends are closed

use super::condvar::{CondVar, SchedCause};
use super::executor::Executor;
use std::cell::RefCell;

/// Default pipe capacity in bytes
pub const PIPE_BUFFER_SIZE: usize = 8192;

/// Pipe error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipeError {
    /// Zero-length read or write
    InvalidArgument,
    /// The reader end is closed (reading, or closing it twice)
    ReaderClosed,
    /// The writer end is closed (writing, or closing it twice)
    WriterClosed,
    /// No reader left to consume the data (SIGPIPE condition)
    BrokenPipe,
}

impl std::fmt::Display for PipeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipeError::InvalidArgument => write!(f, "invalid transfer size"),
            PipeError::ReaderClosed => write!(f, "pipe reader closed"),
            PipeError::WriterClosed => write!(f, "pipe writer closed"),
            PipeError::BrokenPipe => write!(f, "broken pipe"),
        }
    }
}

impl std::error::Error for PipeError {}

pub type PipeResult<T> = Result<T, PipeError>;

/// Circular byte buffer. `count` alone decides full vs empty; the cursors
/// are equal in both cases.
#[derive(Debug)]
pub struct RingBuffer {
    buf: Box<[u8]>,
    r_pos: usize,
    w_pos: usize,
    count: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            r_pos: 0,
            w_pos: 0,
            count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.buf.len()
    }

    /// Copy as many bytes of `data` as fit; returns how many were taken
    pub fn push_from(&mut self, data: &[u8]) -> usize {
        let mut taken = 0;
        for &byte in data {
            if self.is_full() {
                break;
            }
            self.buf[self.w_pos] = byte;
            self.w_pos = (self.w_pos + 1) % self.buf.len();
            self.count += 1;
            taken += 1;
        }
        taken
    }

    /// Fill `out` from the buffer; returns how many bytes were copied
    pub fn pop_into(&mut self, out: &mut [u8]) -> usize {
        let mut copied = 0;
        for slot in out.iter_mut() {
            if self.is_empty() {
                break;
            }
            *slot = self.buf[self.r_pos];
            self.r_pos = (self.r_pos + 1) % self.buf.len();
            self.count -= 1;
            copied += 1;
        }
        copied
    }
}

#[derive(Debug)]
struct PipeState {
    ring: RingBuffer,
    reader_open: bool,
    writer_open: bool,
}

/// What a blocked transfer should do after inspecting the buffer
enum Step {
    Progress,
    Finished,
    Block,
}

/// The pipe control block, shared by its reader and writer ends
#[derive(Debug)]
pub struct Pipe {
    state: RefCell<PipeState>,
    has_data: CondVar,
    has_space: CondVar,
}

impl Pipe {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: RefCell::new(PipeState {
                ring: RingBuffer::new(capacity.max(1)),
                reader_open: true,
                writer_open: true,
            }),
            has_data: CondVar::new(),
            has_space: CondVar::new(),
        }
    }

    /// Read exactly `buf.len()` bytes, or fewer if the writer closes.
    ///
    /// Returns 0 at end-of-stream (writer closed, buffer drained).
    pub async fn read(&self, exec: &Executor, buf: &mut [u8]) -> PipeResult<usize> {
        if buf.is_empty() {
            return Err(PipeError::InvalidArgument);
        }
        if !self.state.borrow().reader_open {
            return Err(PipeError::ReaderClosed);
        }

        let mut count = 0;
        while count < buf.len() {
            let step = {
                let mut state = self.state.borrow_mut();
                if !state.reader_open {
                    // Our own end was closed while we slept
                    Step::Finished
                } else if !state.ring.is_empty() {
                    count += state.ring.pop_into(&mut buf[count..]);
                    Step::Progress
                } else if !state.writer_open {
                    Step::Finished
                } else {
                    Step::Block
                }
            };

            match step {
                Step::Progress => {}
                Step::Finished => break,
                Step::Block => {
                    // A writer may be parked on a full buffer we just drained
                    self.has_space.broadcast();
                    self.has_data.wait(exec, SchedCause::Pipe).await;
                }
            }
        }

        self.has_space.broadcast();
        Ok(count)
    }

    /// Write all of `data`, blocking while the buffer is full.
    ///
    /// Fails with `BrokenPipe` if the reader closes before everything is
    /// buffered; a short write never reports success.
    pub async fn write(&self, exec: &Executor, data: &[u8]) -> PipeResult<usize> {
        if data.is_empty() {
            return Err(PipeError::InvalidArgument);
        }

        let mut written = 0;
        while written < data.len() {
            let step = {
                let mut state = self.state.borrow_mut();
                if !state.writer_open {
                    return Err(PipeError::WriterClosed);
                }
                if !state.reader_open {
                    return Err(PipeError::BrokenPipe);
                }
                let n = state.ring.push_from(&data[written..]);
                written += n;
                if n > 0 { Step::Progress } else { Step::Block }
            };

            if let Step::Block = step {
                self.has_data.broadcast();
                self.has_space.wait(exec, SchedCause::Pipe).await;
            }
        }

        self.has_data.broadcast();
        Ok(written)
    }

    /// Close the reader end. Returns true if the pipe is now fully released.
    pub fn close_reader(&self) -> PipeResult<bool> {
        let released = {
            let mut state = self.state.borrow_mut();
            if !state.reader_open {
                return Err(PipeError::ReaderClosed);
            }
            state.reader_open = false;
            !state.writer_open
        };
        self.has_space.broadcast();
        Ok(released)
    }

    /// Close the writer end. Returns true if the pipe is now fully released.
    pub fn close_writer(&self) -> PipeResult<bool> {
        let released = {
            let mut state = self.state.borrow_mut();
            if !state.writer_open {
                return Err(PipeError::WriterClosed);
            }
            state.writer_open = false;
            !state.reader_open
        };
        self.has_data.broadcast();
        Ok(released)
    }

    pub fn reader_open(&self) -> bool {
        self.state.borrow().reader_open
    }

    pub fn writer_open(&self) -> bool {
        self.state.borrow().writer_open
    }

    /// Both ends closed; nothing may touch the buffer again
    pub fn is_released(&self) -> bool {
        let state = self.state.borrow();
        !state.reader_open && !state.writer_open
    }

    /// Bytes currently buffered
    pub fn available(&self) -> usize {
        self.state.borrow().ring.len()
    }

    pub fn capacity(&self) -> usize {
        self.state.borrow().ring.capacity()
    }
}
