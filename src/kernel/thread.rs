//! Thread control blocks
//!
//! Each thread of a process is described by a `Ptcb` kept in its owning
//! process's thread map. The reference count covers the thread's own
//! existence plus every joiner currently blocked on it; the block is
//! dropped from the map when the count reaches zero.

use super::condvar::CondVar;
use super::task::TaskId;

/// Thread identifier, unique for the lifetime of the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tid(pub u64);

impl std::fmt::Display for Tid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tid:{}", self.0)
    }
}

/// Thread registry errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadError {
    /// No such thread in the calling process (or it was already joined)
    InvalidTid,
    /// A thread cannot join itself
    JoinSelf,
    /// The target is detached, or was detached while we waited
    Detached,
    /// The target already exited and can no longer be detached
    AlreadyExited,
    /// The process has no live threads left to host a new one
    ProcessExiting,
}

impl std::fmt::Display for ThreadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThreadError::InvalidTid => write!(f, "invalid thread id"),
            ThreadError::JoinSelf => write!(f, "thread cannot join itself"),
            ThreadError::Detached => write!(f, "thread is detached"),
            ThreadError::AlreadyExited => write!(f, "thread already exited"),
            ThreadError::ProcessExiting => write!(f, "process is exiting"),
        }
    }
}

impl std::error::Error for ThreadError {}

/// Per-thread control block
#[derive(Debug)]
pub struct Ptcb {
    pub tid: Tid,
    /// Executor task running this thread
    pub task: Option<TaskId>,
    /// Length of the argument buffer the thread was started with
    pub argl: usize,
    pub exited: bool,
    pub detached: bool,
    /// A join has collected the exit value
    pub reaped: bool,
    pub exitval: i32,
    /// Self reference + blocked joiners
    pub refcount: usize,
    /// Broadcast on exit and on detach
    pub exit_cv: CondVar,
}

impl Ptcb {
    pub fn new(tid: Tid, argl: usize) -> Self {
        Self {
            tid,
            task: None,
            argl,
            exited: false,
            detached: false,
            reaped: false,
            exitval: 0,
            refcount: 1,
            exit_cv: CondVar::new(),
        }
    }

    /// Whether a new join may attach
    pub fn joinable(&self) -> Result<(), ThreadError> {
        if self.detached {
            Err(ThreadError::Detached)
        } else if self.reaped {
            Err(ThreadError::InvalidTid)
        } else {
            Ok(())
        }
    }

    /// A blocked joiner may stop waiting
    pub fn settled(&self) -> bool {
        self.exited || self.detached
    }

    /// Record the exit value and wake joiners. Returns true if the block
    /// is now unreferenced.
    pub fn mark_exited(&mut self, exitval: i32) -> bool {
        self.exited = true;
        self.exitval = exitval;
        self.exit_cv.broadcast();
        if self.detached {
            // Nobody can collect the value; drop our own reference
            self.release()
        } else {
            false
        }
    }

    pub fn detach(&mut self) -> Result<(), ThreadError> {
        if self.exited {
            return Err(ThreadError::AlreadyExited);
        }
        self.detached = true;
        self.exit_cv.broadcast();
        Ok(())
    }

    /// Outcome for a joiner that observed `settled()`; drops the thread's
    /// self reference on the first successful collection.
    pub fn collect(&mut self) -> Result<i32, ThreadError> {
        if self.detached {
            return Err(ThreadError::Detached);
        }
        if !self.reaped {
            self.reaped = true;
            self.release();
        }
        Ok(self.exitval)
    }

    /// Drop one reference. Returns true when none remain.
    pub fn release(&mut self) -> bool {
        assert!(self.refcount > 0, "PTCB {} refcount underflow", self.tid);
        self.refcount -= 1;
        self.refcount == 0
    }
}
