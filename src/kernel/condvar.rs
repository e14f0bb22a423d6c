//! Condition variables - the kernel's only suspension point
//!
//! A thread waiting on a `CondVar` parks its task until someone broadcasts.
//! Broadcast wakes every waiter and promises no order among them; callers
//! always re-test their predicate after waking, so spurious wakeups are
//! harmless.
//!
//! Waits are classified by a `SchedCause` that only feeds diagnostics.

use super::executor::Executor;
use super::timer::TimerId;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

/// Why a thread is blocked (the scheduling class of its wait queue)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SchedCause {
    /// Waiting on another process (wait-child)
    User,
    /// Waiting on a pipe buffer
    Pipe,
    /// Waiting in accept or connect
    Socket,
    /// Waiting for a thread to exit
    Join,
    /// Generic I/O
    Io,
}

impl std::fmt::Display for SchedCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedCause::User => write!(f, "USER"),
            SchedCause::Pipe => write!(f, "PIPE"),
            SchedCause::Socket => write!(f, "SOCKET"),
            SchedCause::Join => write!(f, "JOIN"),
            SchedCause::Io => write!(f, "IO"),
        }
    }
}

/// How a timed wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Signaled,
    TimedOut,
}

#[derive(Default)]
struct CondVarInner {
    next_ticket: u64,
    /// Parked waiters; a ticket missing from the map has been signaled
    waiters: BTreeMap<u64, Waker>,
}

/// A condition variable. Clones share the same wait queue.
#[derive(Clone, Default)]
pub struct CondVar {
    inner: Rc<RefCell<CondVarInner>>,
}

impl CondVar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block the calling thread until the next broadcast
    pub fn wait(&self, exec: &Executor, cause: SchedCause) -> Wait {
        exec.note_block(cause);
        Wait {
            cv: self.clone(),
            ticket: None,
        }
    }

    /// Block until the next broadcast or until `timeout_ms` elapses
    pub fn timed_wait<'a>(
        &self,
        exec: &'a Executor,
        cause: SchedCause,
        timeout_ms: f64,
    ) -> TimedWait<'a> {
        exec.note_block(cause);
        TimedWait {
            wait: Wait {
                cv: self.clone(),
                ticket: None,
            },
            exec,
            deadline: exec.now() + timeout_ms.max(0.0),
            timer: None,
        }
    }

    /// Wake every waiter. Returns how many were parked.
    pub fn broadcast(&self) -> usize {
        let waiters = std::mem::take(&mut self.inner.borrow_mut().waiters);
        let count = waiters.len();
        for (_, waker) in waiters {
            waker.wake();
        }
        count
    }

    pub fn waiter_count(&self) -> usize {
        self.inner.borrow().waiters.len()
    }

    fn register(&self, waker: &Waker) -> u64 {
        let mut inner = self.inner.borrow_mut();
        let ticket = inner.next_ticket;
        inner.next_ticket += 1;
        inner.waiters.insert(ticket, waker.clone());
        ticket
    }

    /// Refresh the waker of a parked ticket; false once it was signaled
    fn still_parked(&self, ticket: u64, waker: &Waker) -> bool {
        match self.inner.borrow_mut().waiters.get_mut(&ticket) {
            Some(parked) => {
                if !parked.will_wake(waker) {
                    *parked = waker.clone();
                }
                true
            }
            None => false,
        }
    }

    fn withdraw(&self, ticket: u64) {
        self.inner.borrow_mut().waiters.remove(&ticket);
    }
}

impl std::fmt::Debug for CondVar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CondVar")
            .field("waiters", &self.waiter_count())
            .finish()
    }
}

/// Future returned by [`CondVar::wait`]
pub struct Wait {
    cv: CondVar,
    ticket: Option<u64>,
}

impl Future for Wait {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match self.ticket {
            None => {
                let ticket = self.cv.register(cx.waker());
                self.ticket = Some(ticket);
                Poll::Pending
            }
            Some(ticket) => {
                if self.cv.still_parked(ticket, cx.waker()) {
                    Poll::Pending
                } else {
                    self.ticket = None;
                    Poll::Ready(())
                }
            }
        }
    }
}

impl Drop for Wait {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.cv.withdraw(ticket);
        }
    }
}

/// Future returned by [`CondVar::timed_wait`]
pub struct TimedWait<'a> {
    wait: Wait,
    exec: &'a Executor,
    deadline: f64,
    timer: Option<TimerId>,
}

impl TimedWait<'_> {
    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            self.exec.cancel_timer(timer);
        }
    }
}

impl Future for TimedWait<'_> {
    type Output = WaitOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<WaitOutcome> {
        let this = &mut *self;

        match this.wait.ticket {
            None => {
                this.wait.ticket = Some(this.wait.cv.register(cx.waker()));
                if let Some(task_id) = this.exec.current() {
                    let delay = this.deadline - this.exec.now();
                    this.timer = Some(this.exec.set_timer(delay, task_id));
                }
            }
            Some(ticket) => {
                if !this.wait.cv.still_parked(ticket, cx.waker()) {
                    this.wait.ticket = None;
                    this.disarm();
                    return Poll::Ready(WaitOutcome::Signaled);
                }
            }
        }

        if this.exec.now() >= this.deadline {
            if let Some(ticket) = this.wait.ticket.take() {
                this.wait.cv.withdraw(ticket);
            }
            this.disarm();
            return Poll::Ready(WaitOutcome::TimedOut);
        }

        Poll::Pending
    }
}

impl Drop for TimedWait<'_> {
    fn drop(&mut self) {
        self.disarm();
    }
}
