//! Task abstraction
//!
//! A `TaskId` names one schedulable unit in the executor; every kernel
//! thread is backed by exactly one task. A `Task` is the entry point a
//! process or thread starts in: it receives the thread's syscall handle and
//! a private copy of its argument bytes, and resolves to an exit value.

use super::syscall::Sys;
use futures::future::LocalBoxFuture;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

/// Unique identifier for an executor task
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// A boxed future representing a spawned task
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + 'static>>;

/// Entry point of a process main thread or a secondary thread.
///
/// Cloning is cheap; the same entry point may be started many times.
#[derive(Clone)]
pub struct Task(Rc<dyn Fn(Sys, Vec<u8>) -> LocalBoxFuture<'static, i32>>);

impl Task {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Sys, Vec<u8>) -> Fut + 'static,
        Fut: Future<Output = i32> + 'static,
    {
        Task(Rc::new(move |sys, args| Box::pin(f(sys, args))))
    }

    /// Build the future for one run of this entry point
    pub fn start(&self, sys: Sys, args: Vec<u8>) -> LocalBoxFuture<'static, i32> {
        (self.0)(sys, args)
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Task({:p})", Rc::as_ptr(&self.0))
    }
}
