//! System call interface
//!
//! Every kernel thread receives a `Sys` handle naming the kernel, its
//! process and itself. All process, thread and IPC operations go through it;
//! there is no global "current process".
//!
//! Blocking calls are `async`: they suspend the calling thread on a
//! condition variable and let the executor run others. Non-blocking calls
//! complete without yielding, so they are atomic with respect to every
//! other thread.

use super::Kernel;
use super::condvar::{CondVar, SchedCause};
use super::executor::Executor;
use super::object::KernelObject;
use super::pipe::{Pipe, PipeError};
use super::process::{Fd, NOPROC, INIT, Pid, Process, ProcessError, ProcessInfo, ProcessState};
use super::socket::{Port, ShutdownMode, Socket, SocketError};
use super::task::Task;
use super::thread::{ThreadError, Tid};
use super::trace::{KernelStats, TraceCategory};
use std::rc::Rc;

/// System call errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyscallError {
    /// Descriptor not open, or open in the wrong direction
    BadFd,
    /// Descriptor does not name a socket
    NotSocket,
    /// No free descriptor slot
    TooManyFiles,
    /// The calling process is gone
    NoProcess,
    Process(ProcessError),
    Thread(ThreadError),
    Pipe(PipeError),
    Socket(SocketError),
}

impl std::fmt::Display for SyscallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyscallError::BadFd => write!(f, "bad file descriptor"),
            SyscallError::NotSocket => write!(f, "not a socket"),
            SyscallError::TooManyFiles => write!(f, "too many open files"),
            SyscallError::NoProcess => write!(f, "no such process"),
            SyscallError::Process(e) => write!(f, "process error: {}", e),
            SyscallError::Thread(e) => write!(f, "thread error: {}", e),
            SyscallError::Pipe(e) => write!(f, "pipe error: {}", e),
            SyscallError::Socket(e) => write!(f, "socket error: {}", e),
        }
    }
}

impl std::error::Error for SyscallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyscallError::Process(e) => Some(e),
            SyscallError::Thread(e) => Some(e),
            SyscallError::Pipe(e) => Some(e),
            SyscallError::Socket(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProcessError> for SyscallError {
    fn from(e: ProcessError) -> Self {
        SyscallError::Process(e)
    }
}

impl From<ThreadError> for SyscallError {
    fn from(e: ThreadError) -> Self {
        SyscallError::Thread(e)
    }
}

impl From<PipeError> for SyscallError {
    fn from(e: PipeError) -> Self {
        SyscallError::Pipe(e)
    }
}

impl From<SocketError> for SyscallError {
    fn from(e: SocketError) -> Self {
        SyscallError::Socket(e)
    }
}

pub type SyscallResult<T> = Result<T, SyscallError>;

/// A thread's handle on the kernel
#[derive(Clone)]
pub struct Sys {
    kernel: Rc<Kernel>,
    pid: Pid,
    tid: Tid,
}

impl std::fmt::Debug for Sys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sys")
            .field("pid", &self.pid)
            .field("tid", &self.tid)
            .finish()
    }
}

impl Sys {
    pub(crate) fn new(kernel: Rc<Kernel>, pid: Pid, tid: Tid) -> Self {
        Self { kernel, pid, tid }
    }

    pub fn kernel(&self) -> &Rc<Kernel> {
        &self.kernel
    }

    fn executor(&self) -> &Executor {
        &self.kernel.exec
    }

    /// Count failures before handing a result back
    fn track<T>(&self, result: SyscallResult<T>) -> SyscallResult<T> {
        if result.is_err() {
            self.kernel.with_stats(|s| s.syscall_errors += 1);
        }
        result
    }

    fn with_process<R>(&self, f: impl FnOnce(&mut Process) -> R) -> SyscallResult<R> {
        let mut procs = self.kernel.procs.borrow_mut();
        let process = procs.get_mut(self.pid).ok_or(SyscallError::NoProcess)?;
        Ok(f(process))
    }

    // ========== Processes ==========

    /// Start a child process running `task` with a private copy of `args`.
    /// The child inherits every open descriptor.
    pub fn exec(&self, task: &Task, args: &[u8]) -> SyscallResult<Pid> {
        let result = self.kernel.create_process(Some(self.pid), task, args);
        self.track(result)
    }

    /// Terminate the calling thread with `code` as the process status.
    ///
    /// The process becomes a zombie when its last thread is gone. Init first
    /// collects every child it still has. Never returns.
    pub async fn exit<T>(&self, code: i32) -> T {
        if self.pid == INIT {
            while self.wait_child_inner(None).await.is_ok() {}
        }
        let _ = self.with_process(|p| p.exit_status = code);
        self.thread_exit(code).await
    }

    /// Wait for a child to exit and collect its status.
    ///
    /// `None` waits for any child, returning children in exit order.
    pub async fn wait_child(&self, target: Option<Pid>) -> SyscallResult<(Pid, i32)> {
        let result = self.wait_child_inner(target).await;
        self.track(result)
    }

    async fn wait_child_inner(&self, target: Option<Pid>) -> SyscallResult<(Pid, i32)> {
        loop {
            let child_exit = {
                let procs = self.kernel.procs.borrow();
                let me = procs.get(self.pid).ok_or(SyscallError::NoProcess)?;

                let ready = match target {
                    Some(child) => {
                        // A sibling thread may have reaped it while we slept
                        if !me.children.contains(&child) {
                            return Err(ProcessError::NotAChild(child).into());
                        }
                        procs.get(child).is_some_and(|c| c.is_zombie()).then_some(child)
                    }
                    None => {
                        if me.children.is_empty() {
                            return Err(ProcessError::NoChildren.into());
                        }
                        me.exited.front().copied()
                    }
                };

                if let Some(child) = ready {
                    drop(procs);
                    let status = self.kernel.reap(self.pid, child);
                    return Ok((child, status));
                }
                me.child_exit.clone()
            };

            child_exit.wait(self.executor(), SchedCause::User).await;
        }
    }

    pub fn get_pid(&self) -> Pid {
        self.pid
    }

    /// Parent pid, or `NOPROC` for parentless processes
    pub fn get_ppid(&self) -> Pid {
        self.kernel
            .procs
            .borrow()
            .get(self.pid)
            .and_then(|p| p.parent)
            .unwrap_or(NOPROC)
    }

    /// Snapshot of every process in the table
    pub fn process_info(&self) -> Vec<ProcessInfo> {
        self.kernel.process_info()
    }

    /// Current virtual time in milliseconds
    pub fn now(&self) -> f64 {
        self.kernel.exec.now()
    }

    /// Block the calling thread for `ms` of virtual time
    pub async fn sleep(&self, ms: f64) {
        CondVar::new()
            .timed_wait(self.executor(), SchedCause::Io, ms)
            .await;
    }

    // ========== Threads ==========

    /// Start another thread in the calling process
    pub fn create_thread(&self, task: &Task, args: &[u8]) -> SyscallResult<Tid> {
        let result = self.create_thread_inner(task, args);
        self.track(result)
    }

    fn create_thread_inner(&self, task: &Task, args: &[u8]) -> SyscallResult<Tid> {
        let can_host = self.with_process(|p| p.state == ProcessState::Alive && p.thread_count > 0)?;
        if !can_host {
            return Err(ThreadError::ProcessExiting.into());
        }
        Ok(self.kernel.spawn_thread(self.pid, task, args.to_vec(), false))
    }

    pub fn thread_self(&self) -> Tid {
        self.tid
    }

    /// Wait for a thread of this process to exit and collect its value
    pub async fn thread_join(&self, tid: Tid) -> SyscallResult<i32> {
        let result = self.thread_join_inner(tid).await;
        self.track(result)
    }

    async fn thread_join_inner(&self, tid: Tid) -> SyscallResult<i32> {
        if tid == self.tid {
            return Err(ThreadError::JoinSelf.into());
        }

        let exit_cv = self.with_process(|p| {
            let ptcb = p.threads.get_mut(&tid).ok_or(ThreadError::InvalidTid)?;
            ptcb.joinable()?;
            ptcb.refcount += 1;
            Ok::<_, ThreadError>(ptcb.exit_cv.clone())
        })??;

        loop {
            let settled = self.with_process(|p| p.threads.get(&tid).is_none_or(|t| t.settled()))?;
            if settled {
                break;
            }
            exit_cv.wait(self.executor(), SchedCause::Join).await;
        }

        self.with_process(|p| {
            let ptcb = p.threads.get_mut(&tid).ok_or(ThreadError::InvalidTid)?;
            let outcome = ptcb.collect();
            if ptcb.release() {
                p.threads.remove(&tid);
            }
            outcome
        })?
        .map_err(SyscallError::from)
    }

    /// Make a thread unjoinable. Joiners already waiting fail.
    pub fn thread_detach(&self, tid: Tid) -> SyscallResult<()> {
        if tid == self.tid {
            return Ok(());
        }
        let result = self
            .with_process(|p| match p.threads.get_mut(&tid) {
                Some(ptcb) => ptcb.detach(),
                None => Err(ThreadError::InvalidTid),
            })
            .and_then(|r| r.map_err(SyscallError::from));
        self.track(result)
    }

    /// Terminate the calling thread. The last thread out takes the process
    /// down with it. Never returns.
    pub async fn thread_exit<T>(&self, code: i32) -> T {
        if self.kernel.finish_thread(self.pid, self.tid, code) {
            self.kernel.process_exit(self.pid);
        }
        if let Some(task) = self.kernel.exec.current() {
            self.kernel.exec.retire(task);
        }
        std::future::pending::<T>().await
    }

    // ========== Descriptors ==========

    /// Look up the object behind a descriptor
    fn object(&self, fd: Fd) -> SyscallResult<KernelObject> {
        let handle = self
            .with_process(|p| p.files.get(fd))?
            .ok_or(SyscallError::BadFd)?;
        self.kernel
            .objects
            .borrow()
            .get(handle)
            .cloned()
            .ok_or(SyscallError::BadFd)
    }

    fn socket_of(&self, fd: Fd) -> SyscallResult<Rc<Socket>> {
        match self.object(fd)? {
            KernelObject::Socket(sock) => Ok(sock),
            _ => Err(SyscallError::NotSocket),
        }
    }

    /// Claim free descriptors and install fresh objects in them
    fn install(&self, objects: Vec<KernelObject>) -> SyscallResult<Vec<Fd>> {
        let mut procs = self.kernel.procs.borrow_mut();
        let process = procs.get_mut(self.pid).ok_or(SyscallError::NoProcess)?;
        let fds = process
            .files
            .reserve(objects.len())
            .ok_or(SyscallError::TooManyFiles)?;

        let mut table = self.kernel.objects.borrow_mut();
        for (&fd, object) in fds.iter().zip(objects) {
            process.files.install(fd, table.insert(object));
        }
        Ok(fds)
    }

    /// Read from a pipe reader or connected socket
    pub async fn read(&self, fd: Fd, buf: &mut [u8]) -> SyscallResult<usize> {
        let result = match self.object(fd) {
            Ok(object) => object.read(self.executor(), buf).await,
            Err(e) => Err(e),
        };
        if let Ok(n) = result {
            self.kernel.with_stats(|s| s.bytes_read += n as u64);
        }
        self.track(result)
    }

    /// Write to a pipe writer or connected socket
    pub async fn write(&self, fd: Fd, data: &[u8]) -> SyscallResult<usize> {
        let result = match self.object(fd) {
            Ok(object) => object.write(self.executor(), data).await,
            Err(e) => Err(e),
        };
        if let Ok(n) = result {
            self.kernel.with_stats(|s| s.bytes_written += n as u64);
        }
        self.track(result)
    }

    /// Close a descriptor; the object closes with its last descriptor
    pub fn close(&self, fd: Fd) -> SyscallResult<()> {
        let result = self
            .with_process(|p| p.files.remove(fd))
            .and_then(|h| h.ok_or(SyscallError::BadFd))
            .and_then(|handle| self.kernel.release_handle(handle));
        self.track(result)
    }

    // ========== Pipes ==========

    /// Create a pipe, returning (read end, write end)
    pub fn pipe(&self) -> SyscallResult<(Fd, Fd)> {
        let pipe = Rc::new(Pipe::new(self.kernel.config.pipe_buffer_size));
        let result = self
            .install(vec![
                KernelObject::PipeReader(pipe.clone()),
                KernelObject::PipeWriter(pipe),
            ])
            .map(|fds| (fds[0], fds[1]));

        if let Ok((r, w)) = result {
            self.kernel.with_stats(|s| s.pipes_created += 1);
            self.kernel.trace(TraceCategory::Pipe, "pipe", self.pid, || {
                format!("{} {}", r, w)
            });
        }
        self.track(result)
    }

    // ========== Sockets ==========

    /// Create an unbound socket on `port` (`NOPORT` for a pure client)
    pub fn socket(&self, port: Port) -> SyscallResult<Fd> {
        let result = self
            .kernel
            .ports
            .borrow()
            .validate(port)
            .map_err(SyscallError::from)
            .and_then(|_| self.install(vec![KernelObject::Socket(Socket::new(port))]))
            .map(|fds| fds[0]);

        if result.is_ok() {
            self.kernel.with_stats(|s| s.sockets_created += 1);
        }
        self.track(result)
    }

    /// Make a socket the listener of its port
    pub fn listen(&self, fd: Fd) -> SyscallResult<()> {
        let result = self.socket_of(fd).and_then(|sock| {
            sock.listen(&mut self.kernel.ports.borrow_mut())?;
            self.kernel.trace(TraceCategory::Socket, "listen", self.pid, || {
                format!("port={}", sock.port())
            });
            Ok(())
        });
        self.track(result)
    }

    /// Wait for a connection on a listener; returns the new peer descriptor
    pub async fn accept(&self, fd: Fd) -> SyscallResult<Fd> {
        let result = self.accept_inner(fd).await;
        self.track(result)
    }

    async fn accept_inner(&self, fd: Fd) -> SyscallResult<Fd> {
        let listener = self.socket_of(fd)?;
        if !listener.is_listener() {
            return Err(SocketError::NotListener.into());
        }

        loop {
            listener.wait_request(self.executor()).await?;

            // Claim the descriptor before admitting, so a full table leaves
            // the request queued
            let free = self.with_process(|p| p.files.reserve(1).is_some())?;
            if !free {
                return Err(SyscallError::TooManyFiles);
            }
            let Some(server) = listener.admit_next(self.kernel.config.pipe_buffer_size) else {
                continue;
            };

            let port = server.port();
            let fds = self.install(vec![KernelObject::Socket(server)])?;
            self.kernel.with_stats(|s| s.connections_accepted += 1);
            self.kernel.trace(TraceCategory::Socket, "accept", self.pid, || {
                format!("port={} {}", port, fds[0])
            });
            return Ok(fds[0]);
        }
    }

    /// Connect an unbound socket to the listener on `port`
    pub async fn connect(&self, fd: Fd, port: Port, timeout_ms: f64) -> SyscallResult<()> {
        let result = match self.socket_of(fd) {
            Ok(sock) => sock
                .connect(self.executor(), &self.kernel.ports, port, timeout_ms)
                .await
                .map_err(SyscallError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            let timed_out = *e == SyscallError::Socket(SocketError::TimedOut);
            self.kernel.with_stats(|s| {
                s.connections_failed += 1;
                if timed_out {
                    s.connect_timeouts += 1;
                }
            });
            self.kernel.trace(TraceCategory::Socket, "connect-failed", self.pid, || {
                format!("port={} {}", port, e)
            });
        }
        self.track(result)
    }

    /// Close one or both directions of a connected socket
    pub fn shutdown(&self, fd: Fd, mode: ShutdownMode) -> SyscallResult<()> {
        let result = self
            .socket_of(fd)
            .and_then(|sock| sock.shutdown(mode).map_err(SyscallError::from));
        self.track(result)
    }

    /// Kernel-wide counters
    pub fn stats(&self) -> KernelStats {
        self.kernel.stats()
    }
}
