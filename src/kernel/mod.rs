//! The kernel - processes, threads, pipes and sockets
//!
//! - One `Kernel` value owns every table; threads reach it through `Sys`
//! - Synchronous mental model, async implementation
//! - Small, auditable core

pub mod condvar;
pub mod config;
pub mod executor;
pub mod object;
pub mod pipe;
pub mod process;
pub mod socket;
pub mod syscall;
pub mod task;
pub mod thread;
pub mod timer;
pub mod trace;


pub use condvar::{CondVar, SchedCause, WaitOutcome};
pub use config::{ConfigError, KernelConfig};
pub use executor::{Executor, RunReport, SchedulerStats};
pub use object::{Handle, KernelObject, ObjectTable};
pub use pipe::{PIPE_BUFFER_SIZE, Pipe, PipeError};
pub use process::{Fd, IDLE, INIT, NOPROC, Pid, ProcessError, ProcessInfo, ProcessState};
pub use socket::{NOPORT, Port, ShutdownMode, SocketError};
pub use syscall::{Sys, SyscallError, SyscallResult};
pub use task::{Task, TaskId};
pub use thread::{ThreadError, Tid};
pub use trace::{KernelStats, TraceCategory, TraceEvent, TraceSummary};

use crate::console_log;
use process::ProcessTable;
use serde::Serialize;
use socket::PortMap;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use thread::Ptcb;
use trace::Tracer;

/// What a boot run produced
#[derive(Debug, Clone, Serialize)]
pub struct BootReport {
    /// Init's exit status, if it got to exit
    pub init_status: Option<i32>,
    /// Threads left blocked with nothing able to wake them
    pub stalled: usize,
    /// Virtual time at shutdown (ms)
    pub uptime: f64,
    pub stats: KernelStats,
}

/// The kernel manages all system state
pub struct Kernel {
    pub(crate) config: KernelConfig,
    pub(crate) exec: Executor,
    pub(crate) procs: RefCell<ProcessTable>,
    pub(crate) objects: RefCell<ObjectTable>,
    pub(crate) ports: RefCell<PortMap>,
    tracer: RefCell<Tracer>,
    next_tid: Cell<u64>,
    init_status: Cell<Option<i32>>,
    booted: Cell<bool>,
}

impl Kernel {
    /// Build a kernel from a validated configuration
    pub fn new(config: KernelConfig) -> Result<Rc<Self>, ConfigError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    pub fn with_defaults() -> Rc<Self> {
        Self::build(KernelConfig::default())
    }

    fn build(config: KernelConfig) -> Rc<Self> {
        let mut tracer = Tracer::new();
        if config.trace {
            tracer.enable();
        }

        Rc::new(Self {
            exec: Executor::new(),
            procs: RefCell::new(ProcessTable::new(config.max_processes)),
            objects: RefCell::new(ObjectTable::new()),
            ports: RefCell::new(PortMap::new(config.max_port)),
            tracer: RefCell::new(tracer),
            next_tid: Cell::new(1),
            init_status: Cell::new(None),
            booted: Cell::new(false),
            config,
        })
    }

    /// Create idle and init, run until the system goes quiet, then tear
    /// down whatever is left blocked.
    pub fn boot(self: &Rc<Self>, init: Task, args: &[u8]) -> BootReport {
        assert!(!self.booted.replace(true), "kernel booted twice");

        console_log!(
            "[kernel] boot: {} process slots, {} descriptors each, pipes of {} bytes",
            self.config.max_processes,
            self.config.max_fileid,
            self.config.pipe_buffer_size
        );

        let idle = self.procs.borrow_mut().acquire(self.config.max_fileid);
        assert_eq!(idle, Some(IDLE), "idle must take pid 0");
        self.with_stats(|s| s.process_spawned());
        self.trace(TraceCategory::Scheduler, "boot", IDLE, String::new);

        if let Err(e) = self.create_process(None, &init, args) {
            console_log!("[kernel] failed to start init: {}", e);
        }

        let run = self.exec.run();
        if run.stalled > 0 {
            console_log!(
                "[kernel] {} thread(s) blocked with nothing left to wake them",
                run.stalled
            );
        }
        self.exec.cancel_all();

        let sched = self.scheduler_stats();
        console_log!(
            "[kernel] halted after {} ticks, {} blocking waits",
            sched.tick_count,
            sched.total_blocked()
        );

        let init_status = self.init_status.get();
        console_log!("[kernel] init exited with status {:?}", init_status);

        BootReport {
            init_status,
            stalled: run.stalled,
            uptime: self.exec.now(),
            stats: self.stats(),
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn now(&self) -> f64 {
        self.exec.now()
    }

    /// Snapshot of every process in the table
    pub fn process_info(&self) -> Vec<ProcessInfo> {
        self.procs.borrow().iter().map(|p| p.info()).collect()
    }

    pub fn process_count(&self) -> usize {
        self.procs.borrow().len()
    }

    /// Open kernel objects (pipe ends and sockets)
    pub fn object_count(&self) -> usize {
        self.objects.borrow().len()
    }

    pub fn listening_ports(&self) -> Vec<Port> {
        self.ports.borrow().listening()
    }

    pub fn stats(&self) -> KernelStats {
        self.tracer.borrow().kernel.clone()
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.exec.stats()
    }

    pub fn trace_enable(&self) {
        self.tracer.borrow_mut().enable();
    }

    pub fn trace_events(&self) -> Vec<TraceEvent> {
        self.tracer.borrow().events().iter().cloned().collect()
    }

    pub fn trace_summary(&self) -> TraceSummary {
        self.tracer.borrow().summary(self.exec.now())
    }

    pub(crate) fn with_stats(&self, f: impl FnOnce(&mut KernelStats)) {
        f(&mut self.tracer.borrow_mut().kernel);
    }

    pub(crate) fn trace(
        &self,
        category: TraceCategory,
        name: &str,
        pid: Pid,
        detail: impl FnOnce() -> String,
    ) {
        let now = self.exec.now();
        self.tracer
            .borrow_mut()
            .trace_pid(now, category, name, pid.0, detail);
    }

    /// Acquire a PCB, link it under `parent` and start its main thread.
    ///
    /// Pids 0 and 1 are always parentless. Descriptors are inherited with
    /// their reference counts raised.
    pub(crate) fn create_process(
        self: &Rc<Self>,
        parent: Option<Pid>,
        task: &Task,
        args: &[u8],
    ) -> SyscallResult<Pid> {
        let pid = {
            let mut procs = self.procs.borrow_mut();
            let pid = procs
                .acquire(self.config.max_fileid)
                .ok_or(ProcessError::TableFull)?;
            let parent = parent.filter(|_| pid != IDLE && pid != INIT);

            if let Some(parent) = parent {
                procs.link_child(parent, pid);
                if let Some(files) = procs.get(parent).map(|p| p.files.clone()) {
                    let mut objects = self.objects.borrow_mut();
                    for handle in files.handles() {
                        objects.retain(handle);
                    }
                    procs.expect_mut(pid).files = files;
                }
            }

            let process = procs.expect_mut(pid);
            process.main_task = Some(task.clone());
            process.args = args.to_vec();
            pid
        };

        self.with_stats(|s| s.process_spawned());
        self.trace(TraceCategory::Process, "exec", pid, || {
            format!("argl={}", args.len())
        });

        // Last: the main thread may run as soon as the current one yields
        self.spawn_thread(pid, task, args.to_vec(), true);
        Ok(pid)
    }

    /// Register a PTCB and start its executor task.
    ///
    /// A main thread's return value goes through `exit` (and so becomes the
    /// process status); any other thread's goes through `thread_exit`.
    pub(crate) fn spawn_thread(
        self: &Rc<Self>,
        pid: Pid,
        task: &Task,
        args: Vec<u8>,
        main: bool,
    ) -> Tid {
        let tid = Tid(self.next_tid.get());
        self.next_tid.set(tid.0 + 1);

        {
            let mut procs = self.procs.borrow_mut();
            let process = procs.expect_mut(pid);
            process.threads.insert(tid, Ptcb::new(tid, args.len()));
            process.thread_count += 1;
        }

        let sys = Sys::new(self.clone(), pid, tid);
        let task = task.clone();
        let task_id = self.exec.spawn(async move {
            let code = task.start(sys.clone(), args).await;
            if main {
                sys.exit::<()>(code).await
            } else {
                sys.thread_exit::<()>(code).await
            }
        });

        if let Some(ptcb) = self
            .procs
            .borrow_mut()
            .get_mut(pid)
            .and_then(|p| p.threads.get_mut(&tid))
        {
            ptcb.task = Some(task_id);
        }

        self.with_stats(|s| s.threads_created += 1);
        self.trace(TraceCategory::Thread, "create", pid, || tid.to_string());
        tid
    }

    /// Thread exit bookkeeping. Returns true if it was the process's last.
    pub(crate) fn finish_thread(&self, pid: Pid, tid: Tid, code: i32) -> bool {
        let last = {
            let mut procs = self.procs.borrow_mut();
            let process = procs.expect_mut(pid);
            let Some(ptcb) = process.threads.get_mut(&tid) else {
                panic!("{} exiting but not registered in {}", tid, pid);
            };
            if ptcb.mark_exited(code) {
                process.threads.remove(&tid);
            }

            process.thread_count -= 1;
            let last = process.thread_count == 0;
            if last {
                // Nobody is left to join the remaining blocks
                process.threads.clear();
            }
            last
        };

        self.with_stats(|s| s.threads_exited += 1);
        self.trace(TraceCategory::Thread, "exit", pid, || {
            format!("{} value={}", tid, code)
        });
        last
    }

    /// Tear down a process whose last thread exited: drop its arguments and
    /// descriptors, hand its children to init, then turn it into a zombie
    /// on its parent's exited list (or free it if it has no parent).
    pub(crate) fn process_exit(&self, pid: Pid) {
        let (handles, parent, children, zombies, status) = {
            let mut procs = self.procs.borrow_mut();
            let process = procs.expect_mut(pid);
            process.args = Vec::new();
            process.main_task = None;
            (
                process.files.drain(),
                process.parent,
                std::mem::take(&mut process.children),
                std::mem::take(&mut process.exited),
                process.exit_status,
            )
        };

        for handle in handles {
            let _ = self.release_handle(handle);
        }

        let orphans = {
            let mut procs = self.procs.borrow_mut();
            let orphans = procs.reparent(pid, children, zombies);
            procs.expect_mut(pid).state = ProcessState::Zombie;

            match parent {
                Some(parent) => {
                    let p = procs.expect_mut(parent);
                    p.exited.push_back(pid);
                    p.child_exit.broadcast();
                }
                None => {
                    procs.release(pid);
                }
            }
            orphans
        };

        if pid == INIT {
            self.init_status.set(Some(status));
        }

        let live = self.procs.borrow().len() as u32;
        self.with_stats(|s| {
            s.processes_exited += 1;
            s.processes_reparented += orphans.adopted as u64;
            s.processes_reaped += orphans.freed as u64;
            if parent.is_none() {
                s.processes_reaped += 1;
            }
            s.current_process_count = live;
        });
        self.trace(TraceCategory::Process, "exit", pid, || {
            format!(
                "status={} adopted={} freed={}",
                status, orphans.adopted, orphans.freed
            )
        });
    }

    /// Collect a zombie child of `parent`
    pub(crate) fn reap(&self, parent: Pid, child: Pid) -> i32 {
        let status = self.procs.borrow_mut().reap(parent, child);
        self.with_stats(|s| s.process_released());
        self.trace(TraceCategory::Process, "reap", parent, || {
            format!("{} status={}", child, status)
        });
        status
    }

    /// Drop one descriptor reference; close the object on the last one
    pub(crate) fn release_handle(&self, handle: Handle) -> SyscallResult<()> {
        let object = self.objects.borrow_mut().release(handle);
        match object {
            Some(object) => object.close(&mut self.ports.borrow_mut()),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("processes", &self.process_count())
            .field("objects", &self.object_count())
            .field("now", &self.now())
            .finish()
    }
}
