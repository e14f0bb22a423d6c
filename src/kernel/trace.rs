//! Instrumentation and Tracing
//!
//! Design:
//! - Lightweight event tracing stamped with the executor's virtual clock
//! - Counters for process, thread and IPC activity
//! - Ring buffer for recent events (bounded memory)
//! - Disabled by default; a disabled tracer records counters only

use serde::Serialize;
use std::collections::VecDeque;

/// Maximum number of events to keep in the trace buffer
const TRACE_BUFFER_SIZE: usize = 1000;

/// Trace event categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TraceCategory {
    /// Process lifecycle (exec, exit, reap, reparent)
    Process,
    /// Thread lifecycle (create, join, detach, exit)
    Thread,
    /// Pipe creation and teardown
    Pipe,
    /// Socket listen/connect/accept/shutdown
    Socket,
    /// Boot and scheduling milestones
    Scheduler,
}

impl std::fmt::Display for TraceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceCategory::Process => write!(f, "PROCESS"),
            TraceCategory::Thread => write!(f, "THREAD"),
            TraceCategory::Pipe => write!(f, "PIPE"),
            TraceCategory::Socket => write!(f, "SOCKET"),
            TraceCategory::Scheduler => write!(f, "SCHED"),
        }
    }
}

/// A single trace event
#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    /// Virtual time in milliseconds
    pub timestamp: f64,
    pub category: TraceCategory,
    pub name: String,
    pub detail: Option<String>,
    /// Process the event concerns, if any
    pub pid: Option<u32>,
}

impl TraceEvent {
    pub fn instant(timestamp: f64, category: TraceCategory, name: impl Into<String>) -> Self {
        Self {
            timestamp,
            category,
            name: name.into(),
            detail: None,
            pid: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }
}

impl std::fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:>10.3}] {:<7} {}", self.timestamp, self.category, self.name)?;
        if let Some(pid) = self.pid {
            write!(f, " pid={}", pid)?;
        }
        if let Some(detail) = &self.detail {
            write!(f, " {}", detail)?;
        }
        Ok(())
    }
}

/// Kernel-wide counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KernelStats {
    pub processes_spawned: u64,
    pub processes_exited: u64,
    /// Zombies collected by wait-child (or released parentless)
    pub processes_reaped: u64,
    /// Children handed to init because their parent exited
    pub processes_reparented: u64,
    /// Live process count (zombies included)
    pub current_process_count: u32,
    pub peak_process_count: u32,
    pub threads_created: u64,
    pub threads_exited: u64,
    pub pipes_created: u64,
    pub sockets_created: u64,
    pub connections_accepted: u64,
    /// Every failed connect, timeouts included
    pub connections_failed: u64,
    /// Connects that gave up waiting for accept
    pub connect_timeouts: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// System calls that returned an error
    pub syscall_errors: u64,
}

impl KernelStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process_spawned(&mut self) {
        self.processes_spawned += 1;
        self.current_process_count += 1;
        if self.current_process_count > self.peak_process_count {
            self.peak_process_count = self.current_process_count;
        }
    }

    pub fn process_released(&mut self) {
        self.processes_reaped += 1;
        self.current_process_count = self.current_process_count.saturating_sub(1);
    }
}

/// Event ring buffer plus counters
#[derive(Debug)]
pub struct Tracer {
    enabled: bool,
    /// Category filter (None = all)
    filter: Option<Vec<TraceCategory>>,
    events: VecDeque<TraceEvent>,
    /// Events pushed out of the ring buffer
    dropped: u64,
    pub kernel: KernelStats,
}

impl Tracer {
    pub fn new() -> Self {
        Self {
            enabled: false,
            filter: None,
            events: VecDeque::with_capacity(TRACE_BUFFER_SIZE),
            dropped: 0,
            kernel: KernelStats::new(),
        }
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Set category filter (None = trace all)
    pub fn set_filter(&mut self, categories: Option<Vec<TraceCategory>>) {
        self.filter = categories;
    }

    fn should_trace(&self, category: TraceCategory) -> bool {
        if !self.enabled {
            return false;
        }
        match &self.filter {
            None => true,
            Some(cats) => cats.contains(&category),
        }
    }

    /// Record a trace event
    pub fn trace(&mut self, event: TraceEvent) {
        if !self.should_trace(event.category) {
            return;
        }

        if self.events.len() >= TRACE_BUFFER_SIZE {
            self.events.pop_front();
            self.dropped += 1;
        }
        self.events.push_back(event);
    }

    /// Trace an event about one process
    pub fn trace_pid(
        &mut self,
        timestamp: f64,
        category: TraceCategory,
        name: &str,
        pid: u32,
        detail: impl FnOnce() -> String,
    ) {
        if self.should_trace(category) {
            self.trace(
                TraceEvent::instant(timestamp, category, name)
                    .with_pid(pid)
                    .with_detail(detail()),
            );
        }
    }

    pub fn events(&self) -> &VecDeque<TraceEvent> {
        &self.events
    }

    pub fn events_by_category(&self, category: TraceCategory) -> Vec<&TraceEvent> {
        self.events
            .iter()
            .filter(|e| e.category == category)
            .collect()
    }

    pub fn events_by_pid(&self, pid: u32) -> Vec<&TraceEvent> {
        self.events
            .iter()
            .filter(|e| e.pid == Some(pid))
            .collect()
    }

    pub fn summary(&self, now: f64) -> TraceSummary {
        TraceSummary {
            uptime: now,
            enabled: self.is_enabled(),
            event_count: self.events.len(),
            events_dropped: self.dropped,
            stats: self.kernel.clone(),
        }
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of trace state and counters
#[derive(Debug, Clone, Serialize)]
pub struct TraceSummary {
    pub uptime: f64,
    pub enabled: bool,
    pub event_count: usize,
    pub events_dropped: u64,
    pub stats: KernelStats,
}

impl std::fmt::Display for TraceSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = &self.stats;
        writeln!(f, "=== Kernel Statistics ===")?;
        writeln!(f, "Uptime: {:.2}s", self.uptime / 1000.0)?;
        writeln!(f, "Tracing: {}", if self.enabled { "ON" } else { "OFF" })?;
        writeln!(
            f,
            "Events buffered: {} ({} dropped)",
            self.event_count, self.events_dropped
        )?;
        writeln!(f)?;
        writeln!(f, "--- Processes ---")?;
        writeln!(f, "Spawned: {}", s.processes_spawned)?;
        writeln!(f, "Exited: {}", s.processes_exited)?;
        writeln!(f, "Reaped: {}", s.processes_reaped)?;
        writeln!(f, "Reparented: {}", s.processes_reparented)?;
        writeln!(f, "Peak: {}", s.peak_process_count)?;
        writeln!(f)?;
        writeln!(f, "--- Threads ---")?;
        writeln!(f, "Created: {}", s.threads_created)?;
        writeln!(f, "Exited: {}", s.threads_exited)?;
        writeln!(f)?;
        writeln!(f, "--- IPC ---")?;
        writeln!(f, "Pipes: {}", s.pipes_created)?;
        writeln!(f, "Sockets: {}", s.sockets_created)?;
        writeln!(
            f,
            "Connections: {} accepted, {} failed ({} timed out)",
            s.connections_accepted, s.connections_failed, s.connect_timeouts
        )?;
        writeln!(f, "Bytes: {} read, {} written", s.bytes_read, s.bytes_written)?;
        write!(f, "Syscall errors: {}", s.syscall_errors)
    }
}
