//! Process abstraction
//!
//! A process owns a descriptor table, an argument buffer and one or more
//! threads. Processes form a tree: every process except idle (pid 0) and
//! init (pid 1) has a parent, and orphans are handed to init.
//!
//! The table is a fixed arena. Free slots are chained through an explicit
//! free list, so a pid is reused as soon as its zombie is reaped.

use super::condvar::CondVar;
use super::object::Handle;
use super::task::Task;
use super::thread::{Ptcb, Tid};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Pid(pub u32);

impl std::fmt::Display for Pid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pid:{}", self.0)
    }
}

/// "No process" sentinel
pub const NOPROC: Pid = Pid(u32::MAX);
/// The idle process; never runs a thread
pub const IDLE: Pid = Pid(0);
/// The init process; adopts orphans
pub const INIT: Pid = Pid(1);

/// Process state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// At least one thread has not exited
    Alive,
    /// Every thread exited; waiting for the parent to collect the status
    Zombie,
}

/// Process table errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    /// No free process control block
    TableFull,
    /// wait-child with no children at all
    NoChildren,
    /// wait-child named a pid that is not our child (or was already reaped)
    NotAChild(Pid),
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::TableFull => write!(f, "process table full"),
            ProcessError::NoChildren => write!(f, "no child processes"),
            ProcessError::NotAChild(pid) => write!(f, "{} is not a child", pid),
        }
    }
}

impl std::error::Error for ProcessError {}

/// File descriptor - an index into a process's file table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fd(pub u32);

impl std::fmt::Display for Fd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fd:{}", self.0)
    }
}

/// Per-process descriptor table: fixed slots of object handles
#[derive(Debug, Clone)]
pub struct FileTable {
    slots: Vec<Option<Handle>>,
}

impl FileTable {
    pub fn new(size: usize) -> Self {
        Self {
            slots: vec![None; size],
        }
    }

    /// Find `n` free descriptors, lowest first. Nothing is claimed; the
    /// caller installs handles before yielding.
    pub fn reserve(&self, n: usize) -> Option<Vec<Fd>> {
        let free: Vec<Fd> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(i, _)| Fd(i as u32))
            .take(n)
            .collect();
        (free.len() == n).then_some(free)
    }

    pub fn install(&mut self, fd: Fd, handle: Handle) {
        let slot = &mut self.slots[fd.0 as usize];
        assert!(slot.is_none(), "{} installed twice", fd);
        *slot = Some(handle);
    }

    pub fn get(&self, fd: Fd) -> Option<Handle> {
        self.slots.get(fd.0 as usize).copied().flatten()
    }

    /// Empty a slot, returning what it held
    pub fn remove(&mut self, fd: Fd) -> Option<Handle> {
        self.slots.get_mut(fd.0 as usize)?.take()
    }

    /// Every open handle, in descriptor order
    pub fn handles(&self) -> impl Iterator<Item = Handle> + '_ {
        self.slots.iter().flatten().copied()
    }

    /// Empty the whole table
    pub fn drain(&mut self) -> Vec<Handle> {
        self.slots.iter_mut().filter_map(Option::take).collect()
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

/// Process control block
#[derive(Debug)]
pub struct Process {
    pub pid: Pid,
    pub state: ProcessState,
    pub parent: Option<Pid>,
    /// Live and zombie children
    pub children: Vec<Pid>,
    /// Zombie children in exit order
    pub exited: VecDeque<Pid>,
    /// Broadcast whenever a child exits (or a zombie is handed over)
    pub child_exit: CondVar,
    /// Entry point of the main thread
    pub main_task: Option<Task>,
    /// Private copy of the exec argument buffer
    pub args: Vec<u8>,
    pub files: FileTable,
    /// Threads that have not yet exited
    pub thread_count: usize,
    pub threads: BTreeMap<Tid, Ptcb>,
    pub exit_status: i32,
}

impl Process {
    pub fn new(pid: Pid, max_fileid: usize) -> Self {
        Self {
            pid,
            state: ProcessState::Alive,
            parent: None,
            children: Vec::new(),
            exited: VecDeque::new(),
            child_exit: CondVar::new(),
            main_task: None,
            args: Vec::new(),
            files: FileTable::new(max_fileid),
            thread_count: 0,
            threads: BTreeMap::new(),
            exit_status: 0,
        }
    }

    pub fn is_zombie(&self) -> bool {
        self.state == ProcessState::Zombie
    }

    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            pid: self.pid,
            ppid: self.parent,
            alive: self.state == ProcessState::Alive,
            thread_count: self.thread_count,
            children: self.children.len(),
            argl: self.args.len(),
            open_files: self.files.open_count(),
        }
    }
}

/// Snapshot of one process for introspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub ppid: Option<Pid>,
    pub alive: bool,
    pub thread_count: usize,
    pub children: usize,
    pub argl: usize,
    pub open_files: usize,
}

/// What became of an exiting process's children
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reparented {
    /// Handed to init
    pub adopted: usize,
    /// Zombies freed because no one is left to reap them
    pub freed: usize,
}

#[derive(Debug)]
enum Slot {
    Free { next: Option<usize> },
    Live(Box<Process>),
}

/// Fixed-size process table
#[derive(Debug)]
pub struct ProcessTable {
    slots: Vec<Slot>,
    free_head: Option<usize>,
    live: usize,
}

impl ProcessTable {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|i| Slot::Free {
                next: (i + 1 < capacity).then_some(i + 1),
            })
            .collect();
        Self {
            slots,
            free_head: (capacity > 0).then_some(0),
            live: 0,
        }
    }

    /// Take a PCB off the free list
    pub fn acquire(&mut self, max_fileid: usize) -> Option<Pid> {
        let index = self.free_head?;
        let next = match &self.slots[index] {
            Slot::Free { next } => *next,
            Slot::Live(_) => panic!("process free list corrupted at slot {}", index),
        };
        let pid = Pid(index as u32);
        self.slots[index] = Slot::Live(Box::new(Process::new(pid, max_fileid)));
        self.free_head = next;
        self.live += 1;
        Some(pid)
    }

    /// Return a reaped PCB to the free list
    pub fn release(&mut self, pid: Pid) -> Process {
        let index = pid.0 as usize;
        let slot = std::mem::replace(
            &mut self.slots[index],
            Slot::Free {
                next: self.free_head,
            },
        );
        match slot {
            Slot::Live(process) => {
                assert!(process.is_zombie(), "releasing {} before it exited", pid);
                self.free_head = Some(index);
                self.live -= 1;
                *process
            }
            Slot::Free { .. } => panic!("releasing free process slot {}", pid),
        }
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        match self.slots.get(pid.0 as usize)? {
            Slot::Live(process) => Some(process),
            Slot::Free { .. } => None,
        }
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        match self.slots.get_mut(pid.0 as usize)? {
            Slot::Live(process) => Some(process),
            Slot::Free { .. } => None,
        }
    }

    /// Borrow a live process; its absence is a kernel bug
    pub fn expect_mut(&mut self, pid: Pid) -> &mut Process {
        match self.get_mut(pid) {
            Some(process) => process,
            None => panic!("{} missing from the process table", pid),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Process> {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Live(process) => Some(process.as_ref()),
            Slot::Free { .. } => None,
        })
    }

    /// Live (alive or zombie) process count
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Make `child` a child of `parent`
    pub fn link_child(&mut self, parent: Pid, child: Pid) {
        self.expect_mut(child).parent = Some(parent);
        self.expect_mut(parent).children.push(child);
    }

    /// Collect a zombie child: unlink it from its parent and free its PCB.
    /// Returns the exit status.
    pub fn reap(&mut self, parent: Pid, child: Pid) -> i32 {
        let p = self.expect_mut(parent);
        p.children.retain(|&c| c != child);
        p.exited.retain(|&c| c != child);
        self.release(child).exit_status
    }

    /// Hand `children` and the already-exited subset `zombies` to init.
    ///
    /// If init is gone or is the one exiting, orphans become parentless:
    /// zombies are freed at once, live ones free themselves when they exit.
    pub fn reparent(
        &mut self,
        from: Pid,
        children: Vec<Pid>,
        zombies: VecDeque<Pid>,
    ) -> Reparented {
        let init_alive = from != INIT
            && self
                .get(INIT)
                .is_some_and(|p| p.state == ProcessState::Alive);

        if !init_alive {
            for &child in &children {
                self.expect_mut(child).parent = None;
            }
            let freed = zombies.len();
            for child in zombies {
                self.release(child);
            }
            return Reparented { adopted: 0, freed };
        }

        for &child in &children {
            self.expect_mut(child).parent = Some(INIT);
        }
        let adopted = children.len();
        let init = self.expect_mut(INIT);
        init.children.extend(children);
        if !zombies.is_empty() {
            init.exited.extend(zombies);
            init.child_exit.broadcast();
        }
        Reparented { adopted, freed: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zombify(table: &mut ProcessTable, pid: Pid) {
        table.expect_mut(pid).state = ProcessState::Zombie;
    }

    #[test]
    fn test_acquire_in_index_order() {
        let mut table = ProcessTable::new(4);
        assert_eq!(table.acquire(4), Some(Pid(0)));
        assert_eq!(table.acquire(4), Some(Pid(1)));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_table_full() {
        let mut table = ProcessTable::new(2);
        table.acquire(4);
        table.acquire(4);
        assert_eq!(table.acquire(4), None);
    }

    #[test]
    fn test_released_pid_is_reused_first() {
        let mut table = ProcessTable::new(8);
        for _ in 0..4 {
            table.acquire(4);
        }
        zombify(&mut table, Pid(2));
        table.release(Pid(2));

        assert!(table.get(Pid(2)).is_none());
        assert_eq!(table.acquire(4), Some(Pid(2)));
        assert_eq!(table.acquire(4), Some(Pid(4)));
    }

    #[test]
    #[should_panic(expected = "before it exited")]
    fn test_release_alive_process_is_fatal() {
        let mut table = ProcessTable::new(4);
        let pid = table.acquire(4).unwrap();
        table.release(pid);
    }

    #[test]
    fn test_reap_unlinks_child() {
        let mut table = ProcessTable::new(4);
        let parent = table.acquire(4).unwrap();
        let child = table.acquire(4).unwrap();
        table.link_child(parent, child);

        table.expect_mut(child).exit_status = 9;
        zombify(&mut table, child);
        table.expect_mut(parent).exited.push_back(child);

        assert_eq!(table.reap(parent, child), 9);
        let p = table.get(parent).unwrap();
        assert!(p.children.is_empty());
        assert!(p.exited.is_empty());
        assert!(table.get(child).is_none());
    }

    #[test]
    fn test_reparent_to_init() {
        let mut table = ProcessTable::new(8);
        table.acquire(4); // idle
        table.acquire(4); // init
        let parent = table.acquire(4).unwrap();
        let live = table.acquire(4).unwrap();
        let dead = table.acquire(4).unwrap();
        table.link_child(parent, live);
        table.link_child(parent, dead);
        zombify(&mut table, dead);

        let p = table.expect_mut(parent);
        let children = std::mem::take(&mut p.children);
        p.exited.push_back(dead);
        let zombies = std::mem::take(&mut p.exited);

        assert_eq!(
            table.reparent(parent, children, zombies),
            Reparented {
                adopted: 2,
                freed: 0
            }
        );
        let init = table.get(INIT).unwrap();
        assert_eq!(init.children, vec![live, dead]);
        assert_eq!(init.exited, VecDeque::from([dead]));
        assert_eq!(table.get(live).unwrap().parent, Some(INIT));
    }

    #[test]
    fn test_orphans_of_init_become_parentless() {
        let mut table = ProcessTable::new(8);
        table.acquire(4);
        table.acquire(4);
        let live = table.acquire(4).unwrap();
        let dead = table.acquire(4).unwrap();
        table.link_child(INIT, live);
        table.link_child(INIT, dead);
        zombify(&mut table, dead);

        let children = vec![live, dead];
        assert_eq!(
            table.reparent(INIT, children, VecDeque::from([dead])),
            Reparented {
                adopted: 0,
                freed: 1
            }
        );
        assert_eq!(table.get(live).unwrap().parent, None);
        assert!(table.get(dead).is_none());
    }

    #[test]
    fn test_file_table_reserve_is_all_or_nothing() {
        let mut files = FileTable::new(3);
        files.install(Fd(1), Handle(10));

        assert_eq!(files.reserve(2), Some(vec![Fd(0), Fd(2)]));
        assert_eq!(files.reserve(3), None);

        files.install(Fd(0), Handle(11));
        assert_eq!(files.get(Fd(0)), Some(Handle(11)));
        assert_eq!(files.remove(Fd(0)), Some(Handle(11)));
        assert_eq!(files.remove(Fd(0)), None);
        assert_eq!(files.get(Fd(9)), None);

        assert_eq!(files.drain(), vec![Handle(10)]);
        assert_eq!(files.open_count(), 0);
    }
}
