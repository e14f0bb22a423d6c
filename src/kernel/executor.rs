//! Cooperative executor - the scheduler every kernel thread runs on
//!
//! - One task per kernel thread; a task runs until it awaits
//! - Awaiting a condition variable is the only way to give up the CPU, so
//!   ordinary kernel code is atomic with respect to other threads
//! - Proper wake semantics (no busy-waiting)
//! - A virtual millisecond clock that jumps to the next timer deadline
//!   whenever every task is blocked
//!
//! Tractability > Complexity, but this is the kernel - it needs to be solid.

use super::condvar::SchedCause;
use super::task::{BoxFuture, TaskId};
use super::timer::{TimerId, TimerQueue};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::future::Future;
use std::rc::Rc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

/// Tasks signaled ready, in wake order, without duplicates
type ReadyQueue = Rc<RefCell<VecDeque<TaskId>>>;

fn mark_ready(ready: &ReadyQueue, task_id: TaskId) {
    let mut ready = ready.borrow_mut();
    if !ready.contains(&task_id) {
        ready.push_back(task_id);
    }
}

/// Scheduler statistics
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    /// Total ticks executed
    pub tick_count: u64,
    /// Task polls (cumulative)
    pub tasks_polled: u64,
    pub tasks_spawned: u64,
    pub tasks_completed: u64,
    /// Tasks dropped through `retire` (thread exit)
    pub tasks_retired: u64,
    pub timers_fired: u64,
    /// Condition variable waits, by cause
    pub blocked: BTreeMap<SchedCause, u64>,
}

impl SchedulerStats {
    /// Total blocking waits across all causes
    pub fn total_blocked(&self) -> u64 {
        self.blocked.values().sum()
    }
}

/// Outcome of running the executor to quiescence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    /// Tasks still blocked with nothing left that could wake them
    pub stalled: usize,
}

/// Shared state for waker to signal task readiness
struct WakerState {
    task_id: TaskId,
    ready: ReadyQueue,
}

/// The executor - runs async tasks cooperatively, one tick at a time
///
/// All methods take `&self`: tasks spawn threads and arm timers while the
/// executor is in the middle of polling them.
pub struct Executor {
    /// All live tasks, indexed by ID (a task is absent while being polled)
    tasks: RefCell<BTreeMap<TaskId, BoxFuture>>,
    /// Tasks that are ready to be polled (signaled by waker)
    ready: ReadyQueue,
    /// Tasks that asked to be dropped after their current poll
    retired: RefCell<HashSet<TaskId>>,
    timers: RefCell<TimerQueue>,
    now: Cell<f64>,
    current: Cell<Option<TaskId>>,
    next_id: Cell<u64>,
    stats: RefCell<SchedulerStats>,
}

impl Executor {
    pub fn new() -> Self {
        Self {
            tasks: RefCell::new(BTreeMap::new()),
            ready: Rc::new(RefCell::new(VecDeque::new())),
            retired: RefCell::new(HashSet::new()),
            timers: RefCell::new(TimerQueue::new()),
            now: Cell::new(0.0),
            current: Cell::new(None),
            next_id: Cell::new(0),
            stats: RefCell::new(SchedulerStats::default()),
        }
    }

    /// Spawn a future, returns its task ID. The task is ready immediately.
    pub fn spawn<F>(&self, future: F) -> TaskId
    where
        F: Future<Output = ()> + 'static,
    {
        let id = TaskId(self.next_id.get());
        self.next_id.set(id.0 + 1);

        self.tasks.borrow_mut().insert(id, Box::pin(future));
        mark_ready(&self.ready, id);
        self.stats.borrow_mut().tasks_spawned += 1;

        id
    }

    /// Run one tick of execution
    ///
    /// Polls every task that was ready when the tick started, in wake order.
    /// Tasks woken during the tick run on the next one.
    /// Returns the number of tasks that were polled.
    pub fn tick(&self) -> usize {
        let ready_ids: Vec<TaskId> = self.ready.borrow_mut().drain(..).collect();
        let mut polled = 0;

        for task_id in ready_ids {
            // Remove the task so it can spawn or wake others while polled
            let Some(mut future) = self.tasks.borrow_mut().remove(&task_id) else {
                continue;
            };

            let waker = self.create_waker(task_id);
            let mut cx = Context::from_waker(&waker);

            self.current.set(Some(task_id));
            let result = future.as_mut().poll(&mut cx);
            self.current.set(None);
            polled += 1;

            match result {
                Poll::Ready(()) => {
                    self.stats.borrow_mut().tasks_completed += 1;
                }
                Poll::Pending => {
                    if self.retired.borrow_mut().remove(&task_id) {
                        self.stats.borrow_mut().tasks_retired += 1;
                    } else {
                        // Put it back (but NOT in ready set); the waker re-adds it
                        self.tasks.borrow_mut().insert(task_id, future);
                    }
                }
            }
        }

        let mut stats = self.stats.borrow_mut();
        stats.tick_count += 1;
        stats.tasks_polled += polled as u64;

        polled
    }

    /// Run until every task completes or nothing can make progress.
    ///
    /// When no task is ready the clock jumps to the next timer deadline.
    /// With no ready task and no timer left, the remaining tasks are stalled.
    pub fn run(&self) -> RunReport {
        loop {
            if !self.has_tasks() {
                return RunReport { stalled: 0 };
            }

            if self.ready.borrow().is_empty() {
                let next = self.timers.borrow_mut().next_deadline();
                match next {
                    Some(deadline) => {
                        if deadline > self.now.get() {
                            self.now.set(deadline);
                        }
                        self.fire_timers();
                        continue;
                    }
                    None => {
                        return RunReport {
                            stalled: self.task_count(),
                        };
                    }
                }
            }

            self.tick();
        }
    }

    /// Move the clock forward, waking tasks whose timers expire
    pub fn advance(&self, ms: f64) {
        self.now.set(self.now.get() + ms.max(0.0));
        self.fire_timers();
    }

    fn fire_timers(&self) {
        let woken = self.timers.borrow_mut().tick(self.now.get());
        self.stats.borrow_mut().timers_fired += woken.len() as u64;
        for task_id in woken {
            mark_ready(&self.ready, task_id);
        }
    }

    /// Current virtual time in milliseconds
    pub fn now(&self) -> f64 {
        self.now.get()
    }

    /// The task being polled right now
    pub fn current(&self) -> Option<TaskId> {
        self.current.get()
    }

    /// Arm a one-shot timer that wakes `task_id` after `delay_ms`
    pub fn set_timer(&self, delay_ms: f64, task_id: TaskId) -> TimerId {
        self.timers
            .borrow_mut()
            .schedule(delay_ms, self.now.get(), task_id)
    }

    pub fn cancel_timer(&self, timer_id: TimerId) -> bool {
        self.timers.borrow_mut().cancel(timer_id)
    }

    /// Record a blocking wait for statistics
    pub fn note_block(&self, cause: SchedCause) {
        *self.stats.borrow_mut().blocked.entry(cause).or_insert(0) += 1;
    }

    /// Drop a task for good.
    ///
    /// A task retiring itself is dropped as soon as its current poll returns;
    /// any other task is dropped immediately.
    pub fn retire(&self, task_id: TaskId) -> bool {
        self.ready.borrow_mut().retain(|&id| id != task_id);

        if self.current.get() == Some(task_id) {
            self.retired.borrow_mut().insert(task_id);
            return true;
        }

        let removed = self.tasks.borrow_mut().remove(&task_id);
        if removed.is_some() {
            self.stats.borrow_mut().tasks_retired += 1;
        }
        removed.is_some()
    }

    /// Drop every remaining task (used at shutdown to break `Rc` cycles)
    pub fn cancel_all(&self) -> usize {
        self.ready.borrow_mut().clear();
        let tasks = std::mem::take(&mut *self.tasks.borrow_mut());
        let count = tasks.len();
        // Futures are dropped after the borrow is released; their destructors
        // may touch the timer queue
        drop(tasks);
        count
    }

    pub fn has_tasks(&self) -> bool {
        !self.tasks.borrow().is_empty()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.borrow().len()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.borrow().clone()
    }

    /// Create a waker that marks a task as ready
    fn create_waker(&self, task_id: TaskId) -> Waker {
        let state = Box::new(WakerState {
            task_id,
            ready: self.ready.clone(),
        });
        let ptr = Box::into_raw(state) as *const ();
        let raw = RawWaker::new(ptr, &WAKER_VTABLE);
        unsafe { Waker::from_raw(raw) }
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

// Waker implementation that properly signals task readiness

const WAKER_VTABLE: RawWakerVTable =
    RawWakerVTable::new(waker_clone, waker_wake, waker_wake_by_ref, waker_drop);

unsafe fn waker_clone(ptr: *const ()) -> RawWaker {
    unsafe {
        let state = &*(ptr as *const WakerState);
        let cloned = Box::new(WakerState {
            task_id: state.task_id,
            ready: state.ready.clone(),
        });
        RawWaker::new(Box::into_raw(cloned) as *const (), &WAKER_VTABLE)
    }
}

unsafe fn waker_wake(ptr: *const ()) {
    unsafe {
        let state = Box::from_raw(ptr as *mut WakerState);
        mark_ready(&state.ready, state.task_id);
    }
}

unsafe fn waker_wake_by_ref(ptr: *const ()) {
    unsafe {
        let state = &*(ptr as *const WakerState);
        mark_ready(&state.ready, state.task_id);
    }
}

unsafe fn waker_drop(ptr: *const ()) {
    unsafe {
        drop(Box::from_raw(ptr as *mut WakerState));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_spawn_returns_unique_ids() {
        let exec = Executor::new();
        let id1 = exec.spawn(async {});
        let id2 = exec.spawn(async {});
        let id3 = exec.spawn(async {});

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn test_multiple_tasks_all_complete() {
        let exec = Executor::new();
        let counter = Rc::new(Cell::new(0));

        for _ in 0..10 {
            let counter = counter.clone();
            exec.spawn(async move {
                counter.set(counter.get() + 1);
            });
        }

        assert_eq!(exec.run(), RunReport { stalled: 0 });
        assert_eq!(counter.get(), 10);
        assert!(!exec.has_tasks());
    }

    #[test]
    fn test_tasks_run_in_spawn_order() {
        let exec = Executor::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        for name in ["first", "second", "third"] {
            let order = order.clone();
            exec.spawn(async move {
                order.borrow_mut().push(name);
            });
        }

        exec.tick();
        assert_eq!(order.borrow().as_slice(), &["first", "second", "third"]);
    }

    #[test]
    fn test_tick_without_wake_leaves_task_pending() {
        let exec = Executor::new();
        let counter = Rc::new(Cell::new(0));
        let counter_clone = counter.clone();

        exec.spawn(async move {
            counter_clone.set(counter_clone.get() + 1);
            futures::pending!(); // Yield without waking
        });

        exec.tick();
        assert_eq!(counter.get(), 1);
        assert_eq!(exec.task_count(), 1);

        // Not in the ready set, so nothing is polled
        assert_eq!(exec.tick(), 0);
        assert_eq!(counter.get(), 1);
    }

    #[test]
    fn test_waker_requeues_task() {
        let exec = Executor::new();
        let counter = Rc::new(Cell::new(0));
        let parked: Rc<RefCell<Option<Waker>>> = Rc::new(RefCell::new(None));

        let (c, w) = (counter.clone(), parked.clone());
        exec.spawn(async move {
            let mut waited = false;
            std::future::poll_fn(|cx| {
                if waited {
                    Poll::Ready(())
                } else {
                    waited = true;
                    *w.borrow_mut() = Some(cx.waker().clone());
                    Poll::Pending
                }
            })
            .await;
            c.set(c.get() + 1);
        });

        exec.tick();
        assert_eq!(exec.tick(), 0);

        parked.borrow_mut().take().unwrap().wake();
        assert_eq!(exec.tick(), 1);
        assert_eq!(counter.get(), 1);
        assert!(!exec.has_tasks());
    }

    #[test]
    fn test_run_reports_stalled_tasks() {
        let exec = Executor::new();
        exec.spawn(async {
            futures::pending!();
        });
        exec.spawn(async {});

        assert_eq!(exec.run(), RunReport { stalled: 1 });
        assert_eq!(exec.cancel_all(), 1);
        assert!(!exec.has_tasks());
    }

    #[test]
    fn test_run_advances_clock_to_timer() {
        let exec = Rc::new(Executor::new());
        let woke_at = Rc::new(Cell::new(-1.0));

        let exec_clone = exec.clone();
        let woke_clone = woke_at.clone();
        exec.spawn(async move {
            let me = exec_clone.current().unwrap();
            exec_clone.set_timer(250.0, me);
            futures::pending!();
            woke_clone.set(exec_clone.now());
        });

        assert_eq!(exec.run(), RunReport { stalled: 0 });
        assert_eq!(woke_at.get(), 250.0);
        assert_eq!(exec.stats().timers_fired, 1);
    }

    #[test]
    fn test_retire_current_task_drops_it_after_poll() {
        let exec = Rc::new(Executor::new());
        let after = Rc::new(Cell::new(false));

        let exec_clone = exec.clone();
        let after_clone = after.clone();
        exec.spawn(async move {
            let me = exec_clone.current().unwrap();
            exec_clone.retire(me);
            futures::pending!();
            after_clone.set(true);
        });

        assert_eq!(exec.run(), RunReport { stalled: 0 });
        assert!(!after.get());
        assert_eq!(exec.stats().tasks_retired, 1);
    }

    #[test]
    fn test_retire_blocked_task() {
        let exec = Executor::new();
        let id = exec.spawn(async {
            futures::pending!();
        });

        exec.tick();
        assert!(exec.retire(id));
        assert!(!exec.retire(id));
        assert!(!exec.has_tasks());
    }
}
