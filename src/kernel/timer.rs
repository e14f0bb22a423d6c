//! Timer System
//!
//! One-shot deadlines that wake a blocked task, used by timed condition
//! variable waits (connect timeouts).
//!
//! Design:
//! - TimerQueue is a min-heap sorted by deadline
//! - Each timer wakes exactly one task when it expires
//! - Cancelled timers stay in the heap and are skipped lazily
//! - Time is the executor's virtual clock in milliseconds

use super::task::TaskId;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// Unique identifier for a timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

/// Timer state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// Timer is active and waiting
    Pending,
    /// Timer has fired
    Fired,
    /// Timer was cancelled
    Cancelled,
}

/// A timer that fires at a specific deadline
#[derive(Debug)]
pub struct Timer {
    pub id: TimerId,
    /// When this timer should fire (monotonic milliseconds)
    pub deadline: f64,
    /// Task to wake when the timer fires
    pub wake_task: TaskId,
    pub state: TimerState,
}

impl Timer {
    pub fn oneshot(id: TimerId, deadline: f64, wake_task: TaskId) -> Self {
        Self {
            id,
            deadline,
            wake_task,
            state: TimerState::Pending,
        }
    }

    pub fn is_expired(&self, now: f64) -> bool {
        self.state == TimerState::Pending && now >= self.deadline
    }

    /// Fire the timer, returning the task to wake
    pub fn fire(&mut self) -> Option<TaskId> {
        if self.state == TimerState::Pending {
            self.state = TimerState::Fired;
            Some(self.wake_task)
        } else {
            None
        }
    }

    pub fn cancel(&mut self) {
        self.state = TimerState::Cancelled;
    }
}

/// Entry in the timer heap (for ordering)
#[derive(Debug)]
struct TimerEntry {
    deadline: f64,
    id: TimerId,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (smallest deadline first), ties by
        // creation order so equal deadlines fire in the order they were set
        other
            .deadline
            .partial_cmp(&self.deadline)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.id.0.cmp(&self.id.0))
    }
}

/// Timer queue - manages all active timers
#[derive(Debug)]
pub struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    timers: HashMap<TimerId, Timer>,
    next_id: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            timers: HashMap::new(),
            next_id: 1,
        }
    }

    /// Schedule a one-shot timer `delay_ms` after `now`
    pub fn schedule(&mut self, delay_ms: f64, now: f64, wake_task: TaskId) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;

        let deadline = now + delay_ms.max(0.0);
        self.heap.push(TimerEntry { deadline, id });
        self.timers.insert(id, Timer::oneshot(id, deadline, wake_task));

        id
    }

    /// Cancel a timer
    ///
    /// Returns true if the timer was pending and is now cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.timers.remove(&id) {
            Some(mut timer) if timer.state == TimerState::Pending => {
                timer.cancel();
                true
            }
            _ => false,
        }
    }

    /// Process expired timers, returning tasks to wake
    pub fn tick(&mut self, now: f64) -> Vec<TaskId> {
        let mut tasks_to_wake = Vec::new();

        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let Some(entry) = self.heap.pop() else {
                break;
            };

            if let Some(mut timer) = self.timers.remove(&entry.id)
                && timer.is_expired(now)
                && let Some(task_id) = timer.fire()
            {
                tasks_to_wake.push(task_id);
            }
        }

        tasks_to_wake
    }

    /// Deadline of the earliest pending timer
    pub fn next_deadline(&mut self) -> Option<f64> {
        // Drop cancelled entries sitting on top of the heap
        while let Some(entry) = self.heap.peek() {
            if self.timers.contains_key(&entry.id) {
                return Some(entry.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Number of pending timers
    pub fn pending_count(&self) -> usize {
        self.timers.len()
    }

    pub fn is_pending(&self, id: TimerId) -> bool {
        self.timers.contains_key(&id)
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oneshot_timer() {
        let mut queue = TimerQueue::new();
        let task = TaskId(1);

        let timer_id = queue.schedule(100.0, 0.0, task);
        assert!(queue.is_pending(timer_id));
        assert_eq!(queue.pending_count(), 1);

        // Not expired yet
        let woken = queue.tick(50.0);
        assert!(woken.is_empty());
        assert!(queue.is_pending(timer_id));

        // Now expired
        let woken = queue.tick(100.0);
        assert_eq!(woken, vec![task]);
        assert!(!queue.is_pending(timer_id));
    }

    #[test]
    fn test_multiple_timers_fire_in_deadline_order() {
        let mut queue = TimerQueue::new();

        queue.schedule(100.0, 0.0, TaskId(1));
        queue.schedule(50.0, 0.0, TaskId(2));
        queue.schedule(150.0, 0.0, TaskId(3));

        assert_eq!(queue.tick(50.0), vec![TaskId(2)]);
        assert_eq!(queue.tick(100.0), vec![TaskId(1)]);
        assert_eq!(queue.tick(150.0), vec![TaskId(3)]);
    }

    #[test]
    fn test_cancel_timer() {
        let mut queue = TimerQueue::new();

        let timer_id = queue.schedule(100.0, 0.0, TaskId(1));
        assert!(queue.cancel(timer_id));
        assert!(!queue.cancel(timer_id));

        let woken = queue.tick(100.0);
        assert!(woken.is_empty());
    }

    #[test]
    fn test_next_deadline_skips_cancelled() {
        let mut queue = TimerQueue::new();
        assert!(queue.next_deadline().is_none());

        let early = queue.schedule(10.0, 0.0, TaskId(1));
        queue.schedule(40.0, 0.0, TaskId(2));
        assert_eq!(queue.next_deadline(), Some(10.0));

        queue.cancel(early);
        assert_eq!(queue.next_deadline(), Some(40.0));
    }

    #[test]
    fn test_equal_deadlines_fire_together() {
        let mut queue = TimerQueue::new();

        queue.schedule(50.0, 0.0, TaskId(1));
        queue.schedule(50.0, 0.0, TaskId(2));
        queue.schedule(50.0, 0.0, TaskId(3));

        assert_eq!(queue.tick(50.0), vec![TaskId(1), TaskId(2), TaskId(3)]);
    }
}
