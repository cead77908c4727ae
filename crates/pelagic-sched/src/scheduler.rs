//! The task queue and virtual clock.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use tracing::{trace, warn};

/// Safety cap for [`Scheduler::run_until_idle`]; a state machine that
/// re-posts forever would otherwise spin the test harness.
const MAX_IDLE_STEPS: usize = 1_000_000;

/// Handle to a posted task, used for cancellation. Cancelling a handle
/// twice, or after the task ran, is a no-op.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaskHandle(u64);

impl TaskHandle {
    /// A handle that refers to no task; cancelling it does nothing.
    pub const INVALID: TaskHandle = TaskHandle(0);
}

struct Task {
    name: &'static str,
    run: Box<dyn FnOnce()>,
}

struct Inner {
    now_ms: u64,
    next_id: u64,
    /// Due tasks keyed by (due time, id): stable FIFO order among tasks due
    /// at the same instant.
    queue: BTreeMap<(u64, u64), Task>,
}

/// Cloneable handle to the cooperative scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<RefCell<Inner>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                now_ms: 0,
                next_id: 1,
                queue: BTreeMap::new(),
            })),
        }
    }

    /// Current virtual time in milliseconds.
    pub fn now_ms(&self) -> u64 {
        self.inner.borrow().now_ms
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.inner.borrow().queue.len()
    }

    /// Post a task to run on the next scheduler pass.
    pub fn post(&self, name: &'static str, run: impl FnOnce() + 'static) -> TaskHandle {
        self.post_delayed(name, 0, run)
    }

    /// Post a task to run `delay_ms` from now.
    pub fn post_delayed(
        &self,
        name: &'static str,
        delay_ms: u64,
        run: impl FnOnce() + 'static,
    ) -> TaskHandle {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        let due = inner.now_ms + delay_ms;
        inner.queue.insert(
            (due, id),
            Task {
                name,
                run: Box::new(run),
            },
        );
        trace!(name, id, due, "task posted");
        TaskHandle(id)
    }

    /// Cancel a pending task. Idempotent: unknown, already-run and
    /// [`TaskHandle::INVALID`] handles are ignored.
    pub fn cancel(&self, handle: TaskHandle) {
        if handle == TaskHandle::INVALID {
            return;
        }
        let mut inner = self.inner.borrow_mut();
        let key = inner
            .queue
            .iter()
            .find(|((_, id), _)| *id == handle.0)
            .map(|(key, _)| *key);
        if let Some(key) = key {
            let task = inner.queue.remove(&key).unwrap();
            trace!(name = task.name, id = handle.0, "task cancelled");
        }
    }

    /// Run every task due within the next `ms` milliseconds, advancing the
    /// clock task by task, and leave the clock at `now + ms`.
    pub fn run_for(&self, ms: u64) {
        let limit = self.now_ms() + ms;
        while let Some((due, task)) = self.pop_due(limit) {
            self.inner.borrow_mut().now_ms = due;
            trace!(name = task.name, due, "task run");
            (task.run)();
        }
        self.inner.borrow_mut().now_ms = limit;
    }

    /// Run until no tasks remain, advancing the clock as needed.
    pub fn run_until_idle(&self) {
        for _ in 0..MAX_IDLE_STEPS {
            let Some((due, task)) = self.pop_due(u64::MAX) else {
                return;
            };
            self.inner.borrow_mut().now_ms = due;
            trace!(name = task.name, due, "task run");
            (task.run)();
        }
        warn!("run_until_idle: task cap reached; a task is re-posting forever");
    }

    /// Remove and return the earliest task due at or before `limit`. The
    /// borrow is released before the task body runs so tasks can post and
    /// cancel freely.
    fn pop_due(&self, limit: u64) -> Option<(u64, Task)> {
        let mut inner = self.inner.borrow_mut();
        let (&(due, id), _) = inner.queue.iter().next()?;
        if due > limit {
            return None;
        }
        let task = inner.queue.remove(&(due, id)).unwrap();
        Some((due, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn tasks_run_in_due_order() {
        let sched = Scheduler::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        for (name, delay, tag) in [("c", 30u64, 3), ("a", 10, 1), ("b", 20, 2)] {
            let order = order.clone();
            sched.post_delayed(name, delay, move || order.borrow_mut().push(tag));
        }
        sched.run_until_idle();
        assert_eq!(*order.borrow(), vec![1, 2, 3]);
        assert_eq!(sched.now_ms(), 30);
    }

    #[test]
    fn same_instant_is_fifo() {
        let sched = Scheduler::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for tag in 0..5 {
            let order = order.clone();
            sched.post("t", move || order.borrow_mut().push(tag));
        }
        sched.run_until_idle();
        assert_eq!(*order.borrow(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn run_for_stops_at_the_limit() {
        let sched = Scheduler::new();
        let hits = Rc::new(RefCell::new(0));
        {
            let hits = hits.clone();
            sched.post_delayed("early", 50, move || *hits.borrow_mut() += 1);
        }
        {
            let hits = hits.clone();
            sched.post_delayed("late", 200, move || *hits.borrow_mut() += 1);
        }
        sched.run_for(100);
        assert_eq!(*hits.borrow(), 1);
        assert_eq!(sched.now_ms(), 100);
        assert_eq!(sched.pending(), 1);

        sched.run_for(100);
        assert_eq!(*hits.borrow(), 2);
    }

    #[test]
    fn cancel_is_idempotent() {
        let sched = Scheduler::new();
        let ran = Rc::new(RefCell::new(false));
        let handle = {
            let ran = ran.clone();
            sched.post_delayed("doomed", 10, move || *ran.borrow_mut() = true)
        };
        sched.cancel(handle);
        sched.cancel(handle);
        sched.cancel(TaskHandle::INVALID);
        sched.run_until_idle();
        assert!(!*ran.borrow());
    }

    #[test]
    fn tasks_can_repost_themselves() {
        let sched = Scheduler::new();
        let count = Rc::new(RefCell::new(0u32));

        fn tick(sched: Scheduler, count: Rc<RefCell<u32>>) {
            *count.borrow_mut() += 1;
            if *count.borrow() < 4 {
                let s = sched.clone();
                sched.post_delayed("tick", 10, move || tick(s.clone(), count));
            }
        }
        tick(sched.clone(), count.clone());
        sched.run_until_idle();
        assert_eq!(*count.borrow(), 4);
        assert_eq!(sched.now_ms(), 30);
    }

    #[test]
    fn completion_can_cancel_its_timeout() {
        let sched = Scheduler::new();
        let timed_out = Rc::new(RefCell::new(false));
        let timeout = {
            let timed_out = timed_out.clone();
            sched.post_delayed("timeout", 500, move || *timed_out.borrow_mut() = true)
        };
        {
            let sched2 = sched.clone();
            sched.post_delayed("completion", 100, move || sched2.cancel(timeout));
        }
        sched.run_until_idle();
        assert!(!*timed_out.borrow());
    }
}
