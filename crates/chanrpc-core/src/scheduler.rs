//! Deferred execution: "next turn of the event loop" and timers.
//!
//! Channels never block. Anything that must happen later (the child's
//! handshake ping, request timeouts, loopback delivery) is handed to a
//! [`Scheduler`].

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::rc::Rc;
use std::time::Duration;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce()>;

/// Runs tasks on a later turn of a single-threaded event loop.
pub trait Scheduler {
    /// Run `task` no sooner than `delay` from now, and never synchronously.
    fn schedule(&self, delay: Duration, task: Task);
}

/// Deterministic event loop driven by a virtual clock.
///
/// Nothing runs until the owner calls [`run_until_idle`](Self::run_until_idle)
/// or [`advance`](Self::advance). Tasks due at the same instant run in the
/// order they were scheduled.
#[derive(Default)]
pub struct EventLoop {
    state: RefCell<LoopState>,
}

#[derive(Default)]
struct LoopState {
    now: Duration,
    next_seq: u64,
    queue: BinaryHeap<Reverse<(Duration, u64)>>,
    tasks: HashMap<u64, Task>,
}

impl EventLoop {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Virtual time elapsed since the loop was created.
    pub fn now(&self) -> Duration {
        self.state.borrow().now
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.state.borrow().tasks.len()
    }

    /// Run every task due at the current instant, including tasks those
    /// tasks schedule with zero delay. Returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        let now = self.now();
        self.run_due(now)
    }

    /// Move the clock forward by `by`, running due tasks in deadline order.
    pub fn advance(&self, by: Duration) -> usize {
        let deadline = self.now() + by;
        let ran = self.run_due(deadline);
        self.state.borrow_mut().now = deadline;
        ran
    }

    fn run_due(&self, deadline: Duration) -> usize {
        let mut ran = 0;
        loop {
            // The borrow must end before the task runs: tasks schedule more work.
            let task = {
                let mut state = self.state.borrow_mut();
                match state.queue.peek() {
                    Some(Reverse((due, _))) if *due <= deadline => {}
                    _ => break,
                }
                let Some(Reverse((due, seq))) = state.queue.pop() else {
                    break;
                };
                state.now = state.now.max(due);
                state.tasks.remove(&seq)
            };
            if let Some(task) = task {
                task();
                ran += 1;
            }
        }
        ran
    }
}

impl Scheduler for EventLoop {
    fn schedule(&self, delay: Duration, task: Task) {
        let mut state = self.state.borrow_mut();
        let seq = state.next_seq;
        state.next_seq += 1;
        let due = state.now + delay;
        state.queue.push(Reverse((due, seq)));
        state.tasks.insert(seq, task);
    }
}

/// Scheduler backed by tokio's local task set.
///
/// Must be used from within a [`tokio::task::LocalSet`], since channel state
/// is not `Send`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: Task) {
        tokio::task::spawn_local(async move {
            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(delay).await;
            }
            task();
        });
    }
}
