//! Delay queue driven by simulation time.
//!
//! Tasks are one-shot or repeating and carry a payload handed back when they
//! fire. Every task is bound to a [`CancellationToken`] supplied at creation;
//! once the token is cancelled the task never fires again. The owner advances
//! the clock from its tick loop, so nothing here sleeps or spawns.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    time::Duration,
};

use tokio_util::sync::CancellationToken;

const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

#[derive(Debug)]
struct Task<T> {
    payload: T,
    interval: Option<Duration>,
    token: CancellationToken,
}

#[derive(Debug)]
pub struct Scheduler<T> {
    now: Duration,
    next_id: u64,
    // (due, id); ids grow monotonically so equal deadlines fire in creation order
    queue: BinaryHeap<Reverse<(Duration, u64)>>,
    tasks: HashMap<u64, Task<T>>,
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Self {
            now: Duration::ZERO,
            next_id: 0,
            queue: BinaryHeap::new(),
            tasks: HashMap::new(),
        }
    }
}

impl<T: Clone> Scheduler<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule_once(&mut self, delay: Duration, payload: T, token: CancellationToken) -> TaskId {
        self.insert(delay, None, payload, token)
    }

    /// Fires after `delay`, then every `interval`.
    pub fn schedule_repeating(
        &mut self,
        delay: Duration,
        interval: Duration,
        payload: T,
        token: CancellationToken,
    ) -> TaskId {
        self.insert(delay, Some(interval.max(MIN_INTERVAL)), payload, token)
    }

    fn insert(
        &mut self,
        delay: Duration,
        interval: Option<Duration>,
        payload: T,
        token: CancellationToken,
    ) -> TaskId {
        let id = self.next_id;
        self.next_id += 1;
        self.queue.push(Reverse((self.now + delay, id)));
        self.tasks.insert(
            id,
            Task {
                payload,
                interval,
                token,
            },
        );
        TaskId(id)
    }

    /// Moves the clock forward and returns the payloads that came due, in
    /// deadline order.
    pub fn advance(&mut self, dt: Duration) -> Vec<T> {
        self.now += dt;
        let mut fired = Vec::new();
        while let Some(Reverse((due, id))) = self.queue.peek().copied() {
            if due > self.now {
                break;
            }
            self.queue.pop();
            let Some(task) = self.tasks.get(&id) else {
                continue;
            };
            if task.token.is_cancelled() {
                self.tasks.remove(&id);
                continue;
            }
            fired.push(task.payload.clone());
            let interval = task.interval;
            match interval {
                Some(interval) => self.queue.push(Reverse((due + interval, id))),
                None => {
                    self.tasks.remove(&id);
                }
            }
        }
        fired
    }

    /// Drops a task. Returns false if it already fired or was removed.
    pub fn cancel(&mut self, id: TaskId) -> bool {
        self.tasks.remove(&id.0).is_some()
    }

    /// Drops every task.
    pub fn clear(&mut self) {
        self.tasks.clear();
        self.queue.clear();
    }

    /// Tasks that can still fire.
    pub fn pending(&self) -> usize {
        self.tasks
            .values()
            .filter(|task| !task.token.is_cancelled())
            .count()
    }
}
