//! FIFO of pending tasks, drained once per tic.

use super::{Task, TaskFlags, TaskId, TaskOutcome, TaskTicket};
use crate::compat::{HashSet, Mutex};
use crate::error::TaskError;
use crate::lockfree::{AtomicCounter, AtomicFlag};
use crate::thread::panic_message;
use crossbeam_channel::{unbounded, Sender};
use std::panic::{self, AssertUnwindSafe};

type Callback = Box<dyn FnMut(&TaskOutcome) + Send>;

enum Notify {
    Ticket(Sender<TaskOutcome>),
    Callback(Callback),
}

impl Notify {
    fn send(&mut self, outcome: TaskOutcome) {
        match self {
            Notify::Ticket(tx) => {
                let _ = tx.send(outcome);
            }
            Notify::Callback(callback) => callback(&outcome),
        }
    }
}

struct Pending<C> {
    id: TaskId,
    task: Box<dyn Task<C>>,
    flags: TaskFlags,
    key: Option<String>,
    notify: Notify,
}

struct QueueState<C> {
    pending: Vec<Pending<C>>,
    /// Keys of `LOCKED` tasks that are pending or running.
    locked_keys: HashSet<String>,
    /// Cyclic tasks still alive.
    cyclic: HashSet<TaskId>,
    /// Cyclic tasks removed while a drain held them.
    removed: HashSet<TaskId>,
}

/// Counts from one [`TaskQueue::drain`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub completed: usize,
    pub failed: usize,
    pub removed: usize,
    /// Cyclic tasks queued again for the next drain.
    pub requeued: usize,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        self.completed + self.failed + self.removed == 0
    }
}

/// Thread-safe task queue over engine state `C`.
///
/// Any thread may submit; only the scheduling thread drains, inside the safe
/// window. Submission order is launch order.
pub struct TaskQueue<C> {
    state: Mutex<QueueState<C>>,
    next_id: AtomicCounter,
    closed: AtomicFlag,
}

impl<C: 'static> TaskQueue<C> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: Vec::new(),
                locked_keys: HashSet::new(),
                cyclic: HashSet::new(),
                removed: HashSet::new(),
            }),
            next_id: AtomicCounter::default(),
            closed: AtomicFlag::new(false),
        }
    }

    /// Queues a task; its outcome arrives on the returned ticket.
    pub fn submit(&self, task: impl Task<C>) -> TaskTicket {
        let (tx, rx) = unbounded();
        let id = self.enqueue(Box::new(task), Notify::Ticket(tx));
        TaskTicket { id, rx }
    }

    /// Queues a task; `callback` sees every outcome. It runs on the draining
    /// thread, or on the caller for tasks that coalesce or hit a closed queue.
    pub fn submit_with(
        &self,
        task: impl Task<C>,
        callback: impl FnMut(&TaskOutcome) + Send + 'static,
    ) -> TaskId {
        self.enqueue(Box::new(task), Notify::Callback(Box::new(callback)))
    }

    fn enqueue(&self, task: Box<dyn Task<C>>, mut notify: Notify) -> TaskId {
        let id = TaskId(self.next_id.incr());

        if self.closed.get() {
            notify.send(TaskOutcome::Failed(TaskError::QueueClosed));
            return id;
        }

        let flags = task.flags();
        let mut state = self.state.lock();

        let key = if flags.contains(TaskFlags::LOCKED) {
            let key = task.lock_key();
            if state.locked_keys.contains(&key) {
                drop(state);
                tracing::warn!(task = task.name(), %key, "Duplicate locked task coalesced");
                notify.send(TaskOutcome::Coalesced);
                return id;
            }
            state.locked_keys.insert(key.clone());
            Some(key)
        } else {
            None
        };

        if flags.contains(TaskFlags::CYCLIC) {
            state.cyclic.insert(id);
        }

        state.pending.push(Pending {
            id,
            task,
            flags,
            key,
            notify,
        });
        id
    }

    /// Runs every task pending at the time of the call against `ctx`.
    ///
    /// Tasks submitted while draining wait for the next drain.
    pub fn drain(&self, ctx: &mut C) -> DrainReport {
        let batch = std::mem::take(&mut self.state.lock().pending);
        let mut report = DrainReport::default();
        let mut requeue = Vec::new();

        for mut item in batch {
            if self.take_removed(item.id) {
                report.removed += 1;
                self.finish(&mut item, TaskOutcome::Removed);
                continue;
            }

            let validated = panic::catch_unwind(AssertUnwindSafe(|| item.task.validate(ctx)))
                .unwrap_or_else(|payload| {
                    Err(TaskError::validation(item.task.name(), panic_message(payload.as_ref())))
                });
            if let Err(err) = validated {
                tracing::warn!(task = item.task.name(), "Task rejected: {err}");
                report.failed += 1;
                self.finish(&mut item, TaskOutcome::Failed(err));
                continue;
            }

            tracing::debug!(task = item.task.name(), id = %item.id, "Launching task");
            let launched = panic::catch_unwind(AssertUnwindSafe(|| item.task.launch(ctx)))
                .unwrap_or_else(|payload| {
                    let name = item.task.name().to_string();
                    Err(TaskError::execution(name, panic_message(payload.as_ref())))
                });
            match launched {
                Ok(()) if item.flags.contains(TaskFlags::CYCLIC) => {
                    report.completed += 1;
                    item.notify.send(TaskOutcome::Completed);
                    requeue.push(item);
                }
                Ok(()) => {
                    report.completed += 1;
                    self.finish(&mut item, TaskOutcome::Completed);
                }
                Err(err) => {
                    tracing::warn!(task = item.task.name(), "Task failed: {err}");
                    report.failed += 1;
                    self.finish(&mut item, TaskOutcome::Failed(err));
                }
            }
        }

        if !requeue.is_empty() {
            let mut state = self.state.lock();
            let mut keep = Vec::with_capacity(requeue.len());
            let mut dropped = Vec::new();
            for item in requeue {
                if state.removed.remove(&item.id) {
                    if let Some(key) = &item.key {
                        state.locked_keys.remove(key);
                    }
                    dropped.push(item);
                } else {
                    keep.push(item);
                }
            }
            report.requeued = keep.len();
            keep.append(&mut state.pending);
            state.pending = keep;
            drop(state);

            for mut item in dropped {
                report.removed += 1;
                item.notify.send(TaskOutcome::Removed);
            }
        }

        report
    }

    fn take_removed(&self, id: TaskId) -> bool {
        self.state.lock().removed.remove(&id)
    }

    /// Notifies and releases the task's lock key and cyclic registration.
    fn finish(&self, item: &mut Pending<C>, outcome: TaskOutcome) {
        {
            let mut state = self.state.lock();
            if let Some(key) = &item.key {
                state.locked_keys.remove(key);
            }
            state.cyclic.remove(&item.id);
            state.removed.remove(&item.id);
        }
        item.notify.send(outcome);
    }

    /// Stops a cyclic task. Returns `false` if `id` is not a live cyclic task.
    pub fn remove_cyclic(&self, id: TaskId) -> bool {
        let mut state = self.state.lock();
        if !state.cyclic.remove(&id) {
            return false;
        }

        match state.pending.iter().position(|item| item.id == id) {
            Some(pos) => {
                let mut item = state.pending.remove(pos);
                if let Some(key) = &item.key {
                    state.locked_keys.remove(key);
                }
                drop(state);
                item.notify.send(TaskOutcome::Removed);
            }
            None => {
                // Held by a drain right now
                state.removed.insert(id);
            }
        }
        true
    }

    /// Fails every pending task and rejects further submissions.
    pub fn close(&self) {
        self.closed.set(true);
        let pending = {
            let mut state = self.state.lock();
            state.locked_keys.clear();
            state.cyclic.clear();
            std::mem::take(&mut state.pending)
        };
        for mut item in pending {
            item.notify.send(TaskOutcome::Failed(TaskError::QueueClosed));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<C: 'static> Default for TaskQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}
