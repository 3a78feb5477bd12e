use crate::hint::HintProp;
use crate::msg::PolicyMsg;
use crate::runlevel::{RlProps, Runlevel};
use crate::task::Task;
use spin::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use tokio::sync::Notify;

/// The scheduler seam. The engine only ever gives ready tasks, takes work
/// on behalf of a worker, and offers the message pre/post hooks; placement
/// policy lives entirely behind this trait.
pub trait Scheduler: Send + Sync {
    /// A task reached ALLACQ; queue it for execution.
    fn give(&self, task: Arc<Task>);
    /// Pull the next task for a worker, if any.
    fn take(&self, worker: u32) -> Option<Arc<Task>>;
    /// Wakeup handle workers park on.
    fn notifier(&self) -> &Notify;
    /// Pre-hook offered on WORK_CREATE / DB_CREATE requests. Returning
    /// false consumes the message.
    fn pre_process(&self, msg: &mut PolicyMsg) -> bool;
    /// Post-hook on the same operations.
    fn post_process(&self, msg: &mut PolicyMsg);
    fn switch_runlevel(&self, rl: Runlevel, phase: i8, props: RlProps);
    fn pending(&self) -> usize;
}

struct Entry {
    priority: u64,
    seq: u64,
    task: Arc<Task>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority first, then FIFO within a priority.
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

/// Default scheduler: a priority queue ordered by the EDT_PRIORITY hint,
/// FIFO among equals.
pub struct PriorityScheduler {
    heap: Mutex<(u64, BinaryHeap<Entry>)>,
    notify: Notify,
}

impl PriorityScheduler {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new((0, BinaryHeap::new())),
            notify: Notify::new(),
        }
    }
}

impl Default for PriorityScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for PriorityScheduler {
    fn give(&self, task: Arc<Task>) {
        let priority = task
            .hint
            .lock()
            .get(HintProp::EdtPriority)
            .unwrap_or(0);
        {
            let mut h = self.heap.lock();
            let seq = h.0;
            h.0 += 1;
            h.1.push(Entry {
                priority,
                seq,
                task,
            });
        }
        self.notify.notify_one();
    }

    fn take(&self, _worker: u32) -> Option<Arc<Task>> {
        self.heap.lock().1.pop().map(|e| e.task)
    }

    fn notifier(&self) -> &Notify {
        &self.notify
    }

    fn pre_process(&self, _msg: &mut PolicyMsg) -> bool {
        true
    }

    fn post_process(&self, _msg: &mut PolicyMsg) {}

    fn switch_runlevel(&self, _rl: Runlevel, _phase: i8, _props: RlProps) {}

    fn pending(&self) -> usize {
        self.heap.lock().1.len()
    }
}
