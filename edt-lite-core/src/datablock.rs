use crate::errors::{Result, RuntimeError};
use crate::guid::{DbAccessMode, Guid, Location};
use crate::hint::Hint;
use spin::{Mutex, RwLock};
use std::collections::VecDeque;
use std::fmt;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct DbProps: u32 {
        /// Create without handing the creator an acquired handle.
        const NO_ACQUIRE        = 1 << 0;
        /// Acquired on behalf of the runtime rather than user code.
        const RT_ACQUIRE        = 1 << 1;
        /// The block may be written through at most one write-mode acquire.
        const SINGLE_ASSIGNMENT = 1 << 2;
        /// The creator takes responsibility for the release.
        const NO_RELEASE        = 1 << 3;
    }
}

/// A parked acquire waiting for the exclusive holder to drain. The
/// requester location routes the eventual grant ack back to the domain
/// that asked (which may differ from the task guid's home after a move).
#[derive(Clone, Copy, Debug)]
pub struct AcquireWaiter {
    pub task: Guid,
    pub slot: u32,
    pub mode: DbAccessMode,
    pub requester: Location,
}

/// What an acquire attempt produced.
pub enum AcquireOutcome {
    Granted,
    /// Queued behind an exclusive holder; the task parks and is re-entered
    /// through the acquire-ack path on release.
    Queued,
}

struct DbState {
    /// Concurrent holders (RO / RW / CONST) keyed by acquiring task.
    holders: Vec<(Guid, DbAccessMode)>,
    ew_holder: Option<Guid>,
    queue: VecDeque<AcquireWaiter>,
    /// SINGLE_ASSIGNMENT: a write-mode acquire has already been released.
    assigned: bool,
    /// DB_FREE arrived while held; the last release completes it.
    free_pending: bool,
    freed: bool,
}

/// A guid-addressed contiguous byte region, passed between tasks through
/// the acquire/release protocol.
pub struct DataBlock {
    pub guid: Guid,
    pub size: u64,
    pub props: DbProps,
    pub hint: Mutex<Hint>,
    payload: RwLock<Box<[u8]>>,
    state: Mutex<DbState>,
}

impl DataBlock {
    pub fn new(guid: Guid, size: u64, props: DbProps, hint: Hint) -> Self {
        Self {
            guid,
            size,
            props,
            hint: Mutex::new(hint),
            payload: RwLock::new(vec![0u8; size as usize].into_boxed_slice()),
            state: Mutex::new(DbState {
                holders: Vec::new(),
                ew_holder: None,
                queue: VecDeque::new(),
                assigned: false,
                free_pending: false,
                freed: false,
            }),
        }
    }

    pub fn read(&self) -> spin::RwLockReadGuard<'_, Box<[u8]>> {
        self.payload.read()
    }

    pub fn write(&self) -> spin::RwLockWriteGuard<'_, Box<[u8]>> {
        self.payload.write()
    }

    /// Attempt to acquire for `task` in `mode`. NULL_MODE edges never reach
    /// here (no block flows). EW is exclusive against every other holder;
    /// the rest share.
    pub fn acquire(
        &self,
        task: Guid,
        slot: u32,
        mode: DbAccessMode,
        requester: Location,
    ) -> Result<AcquireOutcome> {
        let mut st = self.state.lock();
        if st.freed {
            return Err(RuntimeError::NoEnt(self.guid));
        }
        if self.props.contains(DbProps::SINGLE_ASSIGNMENT)
            && st.assigned
            && matches!(mode, DbAccessMode::Rw | DbAccessMode::Ew)
        {
            return Err(RuntimeError::Perm("single-assignment block already written"));
        }
        let busy = match mode {
            DbAccessMode::Ew => st.ew_holder.is_some() || !st.holders.is_empty(),
            _ => st.ew_holder.is_some(),
        };
        if busy {
            st.queue.push_back(AcquireWaiter {
                task,
                slot,
                mode,
                requester,
            });
            return Ok(AcquireOutcome::Queued);
        }
        match mode {
            DbAccessMode::Ew => st.ew_holder = Some(task),
            _ => st.holders.push((task, mode)),
        }
        Ok(AcquireOutcome::Granted)
    }

    /// Release `task`'s hold. Returns the parked acquires that become
    /// grantable, plus whether a deferred free completed (the caller must
    /// then drop the guid binding).
    pub fn release(&self, task: Guid) -> Result<(Vec<AcquireWaiter>, bool)> {
        let mut st = self.state.lock();
        if st.ew_holder == Some(task) {
            st.ew_holder = None;
            st.assigned = true;
        } else if let Some(pos) = st.holders.iter().position(|(t, _)| *t == task) {
            let (_, mode) = st.holders.remove(pos);
            if mode == DbAccessMode::Rw {
                st.assigned = true;
            }
        } else {
            return Err(RuntimeError::Inval("release without matching acquire"));
        }
        let granted = Self::drain_queue(&mut st);
        let freed_now = st.free_pending
            && st.ew_holder.is_none()
            && st.holders.is_empty()
            && st.queue.is_empty();
        if freed_now {
            st.freed = true;
            st.free_pending = false;
        }
        Ok((granted, freed_now))
    }

    /// Destroy the block. If held, the free completes on the last release.
    /// Returns true when the guid binding can be dropped immediately.
    pub fn free(&self) -> Result<bool> {
        let mut st = self.state.lock();
        if st.freed {
            return Err(RuntimeError::NoEnt(self.guid));
        }
        if st.ew_holder.is_some() || !st.holders.is_empty() {
            st.free_pending = true;
            return Ok(false);
        }
        st.freed = true;
        Ok(true)
    }

    pub fn is_held_by(&self, task: Guid) -> bool {
        let st = self.state.lock();
        st.ew_holder == Some(task) || st.holders.iter().any(|(t, _)| *t == task)
    }

    fn drain_queue(st: &mut DbState) -> Vec<AcquireWaiter> {
        let mut granted = Vec::new();
        while let Some(&w) = st.queue.front() {
            let busy = match w.mode {
                DbAccessMode::Ew => st.ew_holder.is_some() || !st.holders.is_empty(),
                _ => st.ew_holder.is_some(),
            };
            if busy {
                break;
            }
            st.queue.pop_front();
            match w.mode {
                DbAccessMode::Ew => st.ew_holder = Some(w.task),
                _ => st.holders.push((w.task, w.mode)),
            }
            granted.push(w);
            // One exclusive grant ends the wave.
            if w.mode == DbAccessMode::Ew {
                break;
            }
        }
        granted
    }
}

impl fmt::Debug for DataBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataBlock")
            .field("guid", &self.guid)
            .field("size", &self.size)
            .field("props", &self.props)
            .finish()
    }
}
