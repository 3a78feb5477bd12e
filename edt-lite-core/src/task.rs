use crate::datablock::DataBlock;
use crate::deferred::DeferredChain;
use crate::errors::{Result, RuntimeError};
use crate::event::{LATCH_DECR_SLOT, LATCH_INCR_SLOT};
use crate::guid::{
    DbAccessMode, Guid, GuidKind, RegNode, NULL_GUID, SLOT_REGISTERED_EPHEMERAL_EVT,
    SLOT_SATISFIED_DB, SLOT_SATISFIED_EVT, UNINITIALIZED_GUID,
};
use crate::hint::Hint;
use crate::pd::PolicyDomain;
use spin::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct EdtProps: u32 {
        /// Open a finish scope: the output event fires only when every
        /// transitive descendant has completed.
        const FINISH        = 1 << 0;
        /// The caller wants an output event.
        const OEVT_VALID    = 1 << 1;
        const NO_HINT       = 1 << 2;
        const RT_HINT_ALLOC = 1 << 3;
        /// Long-running task: the output event is sticky instead of once.
        const LONG          = 1 << 4;
    }
}

/// Sentinel for "copy the count from the template".
pub const EDT_PARAM_DEF: u32 = u32::MAX;
/// Sentinel that is illegal at creation time.
pub const EDT_PARAM_UNK: u32 = u32::MAX - 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd)]
#[repr(u8)]
pub enum TaskState {
    Created = 0,
    /// Every slot satisfied; acquiring along the sorted frontier.
    AllDeps = 1,
    /// Every data-block acquired; waiting for a worker.
    AllAcq = 2,
    Running = 3,
    Reaping = 4,
}

impl TaskState {
    fn from_u8(v: u8) -> TaskState {
        match v {
            0 => TaskState::Created,
            1 => TaskState::AllDeps,
            2 => TaskState::AllAcq,
            3 => TaskState::Running,
            _ => TaskState::Reaping,
        }
    }
}

/// Authoritative copy vs stub left behind after a move.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MdState {
    Master = 0,
    Ghost = 1,
}

// ─── Function & template ──────────────────────────────────────

/// What a task receives when it runs.
pub struct EdtContext {
    pub paramv: Vec<u64>,
    pub depv: Vec<ResolvedDep>,
    pd: Arc<PolicyDomain>,
    task: Arc<Task>,
}

impl EdtContext {
    pub(crate) fn new(pd: Arc<PolicyDomain>, task: Arc<Task>, depv: Vec<ResolvedDep>) -> Self {
        Self {
            paramv: task.paramv.clone(),
            depv,
            pd,
            task,
        }
    }

    pub fn pd(&self) -> &Arc<PolicyDomain> {
        &self.pd
    }

    pub fn self_guid(&self) -> Guid {
        self.task.guid
    }

    pub fn depc(&self) -> u32 {
        self.task.depc
    }

    /// The acquired block on `slot`, if a block flowed down that edge.
    pub fn db(&self, slot: usize) -> Option<&Arc<DataBlock>> {
        self.depv.get(slot).and_then(|d| d.db.as_ref())
    }

    /// Capture a call onto this task's deferred chain; it replays after the
    /// function returns. Non-deferrable operations return E_PERM and should
    /// be issued synchronously instead.
    pub fn defer(&self, payload: crate::msg::Payload) -> Result<()> {
        let mut msg = crate::msg::PolicyMsg::request(
            self.pd.location(),
            self.pd.location(),
            payload,
        );
        msg.issuer = self.task.guid;
        crate::deferred::defer(&self.pd, &self.task, msg)
    }
}

pub type EdtFn = dyn Fn(&mut EdtContext) -> Guid + Send + Sync;

/// Shared handle to a task function. Functions are process-wide values, so
/// a moved task re-materialises with the same handle.
#[derive(Clone)]
pub struct EdtFunc(pub Arc<EdtFn>);

impl EdtFunc {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&mut EdtContext) -> Guid + Send + Sync + 'static,
    {
        EdtFunc(Arc::new(f))
    }
}

impl fmt::Debug for EdtFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EdtFunc(..)")
    }
}

/// `{guid, func, paramc, depc, name, hint}`.
pub struct TaskTemplate {
    pub guid: Guid,
    pub func: EdtFunc,
    pub paramc: u32,
    pub depc: u32,
    pub name: String,
    pub hint: Mutex<Hint>,
}

impl TaskTemplate {
    pub fn new(guid: Guid, func: EdtFunc, paramc: u32, depc: u32, name: &str) -> Arc<Self> {
        Arc::new(TaskTemplate {
            guid,
            func,
            paramc,
            depc,
            name: name.to_string(),
            hint: Mutex::new(Hint::default()),
        })
    }
}

// ─── Instance ─────────────────────────────────────────────────

/// A `{guid, ptr, mode}` triple handed to user code.
#[derive(Clone)]
pub struct ResolvedDep {
    pub guid: Guid,
    pub db: Option<Arc<DataBlock>>,
    pub mode: DbAccessMode,
}

pub struct TaskInner {
    /// Insertion form: one entry per slot, later sorted by guid for the
    /// acquire walk. The `slot` field degrades into the SLOT_* sentinels.
    pub signalers: Vec<RegNode>,
    /// Registration cursor before ALLDEPS, acquisition cursor after.
    pub frontier_slot: u32,
    pub resolved: Vec<ResolvedDep>,
    /// Blocks created or acquired dynamically during execution.
    pub unk_dbs: Vec<Guid>,
    /// Slots whose block also appears on an earlier slot; released once.
    pub do_not_release: Vec<u64>,
    /// Latch opened by this task's prologue (finish scope or remote proxy).
    pub finish_latch: Guid,
}

pub struct Task {
    pub guid: Guid,
    pub template: Guid,
    pub func: EdtFunc,
    pub paramv: Vec<u64>,
    pub depc: u32,
    pub props: EdtProps,
    pub output_event: Guid,
    /// The finish-scope latch this task checked into at creation.
    pub parent_latch: Guid,
    state: AtomicU8,
    md_state: AtomicU8,
    pub slot_satisfied_count: AtomicU32,
    pub inner: Mutex<TaskInner>,
    pub hint: Mutex<Hint>,
    pub deferred: Mutex<DeferredChain>,
}

impl Task {
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, s: TaskState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub fn md_state(&self) -> MdState {
        if self.md_state.load(Ordering::Acquire) == MdState::Ghost as u8 {
            MdState::Ghost
        } else {
            MdState::Master
        }
    }

    pub fn set_ghost(&self) {
        self.md_state.store(MdState::Ghost as u8, Ordering::Release);
    }

    /// The latch children created by this task check into.
    pub fn effective_parent_latch(&self) -> Guid {
        let opened = self.inner.lock().finish_latch;
        if !opened.is_null() {
            opened
        } else {
            self.parent_latch
        }
    }

    /// Serializable-enough form for a move push.
    pub fn snapshot(&self) -> TaskSnapshot {
        let inner = self.inner.lock();
        TaskSnapshot {
            guid: self.guid,
            template: self.template,
            func: self.func.clone(),
            paramv: self.paramv.clone(),
            depc: self.depc,
            props: self.props,
            output_event: self.output_event,
            parent_latch: self.parent_latch,
            signalers: inner.signalers.clone(),
        }
    }
}

/// A moved task's state: enough to re-materialise and acquire at the
/// destination. Only fully-satisfied, not-yet-acquiring tasks move.
#[derive(Clone)]
pub struct TaskSnapshot {
    pub guid: Guid,
    pub template: Guid,
    pub func: EdtFunc,
    pub paramv: Vec<u64>,
    pub depc: u32,
    pub props: EdtProps,
    pub output_event: Guid,
    pub parent_latch: Guid,
    pub signalers: Vec<RegNode>,
}

/// Re-materialise a moved task. Only fully-satisfied (or zero-dep) tasks
/// move, so the satisfied count is closed and the destination immediately
/// runs the acquire walk.
pub fn from_snapshot(snap: TaskSnapshot) -> Arc<Task> {
    let depc = snap.depc;
    Arc::new(Task {
        guid: snap.guid,
        template: snap.template,
        func: snap.func,
        paramv: snap.paramv,
        depc,
        props: snap.props,
        output_event: snap.output_event,
        parent_latch: snap.parent_latch,
        state: AtomicU8::new(TaskState::Created as u8),
        md_state: AtomicU8::new(MdState::Master as u8),
        slot_satisfied_count: AtomicU32::new(depc),
        inner: Mutex::new(TaskInner {
            signalers: snap.signalers,
            frontier_slot: 0,
            resolved: Vec::new(),
            unk_dbs: Vec::new(),
            do_not_release: vec![0; (depc as usize + 63) / 64],
            finish_latch: NULL_GUID,
        }),
        hint: Mutex::new(Hint::default()),
        deferred: Mutex::new(DeferredChain::new()),
    })
}

pub struct CreateArgs {
    pub template: Arc<TaskTemplate>,
    pub paramv: Vec<u64>,
    pub depc: Option<u32>,
    pub props: EdtProps,
    pub hint: Option<Hint>,
    pub parent_latch: Guid,
    pub output_event: Guid,
}

/// `newTask`: validate against the template and build the instance.
/// Signalers start `{UNINITIALIZED, i, NULL}`; a zero-dep task is handed to
/// the satisfied path by the caller.
pub fn create(pd: &PolicyDomain, guid: Guid, args: CreateArgs) -> Result<Arc<Task>> {
    let task = create_detached(guid, args)?;
    // Check into the enclosing finish scope.
    if !task.parent_latch.is_null() {
        pd.satisfy_regnode(
            task.guid,
            &RegNode::new(task.parent_latch, LATCH_INCR_SLOT, DbAccessMode::NullMode),
            NULL_GUID,
        )?;
    }
    Ok(task)
}

/// Instance construction alone, without the finish-scope check-in.
pub fn create_detached(guid: Guid, args: CreateArgs) -> Result<Arc<Task>> {
    let tpl = &args.template;
    if args.paramv.len() as u32 != tpl.paramc && tpl.paramc != EDT_PARAM_DEF {
        return Err(RuntimeError::Inval("paramv length does not match template"));
    }
    let depc = match args.depc {
        None => tpl.depc,
        Some(EDT_PARAM_UNK) => {
            return Err(RuntimeError::Inval("EDT_PARAM_UNK is illegal at creation"))
        }
        Some(EDT_PARAM_DEF) => tpl.depc,
        Some(d) => d,
    };
    let mut hint = if args.props.contains(EdtProps::NO_HINT) {
        Hint::default()
    } else {
        tpl.hint.lock().clone()
    };
    if let Some(h) = &args.hint {
        hint.merge_from(h);
    }
    let signalers = (0..depc)
        .map(|i| RegNode::new(UNINITIALIZED_GUID, i, DbAccessMode::NullMode))
        .collect();
    let task = Arc::new(Task {
        guid,
        template: tpl.guid,
        func: tpl.func.clone(),
        paramv: args.paramv,
        depc,
        props: args.props,
        output_event: args.output_event,
        parent_latch: args.parent_latch,
        state: AtomicU8::new(TaskState::Created as u8),
        md_state: AtomicU8::new(MdState::Master as u8),
        slot_satisfied_count: AtomicU32::new(0),
        inner: Mutex::new(TaskInner {
            signalers,
            frontier_slot: 0,
            resolved: Vec::new(),
            unk_dbs: Vec::new(),
            do_not_release: vec![0; (depc as usize + 63) / 64],
            finish_latch: NULL_GUID,
        }),
        hint: Mutex::new(hint),
        deferred: Mutex::new(DeferredChain::new()),
    });
    Ok(task)
}

// ─── Registration ─────────────────────────────────────────────

/// Record `signaler` on `slot`. Persistent events are pull-mode: the task
/// registers on the event only when its frontier reaches the slot.
/// Ephemeral events are push-mode (the caller registers the task on the
/// event's waiter list). A data-block converts into an immediate satisfy.
pub fn register_signaler(
    pd: &PolicyDomain,
    task: &Arc<Task>,
    signaler: Guid,
    slot: u32,
    mode: DbAccessMode,
) -> Result<()> {
    if slot >= task.depc {
        return Err(RuntimeError::Inval("dependence slot out of bounds"));
    }
    let kind = signaler.kind();
    let mut register_now = false;
    {
        let mut inner = task.inner.lock();
        let node = &mut inner.signalers[slot as usize];
        debug_assert_eq!(node.slot, slot);
        node.mode = mode;
        node.guid = signaler;
        match kind {
            GuidKind::EventOnce | GuidKind::EventLatch | GuidKind::EventChannel
            | GuidKind::EventCollective => {
                node.slot = SLOT_REGISTERED_EPHEMERAL_EVT;
            }
            k if k.is_persistent_event() => {
                // Register lazily unless we sit on the frontier already.
                register_now = slot == inner.frontier_slot;
            }
            GuidKind::Db => {
                node.slot = SLOT_SATISFIED_DB;
            }
            _ => return Err(RuntimeError::Inval("signaler kind cannot feed a task")),
        }
    }
    if kind == GuidKind::Db {
        // Convert to a satisfy now that the mode is recorded.
        return pd.satisfy_regnode(
            NULL_GUID,
            &RegNode::new(task.guid, slot, mode),
            signaler,
        );
    }
    if register_now {
        register_on_frontier(pd, task, slot)?;
    }
    Ok(())
}

/// The task registers itself as a waiter of the persistent event sitting on
/// the frontier slot.
fn register_on_frontier(pd: &PolicyDomain, task: &Arc<Task>, slot: u32) -> Result<()> {
    let node = task.inner.lock().signalers[slot as usize];
    pd.register_waiter_on_event(node.guid, task.guid, slot, node.mode)
}

// ─── Satisfaction ─────────────────────────────────────────────

/// Classic (lock-protected) satisfy: write the payload into the slot,
/// advance the registration frontier, fire the all-satisfied transition at
/// `depc`.
pub fn satisfy(pd: &PolicyDomain, task: &Arc<Task>, data: Guid, slot: u32) -> Result<()> {
    if slot >= task.depc {
        return Err(RuntimeError::Inval("satisfy slot out of bounds"));
    }
    let mut register_slot = None;
    {
        let mut inner = task.inner.lock();
        let depc = task.depc;
        if inner.signalers[slot as usize].slot == SLOT_SATISFIED_EVT {
            return Err(RuntimeError::Perm("slot satisfied twice"));
        }
        let count = task.slot_satisfied_count.load(Ordering::Acquire);
        debug_assert!(count < depc);
        inner.signalers[slot as usize].guid = data;
        if inner.signalers[slot as usize].slot != SLOT_SATISFIED_DB {
            inner.signalers[slot as usize].slot = SLOT_SATISFIED_EVT;
        }
        task.slot_satisfied_count.store(count + 1, Ordering::Release);
        if count + 1 == depc {
            drop(inner);
            return all_depv_satisfied(pd, task);
        }
        if slot == inner.frontier_slot {
            // Hop over every already-satisfied slot.
            while inner.frontier_slot != depc - 1 {
                inner.frontier_slot += 1;
                let s = inner.signalers[inner.frontier_slot as usize].slot;
                if s != SLOT_SATISFIED_EVT && s != SLOT_SATISFIED_DB {
                    break;
                }
            }
            let f = inner.frontier_slot;
            let node = inner.signalers[f as usize];
            // A persistent signaler is known but the task has not yet
            // registered on it: do so now, outside the lock.
            if !node.guid.is_uninitialized() && node.slot == f {
                register_slot = Some(f);
            }
        }
    }
    if let Some(f) = register_slot {
        register_on_frontier(pd, task, f)?;
    }
    Ok(())
}

/// Every slot satisfied: reset slots, sort by guid, start acquiring.
pub fn all_depv_satisfied(pd: &PolicyDomain, task: &Arc<Task>) -> Result<()> {
    // Mark the count as closed (depc + 1 sentinel).
    task.slot_satisfied_count.fetch_add(1, Ordering::AcqRel);
    task.set_state(TaskState::AllDeps);
    if task.depc > 0 {
        let mut inner = task.inner.lock();
        let depc = task.depc as usize;
        let mut resolved = Vec::with_capacity(depc);
        for i in 0..depc {
            let node = &mut inner.signalers[i];
            debug_assert!(!node.guid.is_uninitialized() && !node.guid.is_error());
            if node.mode == DbAccessMode::NullMode {
                node.guid = NULL_GUID;
            }
            node.slot = i as u32;
            resolved.push(ResolvedDep {
                guid: node.guid,
                db: None,
                mode: node.mode,
            });
        }
        inner.resolved = resolved;
        // Acquisition order: guid-ascending, stable.
        inner.signalers.sort_by_key(|n| n.guid);
        inner.frontier_slot = 0;
    }
    if !iterate_db_frontier(pd, task)? {
        schedule_task(pd, task)?;
    }
    Ok(())
}

/// Walk the sorted vector acquiring each block. Returns true when an
/// acquire went pending (the task parks; the ack re-enters through
/// [`dependence_resolved`]).
fn iterate_db_frontier(pd: &PolicyDomain, task: &Arc<Task>) -> Result<bool> {
    loop {
        let (node, dup_of) = {
            let mut inner = task.inner.lock();
            let i = inner.frontier_slot as usize;
            if i >= task.depc as usize {
                return Ok(false);
            }
            // Pre-increment; a pending ack adjusts by -1.
            inner.frontier_slot += 1;
            let node = inner.signalers[i];
            let dup = i > 0 && inner.signalers[i - 1].guid == node.guid;
            (node, dup)
        };
        if node.guid.is_null() {
            continue;
        }
        if dup_of {
            let mut inner = task.inner.lock();
            let i = inner.frontier_slot as usize - 1;
            let prev_slot = inner.signalers[i - 1].slot as usize;
            let handle = inner.resolved[prev_slot].db.clone();
            inner.resolved[node.slot as usize].db = handle;
            inner.do_not_release[node.slot as usize / 64] |= 1 << (node.slot % 64);
            continue;
        }
        match pd.acquire_db(node.guid, task, node.slot, node.mode)? {
            Some(handle) => {
                task.inner.lock().resolved[node.slot as usize].db = Some(handle);
            }
            None => return Ok(true),
        }
    }
}

/// Acquire ack on the runtime slot (`depc + 1`): fill the pending slot and
/// resume the walk.
pub fn dependence_resolved(
    pd: &PolicyDomain,
    task: &Arc<Task>,
    db_guid: Guid,
    handle: Arc<DataBlock>,
) -> Result<()> {
    {
        let mut inner = task.inner.lock();
        let idx = inner.frontier_slot as usize - 1;
        debug_assert_eq!(inner.signalers[idx].guid, db_guid);
        let slot = inner.signalers[idx].slot as usize;
        inner.resolved[slot].db = Some(handle);
    }
    if !iterate_db_frontier(pd, task)? {
        schedule_task(pd, task)?;
    }
    Ok(())
}

fn schedule_task(pd: &PolicyDomain, task: &Arc<Task>) -> Result<()> {
    task.set_state(TaskState::AllAcq);
    pd.scheduler_give(task.clone())
}

// ─── Execution ────────────────────────────────────────────────

/// Run the task on the calling worker: prologue (finish/proxy latch), user
/// function, deferred replay, epilogue (release + latch/output cascade).
pub fn execute(pd: &Arc<PolicyDomain>, task: &Arc<Task>) -> Result<()> {
    task.set_state(TaskState::Running);

    // Prologue: open a finish latch, or a proxy when the parent latch is
    // remote so the scope pays one cross-domain decrement instead of one
    // per child.
    let opened_latch = if task.props.contains(EdtProps::FINISH) {
        let latch = pd.create_finish_latch(task.output_event, task.parent_latch)?;
        task.inner.lock().finish_latch = latch;
        latch
    } else if !task.parent_latch.is_null() && task.parent_latch.location() != pd.location() {
        let latch = pd.create_finish_latch(NULL_GUID, task.parent_latch)?;
        task.inner.lock().finish_latch = latch;
        latch
    } else {
        NULL_GUID
    };

    let depv = task.inner.lock().resolved.clone();
    let mut ctx = EdtContext::new(pd.clone(), task.clone(), depv);
    let ret = (task.func.0)(&mut ctx);
    drop(ctx);

    // Deferred calls queued during the run are replayed before the
    // epilogue touches any block. A failing strand stops the chain but
    // never the epilogue.
    if let Err(e) = crate::deferred::replay(pd, task) {
        tracing::warn!(task = %task.guid, err = %e, "deferred chain aborted");
    }

    epilogue(pd, task, ret, opened_latch)
}

fn epilogue(pd: &PolicyDomain, task: &Arc<Task>, ret: Guid, opened_latch: Guid) -> Result<()> {
    // Release every dependence block exactly once.
    let (to_release, unk_dbs) = {
        let mut inner = task.inner.lock();
        let mut rel = Vec::new();
        for (slot, dep) in inner.resolved.iter().enumerate() {
            if dep.db.is_none() {
                continue;
            }
            if inner.do_not_release[slot / 64] & (1 << (slot % 64)) != 0 {
                continue;
            }
            rel.push(dep.guid);
        }
        (rel, std::mem::take(&mut inner.unk_dbs))
    };
    for db in to_release {
        pd.release_db(db, task.guid)?;
    }
    for db in unk_dbs {
        pd.release_db(db, task.guid)?;
    }

    let finish_payload = if ret.is_uninitialized() { NULL_GUID } else { ret };
    if !opened_latch.is_null() {
        // (a) Close the scope; the latch cascades to the output event and
        // the parent latch.
        if !task.props.contains(EdtProps::FINISH) && !task.output_event.is_null() {
            // Proxy scope: the output event is not wired into the proxy.
            pd.satisfy_regnode(
                task.guid,
                &RegNode::new(task.output_event, 0, DbAccessMode::NullMode),
                finish_payload,
            )?;
        }
        pd.satisfy_regnode(
            task.guid,
            &RegNode::new(opened_latch, LATCH_DECR_SLOT, DbAccessMode::NullMode),
            finish_payload,
        )?;
    } else {
        // (b)/(c) Check out of the parent scope and fire the output event.
        if !task.parent_latch.is_null() {
            pd.satisfy_regnode(
                task.guid,
                &RegNode::new(task.parent_latch, LATCH_DECR_SLOT, DbAccessMode::NullMode),
                NULL_GUID,
            )?;
        }
        if !task.output_event.is_null() {
            pd.satisfy_regnode(
                task.guid,
                &RegNode::new(task.output_event, 0, DbAccessMode::NullMode),
                finish_payload,
            )?;
        }
    }

    task.set_state(TaskState::Reaping);
    pd.stats.edt_finished();
    pd.release_guid(task.guid);
    Ok(())
}

// ─── Destruction ──────────────────────────────────────────────

/// Legal only before the dependences resolve or after the run. A destroyed
/// CREATED task balances its finish-scope check-in.
pub fn destroy(pd: &PolicyDomain, task: &Arc<Task>) -> Result<()> {
    match task.state() {
        TaskState::Created => {
            if !task.parent_latch.is_null() {
                pd.satisfy_regnode(
                    task.guid,
                    &RegNode::new(task.parent_latch, LATCH_DECR_SLOT, DbAccessMode::NullMode),
                    NULL_GUID,
                )?;
            }
            pd.release_guid(task.guid);
            Ok(())
        }
        TaskState::Reaping => {
            pd.release_guid(task.guid);
            Ok(())
        }
        _ => Err(RuntimeError::Perm("task destroyed while in flight")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn props_bits_are_disjoint() {
        assert!(!EdtProps::FINISH.intersects(EdtProps::OEVT_VALID | EdtProps::LONG));
    }

    #[test]
    fn state_round_trip() {
        for s in [
            TaskState::Created,
            TaskState::AllDeps,
            TaskState::AllAcq,
            TaskState::Running,
            TaskState::Reaping,
        ] {
            assert_eq!(TaskState::from_u8(s as u8), s);
        }
    }

    #[test]
    fn param_sentinels_distinct() {
        assert_ne!(EDT_PARAM_DEF, EDT_PARAM_UNK);
    }
}
