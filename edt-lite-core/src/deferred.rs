use crate::errors::{Result, RuntimeError};
use crate::guid::GuidKind;
use crate::msg::{Payload, PolicyMsg};
use crate::pd::PolicyDomain;
use crate::task::Task;
use std::sync::Arc;

/// One captured call: a heap copy of the policy message, chained after the
/// previous deferred call of the same task. A strand becomes ready when its
/// predecessor has been processed; the head is armed by the epilogue path.
pub struct Strand {
    pub msg: PolicyMsg,
    pub ready: bool,
}

/// Per-task chain of deferred calls, replayed in capture order after the
/// user function returns and before the epilogue releases anything.
pub struct DeferredChain {
    strands: Vec<Strand>,
}

impl DeferredChain {
    pub fn new() -> Self {
        Self {
            strands: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.strands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.strands.len()
    }
}

impl Default for DeferredChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether an operation may be deferred at all. Operations whose output
/// feeds the same task within the chain (block creation and release paired
/// with dynamic add/remove) must run synchronously.
fn deferrable(payload: &Payload) -> bool {
    !matches!(
        payload,
        Payload::DbCreate { .. }
            | Payload::DbRelease { .. }
            | Payload::DbFree { .. }
            | Payload::DepDynAdd { .. }
            | Payload::DepDynRemove { .. }
    )
}

/// Capture `msg` onto the task's chain. Creation operations allocate their
/// guid eagerly so later strands can refer to the object. Returns E_PERM
/// for non-deferrable calls; the caller retries synchronously.
pub fn defer(pd: &PolicyDomain, task: &Arc<Task>, mut msg: PolicyMsg) -> Result<()> {
    if !deferrable(&msg.payload) {
        return Err(RuntimeError::Perm("operation is not deferrable"));
    }
    match &mut msg.payload {
        Payload::WorkCreate { guid_out, .. } => {
            *guid_out = pd.allocate_guid(GuidKind::Edt);
        }
        Payload::EvtCreate { kind, guid_out, .. } => {
            *guid_out = pd.allocate_guid(*kind);
        }
        _ => {}
    }
    task.deferred.lock().strands.push(Strand { msg, ready: false });
    Ok(())
}

/// Replay the chain in order. Each strand is marked ready as its
/// predecessor completes; a strand that fails stops the chain.
pub fn replay(pd: &PolicyDomain, task: &Arc<Task>) -> Result<()> {
    let mut strands = {
        let mut chain = task.deferred.lock();
        std::mem::take(&mut chain.strands)
    };
    if strands.is_empty() {
        return Ok(());
    }
    // Arm the head; the rest become ready as their predecessor completes.
    strands[0].ready = true;
    for i in 0..strands.len() {
        debug_assert!(strands[i].ready);
        let mut msg = strands[i].msg.clone();
        pd.process_message(&mut msg)?;
        if i + 1 < strands.len() {
            strands[i + 1].ready = true;
        }
    }
    Ok(())
}
