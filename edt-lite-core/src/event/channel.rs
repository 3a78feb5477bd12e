use crate::errors::{Result, RuntimeError};
use crate::event::{Event, KindState};
use crate::guid::{Guid, RegNode, UNINITIALIZED_GUID};
use crate::pd::PolicyDomain;
use std::sync::Arc;

/// `max_gen` value selecting geometric growth instead of back-pressure.
pub const UNBOUNDED: u32 = u32::MAX;

/// Buffer generations allocated up front in unbounded mode.
const UNBOUNDED_INITIAL_GEN: u32 = 4;

/// Twin ring buffers: queued satisfactions on one side, queued waiter
/// registrations on the other. A satisfy meeting a queued waiter (or a
/// registration meeting a queued satisfy) fires one coupled pair in FIFO
/// order; otherwise it queues on its own side. The `max_gen * nb_sat` /
/// `max_gen * nb_deps` capacities bound how many generations may be in
/// flight at once.
pub struct ChannelState {
    pub max_gen: u32,
    pub nb_sat: u32,
    pub nb_deps: u32,
    sat_head: u64,
    sat_tail: u64,
    sat_buf: Vec<Guid>,
    wait_head: u64,
    wait_tail: u64,
    wait_buf: Vec<RegNode>,
}

impl ChannelState {
    pub fn new(max_gen: u32, nb_sat: u32, nb_deps: u32) -> Result<ChannelState> {
        if nb_sat == 0 || nb_deps == 0 {
            return Err(RuntimeError::Inval("channel needs nb_sat > 0 and nb_deps > 0"));
        }
        if max_gen == 0 {
            return Err(RuntimeError::Inval("channel needs max_gen > 0"));
        }
        let gens = if max_gen == UNBOUNDED {
            UNBOUNDED_INITIAL_GEN
        } else {
            max_gen
        };
        Ok(ChannelState {
            max_gen,
            nb_sat,
            nb_deps,
            sat_head: 0,
            sat_tail: 0,
            sat_buf: vec![UNINITIALIZED_GUID; (gens * nb_sat) as usize],
            wait_head: 0,
            wait_tail: 0,
            wait_buf: vec![
                RegNode::new(UNINITIALIZED_GUID, 0, crate::guid::DbAccessMode::NullMode);
                (gens * nb_deps) as usize
            ],
        })
    }

    fn sat_count(&self) -> u64 {
        self.sat_tail - self.sat_head
    }

    fn wait_count(&self) -> u64 {
        self.wait_tail - self.wait_head
    }

    fn pop_satisfy(&mut self) -> Option<Guid> {
        if self.sat_count() == 0 {
            return None;
        }
        let idx = (self.sat_head % self.sat_buf.len() as u64) as usize;
        self.sat_head += 1;
        Some(self.sat_buf[idx])
    }

    fn pop_dependence(&mut self) -> Option<RegNode> {
        if self.wait_count() == 0 {
            return None;
        }
        let idx = (self.wait_head % self.wait_buf.len() as u64) as usize;
        self.wait_head += 1;
        Some(self.wait_buf[idx])
    }

    fn push_satisfy(&mut self, data: Guid) -> Result<()> {
        if self.sat_count() == self.sat_buf.len() as u64 {
            if self.max_gen == UNBOUNDED {
                self.sat_buf = Self::resize(&self.sat_buf, self.sat_head, UNINITIALIZED_GUID);
                self.sat_tail -= self.sat_head;
                self.sat_head = 0;
            } else {
                return Err(RuntimeError::Busy(UNINITIALIZED_GUID));
            }
        }
        let idx = (self.sat_tail % self.sat_buf.len() as u64) as usize;
        self.sat_buf[idx] = data;
        self.sat_tail += 1;
        Ok(())
    }

    fn push_dependence(&mut self, node: RegNode) -> Result<()> {
        if self.wait_count() == self.wait_buf.len() as u64 {
            if self.max_gen == UNBOUNDED {
                let filler =
                    RegNode::new(UNINITIALIZED_GUID, 0, crate::guid::DbAccessMode::NullMode);
                self.wait_buf = Self::resize(&self.wait_buf, self.wait_head, filler);
                self.wait_tail -= self.wait_head;
                self.wait_head = 0;
            } else {
                return Err(RuntimeError::Busy(UNINITIALIZED_GUID));
            }
        }
        let idx = (self.wait_tail % self.wait_buf.len() as u64) as usize;
        self.wait_buf[idx] = node;
        self.wait_tail += 1;
        Ok(())
    }

    /// Double the capacity, unrolling the ring so head lands at zero.
    fn resize<T: Copy>(buf: &[T], head: u64, filler: T) -> Vec<T> {
        let old_cap = buf.len() as u64;
        let mut next = vec![filler; buf.len() * 2];
        for i in 0..old_cap {
            next[i as usize] = buf[((head + i) % old_cap) as usize];
        }
        next
    }

    /// Non-consuming probe: the head satisfy once a full generation of both
    /// sides has accumulated, UNINITIALIZED otherwise.
    pub fn peek(&self) -> Guid {
        if self.sat_count() >= u64::from(self.nb_sat) && self.wait_count() >= u64::from(self.nb_deps)
        {
            self.sat_buf[(self.sat_head % self.sat_buf.len() as u64) as usize]
        } else {
            UNINITIALIZED_GUID
        }
    }
}

fn channel_state(evt: &Event) -> &spin::Mutex<ChannelState> {
    match &evt.kstate {
        KindState::Channel(ch) => ch,
        _ => unreachable!("channel op on non-channel event"),
    }
}

/// A producer satisfy: fire against the oldest queued waiter, or queue.
pub fn satisfy(pd: &PolicyDomain, evt: &Arc<Event>, payload: Guid, slot: u32) -> Result<()> {
    let popped = {
        let mut ch = channel_state(evt).lock();
        match ch.pop_dependence() {
            Some(node) => Some(node),
            None => {
                ch.push_satisfy(payload)?;
                None
            }
        }
    };
    if let Some(node) = popped {
        let _ = slot;
        pd.satisfy_regnode(evt.guid, &node, payload)?;
    }
    Ok(())
}

/// A consumer registration: couple with the oldest queued satisfy, or queue.
pub fn register_waiter(pd: &PolicyDomain, evt: &Arc<Event>, node: RegNode) -> Result<()> {
    let fired = {
        let mut ch = channel_state(evt).lock();
        match ch.pop_satisfy() {
            Some(data) => Some(data),
            None => {
                ch.push_dependence(node)?;
                None
            }
        }
    };
    if let Some(data) = fired {
        pd.satisfy_regnode(evt.guid, &node, data)?;
    }
    Ok(())
}
