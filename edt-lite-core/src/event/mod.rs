pub mod channel;
pub mod collective;

use crate::errors::{Result, RuntimeError};
use crate::guid::{
    DbAccessMode, Guid, GuidKind, Location, RegNode, NULL_GUID, UNINITIALIZED_GUID,
};
use crate::hint::Hint;
use crate::msg::{MdMode, MdPayload};
use crate::pd::PolicyDomain;
use serde::{Deserialize, Serialize};
use spin::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

pub use channel::ChannelState;
pub use collective::{CollectiveParams, CollectiveState, RedOp};

// ─── Waiter-count sentinels ───────────────────────────────────
//
// `waiters_count` is either a live waiter count or one of these. The CAS
// ladder between a satisfy flush and a racing destroy guarantees exactly
// one free: satisfy does CHECKED_IN -> CHECKED_OUT once its flush is done;
// a destroy that observes CHECKED_IN does CHECKED_IN -> DESTROY_SEEN and
// leaves the free to the satisfier whose CAS then fails.

pub const STATE_CHECKED_IN: u32 = u32::MAX;
pub const STATE_CHECKED_OUT: u32 = u32::MAX - 1;
pub const STATE_DESTROY_SEEN: u32 = u32::MAX - 2;

/// Latch slots.
pub const LATCH_INCR_SLOT: u32 = 0;
pub const LATCH_DECR_SLOT: u32 = 1;

/// The seven event kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Once,
    Latch,
    Sticky,
    Idem,
    Counted,
    Channel,
    Collective,
}

impl EventKind {
    pub fn guid_kind(self) -> GuidKind {
        match self {
            EventKind::Once => GuidKind::EventOnce,
            EventKind::Latch => GuidKind::EventLatch,
            EventKind::Sticky => GuidKind::EventSticky,
            EventKind::Idem => GuidKind::EventIdem,
            EventKind::Counted => GuidKind::EventCounted,
            EventKind::Channel => GuidKind::EventChannel,
            EventKind::Collective => GuidKind::EventCollective,
        }
    }

    pub fn from_guid_kind(kind: GuidKind) -> Option<EventKind> {
        Some(match kind {
            GuidKind::EventOnce => EventKind::Once,
            GuidKind::EventLatch => EventKind::Latch,
            GuidKind::EventSticky => EventKind::Sticky,
            GuidKind::EventIdem => EventKind::Idem,
            GuidKind::EventCounted => EventKind::Counted,
            GuidKind::EventChannel => EventKind::Channel,
            GuidKind::EventCollective => EventKind::Collective,
        _ => return None,
        })
    }

    /// Sticky, idempotent and counted events retain their payload.
    pub fn is_persistent(self) -> bool {
        matches!(self, EventKind::Sticky | EventKind::Idem | EventKind::Counted)
    }
}

/// Kind-specific creation parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum EventParams {
    Latch {
        counter: i64,
    },
    /// `nb_deps` registrations are expected; the event self-destroys when
    /// they have all observed the satisfaction. Destroying the event before
    /// the registrations drain is undefined.
    Counted {
        nb_deps: u64,
    },
    Channel {
        /// `channel::UNBOUNDED` grows the buffers geometrically instead of
        /// applying back-pressure.
        max_gen: u32,
        nb_sat: u32,
        nb_deps: u32,
    },
    Collective(CollectiveParams),
}

/// Distributed-metadata bookkeeping shared by every event.
#[derive(Debug, Default)]
pub struct MdClass {
    /// Location the local satisfy notification came from; never echoed to.
    pub sat_from: Option<Location>,
    pub del_from: Option<Location>,
    /// Remote domains holding a copy; each eventually receives M_SAT or M_DEL.
    pub peers: Vec<Location>,
}

/// State under the event's waiter lock.
pub struct EventInner {
    pub waiters: Vec<RegNode>,
    pub md: MdClass,
    pub hint: Hint,
    /// Counted events: remaining registrations before self-destruction.
    pub nb_deps: u64,
}

pub enum KindState {
    Plain,
    Latch { counter: AtomicI64 },
    Channel(Mutex<ChannelState>),
    Collective(Box<CollectiveState>),
}

/// A synchronisation object. One struct for all seven kinds; dispatch is a
/// match on `kind`.
pub struct Event {
    pub guid: Guid,
    pub kind: EventKind,
    pub inner: Mutex<EventInner>,
    /// Live waiter count or one of the STATE_* sentinels.
    pub waiters_count: AtomicU32,
    /// Persistent payload; UNINITIALIZED until the event fires.
    data: AtomicU64,
    pub kstate: KindState,
}

impl Event {
    pub fn new(guid: Guid, kind: EventKind, params: Option<&EventParams>) -> Result<Arc<Event>> {
        let mut nb_deps = 0;
        let kstate = match kind {
            EventKind::Latch => {
                let counter = match params {
                    Some(EventParams::Latch { counter }) => *counter,
                    None => 0,
                    _ => return Err(RuntimeError::Inval("latch params expected")),
                };
                if counter < 0 {
                    return Err(RuntimeError::Inval("latch counter must be non-negative"));
                }
                KindState::Latch {
                    counter: AtomicI64::new(counter),
                }
            }
            EventKind::Counted => {
                nb_deps = match params {
                    Some(EventParams::Counted { nb_deps }) => *nb_deps,
                    _ => return Err(RuntimeError::Inval("counted params expected")),
                };
                if nb_deps == 0 {
                    return Err(RuntimeError::Inval("counted event needs nb_deps > 0"));
                }
                KindState::Plain
            }
            EventKind::Channel => {
                let st = match params {
                    Some(EventParams::Channel {
                        max_gen,
                        nb_sat,
                        nb_deps,
                    }) => ChannelState::new(*max_gen, *nb_sat, *nb_deps)?,
                    _ => return Err(RuntimeError::Inval("channel params expected")),
                };
                KindState::Channel(Mutex::new(st))
            }
            EventKind::Collective => {
                return Err(RuntimeError::Inval(
                    "collective events are created through their labelled path",
                ))
            }
            _ => KindState::Plain,
        };
        Ok(Arc::new(Event {
            guid,
            kind,
            inner: Mutex::new(EventInner {
                waiters: Vec::new(),
                md: MdClass::default(),
                hint: Hint::default(),
                nb_deps,
            }),
            waiters_count: AtomicU32::new(0),
            data: AtomicU64::new(UNINITIALIZED_GUID.0),
            kstate,
        }))
    }

    /// Collective events are built from their tree state (labelled path).
    pub fn new_collective(guid: Guid, state: CollectiveState) -> Arc<Event> {
        Arc::new(Event {
            guid,
            kind: EventKind::Collective,
            inner: Mutex::new(EventInner {
                waiters: Vec::new(),
                md: MdClass::default(),
                hint: Hint::default(),
                nb_deps: 0,
            }),
            waiters_count: AtomicU32::new(0),
            data: AtomicU64::new(UNINITIALIZED_GUID.0),
            kstate: KindState::Collective(Box::new(state)),
        })
    }

    pub fn data(&self) -> Guid {
        Guid(self.data.load(Ordering::Acquire))
    }

    fn set_data(&self, g: Guid) {
        self.data.store(g.0, Ordering::Release);
    }

    /// `ocrEventGet`: payload for persistent kinds, a peek for channels,
    /// NULL for the ephemeral kinds.
    pub fn get(&self) -> Guid {
        match self.kind {
            EventKind::Sticky | EventKind::Idem | EventKind::Counted => self.data(),
            EventKind::Channel => match &self.kstate {
                KindState::Channel(ch) => ch.lock().peek(),
                _ => unreachable!(),
            },
            _ => NULL_GUID,
        }
    }

    pub fn latch_counter(&self) -> Option<i64> {
        match &self.kstate {
            KindState::Latch { counter } => Some(counter.load(Ordering::Acquire)),
            _ => None,
        }
    }

    /// Serializable snapshot of the metadata a clone pull moves.
    pub fn snapshot(&self) -> EventSnapshot {
        let inner = self.inner.lock();
        let channel = match &self.kstate {
            KindState::Channel(ch) => {
                let ch = ch.lock();
                Some((ch.max_gen, ch.nb_sat, ch.nb_deps))
            }
            _ => None,
        };
        EventSnapshot {
            guid: self.guid,
            kind: self.kind,
            data: self.data(),
            nb_deps: inner.nb_deps,
            latch_counter: self.latch_counter(),
            channel,
        }
    }
}

/// What a clone pull carries; `serialize . deserialize` is identity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventSnapshot {
    pub guid: Guid,
    pub kind: EventKind,
    pub data: Guid,
    pub nb_deps: u64,
    pub latch_counter: Option<i64>,
    /// `(max_gen, nb_sat, nb_deps)` for channel events.
    pub channel: Option<(u32, u32, u32)>,
}

impl EventSnapshot {
    /// Re-materialise a remote copy from a snapshot. The master's location
    /// becomes the sole initial peer so local satisfies propagate back.
    pub fn materialise(&self, master: Location) -> Result<Arc<Event>> {
        let params = match self.kind {
            EventKind::Latch => Some(EventParams::Latch {
                counter: self.latch_counter.unwrap_or(0),
            }),
            EventKind::Counted => Some(EventParams::Counted {
                nb_deps: self.nb_deps.max(1),
            }),
            EventKind::Channel => {
                let (max_gen, nb_sat, nb_deps) = self
                    .channel
                    .ok_or(RuntimeError::Inval("channel snapshot without params"))?;
                Some(EventParams::Channel {
                    max_gen,
                    nb_sat,
                    nb_deps,
                })
            }
            _ => None,
        };
        let evt = Event::new(self.guid, self.kind, params.as_ref())?;
        if !self.data.is_uninitialized() {
            evt.set_data(self.data);
            evt.waiters_count.store(STATE_CHECKED_IN, Ordering::Release);
        }
        evt.inner.lock().md.peers.push(master);
        Ok(evt)
    }
}

// ─── Satisfy ──────────────────────────────────────────────────

/// Satisfy `evt` on `slot` with `payload`. Kind dispatch; every waiter
/// notification goes back through the router as a DEP_SATISFY.
pub fn satisfy(pd: &PolicyDomain, evt: &Arc<Event>, payload: Guid, slot: u32) -> Result<()> {
    pd.stats.events_satisfied();
    match evt.kind {
        EventKind::Once => satisfy_once(pd, evt, payload, slot),
        EventKind::Latch => satisfy_latch(pd, evt, payload, slot),
        EventKind::Sticky => satisfy_persist(pd, evt, payload, slot, true),
        EventKind::Idem => satisfy_persist(pd, evt, payload, slot, false),
        EventKind::Counted => satisfy_counted(pd, evt, payload, slot),
        EventKind::Channel => channel::satisfy(pd, evt, payload, slot),
        EventKind::Collective => Err(RuntimeError::NotSup(
            "collective events take contributions, not guid satisfies",
        )),
    }
}

/// Flush `waiters` of a fired event: one DEP_SATISFY per recorded node.
fn satisfy_waiters(
    pd: &PolicyDomain,
    evt_guid: Guid,
    payload: Guid,
    waiters: &[RegNode],
) -> Result<()> {
    for node in waiters {
        pd.satisfy_regnode(evt_guid, node, payload)?;
    }
    Ok(())
}

/// Push M_SAT to every peer except the one the satisfaction came from.
fn satisfy_peers(pd: &PolicyDomain, evt: &Event, payload: Guid, peers: &[Location]) {
    let sat_from = evt.inner.lock().md.sat_from;
    for &loc in peers {
        if Some(loc) != sat_from {
            pd.md_push(evt.guid, loc, MdMode::Satisfy, MdPayload::Contribution {
                gph: 0,
                bytes: payload.0.to_le_bytes().to_vec(),
            });
        }
    }
}

fn satisfy_once(pd: &PolicyDomain, evt: &Arc<Event>, payload: Guid, slot: u32) -> Result<()> {
    if slot != 0 {
        return Err(RuntimeError::Inval("once events have a single slot"));
    }
    let waiters = {
        let mut inner = evt.inner.lock();
        let wc = evt.waiters_count.load(Ordering::Acquire);
        if wc >= STATE_DESTROY_SEEN {
            return Err(RuntimeError::Perm("once event satisfied twice"));
        }
        evt.waiters_count.store(STATE_CHECKED_IN, Ordering::Release);
        std::mem::take(&mut inner.waiters)
    };
    #[cfg(feature = "nanny")]
    if waiters.is_empty() {
        tracing::warn!(event = %evt.guid, "once event satisfied with no dependences");
    }
    satisfy_waiters(pd, evt.guid, payload, &waiters)?;
    // One-shot: all notifications sent, tear the event down.
    destroy_ephemeral(pd, evt)
}

fn satisfy_latch(pd: &PolicyDomain, evt: &Arc<Event>, payload: Guid, slot: u32) -> Result<()> {
    let counter = match &evt.kstate {
        KindState::Latch { counter } => counter,
        _ => unreachable!(),
    };
    let incr: i64 = match slot {
        LATCH_INCR_SLOT => 1,
        LATCH_DECR_SLOT => -1,
        _ => return Err(RuntimeError::Inval("latch slot must be INCR or DECR")),
    };
    let new = counter.fetch_add(incr, Ordering::AcqRel) + incr;
    if new != 0 {
        return Ok(());
    }
    // Counter hit zero: the latch fires as a once and self-destructs.
    let waiters = {
        let mut inner = evt.inner.lock();
        evt.waiters_count.store(STATE_CHECKED_IN, Ordering::Release);
        std::mem::take(&mut inner.waiters)
    };
    satisfy_waiters(pd, evt.guid, payload, &waiters)?;
    destroy_ephemeral(pd, evt)
}

/// Write the payload and check in, under the lock. Returns the waiter list
/// and peer snapshot, or None when the event was already satisfied.
fn set_satisfied(
    evt: &Event,
    payload: Guid,
    check_error: bool,
) -> Result<Option<(Vec<RegNode>, Vec<Location>)>> {
    let mut inner = evt.inner.lock();
    let wc = evt.waiters_count.load(Ordering::Acquire);
    if wc == STATE_CHECKED_IN || wc == STATE_CHECKED_OUT {
        if check_error {
            tracing::error!(event = %evt.guid, "sticky event satisfied twice");
            return Err(RuntimeError::Perm("sticky event satisfied twice"));
        }
        return Ok(None);
    }
    evt.set_data(payload);
    evt.waiters_count.store(STATE_CHECKED_IN, Ordering::Release);
    // Late peer registrations are fine: they observe `data` in the clone
    // snapshot. The list is snapshotted here for the M_SAT walk; it stays
    // live for destruction bookkeeping.
    Ok(Some((
        std::mem::take(&mut inner.waiters),
        inner.md.peers.clone(),
    )))
}

/// Post-flush checkout shared by the persistent kinds. Loser of the
/// destroy race performs the free here.
fn checkout_after_flush(pd: &PolicyDomain, evt: &Arc<Event>) {
    let prev = evt.waiters_count.compare_exchange(
        STATE_CHECKED_IN,
        STATE_CHECKED_OUT,
        Ordering::AcqRel,
        Ordering::Acquire,
    );
    if prev == Err(STATE_DESTROY_SEEN) {
        // A destroy ran while we were flushing; we inherited the free.
        free_event(pd, evt);
    }
}

fn satisfy_persist(
    pd: &PolicyDomain,
    evt: &Arc<Event>,
    payload: Guid,
    slot: u32,
    check_error: bool,
) -> Result<()> {
    if slot != 0 {
        return Err(RuntimeError::Inval("persistent events have a single slot"));
    }
    let Some((waiters, peers)) = set_satisfied(evt, payload, check_error)? else {
        // Idempotent: silently drop the repeat satisfy.
        return Ok(());
    };
    satisfy_peers(pd, evt, payload, &peers);
    satisfy_waiters(pd, evt.guid, payload, &waiters)?;
    checkout_after_flush(pd, evt);
    Ok(())
}

fn satisfy_counted(pd: &PolicyDomain, evt: &Arc<Event>, payload: Guid, slot: u32) -> Result<()> {
    if slot != 0 {
        return Err(RuntimeError::Inval("counted events have a single slot"));
    }
    let (waiters, peers, waiters_len) = {
        let mut inner = evt.inner.lock();
        let wc = evt.waiters_count.load(Ordering::Acquire);
        if wc == STATE_CHECKED_IN || wc == STATE_CHECKED_OUT {
            return Err(RuntimeError::Perm("counted event satisfied twice"));
        }
        if u64::from(wc) > inner.nb_deps {
            return Err(RuntimeError::Perm("too many registrations on counted event"));
        }
        evt.set_data(payload);
        evt.waiters_count.store(STATE_CHECKED_IN, Ordering::Release);
        // nb_deps is NOT decremented here: a concurrent registration could
        // otherwise reach zero and free the event under our feet.
        let w = std::mem::take(&mut inner.waiters);
        let p = inner.md.peers.clone();
        let n = w.len() as u64;
        (w, p, n)
    };
    satisfy_peers(pd, evt, payload, &peers);
    satisfy_waiters(pd, evt.guid, payload, &waiters)?;
    // Check out even when no waiter was queued yet: the event must not
    // stay CHECKED_IN, or a later destroy parks on DESTROY_SEEN with
    // nobody left to inherit the free.
    checkout_after_flush(pd, evt);
    if waiters_len != 0 {
        let destroy = {
            let mut inner = evt.inner.lock();
            inner.nb_deps -= waiters_len;
            inner.nb_deps == 0
        };
        if destroy {
            free_event(pd, evt);
        }
    }
    Ok(())
}

// ─── Register waiter ──────────────────────────────────────────

/// Append `waiter` to the event. For a persistent event that already fired,
/// this converts into an immediate satisfy of the waiter's slot.
pub fn register_waiter(
    pd: &PolicyDomain,
    evt: &Arc<Event>,
    waiter: Guid,
    slot: u32,
    mode: DbAccessMode,
) -> Result<()> {
    let node = RegNode::new(waiter, slot, mode);
    match evt.kind {
        EventKind::Once | EventKind::Latch => {
            let mut inner = evt.inner.lock();
            let wc = evt.waiters_count.load(Ordering::Acquire);
            if wc >= STATE_DESTROY_SEEN {
                // Registration must precede satisfaction on ephemerals.
                return Err(RuntimeError::Perm(
                    "adding dependence to a non-persistent event that is already satisfied",
                ));
            }
            inner.waiters.push(node);
            evt.waiters_count.store(wc + 1, Ordering::Release);
            Ok(())
        }
        EventKind::Sticky | EventKind::Idem => {
            {
                let mut inner = evt.inner.lock();
                if evt.data().is_uninitialized() {
                    let wc = evt.waiters_count.load(Ordering::Acquire);
                    inner.waiters.push(node);
                    evt.waiters_count.store(wc + 1, Ordering::Release);
                    return Ok(());
                }
            }
            pd.satisfy_regnode(evt.guid, &node, evt.data())
        }
        EventKind::Counted => {
            {
                let mut inner = evt.inner.lock();
                if evt.data().is_uninitialized() {
                    let wc = evt.waiters_count.load(Ordering::Acquire);
                    inner.waiters.push(node);
                    evt.waiters_count.store(wc + 1, Ordering::Release);
                    return Ok(());
                }
            }
            pd.satisfy_regnode(evt.guid, &node, evt.data())?;
            // Account for this registration; the last one frees the event.
            let destroy = {
                let mut inner = evt.inner.lock();
                debug_assert!(inner.nb_deps > 0);
                inner.nb_deps = inner.nb_deps.saturating_sub(1);
                inner.nb_deps == 0
            };
            // A destroy that raced the satisfy flush parked on
            // DESTROY_SEEN; this registration inherits its free, same as
            // the sticky/idempotent checkout does.
            let inherited = evt
                .waiters_count
                .compare_exchange(
                    STATE_DESTROY_SEEN,
                    STATE_CHECKED_OUT,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok();
            if destroy || inherited {
                free_event(pd, evt);
            }
            Ok(())
        }
        EventKind::Channel => channel::register_waiter(pd, evt, node),
        EventKind::Collective => collective::register_waiter(pd, evt, node),
    }
}

pub fn unregister_waiter(
    _pd: &PolicyDomain,
    evt: &Arc<Event>,
    waiter: Guid,
    slot: u32,
) -> Result<()> {
    match evt.kind {
        EventKind::Channel | EventKind::Collective => {
            Err(RuntimeError::NotSup("unregister on channel/collective"))
        }
        _ => {
            let mut inner = evt.inner.lock();
            if let Some(pos) = inner
                .waiters
                .iter()
                .position(|n| n.guid == waiter && n.slot == slot)
            {
                inner.waiters.remove(pos);
                let wc = evt.waiters_count.load(Ordering::Acquire);
                if wc < STATE_DESTROY_SEEN && wc > 0 {
                    evt.waiters_count.store(wc - 1, Ordering::Release);
                }
            }
            Ok(())
        }
    }
}

// ─── Destroy ──────────────────────────────────────────────────

/// Kind-dispatched destruction.
pub fn destroy(pd: &PolicyDomain, evt: &Arc<Event>) -> Result<()> {
    match evt.kind {
        EventKind::Once | EventKind::Latch | EventKind::Channel => destroy_ephemeral(pd, evt),
        EventKind::Sticky | EventKind::Idem => destroy_persist(pd, evt),
        EventKind::Counted => {
            // Destroying before the registrations drain is undefined; warn
            // and tear down best-effort.
            if !evt.data().is_uninitialized() && evt.inner.lock().nb_deps != 0 {
                tracing::warn!(
                    event = %evt.guid,
                    "counted event destroyed before its registrations drained"
                );
            }
            destroy_persist(pd, evt)
        }
        EventKind::Collective => collective::destroy(pd, evt),
    }
}

/// Destruction for the non-persistent kinds: no satisfy race to arbitrate.
fn destroy_ephemeral(pd: &PolicyDomain, evt: &Arc<Event>) -> Result<()> {
    free_event(pd, evt);
    Ok(())
}

/// The persistent-kind destroy leg of the CAS ladder.
fn destroy_persist(pd: &PolicyDomain, evt: &Arc<Event>) -> Result<()> {
    let wc = evt.waiters_count.load(Ordering::Acquire);
    debug_assert_ne!(wc, STATE_DESTROY_SEEN);
    if wc == STATE_CHECKED_IN {
        // Competing with an in-flight satisfy flush.
        let prev = evt.waiters_count.compare_exchange(
            STATE_CHECKED_IN,
            STATE_DESTROY_SEEN,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if prev.is_ok() {
            // Lost the competition: the satisfier frees on checkout.
            return Ok(());
        }
        debug_assert_eq!(
            evt.waiters_count.load(Ordering::Acquire),
            STATE_CHECKED_OUT
        );
    }
    free_event(pd, evt);
    Ok(())
}

/// The single free: cascade M_DEL to peers and drop the guid binding.
fn free_event(pd: &PolicyDomain, evt: &Arc<Event>) {
    let (peers, del_from) = {
        let mut inner = evt.inner.lock();
        (std::mem::take(&mut inner.md.peers), inner.md.del_from)
    };
    for loc in peers {
        if Some(loc) != del_from {
            pd.md_push(evt.guid, loc, MdMode::Delete, MdPayload::None);
        }
    }
    pd.release_guid(evt.guid);
}

// ─── Distributed hooks ────────────────────────────────────────

/// M_REG: record a peer copy. The master decides inside the lock whether
/// the event already fired — the exact `waiters_count == CHECKED_IN` check —
/// and if so answers with an immediate M_SAT.
pub fn md_register_peer(pd: &PolicyDomain, evt: &Arc<Event>, peer: Location) -> Result<()> {
    let satisfied = {
        let mut inner = evt.inner.lock();
        if !inner.md.peers.contains(&peer) {
            inner.md.peers.push(peer);
        }
        evt.waiters_count.load(Ordering::Acquire) == STATE_CHECKED_IN
    };
    if satisfied {
        pd.md_push(evt.guid, peer, MdMode::Satisfy, MdPayload::Contribution {
            gph: 0,
            bytes: evt.data().0.to_le_bytes().to_vec(),
        });
    }
    Ok(())
}

/// M_SAT reception: perform the local satisfy, remembering the origin so
/// the peer walk never echoes back.
pub fn md_satisfy(pd: &PolicyDomain, evt: &Arc<Event>, payload: Guid, from: Location) -> Result<()> {
    evt.inner.lock().md.sat_from = Some(from);
    satisfy(pd, evt, payload, 0)
}

/// M_DEL reception: cascade the destruction, never back to the sender.
pub fn md_delete(pd: &PolicyDomain, evt: &Arc<Event>, from: Location) -> Result<()> {
    evt.inner.lock().md.del_from = Some(from);
    destroy(pd, evt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guid::Guid;

    fn eguid(kind: EventKind) -> Guid {
        Guid::encode(kind.guid_kind(), 0, 7)
    }

    #[test]
    fn latch_negative_counter_rejected() {
        let err = Event::new(
            eguid(EventKind::Latch),
            EventKind::Latch,
            Some(&EventParams::Latch { counter: -1 }),
        );
        assert!(err.is_err());
    }

    #[test]
    fn counted_zero_deps_rejected() {
        assert!(Event::new(
            eguid(EventKind::Counted),
            EventKind::Counted,
            Some(&EventParams::Counted { nb_deps: 0 }),
        )
        .is_err());
    }

    #[test]
    fn snapshot_round_trips() {
        let evt = Event::new(
            eguid(EventKind::Sticky),
            EventKind::Sticky,
            None,
        )
        .unwrap();
        let snap = evt.snapshot();
        let json = serde_json::to_string(&snap).unwrap();
        let back: EventSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snap);
    }

    #[test]
    fn materialised_satisfied_snapshot_carries_data() {
        let snap = EventSnapshot {
            guid: eguid(EventKind::Sticky),
            kind: EventKind::Sticky,
            data: Guid::encode(crate::guid::GuidKind::Db, 1, 3),
            nb_deps: 0,
            latch_counter: None,
            channel: None,
        };
        let evt = snap.materialise(1).unwrap();
        assert_eq!(evt.data(), snap.data);
        assert_eq!(
            evt.waiters_count.load(Ordering::Acquire),
            STATE_CHECKED_IN
        );
        assert_eq!(evt.inner.lock().md.peers, vec![1]);
    }

    #[test]
    fn get_on_fresh_persistent_is_uninitialized() {
        let evt = Event::new(eguid(EventKind::Sticky), EventKind::Sticky, None).unwrap();
        assert!(evt.get().is_uninitialized());
    }
}
