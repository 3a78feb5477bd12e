use crate::errors::{Result, RuntimeError};
use crate::event::{Event, KindState};
use crate::guid::{Guid, Location, RegNode};
use crate::msg::{MdMode, MdPayload};
use crate::pd::PolicyDomain;
use serde::{Deserialize, Serialize};
use spin::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

// ─── Reduction operator descriptor ────────────────────────────
//
// Bit-encoded: [0:5] datum size minus one, [8] signed, [9] real,
// [12:15] operator, [16] commutative.

const SIZE_MASK: u32 = 0x3F;
const SIGNED_BIT: u32 = 1 << 8;
const REAL_BIT: u32 = 1 << 9;
const OP_SHIFT: u32 = 12;
const OP_MASK: u32 = 0xF;
const COMMUTATIVE_BIT: u32 = 1 << 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RedOperator {
    Add = 0,
    Mul = 1,
    Min = 2,
    Max = 3,
    BitAnd = 4,
    BitOr = 5,
    BitXor = 6,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedOp(pub u32);

impl RedOp {
    pub fn new(op: RedOperator, datum_size: usize, signed: bool, real: bool) -> RedOp {
        debug_assert!(matches!(datum_size, 1 | 2 | 4 | 8));
        let mut bits = (datum_size as u32 - 1) & SIZE_MASK;
        if signed {
            bits |= SIGNED_BIT;
        }
        if real {
            bits |= REAL_BIT;
        }
        bits |= ((op as u32) & OP_MASK) << OP_SHIFT;
        // Every built-in operator folds commutatively over its domain.
        bits |= COMMUTATIVE_BIT;
        RedOp(bits)
    }

    pub fn u64_add() -> RedOp {
        RedOp::new(RedOperator::Add, 8, false, false)
    }

    pub fn i64_min() -> RedOp {
        RedOp::new(RedOperator::Min, 8, true, false)
    }

    pub fn f64_add() -> RedOp {
        RedOp::new(RedOperator::Add, 8, false, true)
    }

    pub fn datum_size(self) -> usize {
        ((self.0 & SIZE_MASK) + 1) as usize
    }

    pub fn is_signed(self) -> bool {
        self.0 & SIGNED_BIT != 0
    }

    pub fn is_real(self) -> bool {
        self.0 & REAL_BIT != 0
    }

    pub fn is_commutative(self) -> bool {
        self.0 & COMMUTATIVE_BIT != 0
    }

    fn operator(self) -> RedOperator {
        match (self.0 >> OP_SHIFT) & OP_MASK {
            0 => RedOperator::Add,
            1 => RedOperator::Mul,
            2 => RedOperator::Min,
            3 => RedOperator::Max,
            4 => RedOperator::BitAnd,
            5 => RedOperator::BitOr,
            _ => RedOperator::BitXor,
        }
    }

    /// Fold `contrib` into `acc`, datum by datum.
    pub fn apply(self, acc: &mut [u8], contrib: &[u8]) -> Result<()> {
        if acc.len() != contrib.len() || acc.len() % self.datum_size() != 0 {
            return Err(RuntimeError::Inval("mismatched reduction buffers"));
        }
        let sz = self.datum_size();
        for (a, c) in acc.chunks_exact_mut(sz).zip(contrib.chunks_exact(sz)) {
            fold_datum(self, a, c);
        }
        Ok(())
    }
}

macro_rules! fold_as {
    ($ty:ty, $op:expr, $a:expr, $c:expr) => {{
        let lhs = <$ty>::from_le_bytes($a.try_into().unwrap());
        let rhs = <$ty>::from_le_bytes($c.try_into().unwrap());
        let out: $ty = match $op {
            RedOperator::Add => lhs.wrapping_add(rhs),
            RedOperator::Mul => lhs.wrapping_mul(rhs),
            RedOperator::Min => lhs.min(rhs),
            RedOperator::Max => lhs.max(rhs),
            RedOperator::BitAnd => lhs & rhs,
            RedOperator::BitOr => lhs | rhs,
            RedOperator::BitXor => lhs ^ rhs,
        };
        $a.copy_from_slice(&out.to_le_bytes());
    }};
}

macro_rules! fold_float {
    ($ty:ty, $op:expr, $a:expr, $c:expr) => {{
        let lhs = <$ty>::from_le_bytes($a.try_into().unwrap());
        let rhs = <$ty>::from_le_bytes($c.try_into().unwrap());
        let out: $ty = match $op {
            RedOperator::Add => lhs + rhs,
            RedOperator::Mul => lhs * rhs,
            RedOperator::Min => lhs.min(rhs),
            RedOperator::Max => lhs.max(rhs),
            // Bit operators are meaningless on reals; keep lhs.
            RedOperator::BitAnd | RedOperator::BitOr | RedOperator::BitXor => lhs,
        };
        $a.copy_from_slice(&out.to_le_bytes());
    }};
}

fn fold_datum(op: RedOp, a: &mut [u8], c: &[u8]) {
    let operator = op.operator();
    match (op.datum_size(), op.is_signed(), op.is_real()) {
        (4, _, true) => fold_float!(f32, operator, a, c),
        (8, _, true) => fold_float!(f64, operator, a, c),
        (1, false, _) => fold_as!(u8, operator, a, c),
        (1, true, _) => fold_as!(i8, operator, a, c),
        (2, false, _) => fold_as!(u16, operator, a, c),
        (2, true, _) => fold_as!(i16, operator, a, c),
        (4, false, _) => fold_as!(u32, operator, a, c),
        (4, true, _) => fold_as!(i32, operator, a, c),
        (8, false, _) => fold_as!(u64, operator, a, c),
        (8, true, _) => fold_as!(i64, operator, a, c),
        _ => {}
    }
}

// ─── Parameters & state ───────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectiveParams {
    /// Fan-out of the routing tree over policy domains.
    pub arity: u32,
    /// Generations that may overlap in flight.
    pub max_gen: u16,
    /// Data elements per contribution.
    pub nb_datum: u16,
    /// Total contributor slots across the process group.
    pub nb_contribs: u32,
    /// Contributor slots hosted by each domain.
    pub nb_contribs_pd: u32,
    pub op: RedOp,
}

impl CollectiveParams {
    pub fn contrib_size(&self) -> usize {
        self.op.datum_size() * self.nb_datum as usize
    }
}

/// One local contributor slot: independent generation cursors for
/// contributions (`iph`) and dependence registrations (`oph`) so phases can
/// overlap up to `max_gen`.
struct Contributor {
    iph: u32,
    oph: u32,
    contribs: Vec<Vec<u8>>,
}

/// One in-flight local phase cell.
struct Phase {
    /// Global phase currently occupying this cell.
    gph: u32,
    local_contribs: u32,
    local_folded: bool,
    remote_seen: u32,
    acc: Vec<u8>,
    forwarded: bool,
}

impl Phase {
    fn reset(&mut self, gph: u32, contrib_size: usize) {
        self.gph = gph;
        self.local_contribs = 0;
        self.local_folded = false;
        self.remote_seen = 0;
        self.acc = vec![0; contrib_size];
        self.forwarded = false;
    }
}

struct CollInner {
    contributors: Vec<Contributor>,
    phases: Vec<Phase>,
    /// Completed generations: global phase -> result data-block. Entries
    /// are pruned once every contributor's `oph` cursor has moved past
    /// them (no consumer can subscribe for those generations anymore).
    completed: HashMap<u32, Guid>,
    /// Waiters keyed by the global phase they subscribed for.
    waiters: Vec<(u32, RegNode)>,
}

/// Drop results no `oph` cursor can reach anymore. Consumer registrations
/// advance contributor slot 0's cursor only, so that is the low-water
/// mark; the other slots' cursors never move and must not hold the prune
/// at zero.
fn prune_completed(inner: &mut CollInner) {
    let min_oph = inner.contributors[0].oph;
    inner.completed.retain(|&gph, _| gph >= min_oph);
}

/// Reduction event state: a k-ary tree across domains plus local
/// per-contributor, per-phase cells.
pub struct CollectiveState {
    pub params: CollectiveParams,
    pub ancestor: Option<Location>,
    pub descendants: Vec<Location>,
    inner: Mutex<CollInner>,
}

impl CollectiveState {
    pub fn new(params: CollectiveParams, me: Location, nb_pds: u16) -> Result<CollectiveState> {
        if params.nb_contribs_pd == 0 || params.max_gen == 0 || params.nb_datum == 0 {
            return Err(RuntimeError::Inval("collective params must be non-zero"));
        }
        let (ancestor, descendants) = tree_links(me, nb_pds, params.arity.max(1));
        let csize = params.contrib_size();
        let contributors = (0..params.nb_contribs_pd)
            .map(|_| Contributor {
                iph: 0,
                oph: 0,
                contribs: (0..params.max_gen).map(|_| vec![0; csize]).collect(),
            })
            .collect();
        let phases = (0..params.max_gen)
            .map(|_| Phase {
                gph: 0,
                local_contribs: 0,
                local_folded: false,
                remote_seen: 0,
                acc: vec![0; csize],
                forwarded: false,
            })
            .collect();
        Ok(CollectiveState {
            params,
            ancestor,
            descendants,
            inner: Mutex::new(CollInner {
                contributors,
                phases,
                completed: HashMap::new(),
                waiters: Vec::new(),
            }),
        })
    }

    pub fn is_leaf(&self) -> bool {
        self.descendants.is_empty()
    }

    pub fn is_root(&self) -> bool {
        self.ancestor.is_none()
    }
}

/// Parent/children of `me` in the k-ary tree over domain locations.
pub fn tree_links(me: Location, nb_pds: u16, arity: u32) -> (Option<Location>, Vec<Location>) {
    let ancestor = if me == 0 {
        None
    } else {
        Some(((u32::from(me) - 1) / arity) as Location)
    };
    let first = arity * u32::from(me) + 1;
    let descendants = (first..first + arity)
        .filter(|&c| c < u32::from(nb_pds))
        .map(|c| c as Location)
        .collect();
    (ancestor, descendants)
}

fn coll_state(evt: &Event) -> &CollectiveState {
    match &evt.kstate {
        KindState::Collective(c) => c,
        _ => unreachable!("collective op on non-collective event"),
    }
}

// ─── Contribution path ────────────────────────────────────────

/// A local contributor writes its datum for its next generation.
pub fn contribute(pd: &PolicyDomain, evt: &Arc<Event>, bytes: &[u8], slot: u32) -> Result<()> {
    let coll = coll_state(evt);
    let params = coll.params;
    if bytes.len() != params.contrib_size() {
        return Err(RuntimeError::Inval("contribution size mismatch"));
    }
    let lslot = slot % params.nb_contribs_pd;
    let (gph, fold_done) = {
        let mut inner = coll.inner.lock();
        let gph = inner.contributors[lslot as usize].iph;
        inner.contributors[lslot as usize].iph += 1;
        let lph = (gph % u32::from(params.max_gen)) as usize;
        if inner.phases[lph].gph != gph {
            if inner.phases[lph].local_contribs != 0 || inner.phases[lph].forwarded {
                // A previous generation still occupies the cell.
                if !inner.completed.contains_key(&inner.phases[lph].gph) {
                    return Err(RuntimeError::Busy(evt.guid));
                }
            }
            let csize = params.contrib_size();
            inner.phases[lph].reset(gph, csize);
        }
        inner.contributors[lslot as usize].contribs[lph].copy_from_slice(bytes);
        inner.phases[lph].local_contribs += 1;
        let all_local = inner.phases[lph].local_contribs == params.nb_contribs_pd;
        if all_local {
            // Last local contributor folds every cell into the accumulator,
            // preserving any descendant aggregates that raced ahead.
            let mut acc = inner.contributors[0].contribs[lph].clone();
            for c in 1..params.nb_contribs_pd as usize {
                let contrib = inner.contributors[c].contribs[lph].clone();
                params.op.apply(&mut acc, &contrib)?;
            }
            if inner.phases[lph].remote_seen > 0 {
                let remote = inner.phases[lph].acc.clone();
                params.op.apply(&mut acc, &remote)?;
            }
            inner.phases[lph].acc = acc;
            inner.phases[lph].local_folded = true;
        }
        (gph, all_local)
    };
    if fold_done {
        try_complete_phase(pd, evt, gph)?;
    }
    Ok(())
}

/// M_UP reception at a non-leaf: fold a descendant's aggregate.
pub fn on_up(pd: &PolicyDomain, evt: &Arc<Event>, gph: u32, bytes: &[u8]) -> Result<()> {
    let coll = coll_state(evt);
    let params = coll.params;
    {
        let mut inner = coll.inner.lock();
        let lph = (gph % u32::from(params.max_gen)) as usize;
        if inner.phases[lph].gph != gph {
            if inner.phases[lph].local_contribs != 0 || inner.phases[lph].forwarded {
                return Err(RuntimeError::Busy(evt.guid));
            }
            let csize = params.contrib_size();
            inner.phases[lph].reset(gph, csize);
        }
        if inner.phases[lph].local_folded || inner.phases[lph].remote_seen > 0 {
            let mut acc = std::mem::take(&mut inner.phases[lph].acc);
            params.op.apply(&mut acc, bytes)?;
            inner.phases[lph].acc = acc;
        } else {
            inner.phases[lph].acc.copy_from_slice(bytes);
        }
        inner.phases[lph].remote_seen += 1;
    }
    try_complete_phase(pd, evt, gph)
}

/// When the local fold and every descendant aggregate are in: forward M_UP,
/// or finalise at the root and broadcast M_DOWN.
fn try_complete_phase(pd: &PolicyDomain, evt: &Arc<Event>, gph: u32) -> Result<()> {
    let coll = coll_state(evt);
    let params = coll.params;
    let (ready, acc) = {
        let mut inner = coll.inner.lock();
        let lph = (gph % u32::from(params.max_gen)) as usize;
        let ph = &mut inner.phases[lph];
        if ph.gph != gph || ph.forwarded {
            return Ok(());
        }
        let ready =
            ph.local_folded && ph.remote_seen == coll.descendants.len() as u32;
        if ready {
            ph.forwarded = true;
            (true, ph.acc.clone())
        } else {
            (false, Vec::new())
        }
    };
    if !ready {
        return Ok(());
    }
    if let Some(up) = coll.ancestor {
        pd.md_push(
            evt.guid,
            up,
            MdMode::Up,
            MdPayload::Contribution {
                gph,
                bytes: acc,
            },
        );
        Ok(())
    } else {
        finalise_phase(pd, evt, gph, &acc)
    }
}

/// Write the per-phase result block, satisfy local waiters, push M_DOWN.
fn finalise_phase(pd: &PolicyDomain, evt: &Arc<Event>, gph: u32, bytes: &[u8]) -> Result<()> {
    let coll = coll_state(evt);
    let result_db = pd.create_local_db(bytes)?;
    let to_satisfy: Vec<RegNode> = {
        let mut inner = coll.inner.lock();
        inner.completed.insert(gph, result_db);
        let (fire, keep): (Vec<_>, Vec<_>) =
            inner.waiters.drain(..).partition(|(g, _)| *g == gph);
        inner.waiters = keep;
        // Consumers already subscribed for this generation are satisfied
        // directly; their entry need not linger in the map.
        prune_completed(&mut inner);
        fire.into_iter().map(|(_, n)| n).collect()
    };
    for node in &to_satisfy {
        pd.satisfy_regnode(evt.guid, node, result_db)?;
    }
    for &down in &coll.descendants {
        pd.md_push(
            evt.guid,
            down,
            MdMode::Down,
            MdPayload::Contribution {
                gph,
                bytes: bytes.to_vec(),
            },
        );
    }
    Ok(())
}

/// M_DOWN reception: the final value for `gph` lands at this node.
pub fn on_down(pd: &PolicyDomain, evt: &Arc<Event>, gph: u32, bytes: &[u8]) -> Result<()> {
    finalise_phase(pd, evt, gph, bytes)
}

// ─── Consumer path ────────────────────────────────────────────

/// Register a waiter for contributor slot 0's next generation. If that
/// generation already completed, satisfy immediately.
pub fn register_waiter(pd: &PolicyDomain, evt: &Arc<Event>, node: RegNode) -> Result<()> {
    let coll = coll_state(evt);
    let ready = {
        let mut inner = coll.inner.lock();
        let gph = inner.contributors[0].oph;
        inner.contributors[0].oph += 1;
        let hit = inner.completed.get(&gph).copied();
        if hit.is_none() {
            inner.waiters.push((gph, node));
        }
        // The cursor advanced: results behind every cursor are dead.
        prune_completed(&mut inner);
        hit
    };
    if let Some(db) = ready {
        pd.satisfy_regnode(evt.guid, &node, db)?;
    }
    Ok(())
}

pub fn destroy(pd: &PolicyDomain, evt: &Arc<Event>) -> Result<()> {
    let coll = coll_state(evt);
    for &down in &coll.descendants {
        pd.md_push(evt.guid, down, MdMode::Delete, MdPayload::None);
    }
    pd.release_guid(evt.guid);
    Ok(())
}
