use serde::{Deserialize, Serialize};
use std::fmt;

// ─── Bit layout ───────────────────────────────────────────────
//
// A guid is a 64-bit opaque integer: the high bits carry the object kind,
// the middle bits the owning policy-domain location, the low bits a
// per-domain allocation counter.
//
//   [ kind:6 | location:10 | counter:48 ]

pub const KIND_BITS: u32 = 6;
pub const LOCATION_BITS: u32 = 10;
pub const COUNTER_BITS: u32 = 48;

const KIND_SHIFT: u32 = 64 - KIND_BITS;
const LOCATION_SHIFT: u32 = COUNTER_BITS;
const LOCATION_MASK: u64 = (1 << LOCATION_BITS) - 1;
const COUNTER_MASK: u64 = (1 << COUNTER_BITS) - 1;

static_assertions::const_assert_eq!(KIND_BITS + LOCATION_BITS + COUNTER_BITS, 64);

/// A policy-domain identifier. Doubles as the routing address of every
/// message and as the location field of every guid minted by that domain.
pub type Location = u16;

/// Location sentinel for "no such domain" (collective-tree roots use it for
/// the missing ancestor).
pub const INVALID_LOCATION: Location = Location::MAX;

// ─── Kinds ────────────────────────────────────────────────────

/// Object kind encoded in the high bits of a guid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum GuidKind {
    None = 0,
    Db = 1,
    EdtTemplate = 2,
    Edt = 3,
    EventOnce = 4,
    EventLatch = 5,
    EventSticky = 6,
    EventIdem = 7,
    EventCounted = 8,
    EventChannel = 9,
    EventCollective = 10,
    Affinity = 11,
    Map = 12,
    PolicyDomain = 13,
}

impl GuidKind {
    pub fn from_bits(bits: u8) -> Option<GuidKind> {
        use GuidKind::*;
        Some(match bits {
            0 => None,
            1 => Db,
            2 => EdtTemplate,
            3 => Edt,
            4 => EventOnce,
            5 => EventLatch,
            6 => EventSticky,
            7 => EventIdem,
            8 => EventCounted,
            9 => EventChannel,
            10 => EventCollective,
            11 => Affinity,
            12 => Map,
            13 => PolicyDomain,
            _ => return Option::None,
        })
    }

    /// True for the seven event kinds.
    pub fn is_event(self) -> bool {
        matches!(
            self,
            GuidKind::EventOnce
                | GuidKind::EventLatch
                | GuidKind::EventSticky
                | GuidKind::EventIdem
                | GuidKind::EventCounted
                | GuidKind::EventChannel
                | GuidKind::EventCollective
        )
    }

    /// Sticky, idempotent and counted events keep their payload after
    /// firing; everything else is ephemeral.
    pub fn is_persistent_event(self) -> bool {
        matches!(
            self,
            GuidKind::EventSticky | GuidKind::EventIdem | GuidKind::EventCounted
        )
    }
}

// ─── Guid ─────────────────────────────────────────────────────

/// The sole addressing primitive of the runtime.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Guid(pub u64);

/// The all-zeros guid: "no object".
pub const NULL_GUID: Guid = Guid(0);

/// The all-ones guid: "not yet written". A persistent event's payload slot
/// holds this value until the event fires.
pub const UNINITIALIZED_GUID: Guid = Guid(u64::MAX);

/// Error sentinel returned by operations that must produce a guid.
pub const ERROR_GUID: Guid = Guid(u64::MAX - 1);

impl Guid {
    pub fn encode(kind: GuidKind, location: Location, counter: u64) -> Guid {
        debug_assert!(u64::from(location) <= LOCATION_MASK);
        debug_assert!(counter <= COUNTER_MASK);
        Guid(((kind as u64) << KIND_SHIFT)
            | ((u64::from(location) & LOCATION_MASK) << LOCATION_SHIFT)
            | (counter & COUNTER_MASK))
    }

    pub fn kind(self) -> GuidKind {
        if self == UNINITIALIZED_GUID || self == ERROR_GUID {
            return GuidKind::None;
        }
        GuidKind::from_bits((self.0 >> KIND_SHIFT) as u8).unwrap_or(GuidKind::None)
    }

    /// The policy domain that owns this object's metadata.
    pub fn location(self) -> Location {
        ((self.0 >> LOCATION_SHIFT) & LOCATION_MASK) as Location
    }

    pub fn counter(self) -> u64 {
        self.0 & COUNTER_MASK
    }

    pub fn is_null(self) -> bool {
        self == NULL_GUID
    }

    pub fn is_uninitialized(self) -> bool {
        self == UNINITIALIZED_GUID
    }

    pub fn is_error(self) -> bool {
        self == ERROR_GUID
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return write!(f, "GUID[null]");
        }
        if self.is_uninitialized() {
            return write!(f, "GUID[uninit]");
        }
        if self.is_error() {
            return write!(f, "GUID[error]");
        }
        write!(
            f,
            "GUID[{:?}:{}:{}]",
            self.kind(),
            self.location(),
            self.counter()
        )
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

// ─── Fat guid ─────────────────────────────────────────────────

/// A guid paired with the resolved metadata handle, when the caller already
/// went through the guid provider. Resolution results are a cache: the guid
/// alone is always sufficient to re-resolve.
#[derive(Clone, Debug)]
pub struct FatGuid<T> {
    pub guid: Guid,
    pub meta: Option<T>,
}

impl<T> FatGuid<T> {
    pub fn bare(guid: Guid) -> Self {
        Self { guid, meta: None }
    }

    pub fn resolved(guid: Guid, meta: T) -> Self {
        Self {
            guid,
            meta: Some(meta),
        }
    }
}

// ─── Dependence access modes ──────────────────────────────────

/// Access mode requested for a data-block flowing down a dependence edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DbAccessMode {
    /// Concurrent readers, no writes.
    Ro,
    /// Shared read-write (the runtime does not arbitrate writers).
    Rw,
    /// Exclusive write: at most one holder at a time.
    Ew,
    /// Read-only and immutable for the lifetime of the acquire.
    Const,
    /// No data-block flows on this edge (pure control dependence).
    NullMode,
}

impl DbAccessMode {
    pub fn is_exclusive(self) -> bool {
        matches!(self, DbAccessMode::Ew)
    }
}

// ─── RegNode ──────────────────────────────────────────────────

/// Slot sentinel: the slot was satisfied through an event.
pub const SLOT_SATISFIED_EVT: u32 = u32::MAX;
/// Slot sentinel: the slot's signaler is an ephemeral event the task has
/// registered on (push mode); satisfaction will arrive from the event side.
pub const SLOT_REGISTERED_EPHEMERAL_EVT: u32 = u32::MAX - 1;
/// Slot sentinel: the slot was satisfied directly with a data-block.
pub const SLOT_SATISFIED_DB: u32 = u32::MAX - 2;

/// First slot value reserved for sentinels; user slots stay below this.
pub const SLOT_SENTINEL_FLOOR: u32 = u32::MAX - 2;

/// A signaler/waiter record. On an event's waiter list `slot` is the
/// destination slot to satisfy; on a task's signaler vector `slot` starts as
/// the slot index and is overwritten by the sentinels above as the slot
/// progresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegNode {
    pub guid: Guid,
    pub slot: u32,
    pub mode: DbAccessMode,
}

impl RegNode {
    pub fn new(guid: Guid, slot: u32, mode: DbAccessMode) -> Self {
        Self { guid, slot, mode }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_round_trip() {
        let g = Guid::encode(GuidKind::EventSticky, 7, 0x1234_5678);
        assert_eq!(g.kind(), GuidKind::EventSticky);
        assert_eq!(g.location(), 7);
        assert_eq!(g.counter(), 0x1234_5678);
    }

    #[test]
    fn sentinels_are_distinct() {
        assert_ne!(NULL_GUID, UNINITIALIZED_GUID);
        assert_ne!(NULL_GUID, ERROR_GUID);
        assert_ne!(UNINITIALIZED_GUID, ERROR_GUID);
        assert_eq!(NULL_GUID.kind(), GuidKind::None);
        assert_eq!(UNINITIALIZED_GUID.kind(), GuidKind::None);
    }

    #[test]
    fn kind_predicates() {
        assert!(GuidKind::EventCounted.is_persistent_event());
        assert!(GuidKind::EventChannel.is_event());
        assert!(!GuidKind::EventChannel.is_persistent_event());
        assert!(!GuidKind::Edt.is_event());
    }

    #[test]
    fn max_location_survives() {
        let g = Guid::encode(GuidKind::Db, (1 << LOCATION_BITS) - 1, 1);
        assert_eq!(g.location(), (1 << LOCATION_BITS) - 1);
    }
}
