use crate::datablock::DataBlock;
use crate::event::Event;
use crate::guid::{Guid, GuidKind, Location};
use crate::msg::PolicyMsg;
use crate::task::{Task, TaskTemplate};
use sha2::{Digest, Sha256};
use spin::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// A resolved metadata handle. Objects are arena'd behind `Arc` and
/// addressed by guid; these handles are the cache a resolution populates.
#[derive(Clone)]
pub enum Object {
    Db(Arc<DataBlock>),
    Event(Arc<Event>),
    Task(Arc<Task>),
    Template(Arc<TaskTemplate>),
}

impl Object {
    pub fn as_event(&self) -> Option<&Arc<Event>> {
        match self {
            Object::Event(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_task(&self) -> Option<&Arc<Task>> {
        match self {
            Object::Task(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_db(&self) -> Option<&Arc<DataBlock>> {
        match self {
            Object::Db(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_template(&self) -> Option<&Arc<TaskTemplate>> {
        match self {
            Object::Template(t) => Some(t),
            _ => None,
        }
    }
}

/// Placeholder for a remote guid whose metadata is being pulled. Operations
/// that arrive while the pull is in flight queue here and are replayed when
/// the clone lands.
pub struct Proxy {
    pub guid: Guid,
    /// Set once the MD_CLONE pull has been issued.
    pub requested: AtomicBool,
    pending: Mutex<Vec<PolicyMsg>>,
}

impl Proxy {
    fn new(guid: Guid) -> Self {
        Self {
            guid,
            requested: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Park a message until the metadata lands.
    pub fn park(&self, msg: PolicyMsg) {
        self.pending.lock().push(msg);
    }
}

/// Outcome of resolving a guid.
pub enum Resolution {
    /// Metadata is local (authoritative or a completed clone).
    Local(Object),
    /// Remote guid with a pull in flight; `first_observer` is true exactly
    /// once, for the caller that must issue the MD_CLONE.
    Pending {
        proxy: Arc<Proxy>,
        first_observer: bool,
    },
    /// Guid was never created here and is not remote (stale or freed).
    Unknown,
}

enum Entry {
    Obj(Object),
    Proxy(Arc<Proxy>),
}

// Labelled guids set the top counter bit so they can never collide with the
// sequential allocator.
const LABELLED_BIT: u64 = 1 << 47;
const SEQ_MASK: u64 = LABELLED_BIT - 1;

/// The in-memory guid provider: sequential allocation, object registry,
/// remote proxies, labelled reservation.
pub struct GuidProvider {
    location: Location,
    next: AtomicU64,
    map: Mutex<HashMap<Guid, Entry>>,
    /// Guids claimed for deferred (labelled) creation; the claimant must
    /// later `register` the metadata.
    claimed: Mutex<HashMap<Guid, ()>>,
}

impl GuidProvider {
    pub fn new(location: Location) -> Self {
        Self {
            location,
            next: AtomicU64::new(1),
            map: Mutex::new(HashMap::new()),
            claimed: Mutex::new(HashMap::new()),
        }
    }

    pub fn location(&self) -> Location {
        self.location
    }

    /// Allocate a fresh local guid of the given kind.
    pub fn create_guid(&self, kind: GuidKind) -> Guid {
        let counter = self.next.fetch_add(1, Ordering::Relaxed) & SEQ_MASK;
        Guid::encode(kind, self.location, counter)
    }

    /// Bind metadata to a guid. Replaces a proxy if one was installed and
    /// returns the messages that were parked on it, in arrival order.
    pub fn register(&self, guid: Guid, obj: Object) -> Vec<PolicyMsg> {
        let prior = self.map.lock().insert(guid, Entry::Obj(obj));
        match prior {
            Some(Entry::Proxy(proxy)) => std::mem::take(&mut *proxy.pending.lock()),
            _ => Vec::new(),
        }
    }

    /// The `getVal` contract: local metadata, a pending proxy, or nothing.
    /// Observing a remote guid for the first time installs its proxy.
    pub fn resolve(&self, guid: Guid) -> Resolution {
        let mut map = self.map.lock();
        match map.get(&guid) {
            Some(Entry::Obj(obj)) => Resolution::Local(obj.clone()),
            Some(Entry::Proxy(proxy)) => {
                let first = !proxy.requested.swap(true, Ordering::AcqRel);
                Resolution::Pending {
                    proxy: proxy.clone(),
                    first_observer: first,
                }
            }
            None => {
                if guid.location() != self.location && !guid.is_null() {
                    let proxy = Arc::new(Proxy::new(guid));
                    map.insert(guid, Entry::Proxy(proxy.clone()));
                    proxy.requested.store(true, Ordering::Release);
                    Resolution::Pending {
                        proxy,
                        first_observer: true,
                    }
                } else {
                    Resolution::Unknown
                }
            }
        }
    }

    /// Resolve without installing a proxy (used by teardown paths that must
    /// not re-observe remote objects).
    pub fn lookup(&self, guid: Guid) -> Option<Object> {
        match self.map.lock().get(&guid) {
            Some(Entry::Obj(obj)) => Some(obj.clone()),
            _ => None,
        }
    }

    pub fn kind_of(&self, guid: Guid) -> GuidKind {
        guid.kind()
    }

    pub fn location_of(&self, guid: Guid) -> Location {
        guid.location()
    }

    /// Drop the binding. With `free_metadata` the object itself goes too
    /// (its `Arc` count is what keeps in-flight references alive).
    pub fn release(&self, guid: Guid, _free_metadata: bool) {
        self.map.lock().remove(&guid);
        self.claimed.lock().remove(&guid);
    }

    /// Derive the guid every domain computes for a labelled object. The
    /// owning location is part of the derivation input so the master copy
    /// has a well-defined home.
    pub fn reserve_labelled(&self, label: &str, kind: GuidKind, owner: Location) -> Guid {
        let mut hasher = Sha256::new();
        hasher.update([kind as u8]);
        hasher.update(owner.to_le_bytes());
        hasher.update(label.as_bytes());
        let digest = hasher.finalize();
        let mut counter = u64::from_le_bytes(digest[0..8].try_into().unwrap());
        counter = (counter & (SEQ_MASK >> 1)) | LABELLED_BIT;
        Guid::encode(kind, owner, counter)
    }

    pub fn unreserve(&self, guid: Guid) {
        self.claimed.lock().remove(&guid);
    }

    /// Race for the right to materialise a labelled guid's metadata.
    /// Exactly one caller per domain wins; losers wait for `register`.
    pub fn try_claim(&self, guid: Guid) -> bool {
        if self.map.lock().contains_key(&guid) {
            return false;
        }
        self.claimed.lock().insert(guid, ()).is_none()
    }
}
