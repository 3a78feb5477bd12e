use crate::datablock::{DataBlock, DbProps};
use crate::errors::ReturnCode;
use crate::event::EventParams;
use crate::guid::{DbAccessMode, Guid, GuidKind, Location, NULL_GUID};
use crate::hint::Hint;
use crate::runlevel::{RlProps, Runlevel};
use crate::task::{EdtFunc, EdtProps, TaskSnapshot, TaskTemplate};
use std::fmt;
use std::sync::Arc;

bitflags::bitflags! {
    /// Envelope bits. REQUEST/RESPONSE describe the leg; REQ_RESPONSE asks
    /// the destination to answer; FROM_MSG marks a message materialised by
    /// another message handler (as opposed to an API call). The last two
    /// bits are the scheduler-hook controls.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MsgFlags: u16 {
        const REQUEST          = 1 << 0;
        const RESPONSE         = 1 << 1;
        const REQ_RESPONSE     = 1 << 2;
        const FROM_MSG         = 1 << 3;
        const IGNORE_PRE_PROCESS = 1 << 4;
        const REQ_POST_PROCESS   = 1 << 5;
    }
}

/// Direction of a metadata-protocol message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MdDir {
    Push,
    Pull,
}

/// Metadata-protocol operation mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MdMode {
    /// Replicate metadata to the requester.
    Clone,
    /// A peer announces it holds a copy.
    Register,
    /// Push a satisfaction along the peer list.
    Satisfy,
    /// Cascading destruction along the peer list.
    Delete,
    /// Reduction-tree aggregation toward the root.
    Up,
    /// Reduction-tree broadcast toward the leaves.
    Down,
    /// Move an EDT to another domain for execution.
    Move,
}

/// Payload of a METADATA_COMM message. Event snapshots travel serialized
/// (they must round-trip to identity); handles that cannot leave the process
/// travel as shared pointers, which the in-process transport permits.
#[derive(Clone)]
pub enum MdPayload {
    None,
    /// serde_json snapshot of a persistent event's metadata.
    EventSnapshot(String),
    /// Template metadata for remote work creation.
    TemplateHandle(Arc<TaskTemplate>),
    /// A moved EDT, ready to re-materialise.
    TaskMove(TaskSnapshot),
    /// Collective contribution or result: global phase + raw datum bytes.
    Contribution { gph: u32, bytes: Vec<u8> },
    /// A resolved data-block handle (clone-pull reply).
    DbHandle(Arc<DataBlock>),
}

impl fmt::Debug for MdPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MdPayload::None => write!(f, "None"),
            MdPayload::EventSnapshot(s) => write!(f, "EventSnapshot({} bytes)", s.len()),
            MdPayload::TemplateHandle(t) => write!(f, "TemplateHandle({})", t.guid),
            MdPayload::TaskMove(s) => write!(f, "TaskMove({})", s.guid),
            MdPayload::Contribution { gph, bytes } => {
                write!(f, "Contribution(gph={gph}, {} bytes)", bytes.len())
            }
            MdPayload::DbHandle(db) => write!(f, "DbHandle({})", db.guid),
        }
    }
}

/// What a SCHED_NOTIFY is about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedNotifyKind {
    EdtReady,
    EdtDone,
    DbCreated,
    EventSatisfied,
}

// ─── Operation payloads ───────────────────────────────────────
//
// One arm per operation code. In-fields are written by the requester;
// out-fields (suffixed `_out`) are written by the handler before the
// message is answered or returned.

#[derive(Clone, Debug)]
pub enum Payload {
    // Data-blocks
    DbCreate {
        size: u64,
        props: DbProps,
        hint: Option<Hint>,
        affinity: Guid,
        guid_out: Guid,
    },
    DbAcquire {
        db: Guid,
        edt: Guid,
        /// Destination slot in the acquiring task's resolved vector; the
        /// runtime slot `depc + 1` carries asynchronous acquire acks.
        slot: u32,
        mode: DbAccessMode,
        handle_out: Option<Arc<DataBlock>>,
    },
    DbRelease {
        db: Guid,
        edt: Guid,
    },
    DbFree {
        db: Guid,
    },
    MemAlloc {
        size: u64,
        ok_out: bool,
    },
    MemUnalloc {
        size: u64,
    },

    // Work (EDTs)
    WorkCreate {
        template: Guid,
        paramv: Vec<u64>,
        /// `None` copies depc from the template (EDT_PARAM_DEF).
        depc: Option<u32>,
        depv: Option<Vec<Guid>>,
        props: EdtProps,
        hint: Option<Hint>,
        parent_latch: Guid,
        guid_out: Guid,
        output_event_out: Guid,
    },
    WorkDestroy {
        guid: Guid,
    },

    // Templates
    EdtTempCreate {
        func: EdtFunc,
        paramc: u32,
        depc: u32,
        name: String,
        guid_out: Guid,
    },
    EdtTempDestroy {
        guid: Guid,
    },

    // Events
    EvtCreate {
        kind: GuidKind,
        carry_data: bool,
        params: Option<EventParams>,
        label: Option<String>,
        guid_out: Guid,
    },
    EvtDestroy {
        guid: Guid,
    },
    EvtGet {
        guid: Guid,
        data_out: Guid,
    },

    // Guid provider
    GuidCreate {
        kind: GuidKind,
        guid_out: Guid,
    },
    GuidInfo {
        guid: Guid,
        kind_out: GuidKind,
        location_out: Location,
    },
    GuidMetadataClone {
        guid: Guid,
        resolved_out: bool,
    },
    GuidReserve {
        label: String,
        kind: GuidKind,
        guid_out: Guid,
    },
    GuidUnreserve {
        guid: Guid,
    },
    GuidDestroy {
        guid: Guid,
        free_metadata: bool,
    },

    // Scheduler
    SchedGetWork {
        worker: u32,
        task_out: Guid,
    },
    SchedNotify {
        kind: SchedNotifyKind,
        guid: Guid,
    },
    SchedTransact,
    SchedAnalyze,

    // Dependences
    DepAdd {
        source: Guid,
        dest: Guid,
        slot: u32,
        mode: DbAccessMode,
    },
    DepRegSignaler {
        signaler: Guid,
        dest: Guid,
        slot: u32,
        mode: DbAccessMode,
        is_add_dep: bool,
    },
    DepRegWaiter {
        waiter: Guid,
        dest: Guid,
        slot: u32,
        mode: DbAccessMode,
        is_add_dep: bool,
    },
    DepSatisfy {
        dest: Guid,
        payload: Guid,
        slot: u32,
    },
    DepUnregSignaler {
        signaler: Guid,
        dest: Guid,
        slot: u32,
    },
    DepUnregWaiter {
        waiter: Guid,
        dest: Guid,
        slot: u32,
    },
    DepDynAdd {
        edt: Guid,
        db: Guid,
        mode: DbAccessMode,
    },
    DepDynRemove {
        edt: Guid,
        db: Guid,
    },

    // Management
    MgtRegister {
        loc: Location,
    },
    MgtUnregister {
        loc: Location,
    },
    MgtRlNotify {
        runlevel: Runlevel,
        phase: i8,
        props: RlProps,
        error_code: u32,
    },
    MgtMonitorProgress {
        edts_out: u64,
        msgs_out: u64,
    },

    // Hints
    HintSet {
        guid: Guid,
        hint: Hint,
    },
    HintGet {
        guid: Guid,
        hint_out: Option<Hint>,
    },

    // Distributed metadata
    MetadataComm {
        target: Guid,
        direction: MdDir,
        mode: MdMode,
        payload: MdPayload,
    },

    // System abstraction layer
    SalPrint {
        text: String,
    },
    SalTerminate {
        error_code: u32,
    },

    // Resiliency (accepted, not supported by the core contract)
    ResiliencyNotify,
    ResiliencyMonitor,
    ResiliencyCheckpoint,
}

impl Payload {
    /// Name used by trace records and diagnostics.
    pub fn op_name(&self) -> &'static str {
        use Payload::*;
        match self {
            DbCreate { .. } => "DB_CREATE",
            DbAcquire { .. } => "DB_ACQUIRE",
            DbRelease { .. } => "DB_RELEASE",
            DbFree { .. } => "DB_FREE",
            MemAlloc { .. } => "MEM_ALLOC",
            MemUnalloc { .. } => "MEM_UNALLOC",
            WorkCreate { .. } => "WORK_CREATE",
            WorkDestroy { .. } => "WORK_DESTROY",
            EdtTempCreate { .. } => "EDTTEMP_CREATE",
            EdtTempDestroy { .. } => "EDTTEMP_DESTROY",
            EvtCreate { .. } => "EVT_CREATE",
            EvtDestroy { .. } => "EVT_DESTROY",
            EvtGet { .. } => "EVT_GET",
            GuidCreate { .. } => "GUID_CREATE",
            GuidInfo { .. } => "GUID_INFO",
            GuidMetadataClone { .. } => "GUID_METADATA_CLONE",
            GuidReserve { .. } => "GUID_RESERVE",
            GuidUnreserve { .. } => "GUID_UNRESERVE",
            GuidDestroy { .. } => "GUID_DESTROY",
            SchedGetWork { .. } => "SCHED_GET_WORK",
            SchedNotify { .. } => "SCHED_NOTIFY",
            SchedTransact => "SCHED_TRANSACT",
            SchedAnalyze => "SCHED_ANALYZE",
            DepAdd { .. } => "DEP_ADD",
            DepRegSignaler { .. } => "DEP_REGSIGNALER",
            DepRegWaiter { .. } => "DEP_REGWAITER",
            DepSatisfy { .. } => "DEP_SATISFY",
            DepUnregSignaler { .. } => "DEP_UNREGSIGNALER",
            DepUnregWaiter { .. } => "DEP_UNREGWAITER",
            DepDynAdd { .. } => "DEP_DYNADD",
            DepDynRemove { .. } => "DEP_DYNREMOVE",
            MgtRegister { .. } => "MGT_REGISTER",
            MgtUnregister { .. } => "MGT_UNREGISTER",
            MgtRlNotify { .. } => "MGT_RL_NOTIFY",
            MgtMonitorProgress { .. } => "MGT_MONITOR_PROGRESS",
            HintSet { .. } => "HINT_SET",
            HintGet { .. } => "HINT_GET",
            MetadataComm { .. } => "METADATA_COMM",
            SalPrint { .. } => "SAL_PRINT",
            SalTerminate { .. } => "SAL_TERMINATE",
            ResiliencyNotify => "RESILIENCY_NOTIFY",
            ResiliencyMonitor => "RESILIENCY_MONITOR",
            ResiliencyCheckpoint => "RESILIENCY_CHECKPOINT",
        }
    }
}

// ─── Envelope ─────────────────────────────────────────────────

/// The uniform policy message. Every operation — API call, internal
/// cascade, remote request — is one of these flowing through
/// `PolicyDomain::process_message`.
#[derive(Clone, Debug)]
pub struct PolicyMsg {
    pub src: Location,
    pub dst: Location,
    pub flags: MsgFlags,
    /// The EDT on whose behalf this message was issued, for tracing and
    /// finish-scope attribution. NULL when issued outside task context.
    pub issuer: Guid,
    pub return_detail: ReturnCode,
    pub payload: Payload,
}

impl PolicyMsg {
    pub fn request(src: Location, dst: Location, payload: Payload) -> Self {
        Self {
            src,
            dst,
            flags: MsgFlags::REQUEST,
            issuer: NULL_GUID,
            return_detail: ReturnCode::Ok,
            payload,
        }
    }

    /// Flip a request into its response leg.
    pub fn into_response(mut self) -> Self {
        std::mem::swap(&mut self.src, &mut self.dst);
        self.flags.remove(MsgFlags::REQUEST | MsgFlags::REQ_RESPONSE);
        self.flags.insert(MsgFlags::RESPONSE);
        self
    }

    pub fn is_response(&self) -> bool {
        self.flags.contains(MsgFlags::RESPONSE)
    }
}
