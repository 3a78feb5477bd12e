use crate::config::RuntimeConfig;
use crate::datablock::{AcquireOutcome, DataBlock, DbProps};
use crate::errors::{Result, ReturnCode, RuntimeError};
use crate::event::{self, Event, EventKind, EventParams};
use crate::guid::{
    DbAccessMode, Guid, GuidKind, Location, RegNode, NULL_GUID,
};
use crate::guid_provider::{GuidProvider, Object, Resolution};
use crate::hint::{Hint, HintProp};
use crate::metadata;
use crate::msg::{MdMode, MdPayload, MsgFlags, Payload, PolicyMsg, SchedNotifyKind};
use crate::runlevel::RlSwitch;
use crate::scheduler::Scheduler;
use crate::task::{self, CreateArgs, EdtProps, Task};
use crate::trace::{TraceAction, TraceBuffer, TraceType};
use crate::comm::Transport;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};

// ─── Statistics ───────────────────────────────────────────────

/// Per-domain counters, sampled by MGT_MONITOR_PROGRESS.
#[derive(Default)]
pub struct PdStats {
    edts_created: AtomicU64,
    edts_executed: AtomicU64,
    events_created: AtomicU64,
    events_satisfied_n: AtomicU64,
    dbs_created: AtomicU64,
    msgs_processed: AtomicU64,
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub edts_created: u64,
    pub edts_executed: u64,
    pub events_created: u64,
    pub events_satisfied: u64,
    pub dbs_created: u64,
    pub msgs_processed: u64,
}

impl PdStats {
    pub fn edt_created(&self) {
        self.edts_created.fetch_add(1, Ordering::Relaxed);
    }
    pub fn edt_finished(&self) {
        self.edts_executed.fetch_add(1, Ordering::Relaxed);
    }
    pub fn event_created(&self) {
        self.events_created.fetch_add(1, Ordering::Relaxed);
    }
    pub fn events_satisfied(&self) {
        self.events_satisfied_n.fetch_add(1, Ordering::Relaxed);
    }
    pub fn db_created(&self) {
        self.dbs_created.fetch_add(1, Ordering::Relaxed);
    }
    pub fn msg_processed(&self) {
        self.msgs_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            edts_created: self.edts_created.load(Ordering::Relaxed),
            edts_executed: self.edts_executed.load(Ordering::Relaxed),
            events_created: self.events_created.load(Ordering::Relaxed),
            events_satisfied: self.events_satisfied_n.load(Ordering::Relaxed),
            dbs_created: self.dbs_created.load(Ordering::Relaxed),
            msgs_processed: self.msgs_processed.load(Ordering::Relaxed),
        }
    }
}

// ─── Policy domain ────────────────────────────────────────────

/// The unit of fate-sharing: owns its workers, scheduler, guid provider and
/// transport endpoint, and routes every operation through
/// [`PolicyDomain::process_message`].
pub struct PolicyDomain {
    location: Location,
    nb_pds: u16,
    pub config: RuntimeConfig,
    pub guid_provider: GuidProvider,
    pub scheduler: Arc<dyn Scheduler>,
    pub transport: Arc<dyn Transport>,
    pub rl_switch: RlSwitch,
    pub stats: PdStats,
    pub trace: TraceBuffer,
    shutdown_code: AtomicU32,
    shutdown_armed: AtomicBool,
    pub shutdown_notify: Notify,
    stop_tx: watch::Sender<bool>,
    neighbors: spin::Mutex<Vec<Location>>,
}

impl PolicyDomain {
    pub fn new(
        location: Location,
        nb_pds: u16,
        config: RuntimeConfig,
        scheduler: Arc<dyn Scheduler>,
        transport: Arc<dyn Transport>,
    ) -> Arc<PolicyDomain> {
        let (stop_tx, _) = watch::channel(false);
        let trace_enabled = config.trace_enabled;
        Arc::new(PolicyDomain {
            location,
            nb_pds,
            config,
            guid_provider: GuidProvider::new(location),
            scheduler,
            transport,
            rl_switch: RlSwitch::new(),
            stats: PdStats::default(),
            trace: TraceBuffer::new(location, trace_enabled),
            shutdown_code: AtomicU32::new(0),
            shutdown_armed: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            stop_tx,
            neighbors: spin::Mutex::new(Vec::new()),
        })
    }

    pub fn location(&self) -> Location {
        self.location
    }

    pub fn nb_pds(&self) -> u16 {
        self.nb_pds
    }

    /// An affinity guid naming policy domain `loc`.
    pub fn affinity_guid(&self, loc: Location) -> Guid {
        Guid::encode(GuidKind::Affinity, loc, u64::from(loc))
    }

    pub fn allocate_guid(&self, kind: GuidKind) -> Guid {
        self.guid_provider.create_guid(kind)
    }

    pub fn release_guid(&self, guid: Guid) {
        self.guid_provider.release(guid, true);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_armed.load(Ordering::Acquire)
    }

    pub fn shutdown_code(&self) -> u32 {
        self.shutdown_code.load(Ordering::Acquire)
    }

    pub fn stop_watch(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// Tell workers to park permanently (COMPUTE_OK tear-down).
    pub fn signal_stop(&self) {
        let _ = self.stop_tx.send(true);
        self.scheduler.notifier().notify_waiters();
    }

    // ── Message entry points ──

    /// Inbound leg of the transport pump.
    pub fn process_incoming(&self, mut msg: PolicyMsg) {
        msg.flags.insert(MsgFlags::FROM_MSG);
        self.trace.emit(
            TraceType::Message,
            TraceAction::MsgReceive,
            u32::MAX,
            msg.issuer,
            NULL_GUID,
        );
        if let Err(e) = self.process_message(&mut msg) {
            tracing::warn!(op = msg.payload.op_name(), err = %e, "inbound message failed");
        }
    }

    fn forward(&self, msg: &mut PolicyMsg, to: Location) -> Result<()> {
        msg.dst = to;
        msg.return_detail = ReturnCode::Pending;
        self.trace.emit(
            TraceType::Message,
            TraceAction::MsgSend,
            u32::MAX,
            msg.issuer,
            NULL_GUID,
        );
        self.transport.post(msg.clone())
    }

    /// The single dispatcher: every operation is one of the ~40 payload
    /// arms. Local work happens inline; remote destinations are forwarded;
    /// unresolved metadata parks the message on its proxy. Errors become
    /// `return_detail` codes — this function never unwinds past the arm.
    pub fn process_message(&self, msg: &mut PolicyMsg) -> Result<()> {
        self.stats.msg_processed();
        if msg.dst != self.location {
            return self.forward(msg, msg.dst);
        }
        // Scheduler pre-hook on the two creation operations.
        if matches!(msg.payload, Payload::WorkCreate { .. } | Payload::DbCreate { .. })
            && !msg.flags.contains(MsgFlags::IGNORE_PRE_PROCESS)
            && !self.scheduler.pre_process(msg)
        {
            return Ok(());
        }
        let result = self.dispatch(msg);
        if let Err(e) = &result {
            msg.return_detail = e.code();
        }
        if matches!(msg.payload, Payload::WorkCreate { .. } | Payload::DbCreate { .. })
            && msg.flags.contains(MsgFlags::REQ_POST_PROCESS)
        {
            self.scheduler.post_process(msg);
        }
        result
    }

    fn dispatch(&self, msg: &mut PolicyMsg) -> Result<()> {
        let src = msg.src;
        let issuer = msg.issuer;
        let is_response = msg.is_response();
        let wants_response = msg.flags.contains(MsgFlags::REQ_RESPONSE);
        match &mut msg.payload {
            // ── Data-blocks ──
            Payload::DbCreate {
                size,
                props,
                hint,
                affinity: _,
                guid_out,
            } => {
                let guid = if guid_out.is_null() {
                    self.allocate_guid(GuidKind::Db)
                } else {
                    *guid_out
                };
                let mut h = Hint::default();
                if let Some(user) = hint.take() {
                    h.merge_from(&user);
                }
                let db = Arc::new(DataBlock::new(guid, *size, *props, h));
                if !props.contains(DbProps::NO_ACQUIRE) {
                    if let Some(cur) = crate::worker::current_task() {
                        db.acquire(cur.guid, 0, DbAccessMode::Rw, self.location)?;
                        cur.inner.lock().unk_dbs.push(guid);
                    }
                }
                self.guid_provider.register(guid, Object::Db(db));
                self.stats.db_created();
                self.trace
                    .emit(TraceType::Db, TraceAction::Create, u32::MAX, issuer, guid);
                *guid_out = guid;
                Ok(())
            }

            Payload::DbAcquire {
                db,
                edt,
                slot,
                mode,
                handle_out,
            } => {
                let (db, edt, slot, mode) = (*db, *edt, *slot, *mode);
                if is_response {
                    // Ack for a parked acquire: cache the handle and resume
                    // the frontier walk.
                    let handle = handle_out
                        .clone()
                        .ok_or(RuntimeError::Fault("acquire response without handle"))?;
                    self.guid_provider.register(db, Object::Db(handle.clone()));
                    let t = self.local_task(edt)?;
                    return task::dependence_resolved(self, &t, db, handle);
                }
                match self.guid_provider.lookup(db) {
                    Some(Object::Db(block)) => match block.acquire(edt, slot, mode, src)? {
                        AcquireOutcome::Granted => {
                            self.trace
                                .emit(TraceType::Db, TraceAction::Acquire, u32::MAX, edt, db);
                            *handle_out = Some(block);
                            if wants_response && src != self.location {
                                let resp = msg.clone().into_response();
                                return self.transport.post(resp);
                            }
                            Ok(())
                        }
                        AcquireOutcome::Queued => Err(RuntimeError::Pending(db)),
                    },
                    Some(_) => Err(RuntimeError::Inval("acquire target is not a data-block")),
                    None if db.location() != self.location => {
                        let mut fwd = msg.clone();
                        fwd.flags.insert(MsgFlags::REQ_RESPONSE);
                        self.forward(&mut fwd, db.location())?;
                        Err(RuntimeError::Pending(db))
                    }
                    None => Err(RuntimeError::NoEnt(db)),
                }
            }

            Payload::DbRelease { db, edt } => {
                let (db, edt) = (*db, *edt);
                match self.guid_provider.lookup(db) {
                    Some(Object::Db(block)) => {
                        let (granted, freed) = block.release(edt)?;
                        self.trace
                            .emit(TraceType::Db, TraceAction::Release, u32::MAX, edt, db);
                        for w in granted {
                            self.grant_acquire(&block, w)?;
                        }
                        if freed {
                            self.release_guid(db);
                        }
                        Ok(())
                    }
                    Some(_) => Err(RuntimeError::Inval("release target is not a data-block")),
                    None if db.location() != self.location => self.forward(msg, db.location()),
                    None => Err(RuntimeError::NoEnt(db)),
                }
            }

            Payload::DbFree { db } => {
                let db = *db;
                match self.guid_provider.lookup(db) {
                    Some(Object::Db(block)) => {
                        if block.free()? {
                            self.release_guid(db);
                            self.trace
                                .emit(TraceType::Db, TraceAction::Destroy, u32::MAX, issuer, db);
                        }
                        Ok(())
                    }
                    Some(_) => Err(RuntimeError::Inval("free target is not a data-block")),
                    None if db.location() != self.location => self.forward(msg, db.location()),
                    None => Err(RuntimeError::NoEnt(db)),
                }
            }

            Payload::MemAlloc { size: _, ok_out } => {
                *ok_out = true;
                Ok(())
            }
            Payload::MemUnalloc { .. } => Ok(()),

            // ── Work ──
            Payload::WorkCreate { .. } => self.handle_work_create(msg),

            Payload::WorkDestroy { guid } => {
                let t = self.local_task(*guid)?;
                task::destroy(self, &t)
            }

            // ── Templates ──
            Payload::EdtTempCreate {
                func,
                paramc,
                depc,
                name,
                guid_out,
            } => {
                let guid = if guid_out.is_null() {
                    self.allocate_guid(GuidKind::EdtTemplate)
                } else {
                    *guid_out
                };
                let tpl = crate::task::TaskTemplate::new(guid, func.clone(), *paramc, *depc, name);
                self.guid_provider.register(guid, Object::Template(tpl));
                *guid_out = guid;
                Ok(())
            }

            Payload::EdtTempDestroy { guid } => {
                self.release_guid(*guid);
                Ok(())
            }

            // ── Events ──
            Payload::EvtCreate {
                kind,
                carry_data: _,
                params,
                label,
                guid_out,
            } => {
                let ekind = EventKind::from_guid_kind(*kind)
                    .ok_or(RuntimeError::Inval("not an event kind"))?;
                let created = if let Some(label) = label {
                    self.create_labelled_event(label, ekind, params.as_ref(), guid_out)?
                } else {
                    let guid = if guid_out.is_null() {
                        self.allocate_guid(*kind)
                    } else {
                        *guid_out
                    };
                    let evt = if ekind == EventKind::Collective {
                        return Err(RuntimeError::Inval(
                            "collective events must be labelled across the process group",
                        ));
                    } else {
                        Event::new(guid, ekind, params.as_ref())?
                    };
                    self.guid_provider.register(guid, Object::Event(evt));
                    *guid_out = guid;
                    true
                };
                if created {
                    self.stats.event_created();
                    self.trace.emit(
                        TraceType::Event,
                        TraceAction::Create,
                        u32::MAX,
                        issuer,
                        *guid_out,
                    );
                }
                Ok(())
            }

            Payload::EvtDestroy { guid } => {
                let guid = *guid;
                match self.resolve_event_or_park(guid, msg)? {
                    Some(evt) => event::destroy(self, &evt),
                    None => Ok(()),
                }
            }

            Payload::EvtGet { guid, .. } => {
                let guid = *guid;
                let data = match self.resolve_event_or_park(guid, msg)? {
                    Some(evt) => Some(evt.get()),
                    None => None,
                };
                if let Payload::EvtGet { data_out, .. } = &mut msg.payload {
                    match data {
                        Some(d) => *data_out = d,
                        None => msg.return_detail = ReturnCode::Pending,
                    }
                }
                Ok(())
            }

            // ── Guid provider ──
            Payload::GuidCreate { kind, guid_out } => {
                *guid_out = self.allocate_guid(*kind);
                Ok(())
            }
            Payload::GuidInfo {
                guid,
                kind_out,
                location_out,
            } => {
                *kind_out = guid.kind();
                *location_out = guid.location();
                Ok(())
            }
            Payload::GuidMetadataClone { guid, resolved_out } => {
                match self.guid_provider.resolve(*guid) {
                    Resolution::Local(_) => {
                        *resolved_out = true;
                        Ok(())
                    }
                    Resolution::Pending {
                        first_observer, ..
                    } => {
                        if first_observer {
                            self.md_pull_clone(*guid);
                        }
                        *resolved_out = false;
                        msg.return_detail = ReturnCode::Pending;
                        Ok(())
                    }
                    Resolution::Unknown => Err(RuntimeError::NoEnt(*guid)),
                }
            }
            Payload::GuidReserve {
                label,
                kind,
                guid_out,
            } => {
                *guid_out = self.guid_provider.reserve_labelled(label, *kind, 0);
                Ok(())
            }
            Payload::GuidUnreserve { guid } => {
                self.guid_provider.unreserve(*guid);
                Ok(())
            }
            Payload::GuidDestroy {
                guid,
                free_metadata,
            } => {
                self.guid_provider.release(*guid, *free_metadata);
                Ok(())
            }

            // ── Scheduler ──
            Payload::SchedGetWork { worker, task_out } => {
                *task_out = self
                    .scheduler
                    .take(*worker)
                    .map(|t| t.guid)
                    .unwrap_or(NULL_GUID);
                Ok(())
            }
            Payload::SchedNotify { kind, guid } => {
                if *kind == SchedNotifyKind::EdtReady {
                    let t = self.local_task(*guid)?;
                    self.scheduler.give(t);
                }
                Ok(())
            }
            Payload::SchedTransact | Payload::SchedAnalyze => {
                msg.return_detail = ReturnCode::NotSup;
                Ok(())
            }

            // ── Dependences ──
            Payload::DepAdd {
                source,
                dest,
                slot,
                mode,
            } => {
                let (source, dest, slot, mode) = (*source, *dest, *slot, *mode);
                self.handle_dep_add(msg, source, dest, slot, mode)
            }

            Payload::DepRegSignaler {
                signaler,
                dest,
                slot,
                mode,
                is_add_dep: _,
            } => {
                let t = self.local_task(*dest)?;
                task::register_signaler(self, &t, *signaler, *slot, *mode)
            }

            Payload::DepRegWaiter {
                waiter,
                dest,
                slot,
                mode,
                is_add_dep: _,
            } => {
                let (waiter, dest, slot, mode) = (*waiter, *dest, *slot, *mode);
                // Channel registrations execute at the owner so satisfies
                // and waiters pair in one FIFO.
                if dest.kind() == GuidKind::EventChannel
                    && dest.location() != self.location
                    && self.guid_provider.lookup(dest).is_none()
                {
                    return self.forward(msg, dest.location());
                }
                match self.resolve_event_or_park(dest, msg)? {
                    Some(evt) => event::register_waiter(self, &evt, waiter, slot, mode),
                    None => Ok(()),
                }
            }

            Payload::DepSatisfy {
                dest,
                payload,
                slot,
            } => {
                let (dest, payload, slot) = (*dest, *payload, *slot);
                self.handle_satisfy(msg, dest, payload, slot)
            }

            Payload::DepUnregWaiter { waiter, dest, slot } => {
                let (waiter, dest, slot) = (*waiter, *dest, *slot);
                match self.guid_provider.lookup(dest) {
                    Some(Object::Event(evt)) => event::unregister_waiter(self, &evt, waiter, slot),
                    Some(_) => Err(RuntimeError::Inval("unregister target is not an event")),
                    None if dest.location() != self.location => self.forward(msg, dest.location()),
                    None => Err(RuntimeError::NoEnt(dest)),
                }
            }

            Payload::DepUnregSignaler {
                signaler: _,
                dest,
                slot,
            } => {
                let t = self.local_task(*dest)?;
                let mut inner = t.inner.lock();
                let node = inner
                    .signalers
                    .get_mut(*slot as usize)
                    .ok_or(RuntimeError::Inval("slot out of bounds"))?;
                if node.slot >= crate::guid::SLOT_SENTINEL_FLOOR {
                    return Err(RuntimeError::Perm("slot already satisfied"));
                }
                node.guid = crate::guid::UNINITIALIZED_GUID;
                node.mode = DbAccessMode::NullMode;
                Ok(())
            }

            Payload::DepDynAdd { edt, db, mode: _ } => {
                let t = self.local_task(*edt)?;
                t.inner.lock().unk_dbs.push(*db);
                Ok(())
            }

            Payload::DepDynRemove { edt, db } => {
                let t = self.local_task(*edt)?;
                let mut inner = t.inner.lock();
                if let Some(pos) = inner.unk_dbs.iter().position(|g| g == db) {
                    inner.unk_dbs.remove(pos);
                }
                Ok(())
            }

            // ── Management ──
            Payload::MgtRegister { loc } => {
                let mut n = self.neighbors.lock();
                if !n.contains(loc) {
                    n.push(*loc);
                }
                Ok(())
            }
            Payload::MgtUnregister { loc } => {
                self.neighbors.lock().retain(|l| l != loc);
                Ok(())
            }
            Payload::MgtRlNotify {
                runlevel: _,
                phase: _,
                props,
                error_code,
            } => {
                if props.contains(crate::runlevel::RlProps::TEAR_DOWN) {
                    self.arm_shutdown(*error_code);
                }
                Ok(())
            }
            Payload::MgtMonitorProgress { edts_out, msgs_out } => {
                let snap = self.stats.snapshot();
                *edts_out = snap.edts_executed;
                *msgs_out = snap.msgs_processed;
                Ok(())
            }

            // ── Hints ──
            Payload::HintSet { guid, hint } => self.hint_set(*guid, hint.clone()),
            Payload::HintGet { guid, hint_out } => {
                *hint_out = self.hint_get(*guid)?;
                Ok(())
            }

            // ── Distributed metadata ──
            Payload::MetadataComm { .. } => metadata::handle(self, msg),

            // ── SAL ──
            Payload::SalPrint { text } => {
                tracing::info!(target: "edt_lite_sal", "{}", text);
                Ok(())
            }
            Payload::SalTerminate { error_code } => {
                let code = *error_code;
                self.broadcast_shutdown(code);
                Ok(())
            }

            // ── Resiliency ──
            Payload::ResiliencyNotify
            | Payload::ResiliencyMonitor
            | Payload::ResiliencyCheckpoint => {
                msg.return_detail = ReturnCode::NotSup;
                Ok(())
            }
        }
    }

    // ── Work creation ──

    fn handle_work_create(&self, msg: &mut PolicyMsg) -> Result<()> {
        // Allocate the task's identity (and its output event) eagerly: a
        // creation parked on a template clone, or captured on a deferred
        // chain, must still hand the caller referenceable guids.
        {
            let Payload::WorkCreate {
                props,
                guid_out,
                output_event_out,
                ..
            } = &mut msg.payload
            else {
                unreachable!()
            };
            if guid_out.is_null() {
                *guid_out = self.allocate_guid(GuidKind::Edt);
            }
            if output_event_out.is_null() && props.contains(EdtProps::OEVT_VALID) {
                // Once by default, sticky for LONG tasks.
                let ekind = if props.contains(EdtProps::LONG) {
                    EventKind::Sticky
                } else {
                    EventKind::Once
                };
                let eguid = self.allocate_guid(ekind.guid_kind());
                let evt = Event::new(eguid, ekind, None)?;
                self.guid_provider.register(eguid, Object::Event(evt));
                self.stats.event_created();
                *output_event_out = eguid;
            }
        }

        // Resolve the template; park the whole message on its proxy if it
        // lives elsewhere and has not been cloned yet.
        let (template_guid, affinity_loc) = match &msg.payload {
            Payload::WorkCreate { template, hint, .. } => {
                let aff = hint
                    .as_ref()
                    .and_then(|h| h.get(HintProp::EdtAffinity))
                    .map(|v| Guid(v).location());
                (*template, aff)
            }
            _ => unreachable!(),
        };
        let tpl = match self.guid_provider.resolve(template_guid) {
            Resolution::Local(Object::Template(t)) => t,
            Resolution::Local(_) => {
                return Err(RuntimeError::Inval("not a template guid"))
            }
            Resolution::Pending {
                proxy,
                first_observer,
            } => {
                proxy.park(msg.clone());
                if first_observer {
                    self.md_pull_clone(template_guid);
                }
                msg.return_detail = ReturnCode::Pending;
                return Ok(());
            }
            Resolution::Unknown => return Err(RuntimeError::NoEnt(template_guid)),
        };

        let issuer = msg.issuer;
        let Payload::WorkCreate {
            paramv,
            depc,
            depv,
            props,
            hint,
            parent_latch,
            guid_out,
            output_event_out,
            ..
        } = &mut msg.payload
        else {
            unreachable!()
        };

        let guid = *guid_out;
        let output_event = *output_event_out;

        let t = task::create(
            self,
            guid,
            CreateArgs {
                template: tpl,
                paramv: std::mem::take(paramv),
                depc: *depc,
                props: *props,
                hint: hint.take(),
                parent_latch: *parent_latch,
                output_event,
            },
        )?;
        self.guid_provider.register(guid, Object::Task(t.clone()));
        self.stats.edt_created();
        self.trace
            .emit(TraceType::Task, TraceAction::Create, u32::MAX, issuer, guid);

        // Pre-supplied dependences.
        let depv = depv.take();
        let depc_n = t.depc;
        if let Some(depv) = depv {
            if depv.len() as u32 != depc_n {
                return Err(RuntimeError::Inval("depv length does not match depc"));
            }
            for (i, src) in depv.iter().enumerate() {
                if src.is_uninitialized() {
                    continue;
                }
                let mut dep = PolicyMsg::request(
                    self.location,
                    self.location,
                    Payload::DepAdd {
                        source: *src,
                        dest: guid,
                        slot: i as u32,
                        mode: DbAccessMode::Rw,
                    },
                );
                dep.issuer = issuer;
                self.process_message(&mut dep)?;
            }
        }

        if depc_n == 0 {
            // Runnable at creation. An affinity naming a remote domain
            // moves the task instead of scheduling it here.
            if let Some(target) = affinity_loc {
                if target != self.location && target < self.nb_pds {
                    t.set_ghost();
                    self.md_push(
                        guid,
                        target,
                        MdMode::Move,
                        MdPayload::TaskMove(t.snapshot()),
                    );
                    return Ok(());
                }
            }
            task::all_depv_satisfied(self, &t)?;
        }
        Ok(())
    }

    // ── Dependence-add dispatch table ──

    fn handle_dep_add(
        &self,
        msg: &mut PolicyMsg,
        source: Guid,
        dest: Guid,
        slot: u32,
        mode: DbAccessMode,
    ) -> Result<()> {
        let dest_kind = dest.kind();
        let source_kind = source.kind();
        // The add executes at the destination's home.
        if self.guid_provider.lookup(dest).is_none() && dest.location() != self.location {
            return self.forward(msg, dest.location());
        }
        match (source_kind, dest_kind) {
            // NULL or DB feeding a task: convert to an immediate satisfy,
            // recording the mode first when a block flows.
            (GuidKind::None, GuidKind::Edt) => {
                let t = self.local_task(dest)?;
                task::satisfy(self, &t, NULL_GUID, slot)
            }
            (GuidKind::Db, GuidKind::Edt) => {
                let t = self.local_task(dest)?;
                task::register_signaler(self, &t, source, slot, mode)
            }
            // NULL or DB feeding an event: immediate satisfy.
            (GuidKind::None, k) if k.is_event() => {
                self.handle_satisfy(msg, dest, NULL_GUID, slot)
            }
            (GuidKind::Db, k) if k.is_event() => self.handle_satisfy(msg, dest, source, slot),
            // Persistent event feeding a task: pull mode, the task
            // registers itself when its frontier arrives.
            (sk, GuidKind::Edt) if sk.is_persistent_event() => {
                let t = self.local_task(dest)?;
                task::register_signaler(self, &t, source, slot, mode)
            }
            // Ephemeral event feeding a task: push mode; mark the slot and
            // join the event's waiter list. The event is resolved first so
            // a parked message replays the whole add exactly once.
            (sk, GuidKind::Edt) if sk.is_event() => {
                if sk == GuidKind::EventChannel
                    && source.location() != self.location
                    && self.guid_provider.lookup(source).is_none()
                {
                    // Remote channel: mark the slot here, register at the
                    // owner (FIFO pairing happens there).
                    let t = self.local_task(dest)?;
                    task::register_signaler(self, &t, source, slot, mode)?;
                    return self.register_waiter_on_event(source, dest, slot, mode);
                }
                match self.resolve_event_or_park(source, msg)? {
                    Some(evt) => {
                        let t = self.local_task(dest)?;
                        task::register_signaler(self, &t, source, slot, mode)?;
                        event::register_waiter(self, &evt, dest, slot, mode)
                    }
                    None => Ok(()),
                }
            }
            // Event feeding an event: always a waiter registration.
            (sk, dk) if sk.is_event() && dk.is_event() => {
                match self.resolve_event_or_park(source, msg)? {
                    Some(evt) => event::register_waiter(self, &evt, dest, slot, mode),
                    None => Ok(()),
                }
            }
            _ => Err(RuntimeError::Inval("unsupported dependence endpoints")),
        }
    }

    // ── Satisfaction routing ──

    fn handle_satisfy(
        &self,
        msg: &mut PolicyMsg,
        dest: Guid,
        payload: Guid,
        slot: u32,
    ) -> Result<()> {
        match self.guid_provider.lookup(dest) {
            Some(Object::Task(t)) => task::satisfy(self, &t, payload, slot),
            Some(Object::Event(evt)) => event::satisfy(self, &evt, payload, slot),
            Some(_) => Err(RuntimeError::Inval("satisfy target kind")),
            None if dest.location() != self.location => self.forward(msg, dest.location()),
            None => Err(RuntimeError::NoEnt(dest)),
        }
    }

    // ── Labelled / collective creation ──

    /// Labelled creation: every domain derives the same guid; the local
    /// claim race decides who materialises the metadata. Losers adopt the
    /// canonical copy and report E_GUID_EXISTS as a benign outcome.
    fn create_labelled_event(
        &self,
        label: &str,
        kind: EventKind,
        params: Option<&EventParams>,
        guid_out: &mut Guid,
    ) -> Result<bool> {
        let guid = self
            .guid_provider
            .reserve_labelled(label, kind.guid_kind(), 0);
        if let Some(Object::Event(_)) = self.guid_provider.lookup(guid) {
            *guid_out = guid;
            return Ok(false);
        }
        // Non-collective labelled events have a single master at the
        // derivation owner; other domains adopt the guid and clone lazily.
        if kind != EventKind::Collective && guid.location() != self.location {
            *guid_out = guid;
            return Ok(false);
        }
        if self.guid_provider.try_claim(guid) {
            let evt = match kind {
                EventKind::Collective => {
                    let params = match params {
                        Some(EventParams::Collective(p)) => *p,
                        _ => return Err(RuntimeError::Inval("collective params expected")),
                    };
                    let state =
                        crate::event::CollectiveState::new(params, self.location, self.nb_pds)?;
                    Event::new_collective(guid, state)
                }
                _ => Event::new(guid, kind, params)?,
            };
            self.guid_provider.register(guid, Object::Event(evt));
            *guid_out = guid;
            Ok(true)
        } else {
            // Another local caller won; spin until it registers.
            loop {
                if let Some(Object::Event(_)) = self.guid_provider.lookup(guid) {
                    break;
                }
                std::hint::spin_loop();
            }
            *guid_out = guid;
            Err(RuntimeError::GuidExists(guid))
        }
    }

    // ── Helpers used across the object modules ──

    pub(crate) fn local_task(&self, guid: Guid) -> Result<Arc<Task>> {
        match self.guid_provider.lookup(guid) {
            Some(Object::Task(t)) => Ok(t),
            _ => Err(RuntimeError::NoEnt(guid)),
        }
    }

    /// Resolve an event guid; a remote, not-yet-cloned guid parks `msg` on
    /// the proxy and triggers the clone pull.
    pub(crate) fn resolve_event_or_park(
        &self,
        guid: Guid,
        msg: &PolicyMsg,
    ) -> Result<Option<Arc<Event>>> {
        match self.guid_provider.resolve(guid) {
            Resolution::Local(Object::Event(evt)) => Ok(Some(evt)),
            Resolution::Local(_) => Err(RuntimeError::Inval("expected an event guid")),
            Resolution::Pending {
                proxy,
                first_observer,
            } => {
                proxy.park(msg.clone());
                if first_observer {
                    self.md_pull_clone(guid);
                }
                Ok(None)
            }
            Resolution::Unknown => Err(RuntimeError::NoEnt(guid)),
        }
    }

    /// Satisfy one waiter record: builds the DEP_SATISFY message and routes
    /// it through the dispatcher (local or remote).
    pub fn satisfy_regnode(&self, satisfier: Guid, node: &RegNode, payload: Guid) -> Result<()> {
        let mut msg = PolicyMsg::request(
            self.location,
            self.location,
            Payload::DepSatisfy {
                dest: node.guid,
                payload,
                slot: node.slot,
            },
        );
        msg.issuer = crate::worker::current_task_guid();
        self.trace.emit(
            TraceType::Event,
            TraceAction::Satisfy,
            crate::worker::current_worker(),
            satisfier,
            node.guid,
        );
        self.process_message(&mut msg)
    }

    /// Register `waiter` (a task) on an event's waiter list.
    pub fn register_waiter_on_event(
        &self,
        evt: Guid,
        waiter: Guid,
        slot: u32,
        mode: DbAccessMode,
    ) -> Result<()> {
        let mut msg = PolicyMsg::request(
            self.location,
            self.location,
            Payload::DepRegWaiter {
                waiter,
                dest: evt,
                slot,
                mode,
                is_add_dep: false,
            },
        );
        self.process_message(&mut msg)
    }

    /// Acquire a block for a task's frontier slot: `Some(handle)` when
    /// granted, `None` when parked (local contention or remote fetch).
    pub fn acquire_db(
        &self,
        db: Guid,
        task: &Arc<Task>,
        slot: u32,
        mode: DbAccessMode,
    ) -> Result<Option<Arc<DataBlock>>> {
        let mut msg = PolicyMsg::request(
            self.location,
            self.location,
            Payload::DbAcquire {
                db,
                edt: task.guid,
                slot,
                mode,
                handle_out: None,
            },
        );
        match self.process_message(&mut msg) {
            Ok(()) => match msg.payload {
                Payload::DbAcquire { handle_out, .. } => Ok(handle_out),
                _ => unreachable!(),
            },
            Err(RuntimeError::Pending(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// A queued acquire became grantable on release.
    fn grant_acquire(&self, block: &Arc<DataBlock>, w: crate::datablock::AcquireWaiter) -> Result<()> {
        if w.requester == self.location {
            let t = self.local_task(w.task)?;
            task::dependence_resolved(self, &t, block.guid, block.clone())
        } else {
            let resp = PolicyMsg {
                src: self.location,
                dst: w.requester,
                flags: MsgFlags::RESPONSE,
                issuer: NULL_GUID,
                return_detail: ReturnCode::Ok,
                payload: Payload::DbAcquire {
                    db: block.guid,
                    edt: w.task,
                    slot: w.slot,
                    mode: w.mode,
                    handle_out: Some(block.clone()),
                },
            };
            self.transport.post(resp)
        }
    }

    pub fn release_db(&self, db: Guid, edt: Guid) -> Result<()> {
        let mut msg = PolicyMsg::request(
            self.location,
            self.location,
            Payload::DbRelease { db, edt },
        );
        self.process_message(&mut msg)
    }

    /// A data-block pre-filled with `bytes` (collective results).
    pub fn create_local_db(&self, bytes: &[u8]) -> Result<Guid> {
        let guid = self.allocate_guid(GuidKind::Db);
        let db = Arc::new(DataBlock::new(
            guid,
            bytes.len() as u64,
            DbProps::NO_ACQUIRE,
            Hint::default(),
        ));
        db.write()[..bytes.len()].copy_from_slice(bytes);
        self.guid_provider.register(guid, Object::Db(db));
        self.stats.db_created();
        Ok(guid)
    }

    /// A latch event wired for a finish scope: counter starts at one (the
    /// scope owner), fires into the output event and checks out of the
    /// enclosing latch.
    pub fn create_finish_latch(&self, output_event: Guid, parent_latch: Guid) -> Result<Guid> {
        let guid = self.allocate_guid(GuidKind::EventLatch);
        let evt = Event::new(
            guid,
            EventKind::Latch,
            Some(&EventParams::Latch { counter: 1 }),
        )?;
        {
            let mut inner = evt.inner.lock();
            if !output_event.is_null() {
                inner
                    .waiters
                    .push(RegNode::new(output_event, 0, DbAccessMode::NullMode));
            }
            if !parent_latch.is_null() {
                inner.waiters.push(RegNode::new(
                    parent_latch,
                    crate::event::LATCH_DECR_SLOT,
                    DbAccessMode::NullMode,
                ));
            }
            let n = inner.waiters.len() as u32;
            drop(inner);
            evt.waiters_count.store(n, Ordering::Release);
        }
        self.guid_provider.register(guid, Object::Event(evt));
        self.stats.event_created();
        Ok(guid)
    }

    pub fn scheduler_give(&self, task: Arc<Task>) -> Result<()> {
        self.trace.emit(
            TraceType::Scheduler,
            TraceAction::Runnable,
            u32::MAX,
            NULL_GUID,
            task.guid,
        );
        self.scheduler.give(task);
        Ok(())
    }

    // ── Distributed metadata helpers ──

    /// Fire-and-forget metadata push. Failures are logged, not propagated:
    /// the peer list is best-effort during teardown.
    pub fn md_push(&self, target: Guid, to: Location, mode: MdMode, payload: MdPayload) {
        if to == self.location {
            return;
        }
        let msg = PolicyMsg {
            src: self.location,
            dst: to,
            flags: MsgFlags::REQUEST,
            issuer: crate::worker::current_task_guid(),
            return_detail: ReturnCode::Ok,
            payload: Payload::MetadataComm {
                target,
                direction: crate::msg::MdDir::Push,
                mode,
                payload,
            },
        };
        if let Err(e) = self.transport.post(msg) {
            tracing::debug!(target = %target, to, err = %e, "metadata push dropped");
        }
    }

    /// Issue the clone pull for a remote guid.
    pub fn md_pull_clone(&self, target: Guid) {
        let msg = PolicyMsg {
            src: self.location,
            dst: target.location(),
            flags: MsgFlags::REQUEST | MsgFlags::REQ_RESPONSE,
            issuer: NULL_GUID,
            return_detail: ReturnCode::Ok,
            payload: Payload::MetadataComm {
                target,
                direction: crate::msg::MdDir::Pull,
                mode: MdMode::Clone,
                payload: MdPayload::None,
            },
        };
        if let Err(e) = self.transport.post(msg) {
            tracing::warn!(target = %target, err = %e, "clone pull failed to send");
        }
    }

    // ── Hints ──

    fn hint_set(&self, guid: Guid, hint: Hint) -> Result<()> {
        match self.guid_provider.lookup(guid) {
            Some(Object::Task(t)) => {
                t.hint.lock().merge_from(&hint);
                Ok(())
            }
            Some(Object::Template(t)) => {
                t.hint.lock().merge_from(&hint);
                Ok(())
            }
            Some(Object::Event(e)) => {
                e.inner.lock().hint.merge_from(&hint);
                Ok(())
            }
            Some(Object::Db(d)) => {
                d.hint.lock().merge_from(&hint);
                Ok(())
            }
            None => Err(RuntimeError::NoEnt(guid)),
        }
    }

    fn hint_get(&self, guid: Guid) -> Result<Option<Hint>> {
        match self.guid_provider.lookup(guid) {
            Some(Object::Task(t)) => Ok(Some(t.hint.lock().clone())),
            Some(Object::Template(t)) => Ok(Some(t.hint.lock().clone())),
            Some(Object::Event(e)) => Ok(Some(e.inner.lock().hint.clone())),
            Some(Object::Db(d)) => Ok(Some(d.hint.lock().clone())),
            None => Err(RuntimeError::NoEnt(guid)),
        }
    }

    // ── Shutdown ──

    fn arm_shutdown(&self, code: u32) {
        if !self.shutdown_armed.swap(true, Ordering::AcqRel) {
            self.shutdown_code.store(code, Ordering::Release);
            tracing::info!(location = self.location, code, "shutdown armed");
        }
        self.shutdown_notify.notify_waiters();
    }

    /// `ocrShutdown`: arm every domain's teardown. Subsequent calls are
    /// accepted but inert.
    pub fn broadcast_shutdown(&self, code: u32) {
        self.arm_shutdown(code);
        for loc in 0..self.nb_pds {
            if loc == self.location {
                continue;
            }
            let msg = PolicyMsg {
                src: self.location,
                dst: loc,
                flags: MsgFlags::REQUEST,
                issuer: NULL_GUID,
                return_detail: ReturnCode::Ok,
                payload: Payload::MgtRlNotify {
                    runlevel: crate::runlevel::Runlevel::UserOk,
                    phase: 0,
                    props: crate::runlevel::RlProps::TEAR_DOWN
                        | crate::runlevel::RlProps::REQUEST,
                    error_code: code,
                },
            };
            if let Err(e) = self.transport.post(msg) {
                tracing::debug!(to = loc, err = %e, "shutdown notify dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::ChannelTransport;
    use crate::scheduler::PriorityScheduler;
    use crate::task::TaskState;

    /// A single domain with no workers: creation, registration and
    /// satisfaction run synchronously; readiness shows up in the scheduler.
    fn lone_pd() -> Arc<PolicyDomain> {
        let transport = ChannelTransport::mesh(1).remove(0);
        PolicyDomain::new(
            0,
            1,
            RuntimeConfig::single(1),
            Arc::new(PriorityScheduler::new()),
            transport,
        )
    }

    fn noop_template(pd: &PolicyDomain, depc: u32) -> Guid {
        pd.edt_template_create("noop", 0, depc, |_ctx| NULL_GUID)
            .unwrap()
    }

    #[test]
    fn zero_dep_task_is_scheduled_at_creation() {
        let pd = lone_pd();
        let tpl = noop_template(&pd, 0);
        pd.edt_create(crate::api::EdtCreate::new(tpl)).unwrap();
        assert_eq!(pd.scheduler.pending(), 1);
        let t = pd.scheduler.take(0).unwrap();
        assert_eq!(t.state(), TaskState::AllAcq);
    }

    #[test]
    fn null_source_converts_to_immediate_satisfy() {
        let pd = lone_pd();
        let tpl = noop_template(&pd, 1);
        let (edt, _) = pd.edt_create(crate::api::EdtCreate::new(tpl)).unwrap();
        assert_eq!(pd.scheduler.pending(), 0);
        pd.add_dependence(NULL_GUID, edt, 0).unwrap();
        assert_eq!(pd.scheduler.pending(), 1);
    }

    #[test]
    fn once_event_flushes_registered_task() {
        let pd = lone_pd();
        let evt = pd.event_create(EventKind::Once, true).unwrap();
        let tpl = noop_template(&pd, 1);
        let (edt, _) = pd.edt_create(crate::api::EdtCreate::new(tpl)).unwrap();
        pd.add_dependence(evt, edt, 0).unwrap();
        pd.event_satisfy(evt, NULL_GUID).unwrap();
        assert_eq!(pd.scheduler.pending(), 1);
        // One-shot: the event destroyed itself after the flush.
        assert!(pd.guid_provider.lookup(evt).is_none());
    }

    #[test]
    fn late_registration_on_fired_once_event_is_an_error() {
        let pd = lone_pd();
        let evt = pd.event_create(EventKind::Once, true).unwrap();
        pd.event_satisfy(evt, NULL_GUID).unwrap();
        let tpl = noop_template(&pd, 1);
        let (edt, _) = pd.edt_create(crate::api::EdtCreate::new(tpl)).unwrap();
        assert!(pd.add_dependence(evt, edt, 0).is_err());
    }

    #[test]
    fn slot_double_satisfy_is_fatal() {
        let pd = lone_pd();
        let tpl = noop_template(&pd, 2);
        let (edt, _) = pd.edt_create(crate::api::EdtCreate::new(tpl)).unwrap();
        pd.add_dependence(NULL_GUID, edt, 0).unwrap();
        let err = pd.add_dependence(NULL_GUID, edt, 0);
        assert!(matches!(err, Err(RuntimeError::Perm(_))));
    }

    #[test]
    fn duplicate_block_released_once() {
        let pd = lone_pd();
        let db = pd.create_local_db(&[0u8; 8]).unwrap();
        let tpl = noop_template(&pd, 2);
        let (edt, _) = pd.edt_create(crate::api::EdtCreate::new(tpl)).unwrap();
        // The same block on both slots: the sorted frontier detects the
        // duplicate and flags the later slot.
        pd.add_dependence(db, edt, 0).unwrap();
        pd.add_dependence(db, edt, 1).unwrap();
        let t = pd.scheduler.take(0).expect("task should be ready");
        let inner = t.inner.lock();
        assert_eq!(inner.do_not_release[0].count_ones(), 1);
        assert!(inner.resolved[0].db.is_some());
        assert!(inner.resolved[1].db.is_some());
    }

    #[test]
    fn counted_satisfy_with_no_waiters_still_checks_out() {
        let pd = lone_pd();
        let evt = pd
            .event_create_params(EventKind::Counted, EventParams::Counted { nb_deps: 2 })
            .unwrap();
        // Producer fires before any consumer registered.
        pd.event_satisfy(evt, NULL_GUID).unwrap();
        // An explicit destroy must actually tear the event down instead of
        // parking forever behind the satisfy flush.
        pd.event_destroy(evt).unwrap();
        assert!(pd.guid_provider.lookup(evt).is_none());
    }

    #[test]
    fn counted_registrations_after_satisfy_drain_and_free() {
        let pd = lone_pd();
        let evt = pd
            .event_create_params(EventKind::Counted, EventParams::Counted { nb_deps: 2 })
            .unwrap();
        pd.event_satisfy(evt, NULL_GUID).unwrap();
        let tpl = noop_template(&pd, 1);
        for _ in 0..2 {
            let (edt, _) = pd.edt_create(crate::api::EdtCreate::new(tpl)).unwrap();
            pd.add_dependence(evt, edt, 0).unwrap();
        }
        // Both consumers observed the satisfaction and were scheduled; the
        // last registration freed the event.
        assert_eq!(pd.scheduler.pending(), 2);
        assert!(pd.guid_provider.lookup(evt).is_none());
    }

    #[test]
    fn sticky_registration_after_satisfaction_fires_immediately() {
        let pd = lone_pd();
        let evt = pd.event_create(EventKind::Sticky, true).unwrap();
        pd.event_satisfy(evt, NULL_GUID).unwrap();
        let tpl = noop_template(&pd, 1);
        let (edt, _) = pd.edt_create(crate::api::EdtCreate::new(tpl)).unwrap();
        pd.add_dependence(evt, edt, 0).unwrap();
        assert_eq!(pd.scheduler.pending(), 1);
    }

    #[test]
    fn event_to_event_chain() {
        let pd = lone_pd();
        let head = pd.event_create(EventKind::Once, true).unwrap();
        let tail = pd.event_create(EventKind::Sticky, true).unwrap();
        pd.add_dependence(head, tail, 0).unwrap();
        let payload = pd.create_local_db(&[1u8; 4]).unwrap();
        pd.event_satisfy(head, payload).unwrap();
        assert_eq!(pd.event_get(tail).unwrap(), payload);
    }

    #[test]
    fn labelled_sticky_is_created_once() {
        let pd = lone_pd();
        let a = pd
            .event_create_labelled("shared", EventKind::Sticky, None)
            .unwrap();
        let b = pd
            .event_create_labelled("shared", EventKind::Sticky, None)
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(pd.stats.snapshot().events_created, 1);
    }

    #[test]
    fn hint_round_trip_on_objects() {
        let pd = lone_pd();
        let evt = pd.event_create(EventKind::Sticky, true).unwrap();
        pd.hint_set_value(evt, HintProp::EvtAffinity, 3).unwrap();
        assert_eq!(
            pd.hint_get_value(evt, HintProp::EvtAffinity).unwrap(),
            Some(3)
        );
        assert_eq!(pd.hint_get_value(evt, HintProp::DbEager).unwrap(), None);
    }

    #[test]
    fn unsupported_ops_answer_notsup() {
        let pd = lone_pd();
        let mut msg = PolicyMsg::request(0, 0, Payload::ResiliencyCheckpoint);
        pd.process_message(&mut msg).unwrap();
        assert_eq!(msg.return_detail, ReturnCode::NotSup);
        let mut msg = PolicyMsg::request(0, 0, Payload::SchedTransact);
        pd.process_message(&mut msg).unwrap();
        assert_eq!(msg.return_detail, ReturnCode::NotSup);
    }
}
