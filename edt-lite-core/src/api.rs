//! The user-facing operation surface. Every call builds the corresponding
//! policy message and runs it through the router, exactly as a remote
//! request would arrive.

use crate::datablock::DbProps;
use crate::errors::{Result, RuntimeError};
use crate::event::{self, EventKind, EventParams};
use crate::guid::{DbAccessMode, Guid, GuidKind, Location, NULL_GUID};
use crate::guid_provider::Object;
use crate::hint::{Hint, HintProp};
use crate::msg::{Payload, PolicyMsg};
use crate::pd::PolicyDomain;
use crate::task::{EdtContext, EdtFunc, EdtProps};
use crate::worker;

/// Arguments to [`PolicyDomain::edt_create`].
pub struct EdtCreate {
    pub template: Guid,
    pub paramv: Vec<u64>,
    /// None copies the template's depc (EDT_PARAM_DEF).
    pub depc: Option<u32>,
    /// Pre-supplied dependences; UNINITIALIZED entries stay open.
    pub depv: Option<Vec<Guid>>,
    pub props: EdtProps,
    pub hint: Option<Hint>,
}

impl EdtCreate {
    pub fn new(template: Guid) -> Self {
        Self {
            template,
            paramv: Vec::new(),
            depc: None,
            depv: None,
            props: EdtProps::OEVT_VALID,
            hint: None,
        }
    }

    pub fn params(mut self, paramv: Vec<u64>) -> Self {
        self.paramv = paramv;
        self
    }

    pub fn depc(mut self, depc: u32) -> Self {
        self.depc = Some(depc);
        self
    }

    pub fn depv(mut self, depv: Vec<Guid>) -> Self {
        self.depc = Some(depv.len() as u32);
        self.depv = Some(depv);
        self
    }

    pub fn props(mut self, props: EdtProps) -> Self {
        self.props = props;
        self
    }

    pub fn hint(mut self, hint: Hint) -> Self {
        self.hint = Some(hint);
        self
    }
}

impl PolicyDomain {
    fn run(&self, payload: Payload) -> Result<PolicyMsg> {
        let mut msg = PolicyMsg::request(self.location(), self.location(), payload);
        msg.issuer = worker::current_task_guid();
        self.process_message(&mut msg)?;
        Ok(msg)
    }

    // ── Templates ──

    pub fn edt_template_create<F>(&self, name: &str, paramc: u32, depc: u32, f: F) -> Result<Guid>
    where
        F: Fn(&mut EdtContext) -> Guid + Send + Sync + 'static,
    {
        let msg = self.run(Payload::EdtTempCreate {
            func: EdtFunc::new(f),
            paramc,
            depc,
            name: name.to_string(),
            guid_out: NULL_GUID,
        })?;
        match msg.payload {
            Payload::EdtTempCreate { guid_out, .. } => Ok(guid_out),
            _ => unreachable!(),
        }
    }

    pub fn edt_template_destroy(&self, template: Guid) -> Result<()> {
        self.run(Payload::EdtTempDestroy { guid: template })?;
        Ok(())
    }

    // ── Tasks ──

    /// Create a task. Returns `(task, output_event)`; the output event is
    /// NULL unless OEVT_VALID was set.
    pub fn edt_create(&self, args: EdtCreate) -> Result<(Guid, Guid)> {
        let parent_latch = worker::current_task()
            .map(|t| t.effective_parent_latch())
            .unwrap_or(NULL_GUID);
        let msg = self.run(Payload::WorkCreate {
            template: args.template,
            paramv: args.paramv,
            depc: args.depc,
            depv: args.depv,
            props: args.props,
            hint: args.hint,
            parent_latch,
            guid_out: NULL_GUID,
            output_event_out: NULL_GUID,
        })?;
        match msg.payload {
            Payload::WorkCreate {
                guid_out,
                output_event_out,
                ..
            } => Ok((guid_out, output_event_out)),
            _ => unreachable!(),
        }
    }

    pub fn edt_destroy(&self, edt: Guid) -> Result<()> {
        self.run(Payload::WorkDestroy { guid: edt })?;
        Ok(())
    }

    // ── Events ──

    pub fn event_create(&self, kind: EventKind, _carry_data: bool) -> Result<Guid> {
        self.event_create_inner(kind, None, None)
    }

    pub fn event_create_params(&self, kind: EventKind, params: EventParams) -> Result<Guid> {
        self.event_create_inner(kind, Some(params), None)
    }

    /// Labelled creation across the process group; racing callers all
    /// receive the canonical guid (E_GUID_EXISTS is benign).
    pub fn event_create_labelled(
        &self,
        label: &str,
        kind: EventKind,
        params: Option<EventParams>,
    ) -> Result<Guid> {
        self.event_create_inner(kind, params, Some(label))
    }

    fn event_create_inner(
        &self,
        kind: EventKind,
        params: Option<EventParams>,
        label: Option<&str>,
    ) -> Result<Guid> {
        let payload = Payload::EvtCreate {
            kind: kind.guid_kind(),
            carry_data: true,
            params,
            label: label.map(str::to_string),
            guid_out: NULL_GUID,
        };
        let mut msg = PolicyMsg::request(self.location(), self.location(), payload);
        msg.issuer = worker::current_task_guid();
        match self.process_message(&mut msg) {
            Ok(()) => {}
            Err(RuntimeError::GuidExists(g)) => return Ok(g),
            Err(e) => return Err(e),
        }
        match msg.payload {
            Payload::EvtCreate { guid_out, .. } => Ok(guid_out),
            _ => unreachable!(),
        }
    }

    pub fn event_satisfy(&self, evt: Guid, data: Guid) -> Result<()> {
        self.event_satisfy_slot(evt, data, 0)
    }

    pub fn event_satisfy_slot(&self, evt: Guid, data: Guid, slot: u32) -> Result<()> {
        self.run(Payload::DepSatisfy {
            dest: evt,
            payload: data,
            slot,
        })?;
        Ok(())
    }

    /// A collective contribution: raw datum bytes for the caller's slot.
    pub fn event_collective_satisfy_slot(&self, evt: Guid, bytes: &[u8], slot: u32) -> Result<()> {
        match self.guid_provider.lookup(evt) {
            Some(Object::Event(e)) if e.kind == EventKind::Collective => {
                event::collective::contribute(self, &e, bytes, slot)
            }
            Some(_) => Err(RuntimeError::Inval("not a collective event")),
            None => Err(RuntimeError::NoEnt(evt)),
        }
    }

    pub fn event_get(&self, evt: Guid) -> Result<Guid> {
        let msg = self.run(Payload::EvtGet {
            guid: evt,
            data_out: NULL_GUID,
        })?;
        if msg.return_detail == crate::errors::ReturnCode::Pending {
            // Remote metadata still in flight; the caller re-enters.
            return Err(RuntimeError::Pending(evt));
        }
        match msg.payload {
            Payload::EvtGet { data_out, .. } => Ok(data_out),
            _ => unreachable!(),
        }
    }

    pub fn event_destroy(&self, evt: Guid) -> Result<()> {
        self.run(Payload::EvtDestroy { guid: evt })?;
        Ok(())
    }

    // ── Dependences ──

    pub fn add_dependence(&self, source: Guid, dest: Guid, slot: u32) -> Result<()> {
        self.add_dependence_mode(source, dest, slot, DbAccessMode::Rw)
    }

    pub fn add_dependence_mode(
        &self,
        source: Guid,
        dest: Guid,
        slot: u32,
        mode: DbAccessMode,
    ) -> Result<()> {
        self.run(Payload::DepAdd {
            source,
            dest,
            slot,
            mode,
        })?;
        Ok(())
    }

    // ── Data-blocks ──

    /// Create a block; inside a task the creator holds it RW until the
    /// epilogue unless NO_ACQUIRE is set.
    pub fn db_create(&self, size: u64, props: DbProps, hint: Option<Hint>) -> Result<Guid> {
        let msg = self.run(Payload::DbCreate {
            size,
            props,
            hint,
            affinity: NULL_GUID,
            guid_out: NULL_GUID,
        })?;
        match msg.payload {
            Payload::DbCreate { guid_out, .. } => Ok(guid_out),
            _ => unreachable!(),
        }
    }

    /// Release the caller's hold. Inside a task this also drops the block
    /// from the end-of-task release list so it is released exactly once.
    pub fn db_release(&self, db: Guid) -> Result<()> {
        let edt = worker::current_task_guid();
        self.run(Payload::DbRelease { db, edt })?;
        if !edt.is_null() {
            self.run(Payload::DepDynRemove { edt, db })?;
        }
        Ok(())
    }

    pub fn db_destroy(&self, db: Guid) -> Result<()> {
        self.run(Payload::DbFree { db })?;
        Ok(())
    }

    // ── Hints ──

    pub fn hint_set_value(&self, guid: Guid, prop: HintProp, value: u64) -> Result<()> {
        let mut hint = Hint::default();
        hint.set(prop, value)?;
        self.run(Payload::HintSet { guid, hint })?;
        Ok(())
    }

    pub fn hint_get_value(&self, guid: Guid, prop: HintProp) -> Result<Option<u64>> {
        let msg = self.run(Payload::HintGet {
            guid,
            hint_out: None,
        })?;
        match msg.payload {
            Payload::HintGet { hint_out, .. } => Ok(hint_out.and_then(|h| h.get(prop))),
            _ => unreachable!(),
        }
    }

    // ── Affinity ──

    pub fn affinity_count(&self) -> u16 {
        self.nb_pds()
    }

    pub fn affinity_at(&self, index: u16) -> Result<Guid> {
        if index >= self.nb_pds() {
            return Err(RuntimeError::Inval("affinity index out of range"));
        }
        Ok(self.affinity_guid(index))
    }

    pub fn affinity_current(&self) -> Guid {
        self.affinity_guid(self.location())
    }

    pub fn affinity_location(&self, affinity: Guid) -> Result<Location> {
        if affinity.kind() != GuidKind::Affinity {
            return Err(RuntimeError::Inval("not an affinity guid"));
        }
        Ok(affinity.location())
    }

    // ── Management ──

    /// `ocrShutdown`: arm teardown everywhere; the code is returned to the
    /// environment once the runtime winds down.
    pub fn shutdown(&self, error_code: u32) {
        if let Err(e) = self.run(Payload::SalTerminate { error_code }) {
            tracing::warn!(err = %e, "shutdown request failed");
        }
    }

    pub fn monitor_progress(&self) -> Result<(u64, u64)> {
        let msg = self.run(Payload::MgtMonitorProgress {
            edts_out: 0,
            msgs_out: 0,
        })?;
        match msg.payload {
            Payload::MgtMonitorProgress { edts_out, msgs_out } => Ok((edts_out, msgs_out)),
            _ => unreachable!(),
        }
    }

    pub fn sal_print(&self, text: &str) {
        let _ = self.run(Payload::SalPrint {
            text: text.to_string(),
        });
    }
}
