use crate::errors::{Result, RuntimeError};
use crate::event::{self, EventSnapshot};
use crate::guid::Guid;
use crate::guid_provider::Object;
use crate::msg::{MdDir, MdMode, MdPayload, MsgFlags, Payload, PolicyMsg};
use crate::pd::PolicyDomain;
use crate::task;

/// METADATA_COMM dispatch: replication (clone), peer registration,
/// satisfaction and deletion pushes, the reduction-tree legs, and EDT moves.
pub fn handle(pd: &PolicyDomain, msg: &mut PolicyMsg) -> Result<()> {
    let src = msg.src;
    let Payload::MetadataComm {
        target,
        direction,
        mode,
        payload,
    } = &mut msg.payload
    else {
        unreachable!()
    };
    let target = *target;
    match (*direction, *mode) {
        // A remote domain asks for this object's metadata.
        (MdDir::Pull, MdMode::Clone) => {
            let reply = serve_clone(pd, target)?;
            let resp = PolicyMsg {
                src: pd.location(),
                dst: src,
                flags: MsgFlags::RESPONSE,
                issuer: crate::guid::NULL_GUID,
                return_detail: crate::errors::ReturnCode::Ok,
                payload: Payload::MetadataComm {
                    target,
                    direction: MdDir::Push,
                    mode: MdMode::Clone,
                    payload: reply,
                },
            };
            pd.transport.post(resp)
        }

        // The clone lands: install the copy and replay parked operations.
        (MdDir::Push, MdMode::Clone) => {
            install_clone(pd, target, std::mem::replace(payload, MdPayload::None), src)
        }

        // A peer announces its copy of a persistent event.
        (MdDir::Push, MdMode::Register) => {
            let evt = local_event(pd, target)?;
            event::md_register_peer(pd, &evt, src)
        }

        // Satisfaction travelling the peer list.
        (MdDir::Push, MdMode::Satisfy) => {
            let data = match payload {
                MdPayload::Contribution { bytes, .. } if bytes.len() == 8 => {
                    Guid(u64::from_le_bytes(bytes[..8].try_into().unwrap()))
                }
                _ => return Err(RuntimeError::Inval("malformed M_SAT payload")),
            };
            let evt = local_event(pd, target)?;
            event::md_satisfy(pd, &evt, data, src)
        }

        // Cascading destruction.
        (MdDir::Push, MdMode::Delete) => match pd.guid_provider.lookup(target) {
            Some(Object::Event(evt)) => event::md_delete(pd, &evt, src),
            Some(Object::Task(_)) | Some(Object::Template(_)) | Some(Object::Db(_)) => {
                pd.release_guid(target);
                Ok(())
            }
            // Already gone; deletion is idempotent across the peer list.
            None => Ok(()),
        },

        // Reduction tree, aggregation leg.
        (MdDir::Push, MdMode::Up) => {
            let (gph, bytes) = contribution(payload)?;
            let evt = local_event(pd, target)?;
            event::collective::on_up(pd, &evt, gph, &bytes)
        }

        // Reduction tree, broadcast leg.
        (MdDir::Push, MdMode::Down) => {
            let (gph, bytes) = contribution(payload)?;
            let evt = local_event(pd, target)?;
            event::collective::on_down(pd, &evt, gph, &bytes)
        }

        // A task arrives for execution here; the origin keeps a ghost.
        (MdDir::Push, MdMode::Move) => {
            let snap = match std::mem::replace(payload, MdPayload::None) {
                MdPayload::TaskMove(s) => s,
                _ => return Err(RuntimeError::Inval("malformed M_MOVE payload")),
            };
            let t = task::from_snapshot(snap);
            pd.guid_provider.register(target, Object::Task(t.clone()));
            pd.stats.edt_created();
            task::all_depv_satisfied(pd, &t)
        }

        (MdDir::Pull, _) => Err(RuntimeError::NotSup("only clones are pulled")),
    }
}

fn contribution(payload: &mut MdPayload) -> Result<(u32, Vec<u8>)> {
    match std::mem::replace(payload, MdPayload::None) {
        MdPayload::Contribution { gph, bytes } => Ok((gph, bytes)),
        _ => Err(RuntimeError::Inval("expected a contribution payload")),
    }
}

fn local_event(pd: &PolicyDomain, guid: Guid) -> Result<std::sync::Arc<crate::event::Event>> {
    match pd.guid_provider.lookup(guid) {
        Some(Object::Event(evt)) => Ok(evt),
        _ => Err(RuntimeError::NoEnt(guid)),
    }
}

/// Build the clone reply for a locally-owned object. Event metadata is
/// serialized (and must deserialize back to an identical snapshot);
/// process-wide handles travel as shared pointers.
fn serve_clone(pd: &PolicyDomain, target: Guid) -> Result<MdPayload> {
    match pd.guid_provider.lookup(target) {
        Some(Object::Event(evt)) => {
            let snap = evt.snapshot();
            let json = serde_json::to_string(&snap)
                .map_err(|_| RuntimeError::Fault("snapshot serialization"))?;
            Ok(MdPayload::EventSnapshot(json))
        }
        Some(Object::Template(tpl)) => Ok(MdPayload::TemplateHandle(tpl)),
        Some(Object::Db(db)) => Ok(MdPayload::DbHandle(db)),
        Some(Object::Task(_)) => Err(RuntimeError::NotSup("tasks move, they do not clone")),
        None => Err(RuntimeError::NoEnt(target)),
    }
}

/// Install a clone and drain the proxy: every message that parked while
/// the pull was in flight re-enters the router in arrival order.
fn install_clone(pd: &PolicyDomain, target: Guid, payload: MdPayload, master: crate::guid::Location) -> Result<()> {
    let obj = match payload {
        MdPayload::EventSnapshot(json) => {
            let snap: EventSnapshot = serde_json::from_str(&json)
                .map_err(|_| RuntimeError::Fault("snapshot deserialization"))?;
            let evt = snap.materialise(master)?;
            let is_persistent = evt.kind.is_persistent();
            let obj = Object::Event(evt);
            // Announce the copy so the master can later push M_SAT/M_DEL.
            if is_persistent {
                pd.md_push(target, master, MdMode::Register, MdPayload::None);
            }
            obj
        }
        MdPayload::TemplateHandle(tpl) => Object::Template(tpl),
        MdPayload::DbHandle(db) => Object::Db(db),
        _ => return Err(RuntimeError::Inval("malformed clone payload")),
    };
    let parked = pd.guid_provider.register(target, obj);
    for mut m in parked {
        if let Err(e) = pd.process_message(&mut m) {
            tracing::warn!(op = m.payload.op_name(), err = %e, "replay after clone failed");
        }
    }
    Ok(())
}
