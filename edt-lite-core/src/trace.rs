use crate::guid::{Guid, Location};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::{SystemTime, UNIX_EPOCH};

/// Object family a trace record is about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TraceType {
    Task = 0,
    Event = 1,
    Db = 2,
    Message = 3,
    Worker = 4,
    Scheduler = 5,
    Allocator = 6,
}

/// What happened to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TraceAction {
    Create = 0,
    Destroy = 1,
    Runnable = 2,
    Satisfy = 3,
    Acquire = 4,
    Release = 5,
    ExecuteBegin = 6,
    ExecuteEnd = 7,
    MsgSend = 8,
    MsgReceive = 9,
}

fn type_from(v: u8) -> Option<TraceType> {
    use TraceType::*;
    Some(match v {
        0 => Task,
        1 => Event,
        2 => Db,
        3 => Message,
        4 => Worker,
        5 => Scheduler,
        6 => Allocator,
        _ => return None,
    })
}

fn action_from(v: u8) -> Option<TraceAction> {
    use TraceAction::*;
    Some(match v {
        0 => Create,
        1 => Destroy,
        2 => Runnable,
        3 => Satisfy,
        4 => Acquire,
        5 => Release,
        6 => ExecuteBegin,
        7 => ExecuteEnd,
        8 => MsgSend,
        9 => MsgReceive,
        _ => return None,
    })
}

/// One fixed-size record of the binary trace stream. Timestamps are
/// domain-local wall-clock nanoseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraceRecord {
    pub ttype: TraceType,
    pub action: TraceAction,
    pub time_ns: u64,
    pub worker: u32,
    pub location: Location,
    /// Creating/executing task, NULL outside task context.
    pub parent: Guid,
    /// The object the record is about.
    pub subject: Guid,
}

/// Encoded size of one record on the stream.
pub const RECORD_SIZE: usize = 1 + 1 + 8 + 4 + 2 + 8 + 8;

impl TraceRecord {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.ttype as u8);
        buf.put_u8(self.action as u8);
        buf.put_u64_le(self.time_ns);
        buf.put_u32_le(self.worker);
        buf.put_u16_le(self.location);
        buf.put_u64_le(self.parent.0);
        buf.put_u64_le(self.subject.0);
    }

    pub fn decode(buf: &mut Bytes) -> Option<TraceRecord> {
        if buf.remaining() < RECORD_SIZE {
            return None;
        }
        let ttype = type_from(buf.get_u8())?;
        let action = action_from(buf.get_u8())?;
        Some(TraceRecord {
            ttype,
            action,
            time_ns: buf.get_u64_le(),
            worker: buf.get_u32_le(),
            location: buf.get_u16_le(),
            parent: Guid(buf.get_u64_le()),
            subject: Guid(buf.get_u64_le()),
        })
    }
}

pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Per-domain capture buffer. Disabled buffers drop records at the call
/// site; a system worker (or the shutdown path) drains them.
pub struct TraceBuffer {
    enabled: bool,
    location: Location,
    records: spin::Mutex<Vec<TraceRecord>>,
}

impl TraceBuffer {
    pub fn new(location: Location, enabled: bool) -> Self {
        Self {
            enabled,
            location,
            records: spin::Mutex::new(Vec::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn emit(
        &self,
        ttype: TraceType,
        action: TraceAction,
        worker: u32,
        parent: Guid,
        subject: Guid,
    ) {
        if !self.enabled {
            return;
        }
        self.records.lock().push(TraceRecord {
            ttype,
            action,
            time_ns: now_ns(),
            worker,
            location: self.location,
            parent,
            subject,
        });
    }

    pub fn drain(&self) -> Vec<TraceRecord> {
        std::mem::take(&mut *self.records.lock())
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Drain into the wire form.
    pub fn encode_stream(&self) -> Bytes {
        let records = self.drain();
        let mut buf = BytesMut::with_capacity(records.len() * RECORD_SIZE);
        for r in &records {
            r.encode(&mut buf);
        }
        buf.freeze()
    }
}

/// Iterate a binary stream back into records (malformed tails are dropped).
pub fn decode_stream(mut bytes: Bytes) -> Vec<TraceRecord> {
    let mut out = Vec::with_capacity(bytes.remaining() / RECORD_SIZE);
    while let Some(r) = TraceRecord::decode(&mut bytes) {
        out.push(r);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guid::{GuidKind, NULL_GUID};

    #[test]
    fn record_round_trip() {
        let r = TraceRecord {
            ttype: TraceType::Event,
            action: TraceAction::Satisfy,
            time_ns: 123_456_789,
            worker: 2,
            location: 5,
            parent: Guid::encode(GuidKind::Edt, 5, 77),
            subject: Guid::encode(GuidKind::EventSticky, 5, 78),
        };
        let mut buf = BytesMut::new();
        r.encode(&mut buf);
        assert_eq!(buf.len(), RECORD_SIZE);
        let back = TraceRecord::decode(&mut buf.freeze()).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn stream_round_trip() {
        let buf = TraceBuffer::new(1, true);
        for i in 0..5 {
            buf.emit(
                TraceType::Task,
                TraceAction::Create,
                i,
                NULL_GUID,
                Guid::encode(GuidKind::Edt, 1, u64::from(i)),
            );
        }
        let stream = buf.encode_stream();
        let records = decode_stream(stream);
        assert_eq!(records.len(), 5);
        assert_eq!(records[3].worker, 3);
        assert!(buf.is_empty());
    }

    #[test]
    fn disabled_buffer_drops() {
        let buf = TraceBuffer::new(0, false);
        buf.emit(
            TraceType::Worker,
            TraceAction::Create,
            0,
            NULL_GUID,
            NULL_GUID,
        );
        assert!(buf.is_empty());
    }
}
