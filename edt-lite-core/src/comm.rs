use crate::errors::{Result, RuntimeError};
use crate::guid::Location;
use crate::msg::PolicyMsg;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// The wire seam between policy domains. Messages are opaque and
/// self-describing; what a deployment does to frame them between OS
/// processes is not this crate's concern.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fire-and-forget enqueue toward `msg.dst`. Callable from synchronous
    /// context (satisfy cascades run under object locks).
    fn post(&self, msg: PolicyMsg) -> Result<()>;
    /// Next inbound message for the owning domain; None once the mesh is
    /// torn down.
    async fn next(&self) -> Option<PolicyMsg>;
    /// Stop routing: drop this domain's senders so peers' pumps can drain
    /// and exit.
    fn close(&self);
}

/// In-process mesh: one unbounded channel per domain, every domain holds a
/// sender to every other.
pub struct ChannelTransport {
    me: Location,
    senders: spin::Mutex<Vec<Option<UnboundedSender<PolicyMsg>>>>,
    inbound: tokio::sync::Mutex<UnboundedReceiver<PolicyMsg>>,
}

impl ChannelTransport {
    /// Build the full mesh for `n` domains.
    pub fn mesh(n: u16) -> Vec<Arc<ChannelTransport>> {
        let mut senders = Vec::with_capacity(n as usize);
        let mut receivers = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let (tx, rx) = unbounded_channel();
            senders.push(Some(tx));
            receivers.push(rx);
        }
        receivers
            .into_iter()
            .enumerate()
            .map(|(i, rx)| {
                Arc::new(ChannelTransport {
                    me: i as Location,
                    senders: spin::Mutex::new(senders.clone()),
                    inbound: tokio::sync::Mutex::new(rx),
                })
            })
            .collect()
    }

    pub fn location(&self) -> Location {
        self.me
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn post(&self, msg: PolicyMsg) -> Result<()> {
        let dst = msg.dst as usize;
        let senders = self.senders.lock();
        match senders.get(dst).and_then(|s| s.as_ref()) {
            Some(tx) => tx
                .send(msg)
                .map_err(|_| RuntimeError::Fault("peer domain is gone")),
            None => Err(RuntimeError::NoEnt(crate::guid::NULL_GUID)),
        }
    }

    async fn next(&self) -> Option<PolicyMsg> {
        self.inbound.lock().await.recv().await
    }

    fn close(&self) {
        self.senders.lock().clear();
    }
}
