// bus.rs - Abstract message bus
//
//! The transport abstraction the control plane runs on.
//!
//! The core never sees sockets: agents attach a [`Mailbox`] under their
//! identity and exchange serialized ACL frames addressed by identity. The
//! bus gives at-least-once, per-sender-ordered delivery at best — frames to
//! unknown identities are dropped, which is why correlation violations are
//! dropped rather than errored upstream.
//!
//! [`InMemoryBus`] is the reference implementation used by the node binary
//! and the integration tests; an XMPP-backed implementation plugs in behind
//! the same trait.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::acl::{AclError, AclMessage};
use crate::correlation::bare;
use crate::observability::record_message_sent;

/// Bus errors
#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to encode frame: {0}")]
    Encode(#[from] AclError),
}

/// One inbound item: the transport-level sender plus the raw frame body
#[derive(Debug, Clone)]
pub struct Delivery {
    pub from: String,
    pub body: String,
}

/// Receive side of an attached identity
pub struct Mailbox {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Mailbox {
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    /// Bounded receive; `None` on deadline or closed bus
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Delivery> {
        tokio::time::timeout(timeout, self.rx.recv()).await.ok().flatten()
    }
}

/// Message bus addressed by agent identity
#[async_trait]
pub trait Bus: Send + Sync {
    /// Register a mailbox for `jid`. Attaching the same identity again
    /// replaces the previous mailbox.
    fn attach(&self, jid: &str) -> Mailbox;

    /// Deliver `body` to `to`. Frames to unknown identities are dropped.
    async fn send(&self, from: &str, to: &str, body: String);
}

/// Send half of an [`Endpoint`]; cheap to clone into tasks
#[derive(Clone)]
pub struct BusSender {
    jid: String,
    bus: Arc<dyn Bus>,
}

impl BusSender {
    pub fn jid(&self) -> &str {
        &self.jid
    }

    /// Serialize and send one frame under this identity.
    pub async fn send(&self, to: &str, frame: &AclMessage) -> Result<(), BusError> {
        let body = frame.to_json()?;
        record_message_sent(frame.performative.as_str(), &frame.protocol);
        self.bus.send(&self.jid, to, body).await;
        Ok(())
    }
}

/// An identity attached to the bus: send half plus its mailbox
pub struct Endpoint {
    sender: BusSender,
    mailbox: Mailbox,
}

impl Endpoint {
    pub fn attach(bus: Arc<dyn Bus>, jid: impl Into<String>) -> Self {
        let jid = jid.into();
        let mailbox = bus.attach(&jid);
        Self {
            sender: BusSender { jid, bus },
            mailbox,
        }
    }

    pub fn jid(&self) -> &str {
        self.sender.jid()
    }

    pub fn sender(&self) -> BusSender {
        self.sender.clone()
    }

    /// Split into independently owned halves
    pub fn split(self) -> (BusSender, Mailbox) {
        (self.sender, self.mailbox)
    }

    pub async fn send(&self, to: &str, frame: &AclMessage) -> Result<(), BusError> {
        self.sender.send(to, frame).await
    }

    pub async fn recv(&mut self) -> Option<Delivery> {
        self.mailbox.recv().await
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Delivery> {
        self.mailbox.recv_timeout(timeout).await
    }
}

/// In-process bus: a mailbox table keyed by bare identity
#[derive(Default)]
pub struct InMemoryBus {
    inboxes: DashMap<String, mpsc::UnboundedSender<Delivery>>,
}

impl InMemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Bus for InMemoryBus {
    fn attach(&self, jid: &str) -> Mailbox {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.insert(bare(jid).to_string(), tx);
        Mailbox { rx }
    }

    async fn send(&self, from: &str, to: &str, body: String) {
        let key = bare(to).to_string();
        match self.inboxes.get(&key) {
            Some(tx) => {
                if tx.send(Delivery { from: from.to_string(), body }).is_err() {
                    debug!(to = %key, "mailbox closed, dropping frame");
                }
            }
            None => debug!(to = %key, "no mailbox attached, dropping frame"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::Performative;
    use serde_json::json;

    #[tokio::test]
    async fn test_attach_send_receive() {
        let bus = InMemoryBus::new();
        let a = Endpoint::attach(bus.clone(), "a@mas");
        let mut b = Endpoint::attach(bus.clone(), "b@mas");

        let frame = AclMessage::new(Performative::Inform, "A", "B", json!({"x": 1}));
        a.send("b@mas", &frame).await.unwrap();

        let got = b.recv_timeout(Duration::from_millis(100)).await.unwrap();
        assert_eq!(got.from, "a@mas");
        let parsed = AclMessage::from_json(&got.body).unwrap();
        assert_eq!(parsed, frame);
    }

    #[tokio::test]
    async fn test_unknown_receiver_dropped() {
        let bus = InMemoryBus::new();
        let a = Endpoint::attach(bus.clone(), "a@mas");
        let frame = AclMessage::new(Performative::Inform, "A", "B", json!({}));
        // no mailbox for ghost@mas; send must not error
        a.send("ghost@mas", &frame).await.unwrap();
    }

    #[tokio::test]
    async fn test_resource_suffix_routes_to_bare() {
        let bus = InMemoryBus::new();
        let a = Endpoint::attach(bus.clone(), "a@mas");
        let mut b = Endpoint::attach(bus.clone(), "b@mas");

        let frame = AclMessage::new(Performative::Inform, "A", "B", json!({}));
        a.send("b@mas/console", &frame).await.unwrap();
        assert!(b.recv_timeout(Duration::from_millis(100)).await.is_some());
    }

    #[tokio::test]
    async fn test_recv_timeout_expires() {
        let bus = InMemoryBus::new();
        let mut a = Endpoint::attach(bus.clone(), "a@mas");
        assert!(a.recv_timeout(Duration::from_millis(20)).await.is_none());
    }
}
