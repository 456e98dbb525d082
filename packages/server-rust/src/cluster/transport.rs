//! In-process exchange transport.
//!
//! `InMemoryNetwork` connects every registered node through unbounded inboxes.
//! Messages go through the same `MsgPack` encoding as a real wire, and the
//! network can isolate nodes or duplicate every delivery, which is how tests
//! and the simulator exercise the protocol's tolerance to loss and repeats.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc;
use tracing::trace;

use meridian_core::NodeId;

use super::messages::{ExchangeMessage, InboundExchangeMessage};
use super::traits::ExchangeTransport;

#[derive(Debug, Default)]
struct NetworkInner {
    inboxes: DashMap<NodeId, mpsc::UnboundedSender<InboundExchangeMessage>>,
    isolated: DashSet<NodeId>,
    duplicate_delivery: AtomicBool,
}

/// A shared in-process network. Clones refer to the same network.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl InMemoryNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches `node_id`, replacing any previous attachment.
    ///
    /// Returns the node's transport and the inbox its coordinator reads.
    #[must_use]
    pub fn register(
        &self,
        node_id: NodeId,
    ) -> (InMemoryTransport, mpsc::UnboundedReceiver<InboundExchangeMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.inboxes.insert(node_id, tx);
        self.inner.isolated.remove(&node_id);
        let transport = InMemoryTransport {
            node_id,
            network: self.clone(),
        };
        (transport, rx)
    }

    /// Detaches `node_id`; messages to it fail from now on.
    pub fn unregister(&self, node_id: &NodeId) {
        self.inner.inboxes.remove(node_id);
    }

    /// Silently drops all traffic to and from `node_id`.
    pub fn isolate(&self, node_id: NodeId) {
        self.inner.isolated.insert(node_id);
    }

    pub fn heal(&self, node_id: &NodeId) {
        self.inner.isolated.remove(node_id);
    }

    #[must_use]
    pub fn is_isolated(&self, node_id: &NodeId) -> bool {
        self.inner.isolated.contains(node_id)
    }

    /// Delivers every message twice while enabled.
    pub fn set_duplicate_delivery(&self, enabled: bool) {
        self.inner
            .duplicate_delivery
            .store(enabled, Ordering::Relaxed);
    }

    fn deliver(&self, from: NodeId, to: NodeId, message: &ExchangeMessage) -> anyhow::Result<()> {
        if self.is_isolated(&from) || self.is_isolated(&to) {
            trace!(%from, %to, kind = message.kind(), "dropped by isolation");
            return Ok(());
        }
        let inbox = self
            .inner
            .inboxes
            .get(&to)
            .map(|entry| entry.value().clone())
            .with_context(|| format!("unknown peer {to}"))?;

        let bytes = message.to_bytes().context("encoding exchange message")?;
        let copies = if self.inner.duplicate_delivery.load(Ordering::Relaxed) {
            2
        } else {
            1
        };
        for _ in 0..copies {
            let decoded = ExchangeMessage::from_bytes(&bytes).context("decoding exchange message")?;
            inbox
                .send(InboundExchangeMessage {
                    sender: from,
                    message: decoded,
                })
                .map_err(|_| anyhow::anyhow!("peer {to} inbox closed"))?;
        }
        Ok(())
    }
}

/// One node's handle onto an [`InMemoryNetwork`].
#[derive(Debug, Clone)]
pub struct InMemoryTransport {
    node_id: NodeId,
    network: InMemoryNetwork,
}

#[async_trait]
impl ExchangeTransport for InMemoryTransport {
    fn local_node_id(&self) -> NodeId {
        self.node_id
    }

    async fn send(&self, to: NodeId, message: ExchangeMessage) -> anyhow::Result<()> {
        metrics::counter!("meridian_exchange_messages_sent_total", "kind" => message.kind())
            .increment(1);
        self.network.deliver(self.node_id, to, &message)
    }
}

#[cfg(test)]
mod tests {
    use meridian_core::{EventKind, ExchangeId, PartitionSnapshot, TopologyVersion};
    use uuid::Uuid;

    use super::*;
    use crate::cluster::messages::ExchangeContributionPayload;

    fn node(n: u128) -> NodeId {
        Uuid::from_u128(n)
    }

    fn contribution(from: u128) -> ExchangeMessage {
        let version = TopologyVersion::new(1, 0);
        ExchangeMessage::ExchangeContribution(ExchangeContributionPayload {
            exchange_id: ExchangeId::new(node(1), EventKind::Joined, version).unwrap(),
            node_id: node(from),
            snapshot: PartitionSnapshot::empty(node(from), version),
        })
    }

    #[tokio::test]
    async fn delivers_to_registered_peer() {
        let network = InMemoryNetwork::new();
        let (a, _a_rx) = network.register(node(1));
        let (_b, mut b_rx) = network.register(node(2));

        a.send(node(2), contribution(1)).await.unwrap();
        let inbound = b_rx.recv().await.unwrap();
        assert_eq!(inbound.sender, node(1));
        assert_eq!(inbound.message, contribution(1));
        assert_eq!(a.local_node_id(), node(1));
    }

    #[tokio::test]
    async fn unknown_peer_is_an_error() {
        let network = InMemoryNetwork::new();
        let (a, _rx) = network.register(node(1));
        assert!(a.send(node(9), contribution(1)).await.is_err());

        let (_b, _b_rx) = network.register(node(2));
        network.unregister(&node(2));
        assert!(a.send(node(2), contribution(1)).await.is_err());
    }

    #[tokio::test]
    async fn isolation_drops_traffic_both_ways() {
        let network = InMemoryNetwork::new();
        let (a, mut a_rx) = network.register(node(1));
        let (b, mut b_rx) = network.register(node(2));

        network.isolate(node(2));
        a.send(node(2), contribution(1)).await.unwrap();
        b.send(node(1), contribution(2)).await.unwrap();
        assert!(a_rx.try_recv().is_err());
        assert!(b_rx.try_recv().is_err());

        network.heal(&node(2));
        a.send(node(2), contribution(1)).await.unwrap();
        assert!(b_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn duplicate_delivery_sends_twice() {
        let network = InMemoryNetwork::new();
        let (a, _a_rx) = network.register(node(1));
        let (_b, mut b_rx) = network.register(node(2));

        network.set_duplicate_delivery(true);
        a.send(node(2), contribution(1)).await.unwrap();
        assert!(b_rx.try_recv().is_ok());
        assert!(b_rx.try_recv().is_ok());
        assert!(b_rx.try_recv().is_err());
    }
}
