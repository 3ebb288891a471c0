//! In-process group transport
//!
//! Each joined node owns an unbounded FIFO queue drained by one tokio task,
//! so a node handles its messages one at a time and in arrival order, while
//! different nodes run concurrently. A zap is recorded in the network's zap
//! log and then delivered to the target's zap processor; links are not
//! severed automatically, that is up to [`LocalNetwork::disconnect`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::messages::{GroupMessage, MessageKind, ZapRequestMessage};
use super::{
    GroupManager, GroupMessageListener, TransportError, TransportResult, ZapNodeRequestProcessor,
};
use crate::model::{NodeId, ZapReason};
use crate::observability::{log_event, Event};

/// One entry of the zap log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZapRecord {
    pub from: NodeId,
    pub to: NodeId,
    pub reason: ZapReason,
    pub message: String,
}

struct Envelope {
    from: NodeId,
    message: GroupMessage,
    reply: Option<oneshot::Sender<Option<GroupMessage>>>,
}

struct Endpoint {
    id: NodeId,
    tx: mpsc::UnboundedSender<Envelope>,
    listeners: RwLock<HashMap<MessageKind, Vec<Arc<dyn GroupMessageListener>>>>,
    zap_processor: RwLock<Option<Arc<dyn ZapNodeRequestProcessor>>>,
}

impl Endpoint {
    fn dispatch(&self, from: NodeId, message: GroupMessage) -> Option<GroupMessage> {
        if let GroupMessage::ZapRequest(zap) = message {
            let processor = self.zap_processor.read().clone();
            match processor {
                Some(p) => p.incoming_zap_node_request(from, zap.reason, &zap.message, &zap.weights),
                None => warn!(node = %self.id, from = %from, reason = %zap.reason, "zapped with no zap processor installed"),
            }
            return None;
        }

        let kind = message.kind();
        let listeners = self
            .listeners
            .read()
            .get(&kind)
            .cloned()
            .unwrap_or_default();
        if listeners.is_empty() {
            debug!(node = %self.id, ?kind, "no listener registered, dropping message");
            return None;
        }
        let mut reply = None;
        for listener in listeners {
            let r = listener.message_received(from, message.clone());
            if reply.is_none() {
                reply = r;
            }
        }
        reply
    }
}

/// An in-process network of stripe members.
pub struct LocalNetwork {
    endpoints: RwLock<HashMap<NodeId, Arc<Endpoint>>>,
    zaps: Mutex<Vec<ZapRecord>>,
    pending: Arc<AtomicUsize>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: RwLock::new(HashMap::new()),
            zaps: Mutex::new(Vec::new()),
            pending: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Connects `node` and spawns its dispatch task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn join(self: &Arc<Self>, node: NodeId) -> Arc<LocalGroupManager> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let endpoint = Arc::new(Endpoint {
            id: node,
            tx,
            listeners: RwLock::new(HashMap::new()),
            zap_processor: RwLock::new(None),
        });

        let weak = Arc::downgrade(&endpoint);
        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if let Some(endpoint) = weak.upgrade() {
                    let reply = endpoint.dispatch(envelope.from, envelope.message);
                    if let Some(tx) = envelope.reply {
                        let _ = tx.send(reply);
                    }
                }
                pending.fetch_sub(1, Ordering::SeqCst);
            }
        });

        self.endpoints.write().insert(node, endpoint);
        Arc::new(LocalGroupManager {
            local: node,
            network: Arc::clone(self),
        })
    }

    /// Removes `node` from the network. Queued messages to it are dropped
    /// and waiting senders see `NodeUnreachable`.
    pub fn disconnect(&self, node: NodeId) {
        self.endpoints.write().remove(&node);
    }

    pub fn is_connected(&self, node: NodeId) -> bool {
        self.endpoints.read().contains_key(&node)
    }

    /// Every zap issued so far, in issue order.
    pub fn zaps(&self) -> Vec<ZapRecord> {
        self.zaps.lock().clone()
    }

    /// Zaps whose target is `node`.
    pub fn zaps_of(&self, node: NodeId) -> Vec<ZapRecord> {
        self.zaps
            .lock()
            .iter()
            .filter(|z| z.to == node)
            .cloned()
            .collect()
    }

    /// Resolves once every queued message has been handled, including the
    /// messages those handlers sent in turn.
    pub async fn settle(&self) {
        while self.pending.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    fn endpoint(&self, node: NodeId) -> Option<Arc<Endpoint>> {
        self.endpoints.read().get(&node).cloned()
    }

    fn peers_of(&self, node: NodeId) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = self
            .endpoints
            .read()
            .keys()
            .filter(|id| **id != node)
            .copied()
            .collect();
        peers.sort();
        peers
    }

    fn deliver(
        &self,
        from: NodeId,
        to: NodeId,
        message: GroupMessage,
        reply: Option<oneshot::Sender<Option<GroupMessage>>>,
    ) -> TransportResult<()> {
        if !self.is_connected(from) {
            return Err(TransportError::Disconnected);
        }
        let endpoint = self.endpoint(to).ok_or(TransportError::NodeUnreachable(to))?;
        self.pending.fetch_add(1, Ordering::SeqCst);
        let envelope = Envelope {
            from,
            message,
            reply,
        };
        if endpoint.tx.send(envelope).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(TransportError::NodeUnreachable(to));
        }
        Ok(())
    }
}

/// A node's handle on a [`LocalNetwork`].
pub struct LocalGroupManager {
    local: NodeId,
    network: Arc<LocalNetwork>,
}

impl LocalGroupManager {
    pub fn network(&self) -> &Arc<LocalNetwork> {
        &self.network
    }
}

#[async_trait]
impl GroupManager for LocalGroupManager {
    fn local_node_id(&self) -> NodeId {
        self.local
    }

    fn peers(&self) -> Vec<NodeId> {
        self.network.peers_of(self.local)
    }

    fn register_for_messages(&self, kind: MessageKind, listener: Arc<dyn GroupMessageListener>) {
        if let Some(endpoint) = self.network.endpoint(self.local) {
            endpoint
                .listeners
                .write()
                .entry(kind)
                .or_default()
                .push(listener);
        }
    }

    fn set_zap_node_request_processor(&self, processor: Arc<dyn ZapNodeRequestProcessor>) {
        if let Some(endpoint) = self.network.endpoint(self.local) {
            *endpoint.zap_processor.write() = Some(processor);
        }
    }

    fn send_to(&self, node: NodeId, message: GroupMessage) -> TransportResult<()> {
        self.network.deliver(self.local, node, message, None)
    }

    /// Counted as pending until `task` finishes, so [`LocalNetwork::settle`]
    /// also waits for background work and whatever it sends.
    fn spawn_task(&self, task: BoxFuture<'static, ()>) -> TransportResult<()> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;
        let pending = Arc::clone(&self.network.pending);
        pending.fetch_add(1, Ordering::SeqCst);
        runtime.spawn(async move {
            task.await;
            pending.fetch_sub(1, Ordering::SeqCst);
        });
        Ok(())
    }

    async fn send_to_and_wait(
        &self,
        node: NodeId,
        message: GroupMessage,
    ) -> TransportResult<GroupMessage> {
        let (tx, rx) = oneshot::channel();
        self.network.deliver(self.local, node, message, Some(tx))?;
        match rx.await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(TransportError::NoResponse(node)),
            Err(_) => Err(TransportError::NodeUnreachable(node)),
        }
    }

    fn zap_node(&self, node: NodeId, reason: ZapReason, message: &str) {
        let processor = self
            .network
            .endpoint(self.local)
            .and_then(|e| e.zap_processor.read().clone());
        if let Some(p) = &processor {
            if !p.accept_outgoing_zap_node_request(node, reason, message) {
                warn!(node = %node, reason = %reason, "outgoing zap refused by zap processor");
                return;
            }
        }
        let weights = processor
            .map(|p| p.current_node_weights())
            .unwrap_or_default();

        warn!(from = %self.local, node = %node, reason = %reason, detail = message, "zapping node");
        log_event(
            Event::NodeZapped,
            &[("node", node.to_string().as_str()), ("reason", reason.as_str())],
        );
        self.network.zaps.lock().push(ZapRecord {
            from: self.local,
            to: node,
            reason,
            message: message.to_string(),
        });

        let zap = GroupMessage::ZapRequest(ZapRequestMessage {
            reason,
            message: message.to_string(),
            weights,
        });
        if let Err(e) = self.network.deliver(self.local, node, zap, None) {
            debug!(node = %node, error = %e, "zap target already gone");
        }
    }
}
