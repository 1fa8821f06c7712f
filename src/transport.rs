use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{Result, SipError, SipMessage, SipMethod, SipUri};

/// Non-blocking message transport polled by the core on every tick.
pub trait Transport: Send {
    /// Address peers use to reach this transport.
    fn local_uri(&self) -> &SipUri;

    fn send(&mut self, message: &SipMessage, target: &SipUri) -> Result<()>;

    /// Next received message, if any. Never blocks.
    fn recv(&mut self) -> Option<SipMessage>;

    fn send_keep_alive(&mut self, target: &SipUri) -> Result<()>;
}

#[derive(Debug, Default)]
struct Node {
    inbox: VecDeque<SipMessage>,
    link_down: bool,
    requests_sent: HashMap<SipMethod, usize>,
    responses_sent: usize,
    keep_alives_sent: usize,
}

#[derive(Debug, Default)]
struct Network {
    nodes: HashMap<String, Node>,
}

impl Network {
    // Exact address of record first, then whoever serves the domain
    fn route(&self, target: &SipUri) -> Option<String> {
        let aor = target.address_of_record();
        if self.nodes.contains_key(&aor) {
            return Some(aor);
        }
        self.nodes
            .contains_key(&target.host)
            .then(|| target.host.clone())
    }

    fn sender(&mut self, key: &str) -> Result<&mut Node> {
        let node = self
            .nodes
            .get_mut(key)
            .ok_or_else(|| SipError::Transport(format!("{} is detached", key)))?;
        if node.link_down {
            return Err(SipError::Transport(format!("link down at {}", key)));
        }
        Ok(node)
    }
}

/// In-memory network connecting cores and a registrar in one process.
/// Nodes are addressed by `user@host`; a node attached with a bare host
/// also receives traffic for unknown users of that domain.
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<Network>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, local: SipUri) -> LoopbackTransport {
        let key = local.address_of_record();
        self.inner.lock().nodes.entry(key.clone()).or_default();
        debug!(node = %key, "attached to loopback network");
        LoopbackTransport {
            network: self.clone(),
            local,
            key,
        }
    }

    /// A downed link fails every send from the node and drops traffic to it.
    pub fn set_link_up(&self, node: &SipUri, up: bool) {
        if let Some(n) = self.inner.lock().nodes.get_mut(&node.address_of_record()) {
            n.link_down = !up;
        }
    }

    pub fn requests_sent(&self, node: &SipUri, method: SipMethod) -> usize {
        self.with_node(node, |n| n.requests_sent.get(&method).copied().unwrap_or(0))
    }

    pub fn responses_sent(&self, node: &SipUri) -> usize {
        self.with_node(node, |n| n.responses_sent)
    }

    pub fn keep_alives_sent(&self, node: &SipUri) -> usize {
        self.with_node(node, |n| n.keep_alives_sent)
    }

    pub fn pending(&self, node: &SipUri) -> usize {
        self.with_node(node, |n| n.inbox.len())
    }

    fn with_node<T: Default>(&self, node: &SipUri, f: impl FnOnce(&Node) -> T) -> T {
        self.inner
            .lock()
            .nodes
            .get(&node.address_of_record())
            .map(f)
            .unwrap_or_default()
    }
}

pub struct LoopbackTransport {
    network: LoopbackNetwork,
    local: SipUri,
    key: String,
}

impl Transport for LoopbackTransport {
    fn local_uri(&self) -> &SipUri {
        &self.local
    }

    fn send(&mut self, message: &SipMessage, target: &SipUri) -> Result<()> {
        let mut network = self.network.inner.lock();

        let sender = network.sender(&self.key)?;
        match message.method() {
            Some(method) => *sender.requests_sent.entry(method).or_default() += 1,
            None => sender.responses_sent += 1,
        }

        let route = network
            .route(target)
            .ok_or_else(|| SipError::Transport(format!("no route to {}", target)))?;

        debug!(from = %self.key, to = %route, "{}", message);
        if let Some(receiver) = network.nodes.get_mut(&route) {
            if receiver.link_down {
                trace!(to = %route, "dropped at downed link");
                return Ok(());
            }
            let mut delivered = message.clone();
            delivered.source = Some(self.local.clone());
            receiver.inbox.push_back(delivered);
        }
        Ok(())
    }

    fn recv(&mut self) -> Option<SipMessage> {
        self.network
            .inner
            .lock()
            .nodes
            .get_mut(&self.key)
            .and_then(|node| node.inbox.pop_front())
    }

    fn send_keep_alive(&mut self, target: &SipUri) -> Result<()> {
        let mut network = self.network.inner.lock();
        if network.route(target).is_none() {
            return Err(SipError::Transport(format!("no route to {}", target)));
        }
        network.sender(&self.key)?.keep_alives_sent += 1;
        trace!(from = %self.key, to = %target, "keep-alive");
        Ok(())
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.network.inner.lock().nodes.remove(&self.key);
    }
}
