use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{ConnectionKey, PoolError};
use crate::topic;

/// A message received from the endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Value,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Value,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(InboundMessage),
    ConnectionLost(String),
}

/// One client connection to an external endpoint. Inbound traffic and
/// connection loss are reported on the channel handed to `connect`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, events: mpsc::UnboundedSender<TransportEvent>) -> Result<(), PoolError>;
    async fn disconnect(&self);
    async fn publish(&self, msg: &OutboundMessage) -> Result<(), PoolError>;
    async fn subscribe(&self, pattern: &str, qos: u8) -> Result<(), PoolError>;
    async fn unsubscribe(&self, pattern: &str) -> Result<(), PoolError>;
}

/// Builds transports for one URL scheme (`memory`, `mqtt`, ...).
pub trait TransportFactory: Send + Sync {
    fn scheme(&self) -> &str;
    fn create(&self, key: &ConnectionKey) -> Result<Arc<dyn Transport>, PoolError>;
}

/// How many accepted messages a [`MemoryBroker`] remembers.
pub const PUBLISHED_HISTORY: usize = 1000;

struct BrokerClient {
    events: mpsc::UnboundedSender<TransportEvent>,
    patterns: Vec<String>,
}

#[derive(Default)]
struct BrokerState {
    offline: bool,
    next_id: u64,
    clients: HashMap<u64, BrokerClient>,
    published: VecDeque<OutboundMessage>,
}

/// An in-process broker. Every client transport created from it sees the
/// others' publishes; taking it offline drops every client.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MemoryBroker")
    }
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn client(self: &Arc<Self>) -> MemoryTransport {
        MemoryTransport {
            broker: self.clone(),
            id: Mutex::new(None),
        }
    }

    /// Going offline disconnects every client and refuses new connections.
    pub fn set_online(&self, online: bool) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.offline = !online;
        if !online {
            for (_, client) in state.clients.drain() {
                let _ = client
                    .events
                    .send(TransportEvent::ConnectionLost("broker offline".into()));
            }
        }
        debug!(online, "memory broker state changed");
    }

    /// The last [`PUBLISHED_HISTORY`] messages accepted by the broker, in
    /// arrival order.
    pub fn published(&self) -> Vec<OutboundMessage> {
        self.state
            .lock()
            .map(|s| s.published.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drain the history.
    pub fn take_published(&self) -> Vec<OutboundMessage> {
        self.state
            .lock()
            .map(|mut s| s.published.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn connected_clients(&self) -> usize {
        self.state.lock().map(|s| s.clients.len()).unwrap_or_default()
    }

    /// Publish from outside any pooled client.
    pub fn inject(&self, msg: OutboundMessage) {
        if let Ok(mut state) = self.state.lock() {
            route(&mut state, msg);
        }
    }
}

fn route(state: &mut BrokerState, msg: OutboundMessage) {
    for client in state.clients.values() {
        if client.patterns.iter().any(|p| topic::matches(p, &msg.topic)) {
            let _ = client.events.send(TransportEvent::Message(InboundMessage {
                topic: msg.topic.clone(),
                payload: msg.payload.clone(),
                qos: msg.qos,
                retain: false,
            }));
        }
    }
    if state.published.len() >= PUBLISHED_HISTORY {
        state.published.pop_front();
    }
    state.published.push_back(msg);
}

pub struct MemoryTransport {
    broker: Arc<MemoryBroker>,
    id: Mutex<Option<u64>>,
}

impl MemoryTransport {
    fn client_id(&self) -> Result<u64, PoolError> {
        self.id
            .lock()
            .map_err(|_| PoolError::Transport("poisoned client lock".into()))?
            .ok_or(PoolError::NotConnected)
    }

    fn with_client<T>(&self, f: impl FnOnce(&mut BrokerState, u64) -> Result<T, PoolError>) -> Result<T, PoolError> {
        let id = self.client_id()?;
        let mut state = self
            .broker
            .state
            .lock()
            .map_err(|_| PoolError::Transport("poisoned broker lock".into()))?;
        if !state.clients.contains_key(&id) {
            return Err(PoolError::NotConnected);
        }
        f(&mut state, id)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, events: mpsc::UnboundedSender<TransportEvent>) -> Result<(), PoolError> {
        let mut state = self
            .broker
            .state
            .lock()
            .map_err(|_| PoolError::Transport("poisoned broker lock".into()))?;
        if state.offline {
            return Err(PoolError::Unreachable("memory broker is offline".into()));
        }
        state.next_id += 1;
        let id = state.next_id;
        state.clients.insert(
            id,
            BrokerClient {
                events,
                patterns: Vec::new(),
            },
        );
        if let Ok(mut slot) = self.id.lock() {
            *slot = Some(id);
        }
        trace!(client = id, "memory transport connected");
        Ok(())
    }

    async fn disconnect(&self) {
        let id = self.id.lock().ok().and_then(|mut slot| slot.take());
        if let (Some(id), Ok(mut state)) = (id, self.broker.state.lock()) {
            state.clients.remove(&id);
        }
    }

    async fn publish(&self, msg: &OutboundMessage) -> Result<(), PoolError> {
        self.with_client(|state, _| {
            route(state, msg.clone());
            Ok(())
        })
    }

    async fn subscribe(&self, pattern: &str, _qos: u8) -> Result<(), PoolError> {
        self.with_client(|state, id| {
            if let Some(client) = state.clients.get_mut(&id) {
                if !client.patterns.iter().any(|p| p == pattern) {
                    client.patterns.push(pattern.to_string());
                }
            }
            Ok(())
        })
    }

    async fn unsubscribe(&self, pattern: &str) -> Result<(), PoolError> {
        self.with_client(|state, id| {
            if let Some(client) = state.clients.get_mut(&id) {
                client.patterns.retain(|p| p != pattern);
            }
            Ok(())
        })
    }
}

/// Serves `memory://<name>` addresses; one broker per name.
#[derive(Default)]
pub struct MemoryTransportFactory {
    brokers: DashMap<String, Arc<MemoryBroker>>,
}

impl MemoryTransportFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The broker behind `memory://<name>`, created on first use.
    pub fn broker(&self, name: &str) -> Arc<MemoryBroker> {
        self.brokers
            .entry(name.to_string())
            .or_insert_with(MemoryBroker::new)
            .clone()
    }
}

impl TransportFactory for MemoryTransportFactory {
    fn scheme(&self) -> &str {
        "memory"
    }

    fn create(&self, key: &ConnectionKey) -> Result<Arc<dyn Transport>, PoolError> {
        let name = key
            .address
            .strip_prefix("memory://")
            .ok_or_else(|| PoolError::UnsupportedScheme(key.address.clone()))?;
        Ok(Arc::new(self.broker(name).client()))
    }
}
