use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, error, warn};

use crate::flow::{BrokerConfig, MqttInConfig, MqttOutConfig};
use crate::message::Message;
use crate::node::{Done, NodeContext, NodeError, NodeHandler, NodeStatus};
use crate::pool::{ConnectionState, InboundMessage, OutboundMessage, SharedConnection, SubscriptionCallback};

fn state_status(state: ConnectionState) -> NodeStatus {
    match state {
        ConnectionState::Connected => NodeStatus::new("green", "dot", "connected"),
        ConnectionState::Connecting => NodeStatus::new("yellow", "ring", "connecting"),
        ConnectionState::Disconnected => NodeStatus::new("red", "ring", "disconnected"),
    }
}

/// A node's hold on a pooled broker connection.
#[derive(Debug)]
struct BrokerLink {
    broker_id: String,
    broker: Option<BrokerConfig>,
    conn: Mutex<Option<Arc<SharedConnection>>>,
}

impl BrokerLink {
    fn new(broker_id: String, broker: Option<BrokerConfig>) -> Self {
        Self {
            broker_id,
            broker,
            conn: Mutex::new(None),
        }
    }

    fn missing(&self) -> NodeError {
        NodeError::Config(format!("broker `{}` not found", self.broker_id))
    }

    fn get(&self) -> Option<Arc<SharedConnection>> {
        self.conn.lock().ok().and_then(|slot| slot.clone())
    }

    /// Take a pool reference and mirror the connection state in the node status.
    fn acquire(&self, ctx: &NodeContext) -> Result<Arc<SharedConnection>, NodeError> {
        let Some(broker) = &self.broker else {
            let err = self.missing();
            error!(node = %ctx.id(), error = %err, "node has no broker");
            ctx.status(NodeStatus::new("red", "ring", "missing broker configuration"));
            return Err(err);
        };
        let key = broker.connection_key();
        let services = ctx.services().clone();
        let conn = match ctx.pool().acquire(&key, || services.create_transport(&key)) {
            Ok(conn) => conn,
            Err(err) => {
                ctx.status(state_status(ConnectionState::Disconnected));
                return Err(err.into());
            }
        };
        if let Ok(mut slot) = self.conn.lock() {
            *slot = Some(conn.clone());
        }

        let mut states = conn.watch_state();
        let node = ctx.clone();
        ctx.spawn(async move {
            loop {
                let state = *states.borrow_and_update();
                node.status(state_status(state));
                if states.changed().await.is_err() {
                    break;
                }
            }
        });
        Ok(conn)
    }

    async fn release(&self, ctx: &NodeContext) -> Option<Arc<SharedConnection>> {
        let conn = self.conn.lock().ok().and_then(|mut slot| slot.take())?;
        ctx.pool().release(&conn).await;
        Some(conn)
    }
}

/// Subscribes to a topic on a pooled broker connection and sends every
/// matching publish as a message.
#[derive(Debug)]
pub struct MqttInNode {
    cfg: MqttInConfig,
    link: BrokerLink,
}

impl MqttInNode {
    pub fn new(cfg: MqttInConfig, broker: Option<BrokerConfig>) -> Self {
        let link = BrokerLink::new(cfg.broker.clone(), broker);
        Self { cfg, link }
    }
}

#[async_trait]
impl NodeHandler for MqttInNode {
    async fn start(&self, ctx: &NodeContext) -> Result<(), NodeError> {
        let conn = self.link.acquire(ctx)?;
        let node = ctx.clone();
        let callback: SubscriptionCallback = Arc::new(move |inbound: &InboundMessage| {
            let mut msg = Message::new();
            msg.set("topic", json!(inbound.topic));
            msg.set("payload", inbound.payload.clone());
            msg.set("qos", json!(inbound.qos));
            msg.set("retain", json!(inbound.retain));
            node.send_one(msg);
        });
        conn.subscribe(&self.cfg.topic, self.cfg.qos, ctx.id(), callback)
            .await
            .map_err(NodeError::from)?;
        conn.connect();
        debug!(node = %ctx.id(), topic = %self.cfg.topic, connection = %conn.key(), "subscribed");
        Ok(())
    }

    async fn on_input(&self, _ctx: &NodeContext, _msg: Message, done: Done) -> Result<(), NodeError> {
        done.ok();
        Ok(())
    }

    async fn close(&self, ctx: &NodeContext) {
        let Some(conn) = self.link.get() else {
            return;
        };
        if let Err(e) = conn.unsubscribe(&self.cfg.topic, ctx.id()).await {
            warn!(node = %ctx.id(), error = %e, "unsubscribe failed");
        }
        self.link.release(ctx).await;
    }
}

/// Publishes each input's payload on a pooled broker connection.
#[derive(Debug)]
pub struct MqttOutNode {
    cfg: MqttOutConfig,
    link: BrokerLink,
}

impl MqttOutNode {
    pub fn new(cfg: MqttOutConfig, broker: Option<BrokerConfig>) -> Self {
        let link = BrokerLink::new(cfg.broker.clone(), broker);
        Self { cfg, link }
    }
}

#[async_trait]
impl NodeHandler for MqttOutNode {
    async fn start(&self, ctx: &NodeContext) -> Result<(), NodeError> {
        let conn = self.link.acquire(ctx)?;
        conn.connect();
        Ok(())
    }

    async fn on_input(&self, _ctx: &NodeContext, msg: Message, done: Done) -> Result<(), NodeError> {
        let Some(conn) = self.link.get() else {
            done.fail(self.link.missing());
            return Ok(());
        };
        let topic = self
            .cfg
            .topic
            .as_deref()
            .filter(|t| !t.is_empty())
            .or_else(|| msg.topic())
            .map(str::to_string);
        let Some(topic) = topic else {
            done.fail(NodeError::InvalidInput("no topic specified".into()));
            return Ok(());
        };
        let retain = self
            .cfg
            .retain
            .or_else(|| msg.get("retain").and_then(Value::as_bool))
            .unwrap_or(false);

        conn.publish(OutboundMessage {
            topic,
            payload: msg.payload().cloned().unwrap_or(Value::Null),
            qos: self.cfg.qos,
            retain,
        })
        .await;
        done.ok();
        Ok(())
    }

    async fn close(&self, ctx: &NodeContext) {
        self.link.release(ctx).await;
    }
}
