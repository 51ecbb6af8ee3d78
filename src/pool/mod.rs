//! Reference-counted pool of shared external connections.
//!
//! Every node asking for the same [`ConnectionKey`] gets the same
//! [`SharedConnection`]; the connection is torn down when the last node
//! releases it.

mod connection;
mod transport;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub use connection::{ConnectionState, SharedConnection, SubscriptionCallback};
pub use transport::{
    InboundMessage, MemoryBroker, MemoryTransport, MemoryTransportFactory, OutboundMessage, PUBLISHED_HISTORY, Transport,
    TransportEvent, TransportFactory,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("not connected")]
    NotConnected,
    #[error("no transport registered for `{0}`")]
    UnsupportedScheme(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Identity of a pooled connection: endpoint plus credentials.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionKey {
    pub address: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl ConnectionKey {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port: None,
            client_id: None,
            username: None,
            password: None,
        }
    }

    /// URL scheme of the address, `mqtt` when none is given.
    pub fn scheme(&self) -> &str {
        self.address.split_once("://").map(|(s, _)| s).unwrap_or("mqtt")
    }
}

// the password never ends up in logs
impl std::fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(user) = &self.username {
            write!(f, "{user}@")?;
        }
        f.write_str(&self.address)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        if let Some(client_id) = &self.client_id {
            write!(f, " ({client_id})")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnectionKey({self})")
    }
}

pub struct ConnectionPool {
    connections: Mutex<HashMap<ConnectionKey, Arc<SharedConnection>>>,
    reconnect_interval: Duration,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnectionPool({} connections)", self.len())
    }
}

impl ConnectionPool {
    pub fn new(reconnect_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            connections: Mutex::new(HashMap::new()),
            reconnect_interval,
        })
    }

    /// Return the shared connection for `key`, building it with `factory` on
    /// first use. The connection is not started; call
    /// [`SharedConnection::connect`] or publish on it.
    pub fn acquire<F>(&self, key: &ConnectionKey, factory: F) -> Result<Arc<SharedConnection>, PoolError>
    where
        F: FnOnce() -> Result<Arc<dyn Transport>, PoolError>,
    {
        let mut connections = self
            .connections
            .lock()
            .map_err(|_| PoolError::Transport("pool lock poisoned".into()))?;
        let handle = match connections.get(key) {
            Some(existing) => existing.clone(),
            None => {
                let transport = factory()?;
                let handle = Arc::new(SharedConnection::new(key.clone(), transport, self.reconnect_interval));
                connections.insert(key.clone(), handle.clone());
                debug!(connection = %key, "pooled connection created");
                handle
            }
        };
        let refs = handle.add_ref();
        debug!(connection = %key, refs, "pooled connection acquired");
        Ok(handle)
    }

    /// Drop one reference; the last one disconnects and evicts the handle.
    pub async fn release(&self, handle: &Arc<SharedConnection>) {
        let evicted = {
            let Ok(mut connections) = self.connections.lock() else {
                return;
            };
            match connections.get(handle.key()) {
                Some(current) if Arc::ptr_eq(current, handle) => {
                    let refs = handle.drop_ref();
                    debug!(connection = %handle.key(), refs, "pooled connection released");
                    if refs == 0 {
                        connections.remove(handle.key());
                        true
                    } else {
                        false
                    }
                }
                _ => {
                    warn!(connection = %handle.key(), "release of a connection not owned by this pool");
                    false
                }
            }
        };
        if evicted {
            handle.disconnect().await;
        }
    }

    pub fn get(&self, key: &ConnectionKey) -> Option<Arc<SharedConnection>> {
        self.connections.lock().ok()?.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().map(|c| c.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{Duration as TokioDuration, sleep, timeout};

    fn memory_key(name: &str) -> ConnectionKey {
        ConnectionKey::new(format!("memory://{name}"))
    }

    fn out(topic: &str, n: i64) -> OutboundMessage {
        OutboundMessage {
            topic: topic.into(),
            payload: json!(n),
            qos: 0,
            retain: false,
        }
    }

    async fn wait_for_state(handle: &SharedConnection, state: ConnectionState) {
        let mut rx = handle.watch_state();
        timeout(TokioDuration::from_secs(2), async {
            while *rx.borrow_and_update() != state {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .expect("state not reached");
    }

    #[tokio::test]
    async fn test_acquire_shares_identity_and_evicts_at_zero() {
        let pool = ConnectionPool::new(Duration::from_millis(50));
        let factory = MemoryTransportFactory::new();
        let builds = AtomicUsize::new(0);
        let key = memory_key("b1");
        let make = || {
            builds.fetch_add(1, Ordering::SeqCst);
            factory.create(&key)
        };

        let a = pool.acquire(&key, make).unwrap();
        let b = pool
            .acquire(&key, || {
                builds.fetch_add(1, Ordering::SeqCst);
                factory.create(&key)
            })
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.ref_count(), 2);
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        pool.release(&a).await;
        assert_eq!(b.ref_count(), 1);
        assert_eq!(pool.len(), 1);
        pool.release(&b).await;
        assert!(pool.is_empty());
        assert!(b.is_closed());

        let c = pool.acquire(&key, || factory.create(&key)).unwrap();
        assert!(!Arc::ptr_eq(&b, &c));
        assert_eq!(c.ref_count(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_only_removes_owner_callback() {
        let pool = ConnectionPool::new(Duration::from_millis(50));
        let factory = MemoryTransportFactory::new();
        let broker = factory.broker("b2");
        let key = memory_key("b2");
        let handle = pool.acquire(&key, || factory.create(&key)).unwrap();
        handle.connect();
        wait_for_state(&handle, ConnectionState::Connected).await;

        let hits_a = Arc::new(AtomicUsize::new(0));
        let hits_b = Arc::new(AtomicUsize::new(0));
        let (ha, hb) = (hits_a.clone(), hits_b.clone());
        handle
            .subscribe("t/#", 0, "node-a", Arc::new(move |_: &InboundMessage| {
                ha.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();
        handle
            .subscribe("t/#", 0, "node-b", Arc::new(move |_: &InboundMessage| {
                hb.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();

        broker.inject(out("t/1", 1));
        sleep(TokioDuration::from_millis(50)).await;
        handle.unsubscribe("t/#", "node-a").await.unwrap();
        broker.inject(out("t/2", 2));
        sleep(TokioDuration::from_millis(50)).await;

        assert_eq!(hits_a.load(Ordering::SeqCst), 1);
        assert_eq!(hits_b.load(Ordering::SeqCst), 2);
        assert_eq!(handle.subscription_count(), 1);
        pool.release(&handle).await;
    }

    #[tokio::test]
    async fn test_queued_publishes_flush_in_order_after_reconnect() {
        let pool = ConnectionPool::new(Duration::from_millis(50));
        let factory = MemoryTransportFactory::new();
        let broker = factory.broker("b3");
        let key = memory_key("b3");
        let handle = pool.acquire(&key, || factory.create(&key)).unwrap();
        handle.connect();
        wait_for_state(&handle, ConnectionState::Connected).await;

        broker.set_online(false);
        wait_for_state(&handle, ConnectionState::Disconnected).await;
        for n in 0..3 {
            handle.publish(out("q", n)).await;
        }
        assert_eq!(handle.queued(), 3);
        assert!(broker.published().is_empty());

        broker.set_online(true);
        wait_for_state(&handle, ConnectionState::Connected).await;
        let payloads: Vec<_> = broker.published().into_iter().map(|m| m.payload).collect();
        assert_eq!(payloads, vec![json!(0), json!(1), json!(2)]);
        assert_eq!(handle.queued(), 0);
        pool.release(&handle).await;
    }

    #[tokio::test]
    async fn test_subscriptions_restored_after_reconnect() {
        let pool = ConnectionPool::new(Duration::from_millis(30));
        let factory = MemoryTransportFactory::new();
        let broker = factory.broker("b4");
        let key = memory_key("b4");
        let handle = pool.acquire(&key, || factory.create(&key)).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        handle
            .subscribe("s", 0, "n", Arc::new(move |_: &InboundMessage| {
                h.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();
        handle.connect();
        wait_for_state(&handle, ConnectionState::Connected).await;

        broker.set_online(false);
        wait_for_state(&handle, ConnectionState::Disconnected).await;
        broker.set_online(true);
        wait_for_state(&handle, ConnectionState::Connected).await;
        broker.inject(out("s", 1));
        sleep(TokioDuration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        pool.release(&handle).await;
        assert_eq!(broker.connected_clients(), 0);
    }

    /// Wraps a memory client: subscribes are slowed down and recorded, and
    /// the first `fail_publishes` publishes fail.
    struct FlakyTransport {
        inner: MemoryTransport,
        subscribe_delay: TokioDuration,
        subscribed: Mutex<Vec<String>>,
        fail_publishes: AtomicUsize,
    }

    impl FlakyTransport {
        fn new(broker: &Arc<MemoryBroker>, subscribe_delay: TokioDuration, fail_publishes: usize) -> Arc<Self> {
            Arc::new(Self {
                inner: broker.client(),
                subscribe_delay,
                subscribed: Mutex::new(Vec::new()),
                fail_publishes: AtomicUsize::new(fail_publishes),
            })
        }
    }

    #[async_trait::async_trait]
    impl Transport for FlakyTransport {
        async fn connect(&self, events: tokio::sync::mpsc::UnboundedSender<TransportEvent>) -> Result<(), PoolError> {
            self.inner.connect(events).await
        }

        async fn disconnect(&self) {
            self.inner.disconnect().await
        }

        async fn publish(&self, msg: &OutboundMessage) -> Result<(), PoolError> {
            let failing = self
                .fail_publishes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(PoolError::Transport("write failed".into()));
            }
            self.inner.publish(msg).await
        }

        async fn subscribe(&self, pattern: &str, qos: u8) -> Result<(), PoolError> {
            sleep(self.subscribe_delay).await;
            self.subscribed.lock().unwrap().push(pattern.to_string());
            self.inner.subscribe(pattern, qos).await
        }

        async fn unsubscribe(&self, pattern: &str) -> Result<(), PoolError> {
            self.inner.unsubscribe(pattern).await
        }
    }

    fn noop() -> SubscriptionCallback {
        Arc::new(|_: &InboundMessage| {})
    }

    #[tokio::test]
    async fn test_subscribe_during_resubscribe_reaches_transport() {
        let pool = ConnectionPool::new(Duration::from_millis(30));
        let broker = MemoryBroker::new();
        let transport = FlakyTransport::new(&broker, TokioDuration::from_millis(200), 0);
        let key = memory_key("slow");
        let t = transport.clone();
        let handle = pool.acquire(&key, || Ok(t as Arc<dyn Transport>)).unwrap();

        handle.subscribe("a", 0, "node-a", noop()).await.unwrap();
        handle.connect();
        // "a" is still being resubscribed when "b" arrives
        sleep(TokioDuration::from_millis(50)).await;
        assert_eq!(handle.state(), ConnectionState::Connecting);
        handle.subscribe("b", 0, "node-b", noop()).await.unwrap();

        wait_for_state(&handle, ConnectionState::Connected).await;
        let seen = transport.subscribed.lock().unwrap().clone();
        assert_eq!(seen, vec!["a".to_string(), "b".to_string()]);

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        handle
            .subscribe("b", 0, "node-c", Arc::new(move |_: &InboundMessage| {
                h.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();
        broker.inject(out("b", 1));
        sleep(TokioDuration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        pool.release(&handle).await;
    }

    #[tokio::test]
    async fn test_failed_publish_keeps_order_with_later_publishes() {
        let pool = ConnectionPool::new(Duration::from_millis(30));
        let broker = MemoryBroker::new();
        let transport = FlakyTransport::new(&broker, TokioDuration::ZERO, 1);
        let key = memory_key("flaky");
        let t = transport.clone();
        let handle = pool.acquire(&key, || Ok(t as Arc<dyn Transport>)).unwrap();
        handle.connect();
        wait_for_state(&handle, ConnectionState::Connected).await;

        handle.publish(out("q", 1)).await;
        assert_ne!(handle.state(), ConnectionState::Connected);
        handle.publish(out("q", 2)).await;
        handle.publish(out("q", 3)).await;
        assert!(broker.published().is_empty());

        wait_for_state(&handle, ConnectionState::Connected).await;
        let payloads: Vec<_> = broker.published().into_iter().map(|m| m.payload).collect();
        assert_eq!(payloads, vec![json!(1), json!(2), json!(3)]);
        assert_eq!(handle.queued(), 0);
        pool.release(&handle).await;
    }

    #[test]
    fn test_key_display_hides_password() {
        let mut key = ConnectionKey::new("mqtt://host");
        key.username = Some("bob".into());
        key.password = Some("hunter2".into());
        key.port = Some(1883);
        assert_eq!(key.to_string(), "bob@mqtt://host:1883");
        assert!(!format!("{key:?}").contains("hunter2"));
        assert_eq!(key.scheme(), "mqtt");
        assert_eq!(ConnectionKey::new("memory://x").scheme(), "memory");
    }
}
