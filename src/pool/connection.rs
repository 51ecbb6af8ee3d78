use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use super::transport::{InboundMessage, OutboundMessage, Transport, TransportEvent};
use super::{ConnectionKey, PoolError};
use crate::topic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

pub type SubscriptionCallback = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

struct Subscription {
    pattern: String,
    qos: u8,
    owner: String,
    callback: SubscriptionCallback,
}

struct Inner {
    state: ConnectionState,
    driving: bool,
    subscriptions: Vec<Subscription>,
    queue: VecDeque<OutboundMessage>,
}

/// A pooled connection shared by every node using the same [`ConnectionKey`].
///
/// The connection is driven by one background task: connect, resubscribe,
/// flush the queued publishes, then forward inbound traffic until the
/// transport reports the connection lost, at which point it backs off for
/// the reconnect interval and starts over.
pub struct SharedConnection {
    key: ConnectionKey,
    transport: Arc<dyn Transport>,
    inner: Mutex<Inner>,
    refs: AtomicUsize,
    state_tx: watch::Sender<ConnectionState>,
    reconnect_interval: Duration,
    shutdown: CancellationToken,
    retry: Notify,
    tasks: TaskTracker,
}

enum Step {
    Subscribe(Vec<(String, u8)>),
    Flush(Vec<OutboundMessage>),
}

impl std::fmt::Debug for SharedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedConnection")
            .field("key", &self.key)
            .field("state", &self.state())
            .field("refs", &self.ref_count())
            .finish()
    }
}

impl SharedConnection {
    pub(crate) fn new(key: ConnectionKey, transport: Arc<dyn Transport>, reconnect_interval: Duration) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            key,
            transport,
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                driving: false,
                subscriptions: Vec::new(),
                queue: VecDeque::new(),
            }),
            refs: AtomicUsize::new(0),
            state_tx,
            reconnect_interval,
            shutdown: CancellationToken::new(),
            retry: Notify::new(),
            tasks: TaskTracker::new(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, PoolError> {
        self.inner
            .lock()
            .map_err(|_| PoolError::Transport(format!("connection {} lock poisoned", self.key)))
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    pub(crate) fn add_ref(&self) -> usize {
        self.refs.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn drop_ref(&self) -> usize {
        let prev = self
            .refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        prev.saturating_sub(1)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Observe connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Number of publishes waiting for the connection.
    pub fn queued(&self) -> usize {
        self.lock().map(|inner| inner.queue.len()).unwrap_or_default()
    }

    fn set_state(&self, inner: &mut Inner, state: ConnectionState) {
        if inner.state != state {
            debug!(connection = %self.key, ?state, "connection state changed");
        }
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    /// Start the connection task unless it is already running.
    pub fn connect(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        let Ok(mut inner) = self.lock() else {
            return;
        };
        if inner.driving {
            return;
        }
        inner.driving = true;
        self.set_state(&mut inner, ConnectionState::Connecting);
        drop(inner);

        let me = self.clone();
        self.tasks.spawn(async move { me.drive().await });
    }

    async fn drive(self: Arc<Self>) {
        loop {
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let connected = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                res = self.transport.connect(events_tx) => res,
            };
            match connected {
                Ok(()) => {
                    info!(connection = %self.key, "connected");
                    if self.on_connected().await.is_ok() && self.pump(events_rx).await.is_break() {
                        return;
                    }
                }
                Err(e) => warn!(connection = %self.key, error = %e, "connection failed"),
            }

            self.transport.disconnect().await;
            if let Ok(mut inner) = self.lock() {
                self.set_state(&mut inner, ConnectionState::Disconnected);
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.reconnect_interval) => {}
            }
            if let Ok(mut inner) = self.lock() {
                self.set_state(&mut inner, ConnectionState::Connecting);
            }
            debug!(connection = %self.key, "reconnecting");
        }
    }

    /// Resubscribe everything, then flush the queue in FIFO order. The state
    /// only becomes `Connected` once every stored pattern reached the
    /// transport and the queue is empty, both checked under the same lock, so
    /// later subscribes and publishes cannot slip past this step.
    async fn on_connected(&self) -> Result<(), PoolError> {
        let mut subscribed: Vec<String> = Vec::new();
        loop {
            let step = {
                let mut inner = self.lock()?;
                let mut fresh: Vec<(String, u8)> = Vec::new();
                for sub in &inner.subscriptions {
                    if !subscribed.contains(&sub.pattern) && !fresh.iter().any(|(p, _)| p == &sub.pattern) {
                        fresh.push((sub.pattern.clone(), sub.qos));
                    }
                }
                if !fresh.is_empty() {
                    Step::Subscribe(fresh)
                } else if inner.queue.is_empty() {
                    self.set_state(&mut inner, ConnectionState::Connected);
                    return Ok(());
                } else {
                    Step::Flush(inner.queue.drain(..).collect())
                }
            };

            match step {
                Step::Subscribe(patterns) => {
                    for (pattern, qos) in patterns {
                        self.transport.subscribe(&pattern, qos).await?;
                        subscribed.push(pattern);
                    }
                }
                Step::Flush(batch) => {
                    trace!(connection = %self.key, count = batch.len(), "flushing queued publishes");
                    for (i, msg) in batch.iter().enumerate() {
                        if let Err(e) = self.transport.publish(msg).await {
                            warn!(connection = %self.key, error = %e, "flush interrupted");
                            let mut inner = self.lock()?;
                            for msg in batch[i..].iter().rev() {
                                inner.queue.push_front(msg.clone());
                            }
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    async fn pump(&self, mut events: mpsc::UnboundedReceiver<TransportEvent>) -> ControlFlow<()> {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => return ControlFlow::Break(()),
                _ = self.retry.notified() => {
                    debug!(connection = %self.key, "publish failed, reconnecting");
                    return ControlFlow::Continue(());
                }
                event = events.recv() => event,
            };
            match event {
                Some(TransportEvent::Message(msg)) => self.dispatch(&msg),
                Some(TransportEvent::ConnectionLost(reason)) => {
                    warn!(connection = %self.key, %reason, "connection lost");
                    return ControlFlow::Continue(());
                }
                None => {
                    warn!(connection = %self.key, "transport closed its event channel");
                    return ControlFlow::Continue(());
                }
            }
        }
    }

    fn dispatch(&self, msg: &InboundMessage) {
        let callbacks: Vec<SubscriptionCallback> = match self.lock() {
            Ok(inner) => inner
                .subscriptions
                .iter()
                .filter(|s| topic::matches(&s.pattern, &msg.topic))
                .map(|s| s.callback.clone())
                .collect(),
            Err(_) => return,
        };
        for callback in callbacks {
            callback(msg);
        }
    }

    /// Publish now when connected, otherwise queue until the connection is up.
    pub async fn publish(self: &Arc<Self>, msg: OutboundMessage) {
        if self.is_closed() {
            debug!(connection = %self.key, topic = %msg.topic, "publish on closed connection dropped");
            return;
        }
        let direct = match self.lock() {
            Ok(inner) if inner.state == ConnectionState::Connected => true,
            Ok(mut inner) => {
                inner.queue.push_back(msg.clone());
                false
            }
            Err(_) => return,
        };
        if !direct {
            self.connect();
            return;
        }
        if let Err(e) = self.transport.publish(&msg).await {
            warn!(connection = %self.key, error = %e, "publish failed, queued for reconnect");
            if let Ok(mut inner) = self.lock() {
                inner.queue.push_back(msg);
                // later publishes queue behind this one until the driver flushes
                if inner.state == ConnectionState::Connected {
                    self.set_state(&mut inner, ConnectionState::Connecting);
                }
            }
            self.retry.notify_one();
        }
    }

    /// Register `callback` for `pattern` on behalf of `owner`.
    pub async fn subscribe(&self, pattern: &str, qos: u8, owner: &str, callback: SubscriptionCallback) -> Result<(), PoolError> {
        let first_for_pattern = {
            let mut inner = self.lock()?;
            let first = !inner.subscriptions.iter().any(|s| s.pattern == pattern);
            inner.subscriptions.push(Subscription {
                pattern: pattern.to_string(),
                qos,
                owner: owner.to_string(),
                callback,
            });
            first && inner.state == ConnectionState::Connected
        };
        if first_for_pattern {
            self.transport.subscribe(pattern, qos).await?;
        }
        Ok(())
    }

    /// Remove `owner`'s callbacks for `pattern`; the transport subscription
    /// goes away with the last callback.
    pub async fn unsubscribe(&self, pattern: &str, owner: &str) -> Result<(), PoolError> {
        let last_for_pattern = {
            let mut inner = self.lock()?;
            inner
                .subscriptions
                .retain(|s| !(s.pattern == pattern && s.owner == owner));
            !inner.subscriptions.iter().any(|s| s.pattern == pattern)
                && inner.state == ConnectionState::Connected
        };
        if last_for_pattern {
            self.transport.unsubscribe(pattern).await?;
        }
        Ok(())
    }

    pub fn subscription_count(&self) -> usize {
        self.lock().map(|inner| inner.subscriptions.len()).unwrap_or_default()
    }

    /// Stop the connection task and close the transport.
    pub(crate) async fn disconnect(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.transport.disconnect().await;
        if let Ok(mut inner) = self.lock() {
            inner.subscriptions.clear();
            if !inner.queue.is_empty() {
                warn!(connection = %self.key, dropped = inner.queue.len(), "dropping queued publishes");
                inner.queue.clear();
            }
            inner.driving = false;
            self.set_state(&mut inner, ConnectionState::Disconnected);
        }
        info!(connection = %self.key, "disconnected");
    }
}
