use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tokio_util::task::TaskTracker;
use tracing::{trace, warn};

use crate::comms::Comms;
use crate::config::{ConfigManager, Settings};
use crate::context::{ContextError, ContextScope, ContextStore, ScopedContext};
use crate::logger::{LogLevel, Logger};
use crate::message::Message;
use crate::pool::{
    ConnectionKey, ConnectionPool, MemoryBroker, MemoryTransportFactory, PoolError, Transport, TransportFactory,
};

/// Messages per output port.
pub type Outputs = Vec<Vec<Message>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeError {
    /// User code did not compile.
    Compile(String),
    /// Failure while handling one input.
    Runtime(String),
    /// Too many pending messages.
    Capacity(usize),
    /// External endpoint trouble.
    Connection(String),
    /// Missing or invalid configuration.
    Config(String),
    InvalidInput(String),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::Compile(msg) => write!(f, "Compile error: {}", msg),
            NodeError::Runtime(msg) => write!(f, "{}", msg),
            NodeError::Capacity(limit) => write!(f, "Too many pending messages (limit {})", limit),
            NodeError::Connection(msg) => write!(f, "Connection error: {}", msg),
            NodeError::Config(msg) => write!(f, "Missing configuration: {}", msg),
            NodeError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
        }
    }
}

impl std::error::Error for NodeError {}

impl From<ContextError> for NodeError {
    fn from(err: ContextError) -> Self {
        NodeError::Runtime(err.to_string())
    }
}

impl From<PoolError> for NodeError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::UnsupportedScheme(_) => NodeError::Config(err.to_string()),
            other => NodeError::Connection(other.to_string()),
        }
    }
}

/// Node status indicator. Blank (all fields empty) clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl NodeStatus {
    pub fn new(fill: &str, shape: &str, text: impl Into<String>) -> Self {
        Self {
            fill: Some(fill.to_string()),
            shape: Some(shape.to_string()),
            text: Some(text.into()),
        }
    }

    pub fn clear() -> Self {
        Self::default()
    }

    pub fn is_blank(&self) -> bool {
        [&self.fill, &self.shape, &self.text]
            .iter()
            .all(|f| f.as_deref().is_none_or(str::is_empty))
    }
}

/// Static facts about a node instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub type_name: String,
    pub name: Option<String>,
    pub flow_id: String,
}

/// Services shared by every flow of one runtime.
pub struct RuntimeServices {
    pub settings: Settings,
    pub comms: Arc<Comms>,
    pub context: Arc<ContextStore>,
    pub pool: Arc<ConnectionPool>,
    pub config: ConfigManager,
    pub logger: Logger,
    transports: DashMap<String, Arc<dyn TransportFactory>>,
    memory: Arc<MemoryTransportFactory>,
}

impl fmt::Debug for RuntimeServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeServices")
            .field("comms", &self.comms)
            .field("context", &self.context)
            .field("pool", &self.pool)
            .finish()
    }
}

impl RuntimeServices {
    /// Build the shared services. The `memory` transport is always registered.
    pub fn new(settings: Settings, config: ConfigManager, logger: Logger) -> Result<Arc<Self>, ContextError> {
        let context = Arc::new(ContextStore::from_settings(&settings)?);
        let pool = ConnectionPool::new(Duration::from_millis(settings.reconnect_interval_ms));
        let memory = MemoryTransportFactory::new();
        let services = Self {
            settings,
            comms: Comms::new(),
            context,
            pool,
            config,
            logger,
            transports: DashMap::new(),
            memory: memory.clone(),
        };
        services.register_transport(memory);
        Ok(Arc::new(services))
    }

    pub fn register_transport(&self, factory: Arc<dyn TransportFactory>) {
        self.transports.insert(factory.scheme().to_string(), factory);
    }

    /// The in-process broker served at `memory://<name>`.
    pub fn memory_broker(&self, name: &str) -> Arc<MemoryBroker> {
        self.memory.broker(name)
    }

    pub fn transport_factory(&self, scheme: &str) -> Option<Arc<dyn TransportFactory>> {
        self.transports.get(scheme).map(|f| f.clone())
    }

    /// Build a transport for `key` from the factory registered for its scheme.
    pub fn create_transport(&self, key: &ConnectionKey) -> Result<Arc<dyn Transport>, PoolError> {
        let factory = self
            .transport_factory(key.scheme())
            .ok_or_else(|| PoolError::UnsupportedScheme(key.scheme().to_string()))?;
        factory.create(key)
    }
}

/// Receives what a node emits. Implemented by the running flow.
pub(crate) trait Dispatch: Send + Sync {
    fn route(&self, source: &NodeInfo, outputs: Outputs);
    fn report_error(&self, source: &NodeInfo, error: &NodeError, msg: Option<&Message>);
}

/// What a detached node context captured.
#[derive(Debug, Clone, PartialEq)]
pub enum Emitted {
    Sent(Outputs),
    Error(NodeError, Option<Message>),
}

struct ChannelDispatch(mpsc::UnboundedSender<Emitted>);

impl Dispatch for ChannelDispatch {
    fn route(&self, _source: &NodeInfo, outputs: Outputs) {
        let _ = self.0.send(Emitted::Sent(outputs));
    }

    fn report_error(&self, _source: &NodeInfo, error: &NodeError, msg: Option<&Message>) {
        let _ = self.0.send(Emitted::Error(error.clone(), msg.cloned()));
    }
}

struct ContextInner {
    info: NodeInfo,
    services: Arc<RuntimeServices>,
    dispatch: Weak<dyn Dispatch>,
    _owned_dispatch: Option<Arc<dyn Dispatch>>,
    env: Arc<Vec<(String, String)>>,
    status: Mutex<NodeStatus>,
    token: CancellationToken,
    tracker: TaskTracker,
    node_ctx: ScopedContext,
    flow_ctx: ScopedContext,
    global_ctx: ScopedContext,
}

/// Everything a node handler can reach: its identity, the shared services,
/// context accessors and the way back into the flow. Cheap to clone.
#[derive(Clone)]
pub struct NodeContext {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NodeContext").field(&self.inner.info).finish()
    }
}

impl NodeContext {
    pub(crate) fn new(
        info: NodeInfo,
        services: Arc<RuntimeServices>,
        dispatch: Weak<dyn Dispatch>,
        env: Arc<Vec<(String, String)>>,
        token: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        let context = services.context.clone();
        let node_scope = format!("{}:{}", info.id, info.flow_id);
        let flow_scope = info.flow_id.clone();
        Self {
            inner: Arc::new(ContextInner {
                node_ctx: context.scoped(ContextScope::Node, Some(node_scope)),
                flow_ctx: context.scoped(ContextScope::Flow, Some(flow_scope)),
                global_ctx: context.scoped(ContextScope::Global, None),
                info,
                services,
                dispatch,
                _owned_dispatch: None,
                env,
                status: Mutex::new(NodeStatus::default()),
                token,
                tracker,
            }),
        }
    }

    /// A context outside any flow; sends and errors land on the returned
    /// channel. Used to drive a handler on its own.
    pub fn detached(
        info: NodeInfo,
        services: Arc<RuntimeServices>,
    ) -> (Self, mpsc::UnboundedReceiver<Emitted>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatch: Arc<dyn Dispatch> = Arc::new(ChannelDispatch(tx));
        let mut ctx = Self::new(
            info,
            services,
            Arc::downgrade(&dispatch),
            Arc::new(Vec::new()),
            CancellationToken::new(),
            TaskTracker::new(),
        );
        if let Some(inner) = Arc::get_mut(&mut ctx.inner) {
            inner._owned_dispatch = Some(dispatch);
        }
        (ctx, rx)
    }

    pub fn info(&self) -> &NodeInfo {
        &self.inner.info
    }

    pub fn id(&self) -> &str {
        &self.inner.info.id
    }

    pub fn flow_id(&self) -> &str {
        &self.inner.info.flow_id
    }

    pub fn type_name(&self) -> &str {
        &self.inner.info.type_name
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.info.name.as_deref()
    }

    pub fn services(&self) -> &Arc<RuntimeServices> {
        &self.inner.services
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.services.settings
    }

    pub fn comms(&self) -> &Arc<Comms> {
        &self.inner.services.comms
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.inner.services.pool
    }

    pub fn context(&self) -> &ScopedContext {
        &self.inner.node_ctx
    }

    pub fn flow_context(&self) -> &ScopedContext {
        &self.inner.flow_ctx
    }

    pub fn global_context(&self) -> &ScopedContext {
        &self.inner.global_ctx
    }

    /// Environment lookup: flow `env` entries, node/flow identity variables,
    /// then the runtime configuration.
    pub fn env(&self, name: &str) -> Option<String> {
        if let Some((_, value)) = self.inner.env.iter().find(|(k, _)| k == name) {
            return Some(value.clone());
        }
        match name {
            "NR_NODE_ID" => Some(self.id().to_string()),
            "NR_NODE_NAME" => self.name().map(str::to_string),
            "NR_FLOW_ID" => Some(self.flow_id().to_string()),
            _ => self.inner.services.config.get(name),
        }
    }

    pub fn log(&self, level: LogLevel, msg: &str) {
        self.inner.services.logger.log(level, self.id(), msg);
    }

    pub fn status(&self, status: NodeStatus) {
        if let Ok(mut current) = self.inner.status.lock() {
            *current = status.clone();
        }
        let data = serde_json::to_value(&status).unwrap_or(Value::Null);
        self.comms().publish(&format!("status/{}", self.id()), data, true);
    }

    pub fn current_status(&self) -> NodeStatus {
        self.inner
            .status
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Emit messages on the node's output ports. Ignored once the node is
    /// closed.
    pub fn send(&self, outputs: Outputs) {
        if !self.is_alive() {
            trace!(node = self.id(), "send after close dropped");
            return;
        }
        match self.inner.dispatch.upgrade() {
            Some(dispatch) => dispatch.route(&self.inner.info, outputs),
            None => trace!(node = self.id(), "send without a flow dropped"),
        }
    }

    /// Emit one message on port 0.
    pub fn send_one(&self, msg: Message) {
        self.send(vec![vec![msg]]);
    }

    /// Report an error for this node; routed to catch nodes or logged.
    pub fn report_error(&self, error: NodeError, msg: Option<&Message>) {
        match self.inner.dispatch.upgrade() {
            Some(dispatch) => dispatch.report_error(&self.inner.info, &error, msg),
            None => warn!(node = self.id(), %error, "error reported without a flow"),
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.inner.token.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.inner.token.cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.inner.tracker
    }

    /// Run `fut` on the flow's tracker; it is dropped when the node closes.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.inner.token.clone();
        self.inner.tracker.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = fut => {}
            }
        });
    }

    /// Cancel this node's liveness token.
    pub fn close(&self) {
        self.inner.token.cancel();
    }
}

/// Completion of a held input, used by the aggregator.
pub trait Completion: Send {
    fn complete(self, error: Option<NodeError>);
}

/// The completion handle of one input. Consuming it with [`Done::ok`] or
/// [`Done::fail`] finishes the input; dropping it finishes it silently.
pub struct Done {
    inner: Option<DoneInner>,
}

struct DoneInner {
    ctx: NodeContext,
    msg: Message,
    tx: oneshot::Sender<()>,
}

impl fmt::Debug for Done {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.inner.is_some() { "Done(pending)" } else { "Done(completed)" })
    }
}

impl Done {
    /// A completion for `msg` plus the receiver resolved once it completes.
    pub fn new(ctx: &NodeContext, msg: &Message) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                inner: Some(DoneInner {
                    ctx: ctx.clone(),
                    msg: msg.clone(),
                    tx,
                }),
            },
            rx,
        )
    }

    pub fn ok(mut self) {
        if let Some(inner) = self.inner.take() {
            let _ = inner.tx.send(());
        }
    }

    /// Finish with an error, routed like any other error of the node.
    pub fn fail(mut self, error: NodeError) {
        if let Some(inner) = self.inner.take() {
            inner.ctx.report_error(error, Some(&inner.msg));
            let _ = inner.tx.send(());
        }
    }
}

impl Completion for Done {
    fn complete(self, error: Option<NodeError>) {
        match error {
            Some(error) => self.fail(error),
            None => self.ok(),
        }
    }
}

impl Drop for Done {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            let _ = inner.tx.send(());
        }
    }
}

/// Behaviour of one node kind.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// Called once every node of the flow is wired.
    async fn start(&self, _ctx: &NodeContext) -> Result<(), NodeError> {
        Ok(())
    }

    /// Handle one input. The worker awaits this before taking the next input.
    async fn on_input(&self, ctx: &NodeContext, msg: Message, done: Done) -> Result<(), NodeError>;

    /// Release everything the node holds. Sends are no longer delivered.
    async fn close(&self, _ctx: &NodeContext) {}
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::MapConfigManager;
    use serde_json::json;

    pub(crate) fn services() -> Arc<RuntimeServices> {
        services_with(Settings::default())
    }

    pub(crate) fn services_with(settings: Settings) -> Arc<RuntimeServices> {
        RuntimeServices::new(settings, ConfigManager(MapConfigManager::new()), Logger::default()).unwrap()
    }

    pub(crate) fn info(id: &str, type_name: &str) -> NodeInfo {
        NodeInfo {
            id: id.into(),
            type_name: type_name.into(),
            name: None,
            flow_id: "f1".into(),
        }
    }

    #[tokio::test]
    async fn test_detached_context_captures_sends_and_errors() {
        let (ctx, mut rx) = NodeContext::detached(info("n1", "test"), services());
        let msg = Message::with_payload(json!(1));
        ctx.send_one(msg.clone());
        ctx.report_error(NodeError::Runtime("boom".into()), Some(&msg));

        assert_eq!(rx.recv().await, Some(Emitted::Sent(vec![vec![msg.clone()]])));
        assert_eq!(
            rx.recv().await,
            Some(Emitted::Error(NodeError::Runtime("boom".into()), Some(msg)))
        );
    }

    #[tokio::test]
    async fn test_send_after_close_is_dropped() {
        let (ctx, mut rx) = NodeContext::detached(info("n1", "test"), services());
        ctx.close();
        ctx.send_one(Message::new());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_done_fail_reports_with_message() {
        let (ctx, mut rx) = NodeContext::detached(info("n1", "test"), services());
        let msg = Message::with_payload(json!("x"));
        let (done, completed) = Done::new(&ctx, &msg);
        done.fail(NodeError::InvalidInput("bad".into()));
        assert!(completed.await.is_ok());
        match rx.recv().await {
            Some(Emitted::Error(NodeError::InvalidInput(text), Some(m))) => {
                assert_eq!(text, "bad");
                assert_eq!(m, msg);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dropped_done_completes_silently() {
        let (ctx, mut rx) = NodeContext::detached(info("n1", "test"), services());
        let (done, completed) = Done::new(&ctx, &Message::new());
        drop(done);
        assert!(completed.await.is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_status_is_published_and_retained() {
        let services = services();
        let (ctx, _rx) = NodeContext::detached(info("n1", "test"), services.clone());
        ctx.status(NodeStatus::new("green", "dot", "connected"));
        assert_eq!(
            services.comms.retained("status/n1"),
            Some(json!({"fill": "green", "shape": "dot", "text": "connected"}))
        );
        assert!(!ctx.current_status().is_blank());
        assert!(NodeStatus::clear().is_blank());
    }

    #[test]
    fn test_env_lookup_order() {
        let config = MapConfigManager::new();
        config.set("HOST", "from-config");
        let services =
            RuntimeServices::new(Settings::default(), ConfigManager(config), Logger::default()).unwrap();
        let (ctx, _rx) = NodeContext::detached(info("n1", "test"), services);
        assert_eq!(ctx.env("HOST"), Some("from-config".into()));
        assert_eq!(ctx.env("NR_NODE_ID"), Some("n1".into()));
        assert_eq!(ctx.env("NR_FLOW_ID"), Some("f1".into()));
        assert_eq!(ctx.env("MISSING_REDFLOW_VAR"), None);
    }

    #[test]
    fn test_unknown_transport_scheme() {
        let services = services();
        let key = ConnectionKey::new("mqtt://host");
        assert!(matches!(
            services.create_transport(&key),
            Err(PoolError::UnsupportedScheme(_))
        ));
        assert!(services.create_transport(&ConnectionKey::new("memory://x")).is_ok());
    }
}
