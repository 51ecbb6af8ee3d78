use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use super::{CatchConfig, DeployError, FlowDefinition, MAX_ERROR_LOOP, NodeKind};
use crate::logger::RUNTIME_TARGET;
use crate::message::Message;
use crate::node::{Dispatch, Done, NodeContext, NodeError, NodeHandler, NodeInfo, NodeStatus, Outputs, RuntimeServices};
use crate::nodes;

/// Routes what nodes emit along the flow's wires and errors to catch nodes.
struct FlowRouter {
    flow_id: String,
    services: Arc<RuntimeServices>,
    wires: HashMap<String, Vec<Vec<String>>>,
    inboxes: HashMap<String, mpsc::UnboundedSender<Message>>,
    catches: Vec<(String, CatchConfig)>,
}

impl FlowRouter {
    fn deliver(&self, target: &str, msg: Message) {
        match self.inboxes.get(target) {
            Some(inbox) => {
                if inbox.send(msg).is_err() {
                    trace!(flow = %self.flow_id, node = target, "inbox closed, message dropped");
                }
            }
            None => warn!(flow = %self.flow_id, node = target, "no inbox for node"),
        }
    }

    /// The error channel of last resort: log plus a `debug` bus event.
    fn surface(&self, source: &NodeInfo, error: &NodeError, msg: Option<&Message>) {
        error!(
            target: RUNTIME_TARGET,
            flow = %self.flow_id,
            node = %source.id,
            node_type = %source.type_name,
            %error,
            "unhandled node error"
        );
        let mut event = json!({
            "level": "error",
            "id": source.id,
            "type": source.type_name,
            "flow": self.flow_id,
            "msg": error.to_string(),
        });
        if let (Some(name), Some(map)) = (&source.name, event.as_object_mut()) {
            map.insert("name".into(), json!(name));
        }
        if let (Some(id), Some(map)) = (msg.and_then(Message::msgid), event.as_object_mut()) {
            map.insert("_msgid".into(), json!(id));
        }
        self.services.comms.publish("debug", event, false);
    }
}

/// How many times this message already bounced off `source` through a
/// catch node.
fn previous_catches(msg: Option<&Message>, source: &str) -> Option<u64> {
    let origin = msg?.get("error")?.get("source")?;
    if origin.get("id")?.as_str()? != source {
        return None;
    }
    Some(origin.get("count").and_then(Value::as_u64).unwrap_or(0))
}

impl Dispatch for FlowRouter {
    fn route(&self, source: &NodeInfo, outputs: Outputs) {
        let Some(ports) = self.wires.get(&source.id) else {
            return;
        };
        for (port, msgs) in outputs.into_iter().enumerate() {
            let Some(targets) = ports.get(port).filter(|t| !t.is_empty()) else {
                continue;
            };
            for mut msg in msgs {
                msg.ensure_msgid();
                let last = targets.len() - 1;
                for target in &targets[..last] {
                    self.deliver(target, msg.clone());
                }
                self.deliver(&targets[last], msg);
            }
        }
    }

    fn report_error(&self, source: &NodeInfo, error: &NodeError, msg: Option<&Message>) {
        let count = match previous_catches(msg, &source.id) {
            Some(previous) if previous + 1 >= MAX_ERROR_LOOP => {
                warn!(flow = %self.flow_id, node = %source.id, "message exceeded maximum number of catches");
                return;
            }
            Some(previous) => previous + 1,
            None => 1,
        };

        let mut handled = false;
        for (catch_id, cfg) in &self.catches {
            if catch_id == &source.id || !cfg.covers(&source.id) {
                continue;
            }
            let mut caught = msg.cloned().unwrap_or_default();
            caught.ensure_msgid();
            if let Some(previous) = caught.remove("error") {
                caught.set("_error", previous);
            }
            caught.set(
                "error",
                json!({
                    "message": error.to_string(),
                    "source": {
                        "id": source.id,
                        "type": source.type_name,
                        "name": source.name,
                        "count": count,
                    },
                }),
            );
            self.deliver(catch_id, caught);
            handled = true;
        }
        if !handled {
            self.surface(source, error, msg);
        }
    }
}

struct ActiveNode {
    ctx: NodeContext,
    handler: Arc<dyn NodeHandler>,
}

/// A deployed flow: its nodes, their workers and the router between them.
pub struct ActiveFlow {
    definition: FlowDefinition,
    router: Arc<FlowRouter>,
    nodes: HashMap<String, ActiveNode>,
    token: CancellationToken,
    tracker: TaskTracker,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for ActiveFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveFlow")
            .field("id", &self.definition.id)
            .field("nodes", &self.nodes.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl ActiveFlow {
    /// Instantiate and start every node of `definition`.
    #[tracing::instrument(name = "flow_start", skip_all, fields(flow = %definition.id))]
    pub(crate) async fn start(
        definition: FlowDefinition,
        services: Arc<RuntimeServices>,
    ) -> Result<Arc<ActiveFlow>, DeployError> {
        // 1. Structure
        definition.validate()?;

        // 2. Inboxes and the router
        let mut inboxes = HashMap::new();
        let mut receivers = HashMap::new();
        for node in definition.nodes.iter().filter(|n| !n.kind.is_config()) {
            let (tx, rx) = mpsc::unbounded_channel();
            inboxes.insert(node.id.clone(), tx);
            receivers.insert(node.id.clone(), rx);
        }
        let catches = definition
            .nodes
            .iter()
            .filter_map(|n| match &n.kind {
                NodeKind::Catch(cfg) => Some((n.id.clone(), cfg.clone())),
                _ => None,
            })
            .collect();
        let router = Arc::new(FlowRouter {
            flow_id: definition.id.clone(),
            services: services.clone(),
            wires: definition
                .nodes
                .iter()
                .map(|n| (n.id.clone(), n.wires.clone()))
                .collect(),
            inboxes,
            catches,
        });
        let dispatch: Arc<dyn Dispatch> = router.clone();

        // 3. Handlers
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let env: Arc<Vec<(String, String)>> =
            Arc::new(definition.env.iter().map(|e| (e.name.clone(), e.value.clone())).collect());
        let mut nodes = HashMap::new();
        for node in &definition.nodes {
            let info = NodeInfo {
                id: node.id.clone(),
                type_name: node.kind.type_name().to_string(),
                name: node.name.clone(),
                flow_id: definition.id.clone(),
            };
            let ctx = NodeContext::new(
                info,
                services.clone(),
                Arc::downgrade(&dispatch),
                env.clone(),
                token.child_token(),
                tracker.clone(),
            );
            let handler = match nodes::build_handler(&definition, node, &ctx) {
                Ok(handler) => handler,
                Err(err) => {
                    token.cancel();
                    return Err(err);
                }
            };
            nodes.insert(node.id.clone(), ActiveNode { ctx, handler });
        }

        let flow = Arc::new(ActiveFlow {
            definition,
            router,
            nodes,
            token,
            tracker,
            workers: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        });

        // 4. Start every node, then accept input
        for node in &flow.definition.nodes {
            let Some(active) = flow.nodes.get(&node.id) else {
                continue;
            };
            if let Err(err) = active.handler.start(&active.ctx).await {
                active.ctx.report_error(err, None);
            }
        }
        let watchdog = Duration::from_millis(services.settings.done_watchdog_ms);
        let mut workers = Vec::new();
        for (id, rx) in receivers {
            if let Some(active) = flow.nodes.get(&id) {
                let ctx = active.ctx.clone();
                let handler = active.handler.clone();
                workers.push(flow.tracker.spawn(run_worker(ctx, handler, rx, watchdog)));
            }
        }
        if let Ok(mut slot) = flow.workers.lock() {
            *slot = workers;
        }

        info!(flow = %flow.id(), nodes = flow.nodes.len(), "flow started");
        Ok(flow)
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn definition(&self) -> &FlowDefinition {
        &self.definition
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.definition.nodes.iter().map(|n| n.id.clone()).collect()
    }

    /// The runtime context of `node_id`.
    pub fn node_context(&self, node_id: &str) -> Option<&NodeContext> {
        self.nodes.get(node_id).map(|n| &n.ctx)
    }

    pub fn status(&self, node_id: &str) -> Option<NodeStatus> {
        self.node_context(node_id).map(NodeContext::current_status)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Deliver an external event to a node's input.
    pub fn inject(&self, node_id: &str, mut msg: Message) -> Result<(), NodeError> {
        if self.is_stopped() {
            return Err(NodeError::InvalidInput(format!("flow `{}` is stopped", self.id())));
        }
        if !self.router.inboxes.contains_key(node_id) {
            return Err(NodeError::InvalidInput(format!("node `{node_id}` takes no input")));
        }
        msg.ensure_msgid();
        self.router.deliver(node_id, msg);
        Ok(())
    }

    /// Stop every node and wait until all of their work has settled.
    #[tracing::instrument(name = "flow_stop", skip_all, fields(flow = %self.id()))]
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        // 1. Nothing new starts
        self.token.cancel();
        let workers = self.workers.lock().map(|mut w| std::mem::take(&mut *w)).unwrap_or_default();
        for result in join_all(workers).await {
            if let Err(e) = result {
                warn!(flow = %self.id(), error = %e, "node worker ended abnormally");
            }
        }

        // 2. Close handlers, downstream first
        for id in self.definition.close_order() {
            if let Some(node) = self.nodes.get(&id) {
                node.handler.close(&node.ctx).await;
                trace!(flow = %self.id(), node = %id, "node closed");
            }
        }

        // 3. Wait for timers, watchdogs and pending sends
        self.tracker.close();
        self.tracker.wait().await;

        // 4. Clear statuses
        for node in self.nodes.values() {
            node.ctx.status(NodeStatus::clear());
        }
        info!(flow = %self.id(), "flow stopped");
    }
}

async fn run_worker(
    ctx: NodeContext,
    handler: Arc<dyn NodeHandler>,
    mut inbox: mpsc::UnboundedReceiver<Message>,
    watchdog: Duration,
) {
    loop {
        let msg = tokio::select! {
            _ = ctx.cancelled() => break,
            msg = inbox.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        let (done, completed) = Done::new(&ctx, &msg);
        if !watchdog.is_zero() {
            let node = ctx.id().to_string();
            let msgid = msg.msgid().unwrap_or_default().to_string();
            ctx.spawn(async move {
                if tokio::time::timeout(watchdog, completed).await.is_err() {
                    warn!(%node, %msgid, "input not completed after {}ms", watchdog.as_millis());
                }
            });
        }
        let copy = msg.clone();
        if let Err(err) = handler.on_input(&ctx, msg, done).await {
            ctx.report_error(err, Some(&copy));
        }
    }
    debug!(node = %ctx.id(), "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::tests::{info, services};

    fn router() -> (FlowRouter, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let router = FlowRouter {
            flow_id: "f1".into(),
            services: services(),
            wires: HashMap::new(),
            inboxes: HashMap::from([("catcher".to_string(), tx)]),
            catches: vec![("catcher".into(), CatchConfig::default())],
        };
        (router, rx)
    }

    fn bounced(count: u64) -> Message {
        let mut msg = Message::with_payload(json!(1));
        msg.set("error", json!({"message": "x", "source": {"id": "fn", "type": "function", "count": count}}));
        msg
    }

    #[test]
    fn test_catch_count_increments_until_loop_guard() {
        let (router, mut rx) = router();
        let source = info("fn", "function");
        let error = NodeError::Runtime("again".into());

        router.report_error(&source, &error, Some(&bounced(3)));
        let caught = rx.try_recv().unwrap();
        assert_eq!(caught.get("error").unwrap()["source"]["count"], json!(4));
        assert_eq!(caught.get("_error").unwrap()["source"]["count"], json!(3));

        router.report_error(&source, &error, Some(&bounced(MAX_ERROR_LOOP - 1)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_error_from_other_source_restarts_count() {
        let (router, mut rx) = router();
        router.report_error(&info("other", "function"), &NodeError::Runtime("e".into()), Some(&bounced(9)));
        let caught = rx.try_recv().unwrap();
        assert_eq!(caught.get("error").unwrap()["source"]["count"], json!(1));
        assert_eq!(caught.get("error").unwrap()["source"]["id"], json!("other"));
    }

    #[tokio::test]
    async fn test_inject_rejects_unknown_and_stopped() {
        let definition = FlowDefinition::from_json_str(
            r#"{"id": "f1", "nodes": [{"id": "dbg", "type": "debug"}]}"#,
        )
        .unwrap();
        let flow = ActiveFlow::start(definition, services()).await.unwrap();
        assert!(flow.inject("dbg", Message::new()).is_ok());
        assert!(matches!(flow.inject("ghost", Message::new()), Err(NodeError::InvalidInput(_))));

        flow.stop().await;
        assert!(flow.is_stopped());
        assert!(matches!(flow.inject("dbg", Message::new()), Err(NodeError::InvalidInput(_))));
    }
}
