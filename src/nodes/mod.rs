//! Built-in node kinds.

mod batch;
mod catch;
mod debug;
mod function;
mod mqtt;

use std::sync::Arc;

use async_trait::async_trait;

use crate::flow::{DeployError, FlowDefinition, NodeConfig, NodeKind};
use crate::message::Message;
use crate::node::{Done, NodeContext, NodeError, NodeHandler};

pub use batch::BatchNode;
pub use catch::CatchNode;
pub use debug::DebugNode;
pub use function::FunctionNode;
pub use mqtt::{MqttInNode, MqttOutNode};

/// Build the handler of `node`. Compile and configuration errors fail the
/// deploy; an unresolvable broker does not (the node reports it instead).
pub fn build_handler(
    flow: &FlowDefinition,
    node: &NodeConfig,
    ctx: &NodeContext,
) -> Result<Arc<dyn NodeHandler>, DeployError> {
    let handler: Arc<dyn NodeHandler> = match &node.kind {
        NodeKind::Function(cfg) => Arc::new(FunctionNode::new(cfg, ctx).map_err(|error| DeployError::Compile {
            node: node.id.clone(),
            error,
        })?),
        NodeKind::Batch(cfg) => Arc::new(BatchNode::new(cfg, ctx).map_err(|e| DeployError::config(&node.id, e))?),
        NodeKind::MqttIn(cfg) => Arc::new(MqttInNode::new(cfg.clone(), flow.broker(&cfg.broker).cloned())),
        NodeKind::MqttOut(cfg) => Arc::new(MqttOutNode::new(cfg.clone(), flow.broker(&cfg.broker).cloned())),
        NodeKind::MqttBroker(_) => Arc::new(ConfigNode),
        NodeKind::Debug(cfg) => Arc::new(DebugNode::new(cfg.clone())),
        NodeKind::Catch(_) => Arc::new(CatchNode),
    };
    Ok(handler)
}

/// Handler of config nodes. They never receive input.
struct ConfigNode;

#[async_trait]
impl NodeHandler for ConfigNode {
    async fn on_input(&self, _ctx: &NodeContext, _msg: Message, done: Done) -> Result<(), NodeError> {
        done.ok();
        Ok(())
    }
}
