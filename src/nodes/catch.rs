use async_trait::async_trait;

use crate::message::Message;
use crate::node::{Done, NodeContext, NodeError, NodeHandler};

/// Forwards the errors routed to it. The router has already attached
/// `msg.error`.
#[derive(Debug, Default)]
pub struct CatchNode;

#[async_trait]
impl NodeHandler for CatchNode {
    async fn on_input(&self, ctx: &NodeContext, msg: Message, done: Done) -> Result<(), NodeError> {
        ctx.send_one(msg);
        done.ok();
        Ok(())
    }
}
