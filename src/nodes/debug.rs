use async_trait::async_trait;
use serde_json::{Value, json};

use crate::context::encode;
use crate::flow::DebugConfig;
use crate::logger::LogLevel;
use crate::message::Message;
use crate::node::{Done, NodeContext, NodeError, NodeHandler};

/// Publishes a message property, or the whole message, on the `debug` topic.
#[derive(Debug)]
pub struct DebugNode {
    cfg: DebugConfig,
}

impl DebugNode {
    pub fn new(cfg: DebugConfig) -> Self {
        Self { cfg }
    }

    fn pick(&self, msg: &Message) -> Value {
        if self.cfg.complete {
            return msg.clone().into_value();
        }
        let mut keys = self.cfg.property.split('.');
        let mut value = keys.next().and_then(|key| msg.get(key));
        for key in keys {
            value = value.and_then(|v| v.get(key));
        }
        value.cloned().unwrap_or(Value::Null)
    }
}

#[async_trait]
impl NodeHandler for DebugNode {
    async fn on_input(&self, ctx: &NodeContext, msg: Message, done: Done) -> Result<(), NodeError> {
        let value = self.pick(&msg);
        let encoded = encode(&value);
        ctx.log(LogLevel::Debug, &value.to_string());
        ctx.comms().publish(
            "debug",
            json!({
                "id": ctx.id(),
                "name": ctx.name(),
                "flow": ctx.flow_id(),
                "topic": msg.topic(),
                "property": if self.cfg.complete { "msg" } else { self.cfg.property.as_str() },
                "msg": encoded.msg,
                "format": encoded.format,
                "_msgid": msg.msgid(),
            }),
            false,
        );
        done.ok();
        Ok(())
    }
}
