//! Objects exposed to scripts: `node`, the three context accessors and `env`.

use rhai::{Array, Dynamic, Engine, EvalAltResult, Map};
use serde_json::Value;

use crate::context::ScopedContext;
use crate::logger::LogLevel;
use crate::message::Message;
use crate::node::{NodeContext, NodeError, NodeStatus};

use super::normalize;

type ScriptResult<T> = Result<T, Box<EvalAltResult>>;

/// The `node` object of a script.
#[derive(Clone)]
pub struct ScriptNode {
    ctx: NodeContext,
    outputs: usize,
    msgid: Option<String>,
    can_send: bool,
}

impl ScriptNode {
    pub(crate) fn new(ctx: NodeContext, outputs: usize, msgid: Option<String>, can_send: bool) -> Self {
        Self {
            ctx,
            outputs,
            msgid,
            can_send,
        }
    }

    fn send(&mut self, value: Dynamic) -> ScriptResult<()> {
        if !self.can_send {
            return Err("node.send is not available here".into());
        }
        let (outputs, rejected) = normalize(value, self.msgid.as_deref());
        if let Some(type_name) = rejected.first() {
            return Err(format!("node.send: cannot send a value of type {type_name}").into());
        }
        if outputs.iter().any(|port| !port.is_empty()) {
            self.ctx.send(outputs);
        }
        Ok(())
    }

    fn status(&mut self, status: Map) -> ScriptResult<()> {
        let status: NodeStatus = rhai::serde::from_dynamic(&Dynamic::from_map(status))?;
        self.ctx.status(status);
        Ok(())
    }

    fn report(&mut self, text: &str, msg: Map) -> ScriptResult<()> {
        let value: serde_json::Map<String, Value> = rhai::serde::from_dynamic(&Dynamic::from_map(msg))?;
        self.ctx
            .report_error(NodeError::Runtime(text.to_string()), Some(&Message::from_map(value)));
        Ok(())
    }
}

/// A context accessor (`node_ctx`, `flow_ctx`, `global_ctx`).
#[derive(Clone)]
pub struct ScriptContext(ScopedContext);

impl ScriptContext {
    pub(crate) fn new(scoped: ScopedContext) -> Self {
        Self(scoped)
    }

    fn get(&mut self, key: &str, store: Option<&str>) -> ScriptResult<Dynamic> {
        match self.0.get(key, store).map_err(|e| e.to_string())? {
            Some(value) => rhai::serde::to_dynamic(value),
            None => Ok(Dynamic::UNIT),
        }
    }

    fn set(&mut self, key: &str, value: Dynamic, store: Option<&str>) -> ScriptResult<()> {
        let value = if value.is_unit() {
            None
        } else {
            Some(rhai::serde::from_dynamic::<Value>(&value)?)
        };
        self.0.set(key, value, store).map_err(|e| e.to_string().into())
    }

    fn keys(&mut self, store: Option<&str>) -> ScriptResult<Array> {
        let keys = self.0.keys(store).map_err(|e| e.to_string())?;
        Ok(keys.into_iter().map(Dynamic::from).collect())
    }
}

/// The `env` object of a script.
#[derive(Clone)]
pub struct ScriptEnv(NodeContext);

impl ScriptEnv {
    pub(crate) fn new(ctx: NodeContext) -> Self {
        Self(ctx)
    }
}

fn log(node: &mut ScriptNode, level: LogLevel, text: &str) {
    node.ctx.log(level, text);
}

/// Register the script-facing types on `engine`.
pub(crate) fn register(engine: &mut Engine) {
    engine
        .register_type_with_name::<ScriptNode>("Node")
        .register_get("id", |n: &mut ScriptNode| n.ctx.id().to_string())
        .register_get("name", |n: &mut ScriptNode| match n.ctx.name() {
            Some(name) => Dynamic::from(name.to_string()),
            None => Dynamic::UNIT,
        })
        .register_get("outputs", |n: &mut ScriptNode| n.outputs as i64)
        .register_fn("log", |n: &mut ScriptNode, text: &str| log(n, LogLevel::Info, text))
        .register_fn("warn", |n: &mut ScriptNode, text: &str| log(n, LogLevel::Warn, text))
        .register_fn("error", |n: &mut ScriptNode, text: &str| log(n, LogLevel::Error, text))
        .register_fn("error", |n: &mut ScriptNode, text: &str, msg: Map| n.report(text, msg))
        .register_fn("trace", |n: &mut ScriptNode, text: &str| log(n, LogLevel::Trace, text))
        .register_fn("status", ScriptNode::status)
        .register_fn("send", ScriptNode::send);

    engine
        .register_type_with_name::<ScriptContext>("Context")
        .register_fn("get", |c: &mut ScriptContext, key: &str| c.get(key, None))
        .register_fn("get", |c: &mut ScriptContext, key: &str, store: &str| c.get(key, Some(store)))
        .register_fn("set", |c: &mut ScriptContext, key: &str, value: Dynamic| c.set(key, value, None))
        .register_fn("set", |c: &mut ScriptContext, key: &str, value: Dynamic, store: &str| {
            c.set(key, value, Some(store))
        })
        .register_fn("keys", |c: &mut ScriptContext| c.keys(None))
        .register_fn("keys", |c: &mut ScriptContext, store: &str| c.keys(Some(store)));

    engine
        .register_type_with_name::<ScriptEnv>("Env")
        .register_fn("get", |e: &mut ScriptEnv, name: &str| match e.0.env(name) {
            Some(value) => Dynamic::from(value),
            None => Dynamic::UNIT,
        });
}
