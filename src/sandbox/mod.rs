//! Sandboxed execution of user scripts for `function` nodes.
//!
//! Scripts are Rhai. Each run sees a fresh scope holding `msg`, `node`,
//! `node_ctx`, `flow_ctx`, `global_ctx` and `env`; module imports and `eval`
//! are disabled. The value a script returns is turned into port outputs:
//!
//! - `()` sends nothing
//! - a map goes to port 0
//! - an array holds one entry per port, each `()`, a map, or an array of maps
//!
//! Timers created with `set_timeout`/`set_interval` belong to the node and
//! are cancelled by [`ExecutionHost::shutdown`]. A run still in progress when
//! the node stops is aborted at its next operation.

mod api;
mod timers;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rhai::{AST, Dynamic, Engine, EvalAltResult, FnPtr, Position, Scope};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::Settings;
use crate::logger::LogLevel;
use crate::message::Message;
use crate::node::{NodeContext, NodeError, Outputs};

pub use api::{ScriptContext, ScriptEnv, ScriptNode};
pub use timers::TimerRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SandboxError {
    #[error("{message}{}", location(*line, *column))]
    Compile {
        node_id: String,
        message: String,
        line: Option<usize>,
        column: Option<usize>,
    },
    #[error("{message}")]
    Runtime { node_id: String, message: String },
    #[error("Function tried to send a message of type {type_name}")]
    NonMessage { node_id: String, type_name: String },
}

fn location(line: Option<usize>, column: Option<usize>) -> String {
    match (line, column) {
        (Some(line), Some(column)) => format!(" (line {line}, column {column})"),
        (Some(line), None) => format!(" (line {line})"),
        _ => String::new(),
    }
}

impl SandboxError {
    pub fn node_id(&self) -> &str {
        match self {
            SandboxError::Compile { node_id, .. }
            | SandboxError::Runtime { node_id, .. }
            | SandboxError::NonMessage { node_id, .. } => node_id,
        }
    }
}

impl From<SandboxError> for NodeError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::Compile { .. } => NodeError::Compile(err.to_string()),
            other => NodeError::Runtime(other.to_string()),
        }
    }
}

/// Resource bounds applied to every run.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxLimits {
    /// 0 means unlimited.
    pub max_operations: u64,
    pub max_call_levels: usize,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
    /// Wall-clock limit of one run.
    pub timeout: Option<Duration>,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_operations: 0,
            max_call_levels: 64,
            max_string_size: 16 * 1024 * 1024,
            max_array_size: 100_000,
            max_map_size: 100_000,
            timeout: None,
        }
    }
}

impl SandboxLimits {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_operations: settings.function_max_operations,
            timeout: settings.function_timeout_ms.filter(|ms| *ms > 0).map(Duration::from_millis),
            ..Self::default()
        }
    }
}

/// What one run produced. `rejected` lists outputs that were not messages;
/// they are reported but do not stop the others from being sent.
#[derive(Debug, Default)]
pub struct RunOutput {
    pub outputs: Outputs,
    pub rejected: Vec<SandboxError>,
}

/// Compiles and runs user code on behalf of one node.
pub trait ExecutionHost: Send + Sync {
    type Unit: Send + Sync;

    fn compile(&self, source: &str) -> Result<Self::Unit, SandboxError>;

    /// Run `unit` with `msg` in scope. `None` runs without a message, as
    /// setup code does. Blocks until the script returns; async callers go
    /// through [`run_blocking`].
    fn run(&self, unit: &Self::Unit, msg: Option<&Message>) -> Result<RunOutput, SandboxError>;

    /// Cancel every timer of the node.
    fn shutdown(&self);
}

/// Run a script on the blocking pool so a long run never stalls the async
/// workers.
pub async fn run_blocking<H>(host: &H, unit: &H::Unit, msg: Option<Message>) -> Result<RunOutput, NodeError>
where
    H: ExecutionHost + Clone + 'static,
    H::Unit: Clone + 'static,
{
    let host = host.clone();
    let unit = unit.clone();
    tokio::task::spawn_blocking(move || host.run(&unit, msg.as_ref()))
        .await
        .map_err(|e| NodeError::Runtime(format!("script run did not finish: {e}")))?
        .map_err(NodeError::from)
}

/// A compiled script.
#[derive(Debug, Clone)]
pub struct CompiledUnit {
    ast: Arc<AST>,
}

struct HostShared {
    ctx: NodeContext,
    outputs: usize,
    engine: Engine,
    timers: Arc<TimerRegistry>,
    exec: Mutex<()>,
    deadline: Arc<Mutex<Option<Instant>>>,
    stop: Option<CancellationToken>,
    limits: SandboxLimits,
    can_send: bool,
}

/// Rhai execution host bound to one node.
#[derive(Clone)]
pub struct RhaiHost {
    shared: Arc<HostShared>,
}

impl std::fmt::Debug for RhaiHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RhaiHost")
            .field("node", &self.shared.ctx.id())
            .field("timers", &self.shared.timers)
            .finish()
    }
}

impl RhaiHost {
    pub fn new(ctx: NodeContext, outputs: usize, limits: SandboxLimits) -> Self {
        let stop = ctx.token().clone();
        Self::build(ctx, outputs, limits, true, Some(stop))
    }

    /// A host whose scripts cannot call `node.send`; used for teardown code,
    /// which runs after the node stopped and so is only bounded by `limits`.
    pub fn without_send(ctx: NodeContext, outputs: usize, limits: SandboxLimits) -> Self {
        Self::build(ctx, outputs, limits, false, None)
    }

    fn build(
        ctx: NodeContext,
        outputs: usize,
        limits: SandboxLimits,
        can_send: bool,
        stop: Option<CancellationToken>,
    ) -> Self {
        let timers = Arc::new(TimerRegistry::new());
        let deadline = Arc::new(Mutex::new(None));
        let mut engine = Engine::new();

        // 1. Bounds and isolation
        engine
            .set_max_operations(limits.max_operations)
            .set_max_call_levels(limits.max_call_levels)
            .set_max_string_size(limits.max_string_size)
            .set_max_array_size(limits.max_array_size)
            .set_max_map_size(limits.max_map_size)
            .set_module_resolver(rhai::module_resolvers::DummyModuleResolver::new());
        engine.disable_symbol("eval");

        let watch = deadline.clone();
        let stopping = stop.clone();
        engine.on_progress(move |_| {
            if stopping.as_ref().is_some_and(CancellationToken::is_cancelled) {
                return Some(Dynamic::UNIT);
            }
            match watch.lock() {
                Ok(deadline) if deadline.is_some_and(|at| Instant::now() >= at) => Some(Dynamic::UNIT),
                _ => None,
            }
        });

        // 2. print/debug go to the node log
        let printer = ctx.clone();
        engine.on_print(move |text| printer.log(LogLevel::Info, text));
        let debugger = ctx.clone();
        engine.on_debug(move |text, _source, _pos| debugger.log(LogLevel::Debug, text));

        // 3. Script API
        api::register(&mut engine);
        let t = timers.clone();
        engine.register_fn("set_timeout", move |f: FnPtr, ms: i64| t.schedule(f, ms, false));
        let t = timers.clone();
        engine.register_fn("set_interval", move |f: FnPtr, ms: i64| t.schedule(f, ms, true));
        let t = timers.clone();
        engine.register_fn("clear_timeout", move |id: i64| t.clear(id));
        let t = timers.clone();
        engine.register_fn("clear_interval", move |id: i64| t.clear(id));

        Self {
            shared: Arc::new(HostShared {
                ctx,
                outputs,
                engine,
                timers,
                exec: Mutex::new(()),
                deadline,
                stop,
                limits,
                can_send,
            }),
        }
    }

    pub fn timers(&self) -> &Arc<TimerRegistry> {
        &self.shared.timers
    }
}

impl ExecutionHost for RhaiHost {
    type Unit = CompiledUnit;

    fn compile(&self, source: &str) -> Result<CompiledUnit, SandboxError> {
        let ast = self.shared.engine.compile(source).map_err(|err| SandboxError::Compile {
            node_id: self.shared.ctx.id().to_string(),
            message: err.0.to_string(),
            line: err.1.line(),
            column: err.1.position(),
        })?;
        Ok(CompiledUnit { ast: Arc::new(ast) })
    }

    #[tracing::instrument(name = "sandbox_run", skip_all, fields(node = %self.shared.ctx.id()))]
    fn run(&self, unit: &CompiledUnit, msg: Option<&Message>) -> Result<RunOutput, SandboxError> {
        let shared = &self.shared;
        let msgid = msg.and_then(Message::msgid).map(str::to_string);
        let mut scope = shared.scope(msgid.clone());
        if let Some(msg) = msg {
            let value = rhai::serde::to_dynamic(msg.as_map()).map_err(|e| shared.runtime_error(e.to_string()))?;
            scope.push_dynamic("msg", value);
        }

        let result = shared.eval(|engine| engine.eval_ast_with_scope::<Dynamic>(&mut scope, &unit.ast));
        shared.arm(&unit.ast);
        let value = result?;

        let (outputs, rejected) = normalize(value, msgid.as_deref());
        trace!(ports = outputs.len(), "script returned");
        Ok(RunOutput {
            outputs,
            rejected: rejected
                .into_iter()
                .map(|type_name| SandboxError::NonMessage {
                    node_id: shared.ctx.id().to_string(),
                    type_name: type_name.to_string(),
                })
                .collect(),
        })
    }

    fn shutdown(&self) {
        let active = self.shared.timers.active_count();
        self.shared.timers.cancel_all();
        if active > 0 {
            debug!(node = %self.shared.ctx.id(), active, "script timers cancelled");
        }
    }
}

impl HostShared {
    fn scope(&self, msgid: Option<String>) -> Scope<'static> {
        let mut scope = Scope::new();
        scope.push("node", ScriptNode::new(self.ctx.clone(), self.outputs, msgid, self.can_send));
        scope.push("node_ctx", ScriptContext::new(self.ctx.context().clone()));
        scope.push("flow_ctx", ScriptContext::new(self.ctx.flow_context().clone()));
        scope.push("global_ctx", ScriptContext::new(self.ctx.global_context().clone()));
        scope.push("env", ScriptEnv::new(self.ctx.clone()));
        scope
    }

    fn runtime_error(&self, message: String) -> SandboxError {
        SandboxError::Runtime {
            node_id: self.ctx.id().to_string(),
            message,
        }
    }

    /// Run `f` exclusively, under the wall-clock limit.
    fn eval<T>(&self, f: impl FnOnce(&Engine) -> Result<T, Box<EvalAltResult>>) -> Result<T, SandboxError> {
        let _running = self.exec.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Ok(mut deadline) = self.deadline.lock() {
            *deadline = self.limits.timeout.map(|t| Instant::now() + t);
        }
        let result = f(&self.engine);
        if let Ok(mut deadline) = self.deadline.lock() {
            *deadline = None;
        }
        result.map_err(|err| {
            let terminated = matches!(*err, EvalAltResult::ErrorTerminated(..));
            let stopped = self.stop.as_ref().is_some_and(CancellationToken::is_cancelled);
            let message = match self.limits.timeout {
                _ if terminated && stopped => "Script execution aborted: node stopped".to_string(),
                Some(timeout) if terminated => {
                    format!("Script execution timed out after {}ms", timeout.as_millis())
                }
                _ => describe(err, Position::NONE),
            };
            self.runtime_error(message)
        })
    }

    /// Start the timers scheduled by the last run.
    fn arm(self: &Arc<Self>, ast: &Arc<AST>) {
        let tracker = self.ctx.tracker().clone();
        self.timers.arm(self.ctx.token(), |timer, token| {
            let shared = self.clone();
            let ast = ast.clone();
            tracker.spawn(async move {
                if timer.repeat {
                    let start = tokio::time::Instant::now() + timer.delay;
                    let mut ticks = tokio::time::interval_at(start, timer.delay);
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = ticks.tick() => shared.clone().fire_blocking(ast.clone(), timer.callback.clone()).await,
                        }
                    }
                } else {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep(timer.delay) => {
                            shared.timers.finish(timer.id);
                            shared.fire_blocking(ast, timer.callback).await;
                        }
                    }
                }
            });
        });
    }

    async fn fire_blocking(self: Arc<Self>, ast: Arc<AST>, callback: FnPtr) {
        let node = self.ctx.id().to_string();
        if let Err(e) = tokio::task::spawn_blocking(move || self.fire(&ast, &callback)).await {
            warn!(%node, error = %e, "timer callback did not finish");
        }
    }

    fn fire(self: &Arc<Self>, ast: &Arc<AST>, callback: &FnPtr) {
        if !self.ctx.is_alive() {
            return;
        }
        let result = self.eval(|engine| callback.call::<Dynamic>(engine, ast, ()));
        self.arm(ast);
        if let Err(err) = result {
            self.ctx.report_error(err.into(), None);
        }
    }
}

/// Error text of the innermost located frame, with its position appended.
fn describe(err: Box<EvalAltResult>, outer: Position) -> String {
    match *err {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, pos) => {
            let fallback = if pos.is_none() { outer } else { pos };
            describe(inner, fallback)
        }
        mut other => {
            let mut pos = other.take_position();
            if pos.is_none() {
                pos = outer;
            }
            format!("{other}{}", location(pos.line(), pos.position()))
        }
    }
}

/// Turn a script value into port outputs, stamping `msgid` on every message.
/// Returns the type names of entries that were not messages.
pub(crate) fn normalize(value: Dynamic, msgid: Option<&str>) -> (Outputs, Vec<&'static str>) {
    let mut rejected = Vec::new();
    let value = value.flatten();
    if value.is_unit() {
        return (Vec::new(), rejected);
    }
    let entries = if value.is_array() {
        value.into_array().unwrap_or_default()
    } else {
        vec![value]
    };
    let ports = entries
        .into_iter()
        .map(|entry| {
            let entry = entry.flatten();
            if entry.is_array() {
                entry
                    .into_array()
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|item| to_message(item, msgid, &mut rejected))
                    .collect()
            } else {
                to_message(entry, msgid, &mut rejected).into_iter().collect()
            }
        })
        .collect();
    (ports, rejected)
}

fn to_message(value: Dynamic, msgid: Option<&str>, rejected: &mut Vec<&'static str>) -> Option<Message> {
    let value = value.flatten();
    if value.is_unit() {
        return None;
    }
    if !value.is_map() {
        rejected.push(value.type_name());
        return None;
    }
    match rhai::serde::from_dynamic::<serde_json::Map<String, serde_json::Value>>(&value) {
        Ok(map) => {
            let mut msg = Message::from_map(map);
            if let Some(id) = msgid {
                msg.set_msgid(id);
            }
            Some(msg)
        }
        Err(_) => {
            rejected.push(value.type_name());
            None
        }
    }
}
