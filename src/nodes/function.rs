use async_trait::async_trait;
use tracing::{error, warn};

use crate::flow::FunctionConfig;
use crate::message::Message;
use crate::node::{Done, NodeContext, NodeError, NodeHandler};
use crate::sandbox::{CompiledUnit, ExecutionHost, RhaiHost, SandboxError, SandboxLimits, run_blocking};

/// Runs a user script for every input.
///
/// `initialize` runs once when the flow starts and may send; `finalize` runs
/// when the node closes and may not.
#[derive(Debug)]
pub struct FunctionNode {
    host: RhaiHost,
    unit: CompiledUnit,
    setup: Option<CompiledUnit>,
    teardown: Option<(RhaiHost, CompiledUnit)>,
}

impl FunctionNode {
    pub fn new(cfg: &FunctionConfig, ctx: &NodeContext) -> Result<Self, SandboxError> {
        let mut limits = SandboxLimits::from_settings(ctx.settings());
        if let Some(timeout) = cfg.run_timeout() {
            limits.timeout = Some(timeout);
        }

        let host = RhaiHost::new(ctx.clone(), cfg.outputs, limits.clone());
        let unit = host.compile(&cfg.func)?;
        let setup = match blank(&cfg.initialize) {
            Some(source) => Some(host.compile(source)?),
            None => None,
        };
        let teardown = match blank(&cfg.finalize) {
            Some(source) => {
                let host = RhaiHost::without_send(ctx.clone(), cfg.outputs, limits);
                let unit = host.compile(source)?;
                Some((host, unit))
            }
            None => None,
        };
        Ok(Self {
            host,
            unit,
            setup,
            teardown,
        })
    }

    /// Timers currently held by the node's scripts.
    pub fn active_timers(&self) -> usize {
        self.host.timers().active_count()
            + self
                .teardown
                .as_ref()
                .map(|(host, _)| host.timers().active_count())
                .unwrap_or_default()
    }
}

fn blank(source: &Option<String>) -> Option<&str> {
    source.as_deref().filter(|s| !s.trim().is_empty())
}

#[async_trait]
impl NodeHandler for FunctionNode {
    async fn start(&self, ctx: &NodeContext) -> Result<(), NodeError> {
        let Some(setup) = &self.setup else {
            return Ok(());
        };
        let out = run_blocking(&self.host, setup, None).await?;
        if out.outputs.iter().any(|port| !port.is_empty()) {
            ctx.send(out.outputs);
        }
        Ok(())
    }

    async fn on_input(&self, ctx: &NodeContext, msg: Message, done: Done) -> Result<(), NodeError> {
        match run_blocking(&self.host, &self.unit, Some(msg.clone())).await {
            Ok(out) => {
                for rejected in out.rejected {
                    ctx.report_error(rejected.into(), Some(&msg));
                }
                if out.outputs.iter().any(|port| !port.is_empty()) {
                    ctx.send(out.outputs);
                }
                done.ok();
            }
            Err(err) => done.fail(err),
        }
        Ok(())
    }

    async fn close(&self, ctx: &NodeContext) {
        self.host.shutdown();
        if let Some((host, unit)) = &self.teardown {
            if let Err(err) = run_blocking(host, unit, None).await {
                error!(node = %ctx.id(), error = %err, "finalize failed");
            }
            host.shutdown();
        }
        let left = self.active_timers();
        if left > 0 {
            warn!(node = %ctx.id(), left, "timers survived close");
        }
    }
}
