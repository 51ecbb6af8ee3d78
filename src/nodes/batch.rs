use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::aggregator::{Aggregator, Flush, Outcome};
use crate::flow::BatchConfig;
use crate::message::Message;
use crate::node::{Done, NodeContext, NodeError, NodeHandler};

type Shared = Arc<Mutex<Aggregator<Done>>>;

/// Feeds inputs into an [`Aggregator`] and sends the batches it releases.
#[derive(Debug)]
pub struct BatchNode {
    state: Shared,
    interval: Option<Duration>,
    ticker: Mutex<Option<CancellationToken>>,
}

impl BatchNode {
    pub fn new(cfg: &BatchConfig, ctx: &NodeContext) -> Result<Self, NodeError> {
        let mode = cfg.aggregator_mode()?;
        let interval = cfg.interval_period()?;
        let aggregator = Aggregator::new(mode, ctx.settings().node_message_buffer_max_length)?;
        Ok(Self {
            state: Arc::new(Mutex::new(aggregator)),
            interval,
            ticker: Mutex::new(None),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Aggregator<Done>>, NodeError> {
        self.state
            .lock()
            .map_err(|_| NodeError::Runtime("batch state lock poisoned".into()))
    }

    /// (Re)start the interval ticker. The first tick comes one interval from now.
    fn start_ticker(&self, ctx: &NodeContext) {
        let Some(period) = self.interval else {
            return;
        };
        let token = ctx.token().child_token();
        if let Ok(mut slot) = self.ticker.lock() {
            if let Some(previous) = slot.replace(token.clone()) {
                previous.cancel();
            }
        }

        let state = self.state.clone();
        let node = ctx.clone();
        ctx.spawn(async move {
            let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticks.tick() => {
                        let flush = match state.lock() {
                            Ok(mut aggregator) => aggregator.tick(),
                            Err(_) => break,
                        };
                        if let Some(flush) = flush {
                            emit(&node, flush);
                        }
                    }
                }
            }
            trace!(node = %node.id(), "batch ticker stopped");
        });
    }

    fn stop_ticker(&self) {
        if let Some(token) = self.ticker.lock().ok().and_then(|mut slot| slot.take()) {
            token.cancel();
        }
    }
}

fn emit(ctx: &NodeContext, flush: Flush<Done>) {
    trace!(node = %ctx.id(), size = flush.batch.len(), "batch released");
    ctx.send(vec![flush.batch]);
    for done in flush.completed {
        done.ok();
    }
}

#[async_trait]
impl NodeHandler for BatchNode {
    async fn start(&self, ctx: &NodeContext) -> Result<(), NodeError> {
        self.start_ticker(ctx);
        Ok(())
    }

    async fn on_input(&self, ctx: &NodeContext, msg: Message, done: Done) -> Result<(), NodeError> {
        if msg.contains("reset") {
            let released = self.lock()?.reset();
            debug!(node = %ctx.id(), released = released.len(), "batch reset");
            released.into_iter().for_each(Done::ok);
            self.start_ticker(ctx);
            done.ok();
            return Ok(());
        }

        let outcome = self.lock()?.push(msg, done);
        match outcome {
            Outcome::Pending => {}
            Outcome::Flush(flush) => emit(ctx, flush),
            Outcome::Ignored(done) => done.ok(),
            Outcome::Rejected(done, error) => done.fail(error),
            Outcome::Overflow { failed, released, error } => {
                released.into_iter().for_each(Done::ok);
                failed.fail(error);
            }
        }
        Ok(())
    }

    async fn close(&self, ctx: &NodeContext) {
        self.stop_ticker();
        let released = match self.state.lock() {
            Ok(mut aggregator) => aggregator.reset(),
            Err(_) => Vec::new(),
        };
        if !released.is_empty() {
            debug!(node = %ctx.id(), released = released.len(), "pending inputs completed on close");
        }
        released.into_iter().for_each(Done::ok);
    }
}
