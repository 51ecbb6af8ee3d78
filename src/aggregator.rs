//! Message batching by count, time interval, or correlated topic groups.
//!
//! The aggregator only holds state; the batch node feeds it messages with
//! their completions and emits whatever it hands back. Emitted messages get a
//! fresh `parts` descriptor whose id is the first message's `_msgid`.

use std::collections::{HashMap, VecDeque};

use crate::message::{Message, generate_id};
use crate::node::{Completion, NodeError};

#[derive(Debug, Clone, PartialEq)]
pub enum AggregatorMode {
    /// Emit every `count` messages, keeping the last `overlap` for the next
    /// window.
    Count { count: usize, overlap: usize },
    /// Emit whatever accumulated on every tick.
    Interval { allow_empty: bool },
    /// Join one complete group per topic, in topic order.
    Concat { topics: Vec<String> },
}

/// A batch ready to send, plus the completions to finish after sending.
#[derive(Debug)]
pub struct Flush<C> {
    pub batch: Vec<Message>,
    pub completed: Vec<C>,
}

#[derive(Debug)]
pub enum Outcome<C> {
    /// Held until a batch completes.
    Pending,
    Flush(Flush<C>),
    /// Not part of any batch; complete without error.
    Ignored(C),
    /// The message itself is invalid.
    Rejected(C, NodeError),
    /// The pending limit was exceeded: `failed` is the triggering message,
    /// everything else was released.
    Overflow { failed: C, released: Vec<C>, error: NodeError },
}

struct Group<C> {
    id: String,
    count: usize,
    items: Vec<(Message, C)>,
}

pub struct Aggregator<C> {
    mode: AggregatorMode,
    max_pending: usize,
    queue: Vec<(Message, C)>,
    groups: HashMap<String, VecDeque<Group<C>>>,
    pending: usize,
}

impl<C> std::fmt::Debug for Aggregator<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("mode", &self.mode)
            .field("max_pending", &self.max_pending)
            .field("pending", &self.pending)
            .finish()
    }
}

impl<C: Completion> Aggregator<C> {
    /// `max_pending` of 0 means unlimited.
    pub fn new(mode: AggregatorMode, max_pending: usize) -> Result<Self, NodeError> {
        match &mode {
            AggregatorMode::Count { count, .. } if *count == 0 => {
                return Err(NodeError::Config("count must be at least 1".into()));
            }
            AggregatorMode::Count { count, overlap } if overlap >= count => {
                return Err(NodeError::Config(format!(
                    "overlap ({overlap}) must be less than count ({count})"
                )));
            }
            AggregatorMode::Concat { topics } if topics.is_empty() => {
                return Err(NodeError::Config("concat mode needs at least one topic".into()));
            }
            _ => {}
        }
        Ok(Self {
            mode,
            max_pending,
            queue: Vec::new(),
            groups: HashMap::new(),
            pending: 0,
        })
    }

    pub fn mode(&self) -> &AggregatorMode {
        &self.mode
    }

    /// Messages received since the last emit.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Messages currently held.
    pub fn held(&self) -> usize {
        self.queue.len()
            + self
                .groups
                .values()
                .flat_map(|groups| groups.iter())
                .map(|g| g.items.len())
                .sum::<usize>()
    }

    pub fn push(&mut self, msg: Message, completion: C) -> Outcome<C> {
        match self.mode.clone() {
            AggregatorMode::Count { count, overlap } => self.push_count(msg, completion, count, overlap),
            AggregatorMode::Interval { .. } => {
                self.queue.push((msg, completion));
                self.pending += 1;
                self.check_queue_overflow()
            }
            AggregatorMode::Concat { topics } => self.push_concat(msg, completion, &topics),
        }
    }

    fn push_count(&mut self, msg: Message, completion: C, count: usize, overlap: usize) -> Outcome<C> {
        self.queue.push((msg, completion));
        self.pending += 1;
        if self.queue.len() == count {
            let held = std::mem::take(&mut self.queue);
            let split = held.len() - overlap;
            let mut batch = Vec::with_capacity(held.len());
            let mut completed = Vec::with_capacity(split);
            for (i, (msg, completion)) in held.into_iter().enumerate() {
                if i < split {
                    batch.push(msg);
                    completed.push(completion);
                } else {
                    batch.push(msg.clone());
                    self.queue.push((msg, completion));
                }
            }
            self.pending = 0;
            tag_parts(&mut batch);
            return Outcome::Flush(Flush { batch, completed });
        }
        self.check_queue_overflow()
    }

    fn push_concat(&mut self, msg: Message, completion: C, topics: &[String]) -> Outcome<C> {
        let Some(topic) = msg.topic().map(str::to_string) else {
            return Outcome::Ignored(completion);
        };
        if !topics.contains(&topic) {
            return Outcome::Ignored(completion);
        }
        let Some((id, count)) = msg.parts().and_then(|p| p.count.map(|c| (p.id, c))) else {
            return Outcome::Rejected(
                completion,
                NodeError::InvalidInput("message has no parts information".into()),
            );
        };

        self.pending += 1;
        if self.over_limit() {
            return self.overflow(completion);
        }
        let groups = self.groups.entry(topic).or_default();
        match groups.iter_mut().find(|g| g.id == id) {
            Some(group) => group.items.push((msg, completion)),
            None => groups.push_back(Group {
                id,
                count,
                items: vec![(msg, completion)],
            }),
        }

        match self.try_concat(topics) {
            Some(flush) => Outcome::Flush(flush),
            None => Outcome::Pending,
        }
    }

    /// Join the oldest group of the first topic once it, and the group with
    /// the same id on every other topic, is complete. Younger groups wait
    /// their turn even when complete.
    fn try_concat(&mut self, topics: &[String]) -> Option<Flush<C>> {
        let oldest = self.groups.get(&topics[0])?.front()?;
        let id = oldest.id.clone();
        let ready = topics.iter().all(|t| {
            self.groups
                .get(t)
                .and_then(|groups| groups.iter().find(|g| g.id == id))
                .is_some_and(|g| g.items.len() >= g.count)
        });
        if !ready {
            return None;
        }

        let mut batch = Vec::new();
        let mut completed = Vec::new();
        for topic in topics {
            let Some(groups) = self.groups.get_mut(topic) else {
                continue;
            };
            let Some(pos) = groups.iter().position(|g| g.id == id) else {
                continue;
            };
            if let Some(group) = groups.remove(pos) {
                for (msg, completion) in group.items {
                    batch.push(msg);
                    completed.push(completion);
                }
            }
            if groups.is_empty() {
                self.groups.remove(topic);
            }
        }
        self.pending = self.pending.saturating_sub(batch.len());
        tag_parts(&mut batch);
        Some(Flush { batch, completed })
    }

    /// Interval tick: emit everything held, or a placeholder when allowed.
    pub fn tick(&mut self) -> Option<Flush<C>> {
        let AggregatorMode::Interval { allow_empty } = self.mode else {
            return None;
        };
        if self.queue.is_empty() {
            if !allow_empty {
                return None;
            }
            let mut placeholder = Message::with_payload(serde_json::Value::Null);
            placeholder.set_parts(&generate_id(), 0, 1);
            return Some(Flush {
                batch: vec![placeholder],
                completed: Vec::new(),
            });
        }
        let (mut batch, completed): (Vec<Message>, Vec<C>) = std::mem::take(&mut self.queue).into_iter().unzip();
        self.pending = 0;
        tag_parts(&mut batch);
        Some(Flush { batch, completed })
    }

    /// Drop all held messages without emitting; their completions are
    /// returned for finishing without error.
    pub fn reset(&mut self) -> Vec<C> {
        self.pending = 0;
        let mut released: Vec<C> = std::mem::take(&mut self.queue).into_iter().map(|(_, c)| c).collect();
        for (_, groups) in self.groups.drain() {
            for group in groups {
                released.extend(group.items.into_iter().map(|(_, c)| c));
            }
        }
        released
    }

    fn over_limit(&self) -> bool {
        self.max_pending > 0 && self.pending > self.max_pending
    }

    /// Fail `failed`, release everything else and start over.
    fn overflow(&mut self, failed: C) -> Outcome<C> {
        let released = self.reset();
        Outcome::Overflow {
            failed,
            released,
            error: NodeError::Capacity(self.max_pending),
        }
    }

    fn check_queue_overflow(&mut self) -> Outcome<C> {
        if !self.over_limit() {
            return Outcome::Pending;
        }
        match self.queue.pop() {
            Some((_, failed)) => self.overflow(failed),
            None => Outcome::Pending,
        }
    }
}

/// Rewrite `parts` so the batch reads as one sequence.
fn tag_parts(batch: &mut [Message]) {
    let Some(id) = batch.first().map(|m| m.msgid().map(str::to_string).unwrap_or_else(generate_id)) else {
        return;
    };
    let count = batch.len();
    for (index, msg) in batch.iter_mut().enumerate() {
        msg.set_parts(&id, index, count);
    }
}
