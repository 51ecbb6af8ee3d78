//! Flow definitions and their deployment.
//!
//! A [`FlowDefinition`] is plain data (loaded from JSON or YAML). The
//! [`FlowManager`] turns it into an [`ActiveFlow`]: one handler, inbox and
//! worker per node, wired together by a router.

mod active;
mod manager;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregator::AggregatorMode;
use crate::node::NodeError;
use crate::pool::ConnectionKey;
use crate::sandbox::SandboxError;
use crate::topic;

pub use active::ActiveFlow;
pub use manager::FlowManager;

/// Errors of a bounce through catch nodes are dropped after this many hops.
pub const MAX_ERROR_LOOP: u64 = 10;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeployError {
    #[error("invalid flow definition: {0}")]
    Parse(String),
    #[error("flow `{0}` is already deployed")]
    AlreadyDeployed(String),
    #[error("flow `{0}` is not deployed")]
    NotDeployed(String),
    #[error("flow `{flow}` has more than one node with id `{node}`")]
    DuplicateNode { flow: String, node: String },
    #[error("node `{node}` is wired to unknown node `{target}`")]
    UnknownWireTarget { node: String, target: String },
    #[error("node `{node}`: {message}")]
    Config { node: String, message: String },
    #[error("node `{node}`: {error}")]
    Compile { node: String, error: SandboxError },
}

impl DeployError {
    pub(crate) fn config(node: &str, err: impl ToString) -> Self {
        DeployError::Config {
            node: node.to_string(),
            message: err.to_string(),
        }
    }
}

/// One `{name, value}` entry of a flow's environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvEntry {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvEntry>,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Target node ids, one list per output port.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wires: Vec<Vec<String>>,
    #[serde(flatten)]
    pub kind: NodeKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NodeKind {
    #[serde(rename = "function")]
    Function(FunctionConfig),
    #[serde(rename = "batch")]
    Batch(BatchConfig),
    #[serde(rename = "mqtt in")]
    MqttIn(MqttInConfig),
    #[serde(rename = "mqtt out")]
    MqttOut(MqttOutConfig),
    #[serde(rename = "mqtt-broker")]
    MqttBroker(BrokerConfig),
    #[serde(rename = "debug")]
    Debug(DebugConfig),
    #[serde(rename = "catch")]
    Catch(CatchConfig),
}

impl NodeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Function(_) => "function",
            NodeKind::Batch(_) => "batch",
            NodeKind::MqttIn(_) => "mqtt in",
            NodeKind::MqttOut(_) => "mqtt out",
            NodeKind::MqttBroker(_) => "mqtt-broker",
            NodeKind::Debug(_) => "debug",
            NodeKind::Catch(_) => "catch",
        }
    }

    /// Config nodes hold shared settings; they take no input and have no wires.
    pub fn is_config(&self) -> bool {
        matches!(self, NodeKind::MqttBroker(_))
    }
}

fn default_outputs() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionConfig {
    pub func: String,
    #[serde(default = "default_outputs")]
    pub outputs: usize,
    /// Seconds; 0 or absent falls back to the runtime setting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initialize: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalize: Option<String>,
}

impl FunctionConfig {
    /// Per-run limit set on the node itself; `None` when absent, zero or
    /// not representable.
    pub fn run_timeout(&self) -> Option<Duration> {
        self.timeout
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchMode {
    Count,
    Interval,
    Concat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicEntry {
    pub topic: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    pub mode: BatchMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlap: Option<usize>,
    /// Seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<f64>,
    #[serde(default, alias = "allowEmptySequence")]
    pub allow_empty_sequence: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<TopicEntry>,
}

/// Shortest accepted batch interval.
pub const MIN_BATCH_INTERVAL: Duration = Duration::from_millis(1);

impl BatchConfig {
    /// The tick period of interval mode; `None` in the other modes.
    pub fn interval_period(&self) -> Result<Option<Duration>, NodeError> {
        if self.mode != BatchMode::Interval {
            return Ok(None);
        }
        let secs = self
            .interval
            .ok_or_else(|| NodeError::Config("interval mode needs `interval`".into()))?;
        let period = Duration::try_from_secs_f64(secs)
            .map_err(|_| NodeError::Config(format!("`interval` {secs} is not a usable number of seconds")))?;
        if period < MIN_BATCH_INTERVAL {
            return Err(NodeError::Config(format!("`interval` {secs} is below one millisecond")));
        }
        Ok(Some(period))
    }

    pub fn aggregator_mode(&self) -> Result<AggregatorMode, NodeError> {
        match self.mode {
            BatchMode::Count => Ok(AggregatorMode::Count {
                count: self.count.ok_or_else(|| NodeError::Config("count mode needs `count`".into()))?,
                overlap: self.overlap.unwrap_or(0),
            }),
            BatchMode::Interval => {
                self.interval_period()?;
                Ok(AggregatorMode::Interval {
                    allow_empty: self.allow_empty_sequence,
                })
            }
            BatchMode::Concat => Ok(AggregatorMode::Concat {
                topics: self.topics.iter().map(|t| t.topic.clone()).collect(),
            }),
        }
    }
}

fn is_zero(qos: &u8) -> bool {
    *qos == 0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttInConfig {
    /// Id of the `mqtt-broker` config node.
    pub broker: String,
    pub topic: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub qos: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttOutConfig {
    pub broker: String,
    /// Overrides `msg.topic` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub qos: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retain: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub broker: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, alias = "clientid", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl BrokerConfig {
    pub fn connection_key(&self) -> ConnectionKey {
        ConnectionKey {
            address: self.broker.clone(),
            port: self.port,
            client_id: self.client_id.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

fn default_property() -> String {
    "payload".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugConfig {
    #[serde(default = "default_property")]
    pub property: String,
    /// Publish the whole message instead of `property`.
    #[serde(default)]
    pub complete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatchConfig {
    /// Node ids covered; absent means every node of the flow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Vec<String>>,
}

impl CatchConfig {
    pub fn covers(&self, node_id: &str) -> bool {
        self.scope
            .as_ref()
            .is_none_or(|ids| ids.iter().any(|id| id == node_id))
    }
}

impl FlowDefinition {
    pub fn from_json_str(text: &str) -> Result<Self, DeployError> {
        serde_json::from_str(text).map_err(|e| DeployError::Parse(e.to_string()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, DeployError> {
        serde_yaml_bw::from_str(text).map_err(|e| DeployError::Parse(e.to_string()))
    }

    /// Load a flow from a `.json`, `.yaml` or `.yml` file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("could not read flow {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let flow = match ext.as_str() {
            "json" => Self::from_json_str(&text),
            "yaml" | "yml" => Self::from_yaml_str(&text),
            other => bail!("unsupported flow extension `{other}`"),
        };
        flow.with_context(|| format!("could not load flow {}", path.display()))
    }

    pub fn node(&self, id: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Structural checks done before anything is instantiated.
    pub fn validate(&self) -> Result<(), DeployError> {
        if self.id.is_empty() {
            return Err(DeployError::Parse("flow id is empty".into()));
        }
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if node.id.is_empty() {
                return Err(DeployError::Parse("node id is empty".into()));
            }
            if !seen.insert(node.id.as_str()) {
                return Err(DeployError::DuplicateNode {
                    flow: self.id.clone(),
                    node: node.id.clone(),
                });
            }
        }

        for node in &self.nodes {
            if node.kind.is_config() && node.wires.iter().any(|port| !port.is_empty()) {
                return Err(DeployError::config(&node.id, "config nodes cannot have wires"));
            }
            for target in node.wires.iter().flatten() {
                match self.node(target) {
                    None => {
                        return Err(DeployError::UnknownWireTarget {
                            node: node.id.clone(),
                            target: target.clone(),
                        });
                    }
                    Some(t) if t.kind.is_config() => {
                        return Err(DeployError::config(
                            &node.id,
                            format!("cannot wire to config node `{target}`"),
                        ));
                    }
                    Some(_) => {}
                }
            }
            self.validate_kind(node)?;
        }
        Ok(())
    }

    fn validate_kind(&self, node: &NodeConfig) -> Result<(), DeployError> {
        match &node.kind {
            NodeKind::Function(cfg) if cfg.outputs == 0 && node.wires.iter().any(|w| !w.is_empty()) => {
                Err(DeployError::config(&node.id, "a function without outputs cannot have wires"))
            }
            NodeKind::Function(cfg) if cfg.timeout.is_some_and(|secs| secs > 0.0) && cfg.run_timeout().is_none() => {
                Err(DeployError::config(&node.id, "`timeout` is not a usable number of seconds"))
            }
            NodeKind::Batch(cfg) => cfg
                .aggregator_mode()
                .and_then(|mode| match mode {
                    AggregatorMode::Count { count, overlap } if count == 0 || overlap >= count => Err(
                        NodeError::Config(format!("overlap ({overlap}) must be less than count ({count}) and count at least 1")),
                    ),
                    AggregatorMode::Concat { topics } if topics.is_empty() => {
                        Err(NodeError::Config("concat mode needs at least one topic".into()))
                    }
                    _ => Ok(()),
                })
                .map_err(|e| DeployError::config(&node.id, e)),
            NodeKind::MqttIn(cfg) if cfg.topic.is_empty() || !topic::is_valid_pattern(&cfg.topic) => Err(
                DeployError::config(&node.id, format!("invalid subscription topic `{}`", cfg.topic)),
            ),
            NodeKind::MqttIn(cfg) if cfg.broker.is_empty() => Err(DeployError::config(&node.id, "missing broker")),
            NodeKind::MqttOut(cfg) if cfg.broker.is_empty() => Err(DeployError::config(&node.id, "missing broker")),
            NodeKind::MqttBroker(cfg) if cfg.broker.is_empty() => {
                Err(DeployError::config(&node.id, "missing broker address"))
            }
            _ => Ok(()),
        }
    }

    /// Resolve the broker config node `id`.
    pub fn broker(&self, id: &str) -> Option<&BrokerConfig> {
        match &self.node(id)?.kind {
            NodeKind::MqttBroker(cfg) => Some(cfg),
            _ => None,
        }
    }

    /// Node ids in the order their close handlers run: downstream nodes
    /// first, config nodes last. Flows with loops fall back to reverse
    /// declaration order.
    pub fn close_order(&self) -> Vec<String> {
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let index: HashMap<&str, NodeIndex> = self
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), graph.add_node(n.id.as_str())))
            .collect();

        for node in &self.nodes {
            let from = index[node.id.as_str()];
            for target in node.wires.iter().flatten() {
                if let Some(&to) = index.get(target.as_str()) {
                    graph.update_edge(from, to, ());
                }
            }
            // users of a config node close before it
            let uses = match &node.kind {
                NodeKind::MqttIn(cfg) => Some(cfg.broker.as_str()),
                NodeKind::MqttOut(cfg) => Some(cfg.broker.as_str()),
                _ => None,
            };
            if let Some(&cfg) = uses.and_then(|id| index.get(id)) {
                graph.update_edge(cfg, from, ());
            }
        }

        match toposort(&graph, None) {
            Ok(order) => order.into_iter().rev().map(|ix| graph[ix].to_string()).collect(),
            Err(_) => self.nodes.iter().rev().map(|n| n.id.clone()).collect(),
        }
    }
}
