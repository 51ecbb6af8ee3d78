//! Topic publish/subscribe bus exposing runtime events to observers.
//!
//! Retained entries are kept per exact topic and replayed to new matching
//! subscriptions. Status topics (`status/<nodeId>`) get special treatment
//! for blank statuses, which only ever clear a previously shown status.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::topic;

const STATUS_PREFIX: &str = "status/";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommsMessage {
    pub topic: String,
    pub data: Value,
}

/// An observer attached to the bus.
pub trait CommsConnection: Send + Sync {
    fn id(&self) -> &str;
    fn send(&self, topic: &str, data: &Value);
}

/// Delivers bus events into a tokio channel.
#[derive(Debug)]
pub struct ChannelConnection {
    id: String,
    tx: mpsc::UnboundedSender<CommsMessage>,
}

impl ChannelConnection {
    pub fn new(id: impl Into<String>) -> (Arc<Self>, mpsc::UnboundedReceiver<CommsMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { id: id.into(), tx }), rx)
    }
}

impl CommsConnection for ChannelConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn send(&self, topic: &str, data: &Value) {
        if self
            .tx
            .send(CommsMessage {
                topic: topic.to_string(),
                data: data.clone(),
            })
            .is_err()
        {
            trace!(connection = %self.id, "comms receiver dropped");
        }
    }
}

struct Subscriber {
    client: Arc<dyn CommsConnection>,
    patterns: Vec<String>,
}

#[derive(Default)]
pub struct Comms {
    connections: DashMap<String, Subscriber>,
    retained: DashMap<String, Value>,
}

impl std::fmt::Debug for Comms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Comms")
            .field("connections", &self.connections.len())
            .field("retained", &self.retained.len())
            .finish()
    }
}

/// A status is blank when it has no text, fill or shape.
pub fn is_blank_status(data: &Value) -> bool {
    match data {
        Value::Null => true,
        Value::Object(map) => ["text", "fill", "shape"].iter().all(|k| match map.get(*k) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(_) => false,
        }),
        _ => false,
    }
}

impl Comms {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_connection(&self, client: Arc<dyn CommsConnection>) {
        debug!(connection = client.id(), "comms connection added");
        self.connections.insert(
            client.id().to_string(),
            Subscriber {
                client,
                patterns: Vec::new(),
            },
        );
    }

    pub fn remove_connection(&self, client: &dyn CommsConnection) {
        if self.connections.remove(client.id()).is_some() {
            debug!(connection = client.id(), "comms connection removed");
        }
    }

    /// Subscribe a connection to `pattern` and replay matching retained entries.
    pub fn subscribe(&self, client_id: &str, pattern: &str) {
        if !topic::is_valid_pattern(pattern) {
            warn!(connection = client_id, pattern, "ignoring invalid comms subscription");
            return;
        }
        let client = match self.connections.get_mut(client_id) {
            Some(mut entry) => {
                if !entry.patterns.iter().any(|p| p == pattern) {
                    entry.patterns.push(pattern.to_string());
                }
                entry.client.clone()
            }
            None => {
                warn!(connection = client_id, "subscribe from unknown comms connection");
                return;
            }
        };

        let replay: Vec<(String, Value)> = self
            .retained
            .iter()
            .filter(|e| topic::matches(pattern, e.key()))
            .filter(|e| !(e.key().starts_with(STATUS_PREFIX) && is_blank_status(e.value())))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (topic, data) in replay {
            client.send(&topic, &data);
        }
    }

    pub fn unsubscribe(&self, client_id: &str, pattern: &str) {
        if let Some(mut entry) = self.connections.get_mut(client_id) {
            entry.patterns.retain(|p| p != pattern);
        }
    }

    /// Publish `data` on `topic` to every matching subscriber.
    pub fn publish(&self, topic: &str, data: Value, retain: bool) {
        let blank = topic.starts_with(STATUS_PREFIX) && is_blank_status(&data);
        if blank {
            // a cleared status is delivered but nothing is left to replay
            self.retained.remove(topic);
        } else if retain || self.retained.contains_key(topic) {
            self.retained.insert(topic.to_string(), data.clone());
        }

        let targets: Vec<Arc<dyn CommsConnection>> = self
            .connections
            .iter()
            .filter(|e| e.patterns.iter().any(|p| topic::matches(p, topic)))
            .map(|e| e.client.clone())
            .collect();
        trace!(topic, targets = targets.len(), "comms publish");
        for client in targets {
            client.send(topic, &data);
        }
    }

    pub fn retained(&self, topic: &str) -> Option<Value> {
        self.retained.get(topic).map(|v| v.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn drain(rx: &mut mpsc::UnboundedReceiver<CommsMessage>) -> Vec<CommsMessage> {
        let mut out = vec![];
        while let Ok(m) = rx.try_recv() {
            out.push(m);
        }
        out
    }

    #[test]
    fn test_fan_out_with_wildcards() {
        let comms = Comms::new();
        let (a, mut rx_a) = ChannelConnection::new("a");
        let (b, mut rx_b) = ChannelConnection::new("b");
        comms.add_connection(a);
        comms.add_connection(b);
        comms.subscribe("a", "status/+");
        comms.subscribe("b", "notification/#");

        comms.publish("status/n1", json!({"text": "ok"}), false);
        comms.publish("notification/flows", json!({"state": "started"}), false);

        assert_eq!(drain(&mut rx_a).len(), 1);
        let got = drain(&mut rx_b);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].topic, "notification/flows");
    }

    #[test]
    fn test_retained_replay_and_update() {
        let comms = Comms::new();
        comms.publish("x/y", json!(1), true);

        let (late, mut rx) = ChannelConnection::new("late");
        comms.add_connection(late);
        comms.subscribe("late", "x/#");
        assert_eq!(
            drain(&mut rx),
            vec![CommsMessage { topic: "x/y".into(), data: json!(1) }]
        );

        // non-retained publish replaces the retained entry
        comms.publish("x/y", json!(2), false);
        assert_eq!(drain(&mut rx).len(), 1);

        let (later, mut rx2) = ChannelConnection::new("later");
        comms.add_connection(later);
        comms.subscribe("later", "x/y");
        assert_eq!(drain(&mut rx2)[0].data, json!(2));
    }

    #[test]
    fn test_non_retained_without_entry_is_not_kept() {
        let comms = Comms::new();
        comms.publish("x/z", json!(1), false);
        assert!(comms.retained("x/z").is_none());
    }

    #[test]
    fn test_blank_status_rules() {
        let comms = Comms::new();
        // first blank is not retained
        comms.publish("status/n1", json!({}), true);
        assert!(comms.retained("status/n1").is_none());

        comms.publish("status/n1", json!({"fill": "green", "text": "ok"}), true);
        let (obs, mut rx) = ChannelConnection::new("obs");
        comms.add_connection(obs);
        comms.subscribe("obs", "status/+");
        assert_eq!(drain(&mut rx).len(), 1);

        // blank after non-blank is delivered and drops the entry
        comms.publish("status/n1", json!({}), true);
        assert_eq!(drain(&mut rx), vec![CommsMessage { topic: "status/n1".into(), data: json!({}) }]);
        assert!(comms.retained("status/n1").is_none());

        // so it is never replayed
        let (late, mut rx_late) = ChannelConnection::new("late");
        comms.add_connection(late);
        comms.subscribe("late", "status/+");
        assert!(drain(&mut rx_late).is_empty());
    }

    #[test]
    fn test_cleared_statuses_do_not_accumulate() {
        let comms = Comms::new();
        for n in 0..100 {
            let topic = format!("status/n{n}");
            comms.publish(&topic, json!({"text": "busy"}), true);
            comms.publish(&topic, json!({}), true);
        }
        comms.publish("status/kept", json!({"text": "up"}), true);
        assert_eq!(comms.retained.len(), 1);
        assert_eq!(comms.retained("status/kept"), Some(json!({"text": "up"})));
    }

    #[test]
    fn test_unsubscribe_and_remove_connection() {
        let comms = Comms::new();
        let (a, mut rx) = ChannelConnection::new("a");
        comms.add_connection(a.clone());
        comms.subscribe("a", "t");
        comms.publish("t", json!(1), false);
        comms.unsubscribe("a", "t");
        comms.publish("t", json!(2), false);
        assert_eq!(drain(&mut rx).len(), 1);

        comms.subscribe("a", "t");
        comms.remove_connection(a.as_ref());
        comms.publish("t", json!(3), false);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_blank_detection() {
        assert!(is_blank_status(&json!({})));
        assert!(is_blank_status(&json!({"text": ""})));
        assert!(is_blank_status(&Value::Null));
        assert!(!is_blank_status(&json!({"text": "x"})));
        assert!(!is_blank_status(&json!({"shape": "dot"})));
    }
}
