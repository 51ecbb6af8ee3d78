use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::json;
use tracing::{error, info, warn};

use super::{ActiveFlow, DeployError, FlowDefinition};
use crate::config::{ConfigManager, Settings};
use crate::context::ContextError;
use crate::logger::{Logger, RUNTIME_TARGET, TracingLogger};
use crate::node::RuntimeServices;
use crate::pool::TransportFactory;

/// Deploys flows and owns the services they share.
#[derive(Debug)]
pub struct FlowManager {
    services: Arc<RuntimeServices>,
    flows: DashMap<String, Arc<ActiveFlow>>,
}

impl FlowManager {
    pub fn new(settings: Settings, config: ConfigManager) -> Result<Arc<Self>, ContextError> {
        Self::with_logger(settings, config, Logger(Box::new(TracingLogger)))
    }

    pub fn with_logger(settings: Settings, config: ConfigManager, logger: Logger) -> Result<Arc<Self>, ContextError> {
        let services = RuntimeServices::new(settings, config, logger)?;
        Ok(Arc::new(Self {
            services,
            flows: DashMap::new(),
        }))
    }

    pub fn services(&self) -> &Arc<RuntimeServices> {
        &self.services
    }

    /// Make a transport scheme (`mqtt`, ...) available to broker nodes.
    pub fn register_transport(&self, factory: Arc<dyn TransportFactory>) {
        info!(scheme = factory.scheme(), "transport registered");
        self.services.register_transport(factory);
    }

    pub fn flow(&self, id: &str) -> Option<Arc<ActiveFlow>> {
        self.flows.get(id).map(|f| f.clone())
    }

    pub fn flow_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.flows.iter().map(|f| f.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Start `definition`. A failing deploy leaves every other flow running.
    #[tracing::instrument(skip_all, fields(flow = %definition.id))]
    pub async fn deploy(&self, definition: FlowDefinition) -> Result<Arc<ActiveFlow>, DeployError> {
        let id = definition.id.clone();
        if self.flows.contains_key(&id) {
            return Err(DeployError::AlreadyDeployed(id));
        }
        let flow = match ActiveFlow::start(definition, self.services.clone()).await {
            Ok(flow) => flow,
            Err(err) => {
                error!(target: RUNTIME_TARGET, flow = %id, error = %err, "deploy failed");
                return Err(err);
            }
        };

        let raced = match self.flows.entry(id.clone()) {
            Entry::Occupied(_) => true,
            Entry::Vacant(slot) => {
                slot.insert(flow.clone());
                false
            }
        };
        if raced {
            flow.stop().await;
            return Err(DeployError::AlreadyDeployed(id));
        }

        self.notify(&id, "started");
        self.clean_context();
        info!(target: RUNTIME_TARGET, flow = %id, nodes = flow.node_ids().len(), "flow deployed");
        Ok(flow)
    }

    /// Stop the flow and forget its node and flow context.
    #[tracing::instrument(skip(self))]
    pub async fn undeploy(&self, id: &str) -> Result<(), DeployError> {
        let Some((_, flow)) = self.flows.remove(id) else {
            return Err(DeployError::NotDeployed(id.to_string()));
        };
        flow.stop().await;
        self.notify(id, "stopped");
        self.clean_context();
        info!(target: RUNTIME_TARGET, flow = %id, "flow undeployed");
        Ok(())
    }

    /// Replace a running flow with a new version of it; deploys when it is
    /// not running yet.
    pub async fn redeploy(&self, definition: FlowDefinition) -> Result<Arc<ActiveFlow>, DeployError> {
        match self.undeploy(&definition.id).await {
            Ok(()) | Err(DeployError::NotDeployed(_)) => {}
            Err(err) => return Err(err),
        }
        self.deploy(definition).await
    }

    pub async fn stop_all(&self) {
        let ids = self.flow_ids();
        let count = ids.len();
        for id in ids {
            if let Err(e) = self.undeploy(&id).await {
                warn!(flow = %id, error = %e, "flow already gone");
            }
        }
        info!("Shut down {} flows", count);
    }

    /// Deploy every `.json`, `.yaml` and `.yml` flow in `dir`. Files that do
    /// not load or deploy are logged and skipped.
    pub async fn deploy_dir(&self, dir: &Path) -> anyhow::Result<Vec<String>> {
        let mut deployed = Vec::new();
        let mut paths: Vec<_> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("json") | Some("yaml") | Some("yml")
                )
            })
            .collect();
        paths.sort();
        for path in paths {
            let definition = match FlowDefinition::load(&path) {
                Ok(definition) => definition,
                Err(e) => {
                    error!(path = %path.display(), "Failed to load flow: {e:#}");
                    continue;
                }
            };
            match self.deploy(definition).await {
                Ok(flow) => deployed.push(flow.id().to_string()),
                Err(e) => error!(path = %path.display(), error = %e, "Failed to deploy flow"),
            }
        }
        Ok(deployed)
    }

    fn notify(&self, flow: &str, state: &str) {
        self.services
            .comms
            .publish("notification/flows", json!({"state": state, "flow": flow}), false);
    }

    /// Drop context scopes of nodes and flows that are no longer deployed.
    fn clean_context(&self) {
        let mut active = HashSet::new();
        for flow in self.flows.iter() {
            active.insert(flow.key().clone());
            active.extend(flow.node_ids());
        }
        if let Err(e) = self.services.context.clean(&active) {
            warn!(error = %e, "context clean failed");
        }
    }
}
