//! Scoped key/value context shared by nodes.
//!
//! Three scopes exist: node (`"<nodeId>:<flowId>"`), flow (`"<flowId>"`) and
//! global (`"global"`). Each named store is an independent
//! [`ContextStorage`] backend; keys are dot-separated paths into nested
//! objects.

mod memory;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{Settings, StoreConfig, StoreModule};

pub use memory::MemoryStorage;

/// Top-level names that would shadow the accessor methods.
pub const RESERVED_KEYS: [&str; 3] = ["get", "set", "keys"];

const GLOBAL_SCOPE: &str = "global";
const DEFAULT_STORE: &str = "default";
const MAX_ENCODED_LEN: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("invalid context key `{0}`")]
    InvalidKey(String),
    #[error("`{0}` is a reserved context key")]
    ReservedKey(String),
    #[error("unknown context store `{0}`")]
    UnknownStore(String),
    #[error("{0:?} scope requires an id")]
    MissingId(ContextScope),
    #[error("invalid context storage configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextScope {
    Node,
    Flow,
    Global,
}

/// Resolve the internal scope id. Node ids are expected as `"<node>:<flow>"`.
pub fn scope_key(scope: ContextScope, id: Option<&str>) -> Result<String, ContextError> {
    match (scope, id) {
        (ContextScope::Global, _) => Ok(GLOBAL_SCOPE.to_string()),
        (_, Some(id)) if !id.is_empty() => Ok(id.to_string()),
        (scope, _) => Err(ContextError::MissingId(scope)),
    }
}

/// Whether `scope` survives a clean: the global scope, an active flow id, or
/// a `"<node>:<flow>"` id whose node and flow are both active. Ids may contain
/// `:` themselves, so every split point is tried.
pub fn is_active_scope(scope: &str, active: &HashSet<String>) -> bool {
    scope == GLOBAL_SCOPE
        || active.contains(scope)
        || scope
            .match_indices(':')
            .any(|(i, _)| active.contains(&scope[..i]) && active.contains(&scope[i + 1..]))
}

/// Split a key into path segments, rejecting empty keys and empty segments.
pub fn parse_key(key: &str) -> Result<Vec<String>, ContextError> {
    let key = key.trim();
    if key.is_empty() || key.split('.').any(str::is_empty) {
        return Err(ContextError::InvalidKey(key.to_string()));
    }
    Ok(key.split('.').map(str::to_string).collect())
}

/// Split an optional `#:(store)::` prefix off a key.
pub fn parse_store_prefix(key: &str) -> (Option<&str>, &str) {
    if let Some(rest) = key.strip_prefix("#:(") {
        if let Some((store, key)) = rest.split_once(")::") {
            return (Some(store), key);
        }
    }
    (None, key)
}

/// A context backend. The async methods default to the sync ones; remote
/// backends override them.
#[async_trait]
pub trait ContextStorage: Send + Sync {
    fn name(&self) -> &'static str;
    fn get(&self, scope: &str, path: &[String]) -> Result<Option<Value>, ContextError>;
    /// `None` deletes the leaf and prunes ancestors left empty.
    fn set(&self, scope: &str, path: &[String], value: Option<Value>) -> Result<(), ContextError>;
    fn keys(&self, scope: &str) -> Result<Vec<String>, ContextError>;
    fn delete(&self, scope: &str) -> Result<(), ContextError>;
    /// Drop every scope not owned by an id in `active`; never the global scope.
    fn clean(&self, active: &HashSet<String>) -> Result<(), ContextError>;

    async fn get_async(&self, scope: &str, path: &[String]) -> Result<Option<Value>, ContextError> {
        self.get(scope, path)
    }
    async fn set_async(&self, scope: &str, path: &[String], value: Option<Value>) -> Result<(), ContextError> {
        self.set(scope, path, value)
    }
    async fn keys_async(&self, scope: &str) -> Result<Vec<String>, ContextError> {
        self.keys(scope)
    }
    async fn delete_async(&self, scope: &str) -> Result<(), ContextError> {
        self.delete(scope)
    }
}

/// The set of configured stores.
pub struct ContextStore {
    stores: BTreeMap<String, Arc<dyn ContextStorage>>,
    default_store: String,
    warned: DashSet<String>,
}

impl std::fmt::Debug for ContextStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextStore")
            .field("stores", &self.stores.keys().collect::<Vec<_>>())
            .field("default_store", &self.default_store)
            .finish()
    }
}

impl Default for ContextStore {
    fn default() -> Self {
        let mut stores: BTreeMap<String, Arc<dyn ContextStorage>> = BTreeMap::new();
        stores.insert("memory".to_string(), Arc::new(MemoryStorage::new()));
        Self {
            stores,
            default_store: "memory".to_string(),
            warned: DashSet::new(),
        }
    }
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the stores named in `settings.context_storage` and seed the
    /// global scope from `settings.global_context`.
    pub fn from_settings(settings: &Settings) -> Result<Self, ContextError> {
        let store = if settings.context_storage.is_empty() {
            Self::default()
        } else {
            let mut stores: BTreeMap<String, Arc<dyn ContextStorage>> = BTreeMap::new();
            for (name, cfg) in &settings.context_storage {
                if let StoreConfig::Backend { module } = cfg {
                    let backend: Arc<dyn ContextStorage> = match module {
                        StoreModule::Memory => Arc::new(MemoryStorage::new()),
                    };
                    stores.insert(name.clone(), backend);
                }
            }
            let Some(first) = stores.keys().next().cloned() else {
                return Err(ContextError::InvalidConfig("no context store backend configured".into()));
            };
            let default_store = match settings.context_storage.get(DEFAULT_STORE) {
                Some(StoreConfig::Alias(target)) if stores.contains_key(target) => target.clone(),
                Some(StoreConfig::Alias(target)) => {
                    return Err(ContextError::InvalidConfig(format!(
                        "default store alias `{target}` names no configured store"
                    )));
                }
                Some(StoreConfig::Backend { .. }) => DEFAULT_STORE.to_string(),
                None => first,
            };
            for (name, cfg) in &settings.context_storage {
                if let StoreConfig::Alias(target) = cfg {
                    if name != DEFAULT_STORE {
                        return Err(ContextError::InvalidConfig(format!(
                            "only `default` may alias another store, `{name}` -> `{target}`"
                        )));
                    }
                }
            }
            Self {
                stores,
                default_store,
                warned: DashSet::new(),
            }
        };

        if !settings.global_context.is_empty() {
            let backend = store.backend(None, false)?;
            for (key, value) in &settings.global_context {
                backend.set(GLOBAL_SCOPE, &[key.clone()], Some(value.clone()))?;
            }
        }
        Ok(store)
    }

    pub fn default_store(&self) -> &str {
        &self.default_store
    }

    /// Names of the configured backends.
    pub fn stores(&self) -> Vec<String> {
        self.stores.keys().cloned().collect()
    }

    fn backend(&self, store: Option<&str>, strict: bool) -> Result<Arc<dyn ContextStorage>, ContextError> {
        let name = match store {
            None | Some(DEFAULT_STORE) => self.default_store.as_str(),
            Some(name) => name,
        };
        if let Some(backend) = self.stores.get(name) {
            return Ok(backend.clone());
        }
        if strict {
            return Err(ContextError::UnknownStore(name.to_string()));
        }
        if self.warned.insert(name.to_string()) {
            warn!(
                "context store `{}` is not configured, using `{}`",
                name, self.default_store
            );
        }
        self.stores
            .get(&self.default_store)
            .cloned()
            .ok_or_else(|| ContextError::UnknownStore(self.default_store.clone()))
    }

    pub fn get(
        &self,
        scope: ContextScope,
        id: Option<&str>,
        store: Option<&str>,
        key: &str,
    ) -> Result<Option<Value>, ContextError> {
        let scope_id = scope_key(scope, id)?;
        let path = parse_key(key)?;
        self.backend(store, false)?.get(&scope_id, &path)
    }

    /// Set `key`; `None` deletes it.
    pub fn set(
        &self,
        scope: ContextScope,
        id: Option<&str>,
        store: Option<&str>,
        key: &str,
        value: Option<Value>,
    ) -> Result<(), ContextError> {
        let scope_id = scope_key(scope, id)?;
        let path = checked_path(key)?;
        self.backend(store, false)?.set(&scope_id, &path, value)
    }

    pub fn keys(&self, scope: ContextScope, id: Option<&str>, store: Option<&str>) -> Result<Vec<String>, ContextError> {
        let scope_id = scope_key(scope, id)?;
        self.backend(store, false)?.keys(&scope_id)
    }

    /// Remove a whole scope from every store.
    pub fn delete(&self, scope: ContextScope, id: Option<&str>) -> Result<(), ContextError> {
        let scope_id = scope_key(scope, id)?;
        for backend in self.stores.values() {
            backend.delete(&scope_id)?;
        }
        Ok(())
    }

    /// Drop every node/flow scope whose owner is not in `active`.
    pub fn clean(&self, active: &HashSet<String>) -> Result<(), ContextError> {
        debug!(active = active.len(), "cleaning context stores");
        for backend in self.stores.values() {
            backend.clean(active)?;
        }
        Ok(())
    }

    pub async fn get_async(
        &self,
        scope: ContextScope,
        id: Option<&str>,
        store: Option<&str>,
        key: &str,
    ) -> Result<Option<Value>, ContextError> {
        let scope_id = scope_key(scope, id)?;
        let path = parse_key(key)?;
        self.backend(store, false)?.get_async(&scope_id, &path).await
    }

    pub async fn set_async(
        &self,
        scope: ContextScope,
        id: Option<&str>,
        store: Option<&str>,
        key: &str,
        value: Option<Value>,
    ) -> Result<(), ContextError> {
        let scope_id = scope_key(scope, id)?;
        let path = checked_path(key)?;
        self.backend(store, false)?.set_async(&scope_id, &path, value).await
    }

    pub async fn keys_async(
        &self,
        scope: ContextScope,
        id: Option<&str>,
        store: Option<&str>,
    ) -> Result<Vec<String>, ContextError> {
        let scope_id = scope_key(scope, id)?;
        self.backend(store, false)?.keys_async(&scope_id).await
    }

    pub async fn delete_async(&self, scope: ContextScope, id: Option<&str>) -> Result<(), ContextError> {
        let scope_id = scope_key(scope, id)?;
        for backend in self.stores.values() {
            backend.delete_async(&scope_id).await?;
        }
        Ok(())
    }

    /// Read side of the query surface. With a key, returns the encoded
    /// value (`None` when unset); without one, every key of the scope
    /// grouped by store.
    pub fn query(&self, query: &ContextQuery) -> Result<Option<QueryResult>, ContextError> {
        let scope_id = scope_key(query.scope, query.id.as_deref())?;
        match &query.key {
            Some(key) => {
                let path = parse_key(key)?;
                let backend = self.backend(query.store.as_deref(), true)?;
                Ok(backend.get(&scope_id, &path)?.map(|v| QueryResult::Entry(encode(&v))))
            }
            None => {
                let names = match &query.store {
                    Some(store) => {
                        self.backend(Some(store), true)?;
                        vec![self.resolve_name(store)]
                    }
                    None => self.stores(),
                };
                let mut result = BTreeMap::new();
                for name in names {
                    let backend = self.backend(Some(&name), true)?;
                    let mut entries = BTreeMap::new();
                    for key in backend.keys(&scope_id)? {
                        if let Some(value) = backend.get(&scope_id, &[key.clone()])? {
                            entries.insert(key, encode(&value));
                        }
                    }
                    result.insert(name, entries);
                }
                Ok(Some(QueryResult::Stores(result)))
            }
        }
    }

    /// Delete side of the query surface; the key is required.
    pub fn delete_entry(&self, query: &ContextQuery) -> Result<(), ContextError> {
        let scope_id = scope_key(query.scope, query.id.as_deref())?;
        let key = query
            .key
            .as_deref()
            .ok_or_else(|| ContextError::InvalidKey(String::new()))?;
        let path = parse_key(key)?;
        self.backend(query.store.as_deref(), true)?.set(&scope_id, &path, None)
    }

    fn resolve_name(&self, store: &str) -> String {
        if store == DEFAULT_STORE {
            self.default_store.clone()
        } else {
            store.to_string()
        }
    }

    /// Accessor bound to one scope.
    pub fn scoped(self: &Arc<Self>, scope: ContextScope, id: Option<String>) -> ScopedContext {
        ScopedContext {
            store: self.clone(),
            scope,
            id,
        }
    }
}

fn checked_path(key: &str) -> Result<Vec<String>, ContextError> {
    let path = parse_key(key)?;
    if RESERVED_KEYS.contains(&path[0].as_str()) {
        return Err(ContextError::ReservedKey(path[0].clone()));
    }
    Ok(path)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextQuery {
    pub scope: ContextScope,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub store: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EncodedValue {
    pub msg: Value,
    pub format: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryResult {
    Entry(EncodedValue),
    Stores(BTreeMap<String, BTreeMap<String, EncodedValue>>),
}

/// Describe a value for display, truncating long strings and arrays.
pub fn encode(value: &Value) -> EncodedValue {
    match value {
        Value::Null => EncodedValue { msg: Value::Null, format: "null".into() },
        Value::Bool(_) => EncodedValue { msg: value.clone(), format: "boolean".into() },
        Value::Number(_) => EncodedValue { msg: value.clone(), format: "number".into() },
        Value::String(s) => {
            let len = s.chars().count();
            let msg = if len > MAX_ENCODED_LEN {
                json!(s.chars().take(MAX_ENCODED_LEN).collect::<String>())
            } else {
                value.clone()
            };
            EncodedValue { msg, format: format!("string[{len}]") }
        }
        Value::Array(items) => EncodedValue {
            msg: Value::Array(items.iter().take(MAX_ENCODED_LEN).cloned().collect()),
            format: format!("array[{}]", items.len()),
        },
        Value::Object(_) => EncodedValue { msg: value.clone(), format: "Object".into() },
    }
}

/// Context accessor bound to one scope, handed to node handlers.
#[derive(Clone)]
pub struct ScopedContext {
    store: Arc<ContextStore>,
    scope: ContextScope,
    id: Option<String>,
}

impl std::fmt::Debug for ScopedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ScopedContext({:?}, {:?})", self.scope, self.id)
    }
}

impl ScopedContext {
    pub fn scope(&self) -> ContextScope {
        self.scope
    }

    pub fn get(&self, key: &str, store: Option<&str>) -> Result<Option<Value>, ContextError> {
        let (prefixed, key) = parse_store_prefix(key);
        self.store.get(self.scope, self.id.as_deref(), store.or(prefixed), key)
    }

    pub fn set(&self, key: &str, value: Option<Value>, store: Option<&str>) -> Result<(), ContextError> {
        let (prefixed, key) = parse_store_prefix(key);
        self.store.set(self.scope, self.id.as_deref(), store.or(prefixed), key, value)
    }

    pub fn keys(&self, store: Option<&str>) -> Result<Vec<String>, ContextError> {
        self.store.keys(self.scope, self.id.as_deref(), store)
    }

    pub async fn get_async(&self, key: &str, store: Option<&str>) -> Result<Option<Value>, ContextError> {
        let (prefixed, key) = parse_store_prefix(key);
        self.store
            .get_async(self.scope, self.id.as_deref(), store.or(prefixed), key)
            .await
    }

    pub async fn set_async(&self, key: &str, value: Option<Value>, store: Option<&str>) -> Result<(), ContextError> {
        let (prefixed, key) = parse_store_prefix(key);
        self.store
            .set_async(self.scope, self.id.as_deref(), store.or(prefixed), key, value)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings_with_stores() -> Settings {
        let mut settings = Settings::default();
        settings
            .context_storage
            .insert("default".into(), StoreConfig::Alias("mem".into()));
        settings
            .context_storage
            .insert("mem".into(), StoreConfig::Backend { module: StoreModule::Memory });
        settings
            .context_storage
            .insert("other".into(), StoreConfig::Backend { module: StoreModule::Memory });
        settings
    }

    #[test]
    fn test_default_memory_store() {
        let ctx = ContextStore::new();
        assert_eq!(ctx.default_store(), "memory");
        ctx.set(ContextScope::Flow, Some("f1"), None, "a.b", Some(json!(1))).unwrap();
        assert_eq!(ctx.get(ContextScope::Flow, Some("f1"), None, "a.b").unwrap(), Some(json!(1)));
        assert_eq!(
            ctx.get(ContextScope::Flow, Some("f1"), Some("default"), "a").unwrap(),
            Some(json!({"b": 1}))
        );
    }

    #[test]
    fn test_nested_delete_removes_empty_parents() {
        let ctx = ContextStore::new();
        ctx.set(ContextScope::Global, None, None, "a.b.c", Some(json!(5))).unwrap();
        ctx.set(ContextScope::Global, None, None, "a.b.c", None).unwrap();
        assert_eq!(ctx.get(ContextScope::Global, None, None, "a").unwrap(), None);
        assert!(ctx.keys(ContextScope::Global, None, None).unwrap().is_empty());
    }

    #[test]
    fn test_reserved_and_empty_keys_rejected() {
        let ctx = ContextStore::new();
        for key in ["get", "set", "keys", "keys.x"] {
            let err = ctx
                .set(ContextScope::Global, None, None, key, Some(json!(1)))
                .unwrap_err();
            assert!(matches!(err, ContextError::ReservedKey(_)), "{key}");
        }
        assert!(matches!(
            ctx.set(ContextScope::Global, None, None, "", Some(json!(1))),
            Err(ContextError::InvalidKey(_))
        ));
        assert!(matches!(
            ctx.get(ContextScope::Global, None, None, "a..b"),
            Err(ContextError::InvalidKey(_))
        ));
        // nested use of a reserved word is fine
        ctx.set(ContextScope::Global, None, None, "x.get", Some(json!(1))).unwrap();
    }

    #[test]
    fn test_node_and_flow_scopes_need_an_id() {
        let ctx = ContextStore::new();
        assert_eq!(
            ctx.get(ContextScope::Node, None, None, "a"),
            Err(ContextError::MissingId(ContextScope::Node))
        );
    }

    #[test]
    fn test_clean_keeps_global() {
        let ctx = ContextStore::new();
        ctx.set(ContextScope::Global, None, None, "g", Some(json!(1))).unwrap();
        ctx.set(ContextScope::Flow, Some("f1"), None, "k", Some(json!(1))).unwrap();
        ctx.set(ContextScope::Node, Some("n1:f1"), None, "k", Some(json!(1))).unwrap();
        ctx.clean(&HashSet::new()).unwrap();
        assert_eq!(ctx.get(ContextScope::Global, None, None, "g").unwrap(), Some(json!(1)));
        assert_eq!(ctx.get(ContextScope::Flow, Some("f1"), None, "k").unwrap(), None);
        assert_eq!(ctx.get(ContextScope::Node, Some("n1:f1"), None, "k").unwrap(), None);
    }

    #[test]
    fn test_stores_are_isolated_and_aliased() {
        let ctx = ContextStore::from_settings(&settings_with_stores()).unwrap();
        assert_eq!(ctx.default_store(), "mem");
        assert_eq!(ctx.stores(), vec!["mem".to_string(), "other".to_string()]);
        ctx.set(ContextScope::Global, None, Some("other"), "k", Some(json!("o"))).unwrap();
        ctx.set(ContextScope::Global, None, None, "k", Some(json!("d"))).unwrap();
        assert_eq!(ctx.get(ContextScope::Global, None, Some("mem"), "k").unwrap(), Some(json!("d")));
        assert_eq!(ctx.get(ContextScope::Global, None, Some("other"), "k").unwrap(), Some(json!("o")));
    }

    #[test]
    fn test_unknown_store_falls_back_for_nodes_but_not_queries() {
        let ctx = ContextStore::new();
        ctx.set(ContextScope::Flow, Some("f1"), Some("file"), "k", Some(json!(1))).unwrap();
        assert_eq!(ctx.get(ContextScope::Flow, Some("f1"), None, "k").unwrap(), Some(json!(1)));

        let query = ContextQuery {
            scope: ContextScope::Flow,
            id: Some("f1".into()),
            store: Some("file".into()),
            key: Some("k".into()),
        };
        assert_eq!(ctx.query(&query), Err(ContextError::UnknownStore("file".into())));
        assert_eq!(ctx.delete_entry(&query), Err(ContextError::UnknownStore("file".into())));
    }

    #[test]
    fn test_bad_alias_is_a_config_error() {
        let mut settings = Settings::default();
        settings
            .context_storage
            .insert("default".into(), StoreConfig::Alias("missing".into()));
        settings
            .context_storage
            .insert("mem".into(), StoreConfig::Backend { module: StoreModule::Memory });
        assert!(matches!(
            ContextStore::from_settings(&settings),
            Err(ContextError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_global_seed() {
        let mut settings = Settings::default();
        settings.global_context.insert("site".into(), json!({"name": "lab"}));
        let ctx = ContextStore::from_settings(&settings).unwrap();
        assert_eq!(
            ctx.get(ContextScope::Global, None, None, "site.name").unwrap(),
            Some(json!("lab"))
        );
        ctx.set(ContextScope::Global, None, None, "site", None).unwrap();
        assert_eq!(ctx.get(ContextScope::Global, None, None, "site").unwrap(), None);
    }

    #[test]
    fn test_query_formats() {
        let ctx = ContextStore::new();
        ctx.set(ContextScope::Flow, Some("f1"), None, "s", Some(json!("abc"))).unwrap();
        ctx.set(ContextScope::Flow, Some("f1"), None, "list", Some(json!([1, 2]))).unwrap();
        ctx.set(ContextScope::Flow, Some("f1"), None, "obj", Some(json!({"a": 1}))).unwrap();

        let mut query = ContextQuery {
            scope: ContextScope::Flow,
            id: Some("f1".into()),
            store: None,
            key: Some("s".into()),
        };
        assert_eq!(
            ctx.query(&query).unwrap(),
            Some(QueryResult::Entry(EncodedValue { msg: json!("abc"), format: "string[3]".into() }))
        );

        query.key = Some("missing".into());
        assert_eq!(ctx.query(&query).unwrap(), None);

        query.key = None;
        let Some(QueryResult::Stores(stores)) = ctx.query(&query).unwrap() else {
            panic!("expected per-store listing");
        };
        let memory = &stores["memory"];
        assert_eq!(memory["list"].format, "array[2]");
        assert_eq!(memory["obj"].format, "Object");

        query.key = Some("s".into());
        ctx.delete_entry(&query).unwrap();
        assert_eq!(ctx.query(&query).unwrap(), None);
    }

    #[test]
    fn test_scoped_accessor_store_prefix() {
        let ctx = Arc::new(ContextStore::from_settings(&settings_with_stores()).unwrap());
        let flow = ctx.scoped(ContextScope::Flow, Some("f1".into()));
        flow.set("#:(other)::count", Some(json!(3)), None).unwrap();
        assert_eq!(flow.get("count", Some("other")).unwrap(), Some(json!(3)));
        assert_eq!(flow.get("count", None).unwrap(), None);
        assert_eq!(flow.keys(Some("other")).unwrap(), vec!["count".to_string()]);
    }

    #[tokio::test]
    async fn test_async_counterparts_share_backend() {
        let ctx = Arc::new(ContextStore::new());
        ctx.set_async(ContextScope::Flow, Some("f1"), None, "a", Some(json!(1)))
            .await
            .unwrap();
        assert_eq!(ctx.get(ContextScope::Flow, Some("f1"), None, "a").unwrap(), Some(json!(1)));
        assert_eq!(
            ctx.keys_async(ContextScope::Flow, Some("f1"), None).await.unwrap(),
            vec!["a".to_string()]
        );
        let scoped = ctx.scoped(ContextScope::Flow, Some("f1".into()));
        assert_eq!(scoped.get_async("a", None).await.unwrap(), Some(json!(1)));
        ctx.delete_async(ContextScope::Flow, Some("f1")).await.unwrap();
        assert_eq!(ctx.get_async(ContextScope::Flow, Some("f1"), None, "a").await.unwrap(), None);
    }
}
