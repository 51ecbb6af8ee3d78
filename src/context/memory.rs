use std::collections::HashSet;

use dashmap::DashMap;
use serde_json::{Map, Value};

use super::{ContextError, ContextStorage, is_active_scope};

/// Volatile in-process context backend.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    scopes: DashMap<String, Map<String, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContextStorage for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get(&self, scope: &str, path: &[String]) -> Result<Option<Value>, ContextError> {
        Ok(self
            .scopes
            .get(scope)
            .and_then(|data| get_path(&data, path).cloned()))
    }

    fn set(&self, scope: &str, path: &[String], value: Option<Value>) -> Result<(), ContextError> {
        match value {
            Some(value) => {
                let mut data = self.scopes.entry(scope.to_string()).or_default();
                set_path(&mut data, path, value);
            }
            None => {
                let now_empty = match self.scopes.get_mut(scope) {
                    Some(mut data) => {
                        delete_path(&mut data, path);
                        data.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    self.scopes.remove_if(scope, |_, data| data.is_empty());
                }
            }
        }
        Ok(())
    }

    fn keys(&self, scope: &str) -> Result<Vec<String>, ContextError> {
        Ok(self
            .scopes
            .get(scope)
            .map(|data| data.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn delete(&self, scope: &str) -> Result<(), ContextError> {
        self.scopes.remove(scope);
        Ok(())
    }

    fn clean(&self, active: &HashSet<String>) -> Result<(), ContextError> {
        self.scopes.retain(|scope, _| is_active_scope(scope, active));
        Ok(())
    }
}

pub(crate) fn get_path<'a>(data: &'a Map<String, Value>, path: &[String]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let mut current = data.get(first)?;
    for segment in rest {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn set_path(data: &mut Map<String, Value>, path: &[String], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut current = data;
    for segment in parents {
        let entry = current
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = match entry {
            Value::Object(map) => map,
            _ => return,
        };
    }
    current.insert(last.clone(), value);
}

/// Remove the leaf, then prune every ancestor object left empty.
/// Returns whether `data` is now empty.
fn delete_path(data: &mut Map<String, Value>, path: &[String]) -> bool {
    match path {
        [] => data.is_empty(),
        [leaf] => {
            data.shift_remove(leaf);
            data.is_empty()
        }
        [head, rest @ ..] => {
            let child_empty = match data.get_mut(head) {
                Some(Value::Object(child)) => delete_path(child, rest),
                _ => false,
            };
            if child_empty {
                data.shift_remove(head);
            }
            data.is_empty()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(key: &str) -> Vec<String> {
        key.split('.').map(str::to_string).collect()
    }

    #[test]
    fn test_nested_set_and_get() {
        let store = MemoryStorage::new();
        store.set("f1", &path("a.b.c"), Some(json!(5))).unwrap();
        assert_eq!(store.get("f1", &path("a.b.c")).unwrap(), Some(json!(5)));
        assert_eq!(store.get("f1", &path("a")).unwrap(), Some(json!({"b": {"c": 5}})));
        assert_eq!(store.get("f1", &path("a.x")).unwrap(), None);
        assert_eq!(store.get("other", &path("a")).unwrap(), None);
    }

    #[test]
    fn test_set_through_scalar_replaces_it() {
        let store = MemoryStorage::new();
        store.set("f1", &path("a"), Some(json!(1))).unwrap();
        store.set("f1", &path("a.b"), Some(json!(2))).unwrap();
        assert_eq!(store.get("f1", &path("a")).unwrap(), Some(json!({"b": 2})));
    }

    #[test]
    fn test_delete_prunes_empty_ancestors() {
        let store = MemoryStorage::new();
        store.set("f1", &path("a.b.c"), Some(json!(5))).unwrap();
        store.set("f1", &path("keep"), Some(json!(true))).unwrap();
        store.set("f1", &path("a.b.c"), None).unwrap();
        assert_eq!(store.get("f1", &path("a")).unwrap(), None);
        assert_eq!(store.keys("f1").unwrap(), vec!["keep".to_string()]);
    }

    #[test]
    fn test_delete_keeps_non_empty_siblings() {
        let store = MemoryStorage::new();
        store.set("f1", &path("a.b.c"), Some(json!(5))).unwrap();
        store.set("f1", &path("a.d"), Some(json!(6))).unwrap();
        store.set("f1", &path("a.b.c"), None).unwrap();
        assert_eq!(store.get("f1", &path("a")).unwrap(), Some(json!({"d": 6})));
    }

    #[test]
    fn test_clean_keeps_global_and_active_scopes() {
        let store = MemoryStorage::new();
        for scope in ["global", "f1", "f2", "n1:f1", "n2:f2"] {
            store.set(scope, &path("k"), Some(json!(1))).unwrap();
        }
        let active: HashSet<String> = ["f1".to_string(), "n1".to_string()].into_iter().collect();
        store.clean(&active).unwrap();
        assert!(store.get("global", &path("k")).unwrap().is_some());
        assert!(store.get("f1", &path("k")).unwrap().is_some());
        assert!(store.get("n1:f1", &path("k")).unwrap().is_some());
        assert!(store.get("f2", &path("k")).unwrap().is_none());
        assert!(store.get("n2:f2", &path("k")).unwrap().is_none());
    }

    #[test]
    fn test_clean_with_colons_in_flow_ids() {
        let store = MemoryStorage::new();
        for scope in ["site:a", "site:b", "n1:site:a", "n1:site:b", "x:y:site:a"] {
            store.set(scope, &path("k"), Some(json!(1))).unwrap();
        }
        let active: HashSet<String> = ["site:a", "n1", "x:y"].into_iter().map(String::from).collect();
        store.clean(&active).unwrap();
        assert!(store.get("site:a", &path("k")).unwrap().is_some());
        assert!(store.get("n1:site:a", &path("k")).unwrap().is_some());
        assert!(store.get("x:y:site:a", &path("k")).unwrap().is_some());
        // same node id, but its flow is gone
        assert!(store.get("n1:site:b", &path("k")).unwrap().is_none());
        assert!(store.get("site:b", &path("k")).unwrap().is_none());
    }
}
