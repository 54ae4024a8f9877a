use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, OnceLock};

/// A registered component and the configuration it resolved at startup.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleInfo {
    pub name: String,
    pub config: Option<Value>,
    pub metadata: Option<Vec<String>>,
    pub registered_at: DateTime<Utc>,
}

/// Registry of the components active in the process, for operational
/// visibility (admin endpoints, startup logs). Has no effect on request
/// handling.
///
/// # Example
/// ```
/// use meshestra_exception::module::ModuleRegistry;
/// use serde_json::json;
///
/// let registry = ModuleRegistry::new();
/// registry.register_module("my::Handler", Some(json!({ "enabled": true })), None);
/// assert!(registry.get("my::Handler").is_some());
/// ```
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    modules: Arc<DashMap<String, ModuleInfo>>,
}

static GLOBAL: OnceLock<ModuleRegistry> = OnceLock::new();

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry
    pub fn global() -> &'static ModuleRegistry {
        GLOBAL.get_or_init(ModuleRegistry::new)
    }

    /// Register a module, replacing an earlier registration under the same name.
    pub fn register_module(
        &self,
        name: impl Into<String>,
        config: Option<Value>,
        metadata: Option<Vec<String>>,
    ) {
        let name = name.into();
        tracing::info!("Registered module {}", name);
        self.modules.insert(
            name.clone(),
            ModuleInfo {
                name,
                config,
                metadata,
                registered_at: Utc::now(),
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<ModuleInfo> {
        self.modules.get(name).map(|m| m.clone())
    }

    /// Snapshot of all modules, sorted by name.
    pub fn modules(&self) -> Vec<ModuleInfo> {
        let mut modules: Vec<_> = self.modules.iter().map(|m| m.value().clone()).collect();
        modules.sort_by(|a, b| a.name.cmp(&b.name));
        modules
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_replaces_and_sorts() {
        let registry = ModuleRegistry::new();
        registry.register_module("b", None, None);
        registry.register_module("a", Some(json!({ "enabled": false })), None);
        registry.register_module("a", Some(json!({ "enabled": true })), Some(vec!["v1".into()]));

        let modules = registry.modules();
        assert_eq!(modules.len(), 2);
        assert_eq!(modules[0].name, "a");
        assert_eq!(modules[0].config, Some(json!({ "enabled": true })));
        assert_eq!(modules[0].metadata, Some(vec!["v1".to_string()]));
    }

    #[test]
    fn test_global_is_shared() {
        ModuleRegistry::global().register_module("global-test", None, None);
        assert!(ModuleRegistry::global().get("global-test").is_some());
    }
}
