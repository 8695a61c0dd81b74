//! Static registry of module kinds
//!
//! Configuration files name stages by kind; the registry maps each kind to a
//! factory building the module from its JSON settings. The built-in kinds are
//! registered on first use, applications may add their own with
//! [`register_module`].

use super::errors::StageResult;
use super::node::Module;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub type ModuleFactory = Box<dyn Fn(&Value) -> StageResult<Box<dyn Module>> + Send + Sync>;

pub(crate) struct ModuleRegistry {
    factories: HashMap<String, ModuleFactory>,
}

impl ModuleRegistry {
    fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&Value) -> StageResult<Box<dyn Module>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_string(), Box::new(factory));
    }

    pub(crate) fn create(&self, kind: &str, settings: &Value) -> Option<StageResult<Box<dyn Module>>> {
        self.factories.get(kind).map(|factory| factory(settings))
    }

    pub(crate) fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

lazy_static::lazy_static! {
    pub(crate) static ref MODULE_REGISTRY: Arc<Mutex<ModuleRegistry>> = {
        use crate::acquisition::{Amplifier, SimulatedDevice};
        use crate::nodes::{Filter, Reference, Storage, TriggerDetector};
        use crate::rda::{RdaClient, RdaServer};

        let mut registry = ModuleRegistry::new();
        registry.register("amplifier", |s| {
            Ok(Box::new(Amplifier::from_settings(Box::new(SimulatedDevice::default()), s)?))
        });
        registry.register("filter", |s| Ok(Box::new(Filter::from_settings(s)?)));
        registry.register("reference", |s| Ok(Box::new(Reference::from_settings(s)?)));
        registry.register("trigger", |s| Ok(Box::new(TriggerDetector::from_settings(s)?)));
        registry.register("storage", |s| Ok(Box::new(Storage::from_settings(s)?)));
        registry.register("rda_server", |s| Ok(Box::new(RdaServer::from_settings(s)?)));
        registry.register("rda_client", |s| Ok(Box::new(RdaClient::from_settings(s)?)));

        Arc::new(Mutex::new(registry))
    };
}

/// Register a custom module kind for use in configuration files
pub fn register_module<F>(kind: &str, factory: F)
where
    F: Fn(&Value) -> StageResult<Box<dyn Module>> + Send + Sync + 'static,
{
    MODULE_REGISTRY.lock().unwrap().register(kind, factory);
}

/// Build a module of a registered kind; `None` if the kind is unknown
pub fn create_module(kind: &str, settings: &Value) -> Option<StageResult<Box<dyn Module>>> {
    MODULE_REGISTRY.lock().unwrap().create(kind, settings)
}

/// All registered kinds, sorted
pub fn registered_kinds() -> Vec<String> {
    MODULE_REGISTRY.lock().unwrap().kinds()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::Passthrough;

    #[test]
    fn test_builtin_kinds_are_registered() {
        let kinds = registered_kinds();
        for kind in ["amplifier", "filter", "reference", "trigger", "storage", "rda_server", "rda_client"] {
            assert!(kinds.contains(&kind.to_string()), "missing kind {}", kind);
        }
    }

    #[test]
    fn test_custom_kind() {
        register_module("passthrough_test", |_| Ok(Box::new(Passthrough::default())));
        let module = create_module("passthrough_test", &Value::Null)
            .expect("kind should be known")
            .unwrap();
        assert_eq!(module.name(), "Passthrough");
        assert!(create_module("no_such_kind", &Value::Null).is_none());
    }
}
