//! Flow-function registry: operator type names to factories.
//!
//! Built-in operators are registered at construction; user code adds its
//! own factories before the executor starts. The registry is read-only once
//! the workers run.

use std::collections::HashMap;

use log::debug;
use parking_lot::RwLock;

use crate::error::{FlowError, FlowResult};
use crate::flowfunc::count_batch::CountBatchFunc;
use crate::flowfunc::time_batch::TimeBatchFunc;
use crate::flowfunc::FlowFunc;

pub const COUNT_BATCH_FUNC_NAME: &str = "_BuiltIn_CountBatch";
pub const TIME_BATCH_FUNC_NAME: &str = "_BuiltIn_TimeBatch";

pub type FlowFuncFactory = Box<dyn Fn() -> Box<dyn FlowFunc> + Send + Sync>;

pub struct FlowFuncRegistry {
    factories: RwLock<HashMap<String, FlowFuncFactory>>,
}

impl Default for FlowFuncRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowFuncRegistry {
    pub fn new() -> Self {
        let registry = Self {
            factories: RwLock::new(HashMap::new()),
        };
        registry.register(COUNT_BATCH_FUNC_NAME, Box::new(|| {
            Box::new(CountBatchFunc::new()) as Box<dyn FlowFunc>
        }));
        registry.register(TIME_BATCH_FUNC_NAME, Box::new(|| {
            Box::new(TimeBatchFunc::new()) as Box<dyn FlowFunc>
        }));
        registry
    }

    /// Later registrations win, mirroring plugin override behaviour.
    pub fn register(&self, name: &str, factory: FlowFuncFactory) {
        debug!("register flow func [{name}]");
        self.factories.write().insert(name.to_string(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }

    pub fn create(&self, name: &str) -> FlowResult<Box<dyn FlowFunc>> {
        let factories = self.factories.read();
        let factory = factories.get(name).ok_or_else(|| {
            FlowError::ParamInvalid(format!("no flow func registered for [{name}]"))
        })?;
        Ok(factory())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered() {
        let registry = FlowFuncRegistry::new();
        assert!(registry.contains(COUNT_BATCH_FUNC_NAME));
        assert!(registry.contains(TIME_BATCH_FUNC_NAME));
        assert!(registry.create(COUNT_BATCH_FUNC_NAME).is_ok());
    }

    #[test]
    fn unknown_name_is_param_invalid() {
        let registry = FlowFuncRegistry::new();
        let result = registry.create("nope");
        assert!(matches!(result, Err(FlowError::ParamInvalid(_))));
    }
}
