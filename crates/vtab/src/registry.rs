use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::Module;

/// The per-database registry of virtual-table modules, keyed by the
/// lowercased module name of the `USING` clause.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: RwLock<HashMap<String, Arc<dyn Module>>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, module: Arc<dyn Module>) {
        self.modules
            .write()
            .expect("module registry poisoned")
            .insert(name.into().to_ascii_lowercase(), module);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Module>> {
        self.modules
            .read()
            .expect("module registry poisoned")
            .get(&name.to_ascii_lowercase())
            .cloned()
    }
}
