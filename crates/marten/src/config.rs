// Load options
//
// Builder-style knobs read once by the loader and by the backend switches:
//
//   let opts = LoadOptions::default()
//       .with_precision(DType::F16)
//       .with_prune(true)
//       .no_convert_constant("embedding.weight");

use std::collections::HashSet;
use std::sync::Arc;

use marten_core::DType;

use crate::ops::OperatorRegistry;

/// How a model is loaded and which parts stay put on backend switches.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Float initializers are rounded through this type (F32 or F16).
    pub precision: DType,
    /// Remove nodes whose outputs are never used instead of failing.
    pub prune: bool,
    /// Constants left on their current backend by `to_*` switches.
    pub no_convert_constants: HashSet<String>,
    /// Nodes (by name) whose configuration is left on its current backend.
    pub no_convert_nodes: HashSet<String>,
    /// Operator constructors available to the loader.
    pub registry: Arc<OperatorRegistry>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            precision: DType::F32,
            prune: false,
            no_convert_constants: HashSet::new(),
            no_convert_nodes: HashSet::new(),
            registry: Arc::new(OperatorRegistry::with_builtins()),
        }
    }
}

impl LoadOptions {
    /// Set the initializer precision.
    pub fn with_precision(mut self, precision: DType) -> Self {
        self.precision = precision;
        self
    }

    /// Enable or disable dead-node pruning.
    pub fn with_prune(mut self, prune: bool) -> Self {
        self.prune = prune;
        self
    }

    /// Keep constant `name` where it is on backend switches.
    pub fn no_convert_constant(mut self, name: impl Into<String>) -> Self {
        self.no_convert_constants.insert(name.into());
        self
    }

    /// Keep node `name`'s configuration where it is on backend switches.
    pub fn no_convert_node(mut self, name: impl Into<String>) -> Self {
        self.no_convert_nodes.insert(name.into());
        self
    }

    /// Use a custom operator registry.
    pub fn with_registry(mut self, registry: OperatorRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }
}
