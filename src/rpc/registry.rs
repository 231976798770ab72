//! Agent class registry.
//!
//! The Rust rendition of a class loader: class tags resolve to a nullary
//! constructor plus the class's dispatch table. Tables are built once at
//! registration and published immutably; readers never block on writers.

use std::sync::Arc;

use dashmap::DashMap;

use super::dispatch::MethodTable;
use crate::agent::{Agent, AgentClass};

struct AgentFactory {
    construct: fn() -> Box<dyn Agent>,
    table: Arc<MethodTable>,
}

/// Registry of instantiable agent classes.
#[derive(Default)]
pub struct AgentRegistry {
    factories: DashMap<String, AgentFactory>,
}

fn construct_boxed<A: AgentClass>() -> Box<dyn Agent> {
    Box::new(A::default())
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a class under its `CLASS_NAME`, building and publishing its
    /// dispatch table. Re-registering a name replaces the previous class.
    pub fn register<A: AgentClass>(&self) {
        let table = Arc::new(A::methods());
        tracing::debug!(
            class = A::CLASS_NAME,
            methods = ?table.method_names(),
            "registered agent class"
        );
        self.factories.insert(
            A::CLASS_NAME.to_string(),
            AgentFactory {
                construct: construct_boxed::<A>,
                table,
            },
        );
    }

    /// Construct a fresh, unconfigured instance of `class_name`.
    pub fn construct(&self, class_name: &str) -> Option<Box<dyn Agent>> {
        self.factories
            .get(class_name)
            .map(|factory| (factory.construct)())
    }

    /// The published dispatch table for `class_name`.
    pub fn table(&self, class_name: &str) -> Option<Arc<MethodTable>> {
        self.factories
            .get(class_name)
            .map(|factory| factory.table.clone())
    }

    pub fn contains(&self, class_name: &str) -> bool {
        self.factories.contains_key(class_name)
    }
}
