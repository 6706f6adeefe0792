//! Capability registry: the full tool catalog, keyed by name.

use std::collections::HashMap;
use std::sync::Arc;

use super::tool::Tool;
use super::types::ToolDefinition;
use crate::error::ParleyError;

/// The complete set of tools known to the process.
///
/// Populated once at startup and shared read-only afterwards. Tools are kept
/// in registration order so catalogs sent to the model are stable.
#[derive(Default, Clone)]
pub struct CapabilityRegistry {
    tools: Vec<Arc<dyn Tool>>,
    index: HashMap<String, usize>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool. Names must be unique.
    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), ParleyError> {
        self.register_arc(Arc::new(tool))
    }

    /// Add an already shared tool.
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<(), ParleyError> {
        let name = tool.name().to_string();
        if self.index.contains_key(&name) {
            return Err(ParleyError::Configuration(format!(
                "tool '{name}' is already registered"
            )));
        }
        self.index.insert(name, self.tools.len());
        self.tools.push(tool);
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, tool: impl Tool + 'static) -> Result<Self, ParleyError> {
        self.register(tool)?;
        Ok(self)
    }

    /// Look a tool up by name.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Tool>, ParleyError> {
        self.get(name)
            .ok_or_else(|| ParleyError::InvalidArgument(format!("Unknown tool: {name}")))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.index.get(name).map(|&i| Arc::clone(&self.tools[i]))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Tool names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Tool>> {
        self.tools.iter()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| ToolDefinition::of(t.as_ref())).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("tools", &self.names())
            .finish()
    }
}
