use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::config::ToolsConfig;
use crate::llm::types::ToolSpec;
use crate::tools::{Tool, Typed, TypedTool};

/// Name → tool mapping plus the global switches.
///
/// Disabled tools are neither declared nor runnable.  Hidden tools are not
/// declared to the model but still run when called by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
    disabled: BTreeSet<String>,
    hidden: BTreeSet<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the `[tools]` switches from configuration.
    pub fn with_switches(mut self, switches: &ToolsConfig) -> Self {
        self.disabled = switches.disabled.clone();
        self.hidden = switches.hidden.clone();
        self
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_owned();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "tool registered twice, keeping the latest");
        }
    }

    pub fn register_typed<T: TypedTool>(&mut self, tool: T) {
        self.register(Arc::new(Typed(tool)));
    }

    /// Declarations to send to the model.
    ///
    /// `available` narrows the set to the named tools; `None` means every
    /// declarable tool.
    pub fn declarations(&self, available: Option<&[String]>) -> Vec<ToolSpec> {
        self.tools
            .iter()
            .filter(|(name, _)| !self.disabled.contains(*name) && !self.hidden.contains(*name))
            .filter(|(name, _)| available.is_none_or(|list| list.iter().any(|a| a == *name)))
            .map(|(_, tool)| tool.spec())
            .collect()
    }

    /// Find a runnable tool.
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Tool>> {
        if self.disabled.contains(name) {
            return None;
        }
        self.tools.get(name).cloned()
    }

    /// Hidden tools run when called even though they are never declared.
    pub fn is_hidden(&self, name: &str) -> bool {
        self.hidden.contains(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
