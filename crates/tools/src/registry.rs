//! Tool registry — a write-once static layer plus per-namespace dynamic
//! layers that external managers replace wholesale (e.g. discovered MCP
//! tools). Static always wins on name conflict; two dynamic namespaces may
//! never claim the same name.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use orchard_domain::tool::{ToolDefinition, ToolGroup};
use orchard_domain::{Error, Result};

use crate::Tool;

type ToolMap = HashMap<String, Arc<dyn Tool>>;

pub struct ToolRegistry {
    static_tools: RwLock<ToolMap>,
    /// namespace → copy-on-write snapshot of that namespace's tools.
    dynamic: RwLock<HashMap<String, Arc<ToolMap>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            static_tools: RwLock::new(HashMap::new()),
            dynamic: RwLock::new(HashMap::new()),
        }
    }

    // ── Writes ──────────────────────────────────────────────────────

    /// Register a built-in or app-provided tool. Duplicate names are
    /// rejected.
    pub fn register(&self, tool: Arc<dyn Tool>) -> Result<()> {
        let mut statics = self.static_tools.write();
        let name = tool.name().to_owned();
        if statics.contains_key(&name) {
            return Err(Error::Other(format!("tool '{name}' already registered")));
        }
        statics.insert(name, tool);
        Ok(())
    }

    /// Replace a dynamic namespace wholesale. Names that collide with
    /// another dynamic namespace are rejected; names shadowed by a static
    /// tool are accepted but the static tool keeps winning on lookup.
    pub fn set_namespace(&self, namespace: &str, tools: Vec<Arc<dyn Tool>>) -> Result<()> {
        let mut dynamic = self.dynamic.write();

        for tool in &tools {
            for (other_ns, members) in dynamic.iter() {
                if other_ns != namespace && members.contains_key(tool.name()) {
                    return Err(Error::Other(format!(
                        "tool '{}' already provided by namespace '{other_ns}'",
                        tool.name()
                    )));
                }
            }
        }

        let mut map = ToolMap::with_capacity(tools.len());
        for tool in tools {
            map.insert(tool.name().to_owned(), tool);
        }
        dynamic.insert(namespace.to_owned(), Arc::new(map));
        Ok(())
    }

    /// Drop a dynamic namespace and all its tools.
    pub fn remove_namespace(&self, namespace: &str) {
        self.dynamic.write().remove(namespace);
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        if let Some(tool) = self.static_tools.read().get(name) {
            return Some(tool.clone());
        }
        let dynamic = self.dynamic.read();
        for members in dynamic.values() {
            if let Some(tool) = members.get(name) {
                return Some(tool.clone());
            }
        }
        None
    }

    /// All visible tools, statics shadowing same-named dynamic entries.
    pub fn list(&self) -> Vec<Arc<dyn Tool>> {
        let statics = self.static_tools.read();
        let mut seen: ToolMap = statics.clone();
        for members in self.dynamic.read().values() {
            for (name, tool) in members.iter() {
                seen.entry(name.clone()).or_insert_with(|| tool.clone());
            }
        }
        let mut tools: Vec<_> = seen.into_values().collect();
        tools.sort_by(|a, b| a.name().cmp(b.name()));
        tools
    }

    pub fn list_by_group(&self, group: ToolGroup) -> Vec<Arc<dyn Tool>> {
        self.list()
            .into_iter()
            .filter(|t| t.group() == group)
            .collect()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.list()
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_owned(),
                description: t.description().to_owned(),
                parameters: t.parameters(),
            })
            .collect()
    }

    /// Definitions in OpenAI function-call wire format.
    pub fn openai_definitions(&self) -> Vec<Value> {
        self.definitions().iter().map(|d| d.to_openai()).collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
