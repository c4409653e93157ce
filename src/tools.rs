// Tool registry. Tool bodies are black boxes behind the handler trait; the
// orchestrator dispatches to them by name and treats their output as
// opaque.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// A callable tool. Implementations may block on I/O; the orchestrator
/// runs them on their own tasks.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// JSON Schema for the arguments object.
    fn parameters(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    /// Execute with parsed arguments. `Err` is a handler-reported failure;
    /// the orchestrator converts it into an error output and continues.
    async fn execute(&self, arguments: Value) -> Result<Value, String>;
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: ToolHandler + 'static>(mut self, tool: T) -> Self {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(name).cloned()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    /// Tool specs in the uniform internal function shape.
    pub fn specs(&self) -> Vec<Value> {
        self.tools
            .values()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name(),
                        "description": tool.description(),
                        "parameters": tool.parameters(),
                    },
                })
            })
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::test_tools::GetTime;
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let registry = ToolRegistry::new().register(GetTime);
        assert!(registry.has_tool("get_time"));
        assert!(!registry.has_tool("missing"));
        assert!(registry.get("get_time").is_some());
    }

    #[test]
    fn test_specs_are_uniform_shape() {
        let registry = ToolRegistry::new().register(GetTime);
        let specs = registry.specs();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0]["type"], "function");
        assert_eq!(specs[0]["function"]["name"], "get_time");
        assert_eq!(specs[0]["function"]["parameters"]["type"], "object");
    }

    #[tokio::test]
    async fn test_execute() {
        let registry = ToolRegistry::new().register(GetTime);
        let tool = registry.get("get_time").unwrap();
        assert_eq!(tool.execute(json!({})).await.unwrap(), json!("12:00"));
    }
}
