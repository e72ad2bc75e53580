//! Tool calls answered from configuration.

use crate::ai::{ToolCall, ToolDeclaration, ToolResponse};
use crate::config::ToolConfig;
use serde_json::json;
use tracing::{debug, warn};

/// Static tool registry: each tool answers with the text configured for it.
#[derive(Debug, Clone)]
pub struct ToolBox {
    tools: Vec<ToolConfig>,
}

impl ToolBox {
    pub fn new(tools: Vec<ToolConfig>) -> Self {
        Self { tools }
    }

    /// Declarations sent to the AI service at setup time.
    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        self.tools
            .iter()
            .map(|tool| ToolDeclaration {
                name: tool.name.clone(),
                description: tool.description.clone(),
            })
            .collect()
    }

    /// Answer one call. Unknown tools get an error object rather than no answer,
    /// so the service is never left waiting.
    pub fn invoke(&self, call: &ToolCall) -> ToolResponse {
        let response = match self.tools.iter().find(|tool| tool.name == call.name) {
            Some(tool) => {
                debug!(tool = %tool.name, chars = tool.output.len(), "answering tool call");
                json!({ "output": tool.output })
            }
            None => {
                warn!(tool = %call.name, "unknown tool called");
                json!({ "error": format!("Unknown function: {}", call.name) })
            }
        };

        ToolResponse {
            id: call.id.clone(),
            name: call.name.clone(),
            response,
        }
    }
}
