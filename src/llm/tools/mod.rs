use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

pub mod leads;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Invalid tool parameters: {0}")]
    InvalidParameters(String),
}

/// Handler invoked with the parsed call arguments; the returned text becomes
/// the next `function` turn of the transcript.
pub type ToolHandler = fn(Value) -> BoxFuture<'static, Result<String, ToolError>>;

/// A side effect the model may invoke
#[derive(Clone)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    /// Spoken to the caller before the handler runs
    pub say: String,
    pub handler: ToolHandler,
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("say", &self.say)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: Vec<Tool>,
    by_name: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any earlier tool with the same name
    pub fn register_tool(&mut self, tool: Tool) {
        match self.by_name.get(&tool.name) {
            Some(&idx) => self.tools[idx] = tool,
            None => {
                self.by_name.insert(tool.name.clone(), self.tools.len());
                self.tools.push(tool);
            }
        }
    }

    pub fn get_tools(&self) -> &[Tool] {
        &self.tools
    }

    pub fn find_tool(&self, name: &str) -> Option<&Tool> {
        self.by_name.get(name).map(|&idx| &self.tools[idx])
    }

    /// Tool definitions for LLM function calling
    pub fn get_tool_definitions(&self) -> Vec<Value> {
        self.tools
            .iter()
            .map(|tool| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters
                    }
                })
            })
            .collect()
    }
}

/// Parse streamed call arguments.
///
/// Arguments arrive as shards of one JSON document. Some completions repeat
/// the whole document, leaving two objects back to back; in that case the
/// first `{` .. first `}` slice is parsed instead.
pub fn recover_arguments(raw: &str) -> Result<Value, ToolError> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }

    match serde_json::from_str::<Value>(raw) {
        Ok(value) => Ok(value),
        Err(parse_err) => {
            log::warn!("Malformed tool arguments, attempting recovery: {}", raw);
            let start = raw.find('{');
            let end = start.and_then(|s| raw[s..].find('}').map(|e| s + e));
            match (start, end) {
                (Some(start), Some(end)) => serde_json::from_str(&raw[start..=end]).map_err(|e| {
                    ToolError::InvalidParameters(format!("unrecoverable arguments: {}", e))
                }),
                _ => Err(ToolError::InvalidParameters(parse_err.to_string())),
            }
        }
    }
}

/// Registry with the lead-generation agent's side effects
pub fn create_default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    registry.register_tool(Tool {
        name: "check_lead_availability".to_string(),
        description: "Check whether callback leads of a given type can be generated in a region, with the expected price".to_string(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "lead_type": {
                    "type": "string",
                    "description": "The kind of leads the caller wants, e.g. 'roofing' or 'mortgage'"
                },
                "region": {
                    "type": "string",
                    "description": "Target region, using short forms like 'ON' or 'BC' where possible"
                }
            },
            "required": ["lead_type", "region"]
        }),
        say: "Let me check that for you.".to_string(),
        handler: leads::check_lead_availability,
    });

    registry.register_tool(Tool {
        name: "schedule_callback".to_string(),
        description: "Book a callback with a lead generation expert".to_string(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "callback_time": {
                    "type": "string",
                    "description": "Preferred date and time for the callback. 'asap' is valid."
                },
                "phone_number": {
                    "type": "string",
                    "description": "Number the expert should call"
                },
                "lead_type": {
                    "type": "string",
                    "description": "The kind of leads discussed on the call"
                }
            },
            "required": ["callback_time", "phone_number"]
        }),
        say: "Perfect, I'm booking that callback now.".to_string(),
        handler: leads::schedule_callback,
    });

    registry
}
