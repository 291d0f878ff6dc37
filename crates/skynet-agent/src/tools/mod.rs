//! Tool system for AI agent tool calling.
//!
//! Defines the `Tool` trait that all tools implement, plus a registry
//! for managing available tools and converting them to LLM API format.

pub mod executor;
pub mod list_files;
pub mod patch_file;
pub mod read_file;
pub mod script_tool;
pub mod search_files;
pub mod skill;
pub mod tool_loop;
pub mod write_file;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::provider::ToolDefinition;

/// Names of tools which, once they complete, force the orchestrator to
/// finalize the current turn and resume with a fresh streaming call — used
/// for tools whose output must be visible to the user before the model
/// continues (e.g. a generated file).
pub const TURN_BREAK_TOOLS: &[&str] = &["deliver_file"];

pub fn is_turn_break_tool(name: &str) -> bool {
    TURN_BREAK_TOOLS.contains(&name)
}

/// File bytes a tool produced, to be delivered to the user before the
/// conversation continues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolFileOutput {
    pub filename: String,
    pub mime_type: String,
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(&s)
            .map_err(serde::de::Error::custom)
    }
}

/// Result of executing a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Text content returned to the LLM.
    pub content: String,
    /// Whether the tool execution failed.
    pub is_error: bool,
    /// Populated when the tool produced a file the user should receive.
    #[serde(default)]
    pub file: Option<ToolFileOutput>,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
            file: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            is_error: true,
            file: None,
        }
    }

    /// A successful result that also carries a file for delivery.
    pub fn with_file(content: impl Into<String>, file: ToolFileOutput) -> Self {
        Self {
            content: content.into(),
            is_error: false,
            file: Some(file),
        }
    }
}

/// Trait that all tools must implement.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name for this tool (e.g. "read_file").
    fn name(&self) -> &str;
    /// Human-readable description of what this tool does.
    fn description(&self) -> &str;
    /// JSON Schema for the tool's input parameters.
    fn input_schema(&self) -> serde_json::Value;
    /// Execute the tool with the given input.
    async fn execute(&self, input: serde_json::Value) -> ToolResult;
}

/// Static catalog of all built-in tools (name, description).
///
/// Does not require instantiation or context -- useful for `/tools` listing.
pub fn tool_catalog() -> Vec<(&'static str, &'static str)> {
    vec![
        ("read_file", "Read the contents of a file"),
        ("write_file", "Write content to a file"),
        ("list_files", "List files in a directory"),
        ("search_files", "Search for text patterns in files"),
        ("patch_file", "Apply a patch to modify a file"),
        ("skill_read", "Read a named skill's full instructions"),
    ]
}

/// Convert a slice of tools to API-level tool definitions.
pub fn to_definitions(tools: &[Box<dyn Tool>]) -> Vec<ToolDefinition> {
    tools
        .iter()
        .map(|t| ToolDefinition {
            name: t.name().to_string(),
            description: t.description().to_string(),
            input_schema: t.input_schema(),
        })
        .collect()
}
