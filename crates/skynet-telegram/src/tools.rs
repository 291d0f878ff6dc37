//! Client-side tool list for the Telegram adapter.
//!
//! Only the tools that need nothing but a filesystem path are wired up here.
//! `ExecuteCommandTool`/`BashSessionTool` (need a terminal session host),
//! `ReminderTool` (needs a scheduler), and `KnowledgeSearchTool`/
//! `KnowledgeWriteTool` (need the old memory knowledge base) all take a
//! `MessageContext` this adapter doesn't implement — see `DESIGN.md`.

use std::path::Path;

use skynet_agent::tools::list_files::ListFilesTool;
use skynet_agent::tools::patch_file::PatchFileTool;
use skynet_agent::tools::read_file::ReadFileTool;
use skynet_agent::tools::script_tool::load_script_tools;
use skynet_agent::tools::search_files::SearchFilesTool;
use skynet_agent::tools::skill::{load_skills, SkillReadTool};
use skynet_agent::tools::write_file::WriteFileTool;
use skynet_agent::tools::Tool;

/// Build the fixed set of client-side tools the orchestrator offers the model.
///
/// `tools_dir` is scanned for script-plugin manifests (`tool.toml`); a missing
/// directory yields no script tools rather than an error.
pub fn build_tools(tools_dir: &Path) -> Vec<Box<dyn Tool>> {
    let mut tools: Vec<Box<dyn Tool>> = vec![
        Box::new(ReadFileTool),
        Box::new(WriteFileTool),
        Box::new(ListFilesTool),
        Box::new(SearchFilesTool),
        Box::new(PatchFileTool),
        Box::new(SkillReadTool::new(load_skills())),
    ];
    tools.extend(load_script_tools(tools_dir));
    tools
}
