//! Workspace tools offered on top of the engine's protocol tools

mod command;
mod read;
mod write;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use skein_task::ToolRegistry;

pub use command::ExecuteCommandTool;
pub use read::ReadFileTool;
pub use write::WriteFileTool;

/// Protocol tools plus the workspace tools rooted at `workspace`
pub fn registry(workspace: &Path) -> ToolRegistry {
    let mut tools = ToolRegistry::with_builtins();
    tools.register(Arc::new(ReadFileTool::new(workspace)));
    tools.register(Arc::new(WriteFileTool::new(workspace)));
    tools.register(Arc::new(ExecuteCommandTool::new(workspace)));
    tools
}

/// Relative paths resolve against the workspace; `~/` against the home directory
pub(crate) fn resolve(workspace: &Path, path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_includes_workspace_tools() {
        let tools = registry(Path::new("/work"));
        let names = tools.names();
        for name in ["attempt_completion", "read_file", "write_to_file", "execute_command"] {
            assert!(names.iter().any(|n| n == name), "missing {name}");
        }
        assert!(tools.modifies_workspace("write_to_file"));
        assert!(!tools.modifies_workspace("read_file"));
    }

    #[test]
    fn test_resolve_relative_to_workspace() {
        assert_eq!(resolve(Path::new("/work"), "src/lib.rs"), PathBuf::from("/work/src/lib.rs"));
        assert_eq!(resolve(Path::new("/work"), "/etc/hosts"), PathBuf::from("/etc/hosts"));
    }
}
