//! Tools backed by shell commands, loaded from a JSON definition file.
//!
//! Each entry names a command that runs under `sh -c`. The model's raw JSON
//! arguments are written to the command's stdin and exported as
//! `BALLAST_TOOL_ARGS`; stdout (plus stderr, if any) becomes the result. A
//! non-zero exit status is a tool failure.
//!
//! ```json
//! [
//!   {
//!     "name": "word_count",
//!     "description": "Count words in the given text",
//!     "parameters": {"type": "object", "properties": {"text": {"type": "string"}}},
//!     "command": "jq -r .text | wc -w"
//!   }
//! ]
//! ```

use crate::ToolDef;
use crate::tools::core::{Tool, ToolError, ToolFuture};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Environment variable carrying the raw JSON arguments.
pub const ARGS_ENV_VAR: &str = "BALLAST_TOOL_ARGS";

/// One entry of a tool definition file.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandToolSpec {
    pub name: String,
    pub description: String,
    #[serde(default = "empty_object_schema")]
    pub parameters: serde_json::Value,
    pub command: String,
}

fn empty_object_schema() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// A tool that runs a fixed shell command.
#[derive(Debug, Clone)]
pub struct CommandTool {
    spec: CommandToolSpec,
    workdir: Option<PathBuf>,
}

impl CommandTool {
    pub fn new(spec: CommandToolSpec) -> Self {
        Self {
            spec,
            workdir: None,
        }
    }

    /// Run the command in `dir` instead of the current directory.
    pub fn workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    /// Load every tool from a JSON definition file.
    pub fn load_file(path: &Path) -> Result<Vec<CommandTool>, ToolError> {
        let definition_error = |message: String| ToolError::Definition {
            path: path.display().to_string(),
            message,
        };
        let content = std::fs::read_to_string(path).map_err(|e| definition_error(e.to_string()))?;
        let specs: Vec<CommandToolSpec> =
            serde_json::from_str(&content).map_err(|e| definition_error(e.to_string()))?;
        let mut seen = std::collections::HashSet::new();
        for spec in &specs {
            if spec.name.trim().is_empty() {
                return Err(definition_error("tool with empty name".to_string()));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(definition_error(format!("duplicate tool '{}'", spec.name)));
            }
        }
        Ok(specs.into_iter().map(CommandTool::new).collect())
    }
}

impl Tool for CommandTool {
    fn definition(&self) -> ToolDef {
        ToolDef::new(
            self.spec.name.clone(),
            self.spec.description.clone(),
            self.spec.parameters.clone(),
        )
    }

    fn execute(&self, arguments: &str) -> ToolFuture<'_> {
        let arguments = arguments.to_string();
        Box::pin(async move {
            let name = self.spec.name.as_str();
            let mut cmd = Command::new("sh");
            cmd.arg("-c")
                .arg(&self.spec.command)
                .env(ARGS_ENV_VAR, &arguments)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            if let Some(dir) = &self.workdir {
                cmd.current_dir(dir);
            }

            let mut child = cmd
                .spawn()
                .map_err(|e| ToolError::failed(name, format!("failed to start command: {e}")))?;
            if let Some(mut stdin) = child.stdin.take() {
                // A command that ignores stdin may close it early.
                if let Err(e) = stdin.write_all(arguments.as_bytes()).await {
                    debug!("Tool {name}: stdin write failed: {e}");
                }
            }
            let output = child
                .wait_with_output()
                .await
                .map_err(|e| ToolError::failed(name, format!("failed to wait for command: {e}")))?;

            let text = format_output(&output.stdout, &output.stderr);
            if output.status.success() {
                Ok(text)
            } else {
                Err(ToolError::failed(
                    name,
                    format!("exit status {}: {}", output.status, text.trim()),
                ))
            }
        })
    }
}

fn format_output(stdout: &[u8], stderr: &[u8]) -> String {
    let stdout = String::from_utf8_lossy(stdout);
    let stderr = String::from_utf8_lossy(stderr);
    if stderr.trim().is_empty() {
        stdout.into_owned()
    } else if stdout.trim().is_empty() {
        format!("[stderr]\n{stderr}")
    } else {
        format!("{stdout}\n[stderr]\n{stderr}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::core::ToolSet;
    use std::io::Write;

    fn spec(name: &str, command: &str) -> CommandToolSpec {
        CommandToolSpec {
            name: name.to_string(),
            description: "test".to_string(),
            parameters: empty_object_schema(),
            command: command.to_string(),
        }
    }

    #[tokio::test]
    async fn arguments_arrive_on_stdin_and_env() {
        let tool = CommandTool::new(spec("cat_args", "cat; echo; echo \"$BALLAST_TOOL_ARGS\""));
        let out = tool.execute(r#"{"x":1}"#).await.unwrap();
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines, vec![r#"{"x":1}"#, r#"{"x":1}"#]);
    }

    #[tokio::test]
    async fn non_zero_exit_is_failure() {
        let tool = CommandTool::new(spec("fails", "echo oops >&2; exit 3"));
        match tool.execute("{}").await.unwrap_err() {
            ToolError::Failed { tool, message } => {
                assert_eq!(tool, "fails");
                assert!(message.contains("oops"), "{message}");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn runs_in_workdir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();
        let tool = CommandTool::new(spec("ls", "cat marker.txt")).workdir(dir.path());
        assert_eq!(tool.execute("{}").await.unwrap(), "here");
    }

    #[test]
    fn load_file_parses_definitions() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"name":"a","description":"A","command":"echo a"}},
                {{"name":"b","description":"B","parameters":{{"type":"object"}},"command":"echo b"}}]"#
        )
        .unwrap();
        let tools = CommandTool::load_file(file.path()).unwrap();
        let set = tools.into_iter().fold(ToolSet::new(), |set, t| set.with(t));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn load_file_rejects_duplicates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"name":"a","description":"A","command":"true"}},{{"name":"a","description":"A","command":"true"}}]"#
        )
        .unwrap();
        let err = CommandTool::load_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("duplicate tool 'a'"));
    }

    #[test]
    fn stderr_section_only_when_present() {
        assert_eq!(format_output(b"out", b""), "out");
        assert_eq!(format_output(b"", b"err"), "[stderr]\nerr");
        assert_eq!(format_output(b"out", b"err"), "out\n[stderr]\nerr");
    }
}
