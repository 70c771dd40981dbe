//! Subprocess-backed engine executor.
//!
//! Each engine is a CLI program. The dispatch request is written to the
//! program's stdin as JSON; whatever it prints to stdout is the result.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use taskrelay_core::Engine;
use taskrelay_engine::{DispatchError, DispatchRequest, EngineExecutor};

use crate::config::EngineCommand;

/// Errors from running an engine CLI.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to talk to '{program}': {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exited with {status}: {stderr}")]
    Exit {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<CommandError> for DispatchError {
    fn from(err: CommandError) -> Self {
        DispatchError::new(err.to_string())
    }
}

/// Runs engines as local subprocesses.
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor {
    overrides: HashMap<Engine, EngineCommand>,
}

impl CommandExecutor {
    pub fn new(overrides: HashMap<Engine, EngineCommand>) -> Self {
        Self { overrides }
    }

    /// Command line used for `engine`.
    pub fn command_for(&self, engine: Engine) -> EngineCommand {
        self.overrides
            .get(&engine)
            .cloned()
            .unwrap_or_else(|| EngineCommand::default_for(engine))
    }

    async fn run(&self, request: &DispatchRequest) -> Result<Value, CommandError> {
        let command = self.command_for(request.engine);
        let input = serde_json::to_vec(request)?;

        debug!(
            engine = %request.engine,
            program = %command.program,
            input_bytes = input.len(),
            "Spawning engine process"
        );

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::Spawn {
                program: command.program.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&input)
                .await
                .map_err(|source| CommandError::Io {
                    program: command.program.clone(),
                    source,
                })?;
            // Dropping stdin closes it so the engine sees EOF.
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|source| CommandError::Io {
                program: command.program.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(
                engine = %request.engine,
                status = %output.status,
                stderr = %stderr,
                "Engine process failed"
            );
            return Err(CommandError::Exit {
                program: command.program,
                status: output.status.to_string(),
                stderr,
            });
        }

        info!(
            engine = %request.engine,
            task_id = %request.task_id,
            output_bytes = output.stdout.len(),
            "Engine process completed"
        );
        Ok(parse_output(&output.stdout))
    }
}

#[async_trait]
impl EngineExecutor for CommandExecutor {
    async fn dispatch(&self, request: DispatchRequest) -> Result<Value, DispatchError> {
        self.run(&request).await.map_err(DispatchError::from)
    }
}

/// JSON stdout is returned as-is; anything else is wrapped as `{"output": text}`.
fn parse_output(stdout: &[u8]) -> Value {
    serde_json::from_slice(stdout).unwrap_or_else(|_| {
        let text = String::from_utf8_lossy(stdout).trim().to_string();
        serde_json::json!({ "output": text })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskrelay_core::{TaskId, TaskType};

    fn request(engine: Engine) -> DispatchRequest {
        DispatchRequest {
            engine,
            task_id: TaskId::new("task_test"),
            task_type: TaskType::Analysis,
            payload: json!({ "prompt": "hello" }),
        }
    }

    fn shell(script: &str) -> EngineCommand {
        EngineCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    #[test]
    fn test_parse_output() {
        assert_eq!(parse_output(br#"{"ok":true}"#), json!({ "ok": true }));
        assert_eq!(parse_output(b"plain text\n"), json!({ "output": "plain text" }));
    }

    #[test]
    fn test_default_command_is_engine_name() {
        let executor = CommandExecutor::default();
        assert_eq!(executor.command_for(Engine::Codex).program, "codex");
        assert!(executor.command_for(Engine::Codex).args.is_empty());
    }

    #[tokio::test]
    async fn test_request_is_written_to_stdin() {
        let executor = CommandExecutor::new(HashMap::from([(
            Engine::Gemini,
            EngineCommand {
                program: "cat".to_string(),
                args: Vec::new(),
            },
        )]));

        let result = executor.dispatch(request(Engine::Gemini)).await.unwrap();
        assert_eq!(result["engine"], json!("gemini"));
        assert_eq!(result["task_id"], json!("task_test"));
        assert_eq!(result["payload"]["prompt"], json!("hello"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_failure() {
        let executor = CommandExecutor::new(HashMap::from([(
            Engine::Grok,
            shell("cat >/dev/null; echo 'quota exceeded' >&2; exit 3"),
        )]));

        let err = executor.dispatch(request(Engine::Grok)).await.unwrap_err();
        assert!(err.message.contains("quota exceeded"), "{}", err.message);
    }

    #[tokio::test]
    async fn test_missing_program_is_failure() {
        let executor = CommandExecutor::new(HashMap::from([(
            Engine::Glm,
            EngineCommand {
                program: "/nonexistent/taskrelay-engine-cli".to_string(),
                args: Vec::new(),
            },
        )]));

        let err = executor.dispatch(request(Engine::Glm)).await.unwrap_err();
        assert!(err.message.starts_with("failed to spawn"));
    }
}
