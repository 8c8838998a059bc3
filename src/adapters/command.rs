//! Subprocess collaborator.
//!
//! Spawns a configured command, pipes a JSON request describing the step to
//! stdin and reads a JSON `StateDelta` back from stdout. Exit code 75
//! (`EX_TEMPFAIL`) marks a transient failure; any other non-zero code is
//! permanent.

use std::collections::BTreeMap;
use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{Collaborator, CollaboratorError, StepContext};
use crate::domain::{PipelineState, RunConfig, StateDelta};

/// Exit code signalling a temporary failure (sysexits.h)
pub const EXIT_TEMPFAIL: i32 = 75;

#[derive(Serialize)]
struct CommandRequest<'a> {
    run_id: String,
    step: &'a str,
    attempt: u32,
    idempotency_key: &'a str,
    config: &'a RunConfig,
    fields: &'a BTreeMap<String, Value>,
}

/// Collaborator backed by an external program
pub struct CommandCollaborator {
    name: String,
    program: String,
    args: Vec<String>,
}

impl CommandCollaborator {
    /// Build from a command line; the first element is the program
    pub fn new(name: impl Into<String>, command: &[String]) -> Result<Self, CollaboratorError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| CollaboratorError::permanent("empty command"))?;

        Ok(Self {
            name: name.into(),
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    async fn run_process(&self, input: &[u8]) -> Result<Vec<u8>, CollaboratorError> {
        // Killed on drop, so an abandoned attempt (timeout/cancel) doesn't linger
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CollaboratorError::permanent(format!(
                    "failed to spawn '{}' for step '{}': {}",
                    self.program, self.name, e
                ))
            })?;

        // Feed stdin while draining stdout, or a chatty child and a large
        // request deadlock on full pipes
        let stdin = child.stdin.take();
        let write = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(input).await?;
            }
            // stdin dropped here, signalling EOF
            Ok::<(), io::Error>(())
        };
        let (written, output) = tokio::join!(write, child.wait_with_output());

        let output = output.map_err(|e| {
            CollaboratorError::transient(format!("failed to wait for '{}': {}", self.program, e))
        })?;

        match written {
            Ok(()) => {}
            // The child is free to ignore its input; the exit status decides
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!(program = %self.program, "Command exited without reading all of stdin");
            }
            Err(e) => {
                return Err(CollaboratorError::transient(format!(
                    "failed to write to '{}' stdin: {}",
                    self.program, e
                )))
            }
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            let message = format!(
                "'{}' exited with code {}: {}",
                self.program,
                exit_code,
                stderr.trim()
            );
            return Err(if exit_code == EXIT_TEMPFAIL {
                CollaboratorError::transient(message)
            } else {
                CollaboratorError::permanent(message)
            });
        }

        Ok(output.stdout)
    }
}

#[async_trait]
impl Collaborator for CommandCollaborator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        state: &PipelineState,
        ctx: &StepContext<'_>,
    ) -> Result<StateDelta, CollaboratorError> {
        let request = CommandRequest {
            run_id: state.run_id.to_string(),
            step: ctx.step,
            attempt: ctx.attempt,
            idempotency_key: ctx.idempotency_key,
            config: ctx.config,
            fields: &state.fields,
        };
        let input = serde_json::to_vec(&request)
            .map_err(|e| CollaboratorError::permanent(format!("failed to encode request: {}", e)))?;

        let stdout = self.run_process(&input).await?;
        debug!(step = ctx.step, bytes = stdout.len(), "Command finished");

        if stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(StateDelta::new());
        }

        serde_json::from_slice(&stdout).map_err(|e| {
            CollaboratorError::permanent(format!("'{}' returned invalid JSON: {}", self.program, e))
        })
    }
}
