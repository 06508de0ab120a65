//! Backend that drives an external provisioner program.
//!
//! Protocol:
//!
//! - `<program> [args..] provision` with the provisioning spec exported as `BOOTGATE_*`
//!   variables. On success it prints one JSON object on stdout:
//!   `{"id": "...", "root": "...", "exec": [...], "env": {...}}`.
//!   Exit 69 means the builder is unavailable, exit 28 means the disk does
//!   not fit; any other non-zero exit is a build failure.
//! - `<program> [args..] teardown <id>` destroys the environment.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use bootgate_core::{Builder, ProvisioningSpec};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{ProvisionError, ProvisionResult};
use crate::{Environment, ProvisionBackend};

/// Exit status for "builder unavailable" (`EX_UNAVAILABLE`).
pub const EXIT_UNAVAILABLE: i32 = 69;
/// Exit status for "not enough disk" (`ENOSPC`).
pub const EXIT_NO_SPACE: i32 = 28;

const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Deserialize)]
struct ProvisionerResponse {
    id: String,
    root: PathBuf,
    #[serde(default)]
    exec: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CommandBackend {
    builder: Builder,
    program: PathBuf,
    args: Vec<String>,
}

impl CommandBackend {
    pub fn new(builder: Builder, program: impl Into<PathBuf>) -> Self {
        Self {
            builder,
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Arguments placed before the `provision`/`teardown` verb.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn unavailable(&self, reason: impl Into<String>) -> ProvisionError {
        ProvisionError::BuilderUnavailable {
            builder: self.builder.to_string(),
            reason: reason.into(),
        }
    }

    async fn invoke(&self, mut cmd: Command) -> ProvisionResult<Output> {
        cmd.output().await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                self.unavailable(format!("{} not found", self.program.display()))
            } else {
                ProvisionError::Io(err)
            }
        })
    }
}

fn stderr_tail(output: &Output) -> String {
    let text = String::from_utf8_lossy(&output.stderr);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

fn describe_exit(output: &Output) -> String {
    let tail = stderr_tail(output);
    if !tail.is_empty() {
        return tail;
    }
    match output.status.code() {
        Some(code) => format!("provisioner exited with code {}", code),
        None => "provisioner terminated by signal".to_string(),
    }
}

#[async_trait]
impl ProvisionBackend for CommandBackend {
    fn name(&self) -> &str {
        self.builder.name()
    }

    async fn provision(&self, spec: &ProvisioningSpec) -> ProvisionResult<Environment> {
        let mut cmd = self.command();
        cmd.arg("provision")
            .env("BOOTGATE_BUILDER", spec.builder.name())
            .env("BOOTGATE_DISK_GIB", spec.disk_gib.to_string())
            .env("BOOTGATE_CONTEXT", &spec.context)
            .env("BOOTGATE_ADD_DEPS", if spec.add_deps { "1" } else { "0" });
        if let Some(image) = &spec.base_image {
            cmd.env("BOOTGATE_IMAGE", image);
        }
        if let Some(image) = &spec.builder_image {
            cmd.env("BOOTGATE_BUILDER_IMAGE", image);
        }
        if let Some(workdir) = &spec.workdir {
            cmd.env("BOOTGATE_WORKDIR", workdir);
        }

        debug!(program = %self.program.display(), builder = %spec.builder, "invoking provisioner");
        let output = self.invoke(cmd).await?;

        match output.status.code() {
            Some(0) => {}
            Some(EXIT_UNAVAILABLE) => return Err(self.unavailable(describe_exit(&output))),
            Some(EXIT_NO_SPACE) => {
                return Err(ProvisionError::InsufficientDisk {
                    requested_gib: spec.disk_gib,
                    detail: describe_exit(&output),
                })
            }
            _ => return Err(ProvisionError::BuildFailed(describe_exit(&output))),
        }

        let response: ProvisionerResponse = serde_json::from_slice(&output.stdout)
            .map_err(|e| ProvisionError::BuildFailed(format!("invalid provisioner response: {}", e)))?;

        info!(env = %response.id, root = %response.root.display(), builder = %self.builder, "provisioned environment");
        Ok(Environment {
            id: response.id,
            builder: self.builder,
            root: response.root,
            exec_prefix: response.exec,
            env: response.env,
        })
    }

    async fn teardown(&self, env: Environment) -> ProvisionResult<()> {
        let mut cmd = self.command();
        cmd.arg("teardown")
            .arg(&env.id)
            .env("BOOTGATE_ENV_ROOT", &env.root);
        let output = self.invoke(cmd).await.map_err(|e| ProvisionError::Teardown {
            id: env.id.clone(),
            reason: e.to_string(),
        })?;
        if !output.status.success() {
            return Err(ProvisionError::Teardown {
                id: env.id,
                reason: describe_exit(&output),
            });
        }
        debug!(env = %env.id, "provisioner teardown complete");
        Ok(())
    }
}
