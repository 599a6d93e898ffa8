use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::error::StackError;
use crate::secret::SecretString;
use crate::stack::{ProgressSender, StackExecutor};
use crate::types::{ApplyMode, StackHandle, StackOutputs};

#[derive(Debug, Clone)]
pub struct ExecutionLimits {
    pub apply_timeout: Duration,
    /// Bound on every non-apply invocation (select, config, outputs).
    pub command_timeout: Duration,
    pub max_diagnostic_bytes: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            apply_timeout: Duration::from_secs(15 * 60),
            command_timeout: Duration::from_secs(2 * 60),
            max_diagnostic_bytes: 16 * 1024,
        }
    }
}

/// Drives a Pulumi project through the `pulumi` CLI. Each stack operation is
/// one engine invocation inside `work_dir`; child processes are killed when the
/// calling future is dropped.
#[derive(Debug, Clone)]
pub struct PulumiCliExecutor {
    binary: PathBuf,
    work_dir: PathBuf,
    access_token: Option<SecretString>,
    limits: ExecutionLimits,
}

impl PulumiCliExecutor {
    pub fn new(work_dir: impl Into<PathBuf>, limits: ExecutionLimits) -> Result<Self, StackError> {
        let work_dir = work_dir.into();
        if !work_dir.join("Pulumi.yaml").exists() {
            return Err(StackError::Spawn(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no Pulumi.yaml in {}", work_dir.display()),
            )));
        }
        Ok(Self {
            binary: PathBuf::from("pulumi"),
            work_dir,
            access_token: None,
            limits,
        })
    }

    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    #[must_use]
    pub fn with_access_token(mut self, token: SecretString) -> Self {
        self.access_token = Some(token);
        self
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    fn command(&self, stack: &StackHandle, args: &[&str]) -> Command {
        // Flags must precede a `--` separator or they become positionals.
        let split = args.iter().position(|arg| *arg == "--").unwrap_or(args.len());
        let (flags, positionals) = args.split_at(split);
        let mut command = Command::new(&self.binary);
        command
            .args(flags)
            .arg("--stack")
            .arg(&stack.name)
            .arg("--non-interactive")
            .args(positionals)
            .current_dir(&self.work_dir)
            .env("PULUMI_SKIP_UPDATE_CHECK", "true")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(token) = &self.access_token {
            command.env("PULUMI_ACCESS_TOKEN", token.expose());
        }
        command
    }

    /// Runs one engine command to completion within `command_timeout`,
    /// feeding `stdin` if given.
    async fn run(
        &self,
        stack: &StackHandle,
        args: &[&str],
        stdin: Option<&SecretString>,
    ) -> Result<CommandOutput, StackError> {
        let timeout = self.limits.command_timeout;
        tokio::time::timeout(timeout, self.run_to_end(stack, args, stdin))
            .await
            .map_err(|_| {
                warn!(
                    timeout_secs = timeout.as_secs(),
                    command = ?args,
                    "engine command timed out"
                );
                StackError::TimedOut(timeout.as_secs())
            })?
    }

    async fn run_to_end(
        &self,
        stack: &StackHandle,
        args: &[&str],
        stdin: Option<&SecretString>,
    ) -> Result<CommandOutput, StackError> {
        let mut command = self.command(stack, args);
        if stdin.is_some() {
            command.stdin(Stdio::piped());
        }
        let mut child = command.spawn()?;

        if let Some(value) = stdin
            && let Some(mut pipe) = child.stdin.take()
        {
            pipe.write_all(value.expose().as_bytes()).await?;
            pipe.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Streams stdout line by line into `progress` and returns the exit state
    /// together with everything written to stderr.
    async fn run_streaming(
        &self,
        stack: &StackHandle,
        args: &[&str],
        progress: ProgressSender,
    ) -> Result<CommandOutput, StackError> {
        let mut child = self.command(stack, args).spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StackError::Apply {
                diagnostic: "engine stdout was not captured".to_string(),
            })?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| StackError::Apply {
                diagnostic: "engine stderr was not captured".to_string(),
            })?;

        let forward = async {
            let mut lines = BufReader::new(stdout).lines();
            let mut tail = Vec::new();
            while let Some(line) = lines.next_line().await? {
                tail.push(line.clone());
                if tail.len() > 20 {
                    tail.remove(0);
                }
                // A dropped receiver only means nobody is listening.
                let _ = progress.send(line).await;
            }
            Ok::<_, std::io::Error>(tail.join("\n"))
        };
        let collect_stderr = async {
            let mut buffer = String::new();
            stderr.read_to_string(&mut buffer).await?;
            Ok::<_, std::io::Error>(buffer)
        };

        let (stdout_tail, stderr_text) = tokio::try_join!(forward, collect_stderr)?;
        let status = child.wait().await?;
        Ok(CommandOutput {
            success: status.success(),
            stdout: stdout_tail,
            stderr: stderr_text,
        })
    }

    async fn read_outputs(&self, stack: &StackHandle) -> Result<StackOutputs, StackError> {
        let output = self.run(stack, &["stack", "output", "--json"], None).await?;
        if !output.success {
            return Err(StackError::Outputs(
                self.diagnostic(&output.stderr, &output.stdout),
            ));
        }
        parse_outputs(&output.stdout)
    }

    fn diagnostic(&self, stderr: &str, stdout: &str) -> String {
        let text = if stderr.trim().is_empty() {
            stdout.trim()
        } else {
            stderr.trim()
        };
        truncate(text, self.limits.max_diagnostic_bytes)
    }
}

#[async_trait]
impl StackExecutor for PulumiCliExecutor {
    #[instrument(skip(self), fields(stack = %stack.name))]
    async fn select_stack(&self, stack: &StackHandle) -> Result<(), StackError> {
        let output = self.run(stack, &["stack", "select", "--create"], None).await?;
        if !output.success {
            return Err(StackError::Select {
                stack: stack.name.clone(),
                message: self.diagnostic(&output.stderr, &output.stdout),
            });
        }
        debug!("stack selected");
        Ok(())
    }

    #[instrument(skip(self, value), fields(stack = %stack.name))]
    async fn configure_secret(
        &self,
        stack: &StackHandle,
        key: &str,
        value: &SecretString,
    ) -> Result<(), StackError> {
        // The value goes through stdin so it never shows up in a process listing.
        let output = self
            .run(stack, &["config", "set", "--secret", "--", key], Some(value))
            .await?;
        if !output.success {
            return Err(StackError::Config {
                key: key.to_string(),
                message: self.diagnostic(&output.stderr, &output.stdout),
            });
        }
        debug!(key, "secret config set");
        Ok(())
    }

    #[instrument(skip(self), fields(stack = %stack.name))]
    async fn configure_value(
        &self,
        stack: &StackHandle,
        key: &str,
        value: &str,
    ) -> Result<(), StackError> {
        let output = self
            .run(stack, &["config", "set", "--", key, value], None)
            .await?;
        if !output.success {
            return Err(StackError::Config {
                key: key.to_string(),
                message: self.diagnostic(&output.stderr, &output.stdout),
            });
        }
        debug!(key, "config set");
        Ok(())
    }

    #[instrument(skip(self, progress), fields(stack = %stack.name))]
    async fn apply(
        &self,
        stack: &StackHandle,
        mode: ApplyMode,
        progress: ProgressSender,
    ) -> Result<StackOutputs, StackError> {
        let args: &[&str] = match mode {
            ApplyMode::DryRun => &["preview", "--diff"],
            ApplyMode::Apply => &["up", "--yes", "--skip-preview"],
        };
        let timeout = self.limits.apply_timeout;
        let output = tokio::time::timeout(timeout, self.run_streaming(stack, args, progress))
            .await
            .map_err(|_| {
                warn!(timeout_secs = timeout.as_secs(), "apply timed out");
                StackError::TimedOut(timeout.as_secs())
            })??;

        if !output.success {
            return Err(StackError::Apply {
                diagnostic: self.diagnostic(&output.stderr, &output.stdout),
            });
        }

        match mode {
            ApplyMode::DryRun => {
                info!("preview completed");
                Ok(StackOutputs::new())
            }
            ApplyMode::Apply => {
                let outputs = self.read_outputs(stack).await?;
                info!(
                    outputs = ?outputs.keys().collect::<Vec<_>>(),
                    "apply completed"
                );
                Ok(outputs)
            }
        }
    }
}

struct CommandOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

fn parse_outputs(stdout: &str) -> Result<StackOutputs, StackError> {
    let value: Value =
        serde_json::from_str(stdout).map_err(|err| StackError::Outputs(err.to_string()))?;
    match value {
        Value::Object(map) => Ok(map.into_iter().collect()),
        Value::Null => Ok(StackOutputs::new()),
        other => Err(StackError::Outputs(format!(
            "expected a JSON object, got {other}"
        ))),
    }
}

fn truncate(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... ({} bytes truncated)", &text[..end], text.len() - end)
}
