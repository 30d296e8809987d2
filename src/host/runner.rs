//! External command execution.
//!
//! Every host mutation that is not a plain file edit goes through a
//! `CommandRunner`, so dry runs and tests can observe the exact argv instead
//! of touching the machine.
use crate::util::{tail_lines, truncate_string};
use anyhow::{anyhow, Context, Result};
use std::collections::VecDeque;
use std::fmt;
use std::io::Write;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::Instant;

const STDERR_TAIL_LINES: usize = 20;
const STDERR_TAIL_BYTES: usize = 4096;

/// One program invocation with its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    program: String,
    args: Vec<String>,
    stdin: Option<String>,
    inherit_output: bool,
}

impl HostCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            inherit_output: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Stream output to the terminal instead of capturing it (package managers).
    pub fn inherit_output(mut self) -> Self {
        self.inherit_output = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&shell_words::join(self.argv()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

pub trait CommandRunner: Send + Sync {
    /// Run to completion; a non-zero exit is an error carrying the stderr tail.
    fn run(&self, command: &HostCommand) -> Result<CommandOutput>;

    /// True when commands are only recorded, never executed.
    fn is_dry_run(&self) -> bool {
        false
    }
}

/// Executes commands on the real host.
#[derive(Debug, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, command: &HostCommand) -> Result<CommandOutput> {
        let program = which::which(command.program())
            .with_context(|| format!("`{}` not found on PATH", command.program()))?;
        tracing::info!(command = %command, "run");
        let start = Instant::now();

        let mut child_cmd = Command::new(&program);
        child_cmd
            .args(&command.args)
            // Own process group: a terminal Ctrl-C reaches vmprep, not a half-done install.
            .process_group(0)
            .stdin(if command.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        if command.inherit_output {
            child_cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            child_cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
        let mut child = child_cmd
            .spawn()
            .with_context(|| format!("spawn {}", command.program()))?;
        if let (Some(input), Some(mut stdin)) = (&command.stdin, child.stdin.take()) {
            stdin
                .write_all(input.as_bytes())
                .with_context(|| format!("write stdin of {}", command.program()))?;
        }
        let output = child
            .wait_with_output()
            .with_context(|| format!("wait for {}", command.program()))?;
        let elapsed_ms = start.elapsed().as_millis();
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        tracing::debug!(
            program = command.program(),
            elapsed_ms,
            stdout_bytes = stdout.len(),
            status = %output.status,
            "command finished"
        );

        if !output.status.success() {
            let tail = truncate_string(
                &tail_lines(stderr.trim(), STDERR_TAIL_LINES),
                STDERR_TAIL_BYTES,
            );
            return Err(if tail.is_empty() {
                anyhow!("`{command}` failed with {}", output.status)
            } else {
                anyhow!("`{command}` failed with {}: {tail}", output.status)
            });
        }
        Ok(CommandOutput { stdout, stderr })
    }
}

/// Records commands instead of running them.
///
/// Scripted responses let tests feed output to commands whose stdout matters.
#[derive(Debug, Default)]
pub struct DryRunRunner {
    log: Mutex<Vec<HostCommand>>,
    responses: Mutex<VecDeque<(String, Result<String, String>)>>,
}

impl DryRunRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue stdout for the next command whose rendered text starts with `prefix`.
    pub fn respond(&self, prefix: &str, stdout: &str) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push_back((prefix.to_string(), Ok(stdout.to_string())));
        }
    }

    /// Queue a failure for the next command whose rendered text starts with `prefix`.
    pub fn fail(&self, prefix: &str, message: &str) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push_back((prefix.to_string(), Err(message.to_string())));
        }
    }

    /// Rendered command lines in execution order.
    pub fn commands(&self) -> Vec<String> {
        self.log
            .lock()
            .map(|log| log.iter().map(ToString::to_string).collect())
            .unwrap_or_default()
    }
}

impl CommandRunner for DryRunRunner {
    fn run(&self, command: &HostCommand) -> Result<CommandOutput> {
        let rendered = command.to_string();
        tracing::info!(command = %rendered, "dry run");
        self.log
            .lock()
            .map_err(|_| anyhow!("dry-run log poisoned"))?
            .push(command.clone());

        let mut responses = self
            .responses
            .lock()
            .map_err(|_| anyhow!("dry-run responses poisoned"))?;
        let index = responses
            .iter()
            .position(|(prefix, _)| rendered.starts_with(prefix.as_str()));
        let scripted = index.and_then(|index| responses.remove(index));
        match scripted {
            Some((_, Ok(stdout))) => Ok(CommandOutput {
                stdout,
                stderr: String::new(),
            }),
            Some((_, Err(message))) => Err(anyhow!("`{rendered}` failed: {message}")),
            None => Ok(CommandOutput::default()),
        }
    }

    fn is_dry_run(&self) -> bool {
        true
    }
}
