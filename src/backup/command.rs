//! Privileged command execution with timeouts and structured results
//!
//! Commands are built as explicit argument vectors. The only shell use is
//! for pipelines (`a | b > file`), which are rendered with every token
//! quoted and are limited to an allowlist of backup tools.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, warn};

/// Programs that may appear as a stage of a shell pipeline
pub const PIPELINE_ALLOWLIST: &[&str] = &["mysqldump", "mysql", "gzip", "gunzip", "tar"];

/// Seconds `timeout(1)` waits after TERM before sending KILL to elevated commands
const ELEVATED_KILL_GRACE_SECS: u64 = 10;

/// A command to execute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// A single program with its arguments, executed without a shell
    Direct(Vec<String>),
    /// Stages joined by pipes, optionally redirecting the last stage's stdout to a file
    Pipeline {
        stages: Vec<Vec<String>>,
        output: Option<PathBuf>,
    },
}

impl Invocation {
    /// Build a direct invocation from program and arguments
    pub fn direct<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Invocation::Direct(argv.into_iter().map(Into::into).collect())
    }

    /// Build a pipeline from its stages
    pub fn pipeline(stages: Vec<Vec<String>>) -> Self {
        Invocation::Pipeline {
            stages,
            output: None,
        }
    }

    /// Redirect the pipeline's final stdout into `path`
    pub fn with_output(self, path: &Path) -> Self {
        match self {
            Invocation::Pipeline { stages, .. } => Invocation::Pipeline {
                stages,
                output: Some(path.to_path_buf()),
            },
            direct => direct,
        }
    }

    /// Program names this invocation will start
    pub fn programs(&self) -> Vec<&str> {
        match self {
            Invocation::Direct(argv) => argv.first().map(String::as_str).into_iter().collect(),
            Invocation::Pipeline { stages, .. } => stages
                .iter()
                .filter_map(|stage| stage.first().map(String::as_str))
                .collect(),
        }
    }

    /// Render the argument vector handed to the OS, without privilege escalation
    pub fn to_argv(&self) -> Result<Vec<String>, String> {
        match self {
            Invocation::Direct(argv) => {
                if argv.is_empty() || argv[0].is_empty() {
                    return Err("Empty command".to_string());
                }
                Ok(argv.clone())
            }
            Invocation::Pipeline { stages, output } => {
                if stages.is_empty() {
                    return Err("Empty pipeline".to_string());
                }
                let mut rendered = Vec::with_capacity(stages.len());
                for stage in stages {
                    let program = stage
                        .first()
                        .ok_or_else(|| "Empty pipeline stage".to_string())?;
                    if !PIPELINE_ALLOWLIST.contains(&program.as_str()) {
                        return Err(format!("Program not allowed in a pipeline: {}", program));
                    }
                    let quoted: Vec<String> = stage.iter().map(|t| shell_quote(t)).collect();
                    rendered.push(quoted.join(" "));
                }

                let mut script = format!("set -o pipefail; {}", rendered.join(" | "));
                if let Some(path) = output {
                    script.push_str(" > ");
                    script.push_str(&shell_quote(&path.to_string_lossy()));
                }
                Ok(vec!["bash".to_string(), "-c".to_string(), script])
            }
        }
    }
}

/// Quote a token for a POSIX shell
pub fn shell_quote(token: &str) -> String {
    format!("'{}'", token.replace('\'', "'\\''"))
}

/// Captured result of a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    /// Process exit code; `None` when the process never ran to completion
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    /// A failed result that never produced a process exit status
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: message.into(),
            exit_code: None,
        }
    }

    /// The most useful diagnostic text: stderr, falling back to stdout
    pub fn diagnostic(&self) -> String {
        if !self.stderr.is_empty() {
            self.stderr.clone()
        } else if !self.stdout.is_empty() {
            self.stdout.clone()
        } else {
            match self.exit_code {
                Some(code) => format!("Command exited with status {}", code),
                None => "Command failed".to_string(),
            }
        }
    }

    /// Whether the failure was caused by the timeout
    pub fn timed_out(&self) -> bool {
        !self.success && self.exit_code.is_none() && self.stderr.starts_with("Command timed out")
    }
}

/// Runs host commands on behalf of the backup engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `invocation`, giving up after `timeout`. Never fails: errors are
    /// reported through [`CommandOutput`].
    async fn run(&self, invocation: &Invocation, timeout: Duration) -> CommandOutput;
}

/// Runs commands on the host, optionally through `sudo -n`
#[derive(Debug, Clone)]
pub struct SystemCommandRunner {
    use_sudo: bool,
}

impl SystemCommandRunner {
    pub fn new(use_sudo: bool) -> Self {
        Self { use_sudo }
    }

    /// Argument vector handed to the OS
    ///
    /// Elevated commands are bounded by `timeout(1)` inside sudo as well,
    /// since root-owned stages cannot be signalled from here.
    fn build_argv(&self, invocation: &Invocation, timeout: Duration) -> Result<Vec<String>, String> {
        let argv = invocation.to_argv()?;
        if self.use_sudo {
            let mut elevated = vec![
                "sudo".to_string(),
                "-n".to_string(),
                "timeout".to_string(),
                format!("--kill-after={}", ELEVATED_KILL_GRACE_SECS),
                timeout.as_secs().max(1).to_string(),
            ];
            elevated.extend(argv);
            Ok(elevated)
        } else {
            Ok(argv)
        }
    }
}

/// Kills a child's whole process group when dropped, unless disarmed
///
/// Pipeline stages run as grandchildren of the spawned shell, so killing
/// the direct child alone would leave them running.
struct ProcessGroupGuard {
    pgid: Option<i32>,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.and_then(|pid| i32::try_from(pid).ok()),
        }
    }

    /// The group finished on its own
    fn disarm(&mut self) {
        self.pgid = None;
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            // SAFETY: killpg has no memory-safety preconditions
            let ret = unsafe { libc::killpg(pgid, libc::SIGKILL) };
            if ret != 0 {
                debug!(pgid, error = %std::io::Error::last_os_error(), "Failed to kill process group");
            }
        }
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, invocation: &Invocation, timeout: Duration) -> CommandOutput {
        let argv = match self.build_argv(invocation, timeout) {
            Ok(argv) => argv,
            Err(e) => return CommandOutput::failure(e),
        };

        debug!(programs = ?invocation.programs(), timeout_secs = timeout.as_secs(), "Running command");

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Own process group, so every stage can be killed at once
            .process_group(0)
            .kill_on_drop(true);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(program = %argv[0], error = %e, "Failed to start command");
                return CommandOutput::failure(format!("Failed to start {}: {}", argv[0], e));
            }
        };

        // Dropped with this future on shutdown, killing the group
        let mut group = ProcessGroupGuard::new(child.id());

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Err(_) => {
                group.kill();
                warn!(programs = ?invocation.programs(), timeout_secs = timeout.as_secs(), "Command timed out");
                CommandOutput::failure(format!(
                    "Command timed out after {} seconds",
                    timeout.as_secs()
                ))
            }
            Ok(Err(e)) => CommandOutput::failure(e.to_string()),
            Ok(Ok(output)) => {
                group.disarm();
                CommandOutput {
                    success: output.status.success(),
                    stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                    exit_code: output.status.code(),
                }
            }
        }
    }
}
