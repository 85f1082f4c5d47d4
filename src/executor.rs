use crate::rule_batch::TOOL;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::{timeout, Duration};

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Refusing to run '{0}': every command must start with '{tool}'", tool = TOOL)]
    DisallowedProgram(String),

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("'{command}' timed out after {secs} seconds", secs = .timeout.as_secs())]
    Timeout { command: String, timeout: Duration },

    #[error("'{command}' failed: [{status}] {diagnostic}")]
    Failed {
        command: String,
        status: std::process::ExitStatus,
        diagnostic: String,
    },
}

/// Runs rendered rule batches against the live firewall.
///
/// Each line of a batch is one invocation of the control-plane tool. No shell is involved.
#[derive(Debug, Clone)]
pub struct Executor {
    program: PathBuf,
    timeout: Duration,
    noop: bool,
    verbose: bool,
}

impl Executor {
    pub fn new(program: PathBuf, timeout: Duration, noop: bool, verbose: bool) -> Self {
        Self {
            program,
            timeout,
            noop,
            verbose,
        }
    }

    /// Runs every line in order, stopping at the first failure.
    ///
    /// Lines that already ran are not rolled back. Returns the collected stdout.
    pub async fn execute(&self, batch: &str) -> Result<String, ExecError> {
        if self.verbose {
            print!("{}", batch);
        }
        if self.noop {
            return Ok(String::new());
        }

        let mut stdout = String::new();
        for line in lines(batch) {
            stdout.push_str(&self.run_line(line).await?);
        }
        Ok(stdout)
    }

    /// Like `execute`, but collapses the outcome into "ran cleanly".
    ///
    /// A failing probe is the expected "not present" answer and is never an error.
    pub async fn execute_probe(&self, batch: &str) -> bool {
        if self.verbose {
            print!("{}", batch);
        }
        if self.noop {
            return false;
        }

        for line in lines(batch) {
            if let Err(e) = self.run_line(line).await {
                log::debug!("Probe negative: {}", e);
                return false;
            }
        }
        true
    }

    async fn run_line(&self, line: &str) -> Result<String, ExecError> {
        let mut words = line.split_whitespace();
        if words.next() != Some(TOOL) {
            return Err(ExecError::DisallowedProgram(line.to_string()));
        }
        let args = words.collect::<Vec<_>>();

        log::debug!("Running: {}", line);

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ExecError::Timeout {
                command: line.to_string(),
                timeout: self.timeout,
            })?
            .map_err(|source| ExecError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        let diagnostic = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        if !output.status.success() || !diagnostic.is_empty() {
            return Err(ExecError::Failed {
                command: line.to_string(),
                status: output.status,
                diagnostic,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn lines(batch: &str) -> impl Iterator<Item = &str> {
    batch.lines().map(str::trim).filter(|line| !line.is_empty())
}
