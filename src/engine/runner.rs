//! CLI runner
//!
//! Runs one `cli.py -c <config>` process, streams its output into the log
//! and answers ACE-Step's "press Enter" prompt so unattended runs continue.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, Command};

use crate::engine::process::{apply_utf8_env, merge_output, quote_command, terminate, TERMINATE_GRACE};
use crate::engine::StopHandle;
use crate::types::job::JobId;

/// Printed by ACE-Step after it writes `instruction.txt` for review.
pub const AUTO_CONTINUE_PROMPT: &str = "Press Enter when ready to continue.";

/// Exit code reported when the process could not be started.
pub const SPAWN_FAILED_CODE: i32 = 999;

/// Exit code reported when the OS gives none (killed by a signal).
const NO_EXIT_CODE: i32 = -1;

/// One CLI generation process
#[derive(Debug, Clone)]
pub struct CliRunner {
    job_id: JobId,
    args: Vec<String>,
    cwd: PathBuf,
}

impl CliRunner {
    pub fn new(job_id: JobId, args: Vec<String>, cwd: PathBuf) -> Self {
        Self { job_id, args, cwd }
    }

    /// Run to completion or until `stop` fires; returns the exit code.
    pub async fn run(&self, stop: &StopHandle) -> i32 {
        let job = self.job_id;
        let Some((program, rest)) = self.args.split_first() else {
            tracing::error!(job, "Empty command line");
            return SPAWN_FAILED_CODE;
        };

        tracing::info!(job, "Command: {}", quote_command(&self.args));
        tracing::info!(job, "Working dir: {}", self.cwd.display());

        let mut cmd = Command::new(program);
        cmd.args(rest)
            .current_dir(&self.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        apply_utf8_env(&mut cmd);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(job, "Failed to start process: {}", e);
                return SPAWN_FAILED_CODE;
            }
        };

        let mut stdin = child.stdin.take();
        let mut lines = merge_output(&mut child);

        loop {
            tokio::select! {
                line = lines.recv() => {
                    let Some(line) = line else { break };
                    tracing::info!(job, "{}", line);

                    if line.contains(AUTO_CONTINUE_PROMPT) {
                        if let Some(stdin) = stdin.as_mut() {
                            tracing::info!(job, "Auto-pressed Enter to continue");
                            if let Err(e) = press_enter(stdin).await {
                                tracing::warn!(job, "Could not answer prompt: {}", e);
                            }
                        }
                    }
                }
                _ = stop.stopped() => {
                    tracing::info!(job, "Stop requested, terminating");
                    terminate(&mut child, TERMINATE_GRACE).await;
                    break;
                }
            }
        }

        drop(stdin);
        match child.wait().await {
            Ok(status) => status.code().unwrap_or(NO_EXIT_CODE),
            Err(e) => {
                tracing::error!(job, "Failed to wait for process: {}", e);
                SPAWN_FAILED_CODE
            }
        }
    }
}

async fn press_enter(stdin: &mut ChildStdin) -> std::io::Result<()> {
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}
