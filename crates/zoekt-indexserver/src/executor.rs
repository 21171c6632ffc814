// Copyright 2025 HyperZoekt Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Liveness watchdog around one child indexer process.
//!
//! The child is expected to emit at least one byte of output within every
//! watchdog window while alive. A stalled child first gets SIGQUIT so it can
//! dump its stacks, then SIGKILL ten seconds later. Hard wall-clock timeouts
//! are too crude for large monorepos; no-progress is the liveness proxy.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Index commands should output something every 100 MB they process. Clients
/// with large monorepos have shown that anything shorter than this gets
/// tripped by slow ctags passes.
pub const NO_OUTPUT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// How long a quit-signalled child gets before the unconditional kill.
const KILL_GRACE: Duration = Duration::from_secs(10);

/// How much trailing output to keep in error messages.
const ERROR_TAIL_BYTES: usize = 8 * 1024;

/// Combined stdout+stderr of the child behind a mutex, so the watchdog can
/// sample the length while the pump tasks append.
#[derive(Clone, Default)]
pub struct OutputBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl OutputBuffer {
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> String {
        String::from_utf8_lossy(&self.inner.lock()).into_owned()
    }

    fn tail(&self) -> String {
        let buf = self.inner.lock();
        let start = buf.len().saturating_sub(ERROR_TAIL_BYTES);
        String::from_utf8_lossy(&buf[start..]).into_owned()
    }

    fn append(&self, data: &[u8]) {
        self.inner.lock().extend_from_slice(data);
    }
}

fn pump<R>(mut reader: R, buf: OutputBuffer) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buf.append(&chunk[..n]),
            }
        }
    })
}

/// Run `cmd` to completion under the no-output watchdog. The returned error
/// names the command and carries its exit reason plus trailing output.
pub async fn logged_run(cmd: Command, no_output_timeout: Duration) -> Result<()> {
    logged_run_with_grace(cmd, no_output_timeout, KILL_GRACE).await
}

pub(crate) async fn logged_run_with_grace(
    mut cmd: Command,
    no_output_timeout: Duration,
    kill_grace: Duration,
) -> Result<()> {
    let cmd_display = format!("{:?}", cmd.as_std());
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn {cmd_display}"))?;
    let pid = child.id();
    let output = OutputBuffer::default();
    let mut pumps = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        pumps.push(pump(stdout, output.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(pump(stderr, output.clone()));
    }

    let mut watchdog = tokio::time::interval_at(
        tokio::time::Instant::now() + no_output_timeout,
        no_output_timeout,
    );
    watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut last_len = 0usize;
    let mut quit_sent = false;
    let mut kill_armed = false;
    let mut kill_timer = Box::pin(tokio::time::sleep(Duration::ZERO));

    loop {
        tokio::select! {
            status = child.wait() => {
                let status = status.with_context(|| format!("wait {cmd_display}"))?;
                // Let the pipe pumps drain before snapshotting the output.
                // Bounded: a grandchild may still hold the pipe open.
                for p in &mut pumps {
                    let _ = tokio::time::timeout(Duration::from_secs(1), p).await;
                }
                return if status.success() {
                    tracing::debug!(cmd = %cmd_display, "ran successfully");
                    Ok(())
                } else if quit_sent {
                    Err(anyhow!(
                        "command {cmd_display} stalled with no output for {no_output_timeout:?} and was signalled ({status})\nOUT: {}",
                        output.tail()
                    ))
                } else {
                    Err(anyhow!(
                        "command {cmd_display} failed: {status}\nOUT: {}",
                        output.tail()
                    ))
                };
            }

            _ = watchdog.tick() => {
                let len = output.len();
                if len != last_len {
                    last_len = len;
                    tracing::info!(cmd = %cmd_display, output_bytes = len, "still running");
                } else if !quit_sent {
                    // Quit first so the child can produce a stack dump.
                    tracing::warn!(cmd = %cmd_display, timeout = ?no_output_timeout, "no output, sending quit");
                    quit_sent = true;
                    if let Some(pid) = pid {
                        unsafe { libc::kill(pid as i32, libc::SIGQUIT) };
                    }
                    kill_timer
                        .as_mut()
                        .reset(tokio::time::Instant::now() + kill_grace);
                    kill_armed = true;
                }
            }

            _ = kill_timer.as_mut(), if kill_armed => {
                tracing::warn!(cmd = %cmd_display, "still running after quit, killing");
                kill_armed = false;
                if let Some(pid) = pid {
                    unsafe { libc::kill(pid as i32, libc::SIGKILL) };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn chatty_child_runs_to_completion() {
        let cmd = sh("for i in 1 2 3 4; do echo tick; sleep 0.02; done");
        logged_run_with_grace(cmd, Duration::from_millis(100), Duration::from_millis(100))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failing_child_reports_output() {
        let cmd = sh("echo boom >&2; exit 3");
        let err = logged_run_with_grace(cmd, Duration::from_secs(5), Duration::from_millis(100))
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("boom"), "{msg}");
        assert!(msg.contains("sh"), "error must name the process: {msg}");
    }

    #[tokio::test]
    async fn silent_child_is_quit() {
        // Writes once then blocks; the default SIGQUIT disposition terminates
        // the shell, so the kill timer never fires.
        let start = std::time::Instant::now();
        let cmd = sh("echo started; sleep 30");
        let err = logged_run_with_grace(cmd, Duration::from_millis(100), Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(err.to_string().contains("no output"), "{err}");
    }

    #[tokio::test]
    async fn quit_resistant_child_is_killed() {
        // Ignores SIGQUIT; only the follow-up SIGKILL takes it down.
        let cmd = sh("trap '' QUIT; echo started; sleep 30");
        let start = std::time::Instant::now();
        let err = logged_run_with_grace(
            cmd,
            Duration::from_millis(100),
            Duration::from_millis(200),
        )
        .await
        .unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(err.to_string().contains("signalled"), "{err}");
    }

    #[test]
    fn output_buffer_tracks_len() {
        let buf = OutputBuffer::default();
        assert!(buf.is_empty());
        buf.append(b"hello ");
        buf.append(b"world");
        assert_eq!(buf.len(), 11);
        assert_eq!(buf.snapshot(), "hello world");
    }
}
