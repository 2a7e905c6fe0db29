//! Persistent exiftool worker process.
//!
//! Spawning exiftool per file costs ~150 ms of Perl startup; the
//! `-stay_open` protocol keeps one process alive and feeds it argument
//! batches over stdin, reading until the `{ready}` marker. Every read is
//! bounded by a hard timeout; a timeout or I/O error kills the child and
//! the next call relaunches it.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};

/// Hard ceiling for one exiftool invocation.
const EXECUTE_TIMEOUT: Duration = Duration::from_secs(30);

const READY_MARKER: &[u8] = b"{ready}";

struct Worker {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// Handle to the shared exiftool process. Cheap to clone behind an
/// `Arc`; calls are serialized by an internal mutex.
pub struct ExifTool {
    worker: tokio::sync::Mutex<Option<Worker>>,
}

impl Default for ExifTool {
    fn default() -> Self {
        Self::new()
    }
}

impl ExifTool {
    pub fn new() -> Self {
        Self {
            worker: tokio::sync::Mutex::new(None),
        }
    }

    /// Whether an exiftool binary is on PATH. Checked once at plugin
    /// registration.
    pub fn is_available() -> bool {
        std::process::Command::new("exiftool")
            .arg("-ver")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    /// Run one exiftool command, returning raw stdout bytes (without the
    /// ready marker). Suitable for `-b` binary extractions and `-json`.
    pub async fn execute_binary(&self, args: &[&str]) -> Result<Vec<u8>> {
        let mut guard = self.worker.lock().await;
        if guard.is_none() {
            *guard = Some(spawn_worker().await?);
        }
        let Some(worker) = guard.as_mut() else {
            return Err(CoreError::Internal("exiftool worker missing".into()));
        };

        let result = tokio::time::timeout(EXECUTE_TIMEOUT, run(worker, args)).await;
        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => {
                warn!(error = %err, "exiftool I/O error; restarting worker");
                kill(guard.take()).await;
                Err(err)
            }
            Err(_) => {
                warn!("exiftool call timed out; restarting worker");
                kill(guard.take()).await;
                Err(CoreError::Timeout(format!("exiftool {args:?}")))
            }
        }
    }

    /// Stop the worker process, if any.
    pub async fn shutdown(&self) {
        let mut guard = self.worker.lock().await;
        if let Some(worker) = guard.as_mut() {
            // Polite stop; fall through to kill if the pipe is gone.
            let _ = worker.stdin.write_all(b"-stay_open\nFalse\n").await;
            let _ = worker.stdin.flush().await;
        }
        kill(guard.take()).await;
        info!("exiftool worker stopped");
    }
}

impl std::fmt::Debug for ExifTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExifTool").finish_non_exhaustive()
    }
}

async fn spawn_worker() -> Result<Worker> {
    let mut child = Command::new("exiftool")
        .args(["-stay_open", "True", "-@", "-"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| CoreError::Internal("exiftool stdin unavailable".into()))?;
    let stdout = child
        .stdout
        .take()
        .map(BufReader::new)
        .ok_or_else(|| CoreError::Internal("exiftool stdout unavailable".into()))?;
    debug!("exiftool worker spawned");
    Ok(Worker {
        child,
        stdin,
        stdout,
    })
}

async fn run(worker: &mut Worker, args: &[&str]) -> Result<Vec<u8>> {
    let mut command = String::new();
    for arg in args {
        command.push_str(arg);
        command.push('\n');
    }
    command.push_str("-execute\n");
    worker.stdin.write_all(command.as_bytes()).await?;
    worker.stdin.flush().await?;

    let mut output = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = worker.stdout.read(&mut chunk).await?;
        if n == 0 {
            return Err(CoreError::Internal("exiftool closed its stdout".into()));
        }
        output.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_ready(&output) {
            output.truncate(pos);
            // Trim the newline exiftool prints before the marker.
            while output.last().is_some_and(|b| *b == b'\n' || *b == b'\r') {
                output.pop();
            }
            return Ok(output);
        }
    }
}

fn find_ready(buffer: &[u8]) -> Option<usize> {
    if buffer.len() < READY_MARKER.len() {
        return None;
    }
    buffer
        .windows(READY_MARKER.len())
        .rposition(|window| window == READY_MARKER)
}

async fn kill(worker: Option<Worker>) {
    if let Some(mut worker) = worker {
        let _ = worker.child.kill().await;
    }
}
