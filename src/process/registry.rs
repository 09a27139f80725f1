use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::ChildStdin;
use tracing::{info, warn};

use crate::buffer::OutputBuffer;
use crate::error::{OrchestratorError, Result};
use crate::process::shell_command;

const DEFAULT_BUFFER_CAP: usize = 1024 * 1024;
const DEFAULT_BUFFER_GRACE: Duration = Duration::from_secs(10);

/// Information about a running interactive process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    /// Caller-chosen logical id (e.g. a repository or session name)
    pub id: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub command: String,
}

struct ProcessRecord {
    info: ProcessInfo,
    /// Slot for the input stream. None once closed; the tokio Mutex
    /// serializes concurrent writers.
    stdin: Arc<tokio::sync::Mutex<Option<ChildStdin>>>,
}

/// Registry for interactive foreground child processes, keyed by a
/// caller-chosen logical id.
///
/// At most one live process per logical id. Output buffers are keyed by
/// OS pid instead, so a respawn under the same id gets a fresh buffer and
/// a late reader can still drain a dead process's trailing output during
/// the grace period.
pub struct ProcessRegistry {
    records: Arc<Mutex<HashMap<String, ProcessRecord>>>,
    buffers: Arc<DashMap<u32, OutputBuffer>>,
    buffer_cap: usize,
    buffer_grace: Duration,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_BUFFER_CAP, DEFAULT_BUFFER_GRACE)
    }

    pub fn with_limits(buffer_cap: usize, buffer_grace: Duration) -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            buffers: Arc::new(DashMap::new()),
            buffer_cap,
            buffer_grace,
        }
    }

    /// Spawn `command` through the shell and register it under `id`.
    ///
    /// Fails with DuplicateProcess if the id already has a live process;
    /// the duplicate check and the spawn happen under one lock, so the
    /// losing caller never spawns. Must be called within a Tokio runtime:
    /// output pumping and exit cleanup run on spawned tasks.
    pub fn spawn(
        &self,
        id: &str,
        command: &str,
        cwd: Option<&Path>,
        env: &HashMap<String, String>,
    ) -> Result<u32> {
        let mut cmd = shell_command(command);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        cmd.envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let (pid, stdout, stderr, child) = {
            let mut records = self.records.lock();
            if records.contains_key(id) {
                return Err(OrchestratorError::DuplicateProcess(id.to_string()));
            }

            let mut child = cmd
                .spawn()
                .map_err(|e| OrchestratorError::SpawnFailure(e.to_string()))?;
            let pid = child.id().ok_or_else(|| {
                OrchestratorError::SpawnFailure("process exited before it got a pid".to_string())
            })?;

            let stdout = child.stdout.take();
            let stderr = child.stderr.take();
            let stdin = child.stdin.take();

            self.buffers.insert(pid, OutputBuffer::new(self.buffer_cap));
            records.insert(
                id.to_string(),
                ProcessRecord {
                    info: ProcessInfo {
                        id: id.to_string(),
                        pid,
                        started_at: Utc::now(),
                        command: command.to_string(),
                    },
                    stdin: Arc::new(tokio::sync::Mutex::new(stdin)),
                },
            );
            (pid, stdout, stderr, child)
        };

        info!("Spawned process '{}' (PID: {}): {}", id, pid, command);

        if let Some(stdout) = stdout {
            self.pump_output(pid, stdout, false);
        }
        if let Some(stderr) = stderr {
            self.pump_output(pid, stderr, true);
        }
        self.watch_exit(id.to_string(), pid, child);

        Ok(pid)
    }

    /// Copy a stream into the pid's output buffer until EOF.
    /// stderr is wrapped in red so interleaved output stays readable.
    fn pump_output<R>(&self, pid: u32, mut stream: R, is_stderr: bool)
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let buffers = Arc::clone(&self.buffers);
        tokio::spawn(async move {
            let mut chunk = [0u8; 8192];
            loop {
                match stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let text = String::from_utf8_lossy(&chunk[..n]);
                        if let Some(mut buf) = buffers.get_mut(&pid) {
                            if is_stderr {
                                buf.append(&format!("\x1b[31m{}\x1b[m", text));
                            } else {
                                buf.append(&text);
                            }
                        }
                    }
                }
            }
        });
    }

    /// Wait for exit, then: append an exit marker, drop the record, and
    /// after the grace period drop the buffer too. Removal is guarded by
    /// pid so it cannot clobber a respawn under the same id.
    fn watch_exit(&self, id: String, pid: u32, mut child: tokio::process::Child) {
        let records = Arc::clone(&self.records);
        let buffers = Arc::clone(&self.buffers);
        let grace = self.buffer_grace;
        tokio::spawn(async move {
            let status = child.wait().await;
            let code = match &status {
                Ok(s) => s
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                Err(_) => "unknown".to_string(),
            };
            if let Some(mut buf) = buffers.get_mut(&pid) {
                buf.append(&format!("\n[Process exited] code={}\n", code));
            }
            {
                let mut records = records.lock();
                if records.get(&id).map(|r| r.info.pid) == Some(pid) {
                    records.remove(&id);
                    info!("Process '{}' (PID: {}) exited with code={}", id, pid, code);
                }
            }
            // Keep the buffer around so late readers can drain the tail
            tokio::time::sleep(grace).await;
            buffers.remove(&pid);
        });
    }

    /// Write raw bytes to the process's stdin. The caller supplies any
    /// trailing newline it wants.
    pub async fn write_input(&self, id: &str, data: &str) -> Result<()> {
        let stdin_slot = {
            let records = self.records.lock();
            let record = records
                .get(id)
                .ok_or_else(|| OrchestratorError::ProcessNotFound(id.to_string()))?;
            Arc::clone(&record.stdin)
        };

        let mut guard = stdin_slot.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| OrchestratorError::StreamClosed(id.to_string()))?;

        let write = async {
            stdin.write_all(data.as_bytes()).await?;
            stdin.flush().await
        };
        match write.await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Broken pipe: the process is gone, retire the stream
                warn!("Writing to '{}' failed, closing stdin: {}", id, e);
                *guard = None;
                Err(OrchestratorError::StreamClosed(id.to_string()))
            }
        }
    }

    /// Close the process's stdin, sending it EOF. Idempotent.
    pub async fn close_input(&self, id: &str) -> Result<()> {
        let stdin_slot = {
            let records = self.records.lock();
            let record = records
                .get(id)
                .ok_or_else(|| OrchestratorError::ProcessNotFound(id.to_string()))?;
            Arc::clone(&record.stdin)
        };
        stdin_slot.lock().await.take();
        Ok(())
    }

    /// Non-blocking snapshot of the buffered output for a logical id.
    /// Empty if the id is unknown or nothing has been captured yet.
    pub fn read_output(&self, id: &str) -> String {
        let pid = {
            let records = self.records.lock();
            records.get(id).map(|r| r.info.pid)
        };
        match pid {
            Some(pid) => self.read_output_by_pid(pid),
            None => String::new(),
        }
    }

    /// Snapshot by pid, for late readers after the record is gone but
    /// within the buffer grace period.
    pub fn read_output_by_pid(&self, pid: u32) -> String {
        self.buffers
            .get(&pid)
            .map(|buf| buf.snapshot())
            .unwrap_or_default()
    }

    /// Drop the record for `id`. Idempotent; the output buffer stays so
    /// trailing output can still be read (see cleanup_buffer).
    pub fn cleanup(&self, id: &str) {
        let removed = self.records.lock().remove(id);
        match removed {
            Some(record) => info!("Cleaned up process '{}' (PID: {})", id, record.info.pid),
            None => warn!("Cleanup for unknown process '{}'", id),
        }
    }

    /// Drop a pid's output buffer. Idempotent.
    pub fn cleanup_buffer(&self, pid: u32) {
        self.buffers.remove(&pid);
    }

    /// Whether a live record exists for `id`. Records are removed as soon
    /// as their process exits, so this tracks liveness.
    pub fn is_running(&self, id: &str) -> bool {
        self.records.lock().contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<ProcessInfo> {
        self.records.lock().get(id).map(|r| r.info.clone())
    }

    pub fn list(&self) -> Vec<ProcessInfo> {
        self.records
            .lock()
            .values()
            .map(|r| r.info.clone())
            .collect()
    }

    /// Best-effort kill by pid: TERM first, escalating to KILL if the
    /// process is still alive shortly after. Removes the record.
    /// Returns false if the id has no live record.
    pub async fn kill(&self, id: &str) -> Result<bool> {
        let pid = {
            let records = self.records.lock();
            match records.get(id) {
                Some(record) => record.info.pid,
                None => {
                    warn!("Kill requested for unknown process '{}'", id);
                    return Ok(false);
                }
            }
        };

        info!("Killing process '{}' (PID: {})", id, pid);
        signal_pid(pid, "-TERM");
        tokio::time::sleep(Duration::from_millis(500)).await;
        if pid_alive(pid) {
            warn!("PID {} survived SIGTERM, sending SIGKILL", pid);
            signal_pid(pid, "-KILL");
        }

        // The exit watcher also removes the record; doing it here too
        // keeps kill() deterministic for the caller.
        self.records.lock().remove(id);
        Ok(true)
    }

    /// Kill every registered process. For embedding-app shutdown.
    pub async fn kill_all(&self) {
        let ids: Vec<String> = self.records.lock().keys().cloned().collect();
        info!("Killing {} processes on shutdown", ids.len());
        for id in ids {
            if let Err(e) = self.kill(&id).await {
                warn!("Failed to kill process '{}': {}", id, e);
            }
        }
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(not(target_os = "windows"))]
fn signal_pid(pid: u32, signal: &str) {
    let _ = std::process::Command::new("kill")
        .args([signal, &pid.to_string()])
        .output();
}

#[cfg(target_os = "windows")]
fn signal_pid(pid: u32, _signal: &str) {
    let _ = std::process::Command::new("taskkill")
        .args(["/F", "/PID", &pid.to_string()])
        .output();
}

#[cfg(not(target_os = "windows"))]
fn pid_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[cfg(target_os = "windows")]
fn pid_alive(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env() -> HashMap<String, String> {
        HashMap::new()
    }

    /// Poll until the record for `id` is gone (the process exited and the
    /// exit watcher ran) or the deadline passes.
    async fn wait_until_gone(registry: &ProcessRegistry, id: &str) {
        for _ in 0..100 {
            if !registry.is_running(id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("process '{}' never left the registry", id);
    }

    #[tokio::test]
    async fn test_duplicate_spawn_rejected() {
        let registry = ProcessRegistry::new();
        let pid = registry.spawn("sess1", "sleep 5", None, &no_env()).unwrap();
        assert!(pid > 0);

        let err = registry
            .spawn("sess1", "sleep 5", None, &no_env())
            .expect_err("second spawn under a live id must fail");
        assert_eq!(err, OrchestratorError::DuplicateProcess("sess1".into()));
        assert_eq!(registry.list().len(), 1);

        registry.kill("sess1").await.unwrap();
    }

    #[tokio::test]
    async fn test_output_is_captured() {
        let registry = ProcessRegistry::new();
        let pid = registry
            .spawn("out", "printf 'hello from child'", None, &no_env())
            .unwrap();
        wait_until_gone(&registry, "out").await;

        let output = registry.read_output_by_pid(pid);
        assert!(output.contains("hello from child"), "got: {:?}", output);
        assert!(output.contains("[Process exited] code=0"));
    }

    #[tokio::test]
    async fn test_stderr_is_captured_in_red() {
        let registry = ProcessRegistry::new();
        let pid = registry
            .spawn("err", "echo oops 1>&2", None, &no_env())
            .unwrap();
        wait_until_gone(&registry, "err").await;

        let output = registry.read_output_by_pid(pid);
        assert!(output.contains("\x1b[31m"), "got: {:?}", output);
        assert!(output.contains("oops"));
    }

    #[tokio::test]
    async fn test_write_input_reaches_child() {
        let registry = ProcessRegistry::new();
        let pid = registry.spawn("cat", "cat", None, &no_env()).unwrap();

        registry.write_input("cat", "ping\n").await.unwrap();
        registry.close_input("cat").await.unwrap();
        wait_until_gone(&registry, "cat").await;

        let output = registry.read_output_by_pid(pid);
        assert!(output.contains("ping"), "got: {:?}", output);
    }

    #[tokio::test]
    async fn test_write_after_exit_is_reportable() {
        let registry = ProcessRegistry::new();
        registry.spawn("gone", "true", None, &no_env()).unwrap();
        wait_until_gone(&registry, "gone").await;

        let err = registry
            .write_input("gone", "hello\n")
            .await
            .expect_err("writing to an exited process must fail");
        assert!(
            matches!(
                err,
                OrchestratorError::ProcessNotFound(_) | OrchestratorError::StreamClosed(_)
            ),
            "got: {:?}",
            err
        );
    }

    #[tokio::test]
    async fn test_write_after_close_input_is_stream_closed() {
        let registry = ProcessRegistry::new();
        registry.spawn("closed", "sleep 5", None, &no_env()).unwrap();
        registry.close_input("closed").await.unwrap();

        let err = registry
            .write_input("closed", "hello\n")
            .await
            .expect_err("stdin was explicitly closed");
        assert_eq!(err, OrchestratorError::StreamClosed("closed".into()));

        registry.kill("closed").await.unwrap();
    }

    #[tokio::test]
    async fn test_buffer_never_exceeds_cap_and_keeps_newest() {
        let registry = ProcessRegistry::with_limits(256, Duration::from_secs(10));
        let pid = registry
            .spawn(
                "noisy",
                "i=0; while [ $i -lt 100 ]; do echo line-$i; i=$((i+1)); done",
                None,
                &no_env(),
            )
            .unwrap();
        wait_until_gone(&registry, "noisy").await;

        let output = registry.read_output_by_pid(pid);
        assert!(output.len() <= 256, "buffer grew to {}", output.len());
        // The newest content survives the trim, the oldest does not
        assert!(output.contains("[Process exited]"));
        assert!(!output.contains("line-0\n"), "got: {:?}", output);
    }

    #[tokio::test]
    async fn test_respawn_after_cleanup_gets_fresh_buffer() {
        let registry = ProcessRegistry::new();
        let first_pid = registry.spawn("sess1", "echo hi", None, &no_env()).unwrap();
        wait_until_gone(&registry, "sess1").await;
        registry.cleanup("sess1"); // idempotent, record already gone

        let second_pid = registry.spawn("sess1", "echo bye", None, &no_env()).unwrap();
        assert_ne!(first_pid, second_pid);
        wait_until_gone(&registry, "sess1").await;

        let output = registry.read_output_by_pid(second_pid);
        assert!(output.contains("bye"));
        assert!(!output.contains("hi\n"), "stale output leaked: {:?}", output);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_buffer_for_late_readers() {
        let registry = ProcessRegistry::new();
        let pid = registry
            .spawn("late", "printf trailing", None, &no_env())
            .unwrap();
        wait_until_gone(&registry, "late").await;

        // Record is gone, buffer still readable by pid
        assert_eq!(registry.read_output("late"), "");
        assert!(registry.read_output_by_pid(pid).contains("trailing"));

        registry.cleanup_buffer(pid);
        assert_eq!(registry.read_output_by_pid(pid), "");
    }

    #[tokio::test]
    async fn test_list_and_get_report_live_processes() -> anyhow::Result<()> {
        let registry = ProcessRegistry::new();
        registry.spawn("a", "sleep 5", None, &no_env())?;
        registry.spawn("b", "sleep 5", None, &no_env())?;

        assert_eq!(registry.list().len(), 2);
        let info = registry.get("a").expect("'a' is live");
        assert_eq!(info.command, "sleep 5");
        assert!(info.pid > 0);

        registry.kill_all().await;
        assert!(registry.list().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_kill_removes_record() {
        let registry = ProcessRegistry::new();
        registry.spawn("victim", "sleep 30", None, &no_env()).unwrap();
        assert!(registry.is_running("victim"));

        assert!(registry.kill("victim").await.unwrap());
        assert!(!registry.is_running("victim"));
        // Killing again reports the missing record instead of failing
        assert!(!registry.kill("victim").await.unwrap());
    }
}
