//! Child process ownership.
//!
//! A [`ProcessHandle`] owns exactly one server process. Its pipes are handed
//! out once to the transport; the process itself is terminated either through
//! [`ProcessHandle::terminate`] (graceful signal, grace period, force kill) or,
//! on any other exit path, by `Drop`.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

#[cfg(unix)]
use nix::sys::signal::{self, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

use super::errors::McpError;
use super::types::ServerDefinition;

// ─── ProcessHandle ───────────────────────────────────────────────────────────

/// An owned, running server process.
#[derive(Debug)]
pub struct ProcessHandle {
    server_id: String,
    pid: Option<u32>,
    child: Option<Child>,
}

impl ProcessHandle {
    /// Launch the process described by `def` with piped stdio.
    ///
    /// Fails with `LaunchFailed` if the executable cannot be started.
    pub fn launch(def: &ServerDefinition) -> Result<Self, McpError> {
        let mut cmd = Command::new(&def.command);
        cmd.args(&def.args);

        for (key, value) in &def.env {
            cmd.env(key, value);
        }

        if let Some(dir) = &def.cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| McpError::LaunchFailed {
            server: def.id.clone(),
            reason: format!("{}: {e}", def.command),
        })?;

        let pid = child.id();
        tracing::info!(
            server = %def.id,
            command = %def.command,
            args = ?def.args,
            pid = ?pid,
            "launched server process"
        );

        Ok(Self {
            server_id: def.id.clone(),
            pid,
            child: Some(child),
        })
    }

    /// OS process id, if the platform reported one at spawn time.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Take the child's stdin. Returns `None` after the first call.
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.as_mut().and_then(|c| c.stdin.take())
    }

    /// Take the child's stdout. Returns `None` after the first call.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.as_mut().and_then(|c| c.stdout.take())
    }

    /// Take the child's stderr. Returns `None` after the first call.
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.as_mut().and_then(|c| c.stderr.take())
    }

    /// Whether the process has already exited (or was terminated).
    pub fn has_exited(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => true,
        }
    }

    /// Terminate the process: graceful signal, wait up to `grace`, then
    /// force-kill and reap.
    ///
    /// Idempotent. Returns `Ok(None)` if the process was already terminated
    /// through this handle.
    pub async fn terminate(&mut self, grace: Duration) -> io::Result<Option<ExitStatus>> {
        let Some(mut child) = self.child.take() else {
            return Ok(None);
        };

        if let Some(status) = child.try_wait()? {
            tracing::debug!(server = %self.server_id, %status, "server process already exited");
            return Ok(Some(status));
        }

        #[cfg(unix)]
        {
            if let Some(status) = self.signal_and_wait(&mut child, grace).await? {
                return Ok(Some(status));
            }
        }
        #[cfg(not(unix))]
        let _ = grace;

        tracing::warn!(
            server = %self.server_id,
            pid = ?self.pid,
            "server process did not exit in time, killing"
        );
        // Child::kill sends SIGKILL and waits for reaping
        child.kill().await?;
        child.wait().await.map(Some)
    }

    /// SIGTERM, then wait up to `grace`. `Ok(None)` means still running.
    #[cfg(unix)]
    async fn signal_and_wait(
        &self,
        child: &mut Child,
        grace: Duration,
    ) -> io::Result<Option<ExitStatus>> {
        let Some(raw_pid) = child.id().and_then(|p| i32::try_from(p).ok()) else {
            return child.wait().await.map(Some);
        };

        if let Err(e) = signal::kill(Pid::from_raw(raw_pid), Signal::SIGTERM) {
            // Process may have already exited
            if e == nix::errno::Errno::ESRCH {
                return child.wait().await.map(Some);
            }
            tracing::warn!(server = %self.server_id, error = %e, "failed to send SIGTERM");
            return Ok(None);
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => status.map(Some),
            Err(_) => Ok(None),
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                tracing::debug!(
                    server = %self.server_id,
                    pid = ?self.pid,
                    "killing server process on drop"
                );
                let _ = child.start_kill();
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_launch_missing_executable() {
        let def = ServerDefinition::new("ghost", "/nonexistent/definitely-not-here", &[]);
        let err = ProcessHandle::launch(&def).unwrap_err();
        assert!(matches!(err, McpError::LaunchFailed { .. }));
        assert_eq!(err.kind(), super::super::errors::ErrorKind::LaunchError);
    }

    #[tokio::test]
    async fn test_terminate_responds_to_sigterm() {
        let def = ServerDefinition::new("sleeper", "sleep", &["30"]);
        let mut handle = ProcessHandle::launch(&def).unwrap();
        assert!(handle.pid().is_some());
        assert!(!handle.has_exited());

        let started = std::time::Instant::now();
        let status = handle.terminate(Duration::from_secs(5)).await.unwrap();
        assert!(status.is_some());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(handle.has_exited());
    }

    #[tokio::test]
    async fn test_terminate_escalates_when_sigterm_ignored() {
        let def = ServerDefinition::new("stubborn", "sh", &["-c", "trap '' TERM; sleep 30"]);
        let mut handle = ProcessHandle::launch(&def).unwrap();
        // Let the shell install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let status = handle.terminate(Duration::from_millis(200)).await.unwrap();
        assert!(status.is_some());
    }

    #[tokio::test]
    async fn test_terminate_twice_is_noop() {
        let def = ServerDefinition::new("echo", "echo", &["hello"]);
        let mut handle = ProcessHandle::launch(&def).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(handle.terminate(Duration::from_secs(1)).await.unwrap().is_some());
        assert!(handle.terminate(Duration::from_secs(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pipes_taken_once() {
        let def = ServerDefinition::new("cat", "cat", &[]);
        let mut handle = ProcessHandle::launch(&def).unwrap();
        assert!(handle.take_stdin().is_some());
        assert!(handle.take_stdin().is_none());
        assert!(handle.take_stdout().is_some());
        assert!(handle.take_stderr().is_some());
        handle.terminate(Duration::from_secs(1)).await.unwrap();
    }
}
