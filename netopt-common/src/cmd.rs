//! Deadline-bounded subprocess invocation.
//!
//! Every external tool call in netopt goes through [`run`]. The child never
//! inherits our stdin, runs in its own process group, and is terminated
//! (SIGTERM, then SIGKILL after a short grace) when the deadline expires.
//! Having one cancellation point keeps the watchdog rollback path simple.

use std::{
    io,
    path::PathBuf,
    process::Stdio,
    time::Duration,
};

use nix::{
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use tokio::{io::AsyncReadExt as _, process::Command};

/// Grace between SIGTERM and SIGKILL when a deadline expires.
const KILL_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("empty command provided")]
    Empty,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Captured output of a finished (or killed) child process.
#[derive(Debug, Clone)]
pub struct Output {
    /// Exit code, if the child exited normally.
    pub exit: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Whether the deadline expired and the child was killed.
    pub timed_out: bool,
}

impl Output {
    pub fn success(&self) -> bool {
        self.exit == Some(0) && !self.timed_out
    }
}

/// Runs `program` with `args` under `deadline`.
///
/// The child is placed in a fresh process group so that the whole tree can be
/// signalled at once. Stdin is `/dev/null`; stdout and stderr are captured
/// and lossily decoded.
pub async fn run(program: &str, args: &[&str], deadline: Duration) -> Result<Output> {
    if program.is_empty() {
        return Err(Error::Empty);
    }

    let mut cmd = Command::new(program);
    cmd.args(args).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

    // Fresh process group: deadline kills reach grandchildren too.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))?;
            Ok(())
        });
    }

    tracing::debug!(%program, ?args, ?deadline, "running command");

    let mut child = cmd.spawn()?;
    let pgid = child.id().map(|id| Pid::from_raw(id as i32));

    // Drain pipes concurrently so a chatty child can't deadlock on a full pipe.
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });

    let (exit, timed_out) = match tokio::time::timeout(deadline, child.wait()).await {
        Ok(status) => (status?.code(), false),
        Err(_) => {
            terminate(&mut child, pgid).await;
            (None, true)
        }
    };

    let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).to_string();
    let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).to_string();

    let output = Output { exit, stdout, stderr, timed_out };
    if !output.success() {
        tracing::debug!(%program, exit = ?output.exit, timed_out, "command did not succeed");
    }

    Ok(output)
}

/// SIGTERM the child's process group, escalating to SIGKILL after the grace.
async fn terminate(child: &mut tokio::process::Child, pgid: Option<Pid>) {
    let Some(pgid) = pgid else {
        // Already reaped; nothing to signal.
        return;
    };

    tracing::debug!(?pgid, "deadline expired, terminating process group");
    let _ = killpg(pgid, Signal::SIGTERM);

    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        let _ = killpg(pgid, Signal::SIGKILL);
        let _ = child.wait().await;
    }
}

/// Locates `program` on `PATH`, returning the first executable hit.
pub fn which(program: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(program);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable(path: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt as _;
    path.metadata().map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn captures_stdout_and_exit() {
        let out = run("echo", &["hello"], Duration::from_secs(5)).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
        assert!(!out.timed_out);
    }

    #[tokio::test]
    async fn reports_nonzero_exit() {
        let out = run("false", &[], Duration::from_secs(5)).await.unwrap();
        assert_eq!(out.exit, Some(1));
        assert!(!out.success());
    }

    #[tokio::test]
    async fn kills_on_deadline() {
        let _ = tracing_subscriber::fmt::try_init();
        let start = Instant::now();
        let out = run("sleep", &["30"], Duration::from_millis(200)).await.unwrap();
        assert!(out.timed_out);
        assert!(out.exit.is_none());
        // SIGTERM + grace must stay well under the sleep duration.
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn stdin_is_not_inherited() {
        // `cat` with a closed stdin exits immediately instead of blocking.
        let out = run("cat", &[], Duration::from_secs(5)).await.unwrap();
        assert!(!out.timed_out);
    }

    #[tokio::test]
    async fn empty_program_is_an_error() {
        assert!(matches!(run("", &[], Duration::from_secs(1)).await, Err(Error::Empty)));
    }

    #[test]
    fn which_finds_sh() {
        assert!(which("sh").is_some());
        assert!(which("definitely-not-a-real-tool-xyz").is_none());
    }
}
