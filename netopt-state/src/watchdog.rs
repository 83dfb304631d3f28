//! Remote-session watchdog.
//!
//! When an apply happens over SSH, a mis-weighted route can cut the operator
//! off before they can confirm. The watchdog survives that: arming writes a
//! self-contained rollback script to disk and starts a detached timer
//! process (own session, parented to init) that executes the script when the
//! deadline passes. The arming process can die, the SSH session can drop —
//! the timer still fires.
//!
//! All armed state lives on disk so `watchdog confirm|cancel|extend|status`
//! work from a later invocation.

use std::{
    io,
    os::unix::{fs::PermissionsExt as _, process::CommandExt as _},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::{SystemTime, UNIX_EPOCH},
};

use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use serde::{Deserialize, Serialize};

use netopt_net::{route, route::RouteBackup, sysctl};

const STATE_FILE: &str = "watchdog.json";
const SCRIPT_FILE: &str = "watchdog-rollback.sh";
const FIRED_MARKER: &str = "watchdog.fired";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("watchdog is not armed")]
    NotArmed,
    #[error("watchdog already fired; the rollback has run")]
    AlreadyFired,
    #[error("extension would exceed the {max_total}s total watchdog budget")]
    ExtendLimit { max_total: u64 },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("state file error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// On-disk armed state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArmedState {
    pub armed_at_unix: u64,
    pub deadline_unix: u64,
    /// The originally requested timeout, before extensions.
    pub timeout_secs: u64,
    pub timer_pid: i32,
    pub script: PathBuf,
}

/// Status snapshot for the `watchdog status` verb.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub remaining_secs: i64,
    pub fired: bool,
    pub timer_pid: i32,
    pub script: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Watchdog {
    state_root: PathBuf,
}

impl Watchdog {
    pub fn new(state_root: impl Into<PathBuf>) -> Self {
        Self { state_root: state_root.into() }
    }

    fn state_path(&self) -> PathBuf {
        self.state_root.join(STATE_FILE)
    }

    fn script_path(&self) -> PathBuf {
        self.state_root.join(SCRIPT_FILE)
    }

    fn marker_path(&self) -> PathBuf {
        self.state_root.join(FIRED_MARKER)
    }

    /// Whether the rollback script has executed.
    pub fn fired(&self) -> bool {
        self.marker_path().exists()
    }

    /// Arms the watchdog: writes the rollback script and starts the timer.
    pub fn arm(
        &self,
        timeout_secs: u64,
        backup: &RouteBackup,
        links: &[String],
    ) -> Result<ArmedState> {
        std::fs::create_dir_all(&self.state_root)?;
        let _ = std::fs::remove_file(self.marker_path());

        let script = self.script_path();
        let contents = render_script(backup, links, &self.marker_path());
        std::fs::write(&script, contents)?;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o700))?;

        let timer_pid = spawn_timer(timeout_secs, &script)?;

        let armed_at_unix = unix_now();
        let state = ArmedState {
            armed_at_unix,
            deadline_unix: armed_at_unix + timeout_secs,
            timeout_secs,
            timer_pid,
            script,
        };
        std::fs::write(self.state_path(), serde_json::to_vec_pretty(&state)?)?;

        tracing::info!(timeout_secs, timer_pid, "watchdog armed");
        Ok(state)
    }

    /// Disarms and commits: the applied configuration stays.
    pub fn confirm(&self) -> Result<()> {
        let state = self.load()?;
        if self.fired() {
            return Err(Error::AlreadyFired);
        }

        kill_timer(state.timer_pid);
        self.cleanup();
        tracing::info!("watchdog confirmed, configuration committed");
        Ok(())
    }

    /// Disarms and rolls back immediately by running the rollback script.
    pub fn cancel(&self) -> Result<()> {
        let state = self.load()?;
        if self.fired() {
            return Err(Error::AlreadyFired);
        }

        kill_timer(state.timer_pid);

        let status = Command::new("sh")
            .arg(&state.script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        if !status.success() {
            tracing::warn!(?status, "rollback script exited non-zero");
        }

        self.cleanup();
        tracing::info!("watchdog cancelled, pre-apply state restored");
        Ok(())
    }

    /// Extends the confirmation window by `extra_secs`. The total armed time
    /// (original timeout plus all extensions) is bounded by `max_total_secs`.
    pub fn extend(&self, extra_secs: u64, max_total_secs: u64) -> Result<ArmedState> {
        let state = self.load()?;
        if self.fired() {
            return Err(Error::AlreadyFired);
        }

        let new_deadline = state.deadline_unix + extra_secs;
        if new_deadline.saturating_sub(state.armed_at_unix) > max_total_secs {
            return Err(Error::ExtendLimit { max_total: max_total_secs });
        }

        kill_timer(state.timer_pid);
        let remaining = new_deadline.saturating_sub(unix_now()).max(1);
        let timer_pid = spawn_timer(remaining, &state.script)?;

        let state = ArmedState { deadline_unix: new_deadline, timer_pid, ..state };
        std::fs::write(self.state_path(), serde_json::to_vec_pretty(&state)?)?;

        tracing::info!(extra_secs, new_deadline, "watchdog extended");
        Ok(state)
    }

    /// Current armed state, if any.
    pub fn status(&self) -> Option<Status> {
        let state = self.load().ok()?;
        Some(Status {
            remaining_secs: state.deadline_unix as i64 - unix_now() as i64,
            fired: self.fired(),
            timer_pid: state.timer_pid,
            script: state.script,
        })
    }

    /// Acknowledges a fired watchdog, clearing its residue. Returns the
    /// armed state that fired, for reporting.
    pub fn acknowledge_fired(&self) -> Result<ArmedState> {
        let state = self.load()?;
        if !self.fired() {
            return Err(Error::NotArmed);
        }
        self.cleanup();
        let _ = std::fs::remove_file(self.marker_path());
        Ok(state)
    }

    fn load(&self) -> Result<ArmedState> {
        let raw = std::fs::read_to_string(self.state_path()).map_err(|_| Error::NotArmed)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn cleanup(&self) {
        let _ = std::fs::remove_file(self.state_path());
        let _ = std::fs::remove_file(self.script_path());
    }
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

fn kill_timer(pid: i32) {
    if pid <= 0 {
        return;
    }
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        tracing::debug!(pid, ?e, "timer process already gone");
    }
}

/// Starts the detached timer: sleeps, then executes the rollback script.
/// The timer runs in its own session so it survives the arming process and
/// the SSH session that launched it.
fn spawn_timer(secs: u64, script: &Path) -> io::Result<i32> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(format!("sleep {secs} && exec sh '{}'", script.display()))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    // setsid must run in the child, which is not yet a group leader there.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid()?;
            Ok(())
        });
    }

    let child = cmd.spawn()?;
    Ok(child.id() as i32)
}

/// Renders the rollback script from the pre-apply backup.
///
/// Every route entry is re-validated against the default-route whitelist
/// before being embedded; the script never interpolates anything we did not
/// generate or validate.
fn render_script(backup: &RouteBackup, links: &[String], marker: &Path) -> String {
    let mut script = String::from("#!/bin/sh\n# netopt watchdog rollback\n");

    for link in links {
        if link.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')) {
            script.push_str(&format!("tc qdisc del dev {link} root 2>/dev/null\n"));
        }
    }

    for (param, value) in sysctl::conservative_settings() {
        script.push_str(&format!("sysctl -w {}={value} >/dev/null 2>&1\n", param.key()));
    }

    script.push_str("ip -4 route flush default 2>/dev/null\n");
    for entry in &backup.entries {
        if route::validate_entry(entry) {
            script.push_str(&format!("ip -4 route add {entry}\n"));
        } else {
            tracing::warn!(%entry, "backup entry failed validation, omitted from rollback script");
        }
    }

    script.push_str("logger -t netopt -p user.crit watchdog-rollback-executed 2>/dev/null\n");
    script.push_str(&format!(": > '{}'\n", marker.display()));
    script
}
