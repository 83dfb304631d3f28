//! Top-level error taxonomy and exit-code mapping.

use netopt_net::{link, route};
use netopt_state::{checkpoint, lock, transaction, watchdog};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("interface enumeration failed: {0}")]
    Inventory(String),
    #[error("another instance is active (pid {pid})")]
    Locked { pid: i32 },
    #[error("required tool missing: {0}")]
    MissingTool(String),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("pre-flight check failed: {0}")]
    Preflight(String),
    #[error("checkpoint/restore error: {0}")]
    Checkpoint(String),
    #[error("cannot clear existing default routes")]
    CannotClear,
    #[error("route apply failed: {0}")]
    ApplyFailed(String),
    #[error("post-apply validation failed: {0}")]
    PostValidate(String),
    #[error("watchdog fired; the automatic rollback has run")]
    WatchdogFired,
    #[error("FATAL: rollback failed, system state is indeterminate: {message}")]
    Fatal { message: String, checkpoint: Option<String> },
    #[error("{0}")]
    Other(String),
}

impl AppError {
    /// Process exit code: 0 success, 1 generic, 2 permission denied,
    /// 3 missing tool, 4 configuration, 5 checkpoint/restore, 6 pre-flight,
    /// 7 post-apply validation, 8 watchdog rollback.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Locked { .. } | Self::Permission(_) => 2,
            Self::MissingTool(_) => 3,
            Self::Config(_) => 4,
            Self::Checkpoint(_) => 5,
            Self::Preflight(_) => 6,
            Self::PostValidate(_) => 7,
            Self::WatchdogFired => 8,
            _ => 1,
        }
    }
}

impl From<lock::Error> for AppError {
    fn from(e: lock::Error) -> Self {
        match e {
            lock::Error::Held { pid } => Self::Locked { pid },
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<link::Error> for AppError {
    fn from(e: link::Error) -> Self {
        Self::Inventory(e.to_string())
    }
}

impl From<route::Error> for AppError {
    fn from(e: route::Error) -> Self {
        match e {
            route::Error::CannotClear => Self::CannotClear,
            route::Error::ApplyFailed { stderr } if stderr.contains("not permitted") => {
                Self::Permission(stderr)
            }
            route::Error::ApplyFailed { stderr } => Self::ApplyFailed(stderr),
            route::Error::RestoreFailed { stderr } => {
                Self::Fatal { message: stderr, checkpoint: None }
            }
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<checkpoint::Error> for AppError {
    fn from(e: checkpoint::Error) -> Self {
        Self::Checkpoint(e.to_string())
    }
}

impl From<watchdog::Error> for AppError {
    fn from(e: watchdog::Error) -> Self {
        match e {
            watchdog::Error::AlreadyFired => Self::WatchdogFired,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<transaction::Error> for AppError {
    fn from(e: transaction::Error) -> Self {
        Self::Other(e.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            Self::Permission(e.to_string())
        } else {
            Self::Other(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_the_documented_mapping() {
        assert_eq!(AppError::Other("x".into()).exit_code(), 1);
        assert_eq!(AppError::Locked { pid: 42 }.exit_code(), 2);
        assert_eq!(AppError::Permission("x".into()).exit_code(), 2);
        assert_eq!(AppError::MissingTool("mtr".into()).exit_code(), 3);
        assert_eq!(AppError::Config("x".into()).exit_code(), 4);
        assert_eq!(AppError::Checkpoint("x".into()).exit_code(), 5);
        assert_eq!(AppError::Preflight("x".into()).exit_code(), 6);
        assert_eq!(AppError::PostValidate("x".into()).exit_code(), 7);
        assert_eq!(AppError::WatchdogFired.exit_code(), 8);
        assert_eq!(AppError::CannotClear.exit_code(), 1);
        assert_eq!(
            AppError::Fatal { message: "x".into(), checkpoint: None }.exit_code(),
            1
        );
    }

    #[test]
    fn lock_held_maps_to_locked() {
        let e: AppError = lock::Error::Held { pid: 7 }.into();
        assert!(matches!(e, AppError::Locked { pid: 7 }));
    }

    #[test]
    fn unprivileged_route_apply_maps_to_permission() {
        let e: AppError = route::Error::ApplyFailed {
            stderr: "RTNETLINK answers: Operation not permitted".to_string(),
        }
        .into();
        assert_eq!(e.exit_code(), 2);
    }

    #[test]
    fn permission_denied_io_maps_to_permission() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let e: AppError = io.into();
        assert_eq!(e.exit_code(), 2);
    }
}
