//! CLI surface: the verbs the core consumes.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "netopt",
    version,
    about = "Linux multipath routing optimizer: probes gateways, weights paths, installs one ECMP default route"
)]
pub struct Cli {
    /// Additional configuration file, merged after system and user configs.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose logging (equivalent to RUST_LOG=debug).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Probe, plan and install the weighted multipath default route.
    Apply {
        /// Skip arming the remote-session watchdog.
        #[arg(long)]
        no_watchdog: bool,
    },

    /// Reinstate the most recent pre-apply route backup.
    Restore,

    /// Show routes, cache, lock, watchdog and last-apply state.
    Status,

    /// Manage system-state checkpoints.
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointCmd,
    },

    /// Manage the rollback watchdog.
    Watchdog {
        #[command(subcommand)]
        action: WatchdogCmd,
    },
}

#[derive(Subcommand, Debug)]
pub enum CheckpointCmd {
    /// Capture a new checkpoint.
    Create {
        name: String,
        #[arg(default_value = "")]
        description: String,
    },
    /// List checkpoints, oldest first.
    List,
    /// Restore a checkpoint by id.
    Restore { id: String },
    /// Delete a checkpoint by id.
    Delete { id: String },
    /// Enforce the retention limit.
    Prune,
}

#[derive(Subcommand, Debug)]
pub enum WatchdogCmd {
    /// Arm the watchdog against the current route table.
    Start {
        /// Seconds until automatic rollback (default: WATCHDOG_TIMEOUT).
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Disarm and keep the applied configuration.
    Confirm,
    /// Disarm and roll back immediately.
    Cancel,
    /// Add seconds to the confirmation window.
    Extend { seconds: u64 },
    /// Show the armed state.
    Status,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbs_parse() {
        assert!(matches!(
            Cli::try_parse_from(["netopt", "apply", "--no-watchdog"]).unwrap().command,
            Command::Apply { no_watchdog: true }
        ));
        assert!(matches!(
            Cli::try_parse_from(["netopt", "restore"]).unwrap().command,
            Command::Restore
        ));
        assert!(matches!(
            Cli::try_parse_from(["netopt", "checkpoint", "create", "pre", "before tuning"])
                .unwrap()
                .command,
            Command::Checkpoint { action: CheckpointCmd::Create { .. } }
        ));
        assert!(matches!(
            Cli::try_parse_from(["netopt", "watchdog", "extend", "120"]).unwrap().command,
            Command::Watchdog { action: WatchdogCmd::Extend { seconds: 120 } }
        ));
    }

    #[test]
    fn global_flags_apply_to_subcommands() {
        let cli = Cli::try_parse_from(["netopt", "status", "--config", "/tmp/x.conf", "-v"]).unwrap();
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("/tmp/x.conf")));
        assert!(cli.verbose);
    }
}
