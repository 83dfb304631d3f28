//! netopt: Linux multipath routing optimizer.
//!
//! Discovers active interfaces, probes each upstream gateway, computes
//! per-path weights, and installs a single weighted ECMP default route —
//! wrapped in a checkpoint/rollback envelope with a remote-session watchdog.

use clap::Parser as _;
use tracing_subscriber::EnvFilter;

use netopt_common::EventSink;
use netopt_net::route;
use netopt_state::{CheckpointStore, Watchdog};

use netopt::{
    cli::{CheckpointCmd, Cli, Command, WatchdogCmd},
    config::Config,
    envelope::{self, ApplyFlags},
    error::AppError,
    status,
};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("netopt: {e}");
            if let AppError::Fatal { checkpoint: Some(id), .. } = &e {
                eprintln!("netopt: inspect the most recent checkpoint: {id}");
            }
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let config =
        Config::load(cli.config.as_ref()).map_err(|e| AppError::Config(e.to_string()))?;
    let sink = EventSink::new();

    match cli.command {
        Command::Apply { no_watchdog } => {
            let flags = ApplyFlags { no_watchdog };
            let report = envelope::run_apply(&config, &flags, &sink).await?;

            if report.noop {
                println!("route already optimal, nothing changed");
            } else {
                println!("applied {} path(s):", report.plan.len());
            }
            println!("{}", report.plan.summary());
            println!("route: {}", report.plan.to_route());
            println!("{}", report.dns_note);
            if let Some(id) = &report.checkpoint_id {
                println!("checkpoint: {id}");
            }
            if let Some(secs) = report.watchdog_secs {
                println!("watchdog armed: run `netopt watchdog confirm` within {secs}s");
            }
        }

        Command::Restore => {
            let backup = envelope::load_route_backup(&config)?;
            route::restore(&backup)
                .await
                .map_err(|e| AppError::Checkpoint(format!("route restore failed: {e}")))?;
            println!("restored {} default route entr(ies)", backup.entries.len());
        }

        Command::Status => {
            print!("{}", status::report(&config).await?);
        }

        Command::Checkpoint { action } => {
            let store = CheckpointStore::new(
                config.state_root.join("checkpoints"),
                config.checkpoint_retention,
            );
            match action {
                CheckpointCmd::Create { name, description } => {
                    let metadata = store.create(&name, &description).await?;
                    println!("created {}", metadata.id);
                }
                CheckpointCmd::List => {
                    let entries = store.list()?;
                    if entries.is_empty() {
                        println!("no checkpoints");
                    }
                    for entry in entries {
                        println!(
                            "{}  {}  {} KiB  {}",
                            entry.metadata.id,
                            entry.metadata.created_at_utc,
                            entry.size_bytes / 1024,
                            entry.metadata.description
                        );
                    }
                }
                CheckpointCmd::Restore { id } => {
                    let metadata = store.restore(&id).await?;
                    println!("restored {} (captured {})", metadata.id, metadata.created_at_utc);
                }
                CheckpointCmd::Delete { id } => {
                    store.delete(&id)?;
                    println!("deleted {id}");
                }
                CheckpointCmd::Prune => {
                    let removed = store.prune()?;
                    println!("pruned {} checkpoint(s)", removed.len());
                }
            }
        }

        Command::Watchdog { action } => {
            let watchdog = Watchdog::new(&config.state_root);
            match action {
                WatchdogCmd::Start { timeout } => {
                    let backup = route::backup().await?;
                    let inventory = netopt_net::Inventory::new(
                        netopt_net::ExcludePattern::parse(&config.exclude_interfaces),
                    );
                    let names: Vec<String> =
                        inventory.list()?.into_iter().map(|l| l.name).collect();
                    let secs = timeout.unwrap_or(config.watchdog_timeout);
                    watchdog.arm(secs, &backup, &names)?;
                    println!("watchdog armed for {secs}s");
                }
                WatchdogCmd::Confirm => {
                    envelope::confirm_watchdog(&config, &sink)?;
                    println!("confirmed; configuration committed");
                }
                WatchdogCmd::Cancel => {
                    watchdog.cancel()?;
                    println!("cancelled; pre-apply state restored");
                }
                WatchdogCmd::Extend { seconds } => {
                    let state = watchdog.extend(seconds, config.max_watchdog_extend)?;
                    let remaining = state.deadline_unix as i64 - chrono::Utc::now().timestamp();
                    println!("extended; {}s remaining", remaining.max(0));
                }
                WatchdogCmd::Status => match watchdog.status() {
                    Some(status) if status.fired => {
                        println!("watchdog FIRED; rollback has run");
                        let _ = watchdog.acknowledge_fired();
                        return Err(AppError::WatchdogFired);
                    }
                    Some(status) => {
                        println!(
                            "armed: {}s remaining (timer pid {})",
                            status.remaining_secs.max(0),
                            status.timer_pid
                        );
                    }
                    None => println!("not armed"),
                },
            }
        }
    }

    Ok(())
}
