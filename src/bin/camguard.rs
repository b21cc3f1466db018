//! camguard - webcam access control front end.
//!
//! Every command loads `GuardConfig` (JSON file from `CAMGUARD_CONFIG` plus
//! `CAMGUARD_*` overrides). Commands that change the camera state log in
//! first, so a wrong password goes through the intrusion pipeline exactly as
//! an interactive login would.
//!
//! Passwords are read from `CAMGUARD_PASSWORD` or, if unset, the first line
//! of stdin.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::io::{BufRead, IsTerminal};
use std::sync::{mpsc, Arc};
use std::time::Duration;
use zeroize::Zeroizing;

use camguard::{
    AggregateBlockStatus, Dispatcher, GuardConfig, GuardService, LoginOutcome, Mailbox,
    MqttNotifier, SuspiciousActivity,
};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(name = "camguard", version, about = "Webcam access control and intrusion response")]
struct Args {
    /// UI mode for stderr progress (auto|plain|pretty).
    #[arg(long, default_value = "auto", value_name = "MODE", global = true)]
    ui: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the first credential
    Setup {
        #[arg(long, env = "CAMGUARD_USER")]
        user: String,
    },

    /// Check a password (failures trigger evidence capture)
    Login {
        #[arg(long, env = "CAMGUARD_USER")]
        user: String,
    },

    /// Log in, then lift the camera block
    Enable {
        #[arg(long, env = "CAMGUARD_USER")]
        user: String,
    },

    /// Log in, then block the camera
    Disable {
        #[arg(long, env = "CAMGUARD_USER")]
        user: String,
    },

    /// Show per-method blocking status
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Summarize failed attempts and stored evidence
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Delete evidence files older than the retention period
    Cleanup {
        /// Overrides the configured retention.
        #[arg(long)]
        days: Option<u64>,
    },

    /// Print recent audit entries, newest first
    Logs {
        #[arg(long)]
        user: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Print evidence records instead of access events.
        #[arg(long)]
        evidence: bool,
    },

    /// Verify the audit log hash chains
    VerifyLog,

    /// Publish a test alert to the configured topics
    TestAlert,

    /// Probe blocking status in the background until Ctrl-C
    Watch {
        #[arg(long, default_value_t = 10)]
        interval_secs: u64,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::from_args(&args.ui, is_tty, !stdout_is_tty);

    let config = GuardConfig::load()?;
    if let Command::TestAlert = args.command {
        return test_alert(&config, &ui);
    }

    let service = {
        let _stage = ui.stage("Open camguard state");
        GuardService::open(&config)?
    };
    run(service, &config, &ui, args.command)
}

fn run(service: GuardService, config: &GuardConfig, ui: &ui::Ui, command: Command) -> Result<()> {
    match command {
        Command::Setup { user } => {
            if service.gate().has_credentials() {
                log::warn!("credentials already exist; adding {}", user);
            }
            let password = read_password()?;
            service.setup(&user, &password)?;
            println!("credential created for {}", user);
        }
        Command::Login { user } => {
            let password = read_password()?;
            login(&service, ui, &user, &password)?;
            service.logout();
        }
        Command::Enable { user } => toggle(&service, ui, &user, true)?,
        Command::Disable { user } => toggle(&service, ui, &user, false)?,
        Command::Status { json } => {
            let status = {
                let _stage = ui.stage("Probe blocking methods");
                service.blocking_status()
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                ui.print_status(&status, service.controller().quorum());
            }
        }
        Command::Stats { json } => {
            let stats = service.pipeline().statistics();
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                ui.print_statistics(&stats);
            }
        }
        Command::Cleanup { days } => {
            let days = days.unwrap_or(config.intrusion.retention_days);
            let removed = service.pipeline().cleanup_evidence_older_than(days);
            println!("removed {} evidence file(s) older than {} days", removed, days);
        }
        Command::Logs {
            user,
            limit,
            evidence,
        } => {
            if evidence {
                for record in service.store().query_evidence(limit)? {
                    println!(
                        "{} #{} {} {}",
                        format_timestamp(record.timestamp),
                        record.id,
                        record.media_ref,
                        record.origin.as_deref().unwrap_or("-")
                    );
                }
            } else {
                for record in service.store().query_attempts(user.as_deref(), limit)? {
                    println!(
                        "{} #{} {:<12} {}",
                        format_timestamp(record.timestamp),
                        record.id,
                        record.identity,
                        record.action.code()
                    );
                }
            }
        }
        Command::VerifyLog => {
            {
                let _stage = ui.stage("Verify audit chains");
                service.store().verify_chain()?;
            }
            println!("audit log OK");
        }
        Command::TestAlert => test_alert(config, ui)?,
        Command::Watch { interval_secs } => {
            watch(
                Arc::new(service),
                config.workers,
                Duration::from_secs(interval_secs.max(1)),
                ui,
            )?;
        }
    }
    Ok(())
}

fn login(service: &GuardService, ui: &ui::Ui, user: &str, password: &str) -> Result<()> {
    let outcome = {
        let _stage = ui.stage("Authenticate");
        service.login(user, password)
    };
    match outcome {
        LoginOutcome::Authenticated(session) => {
            println!("authenticated as {}", session.username);
            Ok(())
        }
        LoginOutcome::Rejected {
            evidence,
            repeated_failures,
            escalated,
        } => {
            if let Some(evidence) = evidence {
                log::info!("evidence stored at {}", evidence.media_path.display());
            }
            if repeated_failures {
                log::warn!(
                    "repeated failures for {}{}",
                    user,
                    if escalated { "; camera disabled" } else { "" }
                );
            }
            Err(anyhow!("authentication failed for {}", user))
        }
    }
}

fn toggle(service: &GuardService, ui: &ui::Ui, user: &str, enabled: bool) -> Result<()> {
    let password = read_password()?;
    login(service, ui, user, &password)?;
    let action = if enabled { "enable camera" } else { "disable camera" };
    let outcome = {
        let _stage = ui.stage(action);
        service.set_camera_enabled(enabled)
    };
    service.logout();
    ui.print_toggle(action, &outcome);
    if !outcome.is_success() {
        return Err(anyhow!("{}: {}", action, outcome));
    }
    Ok(())
}

fn test_alert(config: &GuardConfig, ui: &ui::Ui) -> Result<()> {
    let settings = config
        .notifier
        .clone()
        .ok_or_else(|| anyhow!("no notifier configured (set CAMGUARD_MQTT_ENDPOINT)"))?;
    let notifier = MqttNotifier::new();
    {
        let _stage = ui.stage("Connect to MQTT broker");
        if !notifier.configure(settings) {
            return Err(anyhow!("notifier configuration rejected"));
        }
    }
    let status = notifier.configuration_status();
    let delivered = {
        let _stage = ui.stage("Publish test alert");
        notifier.send_test_alert()
    };
    if !delivered {
        return Err(anyhow!(
            "test alert was not delivered to {} topic(s)",
            status.recipient_count
        ));
    }
    println!("test alert sent to {} topic(s)", status.recipient_count);
    Ok(())
}

/// Probes and tamper responses run on the dispatcher; this thread only
/// drains the mailbox and waits for the next tick or Ctrl-C.
fn watch(
    service: Arc<GuardService>,
    workers: usize,
    interval: Duration,
    ui: &ui::Ui,
) -> Result<()> {
    let dispatcher = Dispatcher::new(workers)?;
    let mailbox: Mailbox<AggregateBlockStatus> = Mailbox::new();

    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })
    .context("install Ctrl-C handler")?;

    log::info!("watching camera status every {:?} (Ctrl-C to stop)", interval);
    let mut last: Option<AggregateBlockStatus> = None;
    let mut tampered = false;
    loop {
        let probe = service.clone();
        dispatcher.run(&mailbox, move || {
            probe.controller().clear_status_cache();
            probe.blocking_status()
        })?;

        for status in mailbox.drain() {
            let now_tampered = is_tampered(&service, &status);
            if now_tampered && !tampered {
                let responder = service.clone();
                let detail = format!(
                    "only {}/{} blocking methods still applied",
                    status.applied_count(),
                    status.per_method.len()
                );
                dispatcher.submit(move || {
                    responder.pipeline().handle_suspicious_activity(
                        &SuspiciousActivity::SystemTampering,
                        Some(&detail),
                    );
                })?;
            }
            tampered = now_tampered;

            let changed = match &last {
                Some(prev) => {
                    prev.per_method != status.per_method
                        || prev.device_reachable != status.device_reachable
                }
                None => true,
            };
            if changed {
                ui.print_status(&status, service.controller().quorum());
            }
            last = Some(status);
        }

        match shutdown_rx.recv_timeout(interval) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }
    }

    log::info!("shutdown signal received, stopping workers...");
    dispatcher.shutdown()
}

/// A block the operator asked for that no longer meets quorum was undone
/// outside camguard.
fn is_tampered(service: &GuardService, status: &AggregateBlockStatus) -> bool {
    service.controller().intended_disabled()
        && status.applied_count() < service.controller().quorum()
}

fn read_password() -> Result<Zeroizing<String>> {
    if let Ok(password) = std::env::var("CAMGUARD_PASSWORD") {
        return Ok(Zeroizing::new(password));
    }
    let mut line = Zeroizing::new(String::new());
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("read password from stdin")?;
    let trimmed = line.trim_end_matches(['\r', '\n']).len();
    line.truncate(trimmed);
    if line.is_empty() {
        return Err(anyhow!("no password given (set CAMGUARD_PASSWORD or pipe it on stdin)"));
    }
    Ok(line)
}

fn format_timestamp(timestamp: u64) -> String {
    i64::try_from(timestamp)
        .ok()
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
        .map(|utc| utc.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}
