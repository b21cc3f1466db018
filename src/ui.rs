use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

use camguard::{AggregateBlockStatus, IntrusionStatistics, ToggleOutcome};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

impl UiMode {
    fn parse(flag: &str) -> Self {
        match flag {
            "plain" => UiMode::Plain,
            "pretty" => UiMode::Pretty,
            _ => UiMode::Auto,
        }
    }
}

/// Progress and result rendering on stderr/stdout for the `camguard` CLI.
#[derive(Clone, Debug)]
pub struct Ui {
    mode: UiMode,
    is_tty: bool,
    disable_pretty: bool,
}

impl Ui {
    pub fn from_args(ui_flag: &str, is_tty: bool, disable_pretty: bool) -> Self {
        Self {
            mode: UiMode::parse(ui_flag),
            is_tty,
            disable_pretty,
        }
    }

    fn pretty(&self) -> bool {
        self.is_tty
            && match self.mode {
                UiMode::Pretty => true,
                UiMode::Auto => !self.disable_pretty,
                UiMode::Plain => false,
            }
    }

    /// Spinner (or a plain `==>` line) for a blocking step; finishes on drop.
    pub fn stage(&self, name: &str) -> Stage {
        if self.pretty() {
            let spinner = ProgressBar::new_spinner();
            spinner.set_draw_target(ProgressDrawTarget::stderr());
            spinner.enable_steady_tick(Duration::from_millis(120));
            let style = ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            spinner.set_style(style);
            spinner.set_message(format!("{name}…"));
            Stage::new(name.to_string(), Some(spinner))
        } else {
            eprintln!("==> {}", name);
            Stage::new(name.to_string(), None)
        }
    }

    pub fn print_status(&self, status: &AggregateBlockStatus, quorum: usize) {
        let applied = status.applied_count();
        let total = status.per_method.len();
        let verdict = if applied >= quorum { "BLOCKED" } else { "OPEN" };
        println!("camera: {} ({}/{} methods applied, quorum {})", verdict, applied, total, quorum);
        for (kind, applied) in &status.per_method {
            println!("  {:<16} {}", kind.name(), self.mark(*applied));
        }
        println!(
            "  {:<16} {}",
            "device",
            if status.device_reachable {
                "reachable"
            } else {
                "unreachable"
            }
        );
    }

    pub fn print_toggle(&self, action: &str, outcome: &ToggleOutcome) {
        let mark = self.mark(outcome.is_success());
        println!("{} {}: {}", mark, action, outcome);
    }

    pub fn print_statistics(&self, stats: &IntrusionStatistics) {
        println!("intrusions: {}", stats.total_intrusions);
        for (date, count) in &stats.by_date {
            println!("  {} {}", date, count);
        }
        println!(
            "evidence files: {} ({} bytes) in {}",
            stats.evidence_file_count,
            stats.total_bytes,
            stats.media_dir.display()
        );
        if let Some(latest) = &stats.most_recent {
            println!("most recent: {}", latest);
        }
        println!("failed logins: {}", stats.failed_logins);
        if let Some(error) = &stats.error {
            eprintln!("statistics incomplete: {}", error);
        }
    }

    fn mark(&self, ok: bool) -> &'static str {
        match (self.pretty(), ok) {
            (true, true) => "✔",
            (true, false) => "✘",
            (false, true) => "[ok]",
            (false, false) => "[--]",
        }
    }
}

pub struct Stage {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
}

impl Stage {
    fn new(name: String, spinner: Option<ProgressBar>) -> Self {
        Self {
            name,
            start: Instant::now(),
            spinner,
        }
    }
}

impl Drop for Stage {
    fn drop(&mut self) {
        let message = format!("{} ({})", self.name, format_duration(self.start.elapsed()));
        match &self.spinner {
            Some(spinner) => spinner.finish_with_message(format!("✔ {message}")),
            None => eprintln!("    done: {message}"),
        }
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}
