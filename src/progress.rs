use std::sync::Mutex;

use colored::Colorize;
use indicatif::{HumanBytes, ProgressBar, ProgressDrawTarget, ProgressStyle};
use modelfetch::{FetchEvent, FetchObserver};

const BAR_TEMPLATE: &str = "{msg:24!} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec} eta {eta}";
const SPINNER_TEMPLATE: &str = "{spinner} {msg:24!} {bytes} {bytes_per_sec}";

/// Renders session events as a single indicatif bar for the artifact in flight.
pub struct ProgressObserver {
    bar: Mutex<Option<ProgressBar>>,
    hidden: bool,
}

impl ProgressObserver {
    pub fn new(hidden: bool) -> Self {
        Self { bar: Mutex::new(None), hidden }
    }

    fn new_bar(&self, name: &str, total: Option<u64>) -> ProgressBar {
        let bar = match total {
            Some(len) => ProgressBar::new(len).with_style(
                ProgressStyle::with_template(BAR_TEMPLATE)
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=> "),
            ),
            None => ProgressBar::new_spinner().with_style(
                ProgressStyle::with_template(SPINNER_TEMPLATE).unwrap_or_else(|_| ProgressStyle::default_spinner()),
            ),
        };
        if self.hidden {
            bar.set_draw_target(ProgressDrawTarget::hidden());
        }
        bar.set_message(name.to_string());
        bar
    }

    fn println(&self, line: String) {
        if self.hidden {
            return;
        }
        match self.bar.lock().ok().and_then(|b| b.as_ref().cloned()) {
            Some(bar) => bar.println(line),
            None => eprintln!("{line}"),
        }
    }

    fn finish(&self) {
        if let Ok(mut slot) = self.bar.lock() {
            if let Some(bar) = slot.take() {
                bar.finish_and_clear();
            }
        }
    }
}

impl FetchObserver for ProgressObserver {
    fn on_event(&self, event: &FetchEvent<'_>) {
        match *event {
            FetchEvent::Skipped { name, size } => {
                self.println(format!("{} {name} already present ({})", "=".dimmed(), HumanBytes(size)));
            }
            FetchEvent::AttemptStarted { name, attempt, max_attempts } => {
                if attempt > 1 {
                    self.println(format!("{} {name}: attempt {attempt}/{max_attempts}", "↻".yellow()));
                }
            }
            FetchEvent::Resuming { name, offset } => {
                self.println(format!("  {name}: resuming at {}", HumanBytes(offset)));
            }
            FetchEvent::Progress { name, bytes, total } => {
                let Ok(mut slot) = self.bar.lock() else { return };
                let needs_new = match (slot.as_ref(), total) {
                    (None, _) => true,
                    (Some(bar), Some(len)) => bar.length() != Some(len),
                    (Some(_), None) => false,
                };
                if needs_new {
                    if let Some(old) = slot.take() {
                        old.finish_and_clear();
                    }
                    *slot = Some(self.new_bar(name, total));
                }
                if let Some(bar) = slot.as_ref() {
                    bar.set_position(bytes);
                }
            }
            FetchEvent::Retrying { name, attempt, delay, error } => {
                self.println(format!(
                    "{} {name}: attempt {attempt} failed ({error}), retrying in {}s",
                    "!".yellow().bold(),
                    delay.as_secs()
                ));
            }
            FetchEvent::Completed { name, size, .. } => {
                self.finish();
                self.println(format!("{} {name} ({})", "✓".green(), HumanBytes(size)));
            }
            FetchEvent::Failed { name, reason, attempts } => {
                self.finish();
                self.println(format!("{} {name} failed after {attempts} attempts: {reason}", "✗".red()));
            }
        }
    }
}
