//! Progress bar fed by unit events

use indicatif::{ProgressBar, ProgressStyle};
use tierbench_core::{UnitEvent, UnitStatus};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}";

/// Renders terminal unit events until the sender side closes
pub struct Progress {
    bar: ProgressBar,
    task: JoinHandle<usize>,
}

impl Progress {
    pub fn spawn(total: usize, mut events: mpsc::Receiver<UnitEvent>) -> Self {
        let bar = ProgressBar::new(total as u64);
        let style = ProgressStyle::with_template(TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        bar.set_style(style);

        let task = tokio::spawn({
            let bar = bar.clone();
            async move {
                let mut failed = 0;
                while let Some(event) = events.recv().await {
                    match event.status {
                        UnitStatus::Complete => {
                            bar.inc(1);
                            bar.set_message(event.key.to_string());
                        }
                        UnitStatus::Failed => {
                            failed += 1;
                            bar.inc(1);
                            bar.println(format!(
                                "failed {}: {}",
                                event.key,
                                event.error.as_deref().unwrap_or("unknown error")
                            ));
                        }
                        UnitStatus::RateLimited => {
                            bar.set_message(format!("rate limited at {}", event.key));
                        }
                        UnitStatus::Pending | UnitStatus::InProgress => {}
                    }
                }
                failed
            }
        });

        Self { bar, task }
    }

    /// Wait for the event stream to end and clear the bar
    ///
    /// Every sender must be dropped first. Returns the failed-unit count seen.
    pub async fn finish(self) -> usize {
        let failed = self.task.await.unwrap_or_default();
        self.bar.finish_and_clear();
        failed
    }
}
