//! Console rendering of pipeline events.
//!
//! Consumes the pipeline's event stream and prints a per-batch tree with
//! stage timings, plus an indicatif page progress bar.

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;

use crate::pipeline::{PipelineEvent, StageKind};

/// Stage durations above these are flagged as slow (seconds).
fn slow_threshold(stage: StageKind) -> f64 {
    match stage {
        StageKind::Embedding => 10.0,
        StageKind::Storage => 2.0,
        StageKind::Ocr => 5.0,
        StageKind::Upsert => 2.0,
    }
}

/// Render events until the channel closes.
pub async fn render_events(mut events: mpsc::UnboundedReceiver<PipelineEvent>) {
    let mut bar: Option<ProgressBar> = None;
    let mut total_pages: u32 = 0;

    while let Some(event) = events.recv().await {
        match event {
            PipelineEvent::DocumentStarted {
                filename,
                total_pages: pages,
                file_size_bytes,
            } => {
                total_pages = pages;
                println!(
                    "\n{} Processing {} ({} pages, {:.1} MB)",
                    style("⚡").yellow(),
                    style(&filename).cyan().bold(),
                    pages,
                    file_size_bytes as f64 / 1024.0 / 1024.0
                );
                let pb = ProgressBar::new(pages as u64);
                pb.set_style(
                    ProgressStyle::with_template(
                        "  {bar:32.cyan/dim} {pos}/{len} pages {msg}",
                    )
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
                );
                bar = Some(pb);
            }
            PipelineEvent::BatchStarted {
                batch_id,
                page_start,
                page_end,
            } => {
                let line = format!(
                    "{} Batch {} {}",
                    style("📦").blue(),
                    batch_id + 1,
                    style(format!("pages {}-{}", page_start, page_end)).dim()
                );
                print_line(&bar, &line);
            }
            PipelineEvent::StageStarted { .. } => {}
            PipelineEvent::StageCompleted {
                stage,
                batch_id,
                pages,
                duration,
            } => {
                let secs = duration.as_secs_f64();
                let slow = secs > slow_threshold(stage);
                let timing = if slow {
                    style(format!("{:.2}s (slow)", secs)).yellow()
                } else {
                    style(format!("{:.2}s", secs)).green()
                };
                let line = format!(
                    "    ├── {} {:<10} {} {}",
                    style("✓").green(),
                    stage.as_str(),
                    timing,
                    style(format!("batch {} · {} pages", batch_id + 1, pages)).dim()
                );
                print_line(&bar, &line);
            }
            PipelineEvent::StageFailed {
                stage,
                batch_id,
                error,
            } => {
                let line = format!(
                    "    ├── {} {} FAILED (batch {}): {}",
                    style("✗").red(),
                    style(stage.as_str()).red().bold(),
                    batch_id + 1,
                    style(error).red()
                );
                print_line(&bar, &line);
            }
            PipelineEvent::BatchCompleted {
                batch_id,
                completed_pages,
            } => {
                if let Some(pb) = &bar {
                    pb.set_position(completed_pages as u64);
                }
                let line = format!(
                    "    └── {} Batch {} complete {}",
                    style("✓").green(),
                    batch_id + 1,
                    style(format!("({}/{} pages)", completed_pages, total_pages)).dim()
                );
                print_line(&bar, &line);
            }
            PipelineEvent::DocumentCompleted {
                total_pages,
                elapsed,
            } => {
                if let Some(pb) = bar.take() {
                    pb.finish_and_clear();
                }
                let rate = if elapsed.as_secs_f64() > 0.0 {
                    total_pages as f64 / elapsed.as_secs_f64()
                } else {
                    0.0
                };
                println!(
                    "  {} Done: {} pages in {:.1}s ({:.1} pages/sec)",
                    style("✓").green().bold(),
                    total_pages,
                    elapsed.as_secs_f64(),
                    rate
                );
            }
        }
    }

    if let Some(pb) = bar.take() {
        pb.finish_and_clear();
    }
}

fn print_line(bar: &Option<ProgressBar>, line: &str) {
    match bar {
        Some(pb) => pb.println(line),
        None => println!("{}", line),
    }
}
