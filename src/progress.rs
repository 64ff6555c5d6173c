// src/progress.rs

//! Periodic sampling of the registry into display progress and throughput.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::models::{TaskId, TaskStatus};
use crate::registry::{TaskSnapshot, TransferRegistry};

/// Default sampling interval.
pub const DEFAULT_TICK: Duration = Duration::from_millis(500);

/// Weight kept from the previous smoothed rate on every sample.
const SMOOTHING: f64 = 0.7;

/// Highest percentage shown before a task is confirmed complete.
const DISPLAY_CAP: f64 = 99.0;

/// Cumulative bytes observed at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    pub timestamp: Instant,
    pub cumulative_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskProgress {
    pub id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    pub loaded: u64,
    pub total: u64,
    pub percent: f64,
}

/// One tick's worth of derived progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressReport {
    pub tasks: Vec<TaskProgress>,
    pub active: usize,
    /// Sum of loaded bytes over every task still holding progress.
    pub total_loaded: u64,
    /// Smoothed throughput in bytes per second.
    pub bytes_per_second: f64,
}

impl ProgressReport {
    pub fn task(&self, id: TaskId) -> Option<&TaskProgress> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn rate_label(&self) -> String {
        format!("{}/s", format_bytes(self.bytes_per_second as u64))
    }
}

/// Percentage shown for a task. Active work is capped at 99% so a unit
/// still buffering upstream never reads as done.
pub fn display_percent(status: TaskStatus, loaded: u64, total: u64) -> f64 {
    match status {
        TaskStatus::Completed => 100.0,
        TaskStatus::Pending => 0.0,
        _ if total == 0 => 0.0,
        TaskStatus::Active | TaskStatus::Error | TaskStatus::Aborted => {
            (loaded as f64 / total as f64 * 100.0).min(DISPLAY_CAP)
        }
    }
}

/// Derives rates from registry snapshots. Holds nothing that cannot be
/// recomputed from the registry.
#[derive(Debug, Default)]
pub struct ProgressAggregator {
    smoothed_rate: f64,
    previous: Option<ProgressSample>,
}

impl ProgressAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn smoothed_rate(&self) -> f64 {
        self.smoothed_rate
    }

    pub fn reset(&mut self) {
        self.smoothed_rate = 0.0;
        self.previous = None;
    }

    /// Folds one snapshot taken at `now` into the running rate.
    ///
    /// The first sample after an idle period only sets the baseline. A
    /// shrinking total (a task was aborted or cleared) never yields a
    /// negative rate; that sample is skipped and becomes the new baseline.
    pub fn observe(&mut self, snapshot: &[TaskSnapshot], now: Instant) -> ProgressReport {
        let active = snapshot
            .iter()
            .filter(|t| t.status == TaskStatus::Active)
            .count();

        let total_loaded: u64 = snapshot
            .iter()
            .filter_map(|t| t.progress)
            .map(|p| p.loaded)
            .sum();

        if active == 0 {
            self.reset();
        } else {
            if let Some(previous) = self.previous {
                let elapsed = now.duration_since(previous.timestamp).as_secs_f64();
                if elapsed > 0.0 && total_loaded >= previous.cumulative_bytes {
                    let rate = (total_loaded - previous.cumulative_bytes) as f64 / elapsed;
                    self.smoothed_rate = SMOOTHING * self.smoothed_rate + (1.0 - SMOOTHING) * rate;
                }
            }
            self.previous = Some(ProgressSample {
                timestamp: now,
                cumulative_bytes: total_loaded,
            });
        }

        let tasks = snapshot
            .iter()
            .map(|t| {
                let progress = t.progress.unwrap_or_default();
                TaskProgress {
                    id: t.id,
                    name: t.name.clone(),
                    status: t.status,
                    loaded: progress.loaded,
                    total: progress.total,
                    percent: display_percent(t.status, progress.loaded, progress.total),
                }
            })
            .collect();

        ProgressReport {
            tasks,
            active,
            total_loaded,
            bytes_per_second: self.smoothed_rate,
        }
    }
}

/// Background sampler publishing a [`ProgressReport`] on every tick.
pub struct ProgressMonitor {
    reports: watch::Receiver<ProgressReport>,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl ProgressMonitor {
    /// Starts sampling `registry` every `tick`.
    ///
    /// Reports are only published while something is active, plus one final
    /// report when the registry goes idle so observers see the rate drop.
    pub fn spawn(registry: TransferRegistry, tick: Duration) -> Self {
        let (tx, reports) = watch::channel(ProgressReport::default());
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        let handle = tokio::spawn(async move {
            let mut aggregator = ProgressAggregator::new();
            let mut ticker = tokio::time::interval(tick);
            let mut was_active = false;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = registry.snapshot().await;
                        let report = aggregator.observe(&snapshot, Instant::now());
                        let is_active = report.active > 0;
                        if is_active || was_active {
                            tx.send_replace(report);
                        }
                        was_active = is_active;
                    }
                    _ = token.cancelled() => break,
                }
            }
            tracing::debug!("progress monitor stopped");
        });

        Self {
            reports,
            shutdown,
            handle,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressReport> {
        self.reports.clone()
    }

    pub fn latest(&self) -> ProgressReport {
        self.reports.borrow().clone()
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.handle.await;
    }
}

/// Human-readable byte count, 1024-based: `0 Bytes`, `1.5 KB`, `20 MB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 7] = ["Bytes", "KB", "MB", "GB", "TB", "PB", "EB"];
    if bytes == 0 {
        return "0 Bytes".to_string();
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let rendered = format!("{value:.2}");
    let trimmed = rendered.trim_end_matches('0').trim_end_matches('.');
    format!("{trimmed} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Progress;

    fn snap(status: TaskStatus, loaded: u64, total: u64) -> TaskSnapshot {
        TaskSnapshot {
            id: TaskId::new(),
            name: "unit".into(),
            status,
            progress: Some(Progress { loaded, total }),
        }
    }

    #[test]
    fn active_progress_is_capped_below_100() {
        assert_eq!(display_percent(TaskStatus::Active, 100, 100), 99.0);
        assert_eq!(display_percent(TaskStatus::Active, 50, 100), 50.0);
        assert_eq!(display_percent(TaskStatus::Completed, 10, 100), 100.0);
        assert_eq!(display_percent(TaskStatus::Active, 10, 0), 0.0);
    }

    #[test]
    fn first_sample_only_sets_baseline() {
        let mut agg = ProgressAggregator::new();
        let report = agg.observe(&[snap(TaskStatus::Active, 1000, 2000)], Instant::now());
        assert_eq!(report.bytes_per_second, 0.0);
        assert_eq!(report.total_loaded, 1000);
    }

    #[test]
    fn rate_is_exponentially_smoothed() {
        let mut agg = ProgressAggregator::new();
        let t0 = Instant::now();
        agg.observe(&[snap(TaskStatus::Active, 0, 10_000)], t0);

        let report = agg.observe(
            &[snap(TaskStatus::Active, 1000, 10_000)],
            t0 + Duration::from_secs(1),
        );
        assert!((report.bytes_per_second - 300.0).abs() < 1e-9);

        let report = agg.observe(
            &[snap(TaskStatus::Active, 2000, 10_000)],
            t0 + Duration::from_secs(2),
        );
        assert!((report.bytes_per_second - 510.0).abs() < 1e-9);
    }

    #[test]
    fn shrinking_total_never_gives_negative_rate() {
        let mut agg = ProgressAggregator::new();
        let t0 = Instant::now();
        agg.observe(
            &[snap(TaskStatus::Active, 500, 1000), snap(TaskStatus::Active, 500, 1000)],
            t0,
        );
        let report = agg.observe(&[snap(TaskStatus::Active, 600, 1000)], t0 + Duration::from_secs(1));
        assert_eq!(report.bytes_per_second, 0.0);
    }

    #[test]
    fn zero_elapsed_is_skipped() {
        let mut agg = ProgressAggregator::new();
        let t0 = Instant::now();
        agg.observe(&[snap(TaskStatus::Active, 0, 1000)], t0);
        let report = agg.observe(&[snap(TaskStatus::Active, 500, 1000)], t0);
        assert_eq!(report.bytes_per_second, 0.0);
    }

    #[test]
    fn idle_registry_resets_rate() {
        let mut agg = ProgressAggregator::new();
        let t0 = Instant::now();
        agg.observe(&[snap(TaskStatus::Active, 0, 1000)], t0);
        agg.observe(&[snap(TaskStatus::Active, 1000, 1000)], t0 + Duration::from_secs(1));
        assert!(agg.smoothed_rate() > 0.0);

        let report = agg.observe(&[snap(TaskStatus::Completed, 1000, 1000)], t0 + Duration::from_secs(2));
        assert_eq!(report.active, 0);
        assert_eq!(report.bytes_per_second, 0.0);
        assert_eq!(report.tasks[0].percent, 100.0);
    }

    #[test]
    fn aborted_tasks_do_not_count() {
        let mut agg = ProgressAggregator::new();
        let aborted = TaskSnapshot {
            id: TaskId::new(),
            name: "gone".into(),
            status: TaskStatus::Aborted,
            progress: None,
        };
        let report = agg.observe(&[snap(TaskStatus::Active, 10, 100), aborted], Instant::now());
        assert_eq!(report.total_loaded, 10);
    }

    #[test]
    fn bytes_are_formatted_like_the_footer() {
        assert_eq!(format_bytes(0), "0 Bytes");
        assert_eq!(format_bytes(512), "512 Bytes");
        assert_eq!(format_bytes(1024), "1 KB");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(20 * 1024 * 1024), "20 MB");
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_publishes_while_active() {
        use crate::models::{Direction, TransferTask};

        let registry = TransferRegistry::new();
        let id = registry
            .insert_task(TransferTask::new("unit", Direction::Upload, 100))
            .await;
        registry.transition(id, TaskStatus::Active, None).await.unwrap();
        registry.set_progress(id, 40, 100).await;

        let monitor = ProgressMonitor::spawn(registry.clone(), DEFAULT_TICK);
        let mut reports = monitor.subscribe();
        reports.changed().await.unwrap();

        let report = reports.borrow().clone();
        assert_eq!(report.active, 1);
        assert_eq!(report.task(id).unwrap().percent, 40.0);

        monitor.stop().await;
    }
}
