use crate::config::SchedulerConfig;
use crate::pipeline::Orchestrator;
use chrono::NaiveDate;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

/// Time to wait before the next batch: the rest of the tick, never below `min_wait`
pub fn wait_duration(tick: Duration, min_wait: Duration, elapsed: Duration) -> Duration {
    tick.saturating_sub(elapsed).max(min_wait)
}

/// Polls one device/date at a fixed cadence until cancelled
pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    device_serial: String,
    target_date: NaiveDate,
    tick: Duration,
    min_wait: Duration,
}

impl Scheduler {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        device_serial: impl Into<String>,
        target_date: NaiveDate,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            orchestrator,
            device_serial: device_serial.into(),
            target_date,
            tick: config.tick_interval(),
            min_wait: config.min_wait(),
        }
    }

    /// Run batches until `shutdown` is cancelled.
    ///
    /// Cancellation is only observed between batches; a running batch always
    /// finishes. Batch errors are logged and the same date is retried.
    #[instrument(skip(self, shutdown), fields(device_serial = %self.device_serial, date = %self.target_date))]
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            tick_ms = self.tick.as_millis() as u64,
            min_wait_ms = self.min_wait.as_millis() as u64,
            "Starting scheduler"
        );

        while !shutdown.is_cancelled() {
            let started = Instant::now();

            match self
                .orchestrator
                .run(&self.device_serial, self.target_date)
                .await
            {
                Ok(report) => {
                    debug!(
                        status = ?report.status,
                        processed = report.processed_images,
                        "Scheduled batch completed"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Scheduled batch failed, retrying on next tick");
                }
            }

            let wait = wait_duration(self.tick, self.min_wait, started.elapsed());

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, PipelineConfig};
    use crate::engine::MockDetectionEngine;
    use crate::gateway::{GatewayError, MockObjectStore};
    use crate::store::MockResultStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            enabled: true,
            tick_interval_ms: 5,
            min_wait_ms: 1,
        }
    }

    fn scheduler_with(gateway: MockObjectStore) -> Scheduler {
        let engine_config = EngineConfig {
            url: "http://localhost:8000/predict".to_string(),
            confidence_threshold: 0.3,
            max_detections: 1,
            request_timeout_secs: 30,
        };

        let orchestrator = Orchestrator::new(
            Arc::new(gateway),
            Arc::new(MockDetectionEngine::new()),
            Arc::new(MockResultStore::new()),
            PipelineConfig::default(),
            &engine_config,
            "opencv",
        );

        Scheduler::new(
            Arc::new(orchestrator),
            "SFRXC12515GF00001",
            NaiveDate::from_ymd_opt(2025, 4, 17).unwrap(),
            &fast_config(),
        )
    }

    #[test]
    fn test_wait_shrinks_by_elapsed() {
        let wait = wait_duration(
            Duration::from_secs(1),
            Duration::from_millis(100),
            Duration::from_millis(300),
        );
        assert_eq!(wait, Duration::from_millis(700));
    }

    #[test]
    fn test_wait_honors_floor() {
        let min_wait = Duration::from_millis(100);

        assert_eq!(
            wait_duration(Duration::from_secs(1), min_wait, Duration::from_millis(950)),
            min_wait
        );
        assert_eq!(
            wait_duration(Duration::from_secs(1), min_wait, Duration::from_secs(5)),
            min_wait
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_start_runs_nothing() {
        let mut gateway = MockObjectStore::new();
        gateway.expect_list().never();

        let shutdown = CancellationToken::new();
        shutdown.cancel();

        scheduler_with(gateway).run(shutdown).await;
    }

    #[tokio::test]
    async fn test_cancellation_lets_running_batch_finish() {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        let mut gateway = MockObjectStore::new();
        gateway.expect_list().times(1).returning(move |_| {
            // Cancel mid-batch; the batch still completes
            token.cancel();
            Ok(vec![])
        });

        tokio::time::timeout(Duration::from_secs(5), scheduler_with(gateway).run(shutdown))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_batch_errors_do_not_stop_loop() {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let mut gateway = MockObjectStore::new();
        gateway.expect_list().returning(move |prefix| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                return Err(GatewayError::ListFailed {
                    prefix: prefix.to_string(),
                    message: "timeout".to_string(),
                });
            }
            token.cancel();
            Ok(vec![])
        });

        tokio::time::timeout(Duration::from_secs(5), scheduler_with(gateway).run(shutdown))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
