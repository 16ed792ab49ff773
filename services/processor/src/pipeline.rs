//! Batch orchestration.
//!
//! One batch covers every image a device uploaded for a date: list the prefix,
//! download into a scratch directory, run the detection engine over the
//! directory, normalize each frame, store the records in one transaction, then
//! release local and remote copies. The scratch directory is owned by the batch
//! and removed on every exit path.

use crate::config::{EngineConfig, PipelineConfig, RemoteDeletePolicy};
use crate::engine::{DetectionEngine, EngineError, EngineFrame};
use crate::gateway::{
    device_prefix, key_filename, sanitize_path_component, GatewayError, ObjectStore,
};
use crate::normalizer::{normalize, SkipReason};
use crate::record::{RawFrame, StoredDetection};
use crate::store::{InsertOutcome, ResultStore, StoreError};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Errors that abort a whole batch
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Object store access failed: {0}")]
    StoreAccess(#[from] GatewayError),

    #[error("Detection engine unavailable: {0}")]
    EngineUnavailable(#[from] EngineError),

    #[error("Result store failed: {0}")]
    PersistenceConnection(#[from] StoreError),

    #[error("Scratch directory error: {0}")]
    Scratch(#[from] std::io::Error),
}

/// Overall batch status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Success,
    Warning,
}

/// Terminal outcome for one downloaded image
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// Record stored
    Stored(StoredDetection),
    /// Frame could not be turned into a record
    Skipped { filename: String, reason: SkipReason },
    /// Engine returned no frame for the image
    Missing { filename: String },
    /// A record with this image id already exists
    Conflict { image_id: String },
    /// Row failed validation before insertion
    Rejected { image_id: String, reason: String },
}

/// Result of one batch
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    pub status: BatchStatus,
    pub message: String,
    pub processed_images: usize,
    pub skipped_images: usize,
    pub conflicts: usize,
    pub outcomes: Vec<FrameOutcome>,
}

impl BatchReport {
    fn empty(prefix: &str) -> Self {
        Self {
            status: BatchStatus::Warning,
            message: format!("No images found under {}", prefix),
            processed_images: 0,
            skipped_images: 0,
            conflicts: 0,
            outcomes: Vec::new(),
        }
    }

    fn from_outcomes(outcomes: Vec<FrameOutcome>) -> Self {
        let processed_images = outcomes
            .iter()
            .filter(|o| matches!(o, FrameOutcome::Stored(_)))
            .count();
        let conflicts = outcomes
            .iter()
            .filter(|o| matches!(o, FrameOutcome::Conflict { .. }))
            .count();
        let skipped_images = outcomes.len() - processed_images - conflicts;

        Self {
            status: BatchStatus::Success,
            message: format!(
                "Processed {} of {} images ({} skipped, {} already stored)",
                processed_images,
                outcomes.len(),
                skipped_images,
                conflicts
            ),
            processed_images,
            skipped_images,
            conflicts,
            outcomes,
        }
    }
}

/// Local copy of a listed object
#[derive(Debug)]
struct DownloadedImage {
    key: String,
    filename: String,
    local_path: PathBuf,
}

/// Drives gateway, engine, normalizer and store for one device/date at a time
pub struct Orchestrator {
    gateway: Arc<dyn ObjectStore>,
    engine: Arc<dyn DetectionEngine>,
    store: Arc<dyn ResultStore>,
    config: PipelineConfig,
    key_root: String,
    confidence_threshold: f32,
    max_detections: u32,
    batch_lock: Mutex<()>,
}

impl Orchestrator {
    /// Create a new orchestrator
    pub fn new(
        gateway: Arc<dyn ObjectStore>,
        engine: Arc<dyn DetectionEngine>,
        store: Arc<dyn ResultStore>,
        config: PipelineConfig,
        engine_config: &EngineConfig,
        key_root: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            engine,
            store,
            config,
            key_root: key_root.into(),
            confidence_threshold: engine_config.confidence_threshold,
            max_detections: engine_config.max_detections,
            batch_lock: Mutex::new(()),
        }
    }

    /// Device serial the scheduler polls
    pub fn device_serial(&self) -> &str {
        &self.config.device_serial
    }

    /// Run one batch. Concurrent callers wait for the running batch to finish.
    #[instrument(skip(self))]
    pub async fn run(
        &self,
        device_serial: &str,
        date: NaiveDate,
    ) -> Result<BatchReport, PipelineError> {
        let _guard = self.batch_lock.lock().await;
        let started = Instant::now();

        let result = self.run_batch(device_serial, date).await;

        metrics::histogram!("keypose.batch.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        match &result {
            Ok(report) => {
                metrics::counter!("keypose.images.processed")
                    .increment(report.processed_images as u64);
                metrics::counter!("keypose.images.skipped").increment(report.skipped_images as u64);
                metrics::counter!("keypose.records.conflicts").increment(report.conflicts as u64);

                info!(
                    status = ?report.status,
                    processed = report.processed_images,
                    skipped = report.skipped_images,
                    conflicts = report.conflicts,
                    "Batch finished"
                );
            }
            Err(_) => {
                metrics::counter!("keypose.batches.failed").increment(1);
            }
        }

        result
    }

    async fn run_batch(
        &self,
        device_serial: &str,
        date: NaiveDate,
    ) -> Result<BatchReport, PipelineError> {
        let prefix = device_prefix(&self.key_root, device_serial, date);
        let keys = self.gateway.list(&prefix).await?;

        if keys.is_empty() {
            warn!(prefix = %prefix, "No images found for batch");
            return Ok(BatchReport::empty(&prefix));
        }

        info!(prefix = %prefix, images = keys.len(), "Starting batch");

        // Removed on drop if anything below returns early
        let scratch = self.scratch_dir(device_serial, date)?;

        let images = self.download_all(&keys, scratch.path()).await?;

        let frames = self
            .engine
            .detect(scratch.path(), self.confidence_threshold, self.max_detections)
            .await?;

        let outcomes = self.persist(&images, frames).await?;

        for (image, outcome) in images.iter().zip(&outcomes) {
            self.release(image, outcome).await;
        }

        let scratch_path = scratch.path().to_path_buf();
        if let Err(e) = scratch.close() {
            warn!(path = %scratch_path.display(), error = %e, "Failed to remove scratch directory");
        }

        Ok(BatchReport::from_outcomes(outcomes))
    }

    fn scratch_dir(&self, device_serial: &str, date: NaiveDate) -> Result<TempDir, PipelineError> {
        std::fs::create_dir_all(&self.config.scratch_root)?;

        let dir = tempfile::Builder::new()
            .prefix(&format!(
                "{}_{}_",
                sanitize_path_component(device_serial),
                date.format("%Y%m%d")
            ))
            .tempdir_in(&self.config.scratch_root)?;

        debug!(path = %dir.path().display(), "Created scratch directory");
        Ok(dir)
    }

    async fn download_all(
        &self,
        keys: &[String],
        dest_dir: &Path,
    ) -> Result<Vec<DownloadedImage>, PipelineError> {
        let mut images = Vec::with_capacity(keys.len());

        for key in keys {
            let filename = key_filename(key)
                .ok_or_else(|| GatewayError::InvalidKey(key.clone()))?
                .to_string();
            let local_path = self.gateway.download(key, dest_dir).await?;

            if self.config.remote_delete == RemoteDeletePolicy::AfterDownload {
                self.delete_remote(key).await;
            }

            images.push(DownloadedImage {
                key: key.clone(),
                filename,
                local_path,
            });
        }

        Ok(images)
    }

    /// Normalize every frame and store the resulting records in one batch.
    ///
    /// Returns one outcome per image, in download order.
    async fn persist(
        &self,
        images: &[DownloadedImage],
        frames: Vec<EngineFrame>,
    ) -> Result<Vec<FrameOutcome>, PipelineError> {
        let mut frames_by_file: HashMap<String, RawFrame> = HashMap::with_capacity(frames.len());
        for EngineFrame { filename, frame } in frames {
            let name = Path::new(&filename)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or(filename);
            frames_by_file.entry(name).or_insert(frame);
        }

        let mut outcomes: Vec<Option<FrameOutcome>> = (0..images.len()).map(|_| None).collect();
        let mut records = Vec::new();
        let mut record_slots = Vec::new();

        for (slot, image) in images.iter().enumerate() {
            let Some(frame) = frames_by_file.remove(&image.filename) else {
                warn!(filename = %image.filename, "Detection engine returned no frame for image");
                outcomes[slot] = Some(FrameOutcome::Missing {
                    filename: image.filename.clone(),
                });
                continue;
            };

            match normalize(&image.filename, &frame) {
                Ok(record) => {
                    records.push(record);
                    record_slots.push(slot);
                }
                Err(reason) => {
                    info!(filename = %image.filename, reason = %reason, "Skipping frame");
                    outcomes[slot] = Some(FrameOutcome::Skipped {
                        filename: image.filename.clone(),
                        reason,
                    });
                }
            }
        }

        for filename in frames_by_file.keys() {
            warn!(filename = %filename, "Ignoring frame for an image outside the batch");
        }

        if !records.is_empty() {
            let inserted = self.store.insert_batch(&records).await?;

            for (slot, outcome) in record_slots.into_iter().zip(inserted) {
                outcomes[slot] = Some(match outcome {
                    InsertOutcome::Stored(stored) => FrameOutcome::Stored(stored),
                    InsertOutcome::Conflict { image_id } => FrameOutcome::Conflict { image_id },
                    InsertOutcome::Rejected { image_id, reason } => {
                        FrameOutcome::Rejected { image_id, reason }
                    }
                });
            }
        }

        Ok(outcomes
            .into_iter()
            .zip(images)
            .map(|(outcome, image)| {
                outcome.unwrap_or_else(|| FrameOutcome::Rejected {
                    image_id: image.filename.clone(),
                    reason: "result store returned no outcome".to_string(),
                })
            })
            .collect())
    }

    /// Drop the local copy, and the remote one when it outlives the download.
    ///
    /// Images the engine never reported on keep their remote copy for the next batch.
    async fn release(&self, image: &DownloadedImage, outcome: &FrameOutcome) {
        if let Err(e) = tokio::fs::remove_file(&image.local_path).await {
            warn!(path = %image.local_path.display(), error = %e, "Failed to delete local image");
        }

        if self.config.remote_delete != RemoteDeletePolicy::AfterPersist {
            return;
        }

        if matches!(outcome, FrameOutcome::Missing { .. }) {
            debug!(key = %image.key, "Keeping remote object for image without a frame");
            return;
        }

        self.delete_remote(&image.key).await;
    }

    async fn delete_remote(&self, key: &str) {
        if let Err(e) = self.gateway.delete(key).await {
            warn!(key = %key, error = %e, "Failed to delete remote object");
        }
    }
}
