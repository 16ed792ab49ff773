//! Detection engine port.
//!
//! The model itself runs out of process. [`DetectionEngine`] is the seam the
//! pipeline depends on; [`HttpDetectionEngine`] talks to an inference server that
//! runs the model over a folder of images and answers with one frame per image.

use crate::config::EngineConfig;
use crate::record::RawFrame;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors from the detection engine. All of them abort the batch.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Detection engine unavailable: {0}")]
    Unavailable(String),

    #[error("Detection engine returned {status}: {body}")]
    RequestFailed { status: u16, body: String },

    #[error("Invalid detection engine response: {0}")]
    InvalidResponse(String),
}

/// Detection output for one image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineFrame {
    /// Image filename the frame belongs to
    pub filename: String,
    #[serde(flatten)]
    pub frame: RawFrame,
}

/// Pose/object detection capability
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DetectionEngine: Send + Sync {
    /// Run detection over every image in `folder`
    async fn detect(
        &self,
        folder: &Path,
        confidence: f32,
        max_detections: u32,
    ) -> Result<Vec<EngineFrame>, EngineError>;
}

/// Request body sent to the inference server
#[derive(Debug, Serialize)]
struct DetectRequest<'a> {
    source: &'a str,
    conf: f32,
    max_det: u32,
}

/// Inference server client
pub struct HttpDetectionEngine {
    http: Client,
    url: String,
    timeout: Duration,
}

impl HttpDetectionEngine {
    /// Create a new engine client with the configured request timeout
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let timeout = Duration::from_secs(config.request_timeout_secs);
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;

        info!(url = %config.url, timeout_secs = timeout.as_secs(), "Detection engine client initialized");

        Ok(Self {
            http,
            url: config.url.clone(),
            timeout,
        })
    }

    /// Per-request timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl DetectionEngine for HttpDetectionEngine {
    #[instrument(skip(self, folder), fields(folder = %folder.display()))]
    async fn detect(
        &self,
        folder: &Path,
        confidence: f32,
        max_detections: u32,
    ) -> Result<Vec<EngineFrame>, EngineError> {
        let source = folder.to_string_lossy();
        let request = DetectRequest {
            source: &source,
            conf: confidence,
            max_det: max_detections,
        };

        let response = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::RequestFailed { status, body });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;

        let frames = parse_frames(&body)?;

        debug!(frames = frames.len(), "Detection engine responded");

        Ok(frames)
    }
}

/// Decode an inference server response body
pub fn parse_frames(body: &[u8]) -> Result<Vec<EngineFrame>, EngineError> {
    serde_json::from_slice(body).map_err(|e| EngineError::InvalidResponse(e.to_string()))
}
