//! Keypose Processor
//!
//! Batch pose-detection pipeline. Devices upload still images to S3 under
//! `<root>/<serial>/<YYYYMMDD>/`. For a device and date this service downloads
//! the images, runs an external pose/object detection engine over them,
//! normalizes each frame into a fixed-schema record with eight canonical
//! keypoints, and stores one row per image in PostgreSQL.
//!
//! ## Features
//!
//! - **Fixed record schema**: one bounding box and exactly eight keypoint slots
//!   (head, neck, right hand, left hand, back, left foot, right foot, tail)
//! - **Typed skip vs abort**: malformed frames and duplicate images are skipped
//!   per frame; object store, engine and database failures abort the batch
//! - **Scoped cleanup**: the per-batch scratch directory is removed on every
//!   exit path
//! - **Two triggers**: a polling scheduler and an HTTP trigger endpoint, which
//!   never run batches concurrently
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐
//! │ Scheduler    │   │ Trigger API  │
//! └──────────────┘   └──────────────┘
//!        │                  │
//!        └────────┬─────────┘
//!                 ▼
//!         ┌──────────────┐        ┌──────────────┐
//!         │ Orchestrator │───────▶│ S3 Gateway   │  list / download / delete
//!         └──────────────┘        └──────────────┘
//!                 │               ┌──────────────┐
//!                 ├──────────────▶│ Detection    │  folder -> frames
//!                 │               │ Engine       │
//!                 │               └──────────────┘
//!                 │               ┌──────────────┐
//!                 ├──────────────▶│ Normalizer   │  frame -> record
//!                 │               └──────────────┘
//!                 │               ┌──────────────┐
//!                 └──────────────▶│ Result Store │  PostgreSQL
//!                                 └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod engine;
pub mod gateway;
pub mod normalizer;
pub mod pipeline;
pub mod record;
pub mod scheduler;
pub mod store;

pub use api::{AppState, ProcessRequest, ProcessResponse};
pub use config::{Config, RemoteDeletePolicy};
pub use engine::{DetectionEngine, EngineFrame, HttpDetectionEngine};
pub use gateway::{ObjectStore, S3Gateway};
pub use normalizer::{normalize, SkipReason};
pub use pipeline::{BatchReport, BatchStatus, FrameOutcome, Orchestrator, PipelineError};
pub use record::{DetectionRecord, KeypointName, RawFrame, StoredDetection};
pub use scheduler::Scheduler;
pub use store::{InsertOutcome, PgResultStore, ResultStore, RowBuilder};
