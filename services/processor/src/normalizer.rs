use crate::record::{
    keypoint_label, BoundingBox, DetectionRecord, FilenameError, ImageIdentity, Keypoint, RawBox,
    RawFrame, RawKeypoint, KEYPOINT_COUNT,
};
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Reason a frame produced no record
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SkipReason {
    #[error("no bounding box and no keypoints for {image_id}")]
    EmptyFrame { image_id: String },

    #[error("unparseable image filename: {0}")]
    InvalidFilename(#[from] FilenameError),
}

fn timestamp_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\d{8}_\d{6}").expect("timestamp pattern is valid"))
}

/// Extract the `YYYYMMDD_HHMMSS` token embedded in a filename
pub fn extract_timestamp(filename: &str) -> Option<String> {
    timestamp_pattern()
        .find(filename)
        .map(|m| m.as_str().to_string())
}

/// Convert one engine frame into a canonical record.
///
/// Keypoints are mapped by position onto the canonical slots; slots the engine
/// did not fill stay `None`. The output depends only on the inputs.
pub fn normalize(filename: &str, frame: &RawFrame) -> Result<DetectionRecord, SkipReason> {
    let identity = ImageIdentity::from_filename(filename)?;

    let bounding_box = frame
        .boxes
        .first()
        .and_then(|raw| map_box(&identity.image_id, raw));

    let keypoints = frame
        .keypoints
        .first()
        .map(|set| map_keypoints(&identity.image_id, set))
        .unwrap_or([None; KEYPOINT_COUNT]);

    if bounding_box.is_none() && keypoints.iter().all(Option::is_none) {
        return Err(SkipReason::EmptyFrame {
            image_id: identity.image_id,
        });
    }

    Ok(DetectionRecord {
        timestamp: extract_timestamp(filename),
        image_id: identity.image_id,
        device_serial: identity.device_serial,
        capture_date: identity.capture_date,
        bounding_box,
        keypoints,
    })
}

fn map_box(image_id: &str, raw: &RawBox) -> Option<BoundingBox> {
    match raw.xyxy.as_slice() {
        &[x1, y1, x2, y2] => Some(BoundingBox {
            x1,
            y1,
            x2,
            y2,
            confidence: raw.conf.unwrap_or(0.0),
        }),
        other => {
            warn!(
                image_id = %image_id,
                coordinates = other.len(),
                "Bounding box does not have 4 coordinates, ignoring it"
            );
            None
        }
    }
}

fn map_keypoints(image_id: &str, set: &[RawKeypoint]) -> [Option<Keypoint>; KEYPOINT_COUNT] {
    let mut slots = [None; KEYPOINT_COUNT];

    for (index, raw) in set.iter().enumerate() {
        if index >= KEYPOINT_COUNT {
            debug!(
                image_id = %image_id,
                keypoint = %keypoint_label(index),
                "Keypoint beyond canonical slots not recorded"
            );
            continue;
        }

        match raw.xy.as_slice() {
            &[x, y] => {
                slots[index] = Some(Keypoint {
                    x,
                    y,
                    confidence: raw.conf.unwrap_or(0.0),
                });
            }
            other => {
                trace!(
                    image_id = %image_id,
                    keypoint = %keypoint_label(index),
                    coordinates = other.len(),
                    "Keypoint without a 2-D coordinate left empty"
                );
            }
        }
    }

    slots
}
