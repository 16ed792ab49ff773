//! Detection data model.
//!
//! [`RawFrame`] is the engine-native shape returned by the inference server for
//! one image. [`DetectionRecord`] is the canonical, fixed-schema form that gets
//! persisted, and [`StoredDetection`] is a record as it exists in the database.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::path::Path;
use thiserror::Error;

/// Number of named keypoint slots in every record.
pub const KEYPOINT_COUNT: usize = 8;

/// Canonical keypoint names, in model output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeypointName {
    Head,
    Neck,
    RightHand,
    LeftHand,
    Back,
    LeftFoot,
    RightFoot,
    Tail,
}

impl KeypointName {
    /// All names, indexed by model output position.
    pub const ALL: [KeypointName; KEYPOINT_COUNT] = [
        KeypointName::Head,
        KeypointName::Neck,
        KeypointName::RightHand,
        KeypointName::LeftHand,
        KeypointName::Back,
        KeypointName::LeftFoot,
        KeypointName::RightFoot,
        KeypointName::Tail,
    ];

    /// Name for a model output index, if it is one of the canonical slots.
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Column prefix used by the relational layout.
    pub fn column_prefix(&self) -> &'static str {
        match self {
            KeypointName::Head => "head",
            KeypointName::Neck => "neck",
            KeypointName::RightHand => "rhand",
            KeypointName::LeftHand => "lhand",
            KeypointName::Back => "back",
            KeypointName::LeftFoot => "lfoot",
            KeypointName::RightFoot => "rfoot",
            KeypointName::Tail => "tail",
        }
    }
}

/// Label for any keypoint index; indices past the canonical slots get `kpt_<n>`.
pub fn keypoint_label(index: usize) -> Cow<'static, str> {
    match KeypointName::from_index(index) {
        Some(name) => Cow::Borrowed(name.column_prefix()),
        None => Cow::Owned(format!("kpt_{}", index)),
    }
}

/// Unnormalized engine output for one image
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawFrame {
    /// Detected boxes (the engine is normally capped at one)
    #[serde(default)]
    pub boxes: Vec<RawBox>,
    /// Keypoint sets, one per detection
    #[serde(default)]
    pub keypoints: Vec<Vec<RawKeypoint>>,
}

/// Engine-native bounding box
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawBox {
    /// Corner coordinates `[x1, y1, x2, y2]`
    #[serde(default)]
    pub xyxy: Vec<f32>,
    /// Detection confidence
    #[serde(default)]
    pub conf: Option<f32>,
    /// Class index
    #[serde(default)]
    pub cls: Option<i64>,
}

/// Engine-native keypoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawKeypoint {
    /// Name assigned by the engine, if any. Normalization ignores it and maps by position.
    #[serde(default)]
    pub name: Option<String>,
    /// `[x, y]` pixel coordinate
    #[serde(default)]
    pub xy: Vec<f32>,
    /// Keypoint confidence
    #[serde(default)]
    pub conf: Option<f32>,
}

/// Bounding box of the detected subject
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
}

/// One populated keypoint slot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub confidence: f32,
}

/// Canonical detection record for one image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    /// Object filename without extension; primary key
    pub image_id: String,
    /// Device serial parsed from the filename
    pub device_serial: String,
    /// Capture date parsed from the filename
    pub capture_date: NaiveDate,
    /// `YYYYMMDD_HHMMSS` token from the filename
    pub timestamp: Option<String>,
    /// Subject bounding box
    pub bounding_box: Option<BoundingBox>,
    /// Keypoint slots in [`KeypointName::ALL`] order; `None` is the null triple
    pub keypoints: [Option<Keypoint>; KEYPOINT_COUNT],
}

impl DetectionRecord {
    /// Keypoint in a named slot
    pub fn keypoint(&self, name: KeypointName) -> Option<&Keypoint> {
        self.keypoints[name as usize].as_ref()
    }

    /// Number of populated keypoint slots
    pub fn populated_keypoints(&self) -> usize {
        self.keypoints.iter().filter(|k| k.is_some()).count()
    }
}

/// A record as persisted by the result store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDetection {
    /// Tenant/user tag written with the row
    pub user_id: String,
    #[serde(flatten)]
    pub record: DetectionRecord,
    /// Insertion time assigned by the store
    pub created_at: DateTime<Utc>,
}

/// Errors parsing `<serial>_<YYYYMMDD>_<HHMMSS>.<ext>` filenames
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilenameError {
    #[error("filename has no stem: {0:?}")]
    MissingStem(String),

    #[error("filename has no device serial segment: {0}")]
    MissingSerial(String),

    #[error("filename has no date segment: {0}")]
    MissingDate(String),

    #[error("invalid date segment {segment:?} in {filename}")]
    InvalidDate { filename: String, segment: String },
}

/// Identity fields derived from an image filename
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageIdentity {
    pub image_id: String,
    pub device_serial: String,
    pub capture_date: NaiveDate,
}

impl ImageIdentity {
    /// Parse identity from a filename or full object key.
    pub fn from_filename(filename: &str) -> Result<Self, FilenameError> {
        let stem = Path::new(filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| FilenameError::MissingStem(filename.to_string()))?;

        let mut segments = stem.split('_');

        let device_serial = segments
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| FilenameError::MissingSerial(filename.to_string()))?;

        let date_segment = segments
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| FilenameError::MissingDate(filename.to_string()))?;

        let capture_date = NaiveDate::parse_from_str(date_segment, "%Y%m%d").map_err(|_| {
            FilenameError::InvalidDate {
                filename: filename.to_string(),
                segment: date_segment.to_string(),
            }
        })?;

        Ok(Self {
            image_id: stem.to_string(),
            device_serial: device_serial.to_string(),
            capture_date,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_from_filename() {
        let identity = ImageIdentity::from_filename("SFRXC12515GF00001_20250417_170454.jpg").unwrap();
        assert_eq!(identity.image_id, "SFRXC12515GF00001_20250417_170454");
        assert_eq!(identity.device_serial, "SFRXC12515GF00001");
        assert_eq!(identity.capture_date, NaiveDate::from_ymd_opt(2025, 4, 17).unwrap());
    }

    #[test]
    fn test_identity_from_object_key() {
        let identity =
            ImageIdentity::from_filename("opencv/SFRXC12515GF00001/20250417/SFRXC12515GF00001_20250417_170454.PNG")
                .unwrap();
        assert_eq!(identity.image_id, "SFRXC12515GF00001_20250417_170454");
    }

    #[test]
    fn test_identity_rejects_bad_names() {
        assert!(matches!(
            ImageIdentity::from_filename("nodate.jpg"),
            Err(FilenameError::MissingDate(_))
        ));
        assert!(matches!(
            ImageIdentity::from_filename("DEV_2025x417_170454.jpg"),
            Err(FilenameError::InvalidDate { .. })
        ));
        assert!(matches!(
            ImageIdentity::from_filename("_20250417_170454.jpg"),
            Err(FilenameError::MissingSerial(_))
        ));
    }

    #[test]
    fn test_keypoint_labels() {
        assert_eq!(keypoint_label(0), "head");
        assert_eq!(keypoint_label(2), "rhand");
        assert_eq!(keypoint_label(7), "tail");
        assert_eq!(keypoint_label(8), "kpt_8");
        assert_eq!(KeypointName::from_index(5), Some(KeypointName::LeftFoot));
        assert_eq!(KeypointName::from_index(8), None);
    }

    #[test]
    fn test_raw_frame_deserializes_engine_shape() {
        let json = r#"{
            "boxes": [{"xyxy": [10.0, 20.0, 110.0, 220.0], "conf": 0.9, "cls": 0}],
            "keypoints": [[{"name": "head", "xy": [12.0, 30.5], "conf": 0.8}, {"xy": [1.0, 2.0]}]]
        }"#;

        let frame: RawFrame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.boxes.len(), 1);
        assert_eq!(frame.keypoints[0].len(), 2);
        assert_eq!(frame.keypoints[0][1].conf, None);
    }
}
