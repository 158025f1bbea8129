//! Shared sensor and detector types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;

/// Kind of signal that can corroborate a pothole
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    Vision,
    Ultrasonic,
    Vibration,
}

impl SensorKind {
    pub const ALL: [SensorKind; 3] = [SensorKind::Vision, SensorKind::Ultrasonic, SensorKind::Vibration];

    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorKind::Vision => "vision",
            SensorKind::Ultrasonic => "ultrasonic",
            SensorKind::Vibration => "vibration",
        }
    }

    /// Dense index for per-kind arrays
    #[inline]
    pub(crate) fn index(&self) -> usize {
        match self {
            SensorKind::Vision => 0,
            SensorKind::Ultrasonic => 1,
            SensorKind::Vibration => 2,
        }
    }
}

impl std::fmt::Display for SensorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SensorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vision" => Ok(SensorKind::Vision),
            "ultrasonic" => Ok(SensorKind::Ultrasonic),
            "vibration" => Ok(SensorKind::Vibration),
            other => Err(format!("unknown sensor kind: {other}")),
        }
    }
}

/// Physical sensors that produce periodic readings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorSourceKind {
    Ultrasonic,
    Vibration,
}

impl SensorSourceKind {
    #[inline]
    pub fn kind(&self) -> SensorKind {
        match self {
            SensorSourceKind::Ultrasonic => SensorKind::Ultrasonic,
            SensorSourceKind::Vibration => SensorKind::Vibration,
        }
    }
}

/// Raw reading value: ultrasonic distance (cm) or vibration impulse (scalar or switch)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SensorValue {
    Scalar(f64),
    Flag(bool),
}

/// A single reading from a physical sensor
#[derive(Debug, Clone, Copy)]
pub struct SensorReading {
    pub source: SensorSourceKind,
    pub value: SensorValue,
    pub timestamp: Instant,
}

impl SensorReading {
    pub fn scalar(source: SensorSourceKind, value: f64, timestamp: Instant) -> Self {
        Self { source, value: SensorValue::Scalar(value), timestamp }
    }

    pub fn flag(source: SensorSourceKind, value: bool, timestamp: Instant) -> Self {
        Self { source, value: SensorValue::Flag(value), timestamp }
    }
}

/// Bounding box in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

/// One object found by the detector in a frame
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BBox,
    pub confidence: f64,
    pub class_label: String,
    pub frame_timestamp: Instant,
}

/// A captured camera frame handed to the detector
#[derive(Debug, Clone)]
pub struct Frame {
    pub captured_at: Instant,
    /// Set when the camera driver already wrote the frame to disk
    pub image_path: Option<PathBuf>,
    /// Encoded image (JPEG)
    pub data: bytes::Bytes,
}

impl Frame {
    /// Image evidence for detections on this frame: the driver's file if it
    /// wrote one, otherwise the in-memory encoding
    pub fn image(&self) -> Option<FrameImage> {
        match &self.image_path {
            Some(path) => Some(FrameImage::Path(path.clone())),
            None if !self.data.is_empty() => Some(FrameImage::Encoded(self.data.clone())),
            None => None,
        }
    }
}

/// Image evidence attached to a set of detections
#[derive(Debug, Clone, PartialEq)]
pub enum FrameImage {
    /// Already on disk
    Path(PathBuf),
    /// Held in memory; written next to the event once it confirms
    Encoded(bytes::Bytes),
}

/// Everything the fusion loop consumes, one channel for all producers
#[derive(Debug, Clone)]
pub enum FusionInput {
    Reading(SensorReading),
    Detections {
        frame_timestamp: Instant,
        image: Option<FrameImage>,
        detections: Vec<Detection>,
    },
    Location {
        lat: f64,
        lon: f64,
    },
}
