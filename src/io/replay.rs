//! Scripted input replay
//!
//! Bench-test input when no hardware is attached. One JSON object per line:
//!
//! ```text
//! {"at_ms": 0,   "type": "vibration",  "value": 0.9}
//! {"at_ms": 120, "type": "ultrasonic", "value": 31.5}
//! {"at_ms": 300, "type": "detection",  "confidence": 0.4, "label": "pothole", "image": "frames/0001.jpg"}
//! {"at_ms": 310, "type": "location",   "lat": 64.1466, "lon": -21.9426}
//! ```
//!
//! `at_ms` is relative to the start of the replay. Inputs are timestamped
//! `start + at_ms`, so a script can also exercise out-of-order handling.
//! Offsets beyond `MAX_OFFSET_MS` are treated as bad lines.

use crate::domain::types::{
    BBox, Detection, FrameImage, FusionInput, SensorReading, SensorSourceKind, SensorValue,
};
use crate::infra::metrics::Metrics;
use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Longest offset a script line may carry (one week)
const MAX_OFFSET_MS: u64 = 7 * 24 * 60 * 60 * 1000;

fn default_label() -> String {
    "pothole".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ReplayStep {
    Vibration {
        value: SensorValue,
    },
    Ultrasonic {
        value: SensorValue,
    },
    Detection {
        confidence: f64,
        #[serde(default = "default_label")]
        label: String,
        #[serde(default)]
        bbox: BBox,
        #[serde(default)]
        image: Option<PathBuf>,
    },
    Location {
        lat: f64,
        lon: f64,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct ReplayLine {
    at_ms: u64,
    #[serde(flatten)]
    step: ReplayStep,
}

impl ReplayLine {
    fn into_input(self, start: Instant) -> Option<FusionInput> {
        let at = start.checked_add(Duration::from_millis(self.at_ms))?;
        let input = match self.step {
            ReplayStep::Vibration { value } => FusionInput::Reading(SensorReading {
                source: SensorSourceKind::Vibration,
                value,
                timestamp: at,
            }),
            ReplayStep::Ultrasonic { value } => FusionInput::Reading(SensorReading {
                source: SensorSourceKind::Ultrasonic,
                value,
                timestamp: at,
            }),
            ReplayStep::Detection { confidence, label, bbox, image } => FusionInput::Detections {
                frame_timestamp: at,
                image: image.map(FrameImage::Path),
                detections: vec![Detection {
                    bbox,
                    confidence,
                    class_label: label,
                    frame_timestamp: at,
                }],
            },
            ReplayStep::Location { lat, lon } => FusionInput::Location { lat, lon },
        };
        Some(input)
    }
}

/// A parsed replay script
pub struct ReplaySource {
    lines: Vec<ReplayLine>,
    skipped: usize,
}

impl ReplaySource {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read replay file: {}", path.display()))?;
        let source = Self::parse(&content);
        info!(
            path = %path.display(),
            steps = %source.lines.len(),
            skipped = %source.skipped,
            "replay_loaded"
        );
        Ok(source)
    }

    /// Parse a script; blank lines and `#` comments are ignored, bad lines are skipped
    pub fn parse(content: &str) -> Self {
        let mut lines = Vec::new();
        let mut skipped = 0;
        for (n, raw) in content.lines().enumerate() {
            let raw = raw.trim();
            if raw.is_empty() || raw.starts_with('#') {
                continue;
            }
            match serde_json::from_str::<ReplayLine>(raw) {
                Ok(line) if line.at_ms > MAX_OFFSET_MS => {
                    warn!(line = %(n + 1), at_ms = %line.at_ms, "replay_line_offset_out_of_range");
                    skipped += 1;
                }
                Ok(line) => lines.push(line),
                Err(e) => {
                    warn!(line = %(n + 1), error = %e, "replay_line_invalid");
                    skipped += 1;
                }
            }
        }
        Self { lines, skipped }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Offsets and inputs relative to `start`, in script order; a line whose
    /// timestamp does not fit after `start` is left out
    pub fn into_inputs(self, start: Instant) -> Vec<(Duration, FusionInput)> {
        self.lines
            .into_iter()
            .filter_map(|line| {
                let offset = Duration::from_millis(line.at_ms);
                match line.into_input(start) {
                    Some(input) => Some((offset, input)),
                    None => {
                        warn!(offset_ms = %offset.as_millis(), "replay_step_unrepresentable");
                        None
                    }
                }
            })
            .collect()
    }

    /// Feed the script into the fusion channel with its recorded pacing;
    /// returns how many inputs were sent
    pub async fn run(
        self,
        tx: mpsc::Sender<FusionInput>,
        metrics: Arc<Metrics>,
        mut shutdown: watch::Receiver<bool>,
    ) -> usize {
        let start = Instant::now();
        let tokio_start = tokio::time::Instant::now();
        let mut sent = 0;

        for (offset, input) in self.into_inputs(start) {
            tokio::select! {
                _ = tokio::time::sleep_until(tokio_start + offset) => {}
                _ = shutdown.changed() => break,
            }
            match tx.try_send(input) {
                Ok(()) => sent += 1,
                Err(mpsc::error::TrySendError::Full(_)) => metrics.record_input_channel_full(),
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }

        info!(sent = %sent, "replay_finished");
        sent
    }
}
