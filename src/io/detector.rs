//! Camera and vision model boundary
//!
//! The model is a black box: `detect(frame)` returns boxes with confidences.
//! It runs on the blocking pool and is bounded by a timeout; an overrun or
//! an error means "no detection this cycle".

use crate::domain::types::{Detection, Frame};
use std::sync::Arc;
use std::time::Duration;

/// Produces frames on demand
pub trait FrameSource: Send {
    /// Grab the next frame; None if the camera has nothing this cycle
    fn capture(&mut self) -> Option<Frame>;
}

/// Opaque object detector
pub trait Detector: Send + Sync + 'static {
    fn detect(&self, frame: &Frame) -> anyhow::Result<Vec<Detection>>;
}

#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("detector exceeded {0:?}")]
    Timeout(Duration),
    #[error("detector failed: {0}")]
    Failed(#[from] anyhow::Error),
    #[error("detector panicked")]
    Panicked,
}

/// Run one detection on the blocking pool, bounded by `timeout`
///
/// An overrun thread is left to finish on its own; its result is discarded.
pub async fn detect_with_timeout(
    detector: Arc<dyn Detector>,
    frame: Frame,
    timeout: Duration,
) -> Result<Vec<Detection>, DetectError> {
    let task = tokio::task::spawn_blocking(move || detector.detect(&frame));
    match tokio::time::timeout(timeout, task).await {
        Err(_) => Err(DetectError::Timeout(timeout)),
        Ok(Err(_join)) => Err(DetectError::Panicked),
        Ok(Ok(result)) => Ok(result?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::BBox;
    use bytes::Bytes;
    use std::time::Instant;

    struct FixedDetector {
        confidence: f64,
        delay: Duration,
        fail: bool,
    }

    impl Detector for FixedDetector {
        fn detect(&self, frame: &Frame) -> anyhow::Result<Vec<Detection>> {
            std::thread::sleep(self.delay);
            if self.fail {
                anyhow::bail!("model not loaded");
            }
            Ok(vec![Detection {
                bbox: BBox { x: 1.0, y: 2.0, w: 30.0, h: 20.0 },
                confidence: self.confidence,
                class_label: "pothole".to_string(),
                frame_timestamp: frame.captured_at,
            }])
        }
    }

    fn frame() -> Frame {
        Frame { captured_at: Instant::now(), image_path: None, data: Bytes::from_static(b"jpeg") }
    }

    #[tokio::test]
    async fn test_detect_returns_detections() {
        let detector = Arc::new(FixedDetector { confidence: 0.8, delay: Duration::ZERO, fail: false });
        let frame = frame();
        let captured_at = frame.captured_at;

        let detections = detect_with_timeout(detector, frame, Duration::from_secs(1)).await.unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].frame_timestamp, captured_at);
    }

    #[tokio::test]
    async fn test_detect_overrun_is_timeout() {
        let detector =
            Arc::new(FixedDetector { confidence: 0.8, delay: Duration::from_millis(300), fail: false });
        let err = detect_with_timeout(detector, frame(), Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, DetectError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_detect_error_is_failure() {
        let detector = Arc::new(FixedDetector { confidence: 0.8, delay: Duration::ZERO, fail: true });
        let err = detect_with_timeout(detector, frame(), Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, DetectError::Failed(_)));
    }
}
