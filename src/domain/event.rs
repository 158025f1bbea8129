//! Confirmed pothole event model

use crate::domain::types::SensorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Delivery status of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Uploading,
    Delivered,
    /// Dead-lettered after exceeding the attempt ceiling
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Uploading => "uploading",
            EventStatus::Delivered => "delivered",
            EventStatus::Failed => "failed",
        }
    }
}

/// Distinct sensor kinds that signaled for one incident, sorted and deduplicated
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Corroboration(SmallVec<[SensorKind; 3]>);

impl Corroboration {
    pub fn new() -> Self {
        Self(SmallVec::new())
    }

    /// Add a kind; returns false if it was already present
    pub fn insert(&mut self, kind: SensorKind) -> bool {
        match self.0.binary_search(&kind) {
            Ok(_) => false,
            Err(pos) => {
                self.0.insert(pos, kind);
                true
            }
        }
    }

    #[inline]
    pub fn contains(&self, kind: SensorKind) -> bool {
        self.0.binary_search(&kind).is_ok()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = SensorKind> + '_ {
        self.0.iter().copied()
    }

    /// Comma separated kinds, for log fields
    pub fn to_label(&self) -> String {
        self.0.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(",")
    }
}

impl FromIterator<SensorKind> for Corroboration {
    fn from_iter<I: IntoIterator<Item = SensorKind>>(iter: I) -> Self {
        let mut c = Corroboration::new();
        for kind in iter {
            c.insert(kind);
        }
        c
    }
}

/// GPS position attached to an event
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
}

/// A confirmed pothole incident
///
/// Only constructed through [`PotholeEvent::confirm`], which enforces the
/// corroboration rule. The id is stable for the lifetime of the event and is
/// reused verbatim on every upload retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PotholeEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    pub confidence: f64,
    pub corroboration: Corroboration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<PathBuf>,
    pub status: EventStatus,
}

impl PotholeEvent {
    /// Build an event if the evidence satisfies the corroboration rule:
    /// two or more distinct kinds, or vision alone at or above `high_confidence`.
    pub fn confirm(
        corroboration: Corroboration,
        confidence: f64,
        high_confidence: f64,
        location: Option<Location>,
        image_ref: Option<PathBuf>,
    ) -> Option<Self> {
        if !Self::is_corroborated(&corroboration, confidence, high_confidence) {
            return None;
        }

        Some(Self {
            id: Uuid::now_v7(),
            timestamp: Utc::now(),
            location,
            confidence,
            corroboration,
            image_ref,
            status: EventStatus::Pending,
        })
    }

    /// Corroboration rule shared by the fusion engine and the constructor
    pub fn is_corroborated(
        corroboration: &Corroboration,
        confidence: f64,
        high_confidence: f64,
    ) -> bool {
        match corroboration.len() {
            0 => false,
            1 => corroboration.contains(SensorKind::Vision) && confidence >= high_confidence,
            _ => true,
        }
    }

    /// Wire body for `POST /api/detections`
    pub fn payload<'a>(&'a self, device_id: &'a str) -> DetectionPayload<'a> {
        DetectionPayload {
            id: self.id,
            device_id,
            timestamp: self.timestamp,
            location: self.location,
            confidence: self.confidence,
            corroboration: &self.corroboration,
        }
    }
}

/// JSON body sent to the backend for one event
#[derive(Debug, Serialize)]
pub struct DetectionPayload<'a> {
    pub id: Uuid,
    pub device_id: &'a str,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    pub confidence: f64,
    pub corroboration: &'a Corroboration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corroboration_dedup_and_order() {
        let mut c = Corroboration::new();
        assert!(c.insert(SensorKind::Vibration));
        assert!(c.insert(SensorKind::Vision));
        assert!(!c.insert(SensorKind::Vibration));
        assert_eq!(c.len(), 2);
        assert_eq!(c.to_label(), "vision,vibration");
    }

    #[test]
    fn test_confirm_requires_two_kinds() {
        let single: Corroboration = [SensorKind::Vibration].into_iter().collect();
        assert!(PotholeEvent::confirm(single, 0.0, 0.9, None, None).is_none());

        let pair: Corroboration = [SensorKind::Vibration, SensorKind::Ultrasonic].into_iter().collect();
        let event = PotholeEvent::confirm(pair, 0.0, 0.9, None, None).unwrap();
        assert_eq!(event.status, EventStatus::Pending);
        assert_eq!(event.confidence, 0.0);
    }

    #[test]
    fn test_confirm_vision_alone_needs_high_confidence() {
        let vision: Corroboration = [SensorKind::Vision].into_iter().collect();
        assert!(PotholeEvent::confirm(vision.clone(), 0.89, 0.9, None, None).is_none());
        assert!(PotholeEvent::confirm(vision, 0.9, 0.9, None, None).is_some());
    }

    #[test]
    fn test_empty_corroboration_never_confirms() {
        assert!(PotholeEvent::confirm(Corroboration::new(), 1.0, 0.9, None, None).is_none());
    }

    #[test]
    fn test_payload_shape() {
        let pair: Corroboration = [SensorKind::Vision, SensorKind::Vibration].into_iter().collect();
        let location = Some(Location { lat: 52.1, lon: 4.3 });
        let event = PotholeEvent::confirm(pair, 0.4, 0.9, location, None).unwrap();

        let json = serde_json::to_value(event.payload("dev-1")).unwrap();
        assert_eq!(json["id"], event.id.to_string());
        assert_eq!(json["device_id"], "dev-1");
        assert_eq!(json["confidence"], 0.4);
        assert_eq!(json["corroboration"], serde_json::json!(["vision", "vibration"]));
        assert_eq!(json["location"]["lat"], 52.1);
    }

    #[test]
    fn test_event_roundtrips_through_json() {
        let pair: Corroboration = [SensorKind::Ultrasonic, SensorKind::Vibration].into_iter().collect();
        let event = PotholeEvent::confirm(pair, 0.0, 0.9, None, Some("frames/a.jpg".into())).unwrap();
        let json = serde_json::to_string(&event).unwrap();
        let back: PotholeEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
