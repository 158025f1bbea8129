//! Sensor fusion state machine
//!
//! Turns asynchronous vibration, ultrasonic and vision signals into confirmed
//! pothole events. One incident window collects evidence at a time:
//!
//! - Idle: a vibration spike, an ultrasonic drop or a vision detection at or
//!   above the high-confidence bar opens a window.
//! - Collecting: evidence is kept per sensor kind (strongest wins) until the
//!   corroboration rule holds or the window times out.
//! - Cooldown: after a confirmation no window may open until the cooldown ends.
//!
//! The engine is driven purely by input timestamps so it can be tested with
//! synthetic sequences; it never touches the network.

use crate::domain::event::{Corroboration, Location, PotholeEvent};
use crate::domain::types::{
    Detection, FrameImage, FusionInput, SensorKind, SensorReading, SensorSourceKind, SensorValue,
};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Policy parameters, copied out of the config at construction
#[derive(Debug, Clone)]
pub struct FusionParams {
    pub window_timeout: Duration,
    pub cooldown: Duration,
    pub model_confidence_threshold: f64,
    pub vision_high_confidence: f64,
    pub vibration_threshold: f64,
    pub ultrasonic_drop_cm: f64,
    pub ultrasonic_baseline_alpha: f64,
    pub detection_label: String,
}

impl FusionParams {
    pub fn from_config(config: &Config) -> Self {
        Self {
            window_timeout: config.window_timeout(),
            cooldown: config.cooldown(),
            model_confidence_threshold: config.model_confidence_threshold(),
            vision_high_confidence: config.vision_high_confidence(),
            vibration_threshold: config.vibration_threshold(),
            ultrasonic_drop_cm: config.ultrasonic_drop_cm(),
            ultrasonic_baseline_alpha: config.ultrasonic_baseline_alpha(),
            detection_label: config.detection_label().to_string(),
        }
    }
}

/// Strongest signal seen for one kind inside a window
#[derive(Debug, Clone, Copy)]
struct Evidence {
    strength: f64,
}

#[derive(Debug)]
struct Window {
    opened_at: Instant,
    evidence: [Option<Evidence>; 3],
    /// Frame of the strongest vision detection
    image: Option<FrameImage>,
}

impl Window {
    fn open(at: Instant) -> Self {
        Self { opened_at: at, evidence: [None; 3], image: None }
    }

    /// Keep only the strongest signal per kind
    fn add(&mut self, kind: SensorKind, strength: f64, image: Option<FrameImage>) {
        let slot = &mut self.evidence[kind.index()];
        let stronger = slot.map_or(true, |e| strength > e.strength);
        if stronger {
            *slot = Some(Evidence { strength });
            if kind == SensorKind::Vision {
                self.image = image;
            }
        }
    }

    fn corroboration(&self) -> Corroboration {
        SensorKind::ALL
            .into_iter()
            .filter(|kind| self.evidence[kind.index()].is_some())
            .collect()
    }

    fn vision_confidence(&self) -> f64 {
        self.evidence[SensorKind::Vision.index()].map_or(0.0, |e| e.strength)
    }
}

#[derive(Debug)]
enum EngineState {
    Idle,
    Collecting(Window),
    Cooldown { until: Instant },
}

/// A confirmed incident plus the in-memory frame still to be written for it
#[derive(Debug)]
pub struct Confirmed {
    pub event: PotholeEvent,
    pub frame: Option<Bytes>,
}

/// Reason an input was discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    OutOfOrder,
}

impl DropReason {
    fn as_str(&self) -> &'static str {
        match self {
            DropReason::Malformed => "malformed",
            DropReason::OutOfOrder => "out_of_order",
        }
    }
}

/// The fusion state machine
pub struct FusionEngine {
    params: FusionParams,
    state: EngineState,
    /// Latest accepted timestamp per kind, for out-of-order detection
    last_accepted: [Option<Instant>; 3],
    /// Latest timestamp seen on any input; drives window and cooldown expiry
    clock: Option<Instant>,
    ultrasonic_baseline: Option<f64>,
    last_location: Option<Location>,
    accepting: bool,
    dropped: u64,
    metrics: Arc<Metrics>,
}

impl FusionEngine {
    pub fn new(config: &Config, metrics: Arc<Metrics>) -> Self {
        Self::with_params(FusionParams::from_config(config), metrics)
    }

    pub fn with_params(params: FusionParams, metrics: Arc<Metrics>) -> Self {
        Self {
            params,
            state: EngineState::Idle,
            last_accepted: [None; 3],
            clock: None,
            ultrasonic_baseline: None,
            last_location: None,
            accepting: true,
            dropped: 0,
            metrics,
        }
    }

    /// Feed one input; returns the event if it confirmed an incident
    pub fn evaluate(&mut self, input: FusionInput) -> Option<Confirmed> {
        match input {
            FusionInput::Reading(reading) => self.evaluate_reading(reading),
            FusionInput::Detections { frame_timestamp, image, detections } => {
                self.evaluate_detections(frame_timestamp, image, &detections)
            }
            FusionInput::Location { lat, lon } => {
                if lat.is_finite() && lon.is_finite() {
                    self.last_location = Some(Location { lat, lon });
                } else {
                    self.drop_input("location", DropReason::Malformed);
                }
                None
            }
        }
    }

    /// Advance time without input so stale windows and cooldowns expire
    pub fn tick(&mut self, now: Instant) {
        self.advance(now);
    }

    /// Stop opening new windows; an open window may still confirm
    pub fn stop(&mut self) {
        self.accepting = false;
        info!(state = %self.state_name(), "fusion_engine_stopped");
    }

    pub fn state_name(&self) -> &'static str {
        match self.state {
            EngineState::Idle => "idle",
            EngineState::Collecting(_) => "collecting",
            EngineState::Cooldown { .. } => "cooldown",
        }
    }

    /// Inputs discarded since start
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn evaluate_reading(&mut self, reading: SensorReading) -> Option<Confirmed> {
        let kind = reading.source.kind();
        if let Err(reason) = self.accept_timestamp(kind, reading.timestamp) {
            self.drop_input(kind.as_str(), reason);
            return None;
        }

        let strength = match (reading.source, reading.value) {
            (SensorSourceKind::Vibration, SensorValue::Scalar(v)) if v.is_finite() => {
                (v >= self.params.vibration_threshold).then_some(v)
            }
            (SensorSourceKind::Vibration, SensorValue::Flag(hit)) => hit.then_some(1.0),
            (SensorSourceKind::Ultrasonic, SensorValue::Scalar(d)) if d.is_finite() && d >= 0.0 => {
                self.ultrasonic_drop(d)
            }
            _ => {
                self.drop_input(kind.as_str(), DropReason::Malformed);
                return None;
            }
        };

        self.last_accepted[kind.index()] = Some(reading.timestamp);
        self.metrics.record_reading_accepted();
        self.advance(reading.timestamp);

        let strength = strength?;
        self.on_signal(kind, strength, reading.timestamp, None)
    }

    fn evaluate_detections(
        &mut self,
        frame_timestamp: Instant,
        image: Option<FrameImage>,
        detections: &[Detection],
    ) -> Option<Confirmed> {
        let kind = SensorKind::Vision;
        if let Err(reason) = self.accept_timestamp(kind, frame_timestamp) {
            self.drop_input(kind.as_str(), reason);
            return None;
        }

        let mut best: Option<f64> = None;
        for detection in detections {
            if !detection.confidence.is_finite() || !(0.0..=1.0).contains(&detection.confidence) {
                self.drop_input(kind.as_str(), DropReason::Malformed);
                continue;
            }
            if !detection.class_label.eq_ignore_ascii_case(&self.params.detection_label)
                || detection.confidence < self.params.model_confidence_threshold
            {
                continue;
            }
            best = Some(best.map_or(detection.confidence, |b: f64| b.max(detection.confidence)));
        }

        self.last_accepted[kind.index()] = Some(frame_timestamp);
        self.metrics.record_reading_accepted();
        self.advance(frame_timestamp);

        let confidence = best?;
        self.on_signal(kind, confidence, frame_timestamp, image)
    }

    /// Returns the drop depth if the distance jumped above the road baseline
    fn ultrasonic_drop(&mut self, distance_cm: f64) -> Option<f64> {
        let Some(baseline) = self.ultrasonic_baseline else {
            self.ultrasonic_baseline = Some(distance_cm);
            return None;
        };

        let delta = distance_cm - baseline;
        if delta >= self.params.ultrasonic_drop_cm {
            // Pothole readings stay out of the baseline
            return Some(delta);
        }

        let alpha = self.params.ultrasonic_baseline_alpha;
        self.ultrasonic_baseline = Some(baseline + alpha * (distance_cm - baseline));
        None
    }

    fn accept_timestamp(&self, kind: SensorKind, ts: Instant) -> Result<(), DropReason> {
        match self.last_accepted[kind.index()] {
            Some(last) if ts < last => Err(DropReason::OutOfOrder),
            _ => Ok(()),
        }
    }

    fn drop_input(&mut self, source: &'static str, reason: DropReason) {
        self.dropped += 1;
        self.metrics.record_reading_dropped();
        debug!(source = %source, reason = %reason.as_str(), dropped = %self.dropped, "fusion_input_dropped");
    }

    /// Expire the window or the cooldown relative to the newest timestamp seen
    fn advance(&mut self, ts: Instant) {
        let now = match self.clock {
            Some(clock) if clock > ts => clock,
            _ => ts,
        };
        self.clock = Some(now);

        match &self.state {
            EngineState::Collecting(window)
                if now.duration_since(window.opened_at) > self.params.window_timeout =>
            {
                debug!(
                    kinds = %window.corroboration().to_label(),
                    "fusion_window_expired"
                );
                self.metrics.record_window_expired();
                self.state = EngineState::Idle;
            }
            EngineState::Cooldown { until } if now >= *until => {
                debug!("fusion_cooldown_ended");
                self.state = EngineState::Idle;
            }
            _ => {}
        }
    }

    fn on_signal(
        &mut self,
        kind: SensorKind,
        strength: f64,
        ts: Instant,
        image: Option<FrameImage>,
    ) -> Option<Confirmed> {
        match &mut self.state {
            EngineState::Cooldown { .. } => {
                debug!(kind = %kind, strength = %strength, "fusion_signal_in_cooldown");
                None
            }
            EngineState::Idle => {
                let triggers = kind != SensorKind::Vision
                    || strength >= self.params.vision_high_confidence;
                if !triggers || !self.accepting {
                    return None;
                }
                let mut window = Window::open(ts);
                window.add(kind, strength, image);
                self.metrics.record_window_opened();
                debug!(kind = %kind, strength = %strength, "fusion_window_opened");
                self.state = EngineState::Collecting(window);
                self.try_confirm(ts)
            }
            EngineState::Collecting(window) => {
                window.add(kind, strength, image);
                self.try_confirm(ts)
            }
        }
    }

    fn try_confirm(&mut self, ts: Instant) -> Option<Confirmed> {
        let EngineState::Collecting(window) = &mut self.state else {
            return None;
        };

        let corroboration = window.corroboration();
        let confidence = window.vision_confidence();
        if !PotholeEvent::is_corroborated(&corroboration, confidence, self.params.vision_high_confidence)
        {
            return None;
        }

        let window_ms = ts.saturating_duration_since(window.opened_at).as_millis() as u64;
        let (image_ref, frame) = match window.image.take() {
            Some(FrameImage::Path(path)) => (Some(path), None),
            Some(FrameImage::Encoded(data)) => (None, Some(data)),
            None => (None, None),
        };
        let event = PotholeEvent::confirm(
            corroboration,
            confidence,
            self.params.vision_high_confidence,
            self.last_location,
            image_ref,
        )?;

        info!(
            event_id = %event.id,
            kinds = %event.corroboration.to_label(),
            confidence = %event.confidence,
            window_ms = %window_ms,
            has_location = %event.location.is_some(),
            "pothole_confirmed"
        );

        self.metrics.record_event_confirmed();
        self.state = EngineState::Cooldown { until: ts + self.params.cooldown };
        Some(Confirmed { event, frame })
    }
}
