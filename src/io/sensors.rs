//! Physical sensor boundary
//!
//! Register/protocol access lives behind `SensorSource`; the device only sees
//! timestamped readings polled at the source's own cadence.

use crate::domain::types::{SensorReading, SensorSourceKind, SensorValue};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// A periodically polled sensor (ultrasonic range finder, vibration switch, ...)
pub trait SensorSource: Send {
    fn kind(&self) -> SensorSourceKind;

    fn poll_interval(&self) -> Duration;

    /// Read the sensor once; None when no sample is available this cycle
    fn poll(&mut self) -> Option<SensorReading>;
}

/// Replays a fixed list of values, one per poll, stamped at poll time
pub struct ScriptedSensor {
    kind: SensorSourceKind,
    interval: Duration,
    values: VecDeque<SensorValue>,
}

impl ScriptedSensor {
    pub fn new(
        kind: SensorSourceKind,
        interval: Duration,
        values: impl IntoIterator<Item = SensorValue>,
    ) -> Self {
        Self { kind, interval, values: values.into_iter().collect() }
    }
}

impl SensorSource for ScriptedSensor {
    fn kind(&self) -> SensorSourceKind {
        self.kind
    }

    fn poll_interval(&self) -> Duration {
        self.interval
    }

    fn poll(&mut self) -> Option<SensorReading> {
        let value = self.values.pop_front()?;
        Some(SensorReading { source: self.kind, value, timestamp: Instant::now() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_sensor_drains_in_order() {
        let mut sensor = ScriptedSensor::new(
            SensorSourceKind::Vibration,
            Duration::from_millis(10),
            [SensorValue::Scalar(0.1), SensorValue::Flag(true)],
        );

        assert_eq!(sensor.poll().unwrap().value, SensorValue::Scalar(0.1));
        let second = sensor.poll().unwrap();
        assert_eq!(second.value, SensorValue::Flag(true));
        assert_eq!(second.source, SensorSourceKind::Vibration);
        assert!(sensor.poll().is_none());
    }
}
