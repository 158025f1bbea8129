//! Domain models - sensor types and the pothole event model
//!
//! This module contains the canonical data types used throughout the system:
//! - `SensorReading` / `Detection` - inputs to the fusion engine
//! - `FusionInput` - the single message type on the fusion channel
//! - `PotholeEvent` - a confirmed incident, owned by the event store until delivered

pub mod event;
pub mod types;
