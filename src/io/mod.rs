//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `backend` - HTTP client for the detection backend
//! - `store` - Durable store-and-forward queue for confirmed events
//! - `sensors` - Polled sensor boundary
//! - `detector` - Camera and vision model boundary
//! - `replay` - JSONL scripted input for bench testing
//! - `prometheus` - Prometheus metrics and status HTTP endpoint

pub mod backend;
pub mod detector;
pub mod prometheus;
pub mod replay;
pub mod sensors;
pub mod store;

// Re-export commonly used types
pub use backend::{Backend, BackendError, Credentials, HttpBackend, TokenGrant};
pub use detector::{Detector, FrameSource};
pub use sensors::SensorSource;
pub use store::{EventStore, FailOutcome, StoreError, StoredRecord};
