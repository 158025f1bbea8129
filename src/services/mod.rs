//! Services - business logic and state management
//!
//! This module contains the core business logic services:
//! - `fusion` - Sensor fusion state machine producing confirmed events
//! - `auth` - Bearer token lifecycle with single-flight login/refresh
//! - `delivery` - Background worker draining the event store
//! - `orchestrator` - Lane wiring, supervision and shutdown

pub mod auth;
pub mod delivery;
pub mod fusion;
pub mod orchestrator;

// Re-export commonly used types
pub use auth::{AuthError, AuthSession, AuthStatus};
pub use delivery::{backoff_delay, DeliveryWorker, WorkerExit};
pub use fusion::FusionEngine;
pub use orchestrator::Orchestrator;
