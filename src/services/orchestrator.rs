//! Device run loop
//!
//! Lanes:
//! - sensor lanes poll each `SensorSource` and push readings onto the fusion channel
//! - the detector lane captures a frame, runs the detector with a timeout and
//!   pushes the detections onto the same channel
//! - the fusion loop is the only owner of the `FusionEngine`; confirmed events
//!   go straight into the `EventStore`
//! - the delivery worker drains the store under a restarting supervisor
//!
//! Producers never block: a full channel drops the input and counts it.

use crate::domain::types::FusionInput;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::backend::Backend;
use crate::io::detector::{detect_with_timeout, Detector, FrameSource};
use crate::io::sensors::SensorSource;
use crate::io::store::EventStore;
use crate::services::auth::AuthSession;
use crate::services::delivery::{DeliveryWorker, WorkerExit};
use crate::services::fusion::{Confirmed, FusionEngine};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the fusion input channel
pub const FUSION_CHANNEL_CAPACITY: usize = 1024;

/// How often the fusion loop advances time with no input
const FUSION_TICK: Duration = Duration::from_millis(100);

const RESTART_BACKOFF_MIN: Duration = Duration::from_secs(1);
const RESTART_BACKOFF_MAX: Duration = Duration::from_secs(60);

/// A worker that stayed up this long restarts from the minimum backoff
const RESTART_STABLE_AFTER: Duration = Duration::from_secs(300);

/// Live lane states shared with the status endpoint
pub struct StatusBoard {
    running: AtomicBool,
    fusion_state: Mutex<&'static str>,
    delivery_state: Mutex<&'static str>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            fusion_state: Mutex::new("idle"),
            delivery_state: Mutex::new("starting"),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn fusion_state(&self) -> &'static str {
        *self.fusion_state.lock()
    }

    pub fn delivery_state(&self) -> &'static str {
        *self.delivery_state.lock()
    }

    fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Relaxed);
    }

    fn set_fusion_state(&self, state: &'static str) {
        *self.fusion_state.lock() = state;
    }

    fn set_delivery_state(&self, state: &'static str) {
        *self.delivery_state.lock() = state;
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time device status, served as JSON on `/status`
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub device_id: String,
    pub version: &'static str,
    pub running: bool,
    pub fusion_state: &'static str,
    pub delivery_state: &'static str,
    pub auth_state: &'static str,
    pub pending: usize,
    pub dead_letter: usize,
    pub overflow: usize,
    pub events_confirmed: u64,
    pub uploads_delivered: u64,
    pub readings_dropped: u64,
}

/// Everything the status endpoint needs to build a `DeviceStatus`
#[derive(Clone)]
pub struct StatusSources {
    pub device_id: String,
    pub board: Arc<StatusBoard>,
    pub store: Arc<EventStore>,
    pub auth: Arc<AuthSession>,
    pub metrics: Arc<Metrics>,
}

impl StatusSources {
    pub fn snapshot(&self) -> DeviceStatus {
        DeviceStatus {
            device_id: self.device_id.clone(),
            version: env!("CARGO_PKG_VERSION"),
            running: self.board.is_running(),
            fusion_state: self.board.fusion_state(),
            delivery_state: self.board.delivery_state(),
            auth_state: self.auth.status().as_str(),
            pending: self.store.pending_len(),
            dead_letter: self.store.dead_letter_len(),
            overflow: self.store.overflow_len(),
            events_confirmed: self.metrics.events_confirmed(),
            uploads_delivered: self.metrics.uploads_delivered(),
            readings_dropped: self.metrics.readings_dropped(),
        }
    }
}

/// Push an input without waiting; returns false once the channel is closed
fn forward(tx: &mpsc::Sender<FusionInput>, input: FusionInput, metrics: &Metrics) -> bool {
    match tx.try_send(input) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            metrics.record_input_channel_full();
            debug!("fusion_channel_full_input_dropped");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

/// Single evaluation loop: the only place the engine is touched
pub async fn run_fusion_loop(
    mut engine: FusionEngine,
    mut rx: mpsc::Receiver<FusionInput>,
    store: Arc<EventStore>,
    board: Arc<StatusBoard>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("fusion_loop_started");
    let mut tick = tokio::time::interval(FUSION_TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let handle = |engine: &mut FusionEngine, input: FusionInput| {
        if let Some(Confirmed { event, frame }) = engine.evaluate(input) {
            store.enqueue_with_frame(event, frame);
        }
    };

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            input = rx.recv() => match input {
                Some(input) => handle(&mut engine, input),
                None => break,
            },
            _ = tick.tick() => engine.tick(Instant::now()),
        }
        board.set_fusion_state(engine.state_name());
    }

    // No new windows; whatever producers already queued is still evaluated
    engine.stop();
    rx.close();
    let mut drained = 0usize;
    while let Ok(input) = rx.try_recv() {
        handle(&mut engine, input);
        drained += 1;
    }
    board.set_fusion_state("stopped");
    info!(drained = %drained, dropped_inputs = %engine.dropped(), "fusion_loop_stopped");
}

/// Poll one sensor at its own cadence
pub async fn run_sensor_lane(
    mut source: Box<dyn SensorSource>,
    tx: mpsc::Sender<FusionInput>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let kind = source.kind().kind();
    info!(sensor = %kind, interval_ms = %source.poll_interval().as_millis(), "sensor_lane_started");
    let mut interval = tokio::time::interval(source.poll_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                let Some(reading) = source.poll() else { continue };
                if !forward(&tx, FusionInput::Reading(reading), &metrics) {
                    break;
                }
            }
        }
    }
    info!(sensor = %kind, "sensor_lane_stopped");
}

/// Capture, detect with a timeout, forward detections
pub async fn run_detector_lane(
    mut frames: Box<dyn FrameSource>,
    detector: Arc<dyn Detector>,
    tx: mpsc::Sender<FusionInput>,
    metrics: Arc<Metrics>,
    interval: Duration,
    timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        interval_ms = %interval.as_millis(),
        timeout_ms = %timeout.as_millis(),
        "detector_lane_started"
    );
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let Some(frame) = frames.capture() else { continue };
                let captured_at = frame.captured_at;
                let image = frame.image();

                match detect_with_timeout(detector.clone(), frame, timeout).await {
                    Ok(detections) => {
                        metrics.record_detector_run(false);
                        if detections.is_empty() {
                            continue;
                        }
                        let input = FusionInput::Detections {
                            frame_timestamp: captured_at,
                            image,
                            detections,
                        };
                        if !forward(&tx, input, &metrics) {
                            break;
                        }
                    }
                    Err(e) => {
                        metrics.record_detector_run(true);
                        warn!(error = %e, "detector_cycle_failed");
                    }
                }
            }
        }
    }
    info!("detector_lane_stopped");
}

/// Keep the delivery worker alive: restart with exponential backoff after a
/// panic or unexpected exit, stop for good on shutdown or lockout
pub async fn supervise<F, Fut>(
    mut spawn_worker: F,
    metrics: Arc<Metrics>,
    board: Arc<StatusBoard>,
    mut shutdown: watch::Receiver<bool>,
) -> WorkerExit
where
    F: FnMut() -> Fut,
    Fut: Future<Output = WorkerExit> + Send + 'static,
{
    let mut backoff = RESTART_BACKOFF_MIN;

    loop {
        board.set_delivery_state("running");
        let started = Instant::now();

        match tokio::spawn(spawn_worker()).await {
            Ok(WorkerExit::Shutdown) if *shutdown.borrow() => {
                board.set_delivery_state("stopped");
                return WorkerExit::Shutdown;
            }
            Ok(WorkerExit::Shutdown) => {
                warn!("delivery_worker_exited_unexpectedly");
            }
            Ok(WorkerExit::LockedOut) => {
                board.set_delivery_state("locked_out");
                log_delivery_halted();
                return WorkerExit::LockedOut;
            }
            Err(e) => {
                error!(panicked = %e.is_panic(), error = %e, "delivery_worker_crashed");
            }
        }

        if started.elapsed() >= RESTART_STABLE_AFTER {
            backoff = RESTART_BACKOFF_MIN;
        }
        metrics.record_worker_restart();
        board.set_delivery_state("restarting");
        warn!(restart_in_ms = %backoff.as_millis(), "delivery_worker_restarting");

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => {
                board.set_delivery_state("stopped");
                return WorkerExit::Shutdown;
            }
        }
        backoff = (backoff * 2).min(RESTART_BACKOFF_MAX);
    }
}

/// Operator-facing halt of delivery (cold path)
#[cold]
fn log_delivery_halted() {
    error!(
        "delivery_halted: backend rejected device credentials; detection continues and events stay queued until credentials are fixed"
    );
}

/// Wires sources, fusion, store and delivery together
pub struct Orchestrator {
    config: Config,
    metrics: Arc<Metrics>,
    store: Arc<EventStore>,
    auth: Arc<AuthSession>,
    backend: Arc<dyn Backend>,
    board: Arc<StatusBoard>,
    input_tx: mpsc::Sender<FusionInput>,
    input_rx: mpsc::Receiver<FusionInput>,
    sensors: Vec<Box<dyn SensorSource>>,
    camera: Option<(Box<dyn FrameSource>, Arc<dyn Detector>)>,
}

impl Orchestrator {
    /// Open the store and build the auth session; fails only if the store
    /// directory cannot be opened
    pub fn new(
        config: Config,
        backend: Arc<dyn Backend>,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        let store = Arc::new(EventStore::open(&config, metrics.clone())?);
        let auth = Arc::new(AuthSession::new(&config, backend.clone()));
        let (input_tx, input_rx) = mpsc::channel(FUSION_CHANNEL_CAPACITY);

        Ok(Self {
            config,
            metrics,
            store,
            auth,
            backend,
            board: Arc::new(StatusBoard::new()),
            input_tx,
            input_rx,
            sensors: Vec::new(),
            camera: None,
        })
    }

    pub fn add_sensor(&mut self, source: Box<dyn SensorSource>) {
        self.sensors.push(source);
    }

    pub fn set_camera(&mut self, frames: Box<dyn FrameSource>, detector: Arc<dyn Detector>) {
        self.camera = Some((frames, detector));
    }

    /// Extra producer handle (replay, location fixes)
    pub fn input_sender(&self) -> mpsc::Sender<FusionInput> {
        self.input_tx.clone()
    }

    pub fn store(&self) -> Arc<EventStore> {
        self.store.clone()
    }

    pub fn auth(&self) -> Arc<AuthSession> {
        self.auth.clone()
    }

    pub fn status_sources(&self) -> StatusSources {
        StatusSources {
            device_id: self.config.device_id().to_string(),
            board: self.board.clone(),
            store: self.store.clone(),
            auth: self.auth.clone(),
            metrics: self.metrics.clone(),
        }
    }

    /// Run every lane until `shutdown` flips to true, then stop them in order:
    /// producers, fusion (drains its queue), delivery (finishes the current
    /// attempt), and finally flush the overflow buffer to disk
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let Self {
            config,
            metrics,
            store,
            auth,
            backend,
            board,
            input_tx,
            input_rx,
            sensors,
            camera,
        } = self;

        board.set_running(true);
        let mut producers: Vec<JoinHandle<()>> = Vec::new();

        for source in sensors {
            producers.push(tokio::spawn(run_sensor_lane(
                source,
                input_tx.clone(),
                metrics.clone(),
                shutdown.clone(),
            )));
        }
        if let Some((frames, detector)) = camera {
            producers.push(tokio::spawn(run_detector_lane(
                frames,
                detector,
                input_tx.clone(),
                metrics.clone(),
                config.detector_interval(),
                config.detector_timeout(),
                shutdown.clone(),
            )));
        }
        drop(input_tx);

        let engine = FusionEngine::new(&config, metrics.clone());
        let fusion = tokio::spawn(run_fusion_loop(
            engine,
            input_rx,
            store.clone(),
            board.clone(),
            shutdown.clone(),
        ));

        let worker = DeliveryWorker::new(
            &config,
            store.clone(),
            auth,
            backend,
            metrics.clone(),
            shutdown.clone(),
        );
        let delivery = tokio::spawn(supervise(
            move || worker.clone().run(),
            metrics.clone(),
            board.clone(),
            shutdown.clone(),
        ));

        info!(
            sensors = %producers.len(),
            pending = %store.pending_len(),
            dead_letter = %store.dead_letter_len(),
            "orchestrator_started"
        );

        // A lockout ends delivery early; detection keeps running until shutdown
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        info!("orchestrator_shutting_down");

        for producer in producers {
            let _ = producer.await;
        }
        if let Err(e) = fusion.await {
            error!(error = %e, "fusion_loop_join_failed");
        }
        match delivery.await {
            Ok(exit) => debug!(exit = ?exit, "delivery_supervisor_stopped"),
            Err(e) => error!(error = %e, "delivery_supervisor_join_failed"),
        }

        let unflushed = store.flush_overflow();
        if unflushed > 0 {
            error!(events = %unflushed, "shutdown_overflow_not_persisted: events will be lost");
        }
        board.set_running(false);
        info!(
            pending = %store.pending_len(),
            dead_letter = %store.dead_letter_len(),
            "orchestrator_stopped"
        );
    }
}
