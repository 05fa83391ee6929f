//! Output unit: the per-destination state machine and worker task.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::chunk::AudioChunk;
use crate::config::{OutputDestination, OutputId};
use crate::error::{EngineError, FailureKind};
use crate::event::{EngineEvent, EventCallback};
use crate::output::stats::{OutputStats, UnitStats};
use crate::output::{OutputTransport, UnitState};
use crate::retry::{RetryDecision, RetryPolicy};

/// Throughput window for bitrate estimation.
const BITRATE_WINDOW: Duration = Duration::from_secs(1);

/// Commands sent from the unit handle to its worker task.
enum UnitCommand {
    Start,
    Stop,
    Shutdown,
}

/// State shared between the unit handle and its worker.
struct UnitShared {
    state: AtomicU8,
    enabled: AtomicBool,
    stats: UnitStats,
    last_error: Mutex<Option<String>>,
    event_callback: Option<EventCallback>,
}

impl UnitShared {
    fn state(&self) -> UnitState {
        UnitState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Swaps in the new state and returns the previous one.
    fn swap_state(&self, to: UnitState) -> UnitState {
        UnitState::from_u8(self.state.swap(to.as_u8(), Ordering::SeqCst))
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_error(&self, message: String) {
        *self.last_error.lock() = Some(message);
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(ref callback) = self.event_callback {
            callback(event);
        }
    }
}

/// Handle to one destination's runtime state machine.
///
/// The unit owns its destination's connection lifecycle and statistics.
/// Commands and chunks flow to a dedicated worker task over channels; the
/// worker is the only task that touches the transport, so writes within one
/// unit are strictly ordered.
pub(crate) struct OutputUnit {
    id: OutputId,
    name: String,
    kind: &'static str,
    shared: Arc<UnitShared>,
    chunk_tx: mpsc::Sender<AudioChunk>,
    cmd_tx: mpsc::Sender<UnitCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl OutputUnit {
    /// Creates the unit in `idle` and spawns its worker task.
    pub fn spawn(
        destination: &OutputDestination,
        transport: Box<dyn OutputTransport>,
        queue_capacity: usize,
        policy: RetryPolicy,
        event_callback: Option<EventCallback>,
    ) -> Self {
        let (chunk_tx, chunk_rx) = mpsc::channel(queue_capacity.max(1));
        let (cmd_tx, cmd_rx) = mpsc::channel(4);

        let shared = Arc::new(UnitShared {
            state: AtomicU8::new(UnitState::Idle.as_u8()),
            enabled: AtomicBool::new(destination.enabled),
            stats: UnitStats::new(),
            last_error: Mutex::new(None),
            event_callback,
        });

        let worker = UnitWorker {
            id: destination.id,
            name: destination.name.clone(),
            transport,
            shared: Arc::clone(&shared),
            chunk_rx,
            cmd_rx,
            policy,
            window_start: Instant::now(),
            window_bytes: 0,
        };
        let handle = tokio::spawn(worker.run());

        Self {
            id: destination.id,
            name: destination.name.clone(),
            kind: destination.kind.label(),
            shared,
            chunk_tx,
            cmd_tx,
            worker: Mutex::new(Some(handle)),
        }
    }

    pub fn id(&self) -> OutputId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn state(&self) -> UnitState {
        self.shared.state()
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.is_enabled()
    }

    /// Enables or disables the destination.
    ///
    /// Disabling never interrupts an active stream; it refuses future
    /// starts and makes a pending reconnect loop give up at its next
    /// decision point.
    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    pub fn stats(&self) -> OutputStats {
        self.shared.stats.snapshot()
    }

    /// Requests a connection attempt.
    ///
    /// Valid only from `idle` or `error`; the outcome (streaming,
    /// reconnecting, error) is observable via state/events.
    pub async fn start(&self) -> Result<(), EngineError> {
        if !self.shared.is_enabled() {
            return Err(EngineError::OutputDisabled { id: self.id });
        }
        match self.state() {
            UnitState::Idle | UnitState::Error => {}
            state => {
                return Err(EngineError::InvalidState {
                    id: self.id,
                    operation: "start",
                    state,
                })
            }
        }
        self.cmd_tx
            .send(UnitCommand::Start)
            .await
            .map_err(|_| EngineError::WorkerGone { id: self.id })
    }

    /// Requests a stop.
    ///
    /// A no-op when already `idle`. Cancels any pending reconnect.
    pub async fn stop(&self) -> Result<(), EngineError> {
        if self.state() == UnitState::Idle {
            return Ok(());
        }
        self.cmd_tx
            .send(UnitCommand::Stop)
            .await
            .map_err(|_| EngineError::WorkerGone { id: self.id })
    }

    /// Offers one chunk to this destination without blocking.
    ///
    /// Chunks are queued only while `streaming`; a full queue or an active
    /// reconnect drops the chunk and counts it. Returns `true` if the
    /// chunk was accepted.
    pub fn feed(&self, chunk: AudioChunk) -> bool {
        match self.state() {
            UnitState::Streaming => match self.chunk_tx.try_send(chunk) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.shared.stats.inc_dropped();
                    self.shared
                        .emit(EngineEvent::ChunkDropped { output_id: self.id });
                    warn!(output = %self.name, "queue full, chunk dropped");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!(output = %self.name, "worker closed, chunk dropped");
                    false
                }
            },
            UnitState::Reconnecting => {
                self.shared.stats.inc_dropped();
                self.shared
                    .emit(EngineEvent::ChunkDropped { output_id: self.id });
                false
            }
            _ => false,
        }
    }

    /// Stops the worker task and waits for it to finish.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(UnitCommand::Shutdown).await;
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(output = %self.name, error = ?e, "worker task panicked");
            }
        }
        debug!(output = %self.name, "unit shutdown complete");
    }
}

/// What the worker does next. `Connect`/`Backoff` carry the 1-based attempt
/// number and whether this connect sequence began with a fresh `start()`
/// (which resets session stats) or a mid-stream drop (which keeps them).
enum Mode {
    Idle,
    Connect { attempt: u32, fresh: bool },
    Stream,
    Backoff { attempt: u32, delay: Duration, fresh: bool },
    Fault,
    Halt,
}

/// Worker task owning the transport for one destination.
struct UnitWorker {
    id: OutputId,
    name: String,
    transport: Box<dyn OutputTransport>,
    shared: Arc<UnitShared>,
    chunk_rx: mpsc::Receiver<AudioChunk>,
    cmd_rx: mpsc::Receiver<UnitCommand>,
    policy: RetryPolicy,
    window_start: Instant,
    window_bytes: u64,
}

impl UnitWorker {
    async fn run(mut self) {
        debug!(output = %self.name, "unit worker started");

        let mut mode = Mode::Idle;
        loop {
            mode = match mode {
                Mode::Idle | Mode::Fault => self.wait_for_command().await,
                Mode::Connect { attempt, fresh } => self.connect(attempt, fresh).await,
                Mode::Stream => self.stream().await,
                Mode::Backoff {
                    attempt,
                    delay,
                    fresh,
                } => self.backoff(attempt, delay, fresh).await,
                Mode::Halt => break,
            };
        }

        if let Err(e) = self.transport.close().await {
            warn!(output = %self.name, error = %e, "close failed on shutdown");
        }
        if !matches!(self.shared.state(), UnitState::Idle | UnitState::Error) {
            self.shared.stats.record_stop();
            self.transition(UnitState::Idle);
        }
        debug!(output = %self.name, "unit worker stopped");
    }

    /// Parks in `idle` or `error` until a command arrives. Chunks arriving
    /// meanwhile are discarded.
    async fn wait_for_command(&mut self) -> Mode {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(UnitCommand::Start) => {
                        return Mode::Connect { attempt: 1, fresh: true };
                    }
                    Some(UnitCommand::Stop) => {
                        // stop() from error returns the unit to idle
                        if self.shared.state() != UnitState::Idle {
                            self.transition(UnitState::Idle);
                        }
                    }
                    Some(UnitCommand::Shutdown) | None => return Mode::Halt,
                },
                chunk = self.chunk_rx.recv() => {
                    if chunk.is_none() {
                        return Mode::Halt;
                    }
                }
            }
        }
    }

    /// Performs one connect attempt and decides what happens next.
    async fn connect(&mut self, attempt: u32, fresh: bool) -> Mode {
        self.transition(UnitState::Connecting);
        debug!(output = %self.name, attempt, "connecting");

        match self.transport.connect().await {
            Ok(()) => {
                if fresh {
                    self.shared.stats.record_session_start();
                } else {
                    self.shared.stats.record_reconnected();
                }
                // Freshness over completeness: anything queued while we
                // were away is stale.
                while self.chunk_rx.try_recv().is_ok() {}
                self.window_start = Instant::now();
                self.window_bytes = 0;
                self.transition(UnitState::Streaming);
                info!(output = %self.name, attempt, "streaming");
                Mode::Stream
            }
            Err(e) => {
                warn!(output = %self.name, attempt, error = %e, "connect failed");
                self.shared.set_error(e.to_string());
                self.after_failure(attempt, e.kind(), fresh)
            }
        }
    }

    /// Streams chunks to the transport until a command or a write failure.
    async fn stream(&mut self) -> Mode {
        loop {
            self.shared.stats.set_buffer_level(self.chunk_rx.len());
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(UnitCommand::Stop) => {
                        if let Err(e) = self.transport.close().await {
                            warn!(output = %self.name, error = %e, "close failed");
                        }
                        self.shared.stats.record_stop();
                        self.transition(UnitState::Idle);
                        info!(output = %self.name, "stopped");
                        return Mode::Idle;
                    }
                    Some(UnitCommand::Start) => {
                        warn!(output = %self.name, "start ignored, already streaming");
                    }
                    Some(UnitCommand::Shutdown) | None => return Mode::Halt,
                },
                chunk = self.chunk_rx.recv() => {
                    let Some(chunk) = chunk else { return Mode::Halt };
                    if let Some(mode) = self.write_chunk(&chunk).await {
                        return mode;
                    }
                }
            }
        }
    }

    /// Writes one chunk; returns the next mode on failure.
    async fn write_chunk(&mut self, chunk: &AudioChunk) -> Option<Mode> {
        match self.transport.write(chunk).await {
            Ok(()) => {
                let bytes = chunk.byte_len();
                self.shared.stats.add_bytes(bytes);
                self.update_bitrate(bytes);
                trace!(output = %self.name, bytes, ts = ?chunk.timestamp, "chunk written");
                None
            }
            Err(e) => {
                warn!(output = %self.name, error = %e, "write failed");
                self.shared.stats.inc_reconnects();
                self.shared.set_error(e.to_string());
                if let Err(close_err) = self.transport.close().await {
                    debug!(output = %self.name, error = %close_err, "close after write failure");
                }
                Some(self.after_failure(1, e.kind(), false))
            }
        }
    }

    /// Waits out the backoff delay. A stop command cancels the pending
    /// reconnect; chunks arriving meanwhile are dropped and counted.
    async fn backoff(&mut self, attempt: u32, delay: Duration, fresh: bool) -> Mode {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => {
                    if !self.shared.is_enabled() {
                        self.shared.stats.record_stop();
                        self.transition(UnitState::Idle);
                        info!(output = %self.name, "disabled, reconnect abandoned");
                        return Mode::Idle;
                    }
                    return Mode::Connect { attempt, fresh };
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(UnitCommand::Stop) => {
                        self.shared.stats.record_stop();
                        self.transition(UnitState::Idle);
                        info!(output = %self.name, "stopped, pending reconnect cancelled");
                        return Mode::Idle;
                    }
                    Some(UnitCommand::Start) => {
                        warn!(output = %self.name, "start ignored, reconnect in progress");
                    }
                    Some(UnitCommand::Shutdown) | None => return Mode::Halt,
                },
                chunk = self.chunk_rx.recv() => {
                    match chunk {
                        Some(_) => {
                            self.shared.stats.inc_dropped();
                            self.shared.emit(EngineEvent::ChunkDropped { output_id: self.id });
                        }
                        None => return Mode::Halt,
                    }
                }
            }
        }
    }

    /// Applies the retry policy after a failed attempt.
    fn after_failure(&mut self, attempt: u32, kind: FailureKind, fresh: bool) -> Mode {
        if !self.shared.is_enabled() {
            self.shared.stats.record_stop();
            self.transition(UnitState::Idle);
            return Mode::Idle;
        }
        match self.policy.decide(attempt, kind) {
            RetryDecision::RetryAfter(delay) => {
                self.transition(UnitState::Reconnecting);
                self.shared.emit(EngineEvent::OutputReconnecting {
                    output_id: self.id,
                    attempt,
                    delay,
                });
                Mode::Backoff {
                    attempt: attempt + 1,
                    delay,
                    fresh,
                }
            }
            RetryDecision::GiveUp => {
                let message = self
                    .shared
                    .last_error
                    .lock()
                    .clone()
                    .unwrap_or_else(|| "unknown failure".to_string());
                self.shared.stats.record_stop();
                self.transition(UnitState::Error);
                self.shared.emit(EngineEvent::OutputFailed {
                    output_id: self.id,
                    error: message.clone(),
                });
                error!(output = %self.name, error = %message, "output failed");
                Mode::Fault
            }
        }
    }

    fn update_bitrate(&mut self, bytes: u64) {
        self.window_bytes += bytes;
        let elapsed = self.window_start.elapsed();
        if elapsed >= BITRATE_WINDOW {
            let bps = (self.window_bytes * 8) as f64 / elapsed.as_secs_f64();
            self.shared.stats.set_bitrate(bps as u64);
            self.window_start = Instant::now();
            self.window_bytes = 0;
        }
    }

    fn transition(&self, to: UnitState) {
        let previous = self.shared.swap_state(to);
        if previous != to {
            debug!(output = %self.name, %previous, current = %to, "state changed");
            self.shared.emit(EngineEvent::OutputStateChanged {
                output_id: self.id,
                previous,
                current: to,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IcecastConfig, OutputKind};
    use crate::error::TransportError;
    use crate::output::mock::MockTransport;

    fn destination() -> OutputDestination {
        OutputDestination::new(
            "relay",
            OutputKind::Icecast(IcecastConfig {
                host: "ice.example.com".to_string(),
                port: 8000,
                mount: "/live".to_string(),
                username: "source".to_string(),
                password: "hackme".to_string(),
            }),
        )
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(5), Duration::from_millis(40)).without_jitter()
    }

    fn spawn_unit(transport: MockTransport) -> OutputUnit {
        OutputUnit::spawn(&destination(), Box::new(transport), 8, fast_policy(), None)
    }

    fn chunk() -> AudioChunk {
        // 500 samples = 1000 bytes
        AudioChunk::new(vec![0i16; 500], Duration::ZERO, 48000, 1)
    }

    async fn wait_for_state(unit: &OutputUnit, state: UnitState) {
        for _ in 0..400 {
            if unit.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!(
            "timed out waiting for {state}, unit is {}",
            unit.state()
        );
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("timed out waiting for condition");
    }

    #[tokio::test]
    async fn test_start_feed_and_count_bytes() {
        let transport = MockTransport::new();
        let unit = spawn_unit(transport.clone());
        assert_eq!(unit.state(), UnitState::Idle);

        unit.start().await.unwrap();
        wait_for_state(&unit, UnitState::Streaming).await;

        for _ in 0..3 {
            assert!(unit.feed(chunk()));
        }
        wait_until(|| transport.writes() == 3).await;

        assert_eq!(unit.state(), UnitState::Streaming);
        assert_eq!(unit.stats().bytes_written, 3000);
        assert_eq!(unit.stats().reconnects, 0);

        unit.shutdown().await;
    }

    #[tokio::test]
    async fn test_permanent_connect_failure_goes_to_error() {
        let transport = MockTransport::new();
        transport.push_connect_error(TransportError::AuthRejected {
            reason: "bad source password".to_string(),
        });
        let unit = spawn_unit(transport.clone());

        unit.start().await.unwrap();
        wait_for_state(&unit, UnitState::Error).await;

        assert_eq!(unit.stats().reconnects, 0);
        assert_eq!(transport.connects(), 0);
        assert!(unit
            .last_error()
            .unwrap()
            .contains("bad source password"));

        unit.shutdown().await;
    }

    #[tokio::test]
    async fn test_transient_connect_failures_retry_until_success() {
        let transport = MockTransport::new();
        transport.push_connect_error(TransportError::Timeout {
            operation: "connect",
        });
        transport.push_connect_error(TransportError::Timeout {
            operation: "connect",
        });
        let unit = spawn_unit(transport.clone());

        unit.start().await.unwrap();
        wait_for_state(&unit, UnitState::Streaming).await;
        assert_eq!(transport.connects(), 1);

        unit.shutdown().await;
    }

    #[tokio::test]
    async fn test_write_failure_reconnects_and_keeps_bytes() {
        let transport = MockTransport::new();
        let unit = spawn_unit(transport.clone());

        unit.start().await.unwrap();
        wait_for_state(&unit, UnitState::Streaming).await;

        assert!(unit.feed(chunk()));
        wait_until(|| transport.writes() == 1).await;

        transport.push_write_error(TransportError::ConnectionReset {
            reason: "peer went away".to_string(),
        });
        assert!(unit.feed(chunk()));

        // Reconnect succeeds and the unit resumes streaming.
        wait_until(|| unit.stats().reconnects == 1).await;
        wait_for_state(&unit, UnitState::Streaming).await;

        assert!(unit.feed(chunk()));
        wait_until(|| transport.writes() == 2).await;

        // bytes_written survives the reconnect; only a fresh start resets it.
        assert_eq!(unit.stats().bytes_written, 2000);
        assert_eq!(unit.stats().reconnects, 1);

        unit.shutdown().await;
    }

    #[tokio::test]
    async fn test_fresh_start_resets_bytes() {
        let transport = MockTransport::new();
        let unit = spawn_unit(transport.clone());

        unit.start().await.unwrap();
        wait_for_state(&unit, UnitState::Streaming).await;
        assert!(unit.feed(chunk()));
        wait_until(|| transport.writes() == 1).await;

        unit.stop().await.unwrap();
        wait_for_state(&unit, UnitState::Idle).await;
        assert_eq!(unit.stats().bytes_written, 1000);

        unit.start().await.unwrap();
        wait_for_state(&unit, UnitState::Streaming).await;
        assert_eq!(unit.stats().bytes_written, 0);

        unit.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_on_idle_is_noop() {
        let unit = spawn_unit(MockTransport::new());
        assert!(unit.stop().await.is_ok());
        assert_eq!(unit.state(), UnitState::Idle);
        unit.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_while_streaming_is_invalid() {
        let unit = spawn_unit(MockTransport::new());
        unit.start().await.unwrap();
        wait_for_state(&unit, UnitState::Streaming).await;

        let err = unit.start().await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));

        unit.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_reconnect() {
        let transport = MockTransport::new();
        // Enough queued failures to keep the unit in its backoff loop.
        for _ in 0..50 {
            transport.push_connect_error(TransportError::Timeout {
                operation: "connect",
            });
        }
        let unit = spawn_unit(transport.clone());

        unit.start().await.unwrap();
        wait_for_state(&unit, UnitState::Reconnecting).await;

        unit.stop().await.unwrap();
        wait_for_state(&unit, UnitState::Idle).await;

        // No further connect attempts fire after the cancel.
        let attempts_before = transport.connect_attempts();
        assert!(attempts_before > 0);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(transport.connect_attempts(), attempts_before);

        unit.shutdown().await;
    }

    #[tokio::test]
    async fn test_disabled_unit_refuses_start() {
        let unit = spawn_unit(MockTransport::new());
        unit.set_enabled(false);
        assert!(matches!(
            unit.start().await,
            Err(EngineError::OutputDisabled { .. })
        ));
        unit.shutdown().await;
    }

    #[tokio::test]
    async fn test_disable_does_not_interrupt_streaming() {
        let transport = MockTransport::new();
        let unit = spawn_unit(transport.clone());

        unit.start().await.unwrap();
        wait_for_state(&unit, UnitState::Streaming).await;

        unit.set_enabled(false);
        assert!(unit.feed(chunk()));
        wait_until(|| transport.writes() == 1).await;
        assert_eq!(unit.state(), UnitState::Streaming);

        unit.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_from_error_clears_it() {
        let transport = MockTransport::new();
        transport.push_connect_error(TransportError::AuthRejected {
            reason: "bad source password".to_string(),
        });
        let unit = spawn_unit(transport.clone());

        unit.start().await.unwrap();
        wait_for_state(&unit, UnitState::Error).await;

        // Explicit restart leaves the terminal error state.
        unit.start().await.unwrap();
        wait_for_state(&unit, UnitState::Streaming).await;

        unit.shutdown().await;
    }
}
