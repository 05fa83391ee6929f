//! Output manager: supervises the output units for one room.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::chunk::AudioChunk;
use crate::config::{EngineConfig, OutputDestination, OutputId};
use crate::error::EngineError;
use crate::event::EventCallback;
use crate::output::stats::OutputStats;
use crate::output::unit::OutputUnit;
use crate::output::{TransportFactory, UnitState};
use crate::template::SessionTemplate;

/// Status snapshot of one output destination.
#[derive(Debug, Clone, Serialize)]
pub struct OutputStatus {
    /// Destination id.
    pub id: OutputId,
    /// Destination name.
    pub name: String,
    /// Destination type label (`icecast`, `srt`, `recording`).
    pub kind: &'static str,
    /// Whether the destination may be started.
    pub enabled: bool,
    /// Current lifecycle state.
    pub state: UnitState,
    /// Last attempt-level error message, if any.
    pub last_error: Option<String>,
    /// Current statistics.
    pub stats: OutputStats,
}

/// Status snapshot of a whole room's outputs.
#[derive(Debug, Clone, Serialize)]
pub struct RoomStatus {
    /// The room this manager serves.
    pub room_id: String,
    /// Aggregate state: `streaming` if at least one unit streams, else
    /// `idle`.
    pub state: UnitState,
    /// Per-destination snapshots.
    pub outputs: Vec<OutputStatus>,
}

/// Supervises the set of output units for one room.
///
/// The manager owns 0..N units, one per configured destination, and fans
/// the shared audio stream out to every unit that is currently streaming.
/// Units fail independently: a slow or broken destination never blocks the
/// producer or its siblings.
///
/// # Example
///
/// ```no_run
/// use roomcast::output::mock::MockFactory;
/// use roomcast::{
///     AudioChunk, EngineConfig, IcecastConfig, OutputDestination, OutputKind, OutputManager,
/// };
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), roomcast::EngineError> {
/// let manager = OutputManager::new("room-42", EngineConfig::default(), Arc::new(MockFactory::new()));
///
/// let id = manager.add_output(OutputDestination::new(
///     "main relay",
///     OutputKind::Icecast(IcecastConfig {
///         host: "ice.example.com".into(),
///         port: 8000,
///         mount: "/live".into(),
///         username: "source".into(),
///         password: "hackme".into(),
///     }),
/// ))?;
///
/// manager.start_output(id).await?;
/// manager.fan_out(&AudioChunk::new(vec![0i16; 4800], Duration::ZERO, 48000, 1));
/// # Ok(())
/// # }
/// ```
pub struct OutputManager {
    room_id: String,
    config: EngineConfig,
    factory: Arc<dyn TransportFactory>,
    units: RwLock<HashMap<OutputId, Arc<OutputUnit>>>,
    template: Mutex<Option<SessionTemplate>>,
    event_callback: Option<EventCallback>,
}

impl OutputManager {
    /// Creates a manager for the given room with no outputs configured.
    pub fn new(
        room_id: impl Into<String>,
        config: EngineConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            config,
            factory,
            units: RwLock::new(HashMap::new()),
            template: Mutex::new(None),
            event_callback: None,
        }
    }

    /// Sets the event callback for all units created afterwards.
    pub fn with_event_callback(mut self, callback: EventCallback) -> Self {
        self.event_callback = Some(callback);
        self
    }

    /// The room this manager serves.
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Adds a destination and creates its unit in `idle`.
    ///
    /// The configuration is validated and a transport is produced before
    /// the unit exists; both reject with [`EngineError::InvalidConfig`]
    /// without any connection attempt.
    #[instrument(name = "output_add", skip(self, destination), fields(room = %self.room_id, output = %destination.name))]
    pub fn add_output(&self, destination: OutputDestination) -> Result<OutputId, EngineError> {
        destination.validate()?;
        let id = destination.id;
        if self.units.read().contains_key(&id) {
            return Err(EngineError::invalid_config(format!(
                "duplicate output id: {id}"
            )));
        }
        let transport = self.factory.create(&destination)?;
        let unit = Arc::new(OutputUnit::spawn(
            &destination,
            transport,
            self.config.chunk_queue_capacity,
            self.config.output_retry.clone(),
            self.event_callback.clone(),
        ));

        self.units.write().insert(id, unit);
        info!(%id, kind = destination.kind.label(), "output added");
        Ok(id)
    }

    /// Removes a destination, stopping it first if active.
    #[instrument(name = "output_remove", skip(self), fields(room = %self.room_id))]
    pub async fn remove_output(&self, id: OutputId) -> Result<(), EngineError> {
        let unit = self
            .units
            .write()
            .remove(&id)
            .ok_or(EngineError::OutputNotFound { id })?;
        unit.shutdown().await;
        info!(%id, "output removed");
        Ok(())
    }

    /// Starts the destination's connection lifecycle.
    pub async fn start_output(&self, id: OutputId) -> Result<(), EngineError> {
        self.unit(id)?.start().await
    }

    /// Stops the destination. A no-op if it is already `idle`.
    pub async fn stop_output(&self, id: OutputId) -> Result<(), EngineError> {
        self.unit(id)?.stop().await
    }

    /// Stops and starts the destination, clearing a terminal `error`.
    pub async fn restart_output(&self, id: OutputId) -> Result<(), EngineError> {
        let unit = self.unit(id)?;
        unit.stop().await?;
        // Let the worker finish tearing down before restarting.
        for _ in 0..100 {
            if matches!(unit.state(), UnitState::Idle | UnitState::Error) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        unit.start().await
    }

    /// Enables or disables the destination.
    ///
    /// Disabling does not interrupt an active stream; it refuses future
    /// starts and abandons any in-progress reconnect loop.
    pub fn set_enabled(&self, id: OutputId, enabled: bool) -> Result<(), EngineError> {
        let unit = self.unit(id)?;
        unit.set_enabled(enabled);
        debug!(room = %self.room_id, %id, enabled, "output enabled flag changed");
        Ok(())
    }

    /// Delivers one chunk to every unit that is currently streaming.
    ///
    /// Never blocks: each unit gets a non-blocking hand-off into its own
    /// bounded queue, and a unit that has fallen behind drops the chunk
    /// rather than stalling the producer or its siblings. Returns how many
    /// units accepted the chunk.
    pub fn fan_out(&self, chunk: &AudioChunk) -> usize {
        let units = self.units.read();
        units
            .values()
            .filter(|unit| unit.feed(chunk.clone()))
            .count()
    }

    /// Returns a snapshot of one destination's status.
    pub fn output_status(&self, id: OutputId) -> Result<OutputStatus, EngineError> {
        Ok(Self::snapshot(self.unit(id)?.as_ref()))
    }

    /// Returns a snapshot of all destinations and the aggregate room state.
    pub fn status(&self) -> RoomStatus {
        let units = self.units.read();
        let mut outputs: Vec<OutputStatus> = units.values().map(|u| Self::snapshot(u)).collect();
        outputs.sort_by(|a, b| a.name.cmp(&b.name));

        let state = if outputs.iter().any(|o| o.state == UnitState::Streaming) {
            UnitState::Streaming
        } else {
            UnitState::Idle
        };

        RoomStatus {
            room_id: self.room_id.clone(),
            state,
            outputs,
        }
    }

    /// Returns the DSP template currently attached to this room, if any.
    pub fn session_template(&self) -> Option<SessionTemplate> {
        self.template.lock().clone()
    }

    /// Attaches the DSP template handed to the mixing engine.
    ///
    /// The template is carried opaque; this engine never interprets it.
    pub fn set_session_template(&self, template: Option<SessionTemplate>) {
        *self.template.lock() = template;
    }

    /// Stops every unit and waits for their workers to finish.
    #[instrument(name = "output_manager_shutdown", skip(self), fields(room = %self.room_id))]
    pub async fn shutdown(&self) {
        let units: Vec<Arc<OutputUnit>> = self.units.write().drain().map(|(_, u)| u).collect();
        for unit in units {
            unit.shutdown().await;
        }
        info!("output manager shutdown complete");
    }

    fn unit(&self, id: OutputId) -> Result<Arc<OutputUnit>, EngineError> {
        self.units
            .read()
            .get(&id)
            .cloned()
            .ok_or(EngineError::OutputNotFound { id })
    }

    fn snapshot(unit: &OutputUnit) -> OutputStatus {
        OutputStatus {
            id: unit.id(),
            name: unit.name().to_string(),
            kind: unit.kind(),
            enabled: unit.is_enabled(),
            state: unit.state(),
            last_error: unit.last_error(),
            stats: unit.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IcecastConfig, OutputKind, RecordingConfig, RecordingFormat, SrtConfig};
    use crate::error::TransportError;
    use crate::output::mock::{MockFactory, MockTransport};
    use std::time::Duration;

    fn icecast_dest(name: &str) -> OutputDestination {
        OutputDestination::new(
            name,
            OutputKind::Icecast(IcecastConfig {
                host: "ice.example.com".to_string(),
                port: 8000,
                mount: "/live".to_string(),
                username: "source".to_string(),
                password: "hackme".to_string(),
            }),
        )
    }

    fn srt_dest(name: &str) -> OutputDestination {
        OutputDestination::new(
            name,
            OutputKind::Srt(SrtConfig {
                host: "srt.example.com".to_string(),
                port: 9000,
                passphrase: None,
                latency_ms: 120,
            }),
        )
    }

    fn manager_with(factory: MockFactory) -> OutputManager {
        let mut config = EngineConfig::default();
        config.output_retry = crate::RetryPolicy::new(
            Duration::from_millis(5),
            Duration::from_millis(40),
        )
        .without_jitter();
        OutputManager::new("room-1", config, Arc::new(factory))
    }

    fn chunk() -> AudioChunk {
        AudioChunk::new(vec![0i16; 500], Duration::ZERO, 48000, 1)
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
    async fn test_add_validates_config() {
        let manager = manager_with(MockFactory::new());
        let mut dest = icecast_dest("relay");
        if let OutputKind::Icecast(ref mut cfg) = dest.kind {
            cfg.host.clear();
        }
        assert!(matches!(
            manager.add_output(dest),
            Err(EngineError::InvalidConfig { .. })
        ));
    }

    #[tokio::test]
    async fn test_remove_unknown_output_fails() {
        let manager = manager_with(MockFactory::new());
        assert!(matches!(
            manager.remove_output(OutputId::new()).await,
            Err(EngineError::OutputNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_fan_out_reaches_all_streaming_units() {
        let factory = MockFactory::new();
        let ice = MockTransport::new();
        let srt = MockTransport::new();
        factory.register("relay", ice.clone());
        factory.register("contribution", srt.clone());
        let manager = manager_with(factory);

        let a = manager.add_output(icecast_dest("relay")).unwrap();
        let b = manager.add_output(srt_dest("contribution")).unwrap();
        manager.start_output(a).await.unwrap();
        manager.start_output(b).await.unwrap();
        wait_until(|| manager.status().state == UnitState::Streaming).await;
        wait_until(|| {
            manager
                .status()
                .outputs
                .iter()
                .all(|o| o.state == UnitState::Streaming)
        })
        .await;

        for _ in 0..5 {
            manager.fan_out(&chunk());
        }
        wait_until(|| ice.writes() == 5 && srt.writes() == 5).await;

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_fan_out_isolates_failing_unit() {
        let factory = MockFactory::new();
        let healthy = MockTransport::new();
        let broken = MockTransport::new();
        broken.fail_all_writes(|| TransportError::write_failed("scripted"));
        factory.register("healthy", healthy.clone());
        factory.register("broken", broken.clone());
        let manager = manager_with(factory);

        let good = manager.add_output(icecast_dest("healthy")).unwrap();
        let bad = manager.add_output(srt_dest("broken")).unwrap();
        manager.start_output(good).await.unwrap();
        manager.start_output(bad).await.unwrap();
        wait_until(|| {
            manager
                .status()
                .outputs
                .iter()
                .all(|o| o.state == UnitState::Streaming)
        })
        .await;

        let n = 10;
        for _ in 0..n {
            manager.fan_out(&chunk());
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        wait_until(|| healthy.writes() == n).await;
        let broken_status = manager.output_status(bad).unwrap();
        assert!(broken_status.stats.reconnects > 0);

        let healthy_status = manager.output_status(good).unwrap();
        assert_eq!(healthy_status.stats.bytes_written, n as u64 * 1000);
        assert_eq!(healthy_status.stats.reconnects, 0);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_aggregate_status() {
        let manager = manager_with(MockFactory::new());
        let id = manager.add_output(icecast_dest("relay")).unwrap();

        assert_eq!(manager.status().state, UnitState::Idle);

        manager.start_output(id).await.unwrap();
        wait_until(|| manager.status().state == UnitState::Streaming).await;

        manager.stop_output(id).await.unwrap();
        wait_until(|| manager.status().state == UnitState::Idle).await;

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_active_output_stops_it_first() {
        let factory = MockFactory::new();
        let transport = MockTransport::new();
        factory.register("relay", transport.clone());
        let manager = manager_with(factory);

        let id = manager.add_output(icecast_dest("relay")).unwrap();
        manager.start_output(id).await.unwrap();
        wait_until(|| transport.connects() == 1).await;

        manager.remove_output(id).await.unwrap();
        assert!(transport.closes() >= 1);
        assert!(manager.output_status(id).is_err());
    }

    #[tokio::test]
    async fn test_restart_clears_error_state() {
        let factory = MockFactory::new();
        let transport = MockTransport::new();
        transport.push_connect_error(TransportError::AuthRejected {
            reason: "bad credentials".to_string(),
        });
        factory.register("relay", transport.clone());
        let manager = manager_with(factory);

        let id = manager.add_output(icecast_dest("relay")).unwrap();
        manager.start_output(id).await.unwrap();
        wait_until(|| manager.output_status(id).unwrap().state == UnitState::Error).await;

        manager.restart_output(id).await.unwrap();
        wait_until(|| manager.output_status(id).unwrap().state == UnitState::Streaming).await;

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_session_template_passthrough() {
        let manager = manager_with(MockFactory::new());
        assert!(manager.session_template().is_none());

        let template = SessionTemplate::new("interview");
        manager.set_session_template(Some(template.clone()));
        assert_eq!(manager.session_template().unwrap().id, template.id);
    }
}
