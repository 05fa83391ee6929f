//! Mock output transport for testing without network destinations.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::chunk::AudioChunk;
use crate::config::OutputDestination;
use crate::error::{EngineError, TransportError};
use crate::output::{OutputTransport, TransportFactory};

/// A scriptable output transport that records activity.
///
/// This allows exercising the full output lifecycle - connect failures,
/// mid-stream write failures, reconnects - without any real destination,
/// making it suitable for CI environments. Clones share state, so tests
/// keep a clone while the unit owns the boxed original.
///
/// # Example
///
/// ```
/// use roomcast::output::mock::MockTransport;
/// use roomcast::TransportError;
///
/// let transport = MockTransport::new();
/// let probe = transport.clone();
///
/// // Fail the first connect attempt, then succeed.
/// transport.push_connect_error(TransportError::Timeout { operation: "connect" });
///
/// // ...hand `transport` to the engine, then assert via `probe`:
/// assert_eq!(probe.connects(), 0);
/// ```
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<MockInner>,
}

#[derive(Default)]
struct MockInner {
    connect_attempts: AtomicUsize,
    connects: AtomicUsize,
    writes: AtomicUsize,
    closes: AtomicUsize,
    bytes_written: AtomicU64,
    connect_errors: Mutex<VecDeque<TransportError>>,
    write_errors: Mutex<VecDeque<TransportError>>,
    fail_all_writes: Mutex<Option<fn() -> TransportError>>,
}

impl MockTransport {
    /// Creates a transport that succeeds at everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an error for the next connect attempt.
    ///
    /// Queued errors are consumed in order; once the queue is empty,
    /// connects succeed.
    pub fn push_connect_error(&self, error: TransportError) {
        self.inner.connect_errors.lock().push_back(error);
    }

    /// Queues an error for the next write.
    pub fn push_write_error(&self, error: TransportError) {
        self.inner.write_errors.lock().push_back(error);
    }

    /// Makes every write fail with the error the given function produces.
    pub fn fail_all_writes(&self, make_error: fn() -> TransportError) {
        *self.inner.fail_all_writes.lock() = Some(make_error);
    }

    /// Number of connect attempts, successful or not.
    pub fn connect_attempts(&self) -> usize {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    /// Number of successful connects.
    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Number of successful writes.
    pub fn writes(&self) -> usize {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// Number of close calls.
    pub fn closes(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    /// Total bytes accepted across all successful writes.
    pub fn bytes_written(&self) -> u64 {
        self.inner.bytes_written.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OutputTransport for MockTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.inner.connect_errors.lock().pop_front() {
            return Err(error);
        }
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn write(&mut self, chunk: &AudioChunk) -> Result<(), TransportError> {
        if let Some(error) = self.inner.write_errors.lock().pop_front() {
            return Err(error);
        }
        if let Some(make_error) = *self.inner.fail_all_writes.lock() {
            return Err(make_error());
        }
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        self.inner
            .bytes_written
            .fetch_add(chunk.byte_len(), Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A [`TransportFactory`] that hands out pre-registered mock transports.
///
/// Register a mock per destination name; unknown destinations get a fresh
/// always-succeeding mock. Every created transport is retained for later
/// inspection.
#[derive(Default)]
pub struct MockFactory {
    registered: Mutex<Vec<(String, MockTransport)>>,
    created: Mutex<Vec<(String, MockTransport)>>,
}

impl MockFactory {
    /// Creates an empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the transport to hand out for the named destination.
    pub fn register(&self, name: impl Into<String>, transport: MockTransport) {
        self.registered.lock().push((name.into(), transport));
    }

    /// Returns the transports created so far, in creation order.
    pub fn created(&self) -> Vec<(String, MockTransport)> {
        self.created.lock().clone()
    }
}

impl TransportFactory for MockFactory {
    fn create(
        &self,
        destination: &OutputDestination,
    ) -> Result<Box<dyn OutputTransport>, EngineError> {
        let transport = self
            .registered
            .lock()
            .iter()
            .find(|(name, _)| *name == destination.name)
            .map(|(_, transport)| transport.clone())
            .unwrap_or_default();
        self.created
            .lock()
            .push((destination.name.clone(), transport.clone()));
        Ok(Box::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_mock_transport_counts_activity() {
        let mut transport = MockTransport::new();
        let probe = transport.clone();

        transport.connect().await.unwrap();
        let chunk = AudioChunk::new(vec![0i16; 500], Duration::ZERO, 48000, 1);
        transport.write(&chunk).await.unwrap();
        transport.close().await.unwrap();

        assert_eq!(probe.connects(), 1);
        assert_eq!(probe.writes(), 1);
        assert_eq!(probe.bytes_written(), 1000);
        assert_eq!(probe.closes(), 1);
    }

    #[tokio::test]
    async fn test_mock_transport_scripted_connect_failures() {
        let mut transport = MockTransport::new();
        transport.push_connect_error(TransportError::Timeout {
            operation: "connect",
        });

        assert!(transport.connect().await.is_err());
        assert!(transport.connect().await.is_ok());
        assert_eq!(transport.connects(), 1);
    }

    #[tokio::test]
    async fn test_mock_transport_persistent_write_failure() {
        let mut transport = MockTransport::new();
        transport.fail_all_writes(|| TransportError::write_failed("scripted"));

        let chunk = AudioChunk::new(vec![0i16; 10], Duration::ZERO, 48000, 1);
        assert!(transport.write(&chunk).await.is_err());
        assert!(transport.write(&chunk).await.is_err());
        assert_eq!(transport.writes(), 0);
    }

    #[test]
    fn test_mock_factory_hands_out_registered_transport() {
        use crate::config::{IcecastConfig, OutputKind};

        let factory = MockFactory::new();
        let transport = MockTransport::new();
        factory.register("relay", transport.clone());

        let dest = OutputDestination::new(
            "relay",
            OutputKind::Icecast(IcecastConfig {
                host: "ice.example.com".to_string(),
                port: 8000,
                mount: "/live".to_string(),
                username: "source".to_string(),
                password: "hackme".to_string(),
            }),
        );
        assert!(factory.create(&dest).is_ok());
        assert_eq!(factory.created().len(), 1);
        assert_eq!(factory.created()[0].0, "relay");
    }
}
