//! Webhook dispatcher: per-organization delivery supervision.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{classify_status, EngineError, FailureKind};
use crate::event::{EngineEvent, EventCallback};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::webhook::history::{DeliveryLog, DeliveryPage};
use crate::webhook::sender::{sign_payload, DeliverySender, HttpSender};
use crate::webhook::{
    DeliveryAttempt, DeliveryId, DeliveryStatus, DomainEvent, EndpointId, UpdateEndpoint,
    WebhookDelivery, WebhookEndpoint, WebhookPayload,
};

/// A registered endpoint with its queue and worker.
struct EndpointEntry {
    endpoint: Arc<RwLock<WebhookEndpoint>>,
    queue_tx: mpsc::Sender<DeliveryId>,
    cancel_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Supervises outbound webhook deliveries for one organization.
///
/// Each registered endpoint gets its own FIFO delivery queue and worker
/// task: deliveries to one endpoint happen in event-emission order, while
/// endpoints proceed independently of each other. A stuck delivery retries
/// with backoff on its own worker and never delays other endpoints.
///
/// # Example
///
/// ```no_run
/// use roomcast::{
///     DomainEvent, EngineConfig, EventType, WebhookDispatcher, WebhookEndpoint,
/// };
/// use uuid::Uuid;
///
/// # fn example() -> Result<(), roomcast::EngineError> {
/// let org = Uuid::new_v4();
/// let dispatcher = WebhookDispatcher::new(org, EngineConfig::default());
///
/// dispatcher.add_endpoint(WebhookEndpoint::new(
///     org,
///     "https://hooks.example.com/rooms",
///     "s3cret",
///     [EventType::RoomCreated, EventType::RecordingCompleted],
/// ))?;
///
/// dispatcher.handle_event(DomainEvent {
///     event_type: EventType::RoomCreated,
///     organization_id: org,
///     room_id: Some(Uuid::new_v4()),
///     data: serde_json::json!({"name": "Morning show"}),
/// });
/// # Ok(())
/// # }
/// ```
pub struct WebhookDispatcher {
    organization_id: Uuid,
    config: EngineConfig,
    sender: Arc<dyn DeliverySender>,
    endpoints: RwLock<HashMap<EndpointId, Arc<EndpointEntry>>>,
    log: Arc<DeliveryLog>,
    event_callback: Option<EventCallback>,
}

impl WebhookDispatcher {
    /// Creates a dispatcher delivering over HTTP.
    pub fn new(organization_id: Uuid, config: EngineConfig) -> Self {
        Self::with_sender(organization_id, config, Arc::new(HttpSender::new()))
    }

    /// Creates a dispatcher with a custom delivery sender.
    pub fn with_sender(
        organization_id: Uuid,
        config: EngineConfig,
        sender: Arc<dyn DeliverySender>,
    ) -> Self {
        Self {
            organization_id,
            config,
            sender,
            endpoints: RwLock::new(HashMap::new()),
            log: Arc::new(DeliveryLog::new()),
            event_callback: None,
        }
    }

    /// Sets the event callback for all endpoints registered afterwards.
    pub fn with_event_callback(mut self, callback: EventCallback) -> Self {
        self.event_callback = Some(callback);
        self
    }

    /// The organization this dispatcher serves.
    pub fn organization_id(&self) -> Uuid {
        self.organization_id
    }

    /// Registers an endpoint and spawns its delivery worker.
    #[instrument(name = "webhook_add_endpoint", skip(self, endpoint), fields(url = %endpoint.url))]
    pub fn add_endpoint(&self, endpoint: WebhookEndpoint) -> Result<EndpointId, EngineError> {
        if endpoint.organization_id != self.organization_id {
            return Err(EngineError::invalid_config(
                "endpoint belongs to a different organization",
            ));
        }
        if !endpoint.url.starts_with("http://") && !endpoint.url.starts_with("https://") {
            return Err(EngineError::invalid_config(
                "endpoint url must be http(s)",
            ));
        }
        if endpoint.secret.is_empty() {
            return Err(EngineError::invalid_config(
                "endpoint secret must not be empty",
            ));
        }

        let id = endpoint.id;
        let endpoint = Arc::new(RwLock::new(endpoint));
        let (queue_tx, queue_rx) = mpsc::channel(self.config.delivery_queue_capacity.max(1));
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let worker = EndpointWorker {
            endpoint_id: id,
            endpoint: Arc::clone(&endpoint),
            queue_rx,
            cancel_rx,
            sender: Arc::clone(&self.sender),
            log: Arc::clone(&self.log),
            policy: self.config.webhook_retry.clone(),
            timeout: self.config.webhook_timeout,
            body_limit: self.config.response_body_limit,
            event_callback: self.event_callback.clone(),
        };
        let handle = tokio::spawn(worker.run());

        self.endpoints.write().insert(
            id,
            Arc::new(EndpointEntry {
                endpoint,
                queue_tx,
                cancel_tx,
                worker: Mutex::new(Some(handle)),
            }),
        );
        info!(%id, "webhook endpoint registered");
        Ok(id)
    }

    /// Applies changes to a registered endpoint.
    ///
    /// Takes effect from the next delivery attempt, including retries of
    /// in-flight deliveries.
    pub fn update_endpoint(
        &self,
        id: EndpointId,
        update: UpdateEndpoint,
    ) -> Result<(), EngineError> {
        if let Some(ref url) = update.url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(EngineError::invalid_config("endpoint url must be http(s)"));
            }
        }
        if update.secret.as_deref() == Some("") {
            return Err(EngineError::invalid_config(
                "endpoint secret must not be empty",
            ));
        }

        let entry = self.entry(id)?;
        let mut endpoint = entry.endpoint.write();
        if let Some(url) = update.url {
            endpoint.url = url;
        }
        if let Some(secret) = update.secret {
            endpoint.secret = secret;
        }
        if let Some(events) = update.events {
            endpoint.events = events;
        }
        if let Some(enabled) = update.enabled {
            endpoint.enabled = enabled;
        }
        Ok(())
    }

    /// Removes an endpoint, cancelling its pending retries.
    ///
    /// An attempt already on the wire may complete, but its result never
    /// schedules another retry.
    #[instrument(name = "webhook_remove_endpoint", skip(self))]
    pub async fn remove_endpoint(&self, id: EndpointId) -> Result<(), EngineError> {
        let entry = self
            .endpoints
            .write()
            .remove(&id)
            .ok_or(EngineError::EndpointNotFound { id })?;
        let _ = entry.cancel_tx.send(true);
        let handle = entry.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(endpoint = %id, error = ?e, "endpoint worker panicked");
            }
        }
        info!(%id, "webhook endpoint removed");
        Ok(())
    }

    /// Returns a copy of one endpoint's configuration and summary.
    pub fn get_endpoint(&self, id: EndpointId) -> Result<WebhookEndpoint, EngineError> {
        Ok(self.entry(id)?.endpoint.read().clone())
    }

    /// Returns all registered endpoints, oldest first.
    pub fn list_endpoints(&self) -> Vec<WebhookEndpoint> {
        let mut endpoints: Vec<WebhookEndpoint> = self
            .endpoints
            .read()
            .values()
            .map(|e| e.endpoint.read().clone())
            .collect();
        endpoints.sort_by_key(|e| e.created_at);
        endpoints
    }

    /// Fans a domain event out to every enabled, subscribed endpoint.
    ///
    /// Creates one pending delivery per matching endpoint and queues it on
    /// that endpoint's worker. Never blocks: an endpoint whose queue is
    /// full gets an immediately failed delivery instead of stalling events
    /// for other endpoints.
    #[instrument(name = "webhook_handle_event", skip(self, event), fields(event_type = %event.event_type))]
    pub fn handle_event(&self, event: DomainEvent) {
        if event.organization_id != self.organization_id {
            debug!(
                organization = %event.organization_id,
                "event for different organization ignored"
            );
            return;
        }

        let payload = WebhookPayload {
            event: event.event_type,
            timestamp: Utc::now(),
            organization_id: event.organization_id,
            room_id: event.room_id,
            data: event.data,
        };
        let body = match serde_json::to_string(&payload) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "event payload not serializable, dropped");
                return;
            }
        };

        let entries: Vec<Arc<EndpointEntry>> =
            self.endpoints.read().values().cloned().collect();
        for entry in entries {
            let (id, wanted) = {
                let endpoint = entry.endpoint.read();
                (
                    endpoint.id,
                    endpoint.enabled && endpoint.subscribes_to(event.event_type),
                )
            };
            if !wanted {
                continue;
            }

            let delivery = WebhookDelivery::new(id, event.event_type, body.clone());
            let delivery_id = delivery.id;
            self.log.insert(delivery);

            if let Err(e) = entry.queue_tx.try_send(delivery_id) {
                self.log.update(delivery_id, |d| {
                    d.status = DeliveryStatus::Failed;
                    d.error = Some("delivery queue full".to_string());
                });
                warn!(endpoint = %id, error = %e, "delivery queue full, delivery failed");
                if let Some(ref callback) = self.event_callback {
                    callback(EngineEvent::DeliveryFailed {
                        delivery_id,
                        endpoint_id: id,
                        attempts: 0,
                        error: "delivery queue full".to_string(),
                    });
                }
            }
        }
    }

    /// Consumes domain events from the bus until the channel closes.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<DomainEvent>) {
        info!(organization = %self.organization_id, "webhook dispatcher started");
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        info!(organization = %self.organization_id, "event bus closed, dispatcher stopping");
    }

    /// Returns one page of an endpoint's delivery history, newest-first.
    ///
    /// Also serves endpoints that have since been removed; their records
    /// are retained.
    pub fn list_deliveries(
        &self,
        webhook_id: EndpointId,
        page: usize,
        page_size: usize,
    ) -> DeliveryPage {
        self.log.list(webhook_id, page, page_size)
    }

    /// Returns a copy of one delivery record.
    pub fn delivery(&self, id: DeliveryId) -> Option<WebhookDelivery> {
        self.log.get(id)
    }

    /// Removes every endpoint and waits for their workers to finish.
    pub async fn shutdown(&self) {
        let ids: Vec<EndpointId> = self.endpoints.read().keys().copied().collect();
        for id in ids {
            let _ = self.remove_endpoint(id).await;
        }
    }

    fn entry(&self, id: EndpointId) -> Result<Arc<EndpointEntry>, EngineError> {
        self.endpoints
            .read()
            .get(&id)
            .cloned()
            .ok_or(EngineError::EndpointNotFound { id })
    }
}

/// Worker task delivering one endpoint's queue in FIFO order.
struct EndpointWorker {
    endpoint_id: EndpointId,
    endpoint: Arc<RwLock<WebhookEndpoint>>,
    queue_rx: mpsc::Receiver<DeliveryId>,
    cancel_rx: watch::Receiver<bool>,
    sender: Arc<dyn DeliverySender>,
    log: Arc<DeliveryLog>,
    policy: RetryPolicy,
    timeout: Duration,
    body_limit: usize,
    event_callback: Option<EventCallback>,
}

impl EndpointWorker {
    async fn run(mut self) {
        debug!(endpoint = %self.endpoint_id, "endpoint worker started");
        loop {
            // A cancellation consumed inside deliver() lands here.
            if self.cancelled() {
                break;
            }
            tokio::select! {
                changed = self.cancel_rx.changed() => {
                    if changed.is_err() || *self.cancel_rx.borrow() {
                        break;
                    }
                }
                item = self.queue_rx.recv() => match item {
                    Some(delivery_id) => self.deliver(delivery_id).await,
                    None => break,
                }
            }
        }
        debug!(endpoint = %self.endpoint_id, "endpoint worker stopped");
    }

    fn cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(ref callback) = self.event_callback {
            callback(event);
        }
    }

    fn truncate(&self, mut body: String) -> String {
        if body.len() > self.body_limit {
            let mut cut = self.body_limit;
            while cut > 0 && !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        body
    }

    /// Drives one delivery from pending to a terminal status.
    async fn deliver(&mut self, delivery_id: DeliveryId) {
        let Some(delivery) = self.log.get(delivery_id) else {
            return;
        };
        let body = delivery.payload;
        let mut attempts = delivery.attempts;

        loop {
            let (url, secret, enabled) = {
                let endpoint = self.endpoint.read();
                (
                    endpoint.url.clone(),
                    endpoint.secret.clone(),
                    endpoint.enabled,
                )
            };
            if !enabled {
                self.log.update(delivery_id, |d| {
                    d.status = DeliveryStatus::Failed;
                    d.error = Some("endpoint disabled".to_string());
                });
                return;
            }

            attempts += 1;
            let attempted_at = Utc::now();
            let outcome = match sign_payload(&secret, body.as_bytes()) {
                Ok(signature) => {
                    self.sender
                        .send(&url, &body, &signature, self.timeout)
                        .await
                }
                Err(e) => Err(e),
            };

            let (http_status, response_body, error_text, kind) = match outcome {
                Ok(response) if response.is_success() => {
                    let status = response.status;
                    let truncated = self.truncate(response.body);
                    self.log.update(delivery_id, |d| {
                        d.attempts = attempts;
                        d.status = DeliveryStatus::Success;
                        d.http_status = Some(status);
                        d.response_body = Some(truncated);
                        d.error = None;
                        d.delivered_at = Some(Utc::now());
                        d.attempt_log.push(DeliveryAttempt {
                            attempted_at,
                            http_status: Some(status),
                            error: None,
                            retry_delay: None,
                        });
                    });
                    self.record_summary(DeliveryStatus::Success);
                    self.emit(EngineEvent::DeliverySucceeded {
                        delivery_id,
                        endpoint_id: self.endpoint_id,
                        attempts,
                    });
                    info!(
                        endpoint = %self.endpoint_id,
                        delivery = %delivery_id,
                        attempts,
                        "delivery succeeded"
                    );
                    return;
                }
                Ok(response) => {
                    let kind = classify_status(response.status);
                    (
                        Some(response.status),
                        Some(self.truncate(response.body)),
                        format!("endpoint returned HTTP {}", response.status),
                        kind,
                    )
                }
                Err(e) => (None, None, e.to_string(), e.kind()),
            };

            match self.policy.decide(attempts, kind) {
                RetryDecision::RetryAfter(delay) => {
                    self.log.update(delivery_id, |d| {
                        d.attempts = attempts;
                        d.status = DeliveryStatus::Retrying;
                        d.http_status = http_status;
                        d.response_body = response_body.clone();
                        d.error = Some(error_text.clone());
                        d.attempt_log.push(DeliveryAttempt {
                            attempted_at,
                            http_status,
                            error: Some(error_text.clone()),
                            retry_delay: Some(delay),
                        });
                    });
                    self.emit(EngineEvent::DeliveryRetrying {
                        delivery_id,
                        endpoint_id: self.endpoint_id,
                        attempt: attempts,
                        delay,
                    });
                    debug!(
                        endpoint = %self.endpoint_id,
                        delivery = %delivery_id,
                        attempt = attempts,
                        ?delay,
                        error = %error_text,
                        "delivery attempt failed, retrying"
                    );

                    // The in-flight attempt above was allowed to finish;
                    // a removal seen here stops any further retries.
                    if self.cancelled() {
                        self.abandon(delivery_id);
                        return;
                    }
                    let sleep = tokio::time::sleep(delay);
                    tokio::pin!(sleep);
                    tokio::select! {
                        () = &mut sleep => {}
                        changed = self.cancel_rx.changed() => {
                            if changed.is_err() || *self.cancel_rx.borrow() {
                                self.abandon(delivery_id);
                                return;
                            }
                        }
                    }
                }
                RetryDecision::GiveUp => {
                    let final_error = if kind == FailureKind::Transient {
                        format!("retry limit reached: {error_text}")
                    } else {
                        error_text
                    };
                    self.log.update(delivery_id, |d| {
                        d.attempts = attempts;
                        d.status = DeliveryStatus::Failed;
                        d.http_status = http_status;
                        d.response_body = response_body.clone();
                        d.error = Some(final_error.clone());
                        d.attempt_log.push(DeliveryAttempt {
                            attempted_at,
                            http_status,
                            error: Some(final_error.clone()),
                            retry_delay: None,
                        });
                    });
                    self.record_summary(DeliveryStatus::Failed);
                    self.emit(EngineEvent::DeliveryFailed {
                        delivery_id,
                        endpoint_id: self.endpoint_id,
                        attempts,
                        error: final_error.clone(),
                    });
                    warn!(
                        endpoint = %self.endpoint_id,
                        delivery = %delivery_id,
                        attempts,
                        error = %final_error,
                        "delivery failed"
                    );
                    return;
                }
            }
        }
    }

    /// Marks a delivery terminal after its endpoint was removed mid-retry.
    fn abandon(&self, delivery_id: DeliveryId) {
        self.log.update(delivery_id, |d| {
            d.status = DeliveryStatus::Failed;
            d.error = Some("endpoint removed".to_string());
        });
        debug!(
            endpoint = %self.endpoint_id,
            delivery = %delivery_id,
            "pending retries cancelled, endpoint removed"
        );
    }

    fn record_summary(&self, status: DeliveryStatus) {
        let mut endpoint = self.endpoint.write();
        endpoint.last_delivery_at = Some(Utc::now());
        endpoint.last_delivery_status = Some(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeliveryError;
    use crate::webhook::sender::{verify_signature, DeliveryResponse};
    use crate::webhook::EventType;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted sender: pops queued outcomes, then repeats the default.
    struct MockSender {
        scripted: Mutex<VecDeque<Result<DeliveryResponse, DeliveryError>>>,
        default_status: u16,
        calls: AtomicUsize,
        requests: Mutex<Vec<(String, String, String)>>,
    }

    impl MockSender {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                scripted: Mutex::new(VecDeque::new()),
                default_status: 200,
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn always(status: u16) -> Arc<Self> {
            Arc::new(Self {
                scripted: Mutex::new(VecDeque::new()),
                default_status: status,
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn push_status(&self, status: u16) {
            self.scripted.lock().push_back(Ok(DeliveryResponse {
                status,
                body: format!("status {status}"),
            }));
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DeliverySender for MockSender {
        async fn send(
            &self,
            url: &str,
            body: &str,
            signature: &str,
            _timeout: Duration,
        ) -> Result<DeliveryResponse, DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests
                .lock()
                .push((url.to_string(), body.to_string(), signature.to_string()));
            if let Some(outcome) = self.scripted.lock().pop_front() {
                return outcome;
            }
            Ok(DeliveryResponse {
                status: self.default_status,
                body: String::new(),
            })
        }
    }

    fn fast_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.webhook_retry = RetryPolicy::new(
            Duration::from_millis(5),
            Duration::from_millis(80),
        )
        .with_max_attempts(8)
        .without_jitter();
        config
    }

    fn dispatcher_with(sender: Arc<MockSender>) -> (WebhookDispatcher, Uuid) {
        let org = Uuid::new_v4();
        (
            WebhookDispatcher::with_sender(org, fast_config(), sender),
            org,
        )
    }

    fn endpoint(org: Uuid, events: impl IntoIterator<Item = EventType>) -> WebhookEndpoint {
        WebhookEndpoint::new(org, "https://hooks.example.com/rooms", "s3cret", events)
    }

    fn room_created(org: Uuid) -> DomainEvent {
        DomainEvent {
            event_type: EventType::RoomCreated,
            organization_id: org,
            room_id: Some(Uuid::new_v4()),
            data: serde_json::json!({"name": "Morning show"}),
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("timed out waiting for condition");
    }

    #[tokio::test]
    async fn test_single_event_delivers_once() {
        let sender = MockSender::ok();
        let (dispatcher, org) = dispatcher_with(Arc::clone(&sender));
        let id = dispatcher
            .add_endpoint(endpoint(org, [EventType::RoomCreated]))
            .unwrap();

        dispatcher.handle_event(room_created(org));
        wait_until(|| sender.calls() == 1).await;

        let page = dispatcher.list_deliveries(id, 1, 10);
        assert_eq!(page.total, 1);
        let delivery = &page.deliveries[0];
        wait_until(|| dispatcher.delivery(delivery.id).unwrap().status == DeliveryStatus::Success)
            .await;

        let delivery = dispatcher.delivery(delivery.id).unwrap();
        assert_eq!(delivery.attempts, 1);
        assert_eq!(delivery.http_status, Some(200));
        assert!(delivery.delivered_at.is_some());

        // Endpoint summary reflects the outcome.
        let registered = dispatcher.get_endpoint(id).unwrap();
        assert_eq!(
            registered.last_delivery_status,
            Some(DeliveryStatus::Success)
        );
        assert!(registered.last_delivery_at.is_some());

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_payload_is_signed_with_endpoint_secret() {
        let sender = MockSender::ok();
        let (dispatcher, org) = dispatcher_with(Arc::clone(&sender));
        dispatcher
            .add_endpoint(endpoint(org, [EventType::RoomCreated]))
            .unwrap();

        dispatcher.handle_event(room_created(org));
        wait_until(|| sender.calls() == 1).await;

        let requests = sender.requests.lock();
        let (_, body, signature) = &requests[0];
        assert!(verify_signature("s3cret", body.as_bytes(), signature));
        let parsed: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(parsed["event"], "room.created");
    }

    #[tokio::test]
    async fn test_transient_failures_retry_then_succeed() {
        let sender = MockSender::ok();
        sender.push_status(500);
        sender.push_status(500);
        sender.push_status(500);
        let (dispatcher, org) = dispatcher_with(Arc::clone(&sender));
        let id = dispatcher
            .add_endpoint(endpoint(org, [EventType::RoomCreated]))
            .unwrap();

        dispatcher.handle_event(room_created(org));
        wait_until(|| sender.calls() == 4).await;

        let page = dispatcher.list_deliveries(id, 1, 10);
        let delivery_id = page.deliveries[0].id;
        wait_until(|| dispatcher.delivery(delivery_id).unwrap().status == DeliveryStatus::Success)
            .await;

        let delivery = dispatcher.delivery(delivery_id).unwrap();
        assert_eq!(delivery.attempts, 4);
        assert_eq!(delivery.http_status, Some(200));

        // Recorded backoff delays grow attempt over attempt.
        let delays: Vec<Duration> = delivery
            .attempt_log
            .iter()
            .filter_map(|a| a.retry_delay)
            .collect();
        assert_eq!(delays.len(), 3);
        assert!(delays[0] < delays[1]);
        assert!(delays[1] < delays[2]);

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_permanent_failure_never_retries() {
        let sender = MockSender::always(404);
        let (dispatcher, org) = dispatcher_with(Arc::clone(&sender));
        let id = dispatcher
            .add_endpoint(endpoint(org, [EventType::RoomCreated]))
            .unwrap();

        dispatcher.handle_event(room_created(org));
        let page = dispatcher.list_deliveries(id, 1, 10);
        wait_until(|| {
            dispatcher.delivery(page.deliveries[0].id).unwrap().status == DeliveryStatus::Failed
        })
        .await;

        let delivery = dispatcher.delivery(page.deliveries[0].id).unwrap();
        assert_eq!(delivery.attempts, 1);
        assert_eq!(sender.calls(), 1);
        assert!(delivery.error.unwrap().contains("HTTP 404"));

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_retry_cap_forces_terminal_failure() {
        let sender = MockSender::always(503);
        let org = Uuid::new_v4();
        let mut config = fast_config();
        config.webhook_retry = RetryPolicy::new(
            Duration::from_millis(2),
            Duration::from_millis(10),
        )
        .with_max_attempts(3)
        .without_jitter();
        let dispatcher = WebhookDispatcher::with_sender(org, config, sender.clone());
        let id = dispatcher
            .add_endpoint(endpoint(org, [EventType::RoomCreated]))
            .unwrap();

        dispatcher.handle_event(room_created(org));
        let page = dispatcher.list_deliveries(id, 1, 10);
        let delivery_id = page.deliveries[0].id;
        wait_until(|| dispatcher.delivery(delivery_id).unwrap().status == DeliveryStatus::Failed)
            .await;

        let delivery = dispatcher.delivery(delivery_id).unwrap();
        assert_eq!(delivery.attempts, 3);
        assert_eq!(sender.calls(), 3);
        assert!(delivery.error.unwrap().contains("retry limit reached"));

        let registered = dispatcher.get_endpoint(id).unwrap();
        assert_eq!(registered.last_delivery_status, Some(DeliveryStatus::Failed));

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_unsubscribed_and_disabled_endpoints_skipped() {
        let sender = MockSender::ok();
        let (dispatcher, org) = dispatcher_with(Arc::clone(&sender));

        // Subscribed to a different event type.
        dispatcher
            .add_endpoint(endpoint(org, [EventType::RecordingCompleted]))
            .unwrap();
        // Subscribed but disabled.
        let mut disabled = endpoint(org, [EventType::RoomCreated]);
        disabled.enabled = false;
        dispatcher.add_endpoint(disabled).unwrap();

        dispatcher.handle_event(room_created(org));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(sender.calls(), 0);

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_event_for_other_organization_ignored() {
        let sender = MockSender::ok();
        let (dispatcher, org) = dispatcher_with(Arc::clone(&sender));
        dispatcher
            .add_endpoint(endpoint(org, [EventType::RoomCreated]))
            .unwrap();

        dispatcher.handle_event(room_created(Uuid::new_v4()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(sender.calls(), 0);

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_fifo_order_within_endpoint() {
        let sender = MockSender::ok();
        // First delivery needs one retry before succeeding.
        sender.push_status(500);
        let (dispatcher, org) = dispatcher_with(Arc::clone(&sender));
        dispatcher
            .add_endpoint(endpoint(
                org,
                [EventType::RoomCreated, EventType::RoomClosed],
            ))
            .unwrap();

        dispatcher.handle_event(room_created(org));
        dispatcher.handle_event(DomainEvent {
            event_type: EventType::RoomClosed,
            organization_id: org,
            room_id: None,
            data: serde_json::Value::Null,
        });

        // 3 sends: created (500), created (200), closed (200) - in order.
        wait_until(|| sender.calls() == 3).await;
        let requests = sender.requests.lock();
        assert!(requests[0].1.contains("room.created"));
        assert!(requests[1].1.contains("room.created"));
        assert!(requests[2].1.contains("room.closed"));
    }

    #[tokio::test]
    async fn test_remove_endpoint_cancels_pending_retry() {
        let sender = MockSender::always(500);
        let org = Uuid::new_v4();
        let mut config = fast_config();
        // Long enough backoff that the removal lands mid-sleep.
        config.webhook_retry = RetryPolicy::new(
            Duration::from_millis(500),
            Duration::from_secs(1),
        )
        .with_max_attempts(8)
        .without_jitter();
        let dispatcher = WebhookDispatcher::with_sender(org, config, sender.clone());
        let id = dispatcher
            .add_endpoint(endpoint(org, [EventType::RoomCreated]))
            .unwrap();

        dispatcher.handle_event(room_created(org));
        wait_until(|| sender.calls() == 1).await;

        let delivery_id = dispatcher.list_deliveries(id, 1, 1).deliveries[0].id;
        wait_until(|| {
            dispatcher.delivery(delivery_id).unwrap().status == DeliveryStatus::Retrying
        })
        .await;

        dispatcher.remove_endpoint(id).await.unwrap();

        // No more attempts fire, and the record is terminal.
        let delivery = dispatcher.delivery(delivery_id).unwrap();
        assert_eq!(delivery.status, DeliveryStatus::Failed);
        assert_eq!(sender.calls(), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sender.calls(), 1);
    }

    #[tokio::test]
    async fn test_update_endpoint_changes_url_and_secret() {
        let sender = MockSender::ok();
        let (dispatcher, org) = dispatcher_with(Arc::clone(&sender));
        let id = dispatcher
            .add_endpoint(endpoint(org, [EventType::RoomCreated]))
            .unwrap();

        dispatcher
            .update_endpoint(
                id,
                UpdateEndpoint {
                    url: Some("https://hooks.example.com/v2".to_string()),
                    secret: Some("rotated".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        dispatcher.handle_event(room_created(org));
        wait_until(|| sender.calls() == 1).await;

        let requests = sender.requests.lock();
        let (url, body, signature) = &requests[0];
        assert_eq!(url, "https://hooks.example.com/v2");
        assert!(verify_signature("rotated", body.as_bytes(), signature));
    }

    #[tokio::test]
    async fn test_add_endpoint_validation() {
        let sender = MockSender::ok();
        let (dispatcher, org) = dispatcher_with(sender);

        let mut bad_url = endpoint(org, [EventType::RoomCreated]);
        bad_url.url = "ftp://example.com".to_string();
        assert!(dispatcher.add_endpoint(bad_url).is_err());

        let mut empty_secret = endpoint(org, [EventType::RoomCreated]);
        empty_secret.secret = String::new();
        assert!(dispatcher.add_endpoint(empty_secret).is_err());

        let other_org = endpoint(Uuid::new_v4(), [EventType::RoomCreated]);
        assert!(dispatcher.add_endpoint(other_org).is_err());
    }

    #[tokio::test]
    async fn test_run_consumes_event_bus() {
        let sender = MockSender::ok();
        let (dispatcher, org) = dispatcher_with(Arc::clone(&sender));
        dispatcher
            .add_endpoint(endpoint(org, [EventType::RoomCreated]))
            .unwrap();

        let dispatcher = Arc::new(dispatcher);
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(Arc::clone(&dispatcher).run(rx));

        tx.send(room_created(org)).await.unwrap();
        tx.send(room_created(org)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        wait_until(|| sender.calls() == 2).await;
        dispatcher.shutdown().await;
    }
}
