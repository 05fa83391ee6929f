//! In-memory delivery history with pagination.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;

use crate::webhook::{DeliveryId, EndpointId, WebhookDelivery};

/// One page of delivery history, newest-first.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryPage {
    /// The requested page of records.
    pub deliveries: Vec<WebhookDelivery>,
    /// Total records for this endpoint across all pages.
    pub total: usize,
    /// The 1-based page number that was returned.
    pub page: usize,
    /// The page size that was applied.
    pub page_size: usize,
}

/// Stores every delivery record for one dispatcher.
///
/// Records are kept for the life of the process; retention and durable
/// persistence are external policies. Workers mutate records in place
/// through [`update`](DeliveryLog::update); readers get clones.
#[derive(Default)]
pub struct DeliveryLog {
    inner: RwLock<LogInner>,
}

#[derive(Default)]
struct LogInner {
    deliveries: HashMap<DeliveryId, WebhookDelivery>,
    /// Insertion order per endpoint; newest last.
    by_endpoint: HashMap<EndpointId, Vec<DeliveryId>>,
}

impl DeliveryLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a freshly created delivery record.
    pub fn insert(&self, delivery: WebhookDelivery) {
        let mut inner = self.inner.write();
        inner
            .by_endpoint
            .entry(delivery.webhook_id)
            .or_default()
            .push(delivery.id);
        inner.deliveries.insert(delivery.id, delivery);
    }

    /// Mutates a record in place, e.g. to record an attempt outcome.
    pub fn update<F>(&self, id: DeliveryId, mutate: F)
    where
        F: FnOnce(&mut WebhookDelivery),
    {
        if let Some(delivery) = self.inner.write().deliveries.get_mut(&id) {
            mutate(delivery);
        }
    }

    /// Returns a copy of one record.
    pub fn get(&self, id: DeliveryId) -> Option<WebhookDelivery> {
        self.inner.read().deliveries.get(&id).cloned()
    }

    /// Total records for one endpoint.
    pub fn count_for(&self, webhook_id: EndpointId) -> usize {
        self.inner
            .read()
            .by_endpoint
            .get(&webhook_id)
            .map_or(0, Vec::len)
    }

    /// Returns one page of an endpoint's history, newest-first.
    ///
    /// `page` is 1-based; out-of-range pages return an empty list with the
    /// correct total.
    pub fn list(&self, webhook_id: EndpointId, page: usize, page_size: usize) -> DeliveryPage {
        let page = page.max(1);
        let page_size = page_size.max(1);

        let inner = self.inner.read();
        let ids = inner.by_endpoint.get(&webhook_id);
        let total = ids.map_or(0, |v| v.len());

        let deliveries = ids
            .map(|ids| {
                ids.iter()
                    .rev()
                    .skip((page - 1) * page_size)
                    .take(page_size)
                    .filter_map(|id| inner.deliveries.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();

        DeliveryPage {
            deliveries,
            total,
            page,
            page_size,
        }
    }
}
