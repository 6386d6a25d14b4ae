//! Telemetry feed used by container, match-criteria and value-change verifiers.

use crate::types::{ParameterValue, SubscriptionId};
use crate::Result;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Receiver of telemetry deliveries
pub trait TelemetryConsumer: Send + Sync {
    /// A subscribed container arrived
    fn container_received(&self, container: &str, time: DateTime<Utc>) {
        let _ = (container, time);
    }

    /// New values of subscribed parameters
    fn parameters_received(&self, values: &[ParameterValue]) {
        let _ = values;
    }
}

/// Source of telemetry
pub trait TelemetryFeed: Send + Sync {
    fn subscribe_container(&self, container: &str, consumer: Arc<dyn TelemetryConsumer>) -> Result<SubscriptionId>;

    fn subscribe_parameters(
        &self,
        parameters: &[String],
        consumer: Arc<dyn TelemetryConsumer>,
    ) -> Result<SubscriptionId>;

    fn unsubscribe(&self, subscription: SubscriptionId);
}

enum Interest {
    Container(String),
    Parameters(BTreeSet<String>),
}

/// In-process feed. Publishing delivers synchronously to matching
/// subscribers on the calling thread.
#[derive(Default)]
pub struct InMemoryTelemetryFeed {
    subscriptions: RwLock<HashMap<SubscriptionId, (Interest, Arc<dyn TelemetryConsumer>)>>,
    next_id: AtomicU64,
}

impl InMemoryTelemetryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn publish_container(&self, container: &str, time: DateTime<Utc>) {
        let targets: Vec<_> = self
            .subscriptions
            .read()
            .values()
            .filter(|(interest, _)| matches!(interest, Interest::Container(name) if name == container))
            .map(|(_, consumer)| consumer.clone())
            .collect();
        trace!(container, subscribers = targets.len(), "Container published");
        for consumer in targets {
            consumer.container_received(container, time);
        }
    }

    pub fn publish_parameters(&self, values: &[ParameterValue]) {
        let deliveries: Vec<_> = self
            .subscriptions
            .read()
            .values()
            .filter_map(|(interest, consumer)| match interest {
                Interest::Parameters(names) => {
                    let matching: Vec<_> = values
                        .iter()
                        .filter(|pv| names.contains(pv.qualified_name()))
                        .cloned()
                        .collect();
                    (!matching.is_empty()).then(|| (consumer.clone(), matching))
                }
                Interest::Container(_) => None,
            })
            .collect();
        for (consumer, matching) in deliveries {
            consumer.parameters_received(&matching);
        }
    }

    fn insert(&self, interest: Interest, consumer: Arc<dyn TelemetryConsumer>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.write().insert(id, (interest, consumer));
        id
    }
}

impl TelemetryFeed for InMemoryTelemetryFeed {
    fn subscribe_container(&self, container: &str, consumer: Arc<dyn TelemetryConsumer>) -> Result<SubscriptionId> {
        Ok(self.insert(Interest::Container(container.to_string()), consumer))
    }

    fn subscribe_parameters(
        &self,
        parameters: &[String],
        consumer: Arc<dyn TelemetryConsumer>,
    ) -> Result<SubscriptionId> {
        Ok(self.insert(
            Interest::Parameters(parameters.iter().cloned().collect()),
            consumer,
        ))
    }

    fn unsubscribe(&self, subscription: SubscriptionId) {
        self.subscriptions.write().remove(&subscription);
    }
}
