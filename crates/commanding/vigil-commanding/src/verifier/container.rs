use super::{EvidenceRelay, EvidenceSource, Verifier};
use crate::handler::CommandVerificationHandler;
use crate::telemetry::TelemetryFeed;
use crate::types::SubscriptionId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Succeeds on the first arrival of a telemetry container
pub(crate) struct ContainerEvidence {
    container: String,
    feed: Arc<dyn TelemetryFeed>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl ContainerEvidence {
    pub(crate) fn new(container: String, feed: Arc<dyn TelemetryFeed>) -> Self {
        Self {
            container,
            feed,
            subscription: Mutex::new(None),
        }
    }
}

impl EvidenceSource for ContainerEvidence {
    fn bind(&self, verifier: &Arc<Verifier>, _handler: &CommandVerificationHandler) {
        match self
            .feed
            .subscribe_container(&self.container, EvidenceRelay::new(verifier))
        {
            Ok(id) => *self.subscription.lock() = Some(id),
            Err(e) => {
                verifier.finished(
                    false,
                    Some(format!("Cannot subscribe to container {}: {e}", self.container)),
                );
            }
        }
    }

    fn release(&self) {
        let subscription = self.subscription.lock().take();
        if let Some(id) = subscription {
            self.feed.unsubscribe(id);
        }
    }

    fn container_received(&self, verifier: &Verifier, container: &str, time: DateTime<Utc>) {
        debug!(stage = verifier.stage(), container, %time, "Container received");
        verifier.finished(true, None);
    }
}
