use super::{EvidenceSource, Verifier, EvidenceRelay};
use crate::handler::CommandVerificationHandler;
use crate::telemetry::TelemetryFeed;
use crate::types::{ParameterValue, SubscriptionId, Value};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

/// Succeeds once a numeric parameter has moved by `delta` from the first
/// value seen after start
pub(crate) struct ValueChangeEvidence {
    parameter: String,
    delta: f64,
    /// `None` for command-history pseudo-parameters, which are pushed by the handler
    feed: Option<Arc<dyn TelemetryFeed>>,
    reference: Mutex<Option<f64>>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl ValueChangeEvidence {
    pub(crate) fn new(parameter: String, delta: f64, feed: Option<Arc<dyn TelemetryFeed>>) -> Self {
        Self {
            parameter,
            delta,
            feed,
            reference: Mutex::new(None),
            subscription: Mutex::new(None),
        }
    }

    fn reached(&self, reference: f64, current: f64) -> bool {
        let change = current - reference;
        if self.delta > 0.0 {
            change >= self.delta
        } else {
            change <= self.delta
        }
    }

    fn observe(&self, verifier: &Verifier, value: &Value) {
        let Some(current) = value.as_f64() else {
            verifier.finished(
                false,
                Some(format!(
                    "Parameter {} has non-numeric value {value}",
                    self.parameter
                )),
            );
            return;
        };
        let reached = {
            let mut reference = self.reference.lock();
            match *reference {
                None => {
                    *reference = Some(current);
                    false
                }
                Some(initial) => self.reached(initial, current),
            }
        };
        if reached {
            verifier.finished(true, None);
        } else {
            trace!(parameter = %self.parameter, current, "Change not reached yet");
        }
    }
}

impl EvidenceSource for ValueChangeEvidence {
    fn bind(&self, verifier: &Arc<Verifier>, _handler: &CommandVerificationHandler) {
        let Some(feed) = &self.feed else {
            return;
        };
        match feed.subscribe_parameters(
            std::slice::from_ref(&self.parameter),
            EvidenceRelay::new(verifier),
        ) {
            Ok(id) => *self.subscription.lock() = Some(id),
            Err(e) => {
                verifier.finished(
                    false,
                    Some(format!("Cannot subscribe to {}: {e}", self.parameter)),
                );
            }
        }
    }

    fn release(&self) {
        let subscription = self.subscription.lock().take();
        if let (Some(id), Some(feed)) = (subscription, &self.feed) {
            feed.unsubscribe(id);
        }
    }

    fn command_history_param(&self, verifier: &Verifier, value: &ParameterValue) {
        if value.qualified_name() == self.parameter {
            self.observe(verifier, &value.eng_value);
        }
    }

    fn parameters_received(&self, verifier: &Verifier, values: &[ParameterValue]) {
        for pv in values.iter().filter(|pv| pv.qualified_name() == self.parameter) {
            self.observe(verifier, &pv.eng_value);
        }
    }
}
