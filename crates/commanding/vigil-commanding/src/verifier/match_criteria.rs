use super::{EvidenceRelay, EvidenceSource, Verifier, VerifierState};
use crate::criteria::MatchCriteria;
use crate::handler::CommandVerificationHandler;
use crate::telemetry::TelemetryFeed;
use crate::types::{ArgumentAssignment, ParameterValue, SubscriptionId, Value};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// Succeeds once the criteria hold over the latest known values
pub(crate) struct CriteriaEvidence {
    criteria: MatchCriteria,
    arguments: ArgumentAssignment,
    /// Feed plus the telemetry parameters to subscribe to, when any are referenced
    telemetry: Option<(Arc<dyn TelemetryFeed>, Vec<String>)>,
    view: Mutex<HashMap<String, Value>>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl CriteriaEvidence {
    pub(crate) fn new(
        criteria: MatchCriteria,
        arguments: ArgumentAssignment,
        telemetry: Option<(Arc<dyn TelemetryFeed>, Vec<String>)>,
    ) -> Self {
        Self {
            criteria,
            arguments,
            telemetry,
            view: Mutex::new(HashMap::new()),
            subscription: Mutex::new(None),
        }
    }

    fn observe<'a>(&self, verifier: &Verifier, values: impl IntoIterator<Item = &'a ParameterValue>) {
        {
            let mut view = self.view.lock();
            for pv in values {
                view.insert(pv.qualified_name().to_string(), pv.eng_value.clone());
            }
        }
        self.check(verifier);
    }

    fn check(&self, verifier: &Verifier) {
        let outcome = {
            let view = self.view.lock();
            self.criteria.evaluate(&view, &self.arguments)
        };
        match outcome {
            Ok(true) => {
                verifier.finished(true, None);
            }
            Ok(false) => trace!(stage = verifier.stage(), "Criteria not met yet"),
            Err(e) => {
                verifier.finished(false, Some(e.to_string()));
            }
        }
    }
}

impl EvidenceSource for CriteriaEvidence {
    fn bind(&self, verifier: &Arc<Verifier>, handler: &CommandVerificationHandler) {
        self.observe(verifier, &handler.command_parameters());
        if verifier.state() != VerifierState::Running {
            return;
        }

        if let Some((feed, parameters)) = &self.telemetry {
            match feed.subscribe_parameters(parameters, EvidenceRelay::new(verifier)) {
                Ok(id) => *self.subscription.lock() = Some(id),
                Err(e) => {
                    verifier.finished(false, Some(format!("Cannot subscribe to parameters: {e}")));
                }
            }
        }
    }

    fn release(&self) {
        let subscription = self.subscription.lock().take();
        if let (Some(id), Some((feed, _))) = (subscription, &self.telemetry) {
            feed.unsubscribe(id);
        }
    }

    fn command_history_param(&self, verifier: &Verifier, value: &ParameterValue) {
        self.observe(verifier, std::iter::once(value));
    }

    fn parameters_received(&self, verifier: &Verifier, values: &[ParameterValue]) {
        self.observe(verifier, values);
    }
}
