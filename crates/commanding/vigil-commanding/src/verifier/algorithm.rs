use super::{EvidenceRelay, EvidenceSource, Verifier, VerifierState};
use crate::algorithm::{AlgorithmExecutionContext, AlgorithmManager};
use crate::handler::CommandVerificationHandler;
use crate::mdb::Algorithm;
use crate::types::{ParameterValue, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

/// Verdict produced by an algorithm running in the command's shared context
pub(crate) struct AlgorithmEvidence {
    algorithm: Algorithm,
    context: Arc<AlgorithmExecutionContext>,
    manager: Arc<dyn AlgorithmManager>,
    active: AtomicBool,
}

impl AlgorithmEvidence {
    pub(crate) fn new(
        algorithm: Algorithm,
        context: Arc<AlgorithmExecutionContext>,
        manager: Arc<dyn AlgorithmManager>,
    ) -> Self {
        Self {
            algorithm,
            context,
            manager,
            active: AtomicBool::new(false),
        }
    }
}

impl EvidenceSource for AlgorithmEvidence {
    fn bind(&self, verifier: &Arc<Verifier>, handler: &CommandVerificationHandler) {
        let listener = EvidenceRelay::new(verifier);
        if let Err(e) = self
            .manager
            .activate_algorithm(&self.algorithm, &self.context, listener)
        {
            warn!(algorithm = self.algorithm.name(), error = %e, "Cannot activate algorithm");
            verifier.finished(
                false,
                Some(format!("Failed to activate algorithm {}: {e}", self.algorithm.name())),
            );
            return;
        }
        self.active.store(true, Ordering::SeqCst);
        if verifier.state() != VerifierState::Running {
            return;
        }

        self.manager
            .process_arguments(handler.prepared_command().arguments(), &self.context);
        let known = handler.command_parameters();
        if !known.is_empty() {
            self.manager.update_delivery(&known, &self.context);
        }
    }

    fn release(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            self.manager
                .deactivate_algorithm(&self.algorithm, &self.context);
        }
    }

    fn command_history_param(&self, _verifier: &Verifier, value: &ParameterValue) {
        self.manager
            .update_delivery(std::slice::from_ref(value), &self.context);
    }

    fn algorithm_run(&self, verifier: &Verifier, return_value: Option<&Value>) {
        match return_value {
            None => trace!(
                algorithm = self.algorithm.name(),
                "Algorithm ran without a verdict"
            ),
            Some(Value::Bool(ok)) => {
                verifier.finished(*ok, None);
            }
            Some(other) => {
                verifier.finished(false, Some(other.to_string()));
            }
        }
    }

    fn algorithm_error(&self, verifier: &Verifier, message: &str) {
        verifier.finished(
            false,
            Some(format!("Algorithm {} failed: {message}", self.algorithm.name())),
        );
    }
}
