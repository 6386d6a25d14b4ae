//! Verification counters.

use crate::verifier::VerifierState;

pub(crate) const VERIFIER_OUTCOMES: &str = "vigil_verifier_outcomes_total";
pub(crate) const COMMANDS_FINALIZED: &str = "vigil_commands_finalized_total";

pub(crate) fn record_verifier_outcome(stage: &str, state: VerifierState) {
    metrics::counter!(
        VERIFIER_OUTCOMES,
        "stage" => stage.to_string(),
        "state" => state.to_string()
    )
    .increment(1);
}

pub(crate) fn record_command_finalized(outcome: &'static str) {
    metrics::counter!(COMMANDS_FINALIZED, "outcome" => outcome).increment(1);
}
