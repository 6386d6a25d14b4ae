//! Verifier state machine.
//!
//! Every verifier moves `NEW -> RUNNING -> {OK | NOK}`, or to `TIMEOUT` or
//! `CANCELLED` from either non-terminal state. The terminal check-and-set
//! happens under a per-verifier mutex, so racing timers, telemetry and
//! algorithm callbacks produce exactly one outcome. Resources bound by the
//! evidence kind are released on every terminal transition.

mod algorithm;
mod container;
mod match_criteria;
mod value_change;

pub(crate) use algorithm::AlgorithmEvidence;
pub(crate) use container::ContainerEvidence;
pub(crate) use match_criteria::CriteriaEvidence;
pub(crate) use value_change::ValueChangeEvidence;

use crate::algorithm::AlgorithmExecListener;
use crate::handler::CommandVerificationHandler;
use crate::history::AckStatus;
use crate::mdb::{CommandVerifier, VerifierType};
use crate::scheduler::TimerHandle;
use crate::telemetry::TelemetryConsumer;
use crate::types::{ParameterValue, Value};
use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// Lifecycle state of a verifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerifierState {
    New,
    Running,
    Ok,
    Nok,
    Timeout,
    Cancelled,
    Disabled,
}

impl VerifierState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, VerifierState::New | VerifierState::Running)
    }
}

impl fmt::Display for VerifierState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VerifierState::New => "NEW",
            VerifierState::Running => "RUNNING",
            VerifierState::Ok => "OK",
            VerifierState::Nok => "NOK",
            VerifierState::Timeout => "TIMEOUT",
            VerifierState::Cancelled => "CANCELLED",
            VerifierState::Disabled => "DISABLED",
        })
    }
}

impl From<VerifierState> for AckStatus {
    fn from(state: VerifierState) -> Self {
        match state {
            VerifierState::New | VerifierState::Running => AckStatus::Pending,
            VerifierState::Ok => AckStatus::Ok,
            VerifierState::Nok => AckStatus::Nok,
            VerifierState::Timeout => AckStatus::Timeout,
            VerifierState::Cancelled => AckStatus::Cancelled,
            VerifierState::Disabled => AckStatus::Disabled,
        }
    }
}

/// Position of a verifier in its handler's resolved stage order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VerifierId(pub usize);

impl fmt::Display for VerifierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Hooks implemented by each kind of evidence
pub(crate) trait EvidenceSource: Send + Sync {
    /// Attach to the evidence once the verifier is running
    fn bind(&self, verifier: &Arc<Verifier>, handler: &CommandVerificationHandler);

    /// Detach from the evidence. Idempotent.
    fn release(&self);

    fn command_history_param(&self, _verifier: &Verifier, _value: &ParameterValue) {}

    fn container_received(&self, _verifier: &Verifier, _container: &str, _time: DateTime<Utc>) {}

    fn parameters_received(&self, _verifier: &Verifier, _values: &[ParameterValue]) {}

    fn algorithm_run(&self, _verifier: &Verifier, _return_value: Option<&Value>) {}

    fn algorithm_error(&self, _verifier: &Verifier, _message: &str) {}
}

pub(crate) enum Evidence {
    Algorithm(AlgorithmEvidence),
    Container(ContainerEvidence),
    MatchCriteria(CriteriaEvidence),
    ValueChange(ValueChangeEvidence),
}

impl Evidence {
    fn source(&self) -> &dyn EvidenceSource {
        match self {
            Evidence::Algorithm(e) => e,
            Evidence::Container(e) => e,
            Evidence::MatchCriteria(e) => e,
            Evidence::ValueChange(e) => e,
        }
    }
}

/// Runtime instance of one [`CommandVerifier`] for one command
pub struct Verifier {
    id: VerifierId,
    definition: Arc<CommandVerifier>,
    handler: Weak<CommandVerificationHandler>,
    state: Mutex<VerifierState>,
    scheduled: AtomicBool,
    next: OnceCell<Arc<Verifier>>,
    timers: Mutex<Vec<TimerHandle>>,
    evidence: Evidence,
}

impl Verifier {
    pub(crate) fn new(
        id: VerifierId,
        definition: Arc<CommandVerifier>,
        handler: Weak<CommandVerificationHandler>,
        evidence: Evidence,
    ) -> Self {
        Self {
            id,
            definition,
            handler,
            state: Mutex::new(VerifierState::New),
            scheduled: AtomicBool::new(false),
            next: OnceCell::new(),
            timers: Mutex::new(Vec::new()),
            evidence,
        }
    }

    pub fn id(&self) -> VerifierId {
        self.id
    }

    pub fn stage(&self) -> &str {
        self.definition.stage()
    }

    pub fn definition(&self) -> &Arc<CommandVerifier> {
        &self.definition
    }

    pub fn verifier_type(&self) -> VerifierType {
        self.definition.kind.verifier_type()
    }

    pub fn state(&self) -> VerifierState {
        *self.state.lock()
    }

    /// Successor started when this verifier succeeds
    pub fn next(&self) -> Option<&Arc<Verifier>> {
        self.next.get()
    }

    pub(crate) fn link_next(&self, next: Arc<Verifier>) -> bool {
        self.next.set(next).is_ok()
    }

    /// Claim the right to schedule this verifier. True only the first time.
    pub(crate) fn mark_scheduled(&self) -> bool {
        !self.scheduled.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn add_timer(&self, timer: TimerHandle) {
        self.timers.lock().push(timer);
    }

    pub(crate) fn cancel_timers(&self) {
        let timers = std::mem::take(&mut *self.timers.lock());
        for timer in timers {
            timer.cancel();
        }
    }

    fn handler(&self) -> Option<Arc<CommandVerificationHandler>> {
        self.handler.upgrade()
    }

    /// NEW -> RUNNING, then bind the evidence
    pub(crate) fn start(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if *state != VerifierState::New {
                trace!(stage = self.stage(), state = %*state, "Not starting verifier");
                return;
            }
            *state = VerifierState::Running;
        }
        let Some(handler) = self.handler() else {
            return;
        };
        debug!(
            command = %handler.command_id(),
            stage = self.stage(),
            kind = %self.verifier_type(),
            "Starting verifier"
        );

        let source = self.evidence.source();
        source.bind(self, &handler);
        // may have gone terminal while binding
        if self.state().is_terminal() {
            source.release();
        }
    }

    /// RUNNING -> OK or NOK
    pub(crate) fn finished(&self, success: bool, failure_reason: Option<String>) -> bool {
        let target = if success {
            VerifierState::Ok
        } else {
            VerifierState::Nok
        };
        self.terminate(&[VerifierState::Running], target, failure_reason)
    }

    /// NEW or RUNNING -> TIMEOUT
    pub(crate) fn timeout(&self) -> bool {
        self.terminate(
            &[VerifierState::New, VerifierState::Running],
            VerifierState::Timeout,
            None,
        )
    }

    /// NEW or RUNNING -> CANCELLED
    pub(crate) fn cancel(&self) -> bool {
        self.terminate(
            &[VerifierState::New, VerifierState::Running],
            VerifierState::Cancelled,
            None,
        )
    }

    fn terminate(&self, from: &[VerifierState], target: VerifierState, failure_reason: Option<String>) -> bool {
        let previous = {
            let mut state = self.state.lock();
            if !from.contains(&*state) {
                trace!(stage = self.stage(), state = %*state, %target, "Ignoring transition");
                return false;
            }
            std::mem::replace(&mut *state, target)
        };
        if previous == VerifierState::Running {
            self.evidence.source().release();
        }
        if let Some(handler) = self.handler() {
            handler.on_verifier_finished(self, target, failure_reason);
        }
        true
    }

    pub(crate) fn updated_command_history_param(&self, value: &ParameterValue) {
        if self.state() == VerifierState::Running {
            self.evidence.source().command_history_param(self, value);
        }
    }
}

impl fmt::Debug for Verifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Verifier")
            .field("id", &self.id)
            .field("stage", &self.stage())
            .field("kind", &self.verifier_type())
            .field("state", &self.state())
            .finish()
    }
}

/// Listener handed to collaborators. Deliveries reach the verifier only
/// while it is running.
pub(crate) struct EvidenceRelay {
    verifier: Weak<Verifier>,
}

impl EvidenceRelay {
    pub(crate) fn new(verifier: &Arc<Verifier>) -> Arc<Self> {
        Arc::new(Self {
            verifier: Arc::downgrade(verifier),
        })
    }

    fn running(&self) -> Option<Arc<Verifier>> {
        self.verifier
            .upgrade()
            .filter(|v| v.state() == VerifierState::Running)
    }
}

impl TelemetryConsumer for EvidenceRelay {
    fn container_received(&self, container: &str, time: DateTime<Utc>) {
        if let Some(verifier) = self.running() {
            verifier
                .evidence
                .source()
                .container_received(&verifier, container, time);
        }
    }

    fn parameters_received(&self, values: &[ParameterValue]) {
        if let Some(verifier) = self.running() {
            verifier.evidence.source().parameters_received(&verifier, values);
        }
    }
}

impl AlgorithmExecListener for EvidenceRelay {
    fn algorithm_run(&self, _inputs: &[ParameterValue], return_value: Option<&Value>, _outputs: &[ParameterValue]) {
        if let Some(verifier) = self.running() {
            verifier.evidence.source().algorithm_run(&verifier, return_value);
        }
    }

    fn algorithm_error(&self, message: &str) {
        if let Some(verifier) = self.running() {
            verifier.evidence.source().algorithm_error(&verifier, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mdb::{CheckWindow, VerifierKind};
    use crate::telemetry::InMemoryTelemetryFeed;
    use proptest::prelude::*;
    use std::time::Duration;

    fn detached_verifier(feed: Arc<InMemoryTelemetryFeed>) -> Arc<Verifier> {
        let definition = Arc::new(CommandVerifier::new(
            "Execution",
            VerifierKind::Container {
                container: "/sc/hk".into(),
            },
            CheckWindow::immediate(Duration::from_secs(1)),
        ));
        Arc::new(Verifier::new(
            VerifierId(0),
            definition,
            Weak::new(),
            Evidence::Container(ContainerEvidence::new("/sc/hk".into(), feed)),
        ))
    }

    #[derive(Debug, Clone, Copy)]
    enum Event {
        Finished(bool),
        Timeout,
        Cancel,
    }

    fn event() -> impl Strategy<Value = Event> {
        prop_oneof![
            any::<bool>().prop_map(Event::Finished),
            Just(Event::Timeout),
            Just(Event::Cancel),
        ]
    }

    #[test]
    fn test_finished_requires_running() {
        let verifier = detached_verifier(Arc::new(InMemoryTelemetryFeed::new()));
        assert!(!verifier.finished(true, None));
        assert_eq!(verifier.state(), VerifierState::New);
        assert!(verifier.timeout());
        assert_eq!(verifier.state(), VerifierState::Timeout);
        assert!(!verifier.cancel());
    }

    #[test]
    fn test_ack_status_mapping() {
        assert_eq!(AckStatus::from(VerifierState::Running), AckStatus::Pending);
        assert_eq!(AckStatus::from(VerifierState::Timeout), AckStatus::Timeout);
        assert_eq!(VerifierState::Nok.to_string(), "NOK");
        assert!(VerifierState::Disabled.is_terminal());
        assert!(!VerifierState::Running.is_terminal());
    }

    proptest! {
        #[test]
        fn prop_first_terminal_transition_wins(events in proptest::collection::vec(event(), 1..12)) {
            let verifier = detached_verifier(Arc::new(InMemoryTelemetryFeed::new()));
            *verifier.state.lock() = VerifierState::Running;

            let mut accepted = 0;
            let mut first = None;
            for event in &events {
                let applied = match event {
                    Event::Finished(ok) => verifier.finished(*ok, None),
                    Event::Timeout => verifier.timeout(),
                    Event::Cancel => verifier.cancel(),
                };
                if applied {
                    accepted += 1;
                    first.get_or_insert(*event);
                }
            }

            prop_assert_eq!(accepted, 1);
            let expected = match first.unwrap() {
                Event::Finished(true) => VerifierState::Ok,
                Event::Finished(false) => VerifierState::Nok,
                Event::Timeout => VerifierState::Timeout,
                Event::Cancel => VerifierState::Cancelled,
            };
            prop_assert_eq!(verifier.state(), expected);
        }
    }

    #[test]
    fn test_racing_threads_yield_one_transition() {
        for _ in 0..50 {
            let verifier = detached_verifier(Arc::new(InMemoryTelemetryFeed::new()));
            *verifier.state.lock() = VerifierState::Running;

            let handles: Vec<_> = (0..4)
                .map(|i| {
                    let verifier = verifier.clone();
                    std::thread::spawn(move || match i {
                        0 => verifier.finished(true, None),
                        1 => verifier.finished(false, Some("late".into())),
                        2 => verifier.timeout(),
                        _ => verifier.cancel(),
                    })
                })
                .collect();
            let accepted = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|applied| *applied)
                .count();
            assert_eq!(accepted, 1);
            assert!(verifier.state().is_terminal());
        }
    }
}
