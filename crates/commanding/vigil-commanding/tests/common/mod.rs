//! Shared fixtures for the verification integration tests

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vigil_commanding::{
    AckRecord, AckStatus, Algorithm, AlgorithmExecListener, AlgorithmExecutionContext,
    AlgorithmManager, ArgumentAssignment, CommandId, CommandVerificationHandler,
    InMemoryCommandHistory, InMemoryMissionDatabase, InMemoryTelemetryFeed, ManualScheduler,
    MetaCommand, Parameter, ParameterValue, PreparedCommand, PreparedCommandBuilder, Scheduler,
    VerificationConfig, VerificationServices, Value,
};

pub const ACK_SENT: &str = "/sys/cmdHist/Acknowledge_Sent_Status";
pub const USERNAME: &str = "/sys/cmd/username";
pub const BATTERY: &str = "/sc/battery_voltage";
pub const MODE: &str = "/sc/mode";

/// Algorithm subsystem double: keeps listeners so tests decide when and how
/// algorithms run
#[derive(Default)]
pub struct ScriptedAlgorithms {
    listeners: Mutex<HashMap<String, Arc<dyn AlgorithmExecListener>>>,
    deliveries: Mutex<Vec<String>>,
    arguments: Mutex<Vec<ArgumentAssignment>>,
    contexts: AtomicUsize,
    deactivations: AtomicUsize,
}

impl ScriptedAlgorithms {
    /// Deliver a run of `algorithm`; false when it is not active
    pub fn run(&self, algorithm: &str, verdict: Option<Value>) -> bool {
        let listener = self.listeners.lock().get(algorithm).cloned();
        match listener {
            Some(listener) => {
                listener.algorithm_run(&[], verdict.as_ref(), &[]);
                true
            }
            None => false,
        }
    }

    pub fn fail(&self, algorithm: &str, message: &str) -> bool {
        let listener = self.listeners.lock().get(algorithm).cloned();
        listener.map(|l| l.algorithm_error(message)).is_some()
    }

    pub fn is_active(&self, algorithm: &str) -> bool {
        self.listeners.lock().contains_key(algorithm)
    }

    pub fn contexts_created(&self) -> usize {
        self.contexts.load(Ordering::SeqCst)
    }

    pub fn deactivations(&self) -> usize {
        self.deactivations.load(Ordering::SeqCst)
    }

    /// Qualified names of every delivered parameter, in order
    pub fn delivered(&self) -> Vec<String> {
        self.deliveries.lock().clone()
    }

    pub fn arguments(&self) -> Vec<ArgumentAssignment> {
        self.arguments.lock().clone()
    }
}

impl AlgorithmManager for ScriptedAlgorithms {
    fn create_context(&self, name: &str) -> Arc<AlgorithmExecutionContext> {
        self.contexts.fetch_add(1, Ordering::SeqCst);
        Arc::new(AlgorithmExecutionContext::new(name))
    }

    fn activate_algorithm(
        &self,
        algorithm: &Algorithm,
        _context: &AlgorithmExecutionContext,
        listener: Arc<dyn AlgorithmExecListener>,
    ) -> vigil_commanding::Result<()> {
        self.listeners
            .lock()
            .insert(algorithm.name().to_string(), listener);
        Ok(())
    }

    fn deactivate_algorithm(&self, algorithm: &Algorithm, _context: &AlgorithmExecutionContext) {
        if self.listeners.lock().remove(algorithm.name()).is_some() {
            self.deactivations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn process_arguments(&self, arguments: &ArgumentAssignment, _context: &AlgorithmExecutionContext) {
        self.arguments.lock().push(arguments.clone());
    }

    fn update_delivery(&self, values: &[ParameterValue], _context: &AlgorithmExecutionContext) {
        self.deliveries
            .lock()
            .extend(values.iter().map(|pv| pv.qualified_name().to_string()));
    }
}

pub struct Fixture {
    pub clock: Arc<ManualScheduler>,
    pub scheduler: Arc<dyn Scheduler>,
    pub history: Arc<InMemoryCommandHistory>,
    pub telemetry: Arc<InMemoryTelemetryFeed>,
    pub mdb: Arc<InMemoryMissionDatabase>,
    pub algorithms: Arc<ScriptedAlgorithms>,
    pub config: VerificationConfig,
    next_seq: AtomicUsize,
}

impl Fixture {
    pub fn new() -> Self {
        let clock = Arc::new(ManualScheduler::new());
        Self::with_scheduler(clock.clone(), clock)
    }

    /// Fixture whose handlers run on `scheduler`; `clock` is only advanced by tests
    pub fn with_scheduler(clock: Arc<ManualScheduler>, scheduler: Arc<dyn Scheduler>) -> Self {
        vigil_core::init_test_tracing("vigil_commanding=debug");

        let mdb = Arc::new(InMemoryMissionDatabase::new());
        for name in [ACK_SENT, USERNAME, BATTERY, MODE] {
            mdb.add_parameter(Parameter::new(name));
        }

        Self {
            clock,
            scheduler,
            history: Arc::new(InMemoryCommandHistory::new()),
            telemetry: Arc::new(InMemoryTelemetryFeed::new()),
            mdb,
            algorithms: Arc::new(ScriptedAlgorithms::default()),
            config: VerificationConfig::default(),
            next_seq: AtomicUsize::new(1),
        }
    }

    pub fn services(&self) -> VerificationServices {
        VerificationServices::builder()
            .scheduler(self.scheduler.clone())
            .mission_database(self.mdb.clone())
            .command_history(self.history.clone())
            .algorithm_manager(self.algorithms.clone())
            .telemetry(self.telemetry.clone())
            .config(self.config.clone())
            .build()
            .unwrap()
    }

    /// Fresh command id, registered with the history
    pub fn command_id(&self, meta_command: &MetaCommand) -> CommandId {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) as u32;
        let id = CommandId::new(meta_command.qualified_name(), "test", seq, self.scheduler.now());
        self.history.add_command(&id);
        id
    }

    pub fn prepare(&self, meta_command: Arc<MetaCommand>) -> PreparedCommandBuilder {
        let id = self.command_id(&meta_command);
        PreparedCommandBuilder::new(id, meta_command)
    }

    pub fn handler(&self, command: PreparedCommand) -> Arc<CommandVerificationHandler> {
        CommandVerificationHandler::new(Arc::new(command), self.services())
    }

    /// Prepare, create and start a handler with default command settings
    pub fn start(&self, meta_command: Arc<MetaCommand>) -> (CommandId, Arc<CommandVerificationHandler>) {
        let command = self.prepare(meta_command).build();
        let id = command.id().clone();
        let handler = self.handler(command);
        handler.start().unwrap();
        (id, handler)
    }

    pub fn advance_ms(&self, ms: u64) {
        self.clock.advance(Duration::from_millis(ms));
    }

    pub fn publish(&self, parameter: &str, value: impl Into<Value>) {
        let pv = ParameterValue::new(
            Arc::new(Parameter::new(parameter)),
            value.into(),
            self.scheduler.now(),
        );
        self.telemetry.publish_parameters(&[pv]);
    }

    pub fn statuses(&self, id: &CommandId, stage: &str) -> Vec<AckStatus> {
        self.history.ack_statuses(id, &format!("Verifier_{stage}"))
    }

    pub fn stage_acks(&self, id: &CommandId, stage: &str) -> Vec<AckRecord> {
        let key = format!("Verifier_{stage}");
        self.history
            .acks(id)
            .into_iter()
            .filter(|ack| ack.key == key)
            .collect()
    }

    /// Milliseconds between the command's release and an acknowledgement
    pub fn offset_ms(&self, id: &CommandId, ack: &AckRecord) -> i64 {
        (ack.time - id.generation_time).num_milliseconds()
    }
}
