//! Per-command verification orchestration.
//!
//! A [`CommandVerificationHandler`] is created for every released command.
//! It resolves the command's verifiers, arms their check windows, listens to
//! the command's history and routes pseudo-parameters to the verifiers, and
//! maps verifier outcomes to acknowledgements and command completion.

use crate::algorithm::{AlgorithmExecutionContext, AlgorithmManager};
use crate::config::{SubscriptionFailurePolicy, VerificationConfig};
use crate::history::{
    command_complete_status_key, verifier_key, AckStatus, CommandHistoryConsumer,
    CommandHistoryPublisher, CommandHistorySubscriptions, COMMAND_COMPLETE_KEY,
};
use crate::mdb::{CommandVerifier, MissionDatabase, TerminationAction, TimeWindowAnchor, VerifierKind};
use crate::observability::{record_command_finalized, record_verifier_outcome};
use crate::prepared::PreparedCommand;
use crate::scheduler::Scheduler;
use crate::telemetry::TelemetryFeed;
use crate::types::{CommandId, ParameterValue, SubscriptionId, Value};
use crate::verifier::{
    AlgorithmEvidence, ContainerEvidence, CriteriaEvidence, Evidence, ValueChangeEvidence,
    Verifier, VerifierId, VerifierState,
};
use crate::{Result, VerifyError};
use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, trace, warn};
use vigil_core::{Validatable, VigilError};

/// Collaborators shared by every handler
#[derive(Clone)]
pub struct VerificationServices {
    pub scheduler: Arc<dyn Scheduler>,
    pub mission_database: Arc<dyn MissionDatabase>,
    pub history_publisher: Arc<dyn CommandHistoryPublisher>,
    pub history_subscriptions: Arc<dyn CommandHistorySubscriptions>,
    /// Required only by algorithm verifiers
    pub algorithm_manager: Option<Arc<dyn AlgorithmManager>>,
    /// Required only by verifiers watching telemetry
    pub telemetry: Option<Arc<dyn TelemetryFeed>>,
    pub config: VerificationConfig,
}

impl VerificationServices {
    pub fn builder() -> VerificationServicesBuilder {
        VerificationServicesBuilder::default()
    }
}

/// Builder for [`VerificationServices`]
#[derive(Default)]
pub struct VerificationServicesBuilder {
    scheduler: Option<Arc<dyn Scheduler>>,
    mission_database: Option<Arc<dyn MissionDatabase>>,
    history_publisher: Option<Arc<dyn CommandHistoryPublisher>>,
    history_subscriptions: Option<Arc<dyn CommandHistorySubscriptions>>,
    algorithm_manager: Option<Arc<dyn AlgorithmManager>>,
    telemetry: Option<Arc<dyn TelemetryFeed>>,
    config: VerificationConfig,
}

impl VerificationServicesBuilder {
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn mission_database(mut self, mission_database: Arc<dyn MissionDatabase>) -> Self {
        self.mission_database = Some(mission_database);
        self
    }

    pub fn history_publisher(mut self, publisher: Arc<dyn CommandHistoryPublisher>) -> Self {
        self.history_publisher = Some(publisher);
        self
    }

    pub fn history_subscriptions(mut self, subscriptions: Arc<dyn CommandHistorySubscriptions>) -> Self {
        self.history_subscriptions = Some(subscriptions);
        self
    }

    /// Use one history service for both publishing and subscriptions
    pub fn command_history<H>(self, history: Arc<H>) -> Self
    where
        H: CommandHistoryPublisher + CommandHistorySubscriptions + 'static,
    {
        self.history_publisher(history.clone())
            .history_subscriptions(history)
    }

    pub fn algorithm_manager(mut self, manager: Arc<dyn AlgorithmManager>) -> Self {
        self.algorithm_manager = Some(manager);
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetryFeed>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn config(mut self, config: VerificationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<VerificationServices> {
        fn missing(what: &str) -> VerifyError {
            VerifyError::Configuration(format!("verification services need a {what}"))
        }

        self.config.validate()?;
        Ok(VerificationServices {
            scheduler: self.scheduler.ok_or_else(|| missing("scheduler"))?,
            mission_database: self
                .mission_database
                .ok_or_else(|| missing("mission database"))?,
            history_publisher: self
                .history_publisher
                .ok_or_else(|| missing("command history publisher"))?,
            history_subscriptions: self
                .history_subscriptions
                .ok_or_else(|| missing("command history subscription service"))?,
            algorithm_manager: self.algorithm_manager,
            telemetry: self.telemetry,
            config: self.config,
        })
    }
}

/// Verification of one released command
pub struct CommandVerificationHandler {
    command: Arc<PreparedCommand>,
    services: VerificationServices,
    verifiers: RwLock<Vec<Arc<Verifier>>>,
    command_parameters: RwLock<Vec<ParameterValue>>,
    algorithm_context: OnceCell<Arc<AlgorithmExecutionContext>>,
    subscription: Mutex<Option<SubscriptionId>>,
    started: AtomicBool,
    finalized: AtomicBool,
    this: Weak<CommandVerificationHandler>,
}

impl CommandVerificationHandler {
    pub fn new(command: Arc<PreparedCommand>, services: VerificationServices) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            command,
            services,
            verifiers: RwLock::new(Vec::new()),
            command_parameters: RwLock::new(Vec::new()),
            algorithm_context: OnceCell::new(),
            subscription: Mutex::new(None),
            started: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    pub fn command_id(&self) -> &CommandId {
        self.command.id()
    }

    pub fn prepared_command(&self) -> &PreparedCommand {
        &self.command
    }

    /// Pseudo-parameters known so far: command attributes, then history
    /// updates in arrival order
    pub fn command_parameters(&self) -> Vec<ParameterValue> {
        self.command_parameters.read().clone()
    }

    /// Verifiers in resolved stage order
    pub fn verifiers(&self) -> Vec<Arc<Verifier>> {
        self.verifiers.read().clone()
    }

    pub fn verifier(&self, stage: &str) -> Option<Arc<Verifier>> {
        self.verifiers
            .read()
            .iter()
            .find(|v| v.stage() == stage)
            .cloned()
    }

    /// Whether the handler still listens to the command history
    pub fn is_subscribed(&self) -> bool {
        self.subscription.lock().is_some()
    }

    /// Whether the command completion has been decided
    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    /// Resolve, construct and arm the command's verifiers.
    ///
    /// Every verifier is constructed and validated before the history
    /// subscription is taken and before anything is scheduled, so an error
    /// leaves nothing running.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(VigilError::invalid_input(format!(
                "verification of {} already started",
                self.command_id()
            ))
            .into());
        }
        info!(command = %self.command_id(), "Starting command verification");

        self.collect_command_parameters();
        let definitions = self.collect_cmd_verifiers();

        if self.command.disable_command_verifiers() {
            info!(command = %self.command_id(), "All verifiers disabled");
            for definition in &definitions {
                self.publish_ack(&verifier_key(definition.stage()), AckStatus::Disabled, None);
            }
            return Ok(());
        }

        let mut built: Vec<Arc<Verifier>> = Vec::with_capacity(definitions.len());
        let mut initial = Vec::new();
        for (index, definition) in definitions.into_iter().enumerate() {
            definition.check_window().validate().map_err(|e| {
                VerifyError::Configuration(format!("stage {}: {e}", definition.stage()))
            })?;
            let evidence = self.build_evidence(&definition)?;
            let verifier = Arc::new(Verifier::new(
                VerifierId(index),
                definition,
                self.this.clone(),
                evidence,
            ));
            let chained = verifier.definition().check_window().relative_to() == TimeWindowAnchor::LastVerifier;
            match built.last() {
                Some(previous) if chained => {
                    previous.link_next(verifier.clone());
                }
                _ => initial.push(verifier.clone()),
            }
            built.push(verifier);
        }

        if built.is_empty() {
            debug!(command = %self.command_id(), "No verifiers to run");
            return Ok(());
        }

        self.subscribe_history()?;
        *self.verifiers.write() = built;

        let armed = initial.iter().try_for_each(|v| self.schedule_verifier(v));
        self.stop_if_settled();
        armed
    }

    /// Unsubscribe from the command history. Idempotent.
    pub fn stop(&self) {
        let subscription = self.subscription.lock().take();
        if let Some(id) = subscription {
            self.services
                .history_subscriptions
                .unsubscribe_command(self.command_id(), id);
            debug!(command = %self.command_id(), "Unsubscribed from command history");
        }
    }

    fn collect_command_parameters(&self) {
        let config = &self.services.config;
        let generation_time = self.command_id().generation_time;
        let values: Vec<_> = self
            .command
            .attributes()
            .iter()
            .filter_map(|attribute| {
                let name = config.command_parameter(&attribute.name);
                match self.services.mission_database.parameter(&name) {
                    Some(parameter) => Some(ParameterValue::new(
                        parameter,
                        attribute.value.clone(),
                        generation_time,
                    )),
                    None => {
                        trace!(parameter = %name, "No pseudo-parameter for attribute");
                        None
                    }
                }
            })
            .collect();
        self.command_parameters.write().extend(values);
    }

    /// Walk the meta-command hierarchy from the most derived command,
    /// keeping the first verifier of each stage and applying overrides
    fn collect_cmd_verifiers(&self) -> Vec<Arc<CommandVerifier>> {
        let mut stages = HashSet::new();
        let mut collected = Vec::new();
        for meta_command in self.command.meta_command().hierarchy() {
            for definition in meta_command.command_verifiers() {
                let stage = definition.stage();
                if !stages.insert(stage.to_string()) {
                    debug!(
                        stage,
                        command = meta_command.qualified_name(),
                        "Stage already defined by a derived command"
                    );
                    continue;
                }
                match self.command.verifier_override(stage) {
                    Some(o) if o.disable => {
                        debug!(stage, "Verifier disabled for this command");
                        self.publish_ack(&verifier_key(stage), AckStatus::Disabled, None);
                    }
                    Some(o) => match o.check_window {
                        Some(window) => {
                            let replaced = definition
                                .check_window()
                                .with_bounds(window.time_to_start, window.time_to_stop);
                            collected.push(Arc::new(definition.with_check_window(replaced)));
                        }
                        None => collected.push(definition.clone()),
                    },
                    None => collected.push(definition.clone()),
                }
            }
        }
        collected
    }

    fn require_telemetry(&self, stage: &str) -> Result<Arc<dyn TelemetryFeed>> {
        self.services.telemetry.clone().ok_or_else(|| {
            error!(stage, "Verifier needs telemetry but no feed is configured");
            VerifyError::TelemetryUnavailable(format!("stage {stage} watches telemetry"))
        })
    }

    fn build_evidence(&self, definition: &CommandVerifier) -> Result<Evidence> {
        let stage = definition.stage();
        let config = &self.services.config;
        let evidence = match &definition.kind {
            VerifierKind::Algorithm { algorithm } => {
                let manager = self.services.algorithm_manager.clone().ok_or_else(|| {
                    error!(stage, "Algorithm verifier without an algorithm subsystem");
                    VerifyError::AlgorithmUnavailable(format!(
                        "stage {stage} runs algorithm {}",
                        algorithm.name()
                    ))
                })?;
                let context = self
                    .algorithm_context
                    .get_or_init(|| manager.create_context(self.command.command_name()))
                    .clone();
                Evidence::Algorithm(AlgorithmEvidence::new(algorithm.clone(), context, manager))
            }
            VerifierKind::Container { container } => Evidence::Container(ContainerEvidence::new(
                container.clone(),
                self.require_telemetry(stage)?,
            )),
            VerifierKind::MatchCriteria { criteria } => {
                let watched: Vec<String> = criteria
                    .referenced_parameters()
                    .into_iter()
                    .filter(|name| !config.is_pseudo_parameter(name))
                    .collect();
                let telemetry = if watched.is_empty() {
                    None
                } else {
                    Some((self.require_telemetry(stage)?, watched))
                };
                Evidence::MatchCriteria(CriteriaEvidence::new(
                    criteria.clone(),
                    self.command.arguments().clone(),
                    telemetry,
                ))
            }
            VerifierKind::ParameterValueChange { parameter, delta } => {
                if !delta.is_finite() || *delta == 0.0 {
                    return Err(VerifyError::Configuration(format!(
                        "stage {stage}: value change delta must be finite and non-zero, got {delta}"
                    )));
                }
                let feed = if config.is_pseudo_parameter(parameter) {
                    None
                } else {
                    Some(self.require_telemetry(stage)?)
                };
                Evidence::ValueChange(ValueChangeEvidence::new(parameter.clone(), *delta, feed))
            }
        };
        Ok(evidence)
    }

    fn subscribe_history(&self) -> Result<()> {
        let consumer: Arc<dyn CommandHistoryConsumer> = self.strong()?;
        match self
            .services
            .history_subscriptions
            .subscribe_command(self.command_id(), consumer)
        {
            Ok(id) => {
                *self.subscription.lock() = Some(id);
                Ok(())
            }
            Err(e) => match self.services.config.subscription_failure {
                SubscriptionFailurePolicy::Abort => {
                    error!(command = %self.command_id(), error = %e, "Cannot subscribe to command history");
                    Err(e)
                }
                SubscriptionFailurePolicy::TimerOnly => {
                    warn!(
                        command = %self.command_id(),
                        error = %e,
                        "Cannot subscribe to command history, verifying without it"
                    );
                    Ok(())
                }
            },
        }
    }

    fn strong(&self) -> Result<Arc<Self>> {
        self.this
            .upgrade()
            .ok_or_else(|| VigilError::internal("verification handler already dropped").into())
    }

    /// Arm the check window of a verifier, measured from now
    fn schedule_verifier(&self, verifier: &Arc<Verifier>) -> Result<()> {
        if self.is_finalized() {
            verifier.cancel();
            return Ok(());
        }
        if !verifier.mark_scheduled() {
            return Ok(());
        }
        let handler = self.strong()?;
        let window = *verifier.definition().check_window();
        let key = verifier_key(verifier.stage());
        let scheduler = &self.services.scheduler;

        // armed first so a verdict reached while starting can cancel it
        let stop_timer = {
            let verifier = verifier.clone();
            let handler = handler.clone();
            scheduler.schedule(
                window.time_to_stop(),
                Box::new(move || {
                    verifier.timeout();
                    drop(handler);
                }),
            )
        };
        verifier.add_timer(stop_timer);

        if window.time_to_start().is_zero() {
            self.publish_ack(&key, AckStatus::Pending, None);
            verifier.start();
        } else {
            self.publish_ack(&key, AckStatus::Scheduled, None);
            let verifier_ref = verifier.clone();
            let start_timer = scheduler.schedule(
                window.time_to_start(),
                Box::new(move || handler.start_scheduled(&verifier_ref)),
            );
            verifier.add_timer(start_timer);
        }
        Ok(())
    }

    fn start_scheduled(&self, verifier: &Arc<Verifier>) {
        if verifier.state() == VerifierState::New {
            self.publish_ack(&verifier_key(verifier.stage()), AckStatus::Pending, None);
            verifier.start();
        }
    }

    /// Called exactly once per verifier, after its terminal transition
    pub(crate) fn on_verifier_finished(&self, verifier: &Verifier, state: VerifierState, failure_reason: Option<String>) {
        let stage = verifier.stage();
        debug!(
            command = %self.command_id(),
            stage,
            %state,
            reason = failure_reason.as_deref().unwrap_or(""),
            "Verifier finished"
        );
        record_verifier_outcome(stage, state);
        if self.services.config.cancel_timers_on_finish {
            verifier.cancel_timers();
        }
        self.publish_ack(&verifier_key(stage), state.into(), failure_reason.as_deref());

        let definition = verifier.definition();
        let action = match state {
            VerifierState::Ok => definition.on_success,
            VerifierState::Nok => definition.on_fail,
            VerifierState::Timeout => definition.on_timeout,
            _ => TerminationAction::Continue,
        };
        match action {
            TerminationAction::Success => self.finalize(None),
            TerminationAction::Fail => {
                let reason = failure_reason.unwrap_or_else(|| format!("Verifier {stage} result: {state}"));
                self.finalize(Some(reason));
            }
            TerminationAction::Continue => {}
        }

        if state == VerifierState::Ok && !self.is_finalized() {
            if let Some(next) = verifier.next() {
                if let Err(e) = self.schedule_verifier(next) {
                    error!(stage = next.stage(), error = %e, "Cannot schedule chained verifier");
                }
            }
        }

        self.stop_if_settled();
    }

    /// Publish the command outcome once, then wind down
    fn finalize(&self, failure: Option<String>) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            debug!(command = %self.command_id(), "Command outcome already published");
            return;
        }
        let now = self.services.scheduler.now();
        let publisher = &self.services.history_publisher;
        match failure {
            None => {
                info!(command = %self.command_id(), "Command completed");
                publisher.publish_ack(self.command_id(), COMMAND_COMPLETE_KEY, now, AckStatus::Ok, None);
                record_command_finalized("completed");
            }
            Some(reason) => {
                warn!(command = %self.command_id(), %reason, "Command failed");
                publisher.command_failed(self.command_id(), now, &reason);
                record_command_finalized("failed");
            }
        }
        self.stop();
        self.cancel_all();
    }

    fn cancel_all(&self) {
        for verifier in self.verifiers() {
            verifier.cancel();
        }
    }

    /// Stop listening once every verifier is terminal. A successor that was
    /// never scheduled keeps the subscription so a later completion can
    /// still cancel it.
    fn stop_if_settled(&self) {
        let verifiers = self.verifiers();
        if !verifiers.is_empty() && verifiers.iter().all(|v| v.state().is_terminal()) {
            debug!(command = %self.command_id(), "All verifiers terminal");
            self.stop();
        }
    }

    fn publish_ack(&self, key: &str, status: AckStatus, message: Option<&str>) {
        self.services.history_publisher.publish_ack(
            self.command_id(),
            key,
            self.services.scheduler.now(),
            status,
            message,
        );
    }
}

impl CommandHistoryConsumer for CommandVerificationHandler {
    fn updated_command(&self, cmd_id: &CommandId, change_time: DateTime<Utc>, key: &str, value: &Value) {
        if cmd_id != self.command_id() {
            return;
        }
        let name = self.services.config.history_parameter(key);
        match self.services.mission_database.parameter(&name) {
            Some(parameter) => {
                let pv = ParameterValue::new(parameter, value.clone(), change_time);
                self.command_parameters.write().push(pv.clone());
                for verifier in self.verifiers() {
                    verifier.updated_command_history_param(&pv);
                }
            }
            None => trace!(parameter = %name, "Ignoring history key without pseudo-parameter"),
        }

        if key == command_complete_status_key() {
            debug!(command = %cmd_id, "Command completed elsewhere, cancelling verifiers");
            self.finalized.store(true, Ordering::SeqCst);
            self.cancel_all();
        }
    }
}

impl std::fmt::Debug for CommandVerificationHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandVerificationHandler")
            .field("command", self.command_id())
            .field("verifiers", &self.verifiers())
            .field("finalized", &self.is_finalized())
            .finish()
    }
}
