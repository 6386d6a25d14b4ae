//! Mission database definitions: meta-commands and their verifiers.
//!
//! A [`MetaCommand`] may derive from a base command and inherits every
//! verifier the base defines. Definitions can be built in code or loaded from
//! TOML/JSON documents through [`InMemoryMissionDatabase`].

use crate::criteria::MatchCriteria;
use crate::types::Parameter;
use crate::{Result, VerifyError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use vigil_core::{ConfigFormat, Validatable, VigilError, VigilResult};

/// Durations are written as integer milliseconds in definition files
pub(crate) mod serde_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// What a check window is measured from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeWindowAnchor {
    /// Release of the command
    #[default]
    CommandRelease,
    /// Successful completion of the preceding verifier
    LastVerifier,
}

/// Time interval during which a verifier may collect evidence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckWindow {
    #[serde(default, rename = "time_to_start_ms", with = "serde_millis")]
    time_to_start: Duration,
    #[serde(rename = "time_to_stop_ms", with = "serde_millis")]
    time_to_stop: Duration,
    #[serde(default)]
    relative_to: TimeWindowAnchor,
}

impl CheckWindow {
    pub fn new(time_to_start: Duration, time_to_stop: Duration, relative_to: TimeWindowAnchor) -> Self {
        Self {
            time_to_start,
            time_to_stop,
            relative_to,
        }
    }

    /// Window opening at command release
    pub fn immediate(time_to_stop: Duration) -> Self {
        Self::new(Duration::ZERO, time_to_stop, TimeWindowAnchor::CommandRelease)
    }

    /// Window opening when the preceding verifier succeeds
    pub fn after_last_verifier(time_to_start: Duration, time_to_stop: Duration) -> Self {
        Self::new(time_to_start, time_to_stop, TimeWindowAnchor::LastVerifier)
    }

    pub fn time_to_start(&self) -> Duration {
        self.time_to_start
    }

    pub fn time_to_stop(&self) -> Duration {
        self.time_to_stop
    }

    pub fn relative_to(&self) -> TimeWindowAnchor {
        self.relative_to
    }

    /// Same anchor, new bounds
    pub fn with_bounds(&self, time_to_start: Duration, time_to_stop: Duration) -> Self {
        Self::new(time_to_start, time_to_stop, self.relative_to)
    }
}

impl Validatable for CheckWindow {
    fn validate(&self) -> VigilResult<()> {
        if self.time_to_stop.is_zero() {
            return Err(VigilError::config("check window stop time must be positive"));
        }
        Ok(())
    }
}

/// Effect of a verifier outcome on the command as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminationAction {
    /// Declare the command completed
    Success,
    /// Declare the command failed
    Fail,
    /// Leave the command open
    #[default]
    Continue,
}

/// Reference to an algorithm known to the algorithm subsystem
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Algorithm {
    pub qualified_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Algorithm {
    pub fn new(qualified_name: impl Into<String>) -> Self {
        Self {
            qualified_name: qualified_name.into(),
            language: None,
            text: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.qualified_name
    }
}

/// Evidence a verifier looks for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VerifierKind {
    /// An algorithm returns the verdict
    Algorithm { algorithm: Algorithm },
    /// Arrival of a telemetry container
    Container { container: String },
    /// A comparison tree becomes true
    MatchCriteria { criteria: MatchCriteria },
    /// A numeric parameter moves by at least `delta` in the sign of `delta`
    ParameterValueChange { parameter: String, delta: f64 },
}

impl VerifierKind {
    pub fn verifier_type(&self) -> VerifierType {
        match self {
            VerifierKind::Algorithm { .. } => VerifierType::Algorithm,
            VerifierKind::Container { .. } => VerifierType::Container,
            VerifierKind::MatchCriteria { .. } => VerifierType::MatchCriteria,
            VerifierKind::ParameterValueChange { .. } => VerifierType::ParameterValueChange,
        }
    }
}

/// Discriminant of [`VerifierKind`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerifierType {
    Algorithm,
    Container,
    MatchCriteria,
    ParameterValueChange,
}

impl fmt::Display for VerifierType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VerifierType::Algorithm => "ALGORITHM",
            VerifierType::Container => "CONTAINER",
            VerifierType::MatchCriteria => "MATCH_CRITERIA",
            VerifierType::ParameterValueChange => "PARAMETER_VALUE_CHANGE",
        })
    }
}

/// Verifier definition attached to a meta-command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandVerifier {
    pub stage: String,
    pub kind: VerifierKind,
    pub check_window: CheckWindow,
    #[serde(default)]
    pub on_success: TerminationAction,
    #[serde(default)]
    pub on_fail: TerminationAction,
    #[serde(default)]
    pub on_timeout: TerminationAction,
}

impl CommandVerifier {
    /// New verifier with every termination action set to CONTINUE
    pub fn new(stage: impl Into<String>, kind: VerifierKind, check_window: CheckWindow) -> Self {
        Self {
            stage: stage.into(),
            kind,
            check_window,
            on_success: TerminationAction::Continue,
            on_fail: TerminationAction::Continue,
            on_timeout: TerminationAction::Continue,
        }
    }

    pub fn on_success(mut self, action: TerminationAction) -> Self {
        self.on_success = action;
        self
    }

    pub fn on_fail(mut self, action: TerminationAction) -> Self {
        self.on_fail = action;
        self
    }

    pub fn on_timeout(mut self, action: TerminationAction) -> Self {
        self.on_timeout = action;
        self
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn check_window(&self) -> &CheckWindow {
        &self.check_window
    }

    /// Copy of this definition with a different check window. The shared
    /// definition is left untouched.
    pub fn with_check_window(&self, check_window: CheckWindow) -> Self {
        Self {
            check_window,
            ..self.clone()
        }
    }
}

/// Command definition, possibly derived from a base command
#[derive(Debug, Clone, PartialEq)]
pub struct MetaCommand {
    qualified_name: String,
    base: Option<Arc<MetaCommand>>,
    verifiers: Vec<Arc<CommandVerifier>>,
}

impl MetaCommand {
    pub fn new(qualified_name: impl Into<String>) -> Self {
        Self {
            qualified_name: qualified_name.into(),
            base: None,
            verifiers: Vec::new(),
        }
    }

    pub fn with_base(mut self, base: Arc<MetaCommand>) -> Self {
        self.base = Some(base);
        self
    }

    pub fn with_verifier(mut self, verifier: CommandVerifier) -> Self {
        self.verifiers.push(Arc::new(verifier));
        self
    }

    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    pub fn base(&self) -> Option<&Arc<MetaCommand>> {
        self.base.as_ref()
    }

    /// Verifiers defined directly on this command, in declaration order
    pub fn command_verifiers(&self) -> &[Arc<CommandVerifier>] {
        &self.verifiers
    }

    /// This command followed by its bases, most derived first
    pub fn hierarchy(&self) -> impl Iterator<Item = &MetaCommand> {
        std::iter::successors(Some(self), |cmd| cmd.base.as_deref())
    }
}

/// Lookup of parameter and command definitions
pub trait MissionDatabase: Send + Sync {
    /// Parameter by fully qualified name
    fn parameter(&self, qualified_name: &str) -> Option<Arc<Parameter>>;

    /// Meta-command by fully qualified name
    fn meta_command(&self, qualified_name: &str) -> Option<Arc<MetaCommand>>;
}

/// Serialized form of a meta-command
#[derive(Debug, Clone, Deserialize)]
struct MetaCommandDefinition {
    name: String,
    #[serde(default)]
    base: Option<String>,
    #[serde(default)]
    verifiers: Vec<CommandVerifier>,
}

/// Serialized form of a mission database
#[derive(Debug, Clone, Default, Deserialize)]
struct MissionDatabaseDefinition {
    #[serde(default)]
    parameters: Vec<Parameter>,
    #[serde(default)]
    meta_commands: Vec<MetaCommandDefinition>,
}

/// Mission database held in memory
#[derive(Debug, Default)]
pub struct InMemoryMissionDatabase {
    parameters: RwLock<HashMap<String, Arc<Parameter>>>,
    meta_commands: RwLock<HashMap<String, Arc<MetaCommand>>>,
}

impl InMemoryMissionDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_parameter(&self, parameter: Parameter) -> Arc<Parameter> {
        let parameter = Arc::new(parameter);
        self.parameters
            .write()
            .insert(parameter.qualified_name.clone(), parameter.clone());
        parameter
    }

    pub fn add_meta_command(&self, meta_command: Arc<MetaCommand>) {
        self.meta_commands
            .write()
            .insert(meta_command.qualified_name.clone(), meta_command);
    }

    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Self::from_definition(toml::from_str(content)?)
    }

    /// Parse a JSON document
    pub fn from_json_str(content: &str) -> Result<Self> {
        Self::from_definition(serde_json::from_str(content)?)
    }

    /// Load a TOML or JSON file, chosen by extension
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let format = ConfigFormat::from_path(path)?;
        let content = std::fs::read_to_string(path).map_err(|e| {
            VerifyError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        match format {
            ConfigFormat::Toml => Self::from_toml_str(&content),
            ConfigFormat::Json => Self::from_json_str(&content),
        }
    }

    fn from_definition(definition: MissionDatabaseDefinition) -> Result<Self> {
        let mdb = Self::new();
        for parameter in definition.parameters {
            mdb.add_parameter(parameter);
        }

        let mut pending: HashMap<String, MetaCommandDefinition> = HashMap::new();
        for def in definition.meta_commands {
            validate_definition(&def)?;
            let name = def.name.clone();
            if pending.insert(name.clone(), def).is_some() {
                return Err(VerifyError::Configuration(format!(
                    "meta-command {name} defined twice"
                )));
            }
        }

        let mut resolved = HashMap::new();
        let names: Vec<String> = pending.keys().cloned().collect();
        for name in names {
            resolve(&name, &pending, &mut resolved, &mut HashSet::new())?;
        }
        for command in resolved.into_values() {
            mdb.add_meta_command(command);
        }
        debug!(
            parameters = mdb.parameters.read().len(),
            meta_commands = mdb.meta_commands.read().len(),
            "Loaded mission database"
        );
        Ok(mdb)
    }
}

fn validate_definition(def: &MetaCommandDefinition) -> Result<()> {
    let mut stages = HashSet::new();
    for verifier in &def.verifiers {
        if !stages.insert(verifier.stage.as_str()) {
            return Err(VerifyError::Configuration(format!(
                "meta-command {} defines stage {} twice",
                def.name, verifier.stage
            )));
        }
        verifier.check_window.validate().map_err(|e| {
            VerifyError::Configuration(format!(
                "{} stage {}: {e}",
                def.name, verifier.stage
            ))
        })?;
    }
    Ok(())
}

fn resolve(
    name: &str,
    pending: &HashMap<String, MetaCommandDefinition>,
    resolved: &mut HashMap<String, Arc<MetaCommand>>,
    visiting: &mut HashSet<String>,
) -> Result<Arc<MetaCommand>> {
    if let Some(command) = resolved.get(name) {
        return Ok(command.clone());
    }
    let def = pending.get(name).ok_or_else(|| {
        VerifyError::Configuration(format!("unknown base meta-command {name}"))
    })?;
    if !visiting.insert(name.to_string()) {
        return Err(VerifyError::Configuration(format!(
            "meta-command {name} inherits from itself"
        )));
    }

    let mut command = MetaCommand::new(&def.name);
    if let Some(base) = &def.base {
        command = command.with_base(resolve(base, pending, resolved, visiting)?);
    }
    for verifier in &def.verifiers {
        command = command.with_verifier(verifier.clone());
    }

    let command = Arc::new(command);
    resolved.insert(name.to_string(), command.clone());
    Ok(command)
}

impl MissionDatabase for InMemoryMissionDatabase {
    fn parameter(&self, qualified_name: &str) -> Option<Arc<Parameter>> {
        self.parameters.read().get(qualified_name).cloned()
    }

    fn meta_command(&self, qualified_name: &str) -> Option<Arc<MetaCommand>> {
        self.meta_commands.read().get(qualified_name).cloned()
    }
}
