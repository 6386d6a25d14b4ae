//! Commands as prepared for release, with per-command verifier overrides.

use crate::mdb::{serde_millis, MetaCommand};
use crate::types::{ArgumentAssignment, CommandHistoryAttribute, CommandId, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Replacement bounds for a verifier check window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowOverride {
    #[serde(default, rename = "time_to_start_ms", with = "serde_millis")]
    pub time_to_start: Duration,
    #[serde(rename = "time_to_stop_ms", with = "serde_millis")]
    pub time_to_stop: Duration,
}

/// Per-command adjustment of one verifier stage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifierOverride {
    #[serde(default)]
    pub disable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_window: Option<WindowOverride>,
}

impl VerifierOverride {
    /// Skip the stage for this command
    pub fn disabled() -> Self {
        Self {
            disable: true,
            check_window: None,
        }
    }

    /// Keep the stage with different window bounds
    pub fn window(time_to_start: Duration, time_to_stop: Duration) -> Self {
        Self {
            disable: false,
            check_window: Some(WindowOverride {
                time_to_start,
                time_to_stop,
            }),
        }
    }
}

/// A released command awaiting verification
#[derive(Debug, Clone)]
pub struct PreparedCommand {
    id: CommandId,
    meta_command: Arc<MetaCommand>,
    arguments: ArgumentAssignment,
    attributes: Vec<CommandHistoryAttribute>,
    verifier_overrides: HashMap<String, VerifierOverride>,
    disable_command_verifiers: bool,
}

impl PreparedCommand {
    pub fn id(&self) -> &CommandId {
        &self.id
    }

    pub fn meta_command(&self) -> &Arc<MetaCommand> {
        &self.meta_command
    }

    pub fn command_name(&self) -> &str {
        self.meta_command.qualified_name()
    }

    pub fn arguments(&self) -> &ArgumentAssignment {
        &self.arguments
    }

    pub fn attributes(&self) -> &[CommandHistoryAttribute] {
        &self.attributes
    }

    pub fn verifier_override(&self, stage: &str) -> Option<&VerifierOverride> {
        self.verifier_overrides.get(stage)
    }

    /// When set, every verifier is skipped and acknowledged as DISABLED
    pub fn disable_command_verifiers(&self) -> bool {
        self.disable_command_verifiers
    }
}

/// Builder for [`PreparedCommand`]
pub struct PreparedCommandBuilder {
    command: PreparedCommand,
}

impl PreparedCommandBuilder {
    pub fn new(id: CommandId, meta_command: Arc<MetaCommand>) -> Self {
        Self {
            command: PreparedCommand {
                id,
                meta_command,
                arguments: ArgumentAssignment::new(),
                attributes: Vec::new(),
                verifier_overrides: HashMap::new(),
                disable_command_verifiers: false,
            },
        }
    }

    pub fn argument(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.command.arguments.insert(name.into(), value.into());
        self
    }

    pub fn attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.command
            .attributes
            .push(CommandHistoryAttribute::new(name, value));
        self
    }

    pub fn override_verifier(mut self, stage: impl Into<String>, verifier_override: VerifierOverride) -> Self {
        self.command
            .verifier_overrides
            .insert(stage.into(), verifier_override);
        self
    }

    pub fn disable_command_verifiers(mut self, disable: bool) -> Self {
        self.command.disable_command_verifiers = disable;
        self
    }

    pub fn build(self) -> PreparedCommand {
        self.command
    }
}
