//! `[verification]` configuration section.

use crate::Result;
use serde::{Deserialize, Serialize};
use vigil_core::{ConfigLoader, Validatable, VigilError, VigilResult};

/// What to do when the command history refuses the subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionFailurePolicy {
    /// Abort verification of the command
    #[default]
    Abort,
    /// Keep verifying from timers and telemetry only
    TimerOnly,
}

/// Verification settings shared by every handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Namespace of command attribute pseudo-parameters
    pub cmd_namespace: String,
    /// Namespace of command-history pseudo-parameters
    pub cmdhist_namespace: String,
    /// Cancel a verifier's pending timers once it reaches a terminal state
    pub cancel_timers_on_finish: bool,
    pub subscription_failure: SubscriptionFailurePolicy,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            cmd_namespace: "/sys/cmd".to_string(),
            cmdhist_namespace: "/sys/cmdHist".to_string(),
            cancel_timers_on_finish: true,
            subscription_failure: SubscriptionFailurePolicy::Abort,
        }
    }
}

impl VerificationConfig {
    pub const SECTION: &'static str = "verification";

    /// Read and validate the section; defaults apply when it is absent
    pub fn load(loader: &ConfigLoader) -> Result<Self> {
        let config: Self = loader.load_section(Self::SECTION)?;
        config.validate()?;
        Ok(config)
    }

    /// Pseudo-parameter name of a command attribute
    pub fn command_parameter(&self, attribute: &str) -> String {
        format!("{}/{}", self.cmd_namespace, attribute)
    }

    /// Pseudo-parameter name of a command-history key
    pub fn history_parameter(&self, key: &str) -> String {
        format!("{}/{}", self.cmdhist_namespace, key)
    }

    /// Whether a parameter is one of the command pseudo-parameters rather
    /// than telemetry
    pub fn is_pseudo_parameter(&self, qualified_name: &str) -> bool {
        [&self.cmd_namespace, &self.cmdhist_namespace]
            .iter()
            .any(|ns| {
                qualified_name
                    .strip_prefix(ns.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
            })
    }
}

fn validate_namespace(field: &str, namespace: &str) -> VigilResult<()> {
    if !namespace.starts_with('/') || namespace.ends_with('/') {
        return Err(VigilError::config(format!(
            "{field} must start with '/' and not end with one, got '{namespace}'"
        )));
    }
    Ok(())
}

impl Validatable for VerificationConfig {
    fn validate(&self) -> VigilResult<()> {
        validate_namespace("cmd_namespace", &self.cmd_namespace)?;
        validate_namespace("cmdhist_namespace", &self.cmdhist_namespace)?;
        if self.cmd_namespace == self.cmdhist_namespace {
            return Err(VigilError::config(
                "cmd_namespace and cmdhist_namespace must differ",
            ));
        }
        Ok(())
    }
}
