//! Interface to the algorithm subsystem used by algorithm verifiers.

use crate::mdb::Algorithm;
use crate::types::{ArgumentAssignment, ParameterValue, Value};
use crate::Result;
use std::sync::Arc;
use uuid::Uuid;

/// Isolated scope in which a command's verification algorithms run.
///
/// One context is shared by every algorithm verifier of a command.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlgorithmExecutionContext {
    id: Uuid,
    name: String,
}

impl AlgorithmExecutionContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Callback receiving algorithm runs
pub trait AlgorithmExecListener: Send + Sync {
    /// The algorithm ran. `return_value` is `None` when it produced no verdict.
    fn algorithm_run(&self, inputs: &[ParameterValue], return_value: Option<&Value>, outputs: &[ParameterValue]);

    /// The algorithm raised an error
    fn algorithm_error(&self, message: &str) {
        let _ = message;
    }
}

/// Algorithm subsystem
pub trait AlgorithmManager: Send + Sync {
    fn create_context(&self, name: &str) -> Arc<AlgorithmExecutionContext>;

    fn activate_algorithm(
        &self,
        algorithm: &Algorithm,
        context: &AlgorithmExecutionContext,
        listener: Arc<dyn AlgorithmExecListener>,
    ) -> Result<()>;

    /// Must tolerate algorithms that are not active
    fn deactivate_algorithm(&self, algorithm: &Algorithm, context: &AlgorithmExecutionContext);

    fn process_arguments(&self, arguments: &ArgumentAssignment, context: &AlgorithmExecutionContext);

    fn update_delivery(&self, values: &[ParameterValue], context: &AlgorithmExecutionContext);
}
