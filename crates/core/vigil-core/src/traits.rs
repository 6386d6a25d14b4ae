//! Core traits shared across the Vigil crates.

use crate::VigilResult;

/// Trait for objects that can check their own consistency
pub trait Validatable {
    /// Validate this object
    fn validate(&self) -> VigilResult<()>;

    /// Check if this object is valid
    fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}
