//! `steps` crate: the `StepExecutor` trait, the rule and formula
//! interpreters, and the built-in step executors.
//!
//! The engine dispatches every step through a [`StepExecutor`] trait
//! object looked up by [`StepType`].

pub mod clock;
pub mod context;
pub mod error;
pub mod executors;
pub mod expr;
pub mod formula;
pub mod mock;
pub mod rules;
pub mod traits;

pub use context::Context;
pub use error::StepError;
pub use traits::{
    HumanTaskConfig, StepConfig, StepExecutor, StepInvocation, StepOutcome, StepType,
    OUTCOME_COMPUTED, OUTCOME_MATCHED, OUTCOME_NO_MATCH,
};
