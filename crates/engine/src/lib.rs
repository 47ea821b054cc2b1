//! `engine` crate: workflow model, publish-time validation, the step
//! registry, the authoring catalog and the case execution engine.

pub mod catalog;
pub mod dag;
pub mod error;
pub mod executor;
pub mod models;
pub mod registry;
pub mod validate;

pub use catalog::Catalog;
pub use dag::validate_dag;
pub use error::EngineError;
pub use executor::{CaseState, EngineConfig, WorkflowEngine};
pub use models::{Routing, WorkflowBundle, WorkflowDefinition, WorkflowStep, WorkflowVersion};
pub use registry::StepRegistry;
pub use validate::{validate_version, Documents};
