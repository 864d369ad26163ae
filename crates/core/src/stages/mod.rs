//! The reasoning stages of the retrieval workflow.
//!
//! Each stage reads the current [`WorkflowState`](crate::state::WorkflowState) and
//! returns a [`StateUpdate`](crate::state::StateUpdate) with only the fields it
//! changed. Stages never fail: oracle, store and parse problems are logged and turned
//! into the stage's documented fallback.

pub mod drafting;
pub mod insufficient;
pub mod retrieval;
pub mod review;
pub mod structure;
pub mod validation;

use guideline_llm::Oracle;
use guideline_store::DocumentStore;

use crate::config::WorkflowConfig;
use crate::error::{MalformedOutput, StageError};

#[derive(Clone, Copy)]
pub struct StageContext<'a> {
    pub store: &'a dyn DocumentStore,
    pub oracle: &'a dyn Oracle,
    pub config: &'a WorkflowConfig,
}

/// One oracle round-trip followed by a strict parse.
pub(crate) fn ask<T>(
    oracle: &dyn Oracle,
    system: &str,
    user: &str,
    parse: impl Fn(&str) -> Result<T, MalformedOutput>,
) -> Result<T, StageError> {
    let raw = oracle.complete(system, user).map_err(StageError::Oracle)?;
    Ok(parse(&raw)?)
}
