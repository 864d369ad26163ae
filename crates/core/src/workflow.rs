use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tracing::{debug, info, info_span, warn};

use guideline_llm::Oracle;
use guideline_store::DocumentStore;

use crate::config::WorkflowConfig;
use crate::stages::{
    drafting, insufficient, retrieval, review, structure, validation, StageContext,
};
use crate::state::{FinalResponse, Validity, WorkflowState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    Structure,
    Retrieval,
    Validation,
    Formatting,
    Review,
    Insufficient,
    End,
}

impl Node {
    /// The transition table. `formatting ⇄ review` is the only cycle; the reviewer's
    /// retry ceiling is what eventually clears `review_feedback` and breaks it.
    pub fn next(self, state: &WorkflowState) -> Node {
        match self {
            Node::Structure => Node::Retrieval,
            Node::Retrieval => Node::Validation,
            Node::Validation => match state.is_valid {
                Validity::Yes => Node::Formatting,
                Validity::No => Node::Insufficient,
            },
            Node::Formatting => Node::Review,
            Node::Review => {
                if state.review_feedback.is_some() {
                    Node::Formatting
                } else {
                    Node::End
                }
            }
            Node::Insufficient => Node::End,
            Node::End => Node::End,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowOutcome {
    pub response: FinalResponse,
    pub state: WorkflowState,
    pub path: Vec<Node>,
    pub cancelled: bool,
}

impl WorkflowOutcome {
    pub fn drafting_attempts(&self) -> usize {
        self.path.iter().filter(|n| **n == Node::Formatting).count()
    }
}

/// Runs the vectorless retrieval graph against an injected store and oracle. Each call
/// to [`Workflow::run`] gets a fresh [`WorkflowState`].
pub struct Workflow<'a> {
    store: &'a dyn DocumentStore,
    oracle: &'a dyn Oracle,
    config: WorkflowConfig,
    cancel: Option<&'a AtomicBool>,
}

impl<'a> Workflow<'a> {
    pub fn new(store: &'a dyn DocumentStore, oracle: &'a dyn Oracle) -> Self {
        Self::with_config(store, oracle, WorkflowConfig::default())
    }

    pub fn with_config(
        store: &'a dyn DocumentStore,
        oracle: &'a dyn Oracle,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            store,
            oracle,
            config,
            cancel: None,
        }
    }

    /// Checked before every stage. A cancelled run stops there and answers with the
    /// fallback response.
    pub fn with_cancel_flag(mut self, flag: &'a AtomicBool) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn run(&self, query: &str, document_id: Option<&str>) -> FinalResponse {
        self.run_traced(query, document_id).response
    }

    pub fn run_traced(&self, query: &str, document_id: Option<&str>) -> WorkflowOutcome {
        let span = info_span!("workflow", query = %query);
        let _guard = span.enter();
        let ctx = StageContext {
            store: self.store,
            oracle: self.oracle,
            config: &self.config,
        };
        let mut state = WorkflowState::new(query, document_id.map(str::to_string));
        let mut path = Vec::new();
        let mut node = Node::Structure;
        let mut cancelled = false;
        loop {
            if node != Node::End && self.is_cancelled() {
                warn!(at = ?node, "run cancelled");
                state.final_response = Some(FinalResponse::insufficient());
                cancelled = true;
                break;
            }
            let update = match node {
                Node::Structure => structure::run(&ctx, &state),
                Node::Retrieval => retrieval::run(&ctx, &state),
                Node::Validation => validation::run(&ctx, &state),
                Node::Formatting => drafting::run(&ctx, &state),
                Node::Review => review::run(&ctx, &state),
                Node::Insufficient => insufficient::run(),
                Node::End => break,
            };
            path.push(node);
            state.apply(update);
            let next = node.next(&state);
            debug!(from = ?node, to = ?next, "transition");
            node = next;
        }
        let response = state
            .final_response
            .clone()
            .unwrap_or_else(FinalResponse::insufficient);
        info!(
            retry_count = state.retry_count,
            citations = response.citations.len(),
            "workflow finished"
        );
        WorkflowOutcome {
            response,
            state,
            path,
            cancelled,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}

pub fn run_workflow(
    store: &dyn DocumentStore,
    oracle: &dyn Oracle,
    query: &str,
    document_id: Option<&str>,
) -> FinalResponse {
    Workflow::new(store, oracle).run(query, document_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(valid: Validity, feedback: Option<&str>) -> WorkflowState {
        let mut state = WorkflowState::new("q", None);
        state.is_valid = valid;
        state.review_feedback = feedback.map(str::to_string);
        state
    }

    #[test]
    fn linear_edges_are_unconditional() {
        let state = state_with(Validity::No, Some("x"));
        assert_eq!(Node::Structure.next(&state), Node::Retrieval);
        assert_eq!(Node::Retrieval.next(&state), Node::Validation);
        assert_eq!(Node::Formatting.next(&state), Node::Review);
        assert_eq!(Node::Insufficient.next(&state), Node::End);
    }

    #[test]
    fn validation_branches_on_verdict() {
        assert_eq!(
            Node::Validation.next(&state_with(Validity::Yes, None)),
            Node::Formatting
        );
        assert_eq!(
            Node::Validation.next(&state_with(Validity::No, None)),
            Node::Insufficient
        );
    }

    #[test]
    fn review_loops_only_with_feedback() {
        assert_eq!(
            Node::Review.next(&state_with(Validity::Yes, Some("cite sources"))),
            Node::Formatting
        );
        assert_eq!(Node::Review.next(&state_with(Validity::Yes, None)), Node::End);
    }
}
