use tracing::{info, warn};

use super::StageContext;
use crate::error::StageError;
use crate::parse::parse_answer_object;
use crate::prompts::{drafting_system, drafting_user};
use crate::state::{FinalResponse, StateUpdate, WorkflowState};

/// Drafts a cited answer from the retrieved chunks, folding in the auditor's feedback on
/// retries. Unstructured replies are kept as a bare answer with no citations.
pub fn run(ctx: &StageContext<'_>, state: &WorkflowState) -> StateUpdate {
    let attempt = state.retry_count + 1;
    let feedback = state.review_feedback.as_deref();
    info!(attempt, with_feedback = feedback.is_some(), "drafting answer");
    let system = drafting_system(feedback);
    let user = drafting_user(state.query(), &state.retrieved_chunks);
    let response = match ctx.oracle.complete(&system, &user) {
        Ok(raw) => parse_answer_object(&raw).unwrap_or_else(|err| {
            warn!(attempt, error = %err, "draft was not a JSON answer, keeping raw text");
            FinalResponse {
                answer: raw.trim().to_string(),
                citations: Vec::new(),
            }
        }),
        Err(err) => {
            warn!(attempt, error = %StageError::Oracle(err), "drafting failed, using fallback answer");
            FinalResponse::insufficient()
        }
    };
    StateUpdate {
        final_response: Some(response),
        ..Default::default()
    }
}
