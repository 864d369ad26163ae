use tracing::{info, warn};

use super::{ask, StageContext};
use crate::parse::{parse_verdict, Verdict, VerdictStatus};
use crate::prompts::{review_user, REVIEW_SYSTEM};
use crate::state::{StateUpdate, WorkflowState};

/// Used when the auditor fails a draft without saying why.
pub const GENERIC_FEEDBACK: &str =
    "Cite every claim with [Source: Section Name], keep a professional clinical tone, and answer the query directly.";

/// Grades the current draft. Past the retry ceiling the draft is accepted unheard; an
/// unreadable verdict also counts as a pass.
pub fn run(ctx: &StageContext<'_>, state: &WorkflowState) -> StateUpdate {
    let ceiling = ctx.config.max_review_retries;
    if state.retry_count >= ceiling {
        info!(retry_count = state.retry_count, ceiling, "max retries reached, accepting draft");
        return accept();
    }
    let Some(draft) = state.final_response.as_ref() else {
        return accept();
    };
    let user = review_user(&draft.answer, &draft.citations);
    match ask(ctx.oracle, REVIEW_SYSTEM, &user, parse_verdict) {
        Ok(Verdict {
            status: VerdictStatus::Fail,
            feedback,
        }) => {
            let feedback = feedback
                .map(|text| text.trim().to_string())
                .filter(|text| !text.is_empty())
                .unwrap_or_else(|| GENERIC_FEEDBACK.to_string());
            let retry_count = state.retry_count + 1;
            info!(retry_count, feedback = %feedback, "quality check failed");
            StateUpdate {
                review_feedback: Some(Some(feedback)),
                retry_count: Some(retry_count),
                ..Default::default()
            }
        }
        Ok(_) => {
            info!("quality check passed");
            accept()
        }
        Err(err) => {
            warn!(error = %err, "could not read review verdict, defaulting to pass");
            accept()
        }
    }
}

fn accept() -> StateUpdate {
    StateUpdate {
        review_feedback: Some(None),
        ..Default::default()
    }
}
