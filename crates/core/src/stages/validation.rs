use tracing::{info, warn};

use super::StageContext;
use crate::error::StageError;
use crate::prompts::{validation_user, VALIDATION_SYSTEM};
use crate::state::{StateUpdate, Validity, WorkflowState};

/// Asks whether the retrieved context can answer the query. Anything short of a clear
/// "yes" (including an unreachable oracle) is a "no".
pub fn run(ctx: &StageContext<'_>, state: &WorkflowState) -> StateUpdate {
    let verdict = if state.retrieved_chunks.is_empty() {
        Validity::No
    } else {
        let user = validation_user(state.query(), &state.retrieved_chunks);
        match ctx.oracle.complete(VALIDATION_SYSTEM, &user) {
            Ok(reply) => classify(&reply),
            Err(err) => {
                warn!(error = %StageError::Oracle(err), "validator unavailable, treating context as insufficient");
                Validity::No
            }
        }
    };
    info!(decision = ?verdict, "validation decision");
    StateUpdate {
        is_valid: Some(verdict),
        ..Default::default()
    }
}

pub fn classify(reply: &str) -> Validity {
    if reply.trim().to_lowercase().contains("yes") {
        Validity::Yes
    } else {
        Validity::No
    }
}
