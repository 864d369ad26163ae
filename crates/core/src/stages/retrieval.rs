use tracing::{info, warn};

use super::StageContext;
use crate::error::StageError;
use crate::state::{StateUpdate, WorkflowState};

// A failing store reads as "nothing found".
pub fn run(ctx: &StageContext<'_>, state: &WorkflowState) -> StateUpdate {
    let chunks = match state.document_id.as_deref() {
        Some(document_id) if !state.target_sections.is_empty() => {
            match ctx.store.fetch_chunks(document_id, &state.target_sections) {
                Ok(chunks) => chunks,
                Err(err) => {
                    warn!(document_id, error = %StageError::Store(err), "chunk retrieval failed");
                    Vec::new()
                }
            }
        }
        _ => Vec::new(),
    };
    info!(count = chunks.len(), "retrieved chunks");
    StateUpdate {
        retrieved_chunks: Some(chunks),
        ..Default::default()
    }
}
