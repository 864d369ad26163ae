use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use super::{ask, StageContext};
use crate::error::StageError;
use crate::parse::parse_heading_array;
use crate::prompts::{structure_user, STRUCTURE_SYSTEM};
use crate::state::{StateUpdate, WorkflowState};

/// Picks the document to search and asks the oracle which of its headings are worth
/// reading. This is also where a run's retry bookkeeping starts from zero.
pub fn run(ctx: &StageContext<'_>, state: &WorkflowState) -> StateUpdate {
    info!(query = state.query(), "resolving document structure");
    let mut update = StateUpdate {
        target_sections: Some(Vec::new()),
        review_feedback: Some(None),
        retry_count: Some(0),
        ..Default::default()
    };
    let Some(document_id) = resolve_document(ctx, state) else {
        info!("no document available");
        return update;
    };
    update.document_id = Some(document_id.clone());

    let headings = match ctx.store.list_headings(&document_id) {
        Ok(headings) => dedup_preserving_order(headings),
        Err(err) => {
            warn!(document_id = %document_id, error = %StageError::Store(err), "could not list headings");
            return update;
        }
    };
    if headings.is_empty() {
        info!(document_id = %document_id, "no structure found");
        return update;
    }

    let user = structure_user(state.query(), &headings);
    let selected = match ask(ctx.oracle, STRUCTURE_SYSTEM, &user, parse_heading_array) {
        Ok(picked) => restrict_to_vocabulary(picked, &headings),
        Err(err) => {
            warn!(error = %err, "heading selection unusable, selecting nothing");
            Vec::new()
        }
    };
    info!(
        document_id = %document_id,
        available = headings.len(),
        selected = selected.len(),
        "identified relevant sections"
    );
    update.target_sections = Some(selected);
    update
}

fn resolve_document(ctx: &StageContext<'_>, state: &WorkflowState) -> Option<String> {
    if let Some(id) = &state.document_id {
        return Some(id.clone());
    }
    if !ctx.config.allow_default_document {
        return None;
    }
    match ctx.store.pick_default_document() {
        Ok(Some(id)) => {
            warn!(document_id = %id, "no document id supplied, falling back to first stored document");
            Some(id)
        }
        Ok(None) => None,
        Err(err) => {
            warn!(error = %StageError::Store(err), "could not pick a default document");
            None
        }
    }
}

fn dedup_preserving_order(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

/// Maps the oracle's picks back onto real headings. Exact matches win; otherwise a
/// trimmed, case-insensitive match is accepted. Anything else is invented and dropped.
fn restrict_to_vocabulary(picked: Vec<String>, headings: &[String]) -> Vec<String> {
    let exact: HashSet<&str> = headings.iter().map(String::as_str).collect();
    let folded: HashMap<String, &str> = headings
        .iter()
        .map(|h| (h.trim().to_lowercase(), h.as_str()))
        .collect();
    let mut selected = Vec::new();
    for pick in picked {
        let canonical = if exact.contains(pick.as_str()) {
            Some(pick.clone())
        } else {
            folded
                .get(&pick.trim().to_lowercase())
                .map(|h| h.to_string())
        };
        match canonical {
            Some(heading) if !selected.contains(&heading) => selected.push(heading),
            Some(_) => {}
            None => debug!(heading = %pick, "dropping heading not in table of contents"),
        }
    }
    selected
}
