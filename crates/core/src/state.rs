use serde::{Deserialize, Serialize};

use guideline_store::Chunk;

pub const INSUFFICIENT_ANSWER: &str =
    "Insufficient information found in the clinical guidelines to answer this query safely.";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Validity {
    Yes,
    #[default]
    No,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalResponse {
    pub answer: String,
    #[serde(default)]
    pub citations: Vec<String>,
}

impl FinalResponse {
    pub fn insufficient() -> Self {
        Self {
            answer: INSUFFICIENT_ANSWER.to_string(),
            citations: Vec::new(),
        }
    }

    pub fn is_insufficient(&self) -> bool {
        self.answer == INSUFFICIENT_ANSWER && self.citations.is_empty()
    }
}

/// Everything one workflow run knows. Stages only read it; the orchestrator folds each
/// stage's [`StateUpdate`] back in.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowState {
    query: String,
    pub document_id: Option<String>,
    pub target_sections: Vec<String>,
    pub retrieved_chunks: Vec<Chunk>,
    pub is_valid: Validity,
    pub final_response: Option<FinalResponse>,
    pub review_feedback: Option<String>,
    pub retry_count: u32,
}

impl WorkflowState {
    pub fn new(query: impl Into<String>, document_id: Option<String>) -> Self {
        Self {
            query: query.into(),
            document_id: document_id.filter(|id| !id.trim().is_empty()),
            target_sections: Vec::new(),
            retrieved_chunks: Vec::new(),
            is_valid: Validity::No,
            final_response: None,
            review_feedback: None,
            retry_count: 0,
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn apply(&mut self, update: StateUpdate) {
        let StateUpdate {
            document_id,
            target_sections,
            retrieved_chunks,
            is_valid,
            final_response,
            review_feedback,
            retry_count,
        } = update;
        if let Some(id) = document_id {
            self.document_id = Some(id);
        }
        if let Some(sections) = target_sections {
            self.target_sections = sections;
        }
        if let Some(chunks) = retrieved_chunks {
            self.retrieved_chunks = chunks;
        }
        if let Some(valid) = is_valid {
            self.is_valid = valid;
        }
        if let Some(response) = final_response {
            self.final_response = Some(response);
        }
        if let Some(feedback) = review_feedback {
            self.review_feedback = feedback;
        }
        if let Some(count) = retry_count {
            self.retry_count = count;
        }
    }
}

/// The fields a stage changed. `None` leaves the state untouched; `review_feedback` is
/// doubly optional so a stage can clear it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    pub document_id: Option<String>,
    pub target_sections: Option<Vec<String>>,
    pub retrieved_chunks: Option<Vec<Chunk>>,
    pub is_valid: Option<Validity>,
    pub final_response: Option<FinalResponse>,
    pub review_feedback: Option<Option<String>>,
    pub retry_count: Option<u32>,
}
