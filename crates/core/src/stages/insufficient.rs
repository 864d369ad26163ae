use tracing::info;

use crate::state::{FinalResponse, StateUpdate};

pub fn run() -> StateUpdate {
    info!("insufficient context, returning fallback answer");
    StateUpdate {
        final_response: Some(FinalResponse::insufficient()),
        ..Default::default()
    }
}
