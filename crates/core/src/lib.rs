pub mod config;
mod error;
mod ingest;
pub mod parse;
pub mod prompts;
pub mod stages;
mod state;
mod workflow;

pub use config::{AppConfig, FileConfig, Settings, WorkflowConfig};
pub use error::{ConfigError, MalformedOutput, OutputShape, StageError};
pub use ingest::{
    chunk_by_headings, group_into_chapters, Chapter, IngestFailure, IngestReport,
    IngestedDocument, Ingestor, Section,
};
pub use state::{FinalResponse, StateUpdate, Validity, WorkflowState, INSUFFICIENT_ANSWER};
pub use workflow::{run_workflow, Node, Workflow, WorkflowOutcome};

pub use guideline_llm::{LlmClient, LlmProvider, Oracle};
pub use guideline_store::{
    Chunk, ChunkInsert, DocumentInsert, DocumentRecord, DocumentStore, GuidelineStore,
};
