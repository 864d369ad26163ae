pub mod records;
pub mod store;

use anyhow::Result;

pub use records::{
    document_id_for, ChapterInsert, Chunk, ChunkInsert, DocumentInsert, DocumentRecord,
};
pub use store::GuidelineStore;

/// Read-side queries the retrieval workflow needs from a document/chunk repository.
pub trait DocumentStore {
    /// First document in the store's default ordering, if any exist.
    fn pick_default_document(&self) -> Result<Option<String>>;

    /// Distinct section headings of a document.
    fn list_headings(&self, document_id: &str) -> Result<Vec<String>>;

    /// Chunks of `document_id` whose heading is one of `headings`.
    fn fetch_chunks(&self, document_id: &str, headings: &[String]) -> Result<Vec<Chunk>>;
}

impl<T: DocumentStore + ?Sized> DocumentStore for &T {
    fn pick_default_document(&self) -> Result<Option<String>> {
        (**self).pick_default_document()
    }

    fn list_headings(&self, document_id: &str) -> Result<Vec<String>> {
        (**self).list_headings(document_id)
    }

    fn fetch_chunks(&self, document_id: &str, headings: &[String]) -> Result<Vec<Chunk>> {
        (**self).fetch_chunks(document_id, headings)
    }
}
