use serde::{Deserialize, Serialize};

/// A stored span of guideline text tagged with the heading it sits under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: i64,
    pub document_id: String,
    pub section_heading: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: String,
    pub title: Option<String>,
    pub source: Option<String>,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DocumentInsert {
    pub id: String,
    pub title: Option<String>,
    pub source: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChunkInsert {
    pub document_id: String,
    pub section_heading: String,
    pub content: String,
    pub summary: Option<String>,
    pub position_in_doc: u32,
}

/// Chunks of one chapter plus the summary shared by all of them.
#[derive(Debug, Clone, Default)]
pub struct ChapterInsert {
    pub summary: Option<String>,
    pub chunks: Vec<ChunkInsert>,
}

/// Stable document id derived from where the text came from and what it says, so
/// re-ingesting an unchanged file lands on the same record.
pub fn document_id_for(source: &str, body: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(source.as_bytes());
    hasher.update(&[0]);
    hasher.update(body.as_bytes());
    let digest = hasher.finalize();
    format!("doc_{}", hex::encode(&digest.as_bytes()[..8]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_ids_are_stable_and_source_sensitive() {
        let a = document_id_for("guides/t2d.txt", "body");
        assert_eq!(a, document_id_for("guides/t2d.txt", "body"));
        assert_ne!(a, document_id_for("guides/other.txt", "body"));
        assert!(a.starts_with("doc_"));
        assert_eq!(a.len(), "doc_".len() + 16);
    }
}
