//! Batch loading of plain-text guidelines into the store.
//!
//! A document is outlined by the oracle and cut into one chunk per heading. Chunks are
//! summarised and grouped into chapters under level-1 headings, each with a summary of
//! its own. Everything runs sequentially.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use glob::glob;
use serde::Serialize;
use tracing::{debug, info, warn};

use guideline_llm::Oracle;
use guideline_store::{
    document_id_for, ChapterInsert, ChunkInsert, DocumentInsert, GuidelineStore,
};

use crate::parse::{parse_heading_outline, DetectedHeading};
use crate::prompts::{
    chapter_summary_user, outline_user, section_summary_user, OUTLINE_SYSTEM, SUMMARY_SYSTEM,
};
use crate::stages::ask;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub heading: String,
    pub level: u8,
    pub content: String,
    pub position: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chapter {
    pub name: String,
    pub sections: Vec<Section>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestedDocument {
    pub document_id: String,
    pub title: String,
    pub chunks: usize,
    pub chapters: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestFailure {
    pub path: PathBuf,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub documents: Vec<IngestedDocument>,
    pub failures: Vec<IngestFailure>,
}

impl IngestReport {
    pub fn chunks(&self) -> usize {
        self.documents.iter().map(|d| d.chunks).sum()
    }
}

pub struct Ingestor<'a> {
    store: &'a GuidelineStore,
    oracle: &'a dyn Oracle,
}

impl<'a> Ingestor<'a> {
    pub fn new(store: &'a GuidelineStore, oracle: &'a dyn Oracle) -> Self {
        Self { store, oracle }
    }

    pub fn ingest_path(&self, path: &Path) -> Result<IngestReport> {
        if path.is_dir() {
            return self.ingest_directory(path);
        }
        let document = self.ingest_file(path)?;
        Ok(IngestReport {
            documents: vec![document],
            failures: Vec::new(),
        })
    }

    /// A failing file is recorded in the report and does not stop the batch.
    pub fn ingest_directory(&self, dir: &Path) -> Result<IngestReport> {
        let pattern = dir.join("*.txt");
        let pattern = pattern
            .to_str()
            .ok_or_else(|| anyhow!("directory path is not valid UTF-8: {}", dir.display()))?;
        let mut files = glob(pattern)
            .with_context(|| format!("invalid glob pattern {pattern}"))?
            .filter_map(|entry| entry.ok())
            .collect::<Vec<_>>();
        files.sort();
        let mut report = IngestReport::default();
        for file in files {
            match self.ingest_file(&file) {
                Ok(document) => report.documents.push(document),
                Err(err) => {
                    warn!(path = %file.display(), error = %format!("{err:#}"), "failed to ingest file");
                    report.failures.push(IngestFailure {
                        path: file,
                        error: format!("{err:#}"),
                    });
                }
            }
        }
        info!(
            documents = report.documents.len(),
            chunks = report.chunks(),
            failures = report.failures.len(),
            "ingestion finished"
        );
        Ok(report)
    }

    pub fn ingest_file(&self, path: &Path) -> Result<IngestedDocument> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let title = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        self.ingest_text(&title, &path.display().to_string(), &text)
    }

    /// Outlines and summarises the whole document before touching the store, then writes
    /// it in one transaction. A document that yields no chapter is an error and leaves any
    /// earlier version in place.
    pub fn ingest_text(&self, title: &str, source: &str, text: &str) -> Result<IngestedDocument> {
        let outline = ask(self.oracle, OUTLINE_SYSTEM, &outline_user(text), parse_heading_outline)
            .with_context(|| format!("failed to detect headings in {title}"))?;
        let chapters = group_into_chapters(chunk_by_headings(text, &outline));
        if chapters.is_empty() {
            return Err(anyhow!(
                "no level-1 heading found in {title} ({} headings detected)",
                outline.len()
            ));
        }
        let document_id = document_id_for(source, text);
        let inserts: Vec<ChapterInsert> = chapters
            .iter()
            .map(|chapter| self.summarize_chapter(&document_id, chapter))
            .collect();
        let stored = self
            .store
            .replace_document(
                &DocumentInsert {
                    id: document_id.clone(),
                    title: Some(title.to_string()),
                    source: Some(source.to_string()),
                },
                &inserts,
            )
            .with_context(|| format!("failed to store {title}"))?
            .len();
        info!(document_id = %document_id, title, chunks = stored, chapters = chapters.len(), "processed document");
        Ok(IngestedDocument {
            document_id,
            title: title.to_string(),
            chunks: stored,
            chapters: chapters.len(),
        })
    }

    fn summarize_chapter(&self, document_id: &str, chapter: &Chapter) -> ChapterInsert {
        let mut chunks = Vec::with_capacity(chapter.sections.len());
        let mut summaries = Vec::new();
        for section in &chapter.sections {
            let summary = self.summarize(
                SUMMARY_SYSTEM,
                &section_summary_user(&section.heading, &section.content),
                &section.heading,
            );
            summaries.extend(summary.clone());
            chunks.push(ChunkInsert {
                document_id: document_id.to_string(),
                section_heading: section.heading.clone(),
                content: section.content.clone(),
                summary,
                position_in_doc: section.position,
            });
        }
        let summary = if summaries.is_empty() {
            None
        } else {
            let user = chapter_summary_user(&chapter.name, &summaries);
            self.summarize(SUMMARY_SYSTEM, &user, &chapter.name)
        };
        ChapterInsert { summary, chunks }
    }

    fn summarize(&self, system: &str, user: &str, label: &str) -> Option<String> {
        match self.oracle.complete(system, user) {
            Ok(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
            Ok(_) => None,
            Err(err) => {
                warn!(section = label, error = %format!("{err:#}"), "summary failed, storing without one");
                None
            }
        }
    }
}

/// Cuts `text` at each heading. Offsets reported by the oracle are only trusted when the
/// heading text actually starts there; otherwise the heading is searched for after the
/// previous one. Headings that cannot be found are skipped, and text before the first
/// heading is not kept.
pub fn chunk_by_headings(text: &str, headings: &[DetectedHeading]) -> Vec<Section> {
    let mut anchors: Vec<(usize, &DetectedHeading)> = Vec::new();
    let mut cursor = 0usize;
    for heading in headings {
        let needle = heading.heading_text.trim();
        if needle.is_empty() {
            continue;
        }
        let reported = heading.start_position.filter(|&pos| {
            pos >= cursor
                && pos < text.len()
                && text.is_char_boundary(pos)
                && text[pos..].starts_with(needle)
        });
        let found = reported.or_else(|| text[cursor..].find(needle).map(|off| cursor + off));
        match found {
            Some(pos) => {
                anchors.push((pos, heading));
                cursor = pos + needle.len();
            }
            None => debug!(heading = needle, "heading not found in text, skipping"),
        }
    }
    anchors
        .iter()
        .enumerate()
        .map(|(idx, (start, heading))| {
            let end = anchors
                .get(idx + 1)
                .map(|(next, _)| *next)
                .unwrap_or(text.len());
            Section {
                heading: heading.heading_text.trim().to_string(),
                level: heading.level.clamp(1, 3),
                content: text[*start..end].trim().to_string(),
                position: idx as u32,
            }
        })
        .collect()
}

/// Level-1 headings open a chapter; sections before the first one belong to none and are
/// dropped.
pub fn group_into_chapters(sections: Vec<Section>) -> Vec<Chapter> {
    let mut chapters: Vec<Chapter> = Vec::new();
    for section in sections {
        if section.level == 1 {
            chapters.push(Chapter {
                name: section.heading.clone(),
                sections: Vec::new(),
            });
        }
        match chapters.last_mut() {
            Some(chapter) => chapter.sections.push(section),
            None => debug!(heading = %section.heading, "section precedes first chapter, skipping"),
        }
    }
    chapters
}

#[cfg(test)]
mod tests {
    use super::*;
    use guideline_store::DocumentStore;
    use std::cell::RefCell;
    use tempfile::tempdir;

    const GUIDELINE: &str = "Type 2 Diabetes Guideline\n\nDiagnosis\nMeasure HbA1c.\n\nManagement\nLifestyle first.\n\nTreatment\nOffer metformin.\n";

    fn heading(text: &str, level: u8, start: Option<usize>) -> DetectedHeading {
        DetectedHeading {
            heading_text: text.to_string(),
            level,
            start_position: start,
        }
    }

    #[test]
    fn sections_run_until_the_next_heading() {
        let headings = vec![
            heading("Diagnosis", 1, Some(9999)),
            heading("Management", 1, None),
            heading("Treatment", 2, None),
        ];
        let sections = chunk_by_headings(GUIDELINE, &headings);
        assert_eq!(sections.len(), 3);
        assert_eq!(sections[0].content, "Diagnosis\nMeasure HbA1c.");
        assert_eq!(sections[2].content, "Treatment\nOffer metformin.");
        assert_eq!(sections[2].position, 2);
    }

    #[test]
    fn unknown_headings_are_skipped() {
        let headings = vec![heading("Dosing", 1, None), heading("Treatment", 1, None)];
        let sections = chunk_by_headings(GUIDELINE, &headings);
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].heading, "Treatment");
        assert_eq!(sections[0].position, 0);
    }

    #[test]
    fn accurate_offsets_are_used() {
        let start = GUIDELINE.find("Management").unwrap();
        let sections = chunk_by_headings(GUIDELINE, &[heading("Management", 1, Some(start))]);
        assert!(sections[0].content.starts_with("Management"));
    }

    #[test]
    fn chapters_start_at_level_one() {
        let sections = vec![
            Section { heading: "Preface".into(), level: 2, content: "p".into(), position: 0 },
            Section { heading: "Management".into(), level: 1, content: "m".into(), position: 1 },
            Section { heading: "Treatment".into(), level: 2, content: "t".into(), position: 2 },
            Section { heading: "Monitoring".into(), level: 1, content: "o".into(), position: 3 },
        ];
        let chapters = group_into_chapters(sections);
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].name, "Management");
        assert_eq!(chapters[0].sections.len(), 2);
        assert_eq!(chapters[1].sections.len(), 1);
    }

    #[test]
    fn ingest_text_stores_chunks_with_summaries() {
        let dir = tempdir().unwrap();
        let store = GuidelineStore::open(dir.path().join("g.sqlite")).unwrap();
        let calls = RefCell::new(Vec::new());
        let oracle = |system: &str, user: &str| -> Result<String> {
            calls.borrow_mut().push(system.to_string());
            if user.contains("identify all headings") {
                return Ok("```json\n[{\"heading_text\": \"Diagnosis\", \"level\": 1, \"start_position\": 0},\
                           {\"heading_text\": \"Treatment\", \"level\": 2, \"start_position\": 0}]\n```"
                    .to_string());
            }
            Ok("A short summary.".to_string())
        };
        let ingestor = Ingestor::new(&store, &oracle);
        let doc = ingestor
            .ingest_text("t2d.txt", "./documents/t2d.txt", GUIDELINE)
            .unwrap();
        assert_eq!(doc.chunks, 2);
        assert_eq!(doc.chapters, 1);
        // outline, two section summaries, one chapter summary
        assert_eq!(calls.borrow().len(), 4);
        let headings = store.list_headings(&doc.document_id).unwrap();
        assert_eq!(headings, vec!["Diagnosis", "Treatment"]);
        let chunks = store
            .fetch_chunks(&doc.document_id, &["Treatment".to_string()])
            .unwrap();
        assert_eq!(
            store.chapter_summary(chunks[0].id).unwrap().as_deref(),
            Some("A short summary.")
        );
    }

    #[test]
    fn directory_ingest_records_failures() {
        let dir = tempdir().unwrap();
        let store = GuidelineStore::open(dir.path().join("g.sqlite")).unwrap();
        let docs = dir.path().join("documents");
        fs::create_dir_all(&docs).unwrap();
        fs::write(docs.join("a.txt"), GUIDELINE).unwrap();
        fs::write(docs.join("b.txt"), "Treatment\nOffer metformin.").unwrap();
        fs::write(docs.join("notes.md"), "ignored").unwrap();
        let oracle = |_: &str, user: &str| -> Result<String> {
            if user.contains("Offer metformin.") && !user.contains("Diagnosis") {
                return Ok("not json".to_string());
            }
            if user.contains("identify all headings") {
                return Ok("[{\"heading_text\": \"Diagnosis\", \"level\": 1}]".to_string());
            }
            Ok("summary".to_string())
        };
        let report = Ingestor::new(&store, &oracle).ingest_path(&docs).unwrap();
        assert_eq!(report.documents.len(), 1);
        assert_eq!(report.documents[0].title, "a.txt");
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].path.ends_with("b.txt"));
    }

    #[test]
    fn reingest_without_chapters_keeps_previous_chunks() {
        let dir = tempdir().unwrap();
        let store = GuidelineStore::open(dir.path().join("g.sqlite")).unwrap();
        let good = |_: &str, user: &str| -> Result<String> {
            if user.contains("identify all headings") {
                return Ok("[{\"heading_text\": \"Diagnosis\", \"level\": 1}, {\"heading_text\": \"Treatment\", \"level\": 2}]".to_string());
            }
            Ok("summary".to_string())
        };
        let first = Ingestor::new(&store, &good)
            .ingest_text("t2d.txt", "./documents/t2d.txt", GUIDELINE)
            .unwrap();

        let subheadings_only = |_: &str, user: &str| -> Result<String> {
            if user.contains("identify all headings") {
                return Ok("[{\"heading_text\": \"Treatment\", \"level\": 2}]".to_string());
            }
            Ok("summary".to_string())
        };
        let err = Ingestor::new(&store, &subheadings_only)
            .ingest_text("t2d.txt", "./documents/t2d.txt", GUIDELINE)
            .unwrap_err();
        assert!(format!("{err:#}").contains("no level-1 heading"));
        assert_eq!(
            store.list_headings(&first.document_id).unwrap(),
            vec!["Diagnosis", "Treatment"]
        );
    }

    #[test]
    fn documents_without_chapters_are_reported_as_failures() {
        let dir = tempdir().unwrap();
        let store = GuidelineStore::open(dir.path().join("g.sqlite")).unwrap();
        let docs = dir.path().join("documents");
        fs::create_dir_all(&docs).unwrap();
        fs::write(docs.join("flat.txt"), "Offer metformin to most adults.").unwrap();
        let oracle = |_: &str, _: &str| -> Result<String> { Ok("[]".to_string()) };
        let report = Ingestor::new(&store, &oracle).ingest_path(&docs).unwrap();
        assert!(report.documents.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].error.contains("no level-1 heading"));
        assert_eq!(store.pick_default_document().unwrap(), None);
    }
}
