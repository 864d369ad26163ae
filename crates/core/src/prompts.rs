use guideline_store::Chunk;

pub const STRUCTURE_SYSTEM: &str = "You are a clinical reasoning assistant.
You have the Table of Contents (TOC) for a clinical guideline.
Identify the specific section headings that are most likely to contain the answer to the user's query.
Return ONLY a JSON array of strings matching the exact headings from the TOC.";

pub const VALIDATION_SYSTEM: &str = "You are a clinical validator. Determine if the provided context contains sufficient information to answer the query safely.";

pub const DRAFTING_SYSTEM: &str = "You are a clinical assistant. Answer the query using ONLY the provided context.
Include citations in brackets [Source: Section Name] for every claim.
Format your response as a JSON object with keys: \"answer\" and \"citations\" (list of strings).";

pub const REVIEW_SYSTEM: &str = "You are a Quality Assurance auditor for a clinical AI.
Review the provided answer. It MUST meet these criteria:
1. It must contain specific citations in the text (e.g., [Source: ...]).
2. The tone must be professional and clinical.
3. It must directly answer the user's query.

If it passes, return JSON: {\"status\": \"pass\", \"feedback\": null}
If it fails, return JSON: {\"status\": \"fail\", \"feedback\": \"Specific instructions on what to fix\"}";

pub const OUTLINE_SYSTEM: &str =
    "You map the structure of clinical guideline documents. Reply with JSON only.";

pub const SUMMARY_SYSTEM: &str = "You write concise, factual summaries of clinical guidelines.";

/// Only the head of a document is shown to the outliner.
pub const OUTLINE_WINDOW_CHARS: usize = 5000;
pub const SUMMARY_WINDOW_CHARS: usize = 2000;

pub fn structure_user(query: &str, headings: &[String]) -> String {
    let toc = headings
        .iter()
        .map(|h| format!("- {h}"))
        .collect::<Vec<_>>()
        .join("\n");
    format!("Query: {query}\n\nTable of Contents:\n{toc}\n\nReturn JSON array of relevant headings:")
}

pub fn validation_user(query: &str, chunks: &[Chunk]) -> String {
    let context = chunks
        .iter()
        .map(|c| format!("Section: {}\nContent: {}", c.section_heading, c.content))
        .collect::<Vec<_>>()
        .join("\n\n");
    format!(
        "Query: {query}\n\nContext:\n{context}\n\nDoes the context contain the answer? Respond with only 'yes' or 'no'."
    )
}

pub fn drafting_system(feedback: Option<&str>) -> String {
    let mut system = DRAFTING_SYSTEM.to_string();
    if let Some(feedback) = feedback {
        system.push_str(&format!(
            "\n\nIMPORTANT: Your previous attempt was rejected.\nFeedback: {feedback}\nPlease fix these issues in your new response."
        ));
    }
    system
}

pub fn drafting_user(query: &str, chunks: &[Chunk]) -> String {
    let context = chunks
        .iter()
        .map(|c| format!("[Source: {}] {}", c.section_heading, c.content))
        .collect::<Vec<_>>()
        .join("\n\n");
    format!("Query: {query}\n\nContext:\n{context}")
}

pub fn review_user(answer: &str, citations: &[String]) -> String {
    let listed = citations
        .iter()
        .map(|c| format!("\"{c}\""))
        .collect::<Vec<_>>()
        .join(", ");
    format!("Answer to Audit:\n{answer}\n\nCitations listed: [{listed}]")
}

pub fn outline_user(text: &str) -> String {
    format!(
        "Analyze this clinical document and identify all headings and their hierarchy.
Return a JSON array of objects with: heading_text, level (1-3), and start_position.

Document:
{}",
        clamp_chars(text, OUTLINE_WINDOW_CHARS)
    )
}

pub fn section_summary_user(heading: &str, content: &str) -> String {
    format!(
        "Summarize this clinical guideline section concisely (2-3 sentences).
Focus on key clinical information, treatments, or recommendations.

Section: {heading}
Content: {}",
        clamp_chars(content, SUMMARY_WINDOW_CHARS)
    )
}

pub fn chapter_summary_user(chapter: &str, section_summaries: &[String]) -> String {
    format!(
        "Create a comprehensive chapter summary from these section summaries.

Chapter: {chapter}
Section summaries:
{}",
        section_summaries.join("\n")
    )
}

pub fn clamp_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(heading: &str, content: &str) -> Chunk {
        Chunk {
            id: 1,
            document_id: "doc".into(),
            section_heading: heading.into(),
            content: content.into(),
        }
    }

    #[test]
    fn toc_lists_each_heading_as_bullet() {
        let prompt = structure_user("q", &["Diagnosis".into(), "Treatment".into()]);
        assert!(prompt.contains("Table of Contents:\n- Diagnosis\n- Treatment"));
    }

    #[test]
    fn drafting_context_tags_sources() {
        let prompt = drafting_user("q", &[chunk("Treatment", "Metformin.")]);
        assert!(prompt.ends_with("[Source: Treatment] Metformin."));
        assert!(!drafting_system(None).contains("rejected"));
        assert!(drafting_system(Some("Cite the dose section")).contains("Feedback: Cite the dose section"));
    }

    #[test]
    fn validation_context_uses_section_blocks() {
        let prompt = validation_user("q", &[chunk("A", "one"), chunk("B", "two")]);
        assert!(prompt.contains("Section: A\nContent: one\n\nSection: B\nContent: two"));
    }

    #[test]
    fn clamp_respects_char_boundaries() {
        assert_eq!(clamp_chars("héllo", 2), "hé");
        assert_eq!(clamp_chars("abc", 10), "abc");
    }
}
