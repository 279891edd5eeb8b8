//! Prompt assembly for grounded answers.

use crate::fusion::ContextPayload;
use crate::models::{ChatMessage, Role};

/// Default context budget in characters.
pub const DEFAULT_MAX_CONTEXT_CHARS: usize = 120_000;

const PREAMBLE: &str =
    "You are a helpful assistant answering questions from the documents the user has provided.";

const GROUNDED_RULES: &str = "\
Instructions:
- Answer only from the context above, not from general knowledge.
- Prefer specific, detailed passages over introductions and summaries.
- Cite page numbers or chapters for every claim you take from the context.
- When sources disagree, present each view with its source.
- If the context does not cover the question, say so.
- Quote important statements directly, with their citation.
- Format the answer in Markdown: **bold** key terms, lists for multiple points, > quotes for excerpts, fenced code blocks with a language for code.";

const NO_CONTEXT_RULES: &str = "\
Instructions:
- Tell the user that the uploaded documents do not contain information relevant to the question.
- Suggest uploading further documents or rephrasing the question.
- Do not answer from general knowledge.
- Format the answer in Markdown.";

/// Renders a question, its context, and prior turns into one prompt.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    max_context_chars: usize,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONTEXT_CHARS)
    }
}

impl PromptBuilder {
    pub fn new(max_context_chars: usize) -> Self {
        Self { max_context_chars }
    }

    /// Builds the full prompt.
    ///
    /// Context entries are added in order until the next one would push the
    /// context past the character budget; the rest are dropped. An empty
    /// payload yields the no-context prompt.
    pub fn build(&self, question: &str, context: &ContextPayload, history: &[ChatMessage]) -> String {
        let entries = self.render_entries(context);
        let history = render_history(history);

        if entries.is_empty() {
            return format!(
                "{PREAMBLE}\n\nContext: No relevant context was found in the uploaded documents for this question.{history}\n\nUser Question: {question}\n\n{NO_CONTEXT_RULES}\n\nAnswer:"
            );
        }

        let context_text = entries.join("\n\n");
        format!(
            "{PREAMBLE}\n\nContext from relevant document sections:\n{context_text}{history}\n\nUser Question: {question}\n\n{GROUNDED_RULES}\n\nAnswer:"
        )
    }

    fn render_entries(&self, context: &ContextPayload) -> Vec<String> {
        let rendered: Vec<String> = match context {
            ContextPayload::Chunks(chunks) => chunks
                .iter()
                .map(|c| {
                    let source = c
                        .attribution()
                        .unwrap_or_else(|| "Document content".to_string());
                    format!("{}\n[Source: {}]", c.content, source)
                })
                .collect(),
            ContextPayload::Texts(texts) => texts.clone(),
        };

        let mut used = 0;
        let mut kept = Vec::with_capacity(rendered.len());
        for entry in rendered {
            let len = entry.chars().count();
            if used + len > self.max_context_chars {
                break;
            }
            used += len;
            kept.push(entry);
        }
        kept
    }
}

fn render_history(history: &[ChatMessage]) -> String {
    if history.is_empty() {
        return String::new();
    }
    let lines: Vec<String> = history
        .iter()
        .map(|m| {
            let speaker = match m.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            format!("{}: {}", speaker, m.content)
        })
        .collect();
    format!("\n\nPrevious conversation:\n{}\n", lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Chunk;

    fn chunk(content: &str, chapter: Option<&str>, page: Option<u32>) -> Chunk {
        Chunk {
            id: "c".into(),
            document_id: "d".into(),
            content: content.into(),
            page_number: page,
            chapter: chapter.map(String::from),
            has_code: false,
            code_language: None,
            sequence_number: 0,
            parent_chunk_id: None,
            parent_content: None,
            embedding: None,
        }
    }

    #[test]
    fn test_chunk_entries_carry_source() {
        let payload = ContextPayload::Chunks(vec![
            chunk("Alpha text", Some("One"), Some(4)),
            chunk("Beta text", None, None),
        ]);
        let prompt = PromptBuilder::default().build("What?", &payload, &[]);
        assert!(prompt.contains("Alpha text\n[Source: Chapter: One, Page 4]"));
        assert!(prompt.contains("Beta text\n[Source: Document content]"));
        assert!(prompt.contains("User Question: What?"));
        assert!(prompt.ends_with("Answer:"));
        assert!(!prompt.contains("Previous conversation"));
    }

    #[test]
    fn test_text_entries_verbatim() {
        let payload = ContextPayload::Texts(vec!["[Compliance Control: AC-1]\nTitle: X".into()]);
        let prompt = PromptBuilder::default().build("q", &payload, &[]);
        assert!(prompt.contains("sections:\n[Compliance Control: AC-1]\nTitle: X\n\nUser Question"));
        assert!(!prompt.contains("[Source:"));
    }

    #[test]
    fn test_budget_drops_overflowing_entries() {
        let payload = ContextPayload::Texts(vec!["a".repeat(60), "b".repeat(60), "c".repeat(10)]);
        let prompt = PromptBuilder::new(100).build("q", &payload, &[]);
        assert!(prompt.contains(&"a".repeat(60)));
        assert!(!prompt.contains(&"b".repeat(60)));
        // Stops at the first entry that does not fit.
        assert!(!prompt.contains(&"c".repeat(10)));
    }

    #[test]
    fn test_empty_payload_uses_no_context_prompt() {
        let prompt = PromptBuilder::default().build("q", &ContextPayload::default(), &[]);
        assert!(prompt.contains("No relevant context"));

        let too_big = ContextPayload::Texts(vec!["x".repeat(50)]);
        let prompt = PromptBuilder::new(10).build("q", &too_big, &[]);
        assert!(prompt.contains("No relevant context"));
    }

    #[test]
    fn test_history_rendering() {
        let history = vec![
            ChatMessage {
                role: Role::User,
                content: "Hi".into(),
            },
            ChatMessage {
                role: Role::Assistant,
                content: "Hello".into(),
            },
        ];
        let payload = ContextPayload::Texts(vec!["ctx".into()]);
        let prompt = PromptBuilder::default().build("q", &payload, &history);
        assert!(prompt.contains("Previous conversation:\nUser: Hi\nAssistant: Hello\n"));
    }
}
