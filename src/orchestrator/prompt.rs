//! Prompt composition for C7 — context formatting, chat-history rendering,
//! and the module-scoped default system prompt.
//!
//! Ported from the teacher's reqwest-based `services/llm_service.rs` call
//! sites onto this crate's own `format_documents` / chat-history-join
//! shape, matched field-for-field against the original Python
//! `modules/llm.py::format_documents` (same `Document i [k: v, ...]:\n<text>\n`
//! layout, same five stable metadata fields).

use crate::corpus::model::{MetaValue, RankedDocument};

const STABLE_FIELDS: [&str; 5] = ["date", "title", "source", "corpus", "page"];

/// `Document i [k: v, ...]:\n<text>\n`, one block per retrieved document,
/// restricted to the five stable metadata fields per §4.7.
pub fn format_context_block(docs: &[RankedDocument]) -> String {
    let mut blocks = Vec::with_capacity(docs.len());
    for (i, ranked) in docs.iter().enumerate() {
        let fields: Vec<String> = STABLE_FIELDS
            .iter()
            .filter_map(|key| {
                let value = ranked.document.metadata.get(*key)?;
                let rendered = match value {
                    MetaValue::Text(s) => s.clone(),
                    MetaValue::Int(n) => n.to_string(),
                    MetaValue::List(items) => items.join(", "),
                };
                Some(format!("{key}: {rendered}"))
            })
            .collect();
        blocks.push(format!(
            "Document {} [{}]:\n{}\n",
            i + 1,
            fields.join(", "),
            ranked.document.text
        ));
    }
    blocks.join("\n")
}

/// `User: <x>\nAssistant: <y>\n...`, in chronological order.
pub fn render_chat_history(history: &[(String, String)]) -> String {
    let mut out = String::new();
    for (user, assistant) in history {
        out.push_str("User: ");
        out.push_str(user);
        out.push_str("\nAssistant: ");
        out.push_str(assistant);
        out.push('\n');
    }
    out
}

/// Builds the final prompt string: cached `<system>\n\nContext information
/// is below.\n<context>\n\n` portion, then rendered history, then the
/// question, then the literal `Answer:` continuation cue.
pub fn compose_user_turn(cached_prefix: &str, history: &[(String, String)], question: &str) -> String {
    let mut prompt = cached_prefix.to_string();
    prompt.push_str(&render_chat_history(history));
    prompt.push_str(question.trim());
    prompt.push_str("\nAnswer:");
    prompt
}

/// Text the orchestrator substitutes for a literal `{answer}` placeholder
/// that an LLM occasionally echoes back verbatim from a malformed prompt
/// template, per the original `llm.py` placeholder-detection clause.
pub const PLACEHOLDER_FALLBACK: &str =
    "I need more specific information to answer this question based on the provided context.";

pub const PLACEHOLDER_PATTERN: &str = "{answer}";

/// Replaces every occurrence of the literal placeholder with the fixed
/// fallback sentence, logging when it fires (it should never fire against
/// a well-formed prompt, so a warning is appropriate rather than debug).
pub fn scrub_placeholder(chunk: &str) -> String {
    if chunk.contains(PLACEHOLDER_PATTERN) {
        tracing::warn!("detected literal placeholder text in LLM output chunk");
        chunk.replace(PLACEHOLDER_PATTERN, PLACEHOLDER_FALLBACK)
    } else {
        chunk.to_string()
    }
}

/// Default system prompt, built from the same components as the Python
/// corpus (role, corpus guidance, task rules, citation/evidence/uncertainty
/// handling) but scoped to the retriever module in play, since Hansard has
/// no single correspondent the way Darwin's letters do.
pub fn default_system_prompt(retriever_module: &str) -> String {
    let (subject, guidance) = match retriever_module {
        "hansard" => (
            "early Australasian and British parliamentary debate records (the 1901 Hansard corpus)",
            "Pay attention to the jurisdiction and sitting date of each excerpt, since the three \
             parliaments debated related questions independently.",
        ),
        _ => (
            "Charles Darwin's correspondence, scientific work, and the intellectual context of \
             19th-century natural history",
            "Pay attention to chronological context and to whether a letter was sent or received \
             by Darwin, since his views evolved considerably over his lifetime.",
        ),
    };

    format!(
        "You are an expert historical research assistant specializing in {subject}. \
         Present your findings in a clear, authoritative manner without unnecessary references \
         to your access to documents. {guidance} \
         Answer questions based primarily on the provided context documents; keep responses \
         concise and directly supported by the evidence, and include specific details from the \
         source material. Write naturally without citation markers, since citations are generated \
         separately. If the provided evidence is insufficient, state this plainly rather than \
         making assumptions, and never fall back to placeholder or generic text."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::model::Document;

    fn ranked_with(fields: &[(&str, MetaValue)], text: &str) -> RankedDocument {
        let mut doc = Document::new("p", 0, text);
        for (k, v) in fields {
            doc = doc.with_meta(*k, v.clone());
        }
        RankedDocument::new(doc, 0.0, 0)
    }

    #[test]
    fn context_block_only_includes_stable_fields() {
        let doc = ranked_with(
            &[
                ("title", MetaValue::Text("On the Origin".into())),
                ("internal_id", MetaValue::Text("should-not-appear".into())),
            ],
            "body text",
        );
        let block = format_context_block(&[doc]);
        assert!(block.contains("title: On the Origin"));
        assert!(!block.contains("internal_id"));
        assert!(block.starts_with("Document 1 ["));
    }

    #[test]
    fn scrub_placeholder_replaces_literal_pattern() {
        let scrubbed = scrub_placeholder("The answer is {answer} indeed.");
        assert!(!scrubbed.contains("{answer}"));
        assert!(scrubbed.contains(PLACEHOLDER_FALLBACK));
    }

    #[test]
    fn scrub_placeholder_is_noop_without_pattern() {
        assert_eq!(scrub_placeholder("plain text"), "plain text");
    }

    #[test]
    fn chat_history_renders_in_order() {
        let history = vec![
            ("hi".to_string(), "hello".to_string()),
            ("how are you".to_string(), "well".to_string()),
        ];
        let rendered = render_chat_history(&history);
        assert_eq!(rendered, "User: hi\nAssistant: hello\nUser: how are you\nAssistant: well\n");
    }
}
