//! Prompt templates for every completion the engine makes.
//!
//! Each prompt starts with a one-line task tag (`[task: extract]`, ...) so
//! logs and scripted providers can tell prompts apart. The body comes from
//! `<prompts_dir>/<name>.md` when that file exists, otherwise from the
//! built-in template. Variables use `{{key}}` syntax and are substituted once
//! at build time.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

const SEPARATOR: &str = "\n\n";

/// Completion budget for community and tree summaries.
pub const SUMMARY_MAX_TOKENS: u32 = 400;
/// Completion budget for primer, follow-up and final answers.
pub const ANSWER_MAX_TOKENS: u32 = 800;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptKind {
    Extract,
    ExtractStrict,
    CommunitySummary,
    TreeSummary,
    Primer,
    FollowUp,
    Synthesize,
    Answer,
}

pub const TAG_EXTRACT: &str = "[task: extract]";
pub const TAG_EXTRACT_STRICT: &str = "[task: extract-strict]";
pub const TAG_COMMUNITY_SUMMARY: &str = "[task: community-summary]";
pub const TAG_TREE_SUMMARY: &str = "[task: tree-summary]";
pub const TAG_PRIMER: &str = "[task: primer]";
pub const TAG_FOLLOW_UP: &str = "[task: follow-up]";
pub const TAG_SYNTHESIZE: &str = "[task: synthesize]";
pub const TAG_ANSWER: &str = "[task: answer]";

impl PromptKind {
    pub fn tag(&self) -> &'static str {
        match self {
            PromptKind::Extract => TAG_EXTRACT,
            PromptKind::ExtractStrict => TAG_EXTRACT_STRICT,
            PromptKind::CommunitySummary => TAG_COMMUNITY_SUMMARY,
            PromptKind::TreeSummary => TAG_TREE_SUMMARY,
            PromptKind::Primer => TAG_PRIMER,
            PromptKind::FollowUp => TAG_FOLLOW_UP,
            PromptKind::Synthesize => TAG_SYNTHESIZE,
            PromptKind::Answer => TAG_ANSWER,
        }
    }

    /// Override file looked up in the prompts directory.
    pub fn file_name(&self) -> &'static str {
        match self {
            PromptKind::Extract => "extract.md",
            PromptKind::ExtractStrict => "extract_strict.md",
            PromptKind::CommunitySummary => "community_summary.md",
            PromptKind::TreeSummary => "tree_summary.md",
            PromptKind::Primer => "primer.md",
            PromptKind::FollowUp => "follow_up.md",
            PromptKind::Synthesize => "synthesize.md",
            PromptKind::Answer => "answer.md",
        }
    }

    fn builtin(&self) -> &'static str {
        match self {
            PromptKind::Extract => EXTRACT,
            PromptKind::ExtractStrict => EXTRACT_STRICT,
            PromptKind::CommunitySummary => COMMUNITY_SUMMARY,
            PromptKind::TreeSummary => TREE_SUMMARY,
            PromptKind::Primer => PRIMER,
            PromptKind::FollowUp => FOLLOW_UP,
            PromptKind::Synthesize => SYNTHESIZE,
            PromptKind::Answer => ANSWER,
        }
    }
}

// ── Builder ───────────────────────────────────────────────────────────────────

/// Assembles a prompt from text fragments and template files.
pub struct PromptBuilder {
    prompts_dir: Option<PathBuf>,
    parts: Vec<String>,
    vars: HashMap<String, String>,
}

impl PromptBuilder {
    pub fn new(prompts_dir: Option<PathBuf>) -> Self {
        Self { prompts_dir, parts: Vec::new(), vars: HashMap::new() }
    }

    /// Append `filename` from the prompts directory, or `fallback` when there
    /// is no directory or no such file.
    pub fn layer_or(self, filename: &str, fallback: &str) -> Self {
        let loaded = self.prompts_dir.as_ref().and_then(|dir| {
            let path = dir.join(filename);
            match fs::read_to_string(&path) {
                Ok(text) => Some(text),
                Err(_) => {
                    tracing::debug!("prompt: layer '{}' not found; using built-in", path.display());
                    None
                }
            }
        });
        let text = loaded.as_deref().unwrap_or(fallback);
        self.append(text)
    }

    pub fn append(mut self, text: impl Into<String>) -> Self {
        let s = text.into();
        let trimmed = s.trim();
        if !trimmed.is_empty() {
            self.parts.push(trimmed.to_string());
        }
        self
    }

    pub fn with_vars<'a, I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for (k, v) in vars {
            self.vars.insert(k.to_string(), v.to_string());
        }
        self
    }

    /// Join all parts with blank lines and apply variable substitution in
    /// one left-to-right pass. Substituted values are never rescanned, and
    /// unknown placeholders are left as written.
    pub fn build(self) -> String {
        let template = self.parts.join(SEPARATOR);
        let mut prompt = String::with_capacity(template.len());
        let mut rest = template.as_str();
        while let Some(open) = rest.find("{{") {
            prompt.push_str(&rest[..open]);
            let after = &rest[open + 2..];
            match after.find("}}") {
                Some(close) => {
                    let key = &after[..close];
                    match self.vars.get(key) {
                        Some(value) => prompt.push_str(value),
                        None => {
                            prompt.push_str("{{");
                            prompt.push_str(key);
                            prompt.push_str("}}");
                        }
                    }
                    rest = &after[close + 2..];
                }
                None => {
                    prompt.push_str(&rest[open..]);
                    rest = "";
                }
            }
        }
        prompt.push_str(rest);
        prompt
    }
}

/// The engine's template set, rooted at an optional override directory.
#[derive(Debug, Clone, Default)]
pub struct Prompts {
    dir: Option<PathBuf>,
}

impl Prompts {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    /// Tag line plus template body, ready for `.with_vars(...)` and `.build()`.
    pub fn builder(&self, kind: PromptKind) -> PromptBuilder {
        PromptBuilder::new(self.dir.clone())
            .append(kind.tag())
            .layer_or(kind.file_name(), kind.builtin())
    }

    pub fn render(&self, kind: PromptKind, vars: &[(&str, &str)]) -> String {
        self.builder(kind).with_vars(vars.iter().copied()).build()
    }
}

/// Cut `text` to roughly `budget` tokens (about four characters each),
/// respecting char boundaries.
pub fn truncate_to_tokens(text: &str, budget: usize) -> &str {
    let max_chars = budget.saturating_mul(4);
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// The outermost `{ ... }` span of a completion, ignoring code fences and
/// any prose around the object.
pub fn json_object_span(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

// ── Built-in templates ────────────────────────────────────────────────────────

const EXTRACT: &str = r#"Extract the named entities and the relationships between them from the text below.
Reply with JSON only, in exactly this shape:
{"entities": [{"name": "...", "type": "...", "description": "..."}],
 "relationships": [{"source": "...", "target": "...", "description": "..."}]}
Relationship source and target must be names from the entities list.

Text:
{{text}}"#;

const EXTRACT_STRICT: &str = r#"Your previous reply could not be parsed.
Return one JSON object and nothing else: no prose, no code fences.
Shape: {"entities": [{"name": "", "type": "", "description": ""}], "relationships": [{"source": "", "target": "", "description": ""}]}
Use empty lists when there is nothing to extract.

Text:
{{text}}"#;

const COMMUNITY_SUMMARY: &str = r#"Write a short report on the group of related entities below.
Name the group's main actors, what connects them, and the most important facts.

Entities:
{{entities}}

Relationships:
{{relationships}}"#;

const TREE_SUMMARY: &str = r#"Summarize the passages below into one self-contained paragraph.
Keep names, numbers and dates.

Passages:
{{texts}}"#;

const PRIMER: &str = r#"You are answering a question using high-level community reports.
Question: {{query}}

Reports:
{{context}}

Reply with JSON only:
{"answer": "<best current answer>", "score": <0.0-1.0 confidence>,
 "follow_up_questions": ["<specific question that would improve the answer>", ...]}"#;

const FOLLOW_UP: &str = r#"You are refining an answer to: {{query}}
Answer this sub-question using only the context below.
Sub-question: {{question}}

Context:
{{context}}

Reply with JSON only:
{"answer": "<answer to the sub-question>", "score": <0.0-1.0 how much this adds>,
 "follow_up_questions": ["<further question, if any>", ...]}"#;

const SYNTHESIZE: &str = r#"Combine the findings below into one final answer to: {{query}}
Resolve conflicts in favour of more specific findings. Do not invent facts.

Initial answer:
{{primer}}

Findings:
{{answers}}"#;

const ANSWER: &str = r#"Answer the question using only the context below.
If the context does not contain the answer, say so.
Question: {{query}}

Context:
{{context}}"#;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn render_prefixes_tag_and_substitutes() {
        let p = Prompts::default().render(PromptKind::Extract, &[("text", "Acme hired Jane.")]);
        assert!(p.starts_with(TAG_EXTRACT));
        assert!(p.contains("Acme hired Jane."));
        assert!(!p.contains("{{text}}"));
    }

    #[test]
    fn override_file_replaces_body_but_keeps_tag() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("answer.md"), "Custom: {{query}}").unwrap();
        let p = Prompts::new(Some(tmp.path().to_path_buf()))
            .render(PromptKind::Answer, &[("query", "why?")]);
        assert_eq!(p, format!("{TAG_ANSWER}\n\nCustom: why?"));
    }

    #[test]
    fn substituted_values_are_not_expanded_again() {
        for _ in 0..8 {
            let p = PromptBuilder::new(None)
                .append("Q: {{query}} C: {{context}} X: {{unknown}}")
                .with_vars([("query", "what is {{context}}?"), ("context", "{{query}}")])
                .build();
            assert_eq!(p, "Q: what is {{context}}? C: {{query}} X: {{unknown}}");
        }
        let p = PromptBuilder::new(None).append("tail {{query").with_vars([("query", "q")]).build();
        assert_eq!(p, "tail {{query");
    }

    #[test]
    fn missing_override_falls_back() {
        let tmp = TempDir::new().unwrap();
        let p = Prompts::new(Some(tmp.path().to_path_buf())).render(PromptKind::TreeSummary, &[]);
        assert!(p.contains("Passages:"));
    }

    #[test]
    fn every_kind_has_distinct_tag() {
        let kinds = [
            PromptKind::Extract,
            PromptKind::ExtractStrict,
            PromptKind::CommunitySummary,
            PromptKind::TreeSummary,
            PromptKind::Primer,
            PromptKind::FollowUp,
            PromptKind::Synthesize,
            PromptKind::Answer,
        ];
        let tags: std::collections::HashSet<_> = kinds.iter().map(|k| k.tag()).collect();
        assert_eq!(tags.len(), kinds.len());
    }

    #[test]
    fn json_span_skips_fences_and_prose() {
        let raw = "Sure!\n```json\n{\"a\": {\"b\": 1}}\n```";
        assert_eq!(json_object_span(raw), Some("{\"a\": {\"b\": 1}}"));
        assert_eq!(json_object_span("no json here"), None);
        assert_eq!(json_object_span("} backwards {"), None);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_to_tokens("abcdefgh", 1), "abcd");
        assert_eq!(truncate_to_tokens("ab", 10), "ab");
        assert_eq!(truncate_to_tokens("ééééé", 1), "éééé");
    }
}
