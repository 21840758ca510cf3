//! Shared fixtures: an offline engine over a temp dir with a scripted
//! completion provider that answers by prompt tag.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use hiergraph::config::Config;
use hiergraph::embedding::EmbeddingProvider;
use hiergraph::embedding::providers::hashing::HashingEmbedder;
use hiergraph::engine::prompts::{
    TAG_ANSWER, TAG_COMMUNITY_SUMMARY, TAG_EXTRACT, TAG_EXTRACT_STRICT, TAG_FOLLOW_UP, TAG_PRIMER,
    TAG_SYNTHESIZE, TAG_TREE_SUMMARY,
};
use hiergraph::engine::{Engine, GroupId, IngestBatch};
use hiergraph::llm::providers::scripted::ScriptedProvider;
use hiergraph::llm::{LlmProvider, ProviderError};
use serde_json::json;
use tempfile::TempDir;

pub const DIM: usize = 64;

/// Names the scripted extractor recognises, with their types.
pub const NAMES: [(&str, &str); 12] = [
    ("Acme Corp", "organization"),
    ("ACME CORP.", "Organization"),
    ("Jane Doe", "person"),
    ("Globex", "organization"),
    ("Berlin", "location"),
    ("Initech", "organization"),
    ("Bob Smith", "person"),
    ("Umbrella", "organization"),
    ("Paris", "location"),
    ("Hooli", "organization"),
    ("Carol King", "person"),
    ("Tokyo", "location"),
];

pub const PRIMER_REPLY: &str = r#"{"answer": "Primer answer.", "score": 0.8,
  "follow_up_questions": ["Who works at Acme Corp?", "Where is Globex based?"]}"#;

/// Entities for every known name in the prompt, chained by relationships.
pub fn extraction_reply(prompt: &str) -> String {
    let found: Vec<(&str, &str)> = NAMES.iter().copied().filter(|(n, _)| prompt.contains(n)).collect();
    let entities: Vec<_> = found
        .iter()
        .map(|(name, ty)| json!({"name": name, "type": ty, "description": format!("{name} as mentioned")}))
        .collect();
    let relationships: Vec<_> = found
        .windows(2)
        .map(|w| json!({"source": w[0].0, "target": w[1].0, "description": "appears with"}))
        .collect();
    json!({"entities": entities, "relationships": relationships}).to_string()
}

/// Counts of selected calls made by [`Script`].
#[derive(Clone, Default)]
pub struct Counters {
    pub extractions: Arc<AtomicUsize>,
    pub follow_ups: Arc<AtomicUsize>,
    pub syntheses: Arc<AtomicUsize>,
}

impl Counters {
    pub fn extractions(&self) -> usize {
        self.extractions.load(Ordering::SeqCst)
    }

    pub fn syntheses(&self) -> usize {
        self.syntheses.load(Ordering::SeqCst)
    }
}

/// How the scripted provider answers each task.
#[derive(Clone, Copy, Default)]
pub struct Script {
    pub primer_fails: bool,
    /// Follow-up replies are prose instead of JSON.
    pub follow_up_prose: bool,
    /// Only follow-ups asking this question get a prose reply.
    pub prose_for: Option<&'static str>,
}

pub fn scripted(script: Script, counters: Counters) -> ScriptedProvider {
    ScriptedProvider::new(move |prompt: &str| {
        if prompt.starts_with(TAG_EXTRACT_STRICT) || prompt.starts_with(TAG_EXTRACT) {
            counters.extractions.fetch_add(1, Ordering::SeqCst);
            Ok(extraction_reply(prompt))
        } else if prompt.starts_with(TAG_COMMUNITY_SUMMARY) {
            Ok("These entities appear together in the corpus.".into())
        } else if prompt.starts_with(TAG_TREE_SUMMARY) {
            Ok("A summary of the grouped passages.".into())
        } else if prompt.starts_with(TAG_PRIMER) {
            if script.primer_fails {
                Err(ProviderError::Request("primer offline".into()))
            } else {
                Ok(PRIMER_REPLY.into())
            }
        } else if prompt.starts_with(TAG_FOLLOW_UP) {
            let n = counters.follow_ups.fetch_add(1, Ordering::SeqCst);
            let prose = script.prose_for.is_some_and(|q| prompt.contains(q));
            if script.follow_up_prose || prose {
                Ok("I think it is probably Berlin.".into())
            } else {
                Ok(json!({
                    "answer": format!("Step answer {n}."),
                    "score": 0.9,
                    "follow_up_questions": [format!("Follow-up question {n}?")],
                })
                .to_string())
            }
        } else if prompt.starts_with(TAG_SYNTHESIZE) {
            counters.syntheses.fetch_add(1, Ordering::SeqCst);
            Ok("Synthesized answer.".into())
        } else if prompt.starts_with(TAG_ANSWER) {
            Ok("Flat answer.".into())
        } else {
            Err(ProviderError::Request("unexpected prompt".into()))
        }
    })
}

pub fn config(dir: &Path) -> Config {
    let mut cfg = Config::with_data_dir(dir);
    cfg.embedding.dimension = DIM;
    cfg
}

pub fn open_with(cfg: &Config, provider: ScriptedProvider) -> Engine {
    Engine::open(
        cfg,
        LlmProvider::Scripted(provider),
        EmbeddingProvider::Hashing(HashingEmbedder::new(DIM)),
    )
    .expect("open engine")
}

/// Engine with the default script, plus its temp dir and counters.
pub fn engine() -> (TempDir, Engine, ScriptedProvider, Counters) {
    let temp = TempDir::new().expect("tempdir");
    let counters = Counters::default();
    let provider = scripted(Script::default(), counters.clone());
    let engine = open_with(&config(temp.path()), provider.clone());
    (temp, engine, provider, counters)
}

pub fn batch(group: &str, document: &str, chunks: &[&str]) -> IngestBatch {
    IngestBatch {
        group_id: GroupId::new(group),
        document_id: document.to_string(),
        chunks: chunks.iter().map(|c| c.to_string()).collect(),
    }
}

/// A small corpus in which most names co-occur with several others.
pub fn corpus() -> Vec<String> {
    vec![
        "Acme Corp opened an office in Berlin. Jane Doe leads the Berlin team.".into(),
        "Jane Doe previously worked at Globex with Bob Smith.".into(),
        "Globex and Initech compete for contracts in Paris.".into(),
        "Bob Smith moved to Initech, which later acquired Umbrella.".into(),
        "Umbrella runs a lab in Tokyo managed by Carol King.".into(),
        "Carol King advises Hooli on its expansion to Tokyo and Paris.".into(),
        "Hooli partners with Acme Corp on satellite launches.".into(),
        "Acme Corp hired Carol King after the Hooli partnership.".into(),
    ]
}

pub fn corpus_batch(group: &str) -> IngestBatch {
    IngestBatch { group_id: GroupId::new(group), document_id: "corpus.md".into(), chunks: corpus() }
}
