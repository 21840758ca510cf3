//! hiergraph: a hierarchical knowledge-graph retrieval engine.
//!
//! Documents are ingested as ordered chunks per group. The engine extracts
//! an entity graph, builds a tree of recursive summaries over the chunks,
//! detects hierarchical communities in the graph, and answers queries with
//! flat, community-level or iterative search. See [`engine::Engine`].

pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod llm;
pub mod logger;
