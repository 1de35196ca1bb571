//! # RAG Harness
//!
//! Answers natural-language questions from a semantic index: retrieve
//! candidate passages, optionally rerank them with a relevance judge, and
//! synthesize an answer from the best ones with a chat model.
//!
//! Each of the three remote collaborators (vector index, judge, chat model)
//! can fail on its own. The pipeline bounds latency, degrades instead of
//! failing where it can, and records a structured trace of every request.
//!
//! ## Architecture
//!
//! ```text
//!            ┌────────────┐   ┌────────────┐   ┌────────────┐
//! query ───▶ │ Retriever  │──▶│  Reranker  │──▶│ Generator  │───▶ answer
//!            │ [HyDE] +   │   │ judge × N  │   │ top-k docs │
//!            │ index.query│   │ (bounded)  │   │ → chat     │
//!            └─────┬──────┘   └─────┬──────┘   └─────┬──────┘
//!                  └────────────────┴────────────────┴──▶ ExecutionTrace
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! rag health
//! rag search "reset a password" --limit 5
//! rag ask "How do I reset my password?" --trace
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`error`] | Provider, configuration, and pipeline errors |
//! | [`models`] | Documents, candidates, score fusion |
//! | [`trace`] | Stage metrics, stage results, execution trace |
//! | [`http`] | Shared HTTP client with retry and backoff |
//! | [`embedding`] | Embedder capability and backends |
//! | [`chat`] | Chat-completion capability and backends |
//! | [`judge`] | Relevance judge capability and backends |
//! | [`index`] | Vector index collaborator (Chroma, in-memory) |
//! | [`prompts`] | Judge, answer, and rewrite prompts |
//! | [`retriever`] | Retrieval stage |
//! | [`reranker`] | Concurrent rerank stage |
//! | [`generator`] | Answer generation stage |
//! | [`pipeline`] | Request orchestration |

pub mod chat;
pub mod config;
pub mod embedding;
pub mod error;
pub mod generator;
pub mod http;
pub mod index;
pub mod judge;
pub mod models;
pub mod pipeline;
pub mod prompts;
pub mod reranker;
pub mod retriever;
pub mod trace;
