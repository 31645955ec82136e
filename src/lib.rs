//! # Knowledge Harness
//!
//! Tenant-isolated, incremental document ingestion and hybrid retrieval for
//! retrieval-augmented answering.
//!
//! Source files (docx, pptx, xlsx, pdf, txt, md) are split into ordered
//! sections, each section is chunked, embedded and stored independently,
//! and progress is tracked per section so a single bad paragraph never
//! forces a full re-ingestion. Queries combine vector similarity, lexical
//! (FTS5) ranking and optional knowledge-graph facts, always scoped to one
//! tenant.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌───────────────────┐   ┌───────────┐
//! │ Scanner  │──▶│ Extractor│──▶│ Chunk+Embed+Graph │──▶│  SQLite   │
//! │ hash/cmp │   │ sections │   │  (per section)    │   │ FTS5+Vec  │
//! └──────────┘   └──────────┘   └───────────────────┘   └─────┬─────┘
//!                                                             │
//!                                                      ┌──────▼──────┐
//!                                                      │  Retrieval  │
//!                                                      │ sim/lex/hyb │
//!                                                      └─────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types and status state machines |
//! | [`error`] | Error taxonomy |
//! | [`scan`] | Tree walking, fingerprinting, change classification |
//! | [`extract`] | Section extraction per file format |
//! | [`chunk`] | Fixed-window and semantic chunking |
//! | [`boundary`] | Language-model boundary inference |
//! | [`embedding`] | Embedding providers and the batching embedder |
//! | [`graph`] | Knowledge-graph episode submission |
//! | [`store`] | Tenant-scoped persistence |
//! | [`ingest`] | Ingestion orchestration |
//! | [`search`] | Similarity, lexical, hybrid and graph retrieval |
//! | [`retry`] | Bounded exponential backoff |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod boundary;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod graph;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod retry;
pub mod scan;
pub mod search;
pub mod store;
