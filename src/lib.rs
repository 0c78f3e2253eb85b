//! # ReportMiner
//!
//! Report ingestion, semantic retrieval and tool-augmented question
//! answering over uploaded business documents.
//!
//! Uploaded PDF, DOCX, XLSX, CSV and plain-text reports are extracted into
//! ordered text segments and structured tables, split into overlapping
//! chunks, embedded, and indexed in a SQLite-backed vector collection.
//! Questions are answered either by plain retrieval-augmented generation or
//! by a bounded agent loop that calls analysis tools.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────┐   ┌──────────────────────────┐   ┌───────────┐
//! │ Uploads │──▶│ Extract → Split → Embed  │──▶│  SQLite   │
//! │ CLI/dir │   │  (ingest orchestrator)   │   │ docs+vecs │
//! └─────────┘   └──────────────────────────┘   └─────┬─────┘
//!                                                    │
//!                  ┌─────────────────┬───────────────┤
//!                  ▼                 ▼               ▼
//!            ┌───────────┐    ┌────────────┐   ┌──────────┐
//!            │ Retrieval │◀───│ Agent loop │──▶│  Tools   │
//!            │  + answer │    │ (bounded)  │   │ registry │
//!            └───────────┘    └────────────┘   └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! reportminer init
//! reportminer ingest ./reports/q3.pdf
//! reportminer ingest-dir ./reports
//! reportminer ask "What was Q3 revenue?" --tools
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Documents, segments, chunks, tables, log entries |
//! | [`error`] | Core error taxonomy |
//! | [`extract`] | Per-format text and table extraction |
//! | [`structured`] | Value inference, delimited blocks, key/value mining |
//! | [`chunk`] | Token-budgeted chunking with overlap |
//! | [`embedding`] | Embedding providers with batching and retry |
//! | [`index`] | Vector collections (SQLite and in-memory) |
//! | [`store`] | Document repository (SQLite and in-memory) |
//! | [`ingest`] | Ingestion state machine and processing log |
//! | [`generation`] | Answer-model providers |
//! | [`retrieval`] | Top-k search and grounded answers |
//! | [`traits`] | Tool trait, registry and provider seam |
//! | [`tools`] | Built-in analysis tools |
//! | [`agent`] | Bounded tool-calling loop |
//! | [`query`] | Query routing with retrieval fallback |
//! | [`connector_fs`] | Local file and directory uploads |
//! | [`commands`] | CLI command implementations |
//! | [`stats`] | Corpus statistics |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |

pub mod agent;
pub mod chunk;
pub mod commands;
pub mod config;
pub mod connector_fs;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod generation;
pub mod index;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod query;
pub mod retrieval;
pub mod stats;
pub mod store;
pub mod structured;
pub mod tools;
pub mod traits;

pub use error::{Error, Result};
