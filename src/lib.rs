//! memproxy - per-conversation long-term memory for LLM chat
//!
//! memproxy sits in front of an OpenAI-compatible chat endpoint. Each
//! request is augmented with facts remembered from earlier in the same
//! conversation; each completed exchange is mined for new facts in the
//! background.
//!
//! ## Architecture
//!
//! ```text
//!  client ──► POST /v1/chat/completions
//!               │
//!  ┌────────────▼─────────────────────────────────────────────┐
//!  │                    Orchestrator                          │
//!  │  receive → retrieve → augment → forward → stream → ingest │
//!  └──────┬──────────────────────────────┬──────────────┬─────┘
//!         │                              │              │
//!  ┌──────▼──────────┐          ┌────────▼───────┐  ┌───▼──────────┐
//!  │ RetrievalEngine │          │ upstream LLM   │  │ IngestQueue  │
//!  │ hybrid + MMR    │          │ (SSE relay)    │  │ worker pool  │
//!  └──────┬──────────┘          └────────────────┘  └───┬──────────┘
//!         │ read                                        │ extract, embed,
//!  ┌──────▼──────────────────────────────────────────┐  │ dedup
//!  │ EntryStore ◄── MemoryWriter ◄────────────────────┼──┘
//!  │                 ├─ EvictionManager (max_entries) │
//!  │                 └─ RevisionLog (append-only)     │
//!  └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`gateway`]: proxy endpoint, orchestration and server lifecycle
//! - [`memory`]: entry store, retrieval, eviction and versioning
//! - [`ingest`]: fact extraction pipeline and worker queue
//! - [`providers`]: embedding, extraction and upstream clients
//! - [`api`]: HTTP application assembly
//! - [`config`]: Configuration management

pub mod api;
pub mod config;
pub mod error;
pub mod gateway;
pub mod ingest;
pub mod memory;
pub mod providers;

pub use config::ProxyConfig;
pub use error::{Error, Result};
