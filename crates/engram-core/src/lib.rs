//! Engram core: a local-first, scope-partitioned, versioned memory store for
//! coding agents.
//!
//! The crate is layered bottom-up:
//!
//! - [`storage`]: embedded SQLite engine with WAL, migrations, one
//!   serialized writer, pooled readers, and a statement cache.
//! - [`model`] / [`repo`]: typed entries (guideline, knowledge, tool,
//!   experience) with append-only version chains, plus evidence, relations,
//!   a property graph, tags, advisory file locks, and the audit log.
//! - [`scope`]: the global/org/project/session inheritance chain.
//! - [`index`]: FTS5 full-text, extracted-entity lookup, and the embedding
//!   store with its async regeneration queue.
//! - [`query`]: the staged pipeline (candidates, filters, composite
//!   ranking, truncation) with an epoch-invalidated result cache.
//! - [`events`]: the synchronous in-process bus that keeps caches, audit,
//!   and subscribers consistent with writes.
//! - [`librarian`]: pattern analysis and background maintenance jobs.
//! - [`export`]: JSON round-trip of entry sets across stores.
//!
//! [`EngramContext::open`] wires the whole thing; there is no global state.

pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod export;
pub mod index;
pub mod librarian;
pub mod model;
pub mod query;
pub mod repo;
pub mod scope;
pub mod storage;

pub use config::{AdminToken, EngramConfig, PermissionMode, RankWeights};
pub use context::{EngramContext, HealthReport};
pub use error::{CoreError, CoreResult, ErrorCode};
pub use events::EventBus;
pub use model::{
    Entry, EntryDraft, EntryKind, EntryPatch, EntryVersion, Evidence, EvidenceDraft,
    ExperienceLevel, FileLock, MemoryEvent, Relation, RelationType, ScopeRef, ScopeType,
};
pub use query::{MemoryQueryParams, QueryEngine, QueryResults};
