//! Repositories: typed CRUD over the core tables.
//!
//! Each repository owns its tables; nothing else writes to them. Writes go
//! through [`crate::storage::Storage::write_tx`] and update the maintained
//! indices plus the audit log inside the same transaction, then emit events
//! on the bus.

pub mod audit;
pub mod entries;
pub mod evidence;
pub mod graph;
pub mod lock;
pub mod relation;
pub mod tag;

pub use audit::{AuditFilter, AuditRepo};
pub use entries::{EntriesRepo, EntryFilter, PromoteResult};
pub use evidence::{EvidenceFilter, EvidenceRepo};
pub use graph::{GraphPath, GraphRepo, NodeFilter};
pub use lock::{AcquireOutcome, LockFilter, LockRepo};
pub use relation::RelationRepo;
pub use tag::TagRepo;
