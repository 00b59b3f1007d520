//! Scope tree and chain resolution.
//!
//! Scopes form a four-level tree: global -> org -> project -> session. The
//! resolver walks a leaf scope upward and returns the inheritance chain most
//! specific first, with `(depth, breadth)` attached for deterministic
//! tie-breaking further down the pipeline.

use crate::error::CoreResult;
use crate::model::{fmt_ts, now, ScopeRef, ScopeType};
use crate::storage::Storage;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One element of a resolved scope chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedScope {
    #[serde(flatten)]
    pub scope: ScopeRef,
    /// Distance from the global root; higher is more specific.
    pub depth: u8,
    /// Position among siblings (registration order); breaks depth ties.
    pub breadth: u32,
}

/// Scope registration and chain resolution.
pub struct ScopeResolver {
    storage: Arc<Storage>,
}

impl ScopeResolver {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Register a scope with its parent. Registering the same scope twice is
    /// a no-op; global needs no registration.
    pub fn register(&self, scope: &ScopeRef, parent_id: Option<&str>) -> CoreResult<()> {
        scope.validate()?;
        if scope.scope_type == ScopeType::Global {
            return Ok(());
        }
        let parent_type = scope.scope_type.parent();
        self.storage.write_tx(|tx| {
            Self::register_tx(tx, scope, parent_type, parent_id)?;
            Ok(())
        })
    }

    /// Transaction-level registration, used by repositories when an entry
    /// arrives for a scope that has not been seen yet.
    pub fn register_tx(
        tx: &Transaction,
        scope: &ScopeRef,
        parent_type: Option<ScopeType>,
        parent_id: Option<&str>,
    ) -> CoreResult<()> {
        if scope.scope_type == ScopeType::Global {
            return Ok(());
        }
        tx.execute(
            "INSERT OR IGNORE INTO scopes (scope_type, scope_id, parent_type, parent_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                scope.scope_type.as_str(),
                scope.id_key(),
                parent_type.map(|t| t.as_str()),
                parent_id,
                fmt_ts(now()),
            ],
        )?;
        Ok(())
    }

    /// Resolve the inheritance chain for a leaf scope, most specific first.
    ///
    /// With `inherit=false` the chain is just the leaf itself. Otherwise the
    /// chain walks parent links up to (and always including) global; missing
    /// ancestors are silently skipped.
    pub fn resolve(&self, leaf: &ScopeRef, inherit: bool) -> CoreResult<Vec<ResolvedScope>> {
        leaf.validate()?;
        self.storage.with_reader(|conn| Self::resolve_on(conn, leaf, inherit))
    }

    fn resolve_on(conn: &Connection, leaf: &ScopeRef, inherit: bool) -> CoreResult<Vec<ResolvedScope>> {
        let mut chain = vec![ResolvedScope {
            scope: leaf.clone(),
            depth: leaf.scope_type.depth(),
            breadth: Self::breadth_of(conn, leaf)?,
        }];
        if !inherit {
            return Ok(chain);
        }

        let mut cursor = leaf.clone();
        while cursor.scope_type != ScopeType::Global {
            let row: Option<(Option<String>, Option<String>)> = conn
                .query_row(
                    "SELECT parent_type, parent_id FROM scopes WHERE scope_type = ?1 AND scope_id = ?2",
                    params![cursor.scope_type.as_str(), cursor.id_key()],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;

            let next = match row {
                Some((Some(ptype), pid)) => {
                    let scope_type: ScopeType = ptype.parse()?;
                    if scope_type == ScopeType::Global {
                        ScopeRef::global()
                    } else {
                        match pid.filter(|p| !p.is_empty()) {
                            Some(pid) => ScopeRef::new(scope_type, pid),
                            // Dangling parent link: fall through to global.
                            None => ScopeRef::global(),
                        }
                    }
                }
                // Unregistered scope or no parent recorded: the remaining
                // ancestors are unknown, so the chain ends at global.
                _ => ScopeRef::global(),
            };

            let breadth = Self::breadth_of(conn, &next)?;
            chain.push(ResolvedScope {
                scope: next.clone(),
                depth: next.scope_type.depth(),
                breadth,
            });
            cursor = next;
        }
        Ok(chain)
    }

    /// Sibling position by registration order; 0 for global and unregistered
    /// scopes.
    fn breadth_of(conn: &Connection, scope: &ScopeRef) -> CoreResult<u32> {
        if scope.scope_type == ScopeType::Global {
            return Ok(0);
        }
        let created: Option<String> = conn
            .query_row(
                "SELECT created_at FROM scopes WHERE scope_type = ?1 AND scope_id = ?2",
                params![scope.scope_type.as_str(), scope.id_key()],
                |r| r.get(0),
            )
            .optional()?;
        let Some(created) = created else {
            return Ok(0);
        };
        let earlier: u32 = conn.query_row(
            "SELECT COUNT(*) FROM scopes
             WHERE scope_type = ?1 AND (created_at < ?2 OR (created_at = ?2 AND scope_id < ?3))",
            params![scope.scope_type.as_str(), created, scope.id_key()],
            |r| r.get(0),
        )?;
        Ok(earlier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, ScopeResolver) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::open_at(&dir.path().join("db.sqlite"), 1000, 1).unwrap());
        (dir, ScopeResolver::new(storage))
    }

    #[test]
    fn test_full_chain_most_specific_first() {
        let (_dir, resolver) = setup();
        resolver
            .register(&ScopeRef::new(ScopeType::Org, "o1"), None)
            .unwrap();
        resolver
            .register(&ScopeRef::new(ScopeType::Project, "p1"), Some("o1"))
            .unwrap();
        resolver
            .register(&ScopeRef::new(ScopeType::Session, "s1"), Some("p1"))
            .unwrap();

        let chain = resolver
            .resolve(&ScopeRef::new(ScopeType::Session, "s1"), true)
            .unwrap();
        let types: Vec<ScopeType> = chain.iter().map(|s| s.scope.scope_type).collect();
        assert_eq!(
            types,
            vec![ScopeType::Session, ScopeType::Project, ScopeType::Org, ScopeType::Global]
        );
        assert!(chain[0].depth > chain[1].depth);
    }

    #[test]
    fn test_missing_ancestors_skip_to_global() {
        let (_dir, resolver) = setup();
        // Session registered with no known project parent.
        resolver
            .register(&ScopeRef::new(ScopeType::Session, "loose"), None)
            .unwrap();
        let chain = resolver
            .resolve(&ScopeRef::new(ScopeType::Session, "loose"), true)
            .unwrap();
        let types: Vec<ScopeType> = chain.iter().map(|s| s.scope.scope_type).collect();
        assert_eq!(types, vec![ScopeType::Session, ScopeType::Global]);
    }

    #[test]
    fn test_no_inherit_returns_single_element() {
        let (_dir, resolver) = setup();
        let leaf = ScopeRef::new(ScopeType::Project, "p1");
        let chain = resolver.resolve(&leaf, false).unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].scope, leaf);
    }

    #[test]
    fn test_unregistered_leaf_still_resolves() {
        let (_dir, resolver) = setup();
        let chain = resolver
            .resolve(&ScopeRef::new(ScopeType::Project, "ghost"), true)
            .unwrap();
        let types: Vec<ScopeType> = chain.iter().map(|s| s.scope.scope_type).collect();
        assert_eq!(types, vec![ScopeType::Project, ScopeType::Global]);
    }

    #[test]
    fn test_breadth_orders_siblings_by_registration() {
        let (_dir, resolver) = setup();
        resolver
            .register(&ScopeRef::new(ScopeType::Project, "pa"), None)
            .unwrap();
        resolver
            .register(&ScopeRef::new(ScopeType::Project, "pb"), None)
            .unwrap();
        let a = resolver
            .resolve(&ScopeRef::new(ScopeType::Project, "pa"), false)
            .unwrap();
        let b = resolver
            .resolve(&ScopeRef::new(ScopeType::Project, "pb"), false)
            .unwrap();
        assert!(a[0].breadth <= b[0].breadth);
    }
}
