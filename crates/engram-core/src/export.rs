//! JSON export and import.
//!
//! An export with `include_versions` captures enough to round-trip an entry
//! set into an empty store: identity, full version chains, tags, and the
//! relations among exported entries. Import preserves ids so relations stay
//! valid.

use crate::error::{CoreError, CoreResult};
use crate::model::{now, Entry, EntryPatch, EntryVersion, Relation, ScopeRef};
use crate::repo::{EntriesRepo, EntryFilter, RelationRepo, TagRepo};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

/// How import treats an entry whose id already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStrategy {
    #[default]
    Skip,
    Update,
}

/// One exported entry with its optional history and tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedEntry {
    pub entry: Entry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub versions: Option<Vec<EntryVersion>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// A self-contained export bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportBundle {
    pub exported_at: DateTime<Utc>,
    #[serde(flatten)]
    pub scope: ScopeRef,
    pub include_versions: bool,
    pub entries: Vec<ExportedEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relations: Vec<Relation>,
}

/// Import counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportStats {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub relations: usize,
}

pub struct Exporter {
    entries: Arc<EntriesRepo>,
    relations: Arc<RelationRepo>,
    tags: Arc<TagRepo>,
}

impl Exporter {
    pub fn new(entries: Arc<EntriesRepo>, relations: Arc<RelationRepo>, tags: Arc<TagRepo>) -> Self {
        Self {
            entries,
            relations,
            tags,
        }
    }

    /// Export the active entries of one scope (no inheritance), plus the
    /// relations whose two ends are both in the set.
    pub fn export(&self, scope: &ScopeRef, include_versions: bool) -> CoreResult<ExportBundle> {
        scope.validate()?;
        let listed = self.entries.list(&EntryFilter {
            scopes: vec![scope.clone()],
            ..Default::default()
        })?;

        let mut exported = Vec::with_capacity(listed.len());
        let mut exported_ids = HashSet::new();
        for entry in listed {
            let versions = if include_versions {
                Some(self.entries.history(entry.kind, &entry.id)?)
            } else {
                None
            };
            let tags = self.tags.tags_of(entry.kind, &entry.id)?;
            exported_ids.insert(entry.id.clone());
            exported.push(ExportedEntry {
                entry,
                versions,
                tags,
            });
        }

        let mut relations = Vec::new();
        let mut seen = HashSet::new();
        for e in &exported {
            for rel in self.relations.list_for(e.entry.kind, &e.entry.id)? {
                if exported_ids.contains(&rel.source_id)
                    && exported_ids.contains(&rel.target_id)
                    && seen.insert(rel.id.clone())
                {
                    relations.push(rel);
                }
            }
        }

        info!(scope = %scope, entries = exported.len(), "export complete");
        Ok(ExportBundle {
            exported_at: now(),
            scope: scope.clone(),
            include_versions,
            entries: exported,
            relations,
        })
    }

    /// Import a bundle. Ids are preserved; conflicts follow `strategy`.
    pub fn import(
        &self,
        bundle: &ExportBundle,
        strategy: ConflictStrategy,
        actor: &str,
    ) -> CoreResult<ImportStats> {
        let mut stats = ImportStats::default();
        for item in &bundle.entries {
            let existing = self.entries.get(item.entry.kind, &item.entry.id);
            match existing {
                Err(CoreError::NotFound { .. }) => {
                    self.entries.import_entry(
                        &item.entry,
                        item.versions.as_deref(),
                        &item.tags,
                        actor,
                    )?;
                    stats.created += 1;
                }
                Ok(_) => match strategy {
                    ConflictStrategy::Skip => stats.skipped += 1,
                    ConflictStrategy::Update => {
                        let patch = EntryPatch {
                            name: item.entry.name.clone(),
                            title: item.entry.title.clone(),
                            category: item.entry.category.clone(),
                            priority: Some(item.entry.priority),
                            content: Some(item.entry.current.content.clone()),
                            rationale: item.entry.current.rationale.clone(),
                            examples: Some(item.entry.current.examples.clone()),
                            confidence: item.entry.current.confidence,
                            source: item.entry.current.source.clone(),
                            valid_from: item.entry.current.valid_from,
                            valid_until: item.entry.current.valid_until,
                            change_reason: Some("import".to_string()),
                        };
                        self.entries
                            .update(item.entry.kind, &item.entry.id, &patch, actor)?;
                        for t in &item.tags {
                            self.tags.attach(item.entry.kind, &item.entry.id, t)?;
                        }
                        stats.updated += 1;
                    }
                },
                Err(e) => return Err(e),
            }
        }

        for rel in &bundle.relations {
            match self.relations.create(
                (rel.source_type, &rel.source_id),
                (rel.target_type, &rel.target_id),
                rel.relation_type,
                actor,
            ) {
                Ok(_) => stats.relations += 1,
                // Already present (re-import) is fine.
                Err(CoreError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        info!(
            created = stats.created,
            updated = stats.updated,
            skipped = stats.skipped,
            "import complete"
        );
        Ok(stats)
    }
}

/// Round-trip helper for the JSON wire format.
pub fn bundle_to_json(bundle: &ExportBundle) -> CoreResult<String> {
    Ok(serde_json::to_string_pretty(bundle)?)
}

pub fn bundle_from_json(json: &str) -> CoreResult<ExportBundle> {
    Ok(serde_json::from_str(json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::model::{EntryDraft, EntryKind, RelationType, ScopeType};
    use crate::storage::Storage;

    fn setup(dir: &tempfile::TempDir, name: &str) -> (Arc<EntriesRepo>, Arc<RelationRepo>, Exporter) {
        let storage = Arc::new(Storage::open_at(&dir.path().join(name), 1000, 1).unwrap());
        let bus = Arc::new(EventBus::new());
        let entries = Arc::new(EntriesRepo::new(storage.clone(), bus.clone()));
        let relations = Arc::new(RelationRepo::new(storage.clone()));
        let tags = Arc::new(TagRepo::new(storage));
        let exporter = Exporter::new(entries.clone(), relations.clone(), tags);
        (entries, relations, exporter)
    }

    #[test]
    fn test_export_import_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let (entries, relations, exporter) = setup(&dir, "src.sqlite");
        let scope = ScopeRef::new(ScopeType::Project, "p1");

        let a = entries
            .create(
                &EntryDraft::new(EntryKind::Knowledge, scope.clone(), "tester")
                    .with_title("DB choice")
                    .with_content("PostgreSQL")
                    .with_tags(vec!["db".into()]),
            )
            .unwrap();
        // Give it history.
        entries
            .update(
                EntryKind::Knowledge,
                &a.id,
                &EntryPatch {
                    content: Some("MySQL".into()),
                    change_reason: Some("switched".into()),
                    ..Default::default()
                },
                "tester",
            )
            .unwrap();
        let b = entries
            .create(
                &EntryDraft::new(EntryKind::Guideline, scope.clone(), "tester")
                    .with_name("no-any")
                    .with_content("Never use 'any'"),
            )
            .unwrap();
        relations
            .create(
                (EntryKind::Guideline, &b.id),
                (EntryKind::Knowledge, &a.id),
                RelationType::AppliesTo,
                "tester",
            )
            .unwrap();

        let bundle = exporter.export(&scope, true).unwrap();
        assert_eq!(bundle.entries.len(), 2);
        assert_eq!(bundle.relations.len(), 1);

        // Wire-format round trip.
        let bundle = bundle_from_json(&bundle_to_json(&bundle).unwrap()).unwrap();

        let (dst_entries, dst_relations, dst_exporter) = setup(&dir, "dst.sqlite");
        let stats = dst_exporter
            .import(&bundle, ConflictStrategy::Update, "importer")
            .unwrap();
        assert_eq!(stats.created, 2);
        assert_eq!(stats.relations, 1);

        let imported = dst_entries.get(EntryKind::Knowledge, &a.id).unwrap();
        assert_eq!(imported.current.content, "MySQL");
        assert_eq!(imported.version_num, 2);
        let history = dst_entries.history(EntryKind::Knowledge, &a.id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(
            dst_relations
                .list_for(EntryKind::Guideline, &b.id)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_reimport_skips_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let (entries, _relations, exporter) = setup(&dir, "src.sqlite");
        let scope = ScopeRef::new(ScopeType::Project, "p1");
        entries
            .create(
                &EntryDraft::new(EntryKind::Knowledge, scope.clone(), "tester")
                    .with_title("t")
                    .with_content("c"),
            )
            .unwrap();

        let bundle = exporter.export(&scope, false).unwrap();
        let stats = exporter
            .import(&bundle, ConflictStrategy::Skip, "importer")
            .unwrap();
        assert_eq!(stats.created, 0);
        assert_eq!(stats.skipped, 1);
    }
}
