//! Schema migrations, applied in order and recorded in the `migrations`
//! table.

/// Ordered migration set. Versions are dense and never renumbered.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Core schema: scopes, entries, versions, evidence, relations, graph, tags, locks, audit",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "Index layer: FTS5 table, entity index, embedding store",
        up: MIGRATION_V2_UP,
    },
    Migration {
        version: 3,
        description: "Feedback and maintenance: outcomes, query feedback, recommendations",
        up: MIGRATION_V3_UP,
    },
];

/// A single schema migration.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub up: &'static str,
}

const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS scopes (
    scope_type TEXT NOT NULL,
    scope_id TEXT NOT NULL DEFAULT '',
    parent_type TEXT NULL,
    parent_id TEXT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (scope_type, scope_id)
);

CREATE TABLE IF NOT EXISTS entries (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    scope_type TEXT NOT NULL,
    scope_id TEXT NOT NULL DEFAULT '',
    name TEXT NULL,
    title TEXT NULL,
    category TEXT NULL,
    priority INTEGER NOT NULL DEFAULT 50,
    level TEXT NULL,
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    current_version_id TEXT NULL
);
CREATE INDEX IF NOT EXISTS idx_entries_scope ON entries(kind, scope_type, scope_id, is_active);
CREATE UNIQUE INDEX IF NOT EXISTS idx_entries_active_name
    ON entries(kind, scope_type, scope_id, name)
    WHERE name IS NOT NULL AND is_active = 1;

CREATE TABLE IF NOT EXISTS entry_versions (
    version_id TEXT PRIMARY KEY,
    entry_id TEXT NOT NULL REFERENCES entries(id) ON DELETE CASCADE,
    version_num INTEGER NOT NULL,
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    change_reason TEXT NULL,
    content TEXT NOT NULL,
    rationale TEXT NULL,
    examples TEXT NOT NULL DEFAULT '[]',
    confidence REAL NULL,
    source TEXT NULL,
    valid_from TEXT NULL,
    valid_until TEXT NULL,
    UNIQUE (entry_id, version_num)
);
CREATE INDEX IF NOT EXISTS idx_entry_versions_entry ON entry_versions(entry_id, version_num);

CREATE TABLE IF NOT EXISTS evidence (
    id TEXT PRIMARY KEY,
    entry_type TEXT NULL,
    entry_id TEXT NULL,
    content TEXT NULL,
    file_path TEXT NULL,
    url TEXT NULL,
    mime_type TEXT NULL,
    file_size INTEGER NULL,
    checksum TEXT NULL,
    snippet_start INTEGER NULL,
    snippet_end INTEGER NULL,
    metric TEXT NULL,
    metric_value REAL NULL,
    metric_unit TEXT NULL,
    metric_baseline REAL NULL,
    source TEXT NULL,
    captured_at TEXT NOT NULL,
    captured_by TEXT NOT NULL,
    tags TEXT NOT NULL DEFAULT '[]',
    is_active INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_evidence_entry ON evidence(entry_type, entry_id);
CREATE INDEX IF NOT EXISTS idx_evidence_source ON evidence(source);

CREATE TABLE IF NOT EXISTS relations (
    id TEXT PRIMARY KEY,
    source_type TEXT NOT NULL,
    source_id TEXT NOT NULL,
    target_type TEXT NOT NULL,
    target_id TEXT NOT NULL,
    relation_type TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (source_type, source_id, target_type, target_id, relation_type)
);
CREATE INDEX IF NOT EXISTS idx_relations_source ON relations(source_type, source_id);
CREATE INDEX IF NOT EXISTS idx_relations_target ON relations(target_type, target_id);

CREATE TABLE IF NOT EXISTS graph_nodes (
    id TEXT PRIMARY KEY,
    node_type TEXT NOT NULL,
    scope_type TEXT NOT NULL,
    scope_id TEXT NOT NULL DEFAULT '',
    name TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    current_version_id TEXT NULL
);
CREATE INDEX IF NOT EXISTS idx_graph_nodes_scope ON graph_nodes(node_type, scope_type, scope_id, is_active);
CREATE INDEX IF NOT EXISTS idx_graph_nodes_name ON graph_nodes(name);

CREATE TABLE IF NOT EXISTS graph_node_versions (
    version_id TEXT PRIMARY KEY,
    node_id TEXT NOT NULL REFERENCES graph_nodes(id) ON DELETE CASCADE,
    version_num INTEGER NOT NULL,
    properties TEXT NOT NULL DEFAULT '{}',
    valid_from TEXT NULL,
    valid_until TEXT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (node_id, version_num)
);

CREATE TABLE IF NOT EXISTS graph_edges (
    id TEXT PRIMARY KEY,
    edge_type TEXT NOT NULL,
    source_id TEXT NOT NULL REFERENCES graph_nodes(id) ON DELETE CASCADE,
    target_id TEXT NOT NULL REFERENCES graph_nodes(id) ON DELETE CASCADE,
    properties TEXT NOT NULL DEFAULT '{}',
    weight REAL NOT NULL DEFAULT 1.0,
    created_at TEXT NOT NULL,
    UNIQUE (edge_type, source_id, target_id)
);
CREATE INDEX IF NOT EXISTS idx_graph_edges_source ON graph_edges(source_id);
CREATE INDEX IF NOT EXISTS idx_graph_edges_target ON graph_edges(target_id);

CREATE TABLE IF NOT EXISTS tags (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS entry_tags (
    entry_type TEXT NOT NULL,
    entry_id TEXT NOT NULL,
    tag_id TEXT NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
    PRIMARY KEY (entry_type, entry_id, tag_id)
);
CREATE INDEX IF NOT EXISTS idx_entry_tags_tag ON entry_tags(tag_id);

CREATE TABLE IF NOT EXISTS file_locks (
    file_path TEXT PRIMARY KEY,
    checked_out_by TEXT NOT NULL,
    checked_out_at TEXT NOT NULL,
    expires_at TEXT NULL,
    metadata TEXT NULL
);

CREATE TABLE IF NOT EXISTS audit_log (
    id TEXT PRIMARY KEY,
    ts TEXT NOT NULL,
    actor TEXT NOT NULL,
    action TEXT NOT NULL,
    entry_type TEXT NULL,
    entry_id TEXT NULL,
    scope_type TEXT NULL,
    scope_id TEXT NULL,
    details TEXT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_ts ON audit_log(ts);
CREATE INDEX IF NOT EXISTS idx_audit_actor_action ON audit_log(actor, action);
"#;

const MIGRATION_V2_UP: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS entry_fts USING fts5(
    entry_id UNINDEXED,
    kind UNINDEXED,
    version_id UNINDEXED,
    name,
    title,
    category,
    content,
    rationale,
    tokenize = 'porter unicode61'
);

CREATE TABLE IF NOT EXISTS entity_index (
    entity TEXT NOT NULL,
    entry_type TEXT NOT NULL,
    entry_id TEXT NOT NULL,
    PRIMARY KEY (entity, entry_type, entry_id)
);
CREATE INDEX IF NOT EXISTS idx_entity_index_entry ON entity_index(entry_type, entry_id);

CREATE TABLE IF NOT EXISTS embeddings (
    entry_type TEXT NOT NULL,
    entry_id TEXT NOT NULL,
    vector BLOB NOT NULL,
    model TEXT NOT NULL,
    dims INTEGER NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (entry_type, entry_id)
);
"#;

const MIGRATION_V3_UP: &str = r#"
CREATE TABLE IF NOT EXISTS experience_outcomes (
    id TEXT PRIMARY KEY,
    entry_id TEXT NOT NULL REFERENCES entries(id) ON DELETE CASCADE,
    success INTEGER NOT NULL,
    note TEXT NULL,
    recorded_by TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_outcomes_entry ON experience_outcomes(entry_id);

CREATE TABLE IF NOT EXISTS query_feedback (
    id TEXT PRIMARY KEY,
    query_text TEXT NOT NULL,
    query_vector BLOB NULL,
    top_entry_ids TEXT NOT NULL DEFAULT '[]',
    outcome TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_query_feedback_outcome ON query_feedback(outcome, recorded_at);

CREATE TABLE IF NOT EXISTS recommendations (
    id TEXT PRIMARY KEY,
    scope_type TEXT NOT NULL,
    scope_id TEXT NOT NULL DEFAULT '',
    kind TEXT NOT NULL,
    summary TEXT NOT NULL,
    payload TEXT NOT NULL DEFAULT '{}',
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL,
    decided_at TEXT NULL,
    decided_by TEXT NULL
);
CREATE INDEX IF NOT EXISTS idx_recommendations_status ON recommendations(status, created_at);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_are_dense_and_ordered() {
        for (i, m) in MIGRATIONS.iter().enumerate() {
            assert_eq!(m.version as usize, i + 1);
            assert!(!m.up.trim().is_empty());
        }
    }
}
