//! SQL schema definitions.
//!
//! Creation order matters only for foreign-key references inside this batch
//! (`regions` precedes `nodes`); the replication order of the user-level
//! tables is governed by [`crate::queries::userdata::USER_TABLES`].

/// Complete schema, version 1.
pub const SCHEMA_V1: &str = r#"
-- ============================================================
-- User-level: regions (created early; nodes reference it)
-- ============================================================

CREATE TABLE IF NOT EXISTS regions (
    region_id INTEGER PRIMARY KEY,
    region_name TEXT NOT NULL,
    region_location TEXT,
    created INTEGER NOT NULL DEFAULT 0,
    updated INTEGER NOT NULL DEFAULT 0
);

-- ============================================================
-- Mesh system tables
-- ============================================================

CREATE TABLE IF NOT EXISTS mesh (
    mesh_id TEXT PRIMARY KEY,
    mesh_name TEXT NOT NULL,
    mesh_description TEXT,
    allow_join INTEGER NOT NULL DEFAULT 1,
    split_strategy TEXT NOT NULL DEFAULT 'REQUIRE_MAJORITY',
    status TEXT NOT NULL DEFAULT 'STATUS_ACTIVE',
    created INTEGER NOT NULL DEFAULT 0,
    updated INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS nodes (
    node_id INTEGER PRIMARY KEY,
    node_name TEXT NOT NULL,
    node_description TEXT,
    node_public_key TEXT NOT NULL DEFAULT '',
    ip_address TEXT NOT NULL DEFAULT '',
    port INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'STATUS_OFFLINE',
    seed_node INTEGER NOT NULL DEFAULT 0,
    region_id INTEGER REFERENCES regions(region_id),
    original_region_id INTEGER,
    created INTEGER NOT NULL DEFAULT 0,
    updated INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS mesh_node_membership (
    mesh_id TEXT NOT NULL REFERENCES mesh(mesh_id),
    node_id INTEGER NOT NULL REFERENCES nodes(node_id),
    status TEXT NOT NULL DEFAULT 'ACTIVE',
    joined_at INTEGER NOT NULL DEFAULT 0,
    updated INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (mesh_id, node_id)
);

CREATE TABLE IF NOT EXISTS mesh_consensus_state (
    mesh_id TEXT PRIMARY KEY REFERENCES mesh(mesh_id),
    total_nodes INTEGER NOT NULL,
    online_nodes INTEGER NOT NULL,
    split_detected INTEGER NOT NULL DEFAULT 0,
    majority_side INTEGER NOT NULL DEFAULT 1,
    last_consensus_check INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS mesh_event_log (
    event_id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    originator_node INTEGER NOT NULL,
    affected_node INTEGER NOT NULL DEFAULT 0,
    sequence_number INTEGER NOT NULL,
    event_data TEXT,
    processed INTEGER NOT NULL DEFAULT 0,
    created INTEGER NOT NULL DEFAULT 0,
    UNIQUE (originator_node, sequence_number)
);

CREATE INDEX IF NOT EXISTS idx_event_log_unprocessed
    ON mesh_event_log(processed, created);

CREATE TABLE IF NOT EXISTS mesh_table_versions (
    table_name TEXT PRIMARY KEY,
    version INTEGER NOT NULL DEFAULT 0,
    last_updated INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS routes (
    a_node INTEGER NOT NULL REFERENCES nodes(node_id),
    b_node INTEGER NOT NULL REFERENCES nodes(node_id),
    latency_ms REAL NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'STATUS_ACTIVE',
    created INTEGER NOT NULL DEFAULT 0,
    updated INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (a_node, b_node)
);

CREATE TABLE IF NOT EXISTS localidentity (
    identity_id TEXT PRIMARY KEY
);

-- ============================================================
-- User-level tables, forward dependency order
-- ============================================================

CREATE TABLE IF NOT EXISTS tenants (
    tenant_id INTEGER PRIMARY KEY,
    tenant_name TEXT NOT NULL,
    tenant_description TEXT,
    created INTEGER NOT NULL DEFAULT 0,
    updated INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS users (
    user_id INTEGER PRIMARY KEY,
    tenant_id INTEGER NOT NULL REFERENCES tenants(tenant_id),
    user_email TEXT NOT NULL,
    user_name TEXT,
    user_password_hash TEXT,
    user_enabled INTEGER NOT NULL DEFAULT 1,
    created INTEGER NOT NULL DEFAULT 0,
    updated INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS user_sessions (
    session_id TEXT PRIMARY KEY,
    user_id INTEGER NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
    session_token TEXT NOT NULL,
    expires INTEGER NOT NULL DEFAULT 0,
    created INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS workspaces (
    workspace_id INTEGER PRIMARY KEY,
    tenant_id INTEGER NOT NULL REFERENCES tenants(tenant_id),
    owner_id INTEGER REFERENCES users(user_id),
    workspace_name TEXT NOT NULL,
    workspace_description TEXT,
    created INTEGER NOT NULL DEFAULT 0,
    updated INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS environments (
    environment_id INTEGER PRIMARY KEY,
    workspace_id INTEGER NOT NULL REFERENCES workspaces(workspace_id),
    region_id INTEGER REFERENCES regions(region_id),
    environment_name TEXT NOT NULL,
    created INTEGER NOT NULL DEFAULT 0,
    updated INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS instances (
    instance_id INTEGER PRIMARY KEY,
    environment_id INTEGER NOT NULL REFERENCES environments(environment_id),
    instance_name TEXT NOT NULL,
    instance_type TEXT,
    host TEXT,
    port INTEGER NOT NULL DEFAULT 0,
    created INTEGER NOT NULL DEFAULT 0,
    updated INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS databases (
    database_id INTEGER PRIMARY KEY,
    instance_id INTEGER NOT NULL REFERENCES instances(instance_id),
    database_name TEXT NOT NULL,
    database_vendor TEXT,
    created INTEGER NOT NULL DEFAULT 0,
    updated INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS repos (
    repo_id INTEGER PRIMARY KEY,
    workspace_id INTEGER NOT NULL REFERENCES workspaces(workspace_id),
    repo_name TEXT NOT NULL,
    created INTEGER NOT NULL DEFAULT 0,
    updated INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS branches (
    branch_id INTEGER PRIMARY KEY,
    repo_id INTEGER NOT NULL REFERENCES repos(repo_id),
    branch_name TEXT NOT NULL,
    parent_branch_id INTEGER,
    created INTEGER NOT NULL DEFAULT 0,
    updated INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS commits (
    commit_id INTEGER PRIMARY KEY,
    branch_id INTEGER NOT NULL REFERENCES branches(branch_id),
    commit_message TEXT,
    commit_hash TEXT,
    created INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS mapping_rules (
    mapping_rule_id INTEGER PRIMARY KEY,
    workspace_id INTEGER REFERENCES workspaces(workspace_id),
    rule_name TEXT NOT NULL,
    rule_definition TEXT,
    created INTEGER NOT NULL DEFAULT 0,
    updated INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS mappings (
    mapping_id INTEGER PRIMARY KEY,
    workspace_id INTEGER REFERENCES workspaces(workspace_id),
    mapping_name TEXT NOT NULL,
    created INTEGER NOT NULL DEFAULT 0,
    updated INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS mapping_rule_mappings (
    mapping_rule_id INTEGER NOT NULL REFERENCES mapping_rules(mapping_rule_id),
    mapping_id INTEGER NOT NULL REFERENCES mappings(mapping_id),
    created INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (mapping_rule_id, mapping_id)
);

CREATE TABLE IF NOT EXISTS relationships (
    relationship_id INTEGER PRIMARY KEY,
    mapping_id INTEGER REFERENCES mappings(mapping_id),
    relationship_type TEXT,
    source_ref TEXT,
    target_ref TEXT,
    created INTEGER NOT NULL DEFAULT 0,
    updated INTEGER NOT NULL DEFAULT 0
);
"#;
