//! v001 -- Initial schema creation.
//!
//! Creates the node pool, swarm, cursor, seen-hash and guard tables.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Node pool (replaced wholesale on refresh)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS snode_pool (
    pubkey_ed25519 TEXT PRIMARY KEY NOT NULL,
    pubkey_x25519  TEXT NOT NULL,
    ip             TEXT NOT NULL,
    port           INTEGER NOT NULL,
    version        TEXT NOT NULL            -- JSON array, e.g. [2,8,0]
);

-- ----------------------------------------------------------------
-- Swarms: one row per identity, members as a JSON array of ed25519 keys
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS swarm_nodes (
    pubkey TEXT PRIMARY KEY NOT NULL,
    nodes  TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Retrieve cursors per (snode, conversation, namespace)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS last_hashes (
    snode      TEXT NOT NULL,
    convo_id   TEXT NOT NULL,
    namespace  INTEGER NOT NULL,
    hash       TEXT NOT NULL,
    expires_at INTEGER NOT NULL,            -- unix millis

    PRIMARY KEY (snode, convo_id, namespace)
);

CREATE INDEX IF NOT EXISTS idx_last_hashes_convo ON last_hashes(convo_id);

-- ----------------------------------------------------------------
-- Hashes of messages already handed to the receive pipeline
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS seen_messages (
    hash            TEXT PRIMARY KEY NOT NULL,
    conversation_id TEXT NOT NULL,
    expires_at      INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_seen_messages_expires ON seen_messages(expires_at);

-- ----------------------------------------------------------------
-- Guard nodes, in selection order
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS guard_nodes (
    position       INTEGER PRIMARY KEY NOT NULL,
    pubkey_ed25519 TEXT NOT NULL
);
"#;

/// Apply the v001 migration.
pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}
