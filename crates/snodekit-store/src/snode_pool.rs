use rusqlite::params;

use snodekit_shared::Snode;

use crate::database::Database;
use crate::error::{Result, StoreError};

impl Database {
    pub fn get_snode_pool(&self) -> Result<Vec<Snode>> {
        let mut stmt = self.conn().prepare(
            "SELECT ip, port, pubkey_x25519, pubkey_ed25519, version
             FROM snode_pool ORDER BY rowid ASC",
        )?;
        let rows = stmt.query_map([], row_to_snode)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// Replace the whole pool in one transaction.
    pub fn update_snode_pool(&self, nodes: &[Snode]) -> Result<()> {
        let tx = self.conn().unchecked_transaction()?;
        tx.execute("DELETE FROM snode_pool", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO snode_pool
                    (pubkey_ed25519, pubkey_x25519, ip, port, version)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for node in nodes {
                stmt.execute(params![
                    node.pubkey_ed25519,
                    node.pubkey_x25519,
                    node.ip,
                    node.port,
                    serde_json::to_string(&node.storage_server_version)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

fn row_to_snode(row: &rusqlite::Row<'_>) -> rusqlite::Result<Snode> {
    let version_json: String = row.get(4)?;
    let storage_server_version: Vec<u16> = serde_json::from_str(&version_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Snode {
        ip: row.get(0)?,
        port: row.get(1)?,
        pubkey_x25519: row.get(2)?,
        pubkey_ed25519: row.get(3)?,
        storage_server_version,
    })
}
