use rusqlite::params;

use crate::database::Database;
use crate::error::{Result, StoreError};

impl Database {
    /// ed25519 keys of the persisted guard nodes, in selection order.
    pub fn get_guard_nodes(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT pubkey_ed25519 FROM guard_nodes ORDER BY position ASC")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    pub fn update_guard_nodes(&self, guards: &[String]) -> Result<()> {
        let tx = self.conn().unchecked_transaction()?;
        tx.execute("DELETE FROM guard_nodes", [])?;
        {
            let mut stmt =
                tx.prepare("INSERT INTO guard_nodes (position, pubkey_ed25519) VALUES (?1, ?2)")?;
            for (position, key) in guards.iter().enumerate() {
                stmt.execute(params![position as i64, key])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}
