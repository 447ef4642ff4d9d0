use rusqlite::params;

use crate::database::Database;
use crate::error::Result;
use crate::models::SeenMessageHash;

impl Database {
    /// Subset of `hashes` that were already processed.
    pub fn get_seen_messages_by_hash_list(&self, hashes: &[String]) -> Result<Vec<String>> {
        if hashes.is_empty() {
            return Ok(Vec::new());
        }
        let mut stmt = self
            .conn()
            .prepare_cached("SELECT hash FROM seen_messages WHERE hash = ?1")?;
        let mut seen = Vec::new();
        for hash in hashes {
            let mut rows = stmt.query(params![hash])?;
            if rows.next()?.is_some() {
                seen.push(hash.clone());
            }
        }
        Ok(seen)
    }

    pub fn save_seen_message_hashes(&self, items: &[SeenMessageHash]) -> Result<()> {
        let tx = self.conn().unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO seen_messages (hash, conversation_id, expires_at)
                 VALUES (?1, ?2, ?3)",
            )?;
            for item in items {
                stmt.execute(params![item.hash, item.conversation_id, item.expires_at])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn clean_seen_messages(&self, now_ms: i64) -> Result<usize> {
        let affected = self
            .conn()
            .execute("DELETE FROM seen_messages WHERE expires_at <= ?1", params![now_ms])?;
        Ok(affected)
    }
}
