use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::Result;
use crate::models::LastHashRecord;

impl Database {
    pub fn get_last_hash_by_snode(
        &self,
        convo_id: &str,
        snode: &str,
        namespace: i16,
    ) -> Result<Option<String>> {
        let hash = self
            .conn()
            .query_row(
                "SELECT hash FROM last_hashes
                 WHERE snode = ?1 AND convo_id = ?2 AND namespace = ?3",
                params![snode, convo_id, namespace],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hash)
    }

    pub fn update_last_hash(&self, record: &LastHashRecord) -> Result<()> {
        self.conn().execute(
            "INSERT INTO last_hashes (snode, convo_id, namespace, hash, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(snode, convo_id, namespace)
             DO UPDATE SET hash = excluded.hash, expires_at = excluded.expires_at",
            params![
                record.snode,
                record.convo_id,
                record.namespace,
                record.hash,
                record.expires_at,
            ],
        )?;
        Ok(())
    }

    pub fn clear_last_hashes_for_convo_id(&self, convo_id: &str) -> Result<usize> {
        let affected = self
            .conn()
            .execute("DELETE FROM last_hashes WHERE convo_id = ?1", params![convo_id])?;
        Ok(affected)
    }

    pub fn clean_expired_last_hashes(&self, now_ms: i64) -> Result<usize> {
        let affected = self
            .conn()
            .execute("DELETE FROM last_hashes WHERE expires_at <= ?1", params![now_ms])?;
        Ok(affected)
    }
}
