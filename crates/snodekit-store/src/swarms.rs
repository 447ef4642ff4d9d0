use std::collections::HashSet;

use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::Result;

impl Database {
    /// ed25519 keys of the swarm stored for `pubkey`; empty when unknown.
    pub fn get_swarm_nodes_for_pubkey(&self, pubkey: &str) -> Result<Vec<String>> {
        let nodes: Option<String> = self
            .conn()
            .query_row(
                "SELECT nodes FROM swarm_nodes WHERE pubkey = ?1",
                params![pubkey],
                |row| row.get(0),
            )
            .optional()?;

        match nodes {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn update_swarm_nodes_for_pubkey(&self, pubkey: &str, nodes: &[String]) -> Result<()> {
        self.conn().execute(
            "INSERT INTO swarm_nodes (pubkey, nodes) VALUES (?1, ?2)
             ON CONFLICT(pubkey) DO UPDATE SET nodes = excluded.nodes",
            params![pubkey, serde_json::to_string(nodes)?],
        )?;
        Ok(())
    }

    /// Remove every swarm member that is not part of `pool` (ed25519 keys).
    /// Returns the number of swarms that changed.
    pub fn clear_out_all_snodes_not_in_pool(&self, pool: &[String]) -> Result<usize> {
        let pool: HashSet<&str> = pool.iter().map(String::as_str).collect();
        let tx = self.conn().unchecked_transaction()?;

        let rows: Vec<(String, String)> = {
            let mut stmt = tx.prepare("SELECT pubkey, nodes FROM swarm_nodes")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut changed = 0;
        for (pubkey, json) in rows {
            let nodes: Vec<String> = serde_json::from_str(&json)?;
            let kept: Vec<&String> = nodes.iter().filter(|n| pool.contains(n.as_str())).collect();
            if kept.len() != nodes.len() {
                tx.execute(
                    "UPDATE swarm_nodes SET nodes = ?1 WHERE pubkey = ?2",
                    params![serde_json::to_string(&kept)?, pubkey],
                )?;
                changed += 1;
            }
        }

        tx.commit()?;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_unknown_pubkey_has_empty_swarm() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_swarm_nodes_for_pubkey("05aa").unwrap().is_empty());
    }

    #[test]
    fn test_update_replaces_swarm() {
        let db = Database::open_in_memory().unwrap();
        db.update_swarm_nodes_for_pubkey("05aa", &keys(&["a", "b"])).unwrap();
        db.update_swarm_nodes_for_pubkey("05aa", &keys(&["c"])).unwrap();
        assert_eq!(db.get_swarm_nodes_for_pubkey("05aa").unwrap(), keys(&["c"]));
    }

    #[test]
    fn test_clear_out_nodes_not_in_pool() {
        let db = Database::open_in_memory().unwrap();
        db.update_swarm_nodes_for_pubkey("05aa", &keys(&["a", "b", "c"])).unwrap();
        db.update_swarm_nodes_for_pubkey("03bb", &keys(&["a"])).unwrap();

        let changed = db.clear_out_all_snodes_not_in_pool(&keys(&["a", "c"])).unwrap();

        assert_eq!(changed, 1);
        assert_eq!(db.get_swarm_nodes_for_pubkey("05aa").unwrap(), keys(&["a", "c"]));
        assert_eq!(db.get_swarm_nodes_for_pubkey("03bb").unwrap(), keys(&["a"]));
    }
}
