use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction};
use tracing::debug;

use super::*;

/// Insert the character if missing and return its row id. Caller owns the transaction.
fn upsert_character_tx(tx: &Transaction, c: &Character) -> Result<i64, LedgerError> {
    let id = tx.query_row(
        "INSERT INTO characters (region, realm, name) VALUES (?1, ?2, ?3) \
         ON CONFLICT(region, realm, name) DO UPDATE SET region = excluded.region \
         RETURNING id",
        params![fold(&c.region), fold(&c.realm), fold(&c.name)],
        |r| r.get(0),
    )?;
    Ok(id)
}

fn character_id(conn: &Connection, c: &Character) -> Result<Option<i64>, LedgerError> {
    let id = conn
        .query_row(
            "SELECT id FROM characters WHERE region = ?1 AND realm = ?2 AND name = ?3",
            params![fold(&c.region), fold(&c.realm), fold(&c.name)],
            |r| r.get(0),
        )
        .optional()?;
    Ok(id)
}

impl KeyStore {
    /// Idempotent by natural key. Returns the character's row id.
    pub fn upsert_character(&self, region: &str, realm: &str, name: &str) -> Result<i64, LedgerError> {
        let c = Character::new(region, realm, name);
        if c.region.is_empty() || c.realm.is_empty() || c.name.is_empty() {
            return Err(LedgerError::Validation("character needs region, realm and name".into()));
        }
        let id = self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let id = upsert_character_tx(&tx, &c)?;
            tx.commit()?;
            Ok(id)
        })?;
        self.mark_dirty();
        Ok(id)
    }

    /// Score refresh: creates the character if needed, then sets its rating.
    pub fn update_character_score(&self, c: &Character, score: f64) -> Result<(), LedgerError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let id = upsert_character_tx(&tx, c)?;
            tx.execute(
                "UPDATE characters SET rating_score = ?1 WHERE id = ?2",
                params![score, id],
            )?;
            tx.commit()?;
            Ok(())
        })?;
        self.mark_dirty();
        Ok(())
    }

    pub fn get_character(&self, c: &Character) -> Result<Option<Character>, LedgerError> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT region, realm, name, rating_score FROM characters \
                     WHERE region = ?1 AND realm = ?2 AND name = ?3",
                    params![fold(&c.region), fold(&c.realm), fold(&c.name)],
                    row_to_character,
                )
                .optional()?;
            Ok(row)
        })
    }

    pub fn list_characters(&self) -> Result<Vec<Character>, LedgerError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT region, realm, name, rating_score FROM characters \
                 ORDER BY region, realm, name",
            )?;
            let rows = stmt
                .query_map([], row_to_character)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Upsert the owning character and the key in one transaction.
    /// On any failure nothing is written. Returns the resolved key id.
    pub fn upsert_completed_key(&self, key: &CompletedKey) -> Result<i64, LedgerError> {
        let completed = validate_key(key)?;
        let key_id = key.resolved_id();
        let owner = key.owner();
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let character_id = upsert_character_tx(&tx, &owner)?;
            tx.execute(
                "INSERT INTO completed_keys \
                 (key_id, character_id, dungeon, key_lvl, run_time_ms, par_time_ms, \
                  completed_at, completed_at_ms, source) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                 ON CONFLICT(key_id, character_id) DO UPDATE SET \
                  dungeon = excluded.dungeon, key_lvl = excluded.key_lvl, \
                  run_time_ms = excluded.run_time_ms, par_time_ms = excluded.par_time_ms, \
                  completed_at = excluded.completed_at, completed_at_ms = excluded.completed_at_ms, \
                  source = excluded.source",
                params![
                    key_id,
                    character_id,
                    key.dungeon,
                    key.key_level,
                    key.run_time_ms,
                    key.par_time_ms,
                    key.completed_at,
                    completed.timestamp_millis(),
                    key.source,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })?;
        debug!(
            character = %owner,
            key_id,
            native_id = key.key_id,
            dungeon = %key.dungeon,
            level = key.key_level,
            "completed key stored"
        );
        self.mark_dirty();
        Ok(key_id)
    }

    /// Remove a character with all of its keys and links, atomically.
    pub fn delete_character(&self, c: &Character) -> Result<(), LedgerError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let id = character_id(&tx, c)?.ok_or_else(|| LedgerError::NotFound(c.to_string()))?;
            tx.execute("DELETE FROM log_links WHERE character_id = ?1", [id])?;
            tx.execute("DELETE FROM completed_keys WHERE character_id = ?1", [id])?;
            tx.execute("DELETE FROM characters WHERE id = ?1", [id])?;
            tx.commit()?;
            Ok(())
        })?;
        self.mark_dirty();
        Ok(())
    }

    /// Drop keys (and their links) completed strictly before `cutoff`.
    pub fn archive_keys_before(&self, cutoff: DateTime<Utc>) -> Result<usize, LedgerError> {
        let cutoff_ms = cutoff.timestamp_millis();
        let n = self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM log_links WHERE EXISTS (\
                   SELECT 1 FROM completed_keys k \
                   WHERE k.key_id = log_links.key_id AND k.character_id = log_links.character_id \
                   AND k.completed_at_ms < ?1)",
                [cutoff_ms],
            )?;
            let n = tx.execute("DELETE FROM completed_keys WHERE completed_at_ms < ?1", [cutoff_ms])?;
            tx.commit()?;
            Ok(n)
        })?;
        if n > 0 {
            self.mark_dirty();
        }
        Ok(n)
    }

    fn query_keys(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<CompletedKey>, LedgerError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt
                .query_map(params, row_to_key)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Keys completed at or after `cutoff`, oldest first.
    pub fn list_keys_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<CompletedKey>, LedgerError> {
        let sql = format!(
            "SELECT {KEY_COLUMNS} FROM completed_keys k JOIN characters c ON c.id = k.character_id \
             WHERE k.completed_at_ms >= ?1 ORDER BY k.completed_at_ms, k.key_id"
        );
        self.query_keys(&sql, &[&cutoff.timestamp_millis()])
    }

    pub fn list_keys_by_character_since(
        &self,
        c: &Character,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<CompletedKey>, LedgerError> {
        let sql = format!(
            "SELECT {KEY_COLUMNS} FROM completed_keys k JOIN characters c ON c.id = k.character_id \
             WHERE c.region = ?1 AND c.realm = ?2 AND c.name = ?3 AND k.completed_at_ms >= ?4 \
             ORDER BY k.completed_at_ms, k.key_id"
        );
        let (region, realm, name) = (fold(&c.region), fold(&c.realm), fold(&c.name));
        self.query_keys(&sql, &[&region, &realm, &name, &cutoff.timestamp_millis()])
    }

    /// Keys since `cutoff` that have no log link yet.
    pub fn list_unlinked_keys_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<CompletedKey>, LedgerError> {
        let sql = format!(
            "SELECT {KEY_COLUMNS} FROM completed_keys k JOIN characters c ON c.id = k.character_id \
             WHERE k.completed_at_ms >= ?1 AND NOT EXISTS (\
               SELECT 1 FROM log_links l WHERE l.key_id = k.key_id AND l.character_id = k.character_id) \
             ORDER BY k.completed_at_ms, k.key_id"
        );
        self.query_keys(&sql, &[&cutoff.timestamp_millis()])
    }

    /// Per-character key counts since `cutoff`, busiest first.
    pub fn count_keys_by_character_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<CountRow>, LedgerError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.region, c.realm, c.name, c.rating_score, COUNT(*) AS key_count \
                 FROM completed_keys k JOIN characters c ON c.id = k.character_id \
                 WHERE k.completed_at_ms >= ?1 \
                 GROUP BY c.id ORDER BY key_count DESC, c.name",
            )?;
            let rows = stmt
                .query_map([cutoff.timestamp_millis()], |r| {
                    Ok(CountRow {
                        character: row_to_character(r)?,
                        key_count: r.get("key_count")?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

#[cfg(test)]
#[path = "keys_tests.rs"]
mod keys_tests;
