use rusqlite::{params, OptionalExtension};
use tracing::debug;

use super::*;

impl KeyStore {
    /// Insert-or-ignore on (key, report, fight, pull). Returns whether a row
    /// was added; an existing link is success, not an error.
    pub fn insert_link(&self, link: &LogLink) -> Result<bool, LedgerError> {
        if link.report_code.trim().is_empty() {
            return Err(LedgerError::Validation("link needs a report code".into()));
        }
        let owner = Character::new(&link.region, &link.realm, &link.character);
        let inserted = self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let character_id: i64 = tx
                .query_row(
                    "SELECT id FROM characters WHERE region = ?1 AND realm = ?2 AND name = ?3",
                    params![owner.region, owner.realm, owner.name],
                    |r| r.get(0),
                )
                .optional()?
                .ok_or_else(|| LedgerError::NotFound(owner.to_string()))?;
            let exists = tx
                .query_row(
                    "SELECT 1 FROM completed_keys WHERE key_id = ?1 AND character_id = ?2",
                    params![link.key_id, character_id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if !exists {
                return Err(LedgerError::NotFound(format!("key {} for {owner}", link.key_id)));
            }
            let url = if link.url.is_empty() { None } else { Some(link.url.as_str()) };
            let n = tx.execute(
                "INSERT OR IGNORE INTO log_links \
                 (key_id, character_id, report_code, fight_id, pull_id, url) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![link.key_id, character_id, link.report_code.trim(), link.fight_id, link.pull_id, url],
            )?;
            tx.commit()?;
            Ok(n > 0)
        })?;
        if inserted {
            debug!(key_id = link.key_id, report = %link.report_code, "log link stored");
            self.mark_dirty();
        }
        Ok(inserted)
    }

    pub fn list_links_for_key(&self, key: &CompletedKey) -> Result<Vec<LogLink>, LedgerError> {
        let owner = key.owner();
        let key_id = key.resolved_id();
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT l.key_id, c.region, c.realm, c.name, l.report_code, l.fight_id, \
                 l.pull_id, l.url, l.inserted_at \
                 FROM log_links l JOIN characters c ON c.id = l.character_id \
                 WHERE l.key_id = ?1 AND c.region = ?2 AND c.realm = ?3 AND c.name = ?4 \
                 ORDER BY l.id",
            )?;
            let rows = stmt
                .query_map(params![key_id, owner.region, owner.realm, owner.name], |r| {
                    Ok(LogLink {
                        key_id: r.get(0)?,
                        region: r.get(1)?,
                        realm: r.get(2)?,
                        character: r.get(3)?,
                        report_code: r.get(4)?,
                        fight_id: r.get(5)?,
                        pull_id: r.get(6)?,
                        url: r.get::<_, Option<String>>(7)?.unwrap_or_default(),
                        inserted_at: r.get(8)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}
