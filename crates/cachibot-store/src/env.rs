//! Encrypted environment variables — the credential store.
//!
//! Three parallel tables share the `{ciphertext, nonce, salt}` value shape:
//! per-bot overrides, per-platform defaults, and (plaintext JSON) per-bot
//! skill configs. Writes are upserts; prior ciphertext is replaced whole —
//! history lives in the audit log, not in row versions.

use std::collections::HashMap;

use rusqlite::params;
use tracing::warn;
use uuid::Uuid;

use cachibot_core::redact::mask_value;
use cachibot_core::types::now_rfc3339;
use cachibot_crypto::{EncryptedValue, EncryptionService};

use crate::audit::AuditActor;
use crate::error::Result;
use crate::store::Store;

/// One stored env var with its masked preview — what listings return.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MaskedEnvVar {
    pub id: String,
    pub key: String,
    pub masked_value: String,
    pub source: String,
    pub updated_at: String,
}

struct EnvRow {
    id: String,
    key: String,
    value: EncryptedValue,
    source: String,
    updated_at: String,
}

impl Store {
    // ── Bot scope ─────────────────────────────────────────────────────────

    /// Upsert a per-bot env var. Returns `true` when the key was created,
    /// `false` when an existing value was replaced.
    pub fn upsert_bot_env(
        &self,
        crypto: &EncryptionService,
        bot_id: &str,
        key: &str,
        plaintext: &str,
        source: &str,
        actor: &AuditActor,
    ) -> Result<bool> {
        let enc = crypto.encrypt_value(plaintext, Some(bot_id))?;
        let created = {
            let db = self.db.lock().unwrap();
            let existing: Option<String> = db
                .query_row(
                    "SELECT id FROM bot_environment WHERE bot_id = ?1 AND key = ?2",
                    params![bot_id, key],
                    |row| row.get(0),
                )
                .ok();
            db.execute(
                "INSERT INTO bot_environment
                 (id, bot_id, key, ciphertext, nonce, salt, source, updated_by, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(bot_id, key) DO UPDATE SET
                     ciphertext = excluded.ciphertext,
                     nonce      = excluded.nonce,
                     salt       = excluded.salt,
                     source     = excluded.source,
                     updated_by = excluded.updated_by,
                     updated_at = excluded.updated_at",
                params![
                    Uuid::new_v4().to_string(),
                    bot_id,
                    key,
                    enc.ciphertext,
                    enc.nonce,
                    enc.salt,
                    source,
                    actor.user_id,
                    now_rfc3339(),
                ],
            )?;
            existing.is_none()
        };

        let action = if created { "create" } else { "update" };
        self.audit_best_effort(
            Some(bot_id),
            actor,
            action,
            key,
            "bot",
            serde_json::json!({"masked_value": mask_value(plaintext)}),
        );
        Ok(created)
    }

    /// Delete one per-bot env var. Returns `true` if a row was removed.
    pub fn delete_bot_env(&self, bot_id: &str, key: &str, actor: &AuditActor) -> Result<bool> {
        let removed = {
            let db = self.db.lock().unwrap();
            db.execute(
                "DELETE FROM bot_environment WHERE bot_id = ?1 AND key = ?2",
                params![bot_id, key],
            )? > 0
        };
        if removed {
            self.audit_best_effort(
                Some(bot_id),
                actor,
                "delete",
                key,
                "bot",
                serde_json::Value::Object(Default::default()),
            );
        }
        Ok(removed)
    }

    /// Remove every bot-layer key for a bot. One `reset_all` audit entry.
    pub fn reset_bot_env(&self, bot_id: &str, actor: &AuditActor) -> Result<usize> {
        let removed = {
            let db = self.db.lock().unwrap();
            db.execute(
                "DELETE FROM bot_environment WHERE bot_id = ?1",
                params![bot_id],
            )?
        };
        self.audit_best_effort(
            Some(bot_id),
            actor,
            "reset_all",
            "*",
            "bot",
            serde_json::json!({"removed": removed}),
        );
        Ok(removed)
    }

    /// Decrypt every bot-layer var. Rows that fail to decrypt are skipped
    /// with a warning — one bad row never poisons the resolve.
    pub fn load_bot_env(
        &self,
        crypto: &EncryptionService,
        bot_id: &str,
    ) -> Result<HashMap<String, String>> {
        let rows = self.bot_env_rows(bot_id)?;
        let mut out = HashMap::new();
        for row in rows {
            match crypto.decrypt_value(&row.value, Some(bot_id)) {
                Ok(v) => {
                    out.insert(row.key, v);
                }
                Err(e) => {
                    warn!(row_id = %row.id, key = %row.key, error = %e,
                          "failed to decrypt bot env var");
                }
            }
        }
        Ok(out)
    }

    /// Masked listing for the control plane. A row that fails decryption
    /// degrades to `"****"` rather than aborting the listing.
    pub fn list_bot_env_masked(
        &self,
        crypto: &EncryptionService,
        bot_id: &str,
    ) -> Result<Vec<MaskedEnvVar>> {
        let rows = self.bot_env_rows(bot_id)?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let masked = match crypto.decrypt_value(&row.value, Some(bot_id)) {
                    Ok(plain) => mask_value(&plain),
                    Err(e) => {
                        warn!(row_id = %row.id, error = %e, "masking undecryptable row");
                        "****".to_string()
                    }
                };
                MaskedEnvVar {
                    id: row.id,
                    key: row.key,
                    masked_value: masked,
                    source: row.source,
                    updated_at: row.updated_at,
                }
            })
            .collect())
    }

    fn bot_env_rows(&self, bot_id: &str) -> Result<Vec<EnvRow>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, key, ciphertext, nonce, salt, source, updated_at
             FROM bot_environment WHERE bot_id = ?1 ORDER BY key",
        )?;
        let rows = stmt.query_map(params![bot_id], row_to_env)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ── Platform scope ────────────────────────────────────────────────────

    pub fn upsert_platform_env(
        &self,
        crypto: &EncryptionService,
        platform: &str,
        key: &str,
        plaintext: &str,
        actor: &AuditActor,
    ) -> Result<bool> {
        let enc = crypto.encrypt_value(plaintext, None)?;
        let created = {
            let db = self.db.lock().unwrap();
            let existing: Option<String> = db
                .query_row(
                    "SELECT id FROM platform_environment WHERE platform = ?1 AND key = ?2",
                    params![platform, key],
                    |row| row.get(0),
                )
                .ok();
            db.execute(
                "INSERT INTO platform_environment
                 (id, platform, key, ciphertext, nonce, salt, updated_by, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(platform, key) DO UPDATE SET
                     ciphertext = excluded.ciphertext,
                     nonce      = excluded.nonce,
                     salt       = excluded.salt,
                     updated_by = excluded.updated_by,
                     updated_at = excluded.updated_at",
                params![
                    Uuid::new_v4().to_string(),
                    platform,
                    key,
                    enc.ciphertext,
                    enc.nonce,
                    enc.salt,
                    actor.user_id,
                    now_rfc3339(),
                ],
            )?;
            existing.is_none()
        };

        let action = if created { "create" } else { "update" };
        self.audit_best_effort(
            None,
            actor,
            action,
            key,
            "platform",
            serde_json::json!({"platform": platform, "masked_value": mask_value(plaintext)}),
        );
        Ok(created)
    }

    pub fn delete_platform_env(
        &self,
        platform: &str,
        key: &str,
        actor: &AuditActor,
    ) -> Result<bool> {
        let removed = {
            let db = self.db.lock().unwrap();
            db.execute(
                "DELETE FROM platform_environment WHERE platform = ?1 AND key = ?2",
                params![platform, key],
            )? > 0
        };
        if removed {
            self.audit_best_effort(
                None,
                actor,
                "delete",
                key,
                "platform",
                serde_json::json!({"platform": platform}),
            );
        }
        Ok(removed)
    }

    pub fn load_platform_env(
        &self,
        crypto: &EncryptionService,
        platform: &str,
    ) -> Result<HashMap<String, String>> {
        let rows = {
            let db = self.db.lock().unwrap();
            let mut stmt = db.prepare(
                "SELECT id, key, ciphertext, nonce, salt, 'platform', updated_at
                 FROM platform_environment WHERE platform = ?1 ORDER BY key",
            )?;
            let rows = stmt.query_map(params![platform], row_to_env)?;
            rows.filter_map(|r| r.ok()).collect::<Vec<_>>()
        };

        let mut out = HashMap::new();
        for row in rows {
            match crypto.decrypt_value(&row.value, None) {
                Ok(v) => {
                    out.insert(row.key, v);
                }
                Err(e) => {
                    warn!(row_id = %row.id, key = %row.key, error = %e,
                          "failed to decrypt platform env var");
                }
            }
        }
        Ok(out)
    }

    pub fn list_platform_env_masked(
        &self,
        crypto: &EncryptionService,
        platform: &str,
    ) -> Result<Vec<MaskedEnvVar>> {
        let decrypted = self.load_platform_env(crypto, platform)?;
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, key, updated_at FROM platform_environment
             WHERE platform = ?1 ORDER BY key",
        )?;
        let rows = stmt.query_map(params![platform], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        Ok(rows
            .filter_map(|r| r.ok())
            .map(|(id, key, updated_at)| {
                let masked = decrypted
                    .get(&key)
                    .map(|v| mask_value(v))
                    .unwrap_or_else(|| "****".to_string());
                MaskedEnvVar {
                    id,
                    key,
                    masked_value: masked,
                    source: "platform".to_string(),
                    updated_at,
                }
            })
            .collect())
    }

    // ── Skill configs (plaintext JSON, non-secret) ────────────────────────

    pub fn upsert_skill_config(
        &self,
        bot_id: &str,
        skill_name: &str,
        config: &serde_json::Value,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO skill_configs (id, bot_id, skill_name, config, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(bot_id, skill_name) DO UPDATE SET
                 config = excluded.config, updated_at = excluded.updated_at",
            params![
                Uuid::new_v4().to_string(),
                bot_id,
                skill_name,
                serde_json::to_string(config)?,
                now_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn load_skill_configs(
        &self,
        bot_id: &str,
    ) -> Result<HashMap<String, serde_json::Value>> {
        let db = self.db.lock().unwrap();
        let mut stmt =
            db.prepare("SELECT skill_name, config FROM skill_configs WHERE bot_id = ?1")?;
        let rows = stmt.query_map(params![bot_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut out = HashMap::new();
        for row in rows.filter_map(|r| r.ok()) {
            let (name, raw) = row;
            match serde_json::from_str(&raw) {
                Ok(v) => {
                    out.insert(name, v);
                }
                Err(e) => {
                    warn!(skill = %name, bot_id = %bot_id, error = %e,
                          "invalid JSON in skill config");
                }
            }
        }
        Ok(out)
    }
}

fn row_to_env(row: &rusqlite::Row<'_>) -> rusqlite::Result<EnvRow> {
    Ok(EnvRow {
        id: row.get(0)?,
        key: row.get(1)?,
        value: EncryptedValue {
            ciphertext: row.get(2)?,
            nonce: row.get(3)?,
            salt: row.get(4)?,
        },
        source: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crypto() -> EncryptionService {
        EncryptionService::new([0x42u8; 32])
    }

    #[test]
    fn upsert_then_load_roundtrips() {
        let store = Store::open_in_memory().unwrap();
        let svc = crypto();
        let actor = AuditActor::default();

        let created = store
            .upsert_bot_env(&svc, "b-1", "OPENAI_API_KEY", "sk-old", "user", &actor)
            .unwrap();
        assert!(created);

        let env = store.load_bot_env(&svc, "b-1").unwrap();
        assert_eq!(env.get("OPENAI_API_KEY").map(String::as_str), Some("sk-old"));

        // Update replaces the ciphertext entirely.
        let created = store
            .upsert_bot_env(&svc, "b-1", "OPENAI_API_KEY", "sk-new", "user", &actor)
            .unwrap();
        assert!(!created);
        let env = store.load_bot_env(&svc, "b-1").unwrap();
        assert_eq!(env.get("OPENAI_API_KEY").map(String::as_str), Some("sk-new"));
    }

    #[test]
    fn every_mutation_writes_one_audit_entry() {
        let store = Store::open_in_memory().unwrap();
        let svc = crypto();
        let actor = AuditActor {
            user_id: Some("u-1".to_string()),
            ip_address: Some("10.0.0.1".to_string()),
        };

        store
            .upsert_bot_env(&svc, "b-1", "K", "value-1234", "user", &actor)
            .unwrap();
        store
            .upsert_bot_env(&svc, "b-1", "K", "value-5678", "user", &actor)
            .unwrap();
        store.delete_bot_env("b-1", "K", &actor).unwrap();
        store.reset_bot_env("b-1", &actor).unwrap();

        let entries = store.audit_entries_for_bot("b-1", 10).unwrap();
        assert_eq!(entries.len(), 4);
        let actions: Vec<&str> = entries.iter().map(|e| e.action.as_str()).collect();
        assert!(actions.contains(&"create"));
        assert!(actions.contains(&"update"));
        assert!(actions.contains(&"delete"));
        assert!(actions.contains(&"reset_all"));
    }

    #[test]
    fn audit_details_hold_masked_value_only() {
        let store = Store::open_in_memory().unwrap();
        let svc = crypto();
        let actor = AuditActor::default();
        store
            .upsert_bot_env(&svc, "b-1", "K", "sk-proj-abcdefghij1234567890WXYZ", "user", &actor)
            .unwrap();

        let entries = store.audit_entries_for_bot("b-1", 10).unwrap();
        let details = serde_json::to_string(&entries[0].details).unwrap();
        assert!(!details.contains("sk-proj-abcdefghij1234567890WXYZ"));
        assert!(details.contains("WXYZ"));
    }

    #[test]
    fn masked_listing_degrades_bad_rows() {
        let store = Store::open_in_memory().unwrap();
        let svc = crypto();
        let actor = AuditActor::default();
        store
            .upsert_bot_env(&svc, "b-1", "GOOD", "value-1234", "user", &actor)
            .unwrap();
        store
            .upsert_bot_env(&svc, "b-1", "BAD", "value-5678", "user", &actor)
            .unwrap();

        // Corrupt the BAD row's ciphertext in place.
        {
            let db = store.db.lock().unwrap();
            db.execute(
                "UPDATE bot_environment SET ciphertext = 'AAAA' WHERE key = 'BAD'",
                [],
            )
            .unwrap();
        }

        let listed = store.list_bot_env_masked(&svc, "b-1").unwrap();
        assert_eq!(listed.len(), 2);
        let bad = listed.iter().find(|v| v.key == "BAD").unwrap();
        assert_eq!(bad.masked_value, "****");
        let good = listed.iter().find(|v| v.key == "GOOD").unwrap();
        assert!(good.masked_value.ends_with("1234"));
    }

    #[test]
    fn reset_removes_all_bot_keys() {
        let store = Store::open_in_memory().unwrap();
        let svc = crypto();
        let actor = AuditActor::default();
        store
            .upsert_bot_env(&svc, "b-1", "A", "1", "user", &actor)
            .unwrap();
        store
            .upsert_bot_env(&svc, "b-1", "B", "2", "user", &actor)
            .unwrap();

        assert_eq!(store.reset_bot_env("b-1", &actor).unwrap(), 2);
        assert!(store.load_bot_env(&svc, "b-1").unwrap().is_empty());
    }

    #[test]
    fn platform_env_scoped_separately() {
        let store = Store::open_in_memory().unwrap();
        let svc = crypto();
        let actor = AuditActor::default();
        store
            .upsert_platform_env(&svc, "telegram", "OPENAI_API_KEY", "sk-tg", &actor)
            .unwrap();

        let tg = store.load_platform_env(&svc, "telegram").unwrap();
        assert_eq!(tg.get("OPENAI_API_KEY").map(String::as_str), Some("sk-tg"));
        assert!(store.load_platform_env(&svc, "discord").unwrap().is_empty());
    }

    #[test]
    fn skill_configs_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_skill_config("b-1", "web_search", &serde_json::json!({"depth": 3}))
            .unwrap();
        let configs = store.load_skill_configs("b-1").unwrap();
        assert_eq!(configs["web_search"]["depth"], 3);
    }
}
