//! Credential audit log.
//!
//! Every mutating credential-store call produces exactly one entry. Writes
//! are best-effort: a failed audit insert logs a warning and never fails
//! the mutation it records. Raw values never land here — only masked
//! previews from the redaction rules.

use rusqlite::params;
use uuid::Uuid;

use cachibot_core::types::now_rfc3339;

use crate::error::Result;
use crate::store::Store;

/// Who performed a credential mutation, for the audit trail.
#[derive(Debug, Clone, Default)]
pub struct AuditActor {
    pub user_id: Option<String>,
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub id: String,
    pub bot_id: Option<String>,
    pub user_id: Option<String>,
    pub action: String,
    pub key_name: String,
    pub source: String,
    pub ip_address: Option<String>,
    pub details: serde_json::Value,
    pub timestamp: String,
}

impl Store {
    pub(crate) fn insert_audit(
        &self,
        bot_id: Option<&str>,
        actor: &AuditActor,
        action: &str,
        key_name: &str,
        source: &str,
        details: serde_json::Value,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO env_audit_log
             (id, bot_id, user_id, action, key_name, source, ip_address, details, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                Uuid::new_v4().to_string(),
                bot_id,
                actor.user_id,
                action,
                key_name,
                source,
                actor.ip_address,
                serde_json::to_string(&details)?,
                now_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Best-effort variant — the §4.2 contract for mutation paths.
    pub(crate) fn audit_best_effort(
        &self,
        bot_id: Option<&str>,
        actor: &AuditActor,
        action: &str,
        key_name: &str,
        source: &str,
        details: serde_json::Value,
    ) {
        if let Err(e) = self.insert_audit(bot_id, actor, action, key_name, source, details) {
            tracing::warn!(error = %e, action, key_name, "failed to write audit log entry");
        }
    }

    pub fn audit_entries_for_bot(&self, bot_id: &str, limit: usize) -> Result<Vec<AuditEntry>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, bot_id, user_id, action, key_name, source, ip_address, details, timestamp
             FROM env_audit_log WHERE bot_id = ?1
             ORDER BY timestamp DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![bot_id, limit as i64], |row| {
            let details: String = row.get(7)?;
            Ok(AuditEntry {
                id: row.get(0)?,
                bot_id: row.get(1)?,
                user_id: row.get(2)?,
                action: row.get(3)?,
                key_name: row.get(4)?,
                source: row.get(5)?,
                ip_address: row.get(6)?,
                details: serde_json::from_str(&details).unwrap_or(serde_json::Value::Null),
                timestamp: row.get(8)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}
