//! Bot and user rows.

use rusqlite::params;
use uuid::Uuid;

use cachibot_core::types::{now_rfc3339, Bot};

use crate::error::{Result, StoreError};
use crate::store::Store;

/// A registered control-plane user.
#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub is_admin: bool,
    pub created_at: String,
}

impl Store {
    pub fn create_bot(&self, bot: &Bot) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO bots (id, name, model, system_prompt, capabilities, models, owner_user_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                bot.id,
                bot.name,
                bot.model,
                bot.system_prompt,
                serde_json::to_string(&bot.capabilities)?,
                bot.models
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                bot.owner_user_id,
                bot.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_bot(&self, bot_id: &str) -> Result<Option<Bot>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, name, model, system_prompt, capabilities, models, owner_user_id, created_at
             FROM bots WHERE id = ?1",
            params![bot_id],
            row_to_bot,
        ) {
            Ok(bot) => Ok(Some(bot)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Delete a bot and every row keyed by its ID.
    pub fn delete_bot(&self, bot_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let tx = db.unchecked_transaction()?;
        for table in [
            "connections",
            "chats",
            "messages",
            "bot_environment",
            "skill_configs",
            "notes",
            "contacts",
            "skills",
            "custom_instructions",
            "knowledge_chunks",
            "webhook_subscribers",
        ] {
            tx.execute(
                &format!("DELETE FROM {table} WHERE bot_id = ?1"),
                params![bot_id],
            )?;
        }
        tx.execute("DELETE FROM bots WHERE id = ?1", params![bot_id])?;
        tx.commit()?;
        Ok(())
    }

    pub fn create_user(
        &self,
        username: &str,
        email: &str,
        password_hash: &str,
        is_admin: bool,
    ) -> Result<User> {
        let user = User {
            id: Uuid::new_v4().to_string(),
            username: username.to_string(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            is_admin,
            created_at: now_rfc3339(),
        };
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO users (id, username, email, password_hash, is_admin, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user.id,
                user.username,
                user.email,
                user.password_hash,
                user.is_admin as i64,
                user.created_at,
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict {
                    kind: "user",
                    value: username.to_string(),
                }
            }
            other => StoreError::Database(other),
        })?;
        Ok(user)
    }

    pub fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, username, email, password_hash, is_admin, created_at
             FROM users WHERE id = ?1",
            params![user_id],
            row_to_user,
        ) {
            Ok(user) => Ok(Some(user)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Look up a user by username or email (login accepts either).
    pub fn find_user(&self, username_or_email: &str) -> Result<Option<User>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, username, email, password_hash, is_admin, created_at
             FROM users WHERE username = ?1 OR email = ?1",
            params![username_or_email],
            row_to_user,
        ) {
            Ok(user) => Ok(Some(user)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }
}

fn row_to_bot(row: &rusqlite::Row<'_>) -> rusqlite::Result<Bot> {
    let capabilities: String = row.get(4)?;
    let models: Option<String> = row.get(5)?;
    Ok(Bot {
        id: row.get(0)?,
        name: row.get(1)?,
        model: row.get(2)?,
        system_prompt: row.get(3)?,
        capabilities: serde_json::from_str(&capabilities).unwrap_or_default(),
        models: models.and_then(|m| serde_json::from_str(&m).ok()),
        owner_user_id: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        is_admin: row.get::<_, i64>(4)? != 0,
        created_at: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bot(id: &str) -> Bot {
        Bot {
            id: id.to_string(),
            name: "Test Bot".to_string(),
            model: "openai/gpt-4o".to_string(),
            system_prompt: "You are helpful.".to_string(),
            capabilities: Default::default(),
            models: None,
            owner_user_id: "u-1".to_string(),
            created_at: now_rfc3339(),
        }
    }

    #[test]
    fn bot_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        store.create_bot(&sample_bot("b-1")).unwrap();
        let bot = store.get_bot("b-1").unwrap().unwrap();
        assert_eq!(bot.name, "Test Bot");
        assert!(store.get_bot("nope").unwrap().is_none());
    }

    #[test]
    fn delete_bot_cascades() {
        let store = Store::open_in_memory().unwrap();
        store.create_bot(&sample_bot("b-1")).unwrap();
        store.set_custom_instructions("b-1", "be brief").unwrap();
        store.delete_bot("b-1").unwrap();
        assert!(store.get_bot("b-1").unwrap().is_none());
        assert!(store.get_custom_instructions("b-1").unwrap().is_none());
    }

    #[test]
    fn duplicate_username_conflicts() {
        let store = Store::open_in_memory().unwrap();
        store.create_user("ana", "ana@example.com", "h", false).unwrap();
        let err = store
            .create_user("ana", "other@example.com", "h", false)
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }
}
