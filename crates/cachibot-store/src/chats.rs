//! Chat and message rows.

use rusqlite::params;
use uuid::Uuid;

use cachibot_core::types::{now_rfc3339, Chat, PlatformKind, StoredMessage};

use crate::error::{Result, StoreError};
use crate::store::Store;

const CHAT_COLS: &str =
    "id, bot_id, title, platform, platform_chat_id, pinned, archived, created_at, updated_at";

impl Store {
    /// Look up the chat bound to `(bot_id, platform, platform_chat_id)`,
    /// creating it when absent.
    ///
    /// Returns `None` when the chat exists but is archived — the caller
    /// must silently drop the inbound message in that case.
    pub fn get_or_create_platform_chat(
        &self,
        bot_id: &str,
        platform: PlatformKind,
        platform_chat_id: &str,
        title: &str,
    ) -> Result<Option<Chat>> {
        let db = self.db.lock().unwrap();

        let existing = db
            .query_row(
                &format!(
                    "SELECT {CHAT_COLS} FROM chats
                     WHERE bot_id = ?1 AND platform = ?2 AND platform_chat_id = ?3"
                ),
                params![bot_id, platform.as_str(), platform_chat_id],
                row_to_chat,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(StoreError::Database(other)),
            })?;

        if let Some(chat) = existing {
            if chat.archived {
                return Ok(None);
            }
            return Ok(Some(chat));
        }

        let now = now_rfc3339();
        let chat = Chat {
            id: Uuid::new_v4().to_string(),
            bot_id: bot_id.to_string(),
            title: title.to_string(),
            platform: Some(platform),
            platform_chat_id: Some(platform_chat_id.to_string()),
            pinned: false,
            archived: false,
            created_at: now.clone(),
            updated_at: now,
        };
        db.execute(
            &format!("INSERT INTO chats ({CHAT_COLS}) VALUES (?1, ?2, ?3, ?4, ?5, 0, 0, ?6, ?7)"),
            params![
                chat.id,
                chat.bot_id,
                chat.title,
                platform.as_str(),
                platform_chat_id,
                chat.created_at,
                chat.updated_at,
            ],
        )?;
        Ok(Some(chat))
    }

    pub fn get_chat(&self, chat_id: &str) -> Result<Option<Chat>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            &format!("SELECT {CHAT_COLS} FROM chats WHERE id = ?1"),
            params![chat_id],
            row_to_chat,
        ) {
            Ok(c) => Ok(Some(c)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    pub fn touch_chat(&self, chat_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE chats SET updated_at = ?1 WHERE id = ?2",
            params![now_rfc3339(), chat_id],
        )?;
        Ok(())
    }

    pub fn set_chat_archived(&self, chat_id: &str, archived: bool) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE chats SET archived = ?1 WHERE id = ?2",
            params![archived as i64, chat_id],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("chat", chat_id));
        }
        Ok(())
    }

    pub fn save_message(&self, msg: &StoredMessage) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO messages (id, bot_id, chat_id, role, content, reply_to_id, metadata, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                msg.id,
                msg.bot_id,
                msg.chat_id,
                msg.role,
                msg.content,
                msg.reply_to_id,
                serde_json::to_string(&msg.metadata)?,
                msg.timestamp,
            ],
        )?;
        Ok(())
    }

    /// The last `limit` messages for a chat, oldest first.
    pub fn recent_messages(&self, chat_id: &str, limit: usize) -> Result<Vec<StoredMessage>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, bot_id, chat_id, role, content, reply_to_id, metadata, timestamp
             FROM messages WHERE chat_id = ?1
             ORDER BY timestamp DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![chat_id, limit as i64], row_to_message)?;
        let mut messages: Vec<StoredMessage> = rows.filter_map(|r| r.ok()).collect();
        messages.reverse();
        Ok(messages)
    }
}

fn row_to_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chat> {
    let platform: Option<String> = row.get(3)?;
    Ok(Chat {
        id: row.get(0)?,
        bot_id: row.get(1)?,
        title: row.get(2)?,
        platform: platform.as_deref().and_then(PlatformKind::parse),
        platform_chat_id: row.get(4)?,
        pinned: row.get::<_, i64>(5)? != 0,
        archived: row.get::<_, i64>(6)? != 0,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let metadata: String = row.get(6)?;
    Ok(StoredMessage {
        id: row.get(0)?,
        bot_id: row.get(1)?,
        chat_id: row.get(2)?,
        role: row.get(3)?,
        content: row.get(4)?,
        reply_to_id: row.get(5)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        timestamp: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_chat_is_reused() {
        let store = Store::open_in_memory().unwrap();
        let a = store
            .get_or_create_platform_chat("b-1", PlatformKind::Telegram, "42", "Telegram: ana")
            .unwrap()
            .unwrap();
        let b = store
            .get_or_create_platform_chat("b-1", PlatformKind::Telegram, "42", "ignored")
            .unwrap()
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.title, "Telegram: ana");
    }

    #[test]
    fn archived_chat_yields_none() {
        let store = Store::open_in_memory().unwrap();
        let chat = store
            .get_or_create_platform_chat("b-1", PlatformKind::Telegram, "42", "t")
            .unwrap()
            .unwrap();
        store.set_chat_archived(&chat.id, true).unwrap();

        let result = store
            .get_or_create_platform_chat("b-1", PlatformKind::Telegram, "42", "t")
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn recent_messages_oldest_first() {
        let store = Store::open_in_memory().unwrap();
        for i in 0..5 {
            store
                .save_message(&StoredMessage {
                    id: format!("m-{i}"),
                    bot_id: "b-1".to_string(),
                    chat_id: "c-1".to_string(),
                    role: "user".to_string(),
                    content: format!("msg {i}"),
                    reply_to_id: None,
                    metadata: serde_json::Value::Null,
                    timestamp: format!("2026-01-01T00:00:0{i}Z"),
                })
                .unwrap();
        }
        let recent = store.recent_messages("c-1", 3).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].content, "msg 2");
        assert_eq!(recent[2].content, "msg 4");
    }
}
