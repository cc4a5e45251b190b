use rusqlite::Connection;

use crate::error::Result;

/// Initialise all tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    create_identity_tables(conn)?;
    create_connection_tables(conn)?;
    create_chat_tables(conn)?;
    create_env_tables(conn)?;
    create_knowledge_tables(conn)?;
    create_webhook_tables(conn)?;
    Ok(())
}

fn create_identity_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            id            TEXT PRIMARY KEY,
            username      TEXT NOT NULL UNIQUE,
            email         TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            is_admin      INTEGER NOT NULL DEFAULT 0,
            created_at    TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS bots (
            id            TEXT PRIMARY KEY,
            name          TEXT NOT NULL,
            model         TEXT NOT NULL,
            system_prompt TEXT NOT NULL DEFAULT '',
            capabilities  TEXT NOT NULL DEFAULT '{}',
            models        TEXT,
            owner_user_id TEXT NOT NULL,
            created_at    TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_bots_owner
            ON bots(owner_user_id);",
    )?;
    Ok(())
}

fn create_connection_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS connections (
            id            TEXT PRIMARY KEY,
            bot_id        TEXT NOT NULL,
            platform      TEXT NOT NULL,
            display_name  TEXT NOT NULL DEFAULT '',
            status        TEXT NOT NULL DEFAULT 'disconnected',
            config        TEXT NOT NULL DEFAULT '{}',
            message_count INTEGER NOT NULL DEFAULT 0,
            last_activity TEXT,
            error_message TEXT,
            auto_connect  INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_connections_bot
            ON connections(bot_id);",
    )?;
    Ok(())
}

fn create_chat_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS chats (
            id               TEXT PRIMARY KEY,
            bot_id           TEXT NOT NULL,
            title            TEXT NOT NULL,
            platform         TEXT,
            platform_chat_id TEXT,
            pinned           INTEGER NOT NULL DEFAULT 0,
            archived         INTEGER NOT NULL DEFAULT 0,
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL,
            UNIQUE(bot_id, platform, platform_chat_id)
        );
        CREATE TABLE IF NOT EXISTS messages (
            id          TEXT PRIMARY KEY,
            bot_id      TEXT NOT NULL,
            chat_id     TEXT NOT NULL,
            role        TEXT NOT NULL,
            content     TEXT NOT NULL,
            reply_to_id TEXT,
            metadata    TEXT NOT NULL DEFAULT '{}',
            timestamp   TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_chat
            ON messages(chat_id, timestamp);",
    )?;
    Ok(())
}

fn create_env_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS bot_environment (
            id         TEXT PRIMARY KEY,
            bot_id     TEXT NOT NULL,
            key        TEXT NOT NULL,
            ciphertext TEXT NOT NULL,
            nonce      TEXT NOT NULL,
            salt       TEXT NOT NULL,
            source     TEXT NOT NULL DEFAULT 'user',
            updated_by TEXT,
            updated_at TEXT NOT NULL,
            UNIQUE(bot_id, key)
        );
        CREATE TABLE IF NOT EXISTS platform_environment (
            id         TEXT PRIMARY KEY,
            platform   TEXT NOT NULL,
            key        TEXT NOT NULL,
            ciphertext TEXT NOT NULL,
            nonce      TEXT NOT NULL,
            salt       TEXT NOT NULL,
            updated_by TEXT,
            updated_at TEXT NOT NULL,
            UNIQUE(platform, key)
        );
        CREATE TABLE IF NOT EXISTS skill_configs (
            id         TEXT PRIMARY KEY,
            bot_id     TEXT NOT NULL,
            skill_name TEXT NOT NULL,
            config     TEXT NOT NULL DEFAULT '{}',
            updated_at TEXT NOT NULL,
            UNIQUE(bot_id, skill_name)
        );
        CREATE TABLE IF NOT EXISTS env_audit_log (
            id         TEXT PRIMARY KEY,
            bot_id     TEXT,
            user_id    TEXT,
            action     TEXT NOT NULL,
            key_name   TEXT NOT NULL,
            source     TEXT NOT NULL,
            ip_address TEXT,
            details    TEXT NOT NULL DEFAULT '{}',
            timestamp  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_audit_bot
            ON env_audit_log(bot_id, timestamp DESC);",
    )?;
    Ok(())
}

fn create_knowledge_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS notes (
            id         TEXT PRIMARY KEY,
            bot_id     TEXT NOT NULL,
            title      TEXT NOT NULL,
            content    TEXT NOT NULL,
            tags       TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_notes_bot
            ON notes(bot_id, updated_at DESC);
        CREATE TABLE IF NOT EXISTS contacts (
            id         TEXT PRIMARY KEY,
            bot_id     TEXT NOT NULL,
            name       TEXT NOT NULL,
            details    TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS skills (
            id           TEXT PRIMARY KEY,
            bot_id       TEXT NOT NULL,
            name         TEXT NOT NULL,
            instructions TEXT NOT NULL,
            enabled      INTEGER NOT NULL DEFAULT 1,
            UNIQUE(bot_id, name)
        );
        CREATE TABLE IF NOT EXISTS custom_instructions (
            bot_id     TEXT PRIMARY KEY,
            content    TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS knowledge_chunks (
            id                TEXT PRIMARY KEY,
            bot_id            TEXT NOT NULL,
            document_filename TEXT NOT NULL,
            content           TEXT NOT NULL,
            embedding         BLOB NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_chunks_bot
            ON knowledge_chunks(bot_id);",
    )?;
    Ok(())
}

fn create_webhook_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS webhook_subscribers (
            id                TEXT PRIMARY KEY,
            bot_id            TEXT NOT NULL,
            url               TEXT NOT NULL,
            secret            TEXT,
            events            TEXT NOT NULL DEFAULT '[]',
            active            INTEGER NOT NULL DEFAULT 1,
            failure_count     INTEGER NOT NULL DEFAULT 0,
            last_triggered_at TEXT,
            created_at        TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_webhooks_bot
            ON webhook_subscribers(bot_id);",
    )?;
    Ok(())
}
