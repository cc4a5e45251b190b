//! Connection rows — the persisted half of the platform adapter manager.

use rusqlite::params;
use tracing::instrument;

use cachibot_core::types::{now_rfc3339, Connection, ConnectionStatus, PlatformKind};

use crate::error::{Result, StoreError};
use crate::store::Store;

const CONNECTION_COLS: &str = "id, bot_id, platform, display_name, status, config, \
                               message_count, last_activity, error_message, auto_connect";

impl Store {
    pub fn create_connection(&self, conn: &Connection) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            &format!(
                "INSERT INTO connections ({CONNECTION_COLS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                conn.id,
                conn.bot_id,
                conn.platform.as_str(),
                conn.display_name,
                conn.status.as_str(),
                serde_json::to_string(&conn.config)?,
                conn.message_count,
                conn.last_activity,
                conn.error_message,
                conn.auto_connect as i64,
            ],
        )?;
        Ok(())
    }

    pub fn get_connection(&self, connection_id: &str) -> Result<Option<Connection>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            &format!("SELECT {CONNECTION_COLS} FROM connections WHERE id = ?1"),
            params![connection_id],
            row_to_connection,
        ) {
            Ok(c) => Ok(Some(c)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    pub fn connections_for_bot(&self, bot_id: &str) -> Result<Vec<Connection>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {CONNECTION_COLS} FROM connections WHERE bot_id = ?1"
        ))?;
        let rows = stmt.query_map(params![bot_id], row_to_connection)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Connections flagged for reconnect after a process restart.
    pub fn auto_connect_connections(&self) -> Result<Vec<Connection>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {CONNECTION_COLS} FROM connections WHERE auto_connect = 1"
        ))?;
        let rows = stmt.query_map([], row_to_connection)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    #[instrument(skip(self))]
    pub fn update_connection_status(
        &self,
        connection_id: &str,
        status: ConnectionStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE connections SET status = ?1, error_message = ?2 WHERE id = ?3",
            params![status.as_str(), error_message, connection_id],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("connection", connection_id));
        }
        Ok(())
    }

    /// Stored statuses are meaningless after a restart — reset them all
    /// before the manager begins auto-connecting.
    pub fn reset_connection_statuses(&self) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE connections SET status = 'disconnected', error_message = NULL",
            [],
        )?;
        Ok(n)
    }

    /// Bump `message_count` and stamp `last_activity` for one dispatched message.
    pub fn record_connection_activity(&self, connection_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE connections
             SET message_count = message_count + 1, last_activity = ?1
             WHERE id = ?2",
            params![now_rfc3339(), connection_id],
        )?;
        Ok(())
    }

    pub fn update_connection_config(
        &self,
        connection_id: &str,
        config: &serde_json::Value,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE connections SET config = ?1 WHERE id = ?2",
            params![serde_json::to_string(config)?, connection_id],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("connection", connection_id));
        }
        Ok(())
    }
}

fn row_to_connection(row: &rusqlite::Row<'_>) -> rusqlite::Result<Connection> {
    let platform: String = row.get(2)?;
    let status: String = row.get(4)?;
    let config: String = row.get(5)?;
    Ok(Connection {
        id: row.get(0)?,
        bot_id: row.get(1)?,
        platform: PlatformKind::parse(&platform).unwrap_or(PlatformKind::Custom),
        display_name: row.get(3)?,
        status: ConnectionStatus::parse(&status).unwrap_or(ConnectionStatus::Disconnected),
        config: serde_json::from_str(&config).unwrap_or(serde_json::Value::Null),
        message_count: row.get(6)?,
        last_activity: row.get(7)?,
        error_message: row.get(8)?,
        auto_connect: row.get::<_, i64>(9)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str, auto: bool) -> Connection {
        Connection {
            id: id.to_string(),
            bot_id: "b-1".to_string(),
            platform: PlatformKind::Telegram,
            display_name: "Main".to_string(),
            status: ConnectionStatus::Connected,
            config: serde_json::json!({"_encrypted": "x", "_nonce": "y", "_salt": "z"}),
            message_count: 0,
            last_activity: None,
            error_message: None,
            auto_connect: auto,
        }
    }

    #[test]
    fn status_reset_on_startup() {
        let store = Store::open_in_memory().unwrap();
        store.create_connection(&sample("c-1", true)).unwrap();
        store.create_connection(&sample("c-2", false)).unwrap();

        assert_eq!(store.reset_connection_statuses().unwrap(), 2);
        let c = store.get_connection("c-1").unwrap().unwrap();
        assert_eq!(c.status, ConnectionStatus::Disconnected);

        let auto = store.auto_connect_connections().unwrap();
        assert_eq!(auto.len(), 1);
        assert_eq!(auto[0].id, "c-1");
    }

    #[test]
    fn activity_counter_increments() {
        let store = Store::open_in_memory().unwrap();
        store.create_connection(&sample("c-1", false)).unwrap();
        store.record_connection_activity("c-1").unwrap();
        store.record_connection_activity("c-1").unwrap();

        let c = store.get_connection("c-1").unwrap().unwrap();
        assert_eq!(c.message_count, 2);
        assert!(c.last_activity.is_some());
    }

    #[test]
    fn missing_connection_errors() {
        let store = Store::open_in_memory().unwrap();
        let err = store
            .update_connection_status("nope", ConnectionStatus::Error, Some("boom"))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }
}
