//! Outbound webhook subscribers and their delivery bookkeeping.

use rusqlite::params;
use uuid::Uuid;

use cachibot_core::types::now_rfc3339;

use crate::error::Result;
use crate::store::Store;

/// Subscribers past this many consecutive failed deliveries are skipped
/// until manually reset.
pub const FAILURE_DISABLE_THRESHOLD: i64 = 10;

#[derive(Debug, Clone)]
pub struct WebhookSubscriber {
    pub id: String,
    pub bot_id: String,
    pub url: String,
    pub secret: Option<String>,
    /// Event names this subscriber wants; empty means all events.
    pub events: Vec<String>,
    pub active: bool,
    pub failure_count: i64,
    pub last_triggered_at: Option<String>,
}

impl Store {
    pub fn create_webhook_subscriber(
        &self,
        bot_id: &str,
        url: &str,
        secret: Option<&str>,
        events: &[String],
    ) -> Result<WebhookSubscriber> {
        let sub = WebhookSubscriber {
            id: Uuid::new_v4().to_string(),
            bot_id: bot_id.to_string(),
            url: url.to_string(),
            secret: secret.map(String::from),
            events: events.to_vec(),
            active: true,
            failure_count: 0,
            last_triggered_at: None,
        };
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO webhook_subscribers
             (id, bot_id, url, secret, events, active, failure_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, 0, ?6)",
            params![
                sub.id,
                sub.bot_id,
                sub.url,
                sub.secret,
                serde_json::to_string(&sub.events)?,
                now_rfc3339(),
            ],
        )?;
        Ok(sub)
    }

    /// Active subscribers for a bot that listen to `event` and have not
    /// crossed the failure threshold.
    pub fn webhooks_for_event(&self, bot_id: &str, event: &str) -> Result<Vec<WebhookSubscriber>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, bot_id, url, secret, events, active, failure_count, last_triggered_at
             FROM webhook_subscribers
             WHERE bot_id = ?1 AND active = 1 AND failure_count < ?2",
        )?;
        let rows = stmt.query_map(params![bot_id, FAILURE_DISABLE_THRESHOLD], row_to_subscriber)?;
        Ok(rows
            .filter_map(|r| r.ok())
            .filter(|s| s.events.is_empty() || s.events.iter().any(|e| e == event))
            .collect())
    }

    /// A delivery succeeded: zero the failure counter and stamp the time.
    pub fn record_webhook_success(&self, webhook_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE webhook_subscribers
             SET failure_count = 0, last_triggered_at = ?1 WHERE id = ?2",
            params![now_rfc3339(), webhook_id],
        )?;
        Ok(())
    }

    /// All retries for one delivery failed.
    pub fn record_webhook_failure(&self, webhook_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE webhook_subscribers
             SET failure_count = failure_count + 1 WHERE id = ?1",
            params![webhook_id],
        )?;
        Ok(())
    }

    /// Manual reset — re-enables a subscriber disabled by failures.
    pub fn reset_webhook_failures(&self, webhook_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE webhook_subscribers SET failure_count = 0 WHERE id = ?1",
            params![webhook_id],
        )?;
        Ok(())
    }
}

fn row_to_subscriber(row: &rusqlite::Row<'_>) -> rusqlite::Result<WebhookSubscriber> {
    let events: String = row.get(4)?;
    Ok(WebhookSubscriber {
        id: row.get(0)?,
        bot_id: row.get(1)?,
        url: row.get(2)?,
        secret: row.get(3)?,
        events: serde_json::from_str(&events).unwrap_or_default(),
        active: row.get::<_, i64>(5)? != 0,
        failure_count: row.get(6)?,
        last_triggered_at: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_subscribers_are_excluded() {
        let store = Store::open_in_memory().unwrap();
        let sub = store
            .create_webhook_subscriber("b-1", "https://example.com/hook", None, &[])
            .unwrap();

        for _ in 0..FAILURE_DISABLE_THRESHOLD {
            store.record_webhook_failure(&sub.id).unwrap();
        }
        assert!(store.webhooks_for_event("b-1", "message.sent").unwrap().is_empty());

        store.reset_webhook_failures(&sub.id).unwrap();
        assert_eq!(store.webhooks_for_event("b-1", "message.sent").unwrap().len(), 1);
    }

    #[test]
    fn event_filter_applies() {
        let store = Store::open_in_memory().unwrap();
        store
            .create_webhook_subscriber(
                "b-1",
                "https://example.com/a",
                None,
                &["message.sent".to_string()],
            )
            .unwrap();
        store
            .create_webhook_subscriber("b-1", "https://example.com/b", None, &[])
            .unwrap();

        assert_eq!(store.webhooks_for_event("b-1", "message.sent").unwrap().len(), 2);
        assert_eq!(
            store
                .webhooks_for_event("b-1", "connection.status_changed")
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn success_resets_counter() {
        let store = Store::open_in_memory().unwrap();
        let sub = store
            .create_webhook_subscriber("b-1", "https://example.com/hook", None, &[])
            .unwrap();
        store.record_webhook_failure(&sub.id).unwrap();
        store.record_webhook_success(&sub.id).unwrap();

        let subs = store.webhooks_for_event("b-1", "x").unwrap();
        assert_eq!(subs[0].failure_count, 0);
        assert!(subs[0].last_triggered_at.is_some());
    }
}
