//! Knowledge-base rows: notes, contacts, skills, custom instructions, and
//! embedded document chunks with in-process cosine search.

use rusqlite::params;
use uuid::Uuid;

use cachibot_core::types::now_rfc3339;

use crate::error::Result;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct Note {
    pub id: String,
    pub bot_id: String,
    pub title: String,
    pub content: String,
    pub tags: Vec<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct Contact {
    pub id: String,
    pub name: String,
    pub details: String,
}

#[derive(Debug, Clone)]
pub struct Skill {
    pub id: String,
    pub name: String,
    pub instructions: String,
    pub enabled: bool,
}

/// One retrieved chunk with its similarity score.
#[derive(Debug, Clone)]
pub struct ChunkHit {
    pub document_filename: String,
    pub content: String,
    pub score: f32,
}

impl Store {
    // ── Notes ─────────────────────────────────────────────────────────────

    pub fn create_note(&self, bot_id: &str, title: &str, content: &str, tags: &[String]) -> Result<Note> {
        let now = now_rfc3339();
        let note = Note {
            id: Uuid::new_v4().to_string(),
            bot_id: bot_id.to_string(),
            title: title.to_string(),
            content: content.to_string(),
            tags: tags.to_vec(),
            updated_at: now.clone(),
        };
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO notes (id, bot_id, title, content, tags, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                note.id,
                note.bot_id,
                note.title,
                note.content,
                serde_json::to_string(&note.tags)?,
                now,
            ],
        )?;
        Ok(note)
    }

    /// Notes whose title or content matches the query text, best-match first.
    pub fn search_notes(&self, bot_id: &str, query: &str, limit: usize) -> Result<Vec<Note>> {
        let pattern = format!("%{}%", query.replace('%', "").replace('_', ""));
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, bot_id, title, content, tags, updated_at
             FROM notes
             WHERE bot_id = ?1 AND (title LIKE ?2 OR content LIKE ?2)
             ORDER BY updated_at DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![bot_id, pattern, limit as i64], row_to_note)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn recent_notes(&self, bot_id: &str, limit: usize) -> Result<Vec<Note>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, bot_id, title, content, tags, updated_at
             FROM notes WHERE bot_id = ?1
             ORDER BY updated_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![bot_id, limit as i64], row_to_note)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ── Contacts ──────────────────────────────────────────────────────────

    pub fn add_contact(&self, bot_id: &str, name: &str, details: &str) -> Result<Contact> {
        let contact = Contact {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            details: details.to_string(),
        };
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO contacts (id, bot_id, name, details, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![contact.id, bot_id, contact.name, contact.details, now_rfc3339()],
        )?;
        Ok(contact)
    }

    pub fn contacts_for_bot(&self, bot_id: &str) -> Result<Vec<Contact>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, name, details FROM contacts WHERE bot_id = ?1 ORDER BY name",
        )?;
        let rows = stmt.query_map(params![bot_id], |row| {
            Ok(Contact {
                id: row.get(0)?,
                name: row.get(1)?,
                details: row.get(2)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ── Skills ────────────────────────────────────────────────────────────

    pub fn add_skill(&self, bot_id: &str, name: &str, instructions: &str) -> Result<Skill> {
        let skill = Skill {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            instructions: instructions.to_string(),
            enabled: true,
        };
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO skills (id, bot_id, name, instructions, enabled)
             VALUES (?1, ?2, ?3, ?4, 1)",
            params![skill.id, bot_id, skill.name, skill.instructions],
        )?;
        Ok(skill)
    }

    pub fn enabled_skills(&self, bot_id: &str) -> Result<Vec<Skill>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, name, instructions, enabled
             FROM skills WHERE bot_id = ?1 AND enabled = 1 ORDER BY name",
        )?;
        let rows = stmt.query_map(params![bot_id], |row| {
            Ok(Skill {
                id: row.get(0)?,
                name: row.get(1)?,
                instructions: row.get(2)?,
                enabled: row.get::<_, i64>(3)? != 0,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ── Custom instructions ───────────────────────────────────────────────

    pub fn set_custom_instructions(&self, bot_id: &str, content: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO custom_instructions (bot_id, content, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(bot_id) DO UPDATE SET
                 content = excluded.content, updated_at = excluded.updated_at",
            params![bot_id, content, now_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_custom_instructions(&self, bot_id: &str) -> Result<Option<String>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT content FROM custom_instructions WHERE bot_id = ?1",
            params![bot_id],
            |row| row.get(0),
        ) {
            Ok(content) => Ok(Some(content)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(crate::error::StoreError::Database(e)),
        }
    }

    // ── Knowledge chunks ──────────────────────────────────────────────────

    pub fn insert_chunk(
        &self,
        bot_id: &str,
        document_filename: &str,
        content: &str,
        embedding: &[f32],
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO knowledge_chunks (id, bot_id, document_filename, content, embedding)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, bot_id, document_filename, content, embedding_to_blob(embedding)],
        )?;
        Ok(id)
    }

    /// In-process cosine search over a bot's chunks.
    ///
    /// No native vector index — every chunk for the bot is scored. Fine for
    /// the per-bot corpus sizes this targets; a real index can slot in
    /// behind the same signature later.
    pub fn search_chunks(
        &self,
        bot_id: &str,
        query_embedding: &[f32],
        limit: usize,
        min_score: f32,
    ) -> Result<Vec<ChunkHit>> {
        let rows = {
            let db = self.db.lock().unwrap();
            let mut stmt = db.prepare(
                "SELECT document_filename, content, embedding
                 FROM knowledge_chunks WHERE bot_id = ?1",
            )?;
            let rows = stmt.query_map(params![bot_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })?;
            rows.filter_map(|r| r.ok()).collect::<Vec<_>>()
        };

        let mut hits: Vec<ChunkHit> = rows
            .into_iter()
            .filter_map(|(filename, content, blob)| {
                let embedding = blob_to_embedding(&blob);
                let score = cosine_similarity(query_embedding, &embedding);
                (score >= min_score).then_some(ChunkHit {
                    document_filename: filename,
                    content,
                    score,
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }
}

fn row_to_note(row: &rusqlite::Row<'_>) -> rusqlite::Result<Note> {
    let tags: String = row.get(4)?;
    Ok(Note {
        id: row.get(0)?,
        bot_id: row.get(1)?,
        title: row.get(2)?,
        content: row.get(3)?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        updated_at: row.get(5)?,
    })
}

fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.len() * 4);
    for v in embedding {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = [0.5f32, -0.2, 0.8];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn chunk_search_respects_threshold_and_limit() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_chunk("b-1", "a.pdf", "close match", &[1.0, 0.0, 0.0])
            .unwrap();
        store
            .insert_chunk("b-1", "b.pdf", "near match", &[0.9, 0.1, 0.0])
            .unwrap();
        store
            .insert_chunk("b-1", "c.pdf", "unrelated", &[0.0, 0.0, 1.0])
            .unwrap();

        let hits = store
            .search_chunks("b-1", &[1.0, 0.0, 0.0], 3, 0.3)
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].document_filename, "a.pdf");

        let hits = store
            .search_chunks("b-1", &[1.0, 0.0, 0.0], 1, 0.3)
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn note_search_matches_title_and_content() {
        let store = Store::open_in_memory().unwrap();
        store
            .create_note("b-1", "Grocery list", "milk, eggs", &[])
            .unwrap();
        store
            .create_note("b-1", "Meeting", "discuss groceries budget", &[])
            .unwrap();

        let hits = store.search_notes("b-1", "grocer", 5).unwrap();
        assert_eq!(hits.len(), 2);
    }
}
