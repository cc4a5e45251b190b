//! Knowledge context assembly.
//!
//! Combines skills, custom instructions, notes, contacts, retrieved
//! document chunks, and recent conversation history into the prompt prelude
//! injected ahead of the agent run. Strictly additive: every sub-retrieval
//! is isolated, and a failing section logs a warning and renders empty.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use cachibot_store::Store;

const MAX_HISTORY_MESSAGES: usize = 10;
const MAX_DOCUMENT_CHUNKS: usize = 3;
const MIN_SIMILARITY_SCORE: f32 = 0.3;
const MAX_NOTES: usize = 10;
const NOTE_TRUNCATE: usize = 500;
const HISTORY_TRUNCATE: usize = 300;

/// One retrieved knowledge chunk with provenance.
#[derive(Debug, Clone)]
pub struct KnowledgeHit {
    pub document_filename: String,
    pub content: String,
    pub score: f32,
}

/// The search interface the context builder consumes; backed by a native
/// similarity index or the in-process cosine fallback.
#[async_trait]
pub trait KnowledgeSearch: Send + Sync {
    async fn search(
        &self,
        bot_id: &str,
        query: &str,
        limit: usize,
        min_score: f32,
    ) -> anyhow::Result<Vec<KnowledgeHit>>;
}

/// Embedding driver — external collaborator.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
}

/// Cosine search over stored chunks using an [`Embedder`] for the query.
pub struct CosineSearch {
    store: Arc<Store>,
    embedder: Arc<dyn Embedder>,
}

impl CosineSearch {
    pub fn new(store: Arc<Store>, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder }
    }
}

#[async_trait]
impl KnowledgeSearch for CosineSearch {
    async fn search(
        &self,
        bot_id: &str,
        query: &str,
        limit: usize,
        min_score: f32,
    ) -> anyhow::Result<Vec<KnowledgeHit>> {
        let query_embedding = self.embedder.embed(query).await?;
        let hits = self
            .store
            .search_chunks(bot_id, &query_embedding, limit, min_score)?;
        Ok(hits
            .into_iter()
            .map(|h| KnowledgeHit {
                document_filename: h.document_filename,
                content: h.content,
                score: h.score,
            })
            .collect())
    }
}

/// Assembled context, one optional string per section.
#[derive(Debug, Default)]
pub struct KnowledgeContext {
    pub skills: Option<String>,
    pub instructions: Option<String>,
    pub notes: Option<String>,
    pub contacts: Option<String>,
    pub relevant_docs: Option<String>,
    pub recent_history: Option<String>,
}

impl KnowledgeContext {
    /// Render as the prompt section, omitting empty parts.
    pub fn to_prompt_section(&self) -> String {
        let mut sections: Vec<String> = Vec::new();

        if let Some(skills) = &self.skills {
            sections.push(format!("## Active Skills\n{skills}"));
        }
        if let Some(instructions) = &self.instructions {
            sections.push(format!("## Custom Instructions\n{instructions}"));
        }
        if let Some(notes) = &self.notes {
            sections.push(format!("## Notes\n{notes}"));
        }
        if let Some(contacts) = &self.contacts {
            sections.push(format!("## Known Contacts\n{contacts}"));
        }
        if let Some(docs) = &self.relevant_docs {
            sections.push(format!("## Relevant Knowledge\n{docs}"));
        }
        if let Some(history) = &self.recent_history {
            sections.push(format!("## Recent Conversation Summary\n{history}"));
        }

        sections.join("\n\n---\n\n")
    }
}

/// Builds the knowledge context for LLM injection.
pub struct ContextBuilder {
    store: Arc<Store>,
    searcher: Option<Arc<dyn KnowledgeSearch>>,
    max_history_messages: usize,
    max_document_chunks: usize,
    min_similarity_score: f32,
}

impl ContextBuilder {
    pub fn new(store: Arc<Store>, searcher: Option<Arc<dyn KnowledgeSearch>>) -> Self {
        Self {
            store,
            searcher,
            max_history_messages: MAX_HISTORY_MESSAGES,
            max_document_chunks: MAX_DOCUMENT_CHUNKS,
            min_similarity_score: MIN_SIMILARITY_SCORE,
        }
    }

    /// Build context from all knowledge sources.
    pub async fn build_context(
        &self,
        bot_id: &str,
        user_message: &str,
        chat_id: Option<&str>,
        include_contacts: bool,
    ) -> KnowledgeContext {
        debug!(bot_id = %bot_id, "building knowledge context");

        KnowledgeContext {
            skills: self.skills_section(bot_id),
            instructions: self.instructions_section(bot_id),
            notes: self.notes_section(bot_id, user_message),
            contacts: self.contacts_section(bot_id, include_contacts),
            relevant_docs: self.docs_section(bot_id, user_message).await,
            recent_history: self.history_section(chat_id),
        }
    }

    /// Build the complete system prompt: base personality plus context plus
    /// citation instructions.
    pub async fn build_enhanced_system_prompt(
        &self,
        base_prompt: &str,
        bot_id: &str,
        user_message: &str,
        chat_id: Option<&str>,
        include_contacts: bool,
    ) -> String {
        let base = if base_prompt.trim().is_empty() {
            "You are a helpful AI assistant."
        } else {
            base_prompt
        };

        let context = self
            .build_context(bot_id, user_message, chat_id, include_contacts)
            .await;
        let section = context.to_prompt_section();

        if section.is_empty() {
            return base.to_string();
        }

        let citation_instructions = "\n\n---\n\n## Message Citations\n\
            When referencing a specific earlier message from the conversation, use \
            [cite:MESSAGE_ID] where MESSAGE_ID is the ID in brackets before each message \
            in the history. This creates a visual reply link in the chat. Only cite when \
            it genuinely clarifies which message you're referring to.";

        format!("{base}\n\n---\n\n{section}{citation_instructions}")
    }

    // ── Sections ──────────────────────────────────────────────────────────

    fn skills_section(&self, bot_id: &str) -> Option<String> {
        let skills = match self.store.enabled_skills(bot_id) {
            Ok(s) => s,
            Err(e) => {
                warn!(bot_id = %bot_id, error = %e, "skills retrieval failed");
                return None;
            }
        };
        if skills.is_empty() {
            return None;
        }
        Some(
            skills
                .iter()
                .map(|s| format!("### {}\n{}", s.name, s.instructions))
                .collect::<Vec<_>>()
                .join("\n\n"),
        )
    }

    fn instructions_section(&self, bot_id: &str) -> Option<String> {
        match self.store.get_custom_instructions(bot_id) {
            Ok(Some(content)) if !content.trim().is_empty() => Some(content),
            Ok(_) => None,
            Err(e) => {
                warn!(bot_id = %bot_id, error = %e, "instructions retrieval failed");
                None
            }
        }
    }

    /// Top notes: text-search matches first, then most recently updated,
    /// deduplicated by ID and capped.
    fn notes_section(&self, bot_id: &str, query: &str) -> Option<String> {
        let searched = if query.trim().is_empty() {
            Vec::new()
        } else {
            match self.store.search_notes(bot_id, query, 5) {
                Ok(n) => n,
                Err(e) => {
                    warn!(bot_id = %bot_id, error = %e, "note search failed");
                    Vec::new()
                }
            }
        };
        let recent = match self.store.recent_notes(bot_id, 5) {
            Ok(n) => n,
            Err(e) => {
                warn!(bot_id = %bot_id, error = %e, "recent notes failed");
                Vec::new()
            }
        };

        let mut seen = std::collections::HashSet::new();
        let mut formatted = Vec::new();
        for note in searched.into_iter().chain(recent) {
            if !seen.insert(note.id.clone()) {
                continue;
            }
            if formatted.len() >= MAX_NOTES {
                break;
            }
            let tags = if note.tags.is_empty() {
                String::new()
            } else {
                format!(" [{}]", note.tags.join(", "))
            };
            let content = truncate_chars(&note.content, NOTE_TRUNCATE);
            formatted.push(format!("### {}{tags}\n{content}", note.title));
        }

        (!formatted.is_empty()).then(|| formatted.join("\n\n"))
    }

    fn contacts_section(&self, bot_id: &str, include_contacts: bool) -> Option<String> {
        if !include_contacts {
            return None;
        }
        let contacts = match self.store.contacts_for_bot(bot_id) {
            Ok(c) => c,
            Err(e) => {
                warn!(bot_id = %bot_id, error = %e, "contacts retrieval failed");
                return None;
            }
        };
        if contacts.is_empty() {
            return None;
        }
        Some(
            contacts
                .iter()
                .map(|c| {
                    if c.details.is_empty() {
                        format!("- {}", c.name)
                    } else {
                        format!("- {}: {}", c.name, c.details)
                    }
                })
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }

    async fn docs_section(&self, bot_id: &str, query: &str) -> Option<String> {
        if query.trim().is_empty() {
            return None;
        }
        let searcher = self.searcher.as_ref()?;
        let hits = match searcher
            .search(
                bot_id,
                query,
                self.max_document_chunks,
                self.min_similarity_score,
            )
            .await
        {
            Ok(hits) => hits,
            Err(e) => {
                warn!(bot_id = %bot_id, error = %e, "document search failed");
                return None;
            }
        };
        if hits.is_empty() {
            return None;
        }
        Some(
            hits.iter()
                .map(|h| format!("[From: {}]\n{}", h.document_filename, h.content))
                .collect::<Vec<_>>()
                .join("\n\n"),
        )
    }

    /// Recent messages rendered `[<id>] Role: content` for citation.
    fn history_section(&self, chat_id: Option<&str>) -> Option<String> {
        let chat_id = chat_id?;
        let messages = match self
            .store
            .recent_messages(chat_id, self.max_history_messages)
        {
            Ok(m) => m,
            Err(e) => {
                warn!(chat_id = %chat_id, error = %e, "history retrieval failed");
                return None;
            }
        };
        if messages.is_empty() {
            return None;
        }
        Some(
            messages
                .iter()
                .map(|m| {
                    let role = if m.role == "user" { "User" } else { "Assistant" };
                    let content = truncate_chars(&m.content, HISTORY_TRUNCATE);
                    format!("[{}] {}: {}", m.id, role, content)
                })
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachibot_core::types::StoredMessage;

    fn store() -> Arc<Store> {
        Arc::new(Store::open_in_memory().unwrap())
    }

    struct FixedSearch(Vec<KnowledgeHit>);

    #[async_trait]
    impl KnowledgeSearch for FixedSearch {
        async fn search(
            &self,
            _bot_id: &str,
            _query: &str,
            _limit: usize,
            _min_score: f32,
        ) -> anyhow::Result<Vec<KnowledgeHit>> {
            Ok(self.0.clone())
        }
    }

    struct FailingSearch;

    #[async_trait]
    impl KnowledgeSearch for FailingSearch {
        async fn search(
            &self,
            _bot_id: &str,
            _query: &str,
            _limit: usize,
            _min_score: f32,
        ) -> anyhow::Result<Vec<KnowledgeHit>> {
            anyhow::bail!("vector store unavailable")
        }
    }

    #[tokio::test]
    async fn empty_sources_yield_base_prompt_only() {
        let builder = ContextBuilder::new(store(), None);
        let prompt = builder
            .build_enhanced_system_prompt("Be nice.", "b-1", "hello", None, false)
            .await;
        assert_eq!(prompt, "Be nice.");
    }

    #[tokio::test]
    async fn sections_assemble_in_order() {
        let store = store();
        store.add_skill("b-1", "summarize", "Summarize things.").unwrap();
        store.set_custom_instructions("b-1", "Always answer in Spanish.").unwrap();
        store
            .create_note("b-1", "Launch", "ship friday", &["work".to_string()])
            .unwrap();
        store.add_contact("b-1", "Ana", "sister").unwrap();

        let searcher: Arc<dyn KnowledgeSearch> = Arc::new(FixedSearch(vec![KnowledgeHit {
            document_filename: "guide.pdf".to_string(),
            content: "relevant chunk".to_string(),
            score: 0.9,
        }]));
        let builder = ContextBuilder::new(Arc::clone(&store), Some(searcher));

        let prompt = builder
            .build_enhanced_system_prompt("Base.", "b-1", "what ships friday?", None, true)
            .await;

        let skills_at = prompt.find("## Active Skills").unwrap();
        let instructions_at = prompt.find("## Custom Instructions").unwrap();
        let notes_at = prompt.find("## Notes").unwrap();
        let contacts_at = prompt.find("## Known Contacts").unwrap();
        let docs_at = prompt.find("## Relevant Knowledge").unwrap();
        assert!(skills_at < instructions_at);
        assert!(instructions_at < notes_at);
        assert!(notes_at < contacts_at);
        assert!(contacts_at < docs_at);

        assert!(prompt.contains("[From: guide.pdf]"));
        assert!(prompt.contains("[cite:MESSAGE_ID]"));
        assert!(prompt.contains("- Ana: sister"));
    }

    #[tokio::test]
    async fn contacts_respect_capability_gate() {
        let store = store();
        store.add_contact("b-1", "Ana", "sister").unwrap();
        let builder = ContextBuilder::new(Arc::clone(&store), None);

        let prompt = builder
            .build_enhanced_system_prompt("Base.", "b-1", "hi", None, false)
            .await;
        assert!(!prompt.contains("Known Contacts"));
    }

    #[tokio::test]
    async fn failing_search_degrades_to_empty_section() {
        let store = store();
        store.set_custom_instructions("b-1", "inst").unwrap();
        let builder = ContextBuilder::new(Arc::clone(&store), Some(Arc::new(FailingSearch)));

        let prompt = builder
            .build_enhanced_system_prompt("Base.", "b-1", "query", None, false)
            .await;
        assert!(prompt.contains("## Custom Instructions"));
        assert!(!prompt.contains("## Relevant Knowledge"));
    }

    #[tokio::test]
    async fn history_lines_carry_ids_and_truncation() {
        let store = store();
        store
            .save_message(&StoredMessage {
                id: "m-1".to_string(),
                bot_id: "b-1".to_string(),
                chat_id: "c-1".to_string(),
                role: "user".to_string(),
                content: "y".repeat(400),
                reply_to_id: None,
                metadata: serde_json::Value::Null,
                timestamp: "2026-01-01T00:00:00Z".to_string(),
            })
            .unwrap();
        let builder = ContextBuilder::new(Arc::clone(&store), None);

        let context = builder.build_context("b-1", "q", Some("c-1"), false).await;
        let history = context.recent_history.unwrap();
        assert!(history.starts_with("[m-1] User: "));
        assert!(history.ends_with("..."));
        assert!(history.len() < 400);
    }

    #[tokio::test]
    async fn notes_are_deduplicated_and_truncated() {
        let store = store();
        // This note matches the query AND is among the most recent — it must
        // appear once.
        store
            .create_note("b-1", "Unique", &"z".repeat(600), &[])
            .unwrap();
        let builder = ContextBuilder::new(Arc::clone(&store), None);

        let context = builder.build_context("b-1", "Unique", None, false).await;
        let notes = context.notes.unwrap();
        assert_eq!(notes.matches("### Unique").count(), 1);
        assert!(notes.contains("..."));
    }
}
