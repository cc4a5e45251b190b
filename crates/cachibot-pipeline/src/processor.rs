//! The end-to-end message pipeline.
//!
//! One call processes one inbound platform message: chat resolution,
//! attachment handling, context build, environment resolve, agent run,
//! media extraction, persistence, and broadcast. Concurrent calls for
//! different chats interleave freely; the pipeline holds no locks across
//! its suspension points.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use cachibot_agent::driver::{AgentRunner, Credential, DriverFactory, SttDriver, TextExtractor};
use cachibot_agent::media::{extract_media_from_steps, extract_media_from_text};
use cachibot_agent::toolcalls::project_tool_calls;
use cachibot_agent::types::AgentRequest;
use cachibot_core::types::{
    now_rfc3339, Bot, InboundMeta, IncomingMedia, PlatformKind, PlatformResponse, StoredMessage,
};
use cachibot_env::{providers, EnvResolver, ScopedEnvironment};
use cachibot_store::Store;

use cachibot_adapters::{InboundProcessor, PlatformManager};

use crate::context::ContextBuilder;
use crate::webhook::WebhookDispatcher;

/// Character cap for text extracted from document attachments.
const MAX_DOC_TEXT: usize = 4000;
/// Reply-context snippet cap.
const MAX_REPLY_SNIPPET: usize = 200;

const BOT_NOT_FOUND_REPLY: &str =
    "Bot configuration not found. Please sync the bot from the app.";
const GENERIC_ERROR_REPLY: &str = "Sorry, I encountered an error processing your message.";

/// One message pushed to control-plane WebSocket clients.
#[derive(Debug, Clone)]
pub struct BroadcastMessage {
    pub bot_id: String,
    pub chat_id: String,
    pub role: String,
    pub content: String,
    pub message_id: String,
    pub platform: String,
    pub metadata: Option<serde_json::Value>,
}

/// Fan-out of persisted messages to live observers. Implementations must
/// swallow their own errors — a failed broadcast never fails the pipeline.
pub trait Broadcaster: Send + Sync {
    fn broadcast_platform_message(&self, message: BroadcastMessage);
}

pub struct MessageProcessor {
    store: Arc<Store>,
    resolver: Arc<EnvResolver>,
    context: Arc<ContextBuilder>,
    agent: Arc<dyn AgentRunner>,
    manager: Arc<PlatformManager>,
    dispatcher: Arc<WebhookDispatcher>,
    driver_factory: Option<Arc<dyn DriverFactory>>,
    stt: Option<Arc<dyn SttDriver>>,
    extractor: Option<Arc<dyn TextExtractor>>,
    broadcaster: Option<Arc<dyn Broadcaster>>,
}

impl MessageProcessor {
    pub fn new(
        store: Arc<Store>,
        resolver: Arc<EnvResolver>,
        context: Arc<ContextBuilder>,
        agent: Arc<dyn AgentRunner>,
        manager: Arc<PlatformManager>,
        dispatcher: Arc<WebhookDispatcher>,
    ) -> Self {
        Self {
            store,
            resolver,
            context,
            agent,
            manager,
            dispatcher,
            driver_factory: None,
            stt: None,
            extractor: None,
            broadcaster: None,
        }
    }

    pub fn with_driver_factory(mut self, factory: Arc<dyn DriverFactory>) -> Self {
        self.driver_factory = Some(factory);
        self
    }

    pub fn with_stt(mut self, stt: Arc<dyn SttDriver>) -> Self {
        self.stt = Some(stt);
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn TextExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn with_broadcaster(mut self, broadcaster: Arc<dyn Broadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    /// Process one inbound message end-to-end.
    pub async fn process_message(
        &self,
        bot_id: &str,
        platform_chat_id: &str,
        text: &str,
        meta: InboundMeta,
        cancel: CancellationToken,
    ) -> PlatformResponse {
        // 1. Bot lookup.
        let bot = match self.store.get_bot(bot_id) {
            Ok(Some(bot)) => bot,
            Ok(None) => {
                warn!(bot_id = %bot_id, "bot not found");
                return PlatformResponse::text(BOT_NOT_FOUND_REPLY);
            }
            Err(e) => {
                error!(bot_id = %bot_id, error = %e, "bot lookup failed");
                return PlatformResponse::text(GENERIC_ERROR_REPLY);
            }
        };

        // 2. Chat resolve; archived chats silently swallow the message.
        let platform = meta.platform.unwrap_or(PlatformKind::Web);
        let username = meta
            .username
            .clone()
            .or_else(|| meta.first_name.clone())
            .unwrap_or_else(|| "User".to_string());
        let chat_title = format!("{}: {}", platform.display_name(), username);

        let chat = match self.store.get_or_create_platform_chat(
            bot_id,
            platform,
            platform_chat_id,
            &chat_title,
        ) {
            Ok(Some(chat)) => chat,
            Ok(None) => {
                debug!(bot_id = %bot_id, platform_chat_id, "ignoring message for archived chat");
                return PlatformResponse::empty();
            }
            Err(e) => {
                error!(bot_id = %bot_id, error = %e, "chat resolve failed");
                return PlatformResponse::text(GENERIC_ERROR_REPLY);
            }
        };
        let chat_id = chat.id.clone();

        // 3. Chat touch.
        if let Err(e) = self.store.touch_chat(&chat_id) {
            warn!(chat_id = %chat_id, error = %e, "failed to touch chat");
        }

        // 4. Attachment processing.
        let mut message_text = text.to_string();
        let mut agent_images: Vec<Vec<u8>> = Vec::new();
        let media_descriptors: Vec<serde_json::Value> = meta
            .attachments
            .iter()
            .map(|a| serde_json::json!({"type": a.media_type, "filename": a.filename}))
            .collect();
        if !meta.attachments.is_empty() {
            (message_text, agent_images) =
                self.process_attachments(&meta.attachments, message_text).await;
        }

        // 5. Reply context.
        if let Some(reply_text) = meta.reply_to_text.as_deref().filter(|t| !t.is_empty()) {
            let snippet: String = reply_text.chars().take(MAX_REPLY_SNIPPET).collect();
            message_text = format!("[Replying to: \"{snippet}\"]\n{message_text}");
        }

        // 6. Persist + broadcast the user message. Metadata carries media
        // descriptors only — never raw bytes.
        let mut user_metadata = serde_json::json!({
            "platform": platform.as_str(),
        });
        if let Some(user_id) = &meta.user_id {
            user_metadata["userId"] = serde_json::json!(user_id);
        }
        if !media_descriptors.is_empty() {
            user_metadata["media"] = serde_json::json!(media_descriptors);
        }

        let user_msg_id = Uuid::new_v4().to_string();
        let user_msg = StoredMessage {
            id: user_msg_id.clone(),
            bot_id: bot_id.to_string(),
            chat_id: chat_id.clone(),
            role: "user".to_string(),
            content: message_text.clone(),
            reply_to_id: None,
            metadata: user_metadata,
            timestamp: now_rfc3339(),
        };
        if let Err(e) = self.store.save_message(&user_msg) {
            error!(chat_id = %chat_id, error = %e, "failed to persist user message");
            return PlatformResponse::text(GENERIC_ERROR_REPLY);
        }
        self.broadcast(&bot, &chat_id, "user", &message_text, &user_msg_id, platform, None);

        // 7. Typing indicator, best-effort.
        if let Some(connection_id) = &meta.connection_id {
            if let Some(adapter) = self.manager.get_adapter(connection_id) {
                adapter.send_typing(platform_chat_id).await;
            } else {
                debug!(connection = %connection_id, "no adapter for typing indicator");
            }
        }

        // 8. Context build; fall back to the raw system prompt.
        let include_contacts = bot.has_capability("contacts");
        let enhanced_prompt = self
            .context
            .build_enhanced_system_prompt(
                &bot.system_prompt,
                bot_id,
                &message_text,
                Some(&chat_id),
                include_contacts,
            )
            .await;

        // 9. Environment resolve + per-request driver.
        let resolved = match self.resolver.resolve(bot_id, platform.as_str(), None) {
            Ok(env) => env,
            Err(e) => {
                warn!(bot_id = %bot_id, error = %e,
                      "environment resolution failed; using global defaults");
                cachibot_env::ResolvedEnvironment {
                    model: bot.model.clone(),
                    temperature: 0.6,
                    max_tokens: 4096,
                    max_iterations: 20,
                    ..Default::default()
                }
            }
        };

        // Bot model slots override the resolved model.
        let effective_model = bot
            .models
            .as_ref()
            .and_then(|m| m.get("default"))
            .cloned()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| resolved.model.clone());

        let scope = ScopedEnvironment::new(resolved);
        let driver = self.build_per_bot_driver(&effective_model, &scope);

        let (skill_configs, temperature, max_tokens, max_iterations) = match scope.resolved() {
            Ok(env) => (
                env.skill_configs.clone(),
                env.temperature,
                env.max_tokens,
                env.max_iterations,
            ),
            Err(_) => (Default::default(), 0.6, 4096, 20),
        };

        // 10. Agent run.
        let request = AgentRequest {
            system_prompt: enhanced_prompt,
            user_text: message_text.clone(),
            images: agent_images,
            model: effective_model,
            temperature,
            max_tokens,
            max_iterations,
            skill_configs,
            driver,
        };

        let result = self.agent.run(request, cancel).await;
        // Plaintext keys end with the scope, before any persistence below.
        drop(scope);

        let result = match result {
            Ok(result) => result,
            Err(e) => {
                error!(bot_id = %bot_id, chat_id = %chat_id, error = %e, "agent run failed");
                return PlatformResponse::text(GENERIC_ERROR_REPLY);
            }
        };

        let mut response_text = if result.output_text.is_empty() {
            "Task completed.".to_string()
        } else {
            result.output_text.clone()
        };

        // 11. Media extraction.
        let media_items = extract_media_from_steps(&result.steps);
        if !media_items.is_empty() {
            let (cleaned, _) = extract_media_from_text(&response_text);
            if !cleaned.is_empty() {
                response_text = cleaned;
            }
        }

        // 12. Tool-call projection.
        let tool_calls = project_tool_calls(&result.steps);

        // 13. Persist + broadcast the assistant message with usage metadata.
        let usage = &result.run_usage;
        let mut usage_metadata = serde_json::json!({
            "tokens": usage.total_tokens,
            "promptTokens": usage.prompt_tokens,
            "completionTokens": usage.completion_tokens,
            "cost": usage.cost,
            "elapsedMs": usage.total_elapsed_ms,
            "tokensPerSecond": usage.tokens_per_second,
            "callCount": usage.call_count,
            "errors": usage.errors,
            "model": bot.model,
            "platform": platform.as_str(),
        });
        if !tool_calls.is_empty() {
            usage_metadata["toolCalls"] = serde_json::json!(tool_calls);
        }

        let assistant_msg_id = Uuid::new_v4().to_string();
        let assistant_msg = StoredMessage {
            id: assistant_msg_id.clone(),
            bot_id: bot_id.to_string(),
            chat_id: chat_id.clone(),
            role: "assistant".to_string(),
            content: response_text.clone(),
            reply_to_id: None,
            metadata: usage_metadata.clone(),
            timestamp: now_rfc3339(),
        };
        if let Err(e) = self.store.save_message(&assistant_msg) {
            error!(chat_id = %chat_id, error = %e, "failed to persist assistant message");
        }
        self.broadcast(
            &bot,
            &chat_id,
            "assistant",
            &response_text,
            &assistant_msg_id,
            platform,
            Some(usage_metadata),
        );

        self.dispatcher.emit(
            bot_id,
            "message.sent",
            serde_json::json!({
                "chat_id": chat_id,
                "message_id": assistant_msg_id,
                "platform": platform.as_str(),
            }),
        );

        info!(bot_id = %bot_id, chat_id = %chat_id,
              tokens = usage.total_tokens, "pipeline: message complete");

        // 14. Hand the response back to the adapter.
        PlatformResponse {
            text: response_text,
            media: media_items,
        }
    }

    /// Build a per-request driver when the effective model's provider has a
    /// resolved credential. Endpoint-type providers get the endpoint form.
    fn build_per_bot_driver(
        &self,
        effective_model: &str,
        scope: &ScopedEnvironment,
    ) -> Option<Arc<dyn cachibot_agent::driver::LlmDriver>> {
        let factory = self.driver_factory.as_ref()?;
        let provider = effective_model.split_once('/')?.0.to_lowercase();
        let value = scope.get(&provider).ok()??.to_string();

        let credential = match providers::provider_kind(&provider) {
            Some(providers::ProviderKind::Endpoint) => Credential::Endpoint(value),
            _ => Credential::ApiKey(value),
        };
        factory.build(effective_model, credential)
    }

    /// Fold attachments into the user text and collect vision images.
    async fn process_attachments(
        &self,
        attachments: &[IncomingMedia],
        message: String,
    ) -> (String, Vec<Vec<u8>>) {
        let mut images: Vec<Vec<u8>> = Vec::new();
        let mut extra_parts: Vec<String> = Vec::new();

        for att in attachments {
            if att.media_type.starts_with("audio/") {
                match &self.stt {
                    Some(stt) => match stt.transcribe(&att.data, &att.filename).await {
                        Ok(transcript) if !transcript.is_empty() => {
                            extra_parts.push(format!("[Audio transcription]: {transcript}"));
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "audio transcription failed"),
                    },
                    None => warn!("no STT driver configured; skipping audio attachment"),
                }
            } else if att.media_type == "application/pdf" {
                match &self.extractor {
                    Some(extractor) => match extractor.extract_pdf_text(&att.data).await {
                        Ok(text) if !text.trim().is_empty() => {
                            let capped = cap_doc_text(text.trim());
                            extra_parts.push(format!("[Document: {}]\n{capped}", att.filename));
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "PDF text extraction failed"),
                    },
                    None => warn!("no text extractor configured; skipping PDF attachment"),
                }
            } else if att.media_type == "text/plain"
                || att.media_type == "text/markdown"
                || att.filename.ends_with(".txt")
                || att.filename.ends_with(".md")
            {
                let text = String::from_utf8_lossy(&att.data);
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    let capped = cap_doc_text(trimmed);
                    extra_parts.push(format!("[Document: {}]\n{capped}", att.filename));
                }
            } else if att.media_type.starts_with("image/") {
                images.push(att.data.clone());
            }
        }

        let augmented = if extra_parts.is_empty() {
            message
        } else {
            let joined = extra_parts.join("\n\n");
            if message.is_empty() {
                joined
            } else {
                format!("{joined}\n\n{message}")
            }
        };

        (augmented, images)
    }

    #[allow(clippy::too_many_arguments)]
    fn broadcast(
        &self,
        bot: &Bot,
        chat_id: &str,
        role: &str,
        content: &str,
        message_id: &str,
        platform: PlatformKind,
        metadata: Option<serde_json::Value>,
    ) {
        if let Some(broadcaster) = &self.broadcaster {
            broadcaster.broadcast_platform_message(BroadcastMessage {
                bot_id: bot.id.clone(),
                chat_id: chat_id.to_string(),
                role: role.to_string(),
                content: content.to_string(),
                message_id: message_id.to_string(),
                platform: platform.as_str().to_string(),
                metadata,
            });
        }
    }
}

fn cap_doc_text(text: &str) -> String {
    if text.chars().count() <= MAX_DOC_TEXT {
        text.to_string()
    } else {
        let capped: String = text.chars().take(MAX_DOC_TEXT).collect();
        format!("{capped}\n[... truncated ...]")
    }
}

#[async_trait]
impl InboundProcessor for MessageProcessor {
    async fn process(
        &self,
        bot_id: &str,
        platform_chat_id: &str,
        text: &str,
        meta: InboundMeta,
    ) -> PlatformResponse {
        self.process_message(bot_id, platform_chat_id, text, meta, CancellationToken::new())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachibot_agent::types::{AgentResult, AgentStep, RunUsage};
    use cachibot_core::config::{AgentConfig, HealthConfig};
    use cachibot_crypto::EncryptionService;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct EchoAgent;

    #[async_trait]
    impl AgentRunner for EchoAgent {
        async fn run(
            &self,
            request: AgentRequest,
            _cancel: CancellationToken,
        ) -> anyhow::Result<AgentResult> {
            Ok(AgentResult {
                output_text: format!("echo: {}", request.user_text),
                steps: Vec::new(),
                run_usage: RunUsage {
                    total_tokens: 42,
                    ..Default::default()
                },
            })
        }
    }

    struct MediaAgent;

    #[async_trait]
    impl AgentRunner for MediaAgent {
        async fn run(
            &self,
            _request: AgentRequest,
            _cancel: CancellationToken,
        ) -> anyhow::Result<AgentResult> {
            use base64::Engine;
            let uri = format!(
                "data:image/png;base64,{}",
                base64::engine::general_purpose::STANDARD.encode(b"pixels")
            );
            Ok(AgentResult {
                output_text: format!("Here is your image: {uri}"),
                steps: vec![
                    AgentStep::tool_call("generate_image", serde_json::json!({"prompt": "cat"}), 1.0),
                    AgentStep::tool_result(&uri, 2.0),
                ],
                run_usage: RunUsage::default(),
            })
        }
    }

    struct FailingAgent;

    #[async_trait]
    impl AgentRunner for FailingAgent {
        async fn run(
            &self,
            _request: AgentRequest,
            _cancel: CancellationToken,
        ) -> anyhow::Result<AgentResult> {
            anyhow::bail!("provider exploded")
        }
    }

    struct CapturingAgent {
        seen: Mutex<Vec<AgentRequest>>,
    }

    #[async_trait]
    impl AgentRunner for CapturingAgent {
        async fn run(
            &self,
            request: AgentRequest,
            _cancel: CancellationToken,
        ) -> anyhow::Result<AgentResult> {
            let reply = format!("got: {}", request.user_text);
            self.seen.lock().unwrap().push(request);
            Ok(AgentResult {
                output_text: reply,
                ..Default::default()
            })
        }
    }

    struct FixedStt;

    #[async_trait]
    impl SttDriver for FixedStt {
        async fn transcribe(&self, _audio: &[u8], _filename: &str) -> anyhow::Result<String> {
            Ok("hello from voice".to_string())
        }
    }

    struct LongPdf;

    #[async_trait]
    impl TextExtractor for LongPdf {
        async fn extract_pdf_text(&self, _data: &[u8]) -> anyhow::Result<String> {
            Ok("w".repeat(12_000))
        }
    }

    fn build_processor(agent: Arc<dyn AgentRunner>) -> (Arc<Store>, MessageProcessor) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let crypto = Arc::new(EncryptionService::new([0x42u8; 32]));
        let resolver = Arc::new(EnvResolver::new(
            Arc::clone(&store),
            Arc::clone(&crypto),
            AgentConfig::default(),
            true,
        ));
        let context = Arc::new(ContextBuilder::new(Arc::clone(&store), None));
        let manager = PlatformManager::new(
            Arc::clone(&store),
            Arc::clone(&crypto),
            HealthConfig::default(),
        );
        let dispatcher = Arc::new(WebhookDispatcher::new(Arc::clone(&store)));
        let processor = MessageProcessor::new(
            Arc::clone(&store),
            resolver,
            context,
            agent,
            manager,
            dispatcher,
        );
        (store, processor)
    }

    fn seed_bot(store: &Store, id: &str) {
        store
            .create_bot(&Bot {
                id: id.to_string(),
                name: "Test".to_string(),
                model: "openai/gpt-4o".to_string(),
                system_prompt: "You are helpful.".to_string(),
                capabilities: HashMap::new(),
                models: None,
                owner_user_id: "u-1".to_string(),
                created_at: now_rfc3339(),
            })
            .unwrap();
    }

    fn telegram_meta() -> InboundMeta {
        InboundMeta {
            platform: Some(PlatformKind::Telegram),
            user_id: Some("77".to_string()),
            username: Some("ana".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn missing_bot_returns_static_text() {
        let (_store, processor) = build_processor(Arc::new(EchoAgent));
        let response = processor
            .process("nope", "chat-1", "hi", telegram_meta())
            .await;
        assert_eq!(response.text, BOT_NOT_FOUND_REPLY);
    }

    #[tokio::test]
    async fn normal_flow_persists_both_messages() {
        let (store, processor) = build_processor(Arc::new(EchoAgent));
        seed_bot(&store, "b-1");

        let response = processor
            .process("b-1", "chat-1", "hello", telegram_meta())
            .await;
        assert_eq!(response.text, "echo: hello");

        let chat = store
            .get_or_create_platform_chat("b-1", PlatformKind::Telegram, "chat-1", "x")
            .unwrap()
            .unwrap();
        assert_eq!(chat.title, "Telegram: ana");

        let messages = store.recent_messages(&chat.id, 10).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[1].metadata["tokens"], 42);
        assert_eq!(messages[1].metadata["platform"], "telegram");
    }

    #[tokio::test]
    async fn archived_chat_suppresses_reply() {
        let (store, processor) = build_processor(Arc::new(EchoAgent));
        seed_bot(&store, "b-1");
        let chat = store
            .get_or_create_platform_chat("b-1", PlatformKind::Telegram, "chat-1", "t")
            .unwrap()
            .unwrap();
        store.set_chat_archived(&chat.id, true).unwrap();

        let response = processor
            .process("b-1", "chat-1", "hello", telegram_meta())
            .await;
        assert!(response.is_empty());
        assert!(store.recent_messages(&chat.id, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn agent_failure_returns_polite_message() {
        let (store, processor) = build_processor(Arc::new(FailingAgent));
        seed_bot(&store, "b-1");

        let response = processor
            .process("b-1", "chat-1", "hello", telegram_meta())
            .await;
        assert_eq!(response.text, GENERIC_ERROR_REPLY);

        // The user message persisted before the failure is retained.
        let chat = store
            .get_or_create_platform_chat("b-1", PlatformKind::Telegram, "chat-1", "t")
            .unwrap()
            .unwrap();
        let messages = store.recent_messages(&chat.id, 10).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "user");
    }

    #[tokio::test]
    async fn reply_context_is_prepended() {
        let agent = Arc::new(CapturingAgent {
            seen: Mutex::new(Vec::new()),
        });
        let (store, processor) = build_processor(agent.clone() as Arc<dyn AgentRunner>);
        seed_bot(&store, "b-1");

        let mut meta = telegram_meta();
        meta.reply_to_text = Some("x".repeat(500));

        processor.process("b-1", "chat-1", "and this?", meta).await;

        let seen = agent.seen.lock().unwrap();
        let text = &seen[0].user_text;
        assert!(text.starts_with("[Replying to: \""));
        // Snippet capped at 200 chars.
        assert!(text.find("\"]\n").unwrap() < 220);
        assert!(text.ends_with("and this?"));
    }

    #[tokio::test]
    async fn pdf_attachment_is_extracted_and_capped() {
        let agent = Arc::new(CapturingAgent {
            seen: Mutex::new(Vec::new()),
        });
        let (store, processor) = build_processor(agent.clone() as Arc<dyn AgentRunner>);
        seed_bot(&store, "b-1");
        let processor = processor.with_extractor(Arc::new(LongPdf));

        let mut meta = telegram_meta();
        meta.attachments.push(IncomingMedia {
            media_type: "application/pdf".to_string(),
            filename: "report.pdf".to_string(),
            data: vec![1, 2, 3],
        });

        processor
            .process_message("b-1", "chat-1", "summarize", meta, CancellationToken::new())
            .await;

        let seen = agent.seen.lock().unwrap();
        let text = &seen[0].user_text;
        assert!(text.starts_with("[Document: report.pdf]\n"));
        assert!(text.contains("[... truncated ...]"));
        // 4000 chars of doc + marker + original message.
        assert!(text.chars().count() < 4100 + 40);

        // Persisted metadata holds descriptors only, no bytes.
        let chat = store
            .get_or_create_platform_chat("b-1", PlatformKind::Telegram, "chat-1", "t")
            .unwrap()
            .unwrap();
        let messages = store.recent_messages(&chat.id, 10).unwrap();
        let media = &messages[0].metadata["media"];
        assert_eq!(media[0]["type"], "application/pdf");
        assert_eq!(media[0]["filename"], "report.pdf");
        assert!(media[0].get("data").is_none());
    }

    #[tokio::test]
    async fn audio_attachment_is_transcribed() {
        let agent = Arc::new(CapturingAgent {
            seen: Mutex::new(Vec::new()),
        });
        let (store, processor) = build_processor(agent.clone() as Arc<dyn AgentRunner>);
        seed_bot(&store, "b-1");
        let processor = processor.with_stt(Arc::new(FixedStt));

        let mut meta = telegram_meta();
        meta.attachments.push(IncomingMedia {
            media_type: "audio/ogg".to_string(),
            filename: "voice.ogg".to_string(),
            data: vec![0u8; 8],
        });

        processor
            .process_message("b-1", "chat-1", "", meta, CancellationToken::new())
            .await;

        let seen = agent.seen.lock().unwrap();
        assert!(seen[0]
            .user_text
            .starts_with("[Audio transcription]: hello from voice"));
    }

    #[tokio::test]
    async fn image_attachments_reach_the_agent_as_vision_input() {
        let agent = Arc::new(CapturingAgent {
            seen: Mutex::new(Vec::new()),
        });
        let (store, processor) = build_processor(agent.clone() as Arc<dyn AgentRunner>);
        seed_bot(&store, "b-1");

        let mut meta = telegram_meta();
        meta.attachments.push(IncomingMedia {
            media_type: "image/png".to_string(),
            filename: "photo.png".to_string(),
            data: b"pngbytes".to_vec(),
        });

        processor
            .process_message("b-1", "chat-1", "what is this?", meta, CancellationToken::new())
            .await;

        let seen = agent.seen.lock().unwrap();
        assert_eq!(seen[0].images.len(), 1);
        assert_eq!(seen[0].images[0], b"pngbytes");
    }

    #[tokio::test]
    async fn tool_media_is_extracted_and_stripped_from_text() {
        let (store, processor) = build_processor(Arc::new(MediaAgent));
        seed_bot(&store, "b-1");

        let response = processor
            .process("b-1", "chat-1", "draw a cat", telegram_meta())
            .await;

        assert_eq!(response.media.len(), 1);
        assert_eq!(response.media[0].media_type, "image/png");
        assert!(!response.text.contains("base64"));
        assert!(response.text.contains("Here is your image:"));

        // Assistant metadata carries the projected tool calls.
        let chat = store
            .get_or_create_platform_chat("b-1", PlatformKind::Telegram, "chat-1", "t")
            .unwrap()
            .unwrap();
        let messages = store.recent_messages(&chat.id, 10).unwrap();
        let tool_calls = &messages[1].metadata["toolCalls"];
        assert_eq!(tool_calls[0]["tool"], "generate_image");
        assert_eq!(tool_calls[0]["success"], true);
    }
}
