//! Five-layer per-request environment resolution.
//!
//! Global → Platform → Bot → Skill → Request, later layers overriding
//! earlier ones. No caching: every resolve issues fresh reads, so an admin
//! key update is observable on the very next request. Decrypted keys live
//! only inside the returned [`ResolvedEnvironment`] and are never written
//! to process-wide environment state.

use std::collections::HashMap;
use std::sync::Arc;

use cachibot_core::config::AgentConfig;
use cachibot_crypto::EncryptionService;
use cachibot_store::Store;

use crate::error::Result;
use crate::providers::{provider_for_env_key, PROVIDERS};

/// The fully-resolved configuration for one bot request.
#[derive(Debug, Clone, Default)]
pub struct ResolvedEnvironment {
    pub provider_keys: HashMap<String, String>,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub max_iterations: u32,
    pub utility_model: String,
    pub skill_configs: HashMap<String, serde_json::Value>,
    /// Which layer set each key — for the resolved-view debugging route.
    pub sources: HashMap<String, String>,
}

/// Resolves the effective environment for a bot by merging all five layers.
///
/// Per-request DB lookups, no cache: the overhead is microseconds next to
/// an LLM round trip.
pub struct EnvResolver {
    store: Arc<Store>,
    crypto: Arc<EncryptionService>,
    defaults: AgentConfig,
    per_bot_env: bool,
}

impl EnvResolver {
    pub fn new(
        store: Arc<Store>,
        crypto: Arc<EncryptionService>,
        defaults: AgentConfig,
        per_bot_env: bool,
    ) -> Self {
        Self {
            store,
            crypto,
            defaults,
            per_bot_env,
        }
    }

    /// Resolve the full environment for a bot.
    ///
    /// `request_overrides` is the raw per-request payload (model,
    /// temperature, caps, `tool_configs`) exactly as the caller sent it.
    pub fn resolve(
        &self,
        bot_id: &str,
        platform: &str,
        request_overrides: Option<&serde_json::Value>,
    ) -> Result<ResolvedEnvironment> {
        // Layer 1: process environment + config defaults.
        let mut env = self.load_global_defaults();

        if !self.per_bot_env {
            return Ok(env);
        }

        // Layer 2: platform defaults.
        let platform_overrides = self.store.load_platform_env(&self.crypto, platform)?;
        merge(&mut env, &platform_overrides, "platform");

        // Layer 3: bot overrides.
        let bot_overrides = self.store.load_bot_env(&self.crypto, bot_id)?;
        merge(&mut env, &bot_overrides, "bot");

        // Layer 4: skill configs.
        env.skill_configs = self.store.load_skill_configs(bot_id)?;

        // Layer 5: request overrides.
        if let Some(overrides) = request_overrides {
            apply_request_overrides(&mut env, overrides);
        }

        Ok(env)
    }

    fn load_global_defaults(&self) -> ResolvedEnvironment {
        let mut env = ResolvedEnvironment {
            model: self.defaults.model.clone(),
            temperature: self.defaults.temperature,
            max_tokens: self.defaults.max_tokens,
            max_iterations: self.defaults.max_iterations,
            utility_model: self.defaults.utility_model.clone(),
            ..Default::default()
        };

        for (provider, env_key, _) in PROVIDERS {
            if let Ok(value) = std::env::var(env_key) {
                if !value.is_empty() {
                    env.provider_keys.insert(provider.to_string(), value);
                    env.sources
                        .insert(env_key.to_lowercase(), "global".to_string());
                }
            }
        }

        for key in ["model", "temperature", "max_tokens", "max_iterations"] {
            env.sources.insert(key.to_string(), "global".to_string());
        }

        env
    }
}

/// Merge a decrypted key→value layer into the environment.
///
/// Provider env keys are routed into `provider_keys`; recognised agent
/// settings are type-coerced best-effort (silently dropped when the value
/// does not parse); anything else is recorded in `sources` for tracing.
fn merge(env: &mut ResolvedEnvironment, overrides: &HashMap<String, String>, source: &str) {
    for (key, value) in overrides {
        if let Some(provider) = provider_for_env_key(key) {
            env.provider_keys
                .insert(provider.to_string(), value.clone());
            env.sources
                .insert(key.to_lowercase(), source.to_string());
            continue;
        }

        match key.to_lowercase().as_str() {
            "model" => {
                env.model = value.clone();
                env.sources.insert("model".to_string(), source.to_string());
            }
            "temperature" => {
                if let Ok(v) = value.parse::<f64>() {
                    env.temperature = v;
                    env.sources
                        .insert("temperature".to_string(), source.to_string());
                }
            }
            "max_tokens" => {
                if let Ok(v) = value.parse::<u32>() {
                    env.max_tokens = v;
                    env.sources
                        .insert("max_tokens".to_string(), source.to_string());
                }
            }
            "max_iterations" => {
                if let Ok(v) = value.parse::<u32>() {
                    env.max_iterations = v;
                    env.sources
                        .insert("max_iterations".to_string(), source.to_string());
                }
            }
            "utility_model" => {
                env.utility_model = value.clone();
                env.sources
                    .insert("utility_model".to_string(), source.to_string());
            }
            other => {
                env.sources.insert(other.to_string(), source.to_string());
            }
        }
    }
}

/// Layer 5: apply per-request overrides from the caller's payload.
fn apply_request_overrides(env: &mut ResolvedEnvironment, overrides: &serde_json::Value) {
    if let Some(model) = overrides.get("model").and_then(|v| v.as_str()) {
        env.model = model.to_string();
        env.sources
            .insert("model".to_string(), "request".to_string());
    }
    if let Some(v) = overrides.get("temperature").and_then(coerce_f64) {
        env.temperature = v;
        env.sources
            .insert("temperature".to_string(), "request".to_string());
    }
    if let Some(v) = overrides.get("max_tokens").and_then(coerce_u32) {
        env.max_tokens = v;
        env.sources
            .insert("max_tokens".to_string(), "request".to_string());
    }
    if let Some(v) = overrides.get("max_iterations").and_then(coerce_u32) {
        env.max_iterations = v;
        env.sources
            .insert("max_iterations".to_string(), "request".to_string());
    }

    // Per-skill merge on top of Layer 4. Deliberately one level deep:
    // top-level options of a skill merge, nested objects are replaced.
    if let Some(tool_configs) = overrides.get("tool_configs").and_then(|v| v.as_object()) {
        for (skill_name, config) in tool_configs {
            let Some(config) = config.as_object() else {
                continue;
            };
            let entry = env
                .skill_configs
                .entry(skill_name.clone())
                .or_insert_with(|| serde_json::Value::Object(Default::default()));
            if let Some(existing) = entry.as_object_mut() {
                for (k, v) in config {
                    existing.insert(k.clone(), v.clone());
                }
            } else {
                *entry = serde_json::Value::Object(config.clone());
            }
        }
    }
}

fn coerce_f64(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn coerce_u32(value: &serde_json::Value) -> Option<u32> {
    match value {
        serde_json::Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachibot_store::audit::AuditActor;

    fn setup() -> (Arc<Store>, Arc<EncryptionService>, EnvResolver) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let crypto = Arc::new(EncryptionService::new([0x42u8; 32]));
        let resolver = EnvResolver::new(
            Arc::clone(&store),
            Arc::clone(&crypto),
            AgentConfig::default(),
            true,
        );
        (store, crypto, resolver)
    }

    #[test]
    fn global_defaults_loaded() {
        let (_, _, resolver) = setup();
        let env = resolver.resolve("b-1", "web", None).unwrap();
        assert_eq!(env.model, "openai/gpt-4o");
        assert_eq!(env.temperature, 0.6);
        assert_eq!(env.max_tokens, 4096);
        assert_eq!(env.sources["model"], "global");
    }

    #[test]
    fn bot_overrides_platform() {
        let (store, crypto, resolver) = setup();
        let actor = AuditActor::default();
        store
            .upsert_platform_env(&crypto, "telegram", "OPENAI_API_KEY", "sk-platform", &actor)
            .unwrap();
        store
            .upsert_bot_env(&crypto, "b-1", "OPENAI_API_KEY", "sk-bot", "user", &actor)
            .unwrap();

        let env = resolver.resolve("b-1", "telegram", None).unwrap();
        assert_eq!(env.provider_keys["openai"], "sk-bot");
        assert_eq!(env.sources["openai_api_key"], "bot");
    }

    #[test]
    fn platform_layer_applies_without_bot_layer() {
        std::env::remove_var("GROQ_API_KEY");
        let (store, crypto, resolver) = setup();
        store
            .upsert_platform_env(
                &crypto,
                "telegram",
                "GROQ_API_KEY",
                "gsk_platform1234",
                &AuditActor::default(),
            )
            .unwrap();

        let env = resolver.resolve("b-1", "telegram", None).unwrap();
        assert_eq!(env.provider_keys["groq"], "gsk_platform1234");
        assert_eq!(env.sources["groq_api_key"], "platform");

        // A different platform does not see it.
        let env = resolver.resolve("b-1", "discord", None).unwrap();
        assert!(!env.provider_keys.contains_key("groq"));
    }

    #[test]
    fn hot_reload_sees_update_on_next_resolve() {
        let (store, crypto, resolver) = setup();
        let actor = AuditActor::default();
        store
            .upsert_bot_env(&crypto, "b-1", "OPENAI_API_KEY", "sk-old", "user", &actor)
            .unwrap();
        assert_eq!(
            resolver.resolve("b-1", "web", None).unwrap().provider_keys["openai"],
            "sk-old"
        );

        store
            .upsert_bot_env(&crypto, "b-1", "OPENAI_API_KEY", "sk-new", "user", &actor)
            .unwrap();
        assert_eq!(
            resolver.resolve("b-1", "web", None).unwrap().provider_keys["openai"],
            "sk-new"
        );
    }

    #[test]
    fn scalar_settings_coerce_or_drop() {
        let (store, crypto, resolver) = setup();
        let actor = AuditActor::default();
        store
            .upsert_bot_env(&crypto, "b-1", "temperature", "0.9", "user", &actor)
            .unwrap();
        store
            .upsert_bot_env(&crypto, "b-1", "max_tokens", "not-a-number", "user", &actor)
            .unwrap();

        let env = resolver.resolve("b-1", "web", None).unwrap();
        assert_eq!(env.temperature, 0.9);
        assert_eq!(env.sources["temperature"], "bot");
        // Bad coercion silently dropped: default survives, source unchanged.
        assert_eq!(env.max_tokens, 4096);
        assert_eq!(env.sources["max_tokens"], "global");
    }

    #[test]
    fn request_layer_overrides_and_merges_skill_configs() {
        let (store, _, resolver) = setup();
        store
            .upsert_skill_config(
                "b-1",
                "web_search",
                &serde_json::json!({"depth": 3, "filters": {"lang": "en", "safe": true}}),
            )
            .unwrap();

        let overrides = serde_json::json!({
            "model": "claude/claude-sonnet-4",
            "temperature": "0.2",
            "tool_configs": {
                "web_search": {"depth": 5, "filters": {"lang": "es"}},
                "calculator": {"precision": 10}
            }
        });
        let env = resolver.resolve("b-1", "web", Some(&overrides)).unwrap();

        assert_eq!(env.model, "claude/claude-sonnet-4");
        assert_eq!(env.sources["model"], "request");
        assert_eq!(env.temperature, 0.2);

        let ws = &env.skill_configs["web_search"];
        assert_eq!(ws["depth"], 5);
        // One-level merge only: the nested "filters" object is replaced,
        // so "safe" is gone.
        assert_eq!(ws["filters"]["lang"], "es");
        assert!(ws["filters"].get("safe").is_none());

        assert_eq!(env.skill_configs["calculator"]["precision"], 10);
    }

    #[test]
    fn reset_all_falls_back_to_lower_layers() {
        let (store, crypto, resolver) = setup();
        let actor = AuditActor::default();
        store
            .upsert_platform_env(&crypto, "web", "OPENAI_API_KEY", "sk-platform", &actor)
            .unwrap();
        store
            .upsert_bot_env(&crypto, "b-1", "OPENAI_API_KEY", "sk-bot", "user", &actor)
            .unwrap();
        assert_eq!(
            resolver.resolve("b-1", "web", None).unwrap().provider_keys["openai"],
            "sk-bot"
        );

        store.reset_bot_env("b-1", &actor).unwrap();
        let env = resolver.resolve("b-1", "web", None).unwrap();
        assert_eq!(env.provider_keys["openai"], "sk-platform");
        assert_eq!(env.sources["openai_api_key"], "platform");
    }

    #[test]
    fn concurrent_resolves_do_not_alias() {
        let (store, crypto, _) = setup();
        let actor = AuditActor::default();
        store
            .upsert_bot_env(&crypto, "bot-a", "OPENAI_API_KEY", "sk-AAA", "user", &actor)
            .unwrap();
        store
            .upsert_bot_env(&crypto, "bot-b", "OPENAI_API_KEY", "sk-BBB", "user", &actor)
            .unwrap();

        let resolver = Arc::new(EnvResolver::new(
            store,
            crypto,
            AgentConfig::default(),
            true,
        ));

        let handles: Vec<_> = ["bot-a", "bot-b"]
            .into_iter()
            .map(|bot| {
                let resolver = Arc::clone(&resolver);
                std::thread::spawn(move || resolver.resolve(bot, "web", None).unwrap())
            })
            .collect();

        let mut results: Vec<ResolvedEnvironment> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        let key_a = results[0].provider_keys["openai"].clone();
        let key_b = results[1].provider_keys["openai"].clone();
        assert_eq!([key_a.as_str(), key_b.as_str()], ["sk-AAA", "sk-BBB"]);

        // Mutating one resolved env never affects the other.
        results[0]
            .provider_keys
            .insert("openai".to_string(), "mutated".to_string());
        assert_eq!(results[1].provider_keys["openai"], "sk-BBB");
    }

    #[test]
    fn kill_switch_disables_upper_layers() {
        std::env::remove_var("OPENAI_API_KEY");
        let (store, crypto, _) = setup();
        store
            .upsert_bot_env(
                &crypto,
                "b-1",
                "OPENAI_API_KEY",
                "sk-bot",
                "user",
                &AuditActor::default(),
            )
            .unwrap();

        let resolver = EnvResolver::new(store, crypto, AgentConfig::default(), false);
        let env = resolver.resolve("b-1", "web", None).unwrap();
        assert!(!env.provider_keys.contains_key("openai"));
        assert!(env.skill_configs.is_empty());
    }
}
