//! Fixed provider table: provider name → the env-var key its credential
//! travels under, plus whether the value is an API key or an endpoint URL.

/// How a provider is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// Secret API key — masked in listings, passed as `api_key`.
    ApiKey,
    /// Endpoint URL — rendered verbatim, passed as `endpoint`.
    Endpoint,
}

/// `(provider_name, env_key, kind)` for every supported provider.
pub const PROVIDERS: &[(&str, &str, ProviderKind)] = &[
    ("openai", "OPENAI_API_KEY", ProviderKind::ApiKey),
    ("claude", "CLAUDE_API_KEY", ProviderKind::ApiKey),
    ("groq", "GROQ_API_KEY", ProviderKind::ApiKey),
    ("google", "GOOGLE_API_KEY", ProviderKind::ApiKey),
    ("grok", "GROK_API_KEY", ProviderKind::ApiKey),
    ("openrouter", "OPENROUTER_API_KEY", ProviderKind::ApiKey),
    ("moonshot", "MOONSHOT_API_KEY", ProviderKind::ApiKey),
    ("zhipu", "ZHIPU_API_KEY", ProviderKind::ApiKey),
    ("modelscope", "MODELSCOPE_API_KEY", ProviderKind::ApiKey),
    ("stability", "STABILITY_API_KEY", ProviderKind::ApiKey),
    ("elevenlabs", "ELEVENLABS_API_KEY", ProviderKind::ApiKey),
    ("azure", "AZURE_API_KEY", ProviderKind::ApiKey),
    ("ollama", "OLLAMA_ENDPOINT", ProviderKind::Endpoint),
    ("lmstudio", "LMSTUDIO_ENDPOINT", ProviderKind::Endpoint),
    ("local_http", "LOCAL_HTTP_ENDPOINT", ProviderKind::Endpoint),
];

/// Reverse lookup: env-var key (case-insensitive) → provider name.
pub fn provider_for_env_key(key: &str) -> Option<&'static str> {
    let upper = key.to_uppercase();
    PROVIDERS
        .iter()
        .find(|(_, env_key, _)| *env_key == upper)
        .map(|(name, _, _)| *name)
}

/// Forward lookup: provider name → env-var key.
pub fn env_key_for_provider(provider: &str) -> Option<&'static str> {
    PROVIDERS
        .iter()
        .find(|(name, _, _)| *name == provider)
        .map(|(_, env_key, _)| *env_key)
}

/// Whether a provider takes an endpoint URL instead of a secret key.
pub fn provider_kind(provider: &str) -> Option<ProviderKind> {
    PROVIDERS
        .iter()
        .find(|(name, _, _)| *name == provider)
        .map(|(_, _, kind)| *kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverse_lookup_is_case_insensitive() {
        assert_eq!(provider_for_env_key("openai_api_key"), Some("openai"));
        assert_eq!(provider_for_env_key("OPENAI_API_KEY"), Some("openai"));
        assert_eq!(provider_for_env_key("NOT_A_KEY"), None);
    }

    #[test]
    fn endpoint_providers_are_flagged() {
        assert_eq!(provider_kind("ollama"), Some(ProviderKind::Endpoint));
        assert_eq!(provider_kind("openai"), Some(ProviderKind::ApiKey));
    }
}
