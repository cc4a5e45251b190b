//! Adapter registry: one spec per platform kind, with the config keys each
//! adapter requires, plus the constructor used by the manager.

use std::sync::Arc;

use cachibot_core::types::PlatformKind;

use crate::adapter::{AdapterEvents, PlatformAdapter};
use crate::error::{AdapterError, Result};

/// Static description of an adapter kind — documentation plus pre-connect
/// validation.
pub struct AdapterSpec {
    pub platform: PlatformKind,
    pub display_name: &'static str,
    pub required_config: &'static [&'static str],
    /// `(key, description)` pairs.
    pub optional_config: &'static [(&'static str, &'static str)],
}

pub const ADAPTER_SPECS: &[AdapterSpec] = &[
    AdapterSpec {
        platform: PlatformKind::Telegram,
        display_name: "Telegram",
        required_config: &["bot_token"],
        optional_config: &[("strip_markdown", "Strip markdown from responses")],
    },
    AdapterSpec {
        platform: PlatformKind::Discord,
        display_name: "Discord",
        required_config: &["bot_token"],
        optional_config: &[("strip_markdown", "Strip markdown from responses")],
    },
    AdapterSpec {
        platform: PlatformKind::Whatsapp,
        display_name: "WhatsApp",
        required_config: &["phone_number_id", "access_token", "verify_token", "app_secret"],
        optional_config: &[("strip_markdown", "Strip markdown from responses")],
    },
    AdapterSpec {
        platform: PlatformKind::Line,
        display_name: "LINE",
        required_config: &["channel_access_token", "channel_secret"],
        optional_config: &[("strip_markdown", "Strip markdown from responses")],
    },
    AdapterSpec {
        platform: PlatformKind::Viber,
        display_name: "Viber",
        required_config: &["auth_token"],
        optional_config: &[
            ("bot_name", "Sender name shown in Viber chats"),
            ("strip_markdown", "Strip markdown from responses"),
        ],
    },
    AdapterSpec {
        platform: PlatformKind::Teams,
        display_name: "Microsoft Teams",
        required_config: &["app_id", "app_password"],
        optional_config: &[("strip_markdown", "Strip markdown from responses")],
    },
    AdapterSpec {
        platform: PlatformKind::Custom,
        display_name: "Custom HTTP",
        required_config: &["callback_url"],
        optional_config: &[
            ("api_key", "Shared key required on inbound webhooks"),
            ("strip_markdown", "Strip markdown from responses"),
        ],
    },
];

pub fn spec_for(platform: PlatformKind) -> Option<&'static AdapterSpec> {
    ADAPTER_SPECS.iter().find(|s| s.platform == platform)
}

/// Check a decrypted connection config against the platform's spec.
/// Returns a list of error messages; empty means valid.
pub fn validate_config(platform: PlatformKind, config: &serde_json::Value) -> Vec<String> {
    let Some(spec) = spec_for(platform) else {
        return vec![format!("unknown platform: {platform}")];
    };
    spec.required_config
        .iter()
        .filter(|key| {
            config
                .get(**key)
                .and_then(|v| v.as_str())
                .map(str::is_empty)
                .unwrap_or(true)
        })
        .map(|key| format!("{} {} is required", spec.display_name, key))
        .collect()
}

/// Construct the adapter for a connection from its decrypted config.
pub fn build_adapter(
    platform: PlatformKind,
    connection_id: &str,
    config: serde_json::Value,
    events: Arc<dyn AdapterEvents>,
) -> Result<Arc<dyn PlatformAdapter>> {
    let errors = validate_config(platform, &config);
    if !errors.is_empty() {
        return Err(AdapterError::Config(errors.join("; ")));
    }

    let adapter: Arc<dyn PlatformAdapter> = match platform {
        PlatformKind::Telegram => Arc::new(crate::telegram::TelegramAdapter::new(
            connection_id,
            &config,
            events,
        )?),
        PlatformKind::Discord => Arc::new(crate::discord::DiscordAdapter::new(
            connection_id,
            &config,
            events,
        )?),
        PlatformKind::Whatsapp => Arc::new(crate::whatsapp::WhatsAppAdapter::new(
            connection_id,
            &config,
            events,
        )?),
        PlatformKind::Line => Arc::new(crate::line::LineAdapter::new(
            connection_id,
            &config,
            events,
        )?),
        PlatformKind::Viber => Arc::new(crate::viber::ViberAdapter::new(
            connection_id,
            &config,
            events,
        )?),
        PlatformKind::Teams => Arc::new(crate::teams::TeamsAdapter::new(
            connection_id,
            &config,
            events,
        )?),
        PlatformKind::Custom => Arc::new(crate::custom::CustomAdapter::new(
            connection_id,
            &config,
            events,
        )?),
        PlatformKind::Web => {
            return Err(AdapterError::Config(
                "web chats have no platform adapter".to_string(),
            ))
        }
    };

    Ok(adapter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_reports_missing_keys() {
        let errors = validate_config(
            PlatformKind::Whatsapp,
            &serde_json::json!({"phone_number_id": "123"}),
        );
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.contains("access_token")));
    }

    #[test]
    fn validate_accepts_complete_config() {
        let errors = validate_config(
            PlatformKind::Telegram,
            &serde_json::json!({"bot_token": "123456:token"}),
        );
        assert!(errors.is_empty());
    }

    #[test]
    fn empty_string_counts_as_missing() {
        let errors = validate_config(
            PlatformKind::Telegram,
            &serde_json::json!({"bot_token": ""}),
        );
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn every_spec_has_a_display_name() {
        for spec in ADAPTER_SPECS {
            assert!(!spec.display_name.is_empty());
        }
    }
}
