// Verify the stored envelope format stays compatible with existing rows.
// Ciphertext, nonce, and salt are three independent base64 strings; the
// AAD binding and HKDF info strings must never change silently.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;

use cachibot_crypto::{EncryptedValue, EncryptionService};

fn service() -> EncryptionService {
    EncryptionService::new([0x07u8; 32])
}

#[test]
fn envelope_fields_are_base64_with_expected_sizes() {
    let enc = service().encrypt_value("some-secret", Some("bot-1")).unwrap();

    let ciphertext = B64.decode(&enc.ciphertext).unwrap();
    let nonce = B64.decode(&enc.nonce).unwrap();
    let salt = B64.decode(&enc.salt).unwrap();

    // GCM appends a 16-byte tag.
    assert_eq!(ciphertext.len(), "some-secret".len() + 16);
    assert_eq!(nonce.len(), 12);
    assert_eq!(salt.len(), 32);
}

#[test]
fn value_survives_serde_roundtrip() {
    let svc = service();
    let enc = svc.encrypt_value("round-trip", Some("bot-1")).unwrap();

    let json = serde_json::to_string(&enc).unwrap();
    let back: EncryptedValue = serde_json::from_str(&json).unwrap();
    assert_eq!(svc.decrypt_value(&back, Some("bot-1")).unwrap(), "round-trip");
}

#[test]
fn scope_binding_is_part_of_the_format() {
    let svc = service();

    let bot_scoped = svc.encrypt_value("v", Some("bot-1")).unwrap();
    let platform_scoped = svc.encrypt_value("v", None).unwrap();

    assert!(svc.decrypt_value(&bot_scoped, Some("bot-1")).is_ok());
    assert!(svc.decrypt_value(&bot_scoped, Some("bot-2")).is_err());
    assert!(svc.decrypt_value(&bot_scoped, None).is_err());

    assert!(svc.decrypt_value(&platform_scoped, None).is_ok());
    assert!(svc.decrypt_value(&platform_scoped, Some("bot-1")).is_err());
}

#[test]
fn connection_config_envelope_uses_marker_keys() {
    let svc = service();
    let stored = svc
        .encrypt_connection_config(&serde_json::json!({"bot_token": "t"}), "bot-1")
        .unwrap();

    let obj = stored.as_object().unwrap();
    assert_eq!(obj.len(), 3);
    assert!(obj.contains_key("_encrypted"));
    assert!(obj.contains_key("_nonce"));
    assert!(obj.contains_key("_salt"));
}
