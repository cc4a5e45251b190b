//! Scoped access to resolved provider keys.
//!
//! Plaintext credentials exist only inside this wrapper's lifetime. Closing
//! it (explicitly or on drop) zeroises every key before releasing the map,
//! and any access after close fails with [`EnvError::NotActive`].

use zeroize::Zeroize;

use crate::error::{EnvError, Result};
use crate::resolver::ResolvedEnvironment;

pub struct ScopedEnvironment {
    resolved: Option<ResolvedEnvironment>,
}

impl ScopedEnvironment {
    pub fn new(resolved: ResolvedEnvironment) -> Self {
        Self {
            resolved: Some(resolved),
        }
    }

    /// Look up the credential (or endpoint) for a provider.
    pub fn get(&self, provider: &str) -> Result<Option<&str>> {
        let resolved = self.resolved.as_ref().ok_or(EnvError::NotActive)?;
        Ok(resolved.provider_keys.get(provider).map(String::as_str))
    }

    /// Access the full resolved environment.
    pub fn resolved(&self) -> Result<&ResolvedEnvironment> {
        self.resolved.as_ref().ok_or(EnvError::NotActive)
    }

    /// Wipe provider keys and deactivate the scope.
    pub fn close(&mut self) {
        if let Some(mut resolved) = self.resolved.take() {
            for value in resolved.provider_keys.values_mut() {
                value.zeroize();
            }
            resolved.provider_keys.clear();
        }
    }
}

impl Drop for ScopedEnvironment {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved_with_key() -> ResolvedEnvironment {
        let mut env = ResolvedEnvironment::default();
        env.provider_keys
            .insert("openai".to_string(), "sk-test-1234".to_string());
        env
    }

    #[test]
    fn provides_keys_while_active() {
        let scope = ScopedEnvironment::new(resolved_with_key());
        assert_eq!(scope.get("openai").unwrap(), Some("sk-test-1234"));
        assert_eq!(scope.get("claude").unwrap(), None);
    }

    #[test]
    fn close_clears_keys_and_deactivates() {
        let mut scope = ScopedEnvironment::new(resolved_with_key());
        scope.close();
        assert!(matches!(scope.get("openai"), Err(EnvError::NotActive)));
        assert!(matches!(scope.resolved(), Err(EnvError::NotActive)));
    }

    #[test]
    fn close_is_idempotent() {
        let mut scope = ScopedEnvironment::new(resolved_with_key());
        scope.close();
        scope.close();
        assert!(scope.get("openai").is_err());
    }
}
