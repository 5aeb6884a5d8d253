//! Secret resolution capability.
//!
//! The provider is injected at worker construction and consulted at dispatch
//! time; resolved values are used once and never cached by the store.

use std::collections::HashMap;

use async_trait::async_trait;

use proxy_types::SecretSource;

/// Typed secret-resolution failures; each maps onto one delivery
/// `failureReason` code.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SecretError {
    /// The reference is syntactically unusable.
    #[error("secret reference invalid: {0}")]
    RefInvalid(String),
    /// The provider refused access.
    #[error("secret provider forbade access to {0}")]
    Forbidden(String),
    /// The provider could not be reached.
    #[error("secret provider unavailable: {0}")]
    Unavailable(String),
    /// No secret exists under the reference.
    #[error("secret not found: {0}")]
    NotFound(String),
    /// The secret exists but could not be read.
    #[error("secret read failed: {0}")]
    ReadFailed(String),
    /// Any other provider failure.
    #[error("secret error: {0}")]
    Other(String),
}

/// Capability that resolves opaque references to secret values.
///
/// Implementations must return a non-empty value or a typed error.
#[async_trait]
pub trait SecretsProvider: Send + Sync {
    /// Resolve one reference.
    async fn resolve(&self, reference: &str) -> Result<String, SecretError>;
}

/// Resolve a [`SecretSource`]: inline values win, references go through the
/// provider.
pub async fn resolve_source(
    source: &SecretSource,
    provider: &dyn SecretsProvider,
) -> Result<String, SecretError> {
    if let Some(value) = &source.value {
        if value.is_empty() {
            return Err(SecretError::RefInvalid("inline secret is empty".into()));
        }
        return Ok(value.clone());
    }
    let reference = source
        .secret_ref
        .as_deref()
        .ok_or_else(|| SecretError::RefInvalid("neither value nor ref present".into()))?;
    if reference.trim().is_empty() {
        return Err(SecretError::RefInvalid("ref is empty".into()));
    }
    let value = provider.resolve(reference).await?;
    if value.is_empty() {
        return Err(SecretError::ReadFailed(format!(
            "provider returned an empty value for {reference}"
        )));
    }
    Ok(value)
}

/// Fixed-map provider for tests and single-node deployments.
#[derive(Debug, Default, Clone)]
pub struct StaticSecretsProvider {
    secrets: HashMap<String, String>,
}

impl StaticSecretsProvider {
    /// An empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one secret under a reference.
    pub fn with_secret(mut self, reference: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(reference.into(), value.into());
        self
    }
}

#[async_trait]
impl SecretsProvider for StaticSecretsProvider {
    async fn resolve(&self, reference: &str) -> Result<String, SecretError> {
        self.secrets
            .get(reference)
            .cloned()
            .ok_or_else(|| SecretError::NotFound(reference.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inline_value_wins_over_provider() {
        let provider = StaticSecretsProvider::new();
        let value = resolve_source(&SecretSource::inline("s3cret"), &provider)
            .await
            .unwrap();
        assert_eq!(value, "s3cret");
    }

    #[tokio::test]
    async fn missing_reference_is_typed() {
        let provider = StaticSecretsProvider::new();
        let err = resolve_source(&SecretSource::reference("vault://nope"), &provider)
            .await
            .unwrap_err();
        assert_eq!(err, SecretError::NotFound("vault://nope".into()));

        let empty = SecretSource {
            value: None,
            secret_ref: None,
        };
        assert!(matches!(
            resolve_source(&empty, &provider).await.unwrap_err(),
            SecretError::RefInvalid(_)
        ));
    }
}
