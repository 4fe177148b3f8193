//! Credential providers for the generation service.
//!
//! Sessions query their [`TokenProvider`] exactly once, when they start. A
//! provider that yields `None` or an empty token makes the start fail with an
//! authentication error before any network I/O happens.

use std::fmt;

use secrecy::{ExposeSecret, SecretString};

/// Environment variable read by [`EnvToken::default`].
pub const DEFAULT_TOKEN_ENV_VAR: &str = "HF_TOKEN";

/// Source of the access token used to authenticate against the service.
pub trait TokenProvider: Send + Sync {
    /// Returns the current credential, if one is available.
    fn token(&self) -> Option<SecretString>;
}

/// Returns the provider's token only when it is present and non-blank.
pub(crate) fn usable_token(provider: &dyn TokenProvider) -> Option<SecretString> {
    provider
        .token()
        .filter(|token| !token.expose_secret().trim().is_empty())
}

/// Provider that always yields the same token.
#[derive(Clone)]
pub struct StaticToken(SecretString);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(SecretString::new(token.into()))
    }
}

impl From<SecretString> for StaticToken {
    fn from(token: SecretString) -> Self {
        Self(token)
    }
}

impl fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StaticToken").field(&"[REDACTED]").finish()
    }
}

impl TokenProvider for StaticToken {
    fn token(&self) -> Option<SecretString> {
        Some(self.0.clone())
    }
}

/// Provider that reads the token from an environment variable on every query.
#[derive(Clone, Debug)]
pub struct EnvToken {
    var: String,
}

impl EnvToken {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }

    /// Name of the environment variable this provider reads.
    pub fn var(&self) -> &str {
        &self.var
    }
}

impl Default for EnvToken {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_ENV_VAR)
    }
}

impl TokenProvider for EnvToken {
    fn token(&self) -> Option<SecretString> {
        std::env::var(&self.var).ok().map(SecretString::new)
    }
}

/// Adapts a closure into a [`TokenProvider`].
///
/// Useful when the token lives in application state that can change between
/// sessions.
pub struct TokenFn<F>(F);

impl<F> TokenFn<F>
where
    F: Fn() -> Option<SecretString> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> fmt::Debug for TokenFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TokenFn")
    }
}

impl<F> TokenProvider for TokenFn<F>
where
    F: Fn() -> Option<SecretString> + Send + Sync,
{
    fn token(&self) -> Option<SecretString> {
        (self.0)()
    }
}
