//! Credential scoping.
//!
//! A [`CredentialScope`] resolves named credentials through a
//! [`CredentialStore`] and hands the body a [`CredentialBinding`] per name.
//! Bindings share a slot with a guard owned by the scope; when the scope exits
//! (normal return, error, panic, or the future being dropped on cancellation)
//! the guard empties the slot and zeroes the secret. Any clone of a binding
//! that escaped the scope then reports [`GantryError::CredentialRevoked`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use zeroize::Zeroizing;

use crate::error::{GantryError, Result};
use crate::stage::CredentialRequirement;

/// Secret material. Zeroed on drop and redacted from `Debug`.
pub struct SecretValue(Zeroizing<String>);

impl SecretValue {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(Zeroizing::new(secret.into()))
    }

    fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(<redacted>)")
    }
}

/// Source of named secrets. Storage is external; only lookup is modelled.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<SecretValue>;
}

/// Resolves credential `name` from the environment variable
/// `<prefix><NAME>` where `NAME` is upper-cased with `-`/`.` mapped to `_`.
#[derive(Debug, Clone)]
pub struct EnvCredentialStore {
    prefix: String,
}

impl Default for EnvCredentialStore {
    fn default() -> Self {
        Self::new("GANTRY_CREDENTIAL_")
    }
}

impl EnvCredentialStore {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn variable_for(&self, name: &str) -> String {
        let suffix: String = name
            .chars()
            .map(|c| match c {
                '-' | '.' | ' ' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect();
        format!("{}{}", self.prefix, suffix)
    }
}

#[async_trait]
impl CredentialStore for EnvCredentialStore {
    async fn resolve(&self, name: &str) -> Result<SecretValue> {
        let var = self.variable_for(name);
        std::env::var(&var)
            .map(SecretValue::new)
            .map_err(|e| GantryError::CredentialResolution {
                name: name.to_string(),
                reason: format!("{var}: {e}"),
            })
    }
}

/// Fixed name → secret table. Useful for embedding and tests.
#[derive(Default)]
pub struct StaticCredentialStore {
    secrets: HashMap<String, String>,
}

impl StaticCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, name: impl Into<String>, secret: impl Into<String>) -> Self {
        self.secrets.insert(name.into(), secret.into());
        self
    }
}

#[async_trait]
impl CredentialStore for StaticCredentialStore {
    async fn resolve(&self, name: &str) -> Result<SecretValue> {
        self.secrets
            .get(name)
            .map(|s| SecretValue::new(s.clone()))
            .ok_or_else(|| GantryError::CredentialResolution {
                name: name.to_string(),
                reason: "not present in store".to_string(),
            })
    }
}

type Slot = Arc<Mutex<Option<SecretValue>>>;

/// A resolved credential, valid only inside the scope that produced it.
#[derive(Clone)]
pub struct CredentialBinding {
    name: String,
    env_var: Option<String>,
    slot: Slot,
}

impl CredentialBinding {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Environment variable the secret is exposed through for commands.
    pub fn env_var(&self) -> Option<&str> {
        self.env_var.as_deref()
    }

    pub fn is_valid(&self) -> bool {
        lock(&self.slot).is_some()
    }

    /// Borrow the secret for the duration of `f`.
    pub fn expose<R>(&self, f: impl FnOnce(&str) -> R) -> Result<R> {
        let guard = lock(&self.slot);
        match guard.as_ref() {
            Some(secret) => Ok(f(secret.as_str())),
            None => Err(GantryError::CredentialRevoked {
                name: self.name.clone(),
            }),
        }
    }
}

impl fmt::Debug for CredentialBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialBinding")
            .field("name", &self.name)
            .field("env_var", &self.env_var)
            .field("valid", &self.is_valid())
            .finish()
    }
}

fn lock(slot: &Slot) -> std::sync::MutexGuard<'_, Option<SecretValue>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Revokes its slot on drop; this is what ties binding lifetime to the scope.
struct ScopeGuard {
    slots: Vec<Slot>,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        for slot in &self.slots {
            lock(slot).take();
        }
    }
}

/// Scoped acquisition of credentials with release on every exit path.
#[derive(Clone)]
pub struct CredentialScope {
    store: Arc<dyn CredentialStore>,
}

impl CredentialScope {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    /// Run `body` with a binding for `name`.
    pub async fn with_credential<F, Fut, T>(&self, name: &str, body: F) -> Result<T>
    where
        F: FnOnce(CredentialBinding) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let requirement = CredentialRequirement {
            name: name.to_string(),
            env_var: None,
        };
        self.with_credentials(std::slice::from_ref(&requirement), |mut bindings| {
            // Exactly one requirement was passed in.
            let binding = bindings.remove(0);
            body(binding)
        })
        .await
    }

    /// Run `body` with one binding per requirement.
    ///
    /// Every credential is resolved before `body` starts, so a missing secret
    /// fails the caller before any side effect that would have used it.
    pub async fn with_credentials<F, Fut, T>(
        &self,
        requirements: &[CredentialRequirement],
        body: F,
    ) -> Result<T>
    where
        F: FnOnce(Vec<CredentialBinding>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut guard = ScopeGuard {
            slots: Vec::with_capacity(requirements.len()),
        };
        let mut bindings = Vec::with_capacity(requirements.len());

        for requirement in requirements {
            let secret = self.store.resolve(&requirement.name).await?;
            let slot: Slot = Arc::new(Mutex::new(Some(secret)));
            guard.slots.push(Arc::clone(&slot));
            bindings.push(CredentialBinding {
                name: requirement.name.clone(),
                env_var: requirement.env_var.clone(),
                slot,
            });
        }

        tracing::debug!(count = bindings.len(), "credential scope opened");
        let result = body(bindings).await;
        drop(guard);
        tracing::debug!("credential scope closed");
        result
    }
}
