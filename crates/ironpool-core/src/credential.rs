//! Credentials and connection-request info.
//!
//! A [`Credential`] identifies the principal a physical connection was
//! authenticated as. Pools compare credentials for exact equality when
//! deciding whether an idle connection may be handed to a new caller.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::PoolError;

/// Opaque connection-request info passed through to the factory.
///
/// Used as a partition key by the `PoolByCri` strategy and as an optional
/// discriminator inside a [`Credential`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestInfo {
    label: String,
    properties: BTreeMap<String, String>,
}

impl RequestInfo {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Builder method: attach a property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

impl fmt::Display for RequestInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)?;
        for (k, v) in &self.properties {
            write!(f, ";{k}={v}")?;
        }
        Ok(())
    }
}

/// Security identity under which a physical connection is established.
///
/// Immutable once built. Equality covers principal, secret and the optional
/// request-info discriminator.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential {
    principal: String,
    secret: String,
    request_info: Option<RequestInfo>,
}

impl Credential {
    pub fn new(principal: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            secret: secret.into(),
            request_info: None,
        }
    }

    /// Builder method: add a request-info discriminator.
    pub fn with_request_info(self, request_info: RequestInfo) -> Self {
        Self {
            request_info: Some(request_info),
            ..self
        }
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn request_info(&self) -> Option<&RequestInfo> {
        self.request_info.as_ref()
    }

    /// Exact-match policy: an idle connection is reusable only for an
    /// identical credential. Absent credentials only match absent ones.
    pub fn matches(stored: Option<&Credential>, requested: Option<&Credential>) -> bool {
        stored == requested
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("principal", &self.principal)
            .field("secret", &"<redacted>")
            .field("request_info", &self.request_info)
            .finish()
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.principal)
    }
}

/// Resolves the credential for the current caller.
///
/// Supplied by the surrounding container. Returning `Ok(None)` means the
/// no-security case.
pub trait SecurityCallback: Send + Sync {
    fn resolve(&self) -> Result<Option<Credential>, PoolError>;
}

impl<F> SecurityCallback for F
where
    F: Fn() -> Option<Credential> + Send + Sync,
{
    fn resolve(&self) -> Result<Option<Credential>, PoolError> {
        Ok(self())
    }
}

/// Security callback that always answers with the same credential.
#[derive(Clone, Debug, Default)]
pub struct StaticSecurity(Option<Credential>);

impl StaticSecurity {
    pub fn new(credential: Option<Credential>) -> Self {
        Self(credential)
    }

    pub fn into_shared(self) -> Arc<dyn SecurityCallback> {
        Arc::new(self)
    }
}

impl SecurityCallback for StaticSecurity {
    fn resolve(&self) -> Result<Option<Credential>, PoolError> {
        Ok(self.0.clone())
    }
}
