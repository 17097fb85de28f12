//! Identity codec boundary.
//!
//! Transports usually restrict which characters an identifier may contain,
//! while mesh identities are free-form. A codec maps one onto the other,
//! reversibly, and scopes identities to a namespace so that unrelated meshes
//! sharing a transport do not collide.

use crate::{Error, Identity, Result};

/// Namespace used by [`NamespaceCodec::default`].
pub const DEFAULT_NAMESPACE: &str = "meshsync";

/// Reversible mapping between mesh identities and transport identifiers.
pub trait IdentityCodec: Send + Sync {
    /// Encodes an identity into a transport-legal identifier.
    fn encode(&self, identity: &Identity) -> String;

    /// Decodes a transport identifier back into an identity.
    fn decode(&self, transport_id: &str) -> Result<Identity>;
}

/// Encodes identities as `{namespace}-{hex(utf8)}`.
///
/// The hex body keeps the identifier alphanumeric whatever the identity
/// contains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceCodec {
    namespace: String,
}

impl NamespaceCodec {
    /// Creates a codec for the given namespace.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Returns the namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl Default for NamespaceCodec {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

impl IdentityCodec for NamespaceCodec {
    fn encode(&self, identity: &Identity) -> String {
        format!("{}-{}", self.namespace, hex::encode(identity.as_str()))
    }

    fn decode(&self, transport_id: &str) -> Result<Identity> {
        let body = transport_id
            .strip_prefix(self.namespace.as_str())
            .and_then(|rest| rest.strip_prefix('-'))
            .ok_or_else(|| {
                Error::InvalidTransportId(format!(
                    "{transport_id:?} is not in namespace {:?}",
                    self.namespace
                ))
            })?;

        let bytes = hex::decode(body)
            .map_err(|e| Error::InvalidTransportId(format!("{transport_id:?}: {e}")))?;
        let name = String::from_utf8(bytes)
            .map_err(|e| Error::InvalidTransportId(format!("{transport_id:?}: {e}")))?;

        Identity::new(name)
    }
}
