//! Descriptions of candidate credential sources and their load state

use std::{fmt, path::PathBuf, sync::Arc};

use aliri::jwk::KeyId;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};

use crate::{assertion::AssertionCache, error::SourceUnavailable, ClientSecret};

/// The kind of a credential source, used to select its loader
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// A private key used to sign a client assertion locally
    Certificate,
    /// A shared client secret
    ClientSecret,
    /// A signed assertion read from a file, such as a projected workload identity token
    SignedAssertionFilePath,
    /// A signed assertion issued by a managed identity endpoint
    SignedAssertionFromManagedIdentity,
    /// A signed assertion stored in a vault
    SignedAssertionFromVault,
    /// A signed assertion produced by an application-registered provider
    CustomSignedAssertion,
}

impl SourceKind {
    /// The configuration name of this kind
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Certificate => "certificate",
            Self::ClientSecret => "client_secret",
            Self::SignedAssertionFilePath => "signed_assertion_file_path",
            Self::SignedAssertionFromManagedIdentity => "signed_assertion_from_managed_identity",
            Self::SignedAssertionFromVault => "signed_assertion_from_vault",
            Self::CustomSignedAssertion => "custom_signed_assertion",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a credential comes from
///
/// The location data is opaque to the resolution chain and only interpreted
/// by the loader for the source's [`SourceKind`]. Sources are only ever read
/// from configuration, and are not serializable so a client secret cannot be
/// written back out in the clear.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "source_type", rename_all = "snake_case")]
pub enum CredentialSource {
    /// A PEM-encoded RSA private key on the local filesystem
    CertificateFromPath {
        /// Path to the PEM file
        path: PathBuf,
        /// Key ID to advertise in the assertion header
        key_id: Option<KeyId>,
    },
    /// A base64-encoded PEM RSA private key held inline in configuration
    CertificateFromBase64 {
        /// The base64-encoded PEM document
        value: String,
        /// Key ID to advertise in the assertion header
        key_id: Option<KeyId>,
    },
    /// A PEM RSA private key stored in a vault
    CertificateFromVault {
        /// The vault's URL
        vault_url: String,
        /// The name of the secret holding the PEM document
        secret_name: String,
        /// Key ID to advertise in the assertion header
        key_id: Option<KeyId>,
    },
    /// A shared client secret
    ClientSecret {
        /// The secret value
        secret: ClientSecret,
    },
    /// A signed assertion read from a file
    ///
    /// If no path is configured, the `AZURE_FEDERATED_TOKEN_FILE` environment
    /// variable is consulted.
    SignedAssertionFilePath {
        /// Path to the assertion file
        path: Option<PathBuf>,
    },
    /// A signed assertion issued by a managed identity endpoint
    SignedAssertionFromManagedIdentity {
        /// Client ID of a user-assigned managed identity
        client_id: Option<String>,
        /// Token endpoint, defaulting to the instance metadata service
        endpoint: Option<String>,
        /// Resource the assertion is requested for
        audience: Option<String>,
    },
    /// A signed assertion stored in a vault
    SignedAssertionFromVault {
        /// The vault's URL
        vault_url: String,
        /// The name of the secret holding the assertion
        secret_name: String,
    },
    /// A signed assertion produced by a named, application-registered provider
    CustomSignedAssertion {
        /// The name the provider was registered under
        provider_name: String,
    },
}

impl CredentialSource {
    /// The kind of this source, which selects its loader
    pub fn kind(&self) -> SourceKind {
        match self {
            Self::CertificateFromPath { .. }
            | Self::CertificateFromBase64 { .. }
            | Self::CertificateFromVault { .. } => SourceKind::Certificate,
            Self::ClientSecret { .. } => SourceKind::ClientSecret,
            Self::SignedAssertionFilePath { .. } => SourceKind::SignedAssertionFilePath,
            Self::SignedAssertionFromManagedIdentity { .. } => {
                SourceKind::SignedAssertionFromManagedIdentity
            }
            Self::SignedAssertionFromVault { .. } => SourceKind::SignedAssertionFromVault,
            Self::CustomSignedAssertion { .. } => SourceKind::CustomSignedAssertion,
        }
    }
}

/// A materialized, reusable credential
#[derive(Clone, Debug)]
pub enum LoadedCredential {
    /// A client secret
    Secret(ClientSecret),
    /// A source of signed assertions, memoized until each assertion expires
    Assertion(Arc<AssertionCache>),
}

/// The mutable resolution state of a credential description
///
/// Only the loader for the description's kind mutates this state, and only
/// while the resolution chain holds the description's lock.
#[derive(Debug, Default)]
pub struct LoadState {
    cached_value: Option<LoadedCredential>,
    skip: bool,
    last_error: Option<SourceUnavailable>,
}

impl LoadState {
    /// The credential materialized by a previous load, if any
    pub fn cached_value(&self) -> Option<&LoadedCredential> {
        self.cached_value.as_ref()
    }

    /// Stores a materialized credential for reuse
    pub fn set_cached_value(&mut self, value: LoadedCredential) {
        self.cached_value = Some(value);
    }

    /// Whether this description has been eliminated from consideration
    pub fn is_skipped(&self) -> bool {
        self.skip
    }

    /// Eliminates this description from consideration, recording why
    pub fn skip(&mut self, reason: SourceUnavailable) {
        self.skip = true;
        self.last_error = Some(reason);
    }

    /// The failure recorded when this description was last skipped
    pub fn last_error(&self) -> Option<&SourceUnavailable> {
        self.last_error.as_ref()
    }

    fn reset(&mut self) {
        self.skip = false;
        self.last_error = None;
    }
}

/// One candidate credential source and its resolution state
///
/// Descriptions are normally deserialized from configuration:
///
/// ```
/// use aliri_credentials::{CredentialDescription, SourceKind};
///
/// let description: CredentialDescription = serde_json::from_str(r#"{
///     "name": "workload identity",
///     "source_type": "signed_assertion_file_path",
///     "path": "/var/run/secrets/tokens/azure-identity-token"
/// }"#).unwrap();
///
/// assert_eq!(description.kind(), SourceKind::SignedAssertionFilePath);
/// ```
#[derive(Debug, Deserialize)]
pub struct CredentialDescription {
    #[serde(default)]
    name: Option<String>,
    #[serde(flatten)]
    source: CredentialSource,
    #[serde(skip)]
    state: Mutex<LoadState>,
}

impl CredentialDescription {
    /// Constructs a new, untried description
    pub fn new(source: CredentialSource) -> Self {
        Self {
            name: None,
            source,
            state: Mutex::default(),
        }
    }

    /// Attaches a name used in diagnostics
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// The configured name, if any
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Where the credential comes from
    pub fn source(&self) -> &CredentialSource {
        &self.source
    }

    /// The kind of credential source
    pub fn kind(&self) -> SourceKind {
        self.source.kind()
    }

    /// Whether this description is currently skipped
    pub async fn is_skipped(&self) -> bool {
        self.state.lock().await.is_skipped()
    }

    /// The credential materialized for this description, if any
    pub async fn cached_value(&self) -> Option<LoadedCredential> {
        self.state.lock().await.cached_value().cloned()
    }

    /// Makes this description eligible for resolution again
    ///
    /// Any materialized credential is kept so that a retry can reuse it.
    pub async fn reset(&self) {
        self.state.lock().await.reset();
    }

    pub(crate) async fn lock_state(&self) -> MutexGuard<'_, LoadState> {
        self.state.lock().await
    }
}

impl fmt::Display for CredentialDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "'{}' ({})", name, self.kind()),
            None => fmt::Display::fmt(&self.kind(), f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::source_unavailable;

    #[test]
    fn deserializes_client_secret_description() -> color_eyre::Result<()> {
        let description: CredentialDescription = serde_json::from_str(
            r#"{ "source_type": "client_secret", "secret": "shh" }"#,
        )?;

        assert_eq!(description.kind(), SourceKind::ClientSecret);
        assert!(description.name().is_none());
        match description.source() {
            CredentialSource::ClientSecret { secret } => assert_eq!(secret.as_str(), "shh"),
            other => panic!("unexpected source: {:?}", other),
        }

        Ok(())
    }

    #[test]
    fn client_secret_source_never_prints_the_secret() -> color_eyre::Result<()> {
        let description: CredentialDescription = serde_json::from_str(
            r#"{ "source_type": "client_secret", "secret": "correct-horse-battery" }"#,
        )?;

        assert!(!format!("{:?}", description.source()).contains("correct-horse-battery"));
        assert!(!format!("{:?}", description).contains("correct-horse-battery"));
        assert!(!description.to_string().contains("correct-horse-battery"));

        Ok(())
    }

    #[test]
    fn deserializes_vault_certificate_with_key_id() -> color_eyre::Result<()> {
        let description: CredentialDescription = serde_json::from_str(
            r#"{
                "name": "vault cert",
                "source_type": "certificate_from_vault",
                "vault_url": "https://example.vault.azure.net",
                "secret_name": "client-cert",
                "key_id": "kid-1"
            }"#,
        )?;

        assert_eq!(description.kind(), SourceKind::Certificate);
        assert_eq!(description.name(), Some("vault cert"));
        match description.source() {
            CredentialSource::CertificateFromVault {
                secret_name,
                key_id,
                ..
            } => {
                assert_eq!(secret_name, "client-cert");
                assert_eq!(key_id.as_ref().map(|k| k.as_str()), Some("kid-1"));
            }
            other => panic!("unexpected source: {:?}", other),
        }

        Ok(())
    }

    #[test]
    fn all_certificate_locations_share_a_kind() {
        let sources = [
            CredentialSource::CertificateFromPath {
                path: "key.pem".into(),
                key_id: None,
            },
            CredentialSource::CertificateFromBase64 {
                value: String::new(),
                key_id: None,
            },
            CredentialSource::CertificateFromVault {
                vault_url: "https://vault".into(),
                secret_name: "cert".into(),
                key_id: None,
            },
        ];

        for source in &sources {
            assert_eq!(source.kind(), SourceKind::Certificate);
        }
    }

    #[tokio::test]
    async fn reset_keeps_cached_value() {
        let description = CredentialDescription::new(CredentialSource::ClientSecret {
            secret: ClientSecret::from_static("shh"),
        })
        .with_name("primary");

        {
            let mut state = description.lock_state().await;
            state.set_cached_value(LoadedCredential::Secret(ClientSecret::from_static("shh")));
            state.skip(source_unavailable(SourceKind::ClientSecret, "nope"));
        }

        assert!(description.is_skipped().await);

        description.reset().await;

        assert!(!description.is_skipped().await);
        assert!(description.cached_value().await.is_some());
        assert_eq!(description.to_string(), "'primary' (client_secret)");
    }
}
