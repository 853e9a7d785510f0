//! Resolution of client credentials for confidential OAuth2 clients
//!
//! A confidential client can often prove its identity in more than one way:
//! a certificate, a client secret, a projected workload identity token, or a
//! managed identity. Which of those is actually usable depends on where the
//! application happens to be running. This library takes an ordered list of
//! candidate [`CredentialDescription`]s and resolves the first one that works,
//! falling back past sources that turn out to be unavailable.
//!
//! Signed assertions are relatively expensive to obtain, since each one needs
//! either a signature or a network round trip. A resolved assertion source is
//! wrapped in an [`AssertionCache`], which reuses each assertion until it
//! expires and ensures that concurrent callers share a single computation.
//!
//! # Example
//!
//! ```no_run
//! use aliri::jwt;
//! use aliri_credentials::{
//!     ClientCredential, ClientId, CredentialDescription, CredentialResolutionChain,
//!     LoaderParameters, LoaderRegistry,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let descriptions: Vec<CredentialDescription> = serde_json::from_str(r#"[
//!     { "source_type": "signed_assertion_file_path" },
//!     { "source_type": "signed_assertion_from_managed_identity" },
//!     { "source_type": "certificate_from_path", "path": "/etc/secrets/client.pem" }
//! ]"#)?;
//!
//! let chain = CredentialResolutionChain::new(LoaderRegistry::with_default_loaders());
//! let params = LoaderParameters::new()
//!     .with_client_id(ClientId::from_static("my-client"))
//!     .with_audience(jwt::Audience::from_static("https://login.example.com/oauth2/token"));
//!
//! let resolved = chain.resolve_first_viable(&descriptions, &params).await?;
//!
//! match resolved.client_credential(&CancellationToken::new()).await? {
//!     ClientCredential::Assertion(assertion) => { /* send as client_assertion */ }
//!     ClientCredential::Secret(secret) => { /* send as client_secret */ }
//! }
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod assertion;
mod braids;
pub mod chain;
pub mod clock;
mod description;
pub mod error;
pub mod loaders;
pub mod providers;

pub use assertion::{AssertionCache, AssertionProvider, ClientAssertion};
pub use braids::*;
pub use chain::{ClientCredential, CredentialResolutionChain, ResolvedCredential, SkipPolicy};
pub use description::{
    CredentialDescription, CredentialSource, LoadState, LoadedCredential, SourceKind,
};
pub use error::{
    ConfigurationError, ExhaustionError, ResolveError, SigningError, SourceUnavailable,
};
pub use loaders::{CacheSettings, CredentialSourceLoader, LoaderParameters, LoaderRegistry};
