//! Assertion providers backed by certificates, files, managed identities, and vaults

use std::time::{Duration, SystemTime};

use aliri_base64::Base64Url;
use aliri_clock::UnixTime;

pub mod certificate;
pub mod file;
#[cfg(feature = "managed-identity")]
pub mod managed_identity;
pub mod vault;

pub use certificate::{CertificateAssertionProvider, CertificateError};
pub use file::FileAssertionProvider;
#[cfg(feature = "managed-identity")]
pub use managed_identity::{ManagedIdentityAssertionProvider, ManagedIdentityError};
pub use vault::{VaultAssertionProvider, VaultSecretReader};

#[derive(serde::Deserialize)]
struct ExpirationOnly {
    exp: Option<UnixTime>,
}

/// Reads the `exp` claim out of a compact JWT without verifying it
///
/// Returns `None` if the token is not a JWT or carries no expiration.
pub fn expiry_from_jwt(token: &str) -> Option<SystemTime> {
    let mut parts = token.split('.');
    let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(payload), Some(_), None) => payload,
        _ => return None,
    };

    let decoded = Base64Url::from_encoded(payload).ok()?;
    let claims: ExpirationOnly = serde_json::from_slice(decoded.as_slice()).ok()?;

    claims
        .exp
        .map(|exp| SystemTime::UNIX_EPOCH + Duration::from_secs(exp.0))
}

pub(crate) fn unix_time(time: SystemTime) -> UnixTime {
    UnixTime(
        time.duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default(),
    )
}
