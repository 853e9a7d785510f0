//! Errors raised while resolving credentials and producing signed assertions

use std::{error::Error as StdError, fmt, sync::Arc};

use thiserror::Error;

use crate::SourceKind;

pub(crate) type BoxError = Box<dyn StdError + Send + Sync + 'static>;

type SharedError = Arc<dyn StdError + Send + Sync + 'static>;

/// A specific credential source could not be loaded or probed
///
/// These errors never cross the loader boundary as failures. They are
/// recorded on the credential description, which is then skipped.
#[derive(Clone, Debug, Error)]
#[error("{kind} credential source unavailable")]
pub struct SourceUnavailable {
    kind: SourceKind,
    #[source]
    source: SharedError,
}

impl SourceUnavailable {
    /// The kind of credential source that was unavailable
    pub fn kind(&self) -> SourceKind {
        self.kind
    }
}

pub(crate) fn source_unavailable(
    kind: SourceKind,
    source: impl Into<BoxError>,
) -> SourceUnavailable {
    SourceUnavailable {
        kind,
        source: Arc::from(source.into()),
    }
}

/// A record of one credential source tried during a failed resolution
#[derive(Clone, Debug)]
pub struct AttemptedSource {
    /// The position of the source in the configured list
    pub index: usize,
    /// The configured name of the source, if any
    pub name: Option<String>,
    /// The kind of credential source
    pub kind: SourceKind,
    /// The failure that caused the source to be skipped, if one was recorded
    pub error: Option<SourceUnavailable>,
}

impl fmt::Display for AttemptedSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{} ", self.index)?;
        if let Some(name) = &self.name {
            write!(f, "'{}' ", name)?;
        }
        write!(f, "({})", self.kind)
    }
}

/// Every configured credential source was unavailable
#[derive(Clone, Debug, Error)]
#[error("no usable credential among {} configured sources", .attempted.len())]
pub struct ExhaustionError {
    attempted: Vec<AttemptedSource>,
    #[source]
    last_error: Option<SourceUnavailable>,
}

impl ExhaustionError {
    /// The sources that were tried, in the order they were tried
    pub fn attempted(&self) -> &[AttemptedSource] {
        &self.attempted
    }

    /// The most recent underlying failure, useful for diagnostics
    pub fn last_error(&self) -> Option<&SourceUnavailable> {
        self.last_error.as_ref()
    }
}

pub(crate) fn exhausted(attempted: Vec<AttemptedSource>) -> ExhaustionError {
    let last_error = attempted.iter().rev().find_map(|a| a.error.clone());
    ExhaustionError {
        attempted,
        last_error,
    }
}

/// A resolved credential failed to produce a fresh signed assertion
#[derive(Clone, Debug, Error)]
pub enum SigningError {
    /// The underlying assertion provider failed
    #[error("assertion provider failed to produce a signed assertion")]
    Provider(#[source] SharedError),

    /// The caller stopped waiting for the assertion
    #[error("request for a signed assertion was cancelled")]
    Cancelled,
}

impl SigningError {
    /// Wraps a provider failure
    pub fn provider(source: impl Into<BoxError>) -> Self {
        Self::Provider(Arc::from(source.into()))
    }

    /// Whether this error was caused by cancellation of the caller
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// A credential description cannot be handled as configured
///
/// This is a programming or configuration error. It is never converted into a
/// skipped source.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// No loader was registered for the kind of credential source
    #[error("no loader registered for {0} credential sources")]
    UnregisteredKind(SourceKind),

    /// A loader was handed a credential source of another kind
    #[error("{loader} loader cannot load a {actual} credential source")]
    KindMismatch {
        /// The kind the loader handles
        loader: SourceKind,
        /// The kind of the source it was given
        actual: SourceKind,
    },

    /// Required addressing data is missing
    #[error("{kind} credential source requires `{field}`")]
    MissingField {
        /// The kind of credential source
        kind: SourceKind,
        /// The name of the missing value
        field: &'static str,
    },

    /// Addressing data is present but unusable
    #[error("{kind} credential source has an invalid `{field}`: {reason}")]
    InvalidField {
        /// The kind of credential source
        kind: SourceKind,
        /// The name of the invalid value
        field: &'static str,
        /// Why the value was rejected
        reason: String,
    },

    /// A vault-backed source was configured without a vault reader
    #[error("{0} credential source is stored in a vault, but no vault reader is registered")]
    NoVaultReader(SourceKind),

    /// A custom assertion source names a provider that was never registered
    #[error("no custom assertion provider registered as '{0}'")]
    UnknownCustomProvider(String),
}

/// An error returned while resolving the first viable credential
#[derive(Clone, Debug, Error)]
pub enum ResolveError {
    /// All configured sources were unavailable
    #[error(transparent)]
    Exhausted(#[from] ExhaustionError),

    /// A credential description is misconfigured
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// The caller cancelled the resolution
    #[error("credential resolution was cancelled")]
    Cancelled,
}
