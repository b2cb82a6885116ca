//! The public error taxonomy.
//!
//! Every internal HTTP or parse failure is caught at one boundary per call
//! and re-raised as a member of this taxonomy; raw transport errors never
//! cross the public surface. Nothing is retried internally; every error
//! carries enough structured detail (code plus reason) for the caller to
//! decide what to do next.

use std::fmt;

/// Machine-readable refinement of an issuer error response, resolved from
/// the HTTP status through a per-endpoint [`StatusCodeMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssuerResponseCode {
    /// Catch-all for issuer responses no other code describes.
    Generic,
    /// The credential endpoint reported an invalid status for the requested
    /// credential (HTTP 403/404).
    CredentialInvalidStatus,
    /// The credential endpoint rejected the request for any other reason.
    CredentialRequestFailed,
    /// The PAR endpoint rejected the pushed authorization request.
    ParRequestFailed,
    /// The token endpoint rejected the authorization-code exchange.
    TokenRequestFailed,
    /// An MRTD proof-of-possession challenge step failed.
    MrtdChallengeFailed,
}

impl fmt::Display for IssuerResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Generic => "issuer_generic_error",
            Self::CredentialInvalidStatus => "credential_invalid_status",
            Self::CredentialRequestFailed => "credential_request_failed",
            Self::ParRequestFailed => "par_request_failed",
            Self::TokenRequestFailed => "token_request_failed",
            Self::MrtdChallengeFailed => "mrtd_challenge_failed",
        };
        f.write_str(name)
    }
}

/// A declarative status→code table for a single endpoint.
///
/// Entries are consulted in order; the fallback code applies when no entry
/// matches.
pub(crate) struct StatusCodeMap {
    pub entries: &'static [(u16, IssuerResponseCode)],
    pub fallback: IssuerResponseCode,
}

impl StatusCodeMap {
    pub(crate) fn code_for(&self, status: u16) -> IssuerResponseCode {
        self.entries
            .iter()
            .find(|(s, _)| *s == status)
            .map(|(_, c)| *c)
            .unwrap_or(self.fallback)
    }

    /// Build the taxonomy error for a non-success response from this
    /// endpoint.
    pub(crate) fn error(&self, status: u16, reason: impl Into<String>) -> Error {
        Error::IssuerResponse {
            code: self.code_for(status),
            status: Some(status),
            reason: reason.into(),
        }
    }

    /// Build the taxonomy error for a transport failure, where no HTTP
    /// status ever materialized.
    pub(crate) fn transport(&self, reason: impl Into<String>) -> Error {
        Error::IssuerResponse {
            code: self.fallback,
            status: None,
            reason: reason.into(),
        }
    }
}

/// Status→code table for the credential endpoint. HTTP 201 is handled
/// before this table applies (deferred issuance is an outcome, not an
/// error).
pub(crate) const CREDENTIAL_ENDPOINT_ERRORS: StatusCodeMap = StatusCodeMap {
    entries: &[
        (403, IssuerResponseCode::CredentialInvalidStatus),
        (404, IssuerResponseCode::CredentialInvalidStatus),
    ],
    fallback: IssuerResponseCode::CredentialRequestFailed,
};

pub(crate) const PAR_ENDPOINT_ERRORS: StatusCodeMap = StatusCodeMap {
    entries: &[],
    fallback: IssuerResponseCode::ParRequestFailed,
};

pub(crate) const TOKEN_ENDPOINT_ERRORS: StatusCodeMap = StatusCodeMap {
    entries: &[],
    fallback: IssuerResponseCode::TokenRequestFailed,
};

pub(crate) const AUTHORIZATION_ENDPOINT_ERRORS: StatusCodeMap = StatusCodeMap {
    entries: &[],
    fallback: IssuerResponseCode::Generic,
};

pub(crate) const MRTD_ENDPOINT_ERRORS: StatusCodeMap = StatusCodeMap {
    entries: &[],
    fallback: IssuerResponseCode::MrtdChallengeFailed,
};

pub(crate) const NONCE_ENDPOINT_ERRORS: StatusCodeMap = StatusCodeMap {
    entries: &[],
    fallback: IssuerResponseCode::Generic,
};

/// Errors surfaced by the issuance engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The signing capability rejected a signing request. Never retried.
    #[error("signing capability rejected the request: {reason}")]
    SigningFailed { reason: String },

    /// An authorization response could not be understood.
    #[error("malformed authorization response: {reason}")]
    Authorization { reason: String },

    /// The identity provider explicitly denied the authorization.
    #[error("authorization denied by the identity provider: {error}")]
    AuthorizationIdp {
        error: String,
        error_description: Option<String>,
    },

    /// A wire response failed schema validation. `reason` carries the
    /// structural diagnostic when one is available.
    #[error("response failed validation: {message}")]
    ValidationFailed {
        message: String,
        reason: Option<String>,
    },

    /// The issuer answered with an error response, or the transport failed
    /// before any response materialized (`status: None`).
    #[error("issuer response error ({code}): {reason}")]
    IssuerResponse {
        code: IssuerResponseCode,
        status: Option<u16>,
        reason: String,
    },

    /// A disclosure digest was absent from the credential's declared digest
    /// sets, a value digest did not match, or holder binding failed.
    #[error("credential integrity violation: {reason}")]
    IntegrityViolation { reason: String },

    /// A mandatory claim was absent from both the disclosures and the plain
    /// payload.
    #[error("mandatory claims missing from the credential. Missing: [{missing}], received: [{received}]")]
    MissingMandatoryClaim { missing: String, received: String },

    /// The issuer declared a credential format this engine cannot verify.
    /// Fatal and non-retryable.
    #[error("unsupported credential format: {0}")]
    UnsupportedFormat(String),
}

impl Error {
    pub(crate) fn signing(source: anyhow::Error) -> Self {
        Self::SigningFailed {
            reason: format!("{source:#}"),
        }
    }

    pub(crate) fn authorization(reason: impl Into<String>) -> Self {
        Self::Authorization {
            reason: reason.into(),
        }
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::ValidationFailed {
            message: message.into(),
            reason: None,
        }
    }

    pub(crate) fn validation_with(
        message: impl Into<String>,
        reason: impl fmt::Display,
    ) -> Self {
        Self::ValidationFailed {
            message: message.into(),
            reason: Some(reason.to_string()),
        }
    }

    pub(crate) fn integrity(reason: impl Into<String>) -> Self {
        Self::IntegrityViolation {
            reason: reason.into(),
        }
    }
}
