//! Credential verification and parsing.
//!
//! Turns a raw issued credential into a validated claim tree. Both format
//! variants enforce the same policy: the issuer signature must verify, the
//! credential's bound holder key must match the requesting key, and every
//! claim the issuer metadata marks mandatory must be present.

pub mod mdoc;
pub mod sd_jwt;

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value as Json;

use crate::core::crypto::KeyBinding;
use crate::core::metadata::{CredentialFormat, IssuerConfig};
use crate::error::Error;

/// Human-readable label of a parsed claim: the issuer-declared display
/// names keyed by locale, or the bare claim key when none were declared.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ClaimName {
    Localized(BTreeMap<String, String>),
    Plain(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedClaim {
    pub value: Json,
    pub name: ClaimName,
    pub mandatory: bool,
}

/// A verified, selectively-disclosed claim tree.
#[derive(Debug, Clone)]
pub struct ParsedCredential {
    pub claims: BTreeMap<String, ParsedClaim>,
    /// `exp`, seconds since the epoch. Always present for SD-JWT.
    pub expiration: Option<i64>,
    pub issued_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions {
    /// Skip the mandatory-claim check.
    pub ignore_missing_attributes: bool,
    /// Append claims present in the credential but absent from the issuer
    /// metadata, tagged non-mandatory.
    pub include_undefined_attributes: bool,
}

/// Verify and parse a raw credential according to the format its issuer
/// configuration declares.
///
/// `mdoc_trust_root` is the DER-encoded X.509 root the mdoc issuer chain
/// must anchor to; it is only consulted for the mdoc format.
pub fn verify_and_parse_credential<K: KeyBinding + ?Sized>(
    config: &IssuerConfig,
    credential_configuration_id: &str,
    raw: &str,
    holder_key: &K,
    mdoc_trust_root: Option<&[u8]>,
    options: ParseOptions,
) -> Result<ParsedCredential, Error> {
    let configuration = config
        .credential_configurations_supported
        .get(credential_configuration_id)
        .ok_or_else(|| {
            Error::validation(format!(
                "unknown credential configuration: {credential_configuration_id}"
            ))
        })?;
    let holder_jwk = holder_key.public_jwk().map_err(Error::signing)?;

    match &configuration.format {
        CredentialFormat::SdJwt => {
            let decoded = sd_jwt::decode(raw)?;
            sd_jwt::verify(&decoded, &config.jwks, &holder_jwk)?;
            sd_jwt::parse(&decoded, &configuration.claims, options)
        }
        CredentialFormat::MsoMdoc => {
            let trust_root = mdoc_trust_root.ok_or_else(|| {
                Error::validation("no trust root supplied for mdoc verification")
            })?;
            let decoded = mdoc::decode(raw)?;
            mdoc::verify(&decoded, trust_root, &holder_jwk)?;
            mdoc::parse(&decoded, &configuration.claims, options)
        }
        CredentialFormat::Other(name) => Err(Error::UnsupportedFormat(name.clone())),
    }
}
