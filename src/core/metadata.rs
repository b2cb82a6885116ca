//! Issuer metadata wire types.
//!
//! [`IssuerConfig`] is produced externally by trust/metadata discovery and
//! consumed read-only here. Only the fields the issuance flow touches are
//! modelled.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::core::crypto::Jwk;

/// Issuer configuration, resolved and validated by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuerConfig {
    pub credential_issuer: Url,
    pub pushed_authorization_request_endpoint: Url,
    pub authorization_endpoint: Url,
    pub token_endpoint: Url,
    pub nonce_endpoint: Url,
    pub credential_endpoint: Url,
    pub jwks: JwkSet,
    pub credential_configurations_supported: HashMap<String, CredentialConfiguration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_credential_issuance: Option<BatchCredentialIssuance>,
    /// Response modes the authorization endpoint advertises.
    #[serde(default = "default_response_modes")]
    pub response_modes_supported: Vec<ResponseMode>,
}

fn default_response_modes() -> Vec<ResponseMode> {
    vec![ResponseMode::Query, ResponseMode::FormPostJwt]
}

impl IssuerConfig {
    /// The issuer identifier used as PoP audience and proof issuer,
    /// without a trailing slash.
    pub fn issuer_identifier(&self) -> &str {
        self.credential_issuer.as_str().trim_end_matches('/')
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

impl JwkSet {
    pub(crate) fn find(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|k| k.kid.as_deref() == Some(kid))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BatchCredentialIssuance {
    pub batch_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseMode {
    #[serde(rename = "query")]
    Query,
    #[serde(rename = "form_post.jwt")]
    FormPostJwt,
}

impl ResponseMode {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::FormPostJwt => "form_post.jwt",
        }
    }
}

/// Credential format identifier.
///
/// Closed set of formats the verifier understands, with a carrier for
/// anything else so metadata for unknown formats still deserializes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CredentialFormat {
    /// IETF SD-JWT VC, `dc+sd-jwt`.
    SdJwt,
    /// ISO/IEC 18013-5 mdoc, `mso_mdoc`.
    MsoMdoc,
    Other(String),
}

impl CredentialFormat {
    pub fn name(&self) -> &str {
        match self {
            Self::SdJwt => "dc+sd-jwt",
            Self::MsoMdoc => "mso_mdoc",
            Self::Other(name) => name,
        }
    }
}

impl From<String> for CredentialFormat {
    fn from(name: String) -> Self {
        match name.as_str() {
            "dc+sd-jwt" => Self::SdJwt,
            "mso_mdoc" => Self::MsoMdoc,
            _ => Self::Other(name),
        }
    }
}

impl From<CredentialFormat> for String {
    fn from(format: CredentialFormat) -> Self {
        format.name().to_owned()
    }
}

impl std::fmt::Display for CredentialFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialConfiguration {
    pub format: CredentialFormat,
    /// SD-JWT verifiable credential type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vct: Option<String>,
    /// mdoc document type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doctype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default)]
    pub claims: Vec<ClaimMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimMetadata {
    pub path: Vec<ClaimPathSegment>,
    #[serde(default)]
    pub mandatory: bool,
    #[serde(default)]
    pub display: Vec<ClaimDisplay>,
}

impl ClaimMetadata {
    /// Display names keyed by locale.
    pub(crate) fn localized_names(&self) -> std::collections::BTreeMap<String, String> {
        self.display
            .iter()
            .map(|d| (d.locale.clone(), d.name.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClaimPathSegment {
    Key(String),
    Index(usize),
    /// `null`, selecting every element of an array.
    All,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimDisplay {
    pub name: String,
    pub locale: String,
}

/// One entry of the `authorization_details` a wallet pushes through PAR.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AuthorizationDetailRequest {
    #[serde(rename = "openid_credential")]
    OpenIdCredential { credential_configuration_id: String },
    /// Requests an MRTD document-scan proof alongside eID authentication.
    #[serde(rename = "it_l2+document_proof")]
    DocumentProof {
        idphinting: String,
        challenge_method: String,
        challenge_redirect_uri: Url,
    },
}
