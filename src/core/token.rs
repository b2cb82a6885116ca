//! Authorization-code to access-token exchange.

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::core::crypto::KeyBinding;
use crate::core::metadata::IssuerConfig;
use crate::core::profile::ProtocolProfile;
use crate::core::proof::{dpop_proof, wallet_attestation_pop, HttpMethod, WalletAttestation};
use crate::core::util::{body_text, send, AsyncHttpClient};
use crate::error::{Error, TOKEN_ENDPOINT_ERRORS};

/// A DPoP-bound access token, as returned by the token endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub c_nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub c_nonce_expires_in: Option<u64>,
    pub authorization_details: Vec<AuthorizationDetail>,
}

/// One granted entry of the token's `authorization_details`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationDetail {
    pub r#type: String,
    pub credential_configuration_id: String,
    #[serde(default)]
    pub credential_identifiers: Vec<String>,
}

impl AccessToken {
    /// Whether this token grants the requested configuration (and
    /// identifier, when one is supplied).
    pub(crate) fn grants(
        &self,
        credential_configuration_id: &str,
        credential_identifier: Option<&str>,
    ) -> bool {
        self.authorization_details.iter().any(|detail| {
            detail.credential_configuration_id == credential_configuration_id
                && credential_identifier
                    .map(|id| detail.credential_identifiers.iter().any(|c| c == id))
                    .unwrap_or(true)
        })
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    token_type: String,
    expires_in: u64,
    c_nonce: Option<String>,
    c_nonce_expires_in: Option<u64>,
    // Absent when the PAR used `scope`; scope-only tokens are unsupported.
    authorization_details: Option<Vec<AuthorizationDetail>>,
}

/// Exchange an authorization code for a DPoP-bound [`AccessToken`].
///
/// The DPoP proof is bound to `POST {token_endpoint}` with `dpop_key`; the
/// wallet attestation PoP is addressed to the credential issuer. All
/// transport and schema failures surface as taxonomy members.
#[allow(clippy::too_many_arguments)]
pub async fn authorize_access<H, D, W>(
    http: &H,
    config: &IssuerConfig,
    profile: &ProtocolProfile,
    dpop_key: &D,
    attestation_key: &W,
    attestation: &WalletAttestation,
    code: &str,
    redirect_uri: &Url,
    code_verifier: &str,
) -> Result<AccessToken, Error>
where
    H: AsyncHttpClient + ?Sized,
    D: KeyBinding + ?Sized,
    W: KeyBinding + ?Sized,
{
    let dpop = dpop_proof(
        dpop_key,
        HttpMethod::Post,
        &config.token_endpoint,
        &Uuid::new_v4().to_string(),
        None,
    )
    .await?;
    let pop = wallet_attestation_pop(
        attestation_key,
        &Uuid::new_v4().to_string(),
        config.issuer_identifier(),
        &attestation.cnf_kid,
    )
    .await?;

    let mut form: Vec<(&'static str, String)> = vec![
        ("grant_type", "authorization_code".to_owned()),
        ("code", code.to_owned()),
        ("redirect_uri", redirect_uri.to_string()),
        ("code_verifier", code_verifier.to_owned()),
        ("client_id", attestation.cnf_kid.clone()),
    ];

    let mut builder = crate::core::util::base_request()
        .method("POST")
        .uri(config.token_endpoint.as_str())
        .header(http::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .header("DPoP", &dpop);
    builder = profile.attach_attestation(builder, &mut form, &attestation.raw, &pop);

    let body = serde_urlencoded::to_string(&form)
        .map_err(|e| Error::validation_with("unable to encode token request", e))?;
    let request = builder
        .body(body.into_bytes())
        .map_err(|e| Error::validation_with("unable to build token request", e))?;

    debug!(endpoint = %config.token_endpoint, "exchanging authorization code");
    let (status, body) = send(http, request)
        .await
        .map_err(|e| TOKEN_ENDPOINT_ERRORS.transport(format!("{e:#}")))?;

    if !(200..300).contains(&status) {
        return Err(TOKEN_ENDPOINT_ERRORS.error(status, body_text(&body)));
    }

    let response: TokenResponse = serde_json::from_slice(&body)
        .map_err(|e| Error::validation_with("token response failed schema validation", e))?;
    let authorization_details = response.authorization_details.ok_or_else(|| {
        Error::validation("access token without authorization_details is not supported")
    })?;

    Ok(AccessToken {
        access_token: response.access_token,
        token_type: response.token_type,
        expires_in: response.expires_in,
        c_nonce: response.c_nonce,
        c_nonce_expires_in: response.c_nonce_expires_in,
        authorization_details,
    })
}
