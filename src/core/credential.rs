//! Credential request against the issuer's credential endpoint.

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::core::crypto::KeyBinding;
use crate::core::metadata::{CredentialFormat, IssuerConfig};
use crate::core::profile::{ProofShape, ProtocolProfile};
use crate::core::proof::{access_token_hash, credential_nonce_proof, dpop_proof, HttpMethod};
use crate::core::token::AccessToken;
use crate::core::util::{body_text, json_post_request, send, AsyncHttpClient};
use crate::error::{Error, CREDENTIAL_ENDPOINT_ERRORS, NONCE_ENDPOINT_ERRORS};

/// What to request: a configuration id, optionally narrowed to one of the
/// credential identifiers granted for it.
#[derive(Debug, Clone)]
pub struct CredentialRequest<'a> {
    pub credential_configuration_id: &'a str,
    pub credential_identifier: Option<&'a str>,
}

/// A successfully issued credential batch.
#[derive(Debug, Clone)]
pub struct IssuedCredential {
    /// Raw credentials, positionally matching the submitted proofs.
    pub credentials: Vec<String>,
    pub format: CredentialFormat,
    pub notification_id: Option<String>,
}

/// Outcome of a credential request. Deferred issuance (HTTP 201) is not a
/// success and not an error.
#[derive(Debug, Clone)]
pub enum CredentialRequestOutcome {
    Issued(IssuedCredential),
    Deferred,
}

#[derive(Deserialize)]
struct NonceResponse {
    c_nonce: String,
}

#[derive(Serialize)]
struct ProofObject<'a> {
    proof_type: &'static str,
    jwt: &'a str,
}

#[derive(Serialize)]
struct ProofList<'a> {
    jwt: &'a [String],
}

#[derive(Serialize)]
struct CredentialRequestBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    credential_configuration_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    credential_identifier: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    proof: Option<ProofObject<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    proofs: Option<ProofList<'a>>,
}

#[derive(Deserialize)]
struct CredentialResponse {
    credentials: Vec<CredentialEntry>,
    notification_id: Option<String>,
}

#[derive(Deserialize)]
struct CredentialEntry {
    credential: String,
}

async fn fetch_nonce<H: AsyncHttpClient + ?Sized>(
    http: &H,
    config: &IssuerConfig,
) -> Result<String, Error> {
    let request = crate::core::util::base_request()
        .method("POST")
        .uri(config.nonce_endpoint.as_str())
        .body(Vec::new())
        .map_err(|e| Error::validation_with("unable to build nonce request", e))?;
    let (status, body) = send(http, request)
        .await
        .map_err(|e| NONCE_ENDPOINT_ERRORS.transport(format!("{e:#}")))?;
    if !(200..300).contains(&status) {
        return Err(NONCE_ENDPOINT_ERRORS.error(status, body_text(&body)));
    }
    let response: NonceResponse = serde_json::from_slice(&body)
        .map_err(|e| Error::validation_with("nonce response failed schema validation", e))?;
    Ok(response.c_nonce)
}

/// Request issuance of a credential.
///
/// The access token must grant the requested configuration before any
/// credential-endpoint call is made. Proofs are built over a fresh
/// `c_nonce`, one per batch slot, and joined before the request body is
/// composed.
#[allow(clippy::too_many_arguments)]
pub async fn obtain_credential<H, D, C>(
    http: &H,
    config: &IssuerConfig,
    profile: &ProtocolProfile,
    access_token: &AccessToken,
    dpop_key: &D,
    credential_key: &C,
    client_id: &str,
    request: CredentialRequest<'_>,
) -> Result<CredentialRequestOutcome, Error>
where
    H: AsyncHttpClient + ?Sized,
    D: KeyBinding + ?Sized,
    C: KeyBinding + ?Sized,
{
    let configuration = config
        .credential_configurations_supported
        .get(request.credential_configuration_id)
        .ok_or_else(|| {
            Error::validation(format!(
                "unknown credential configuration: {}",
                request.credential_configuration_id
            ))
        })?;

    if !access_token.grants(
        request.credential_configuration_id,
        request.credential_identifier,
    ) {
        return Err(Error::validation(
            "the access token does not grant the requested credential",
        ));
    }

    let c_nonce = fetch_nonce(http, config).await?;

    let proof_count = match profile.proof_shape {
        ProofShape::Single => 1,
        ProofShape::Batch => config
            .batch_credential_issuance
            .map(|b| b.batch_size)
            .unwrap_or(1),
    };
    let issuer_identifier = config.issuer_identifier();
    let proofs: Vec<String> = try_join_all((0..proof_count).map(|_| {
        credential_nonce_proof(credential_key, &c_nonce, client_id, issuer_identifier)
    }))
    .await?;

    let body = match profile.proof_shape {
        ProofShape::Single => CredentialRequestBody {
            credential_configuration_id: request
                .credential_identifier
                .is_none()
                .then_some(request.credential_configuration_id),
            credential_identifier: request.credential_identifier,
            proof: Some(ProofObject {
                proof_type: "jwt",
                jwt: &proofs[0],
            }),
            proofs: None,
        },
        ProofShape::Batch => CredentialRequestBody {
            credential_configuration_id: request
                .credential_identifier
                .is_none()
                .then_some(request.credential_configuration_id),
            credential_identifier: request.credential_identifier,
            proof: None,
            proofs: Some(ProofList { jwt: &proofs }),
        },
    };

    let dpop = dpop_proof(
        dpop_key,
        HttpMethod::Post,
        &config.credential_endpoint,
        &Uuid::new_v4().to_string(),
        Some(&access_token_hash(&access_token.access_token)),
    )
    .await?;

    let (builder, bytes) = json_post_request(&config.credential_endpoint, &body)
        .map_err(|e| Error::validation_with("unable to encode credential request", e))?;
    let http_request = builder
        .header("DPoP", &dpop)
        .header(
            http::header::AUTHORIZATION,
            format!("{} {}", access_token.token_type, access_token.access_token),
        )
        .body(bytes)
        .map_err(|e| Error::validation_with("unable to build credential request", e))?;

    debug!(endpoint = %config.credential_endpoint, proofs = proof_count, "requesting credential");
    let (status, response_body) = send(http, http_request)
        .await
        .map_err(|e| CREDENTIAL_ENDPOINT_ERRORS.transport(format!("{e:#}")))?;

    if status == 201 {
        return Ok(CredentialRequestOutcome::Deferred);
    }
    if !(200..300).contains(&status) {
        return Err(CREDENTIAL_ENDPOINT_ERRORS.error(status, body_text(&response_body)));
    }

    let response: CredentialResponse = serde_json::from_slice(&response_body)
        .map_err(|e| Error::validation_with("credential response failed schema validation", e))?;

    Ok(CredentialRequestOutcome::Issued(IssuedCredential {
        credentials: response
            .credentials
            .into_iter()
            .map(|c| c.credential)
            .collect(),
        format: configuration.format.clone(),
        notification_id: response.notification_id,
    }))
}
