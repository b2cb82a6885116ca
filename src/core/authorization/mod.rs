//! User-authorization state machine.
//!
//! Drives the pushed authorization request, the interactive authorization
//! step and its completion, in one of two response modes. The interactive
//! step itself happens outside this crate; the caller opens the
//! authorization URL and hands back the redirect it observed.

pub mod mrtd;

use std::collections::BTreeMap;

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::core::crypto::{split_jws, verify_compact_jws, Es256Verifier, KeyBinding};
use crate::core::metadata::{AuthorizationDetailRequest, IssuerConfig, ResponseMode};
use crate::core::profile::ProtocolProfile;
use crate::core::proof::{par_request_object, wallet_attestation_pop, ParRequestParams, WalletAttestation};
use crate::core::util::{body_text, form_post_request, send, AsyncHttpClient};
use crate::error::{Error, AUTHORIZATION_ENDPOINT_ERRORS, PAR_ENDPOINT_ERRORS};

/// Stub request URI substituted when an issuer answers a PAR with a
/// pre-arranged `{code, state}` body instead of `{request_uri}`. Known
/// issuer non-conformance, tolerated narrowly.
pub const PREARRANGED_REQUEST_URI: &str = "urn:openid4vci:prearranged";

/// The grant produced by a completed user authorization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationGrant {
    pub code: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

#[derive(Deserialize)]
struct AuthorizationErrorShape {
    error: String,
    error_description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Init,
    ParSubmitted,
    AwaitingUserAuthorization,
    AuthorizationReceived,
    Failed,
    Cancelled,
}

/// Everything the caller needs between PAR submission and completion.
#[derive(Debug, Clone)]
pub struct PendingAuthorization {
    pub request_uri: String,
    pub expires_in: Option<u64>,
    pub response_mode: ResponseMode,
    pub state: String,
    pub code_verifier: String,
    /// Set only by the pre-arranged compatibility shim.
    pub early_grant: Option<AuthorizationGrant>,
}

/// Requests an MRTD document-scan proof alongside eID authentication.
#[derive(Debug, Clone)]
pub struct MrtdProofRequest {
    pub idp_hinting: String,
}

/// The issuer's signed request object in form_post.jwt mode, asking the
/// wallet to present an already-held credential.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestObject {
    pub iss: Option<String>,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub client_id: Option<String>,
    pub response_uri: Url,
    pub dcql_query: Json,
}

/// What the wallet must do next after fetching the request object.
#[derive(Debug)]
pub enum UserAuthorizationStep {
    /// Present an already-held credential matching the embedded query.
    PresentCredential(RequestObject),
    /// Run the MRTD proof-of-possession sub-flow first.
    MrtdChallenge(mrtd::ChallengeInfo),
}

/// Selects and prepares the already-held credentials answering a request
/// object's disclosure query. Implemented by the presentation layer.
#[async_trait::async_trait]
pub trait CredentialPresenter: Send + Sync {
    /// Returns `credential id → vp_token` for every matched credential.
    async fn present(&self, request: &RequestObject) -> anyhow::Result<BTreeMap<String, String>>;
}

#[derive(Deserialize)]
struct ParResponse {
    request_uri: String,
    expires_in: Option<u64>,
}

#[derive(Deserialize)]
struct PrearrangedParResponse {
    code: String,
    state: String,
}

#[derive(Deserialize)]
struct ResponseUriResult {
    redirect_uri: Url,
}

fn pkce_verifier() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(64)
        .map(char::from)
        .collect()
}

/// Parse `{code, state, iss?}` out of an authorization response, in
/// whatever carrier it arrived (redirect query or form-post JWT payload).
fn parse_authorization_response(value: &Json) -> Result<AuthorizationGrant, Error> {
    match serde_json::from_value::<AuthorizationGrant>(value.clone()) {
        Ok(grant) => Ok(grant),
        Err(parse_error) => {
            if let Ok(err) = serde_json::from_value::<AuthorizationErrorShape>(value.clone()) {
                warn!(error = %err.error, "authorization denied by the identity provider");
                return Err(Error::AuthorizationIdp {
                    error: err.error,
                    error_description: err.error_description,
                });
            }
            Err(Error::authorization(format!(
                "unable to parse the authorization response: {parse_error}"
            )))
        }
    }
}

fn query_to_json(url: &Url) -> Json {
    Json::Object(
        url.query_pairs()
            .map(|(k, v)| (k.into_owned(), Json::String(v.into_owned())))
            .collect(),
    )
}

/// Pull the `response` JWT out of an auto-submitting form-post page.
fn jwt_from_form_post(html: &str) -> Result<String, Error> {
    let after_name = html
        .find(r#"name="response""#)
        .map(|i| &html[i..])
        .ok_or_else(|| Error::validation("form post carries no response field"))?;
    let value_start = after_name
        .find(r#"value=""#)
        .map(|i| i + r#"value=""#.len())
        .ok_or_else(|| Error::validation("form post response field has no value"))?;
    let value = &after_name[value_start..];
    let value_end = value
        .find('"')
        .ok_or_else(|| Error::validation("form post response value is unterminated"))?;
    let jwt: String = value[..value_end]
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if jwt.is_empty() {
        return Err(Error::validation("form post response value is empty"));
    }
    Ok(jwt)
}

/// Verify a JWT against the issuer's JWKS, matching its signing key by
/// `kid`, and return the payload.
pub(crate) fn verify_against_issuer_jwks(jwt: &str, config: &IssuerConfig) -> Result<Json, Error> {
    let (header, _, _) = split_jws(jwt)?;
    let header: Json = crate::core::crypto::decode_part(header)?;
    let kid = header["kid"]
        .as_str()
        .ok_or_else(|| Error::validation("issuer JWT has no kid header"))?;
    let jwk = config
        .jwks
        .find(kid)
        .ok_or_else(|| Error::integrity(format!("no issuer key matches kid {kid}")))?;
    let verifier = Es256Verifier::from_jwk(jwk)
        .map_err(|e| Error::validation_with("issuer key is not usable", format!("{e:#}")))?;
    verify_compact_jws(jwt, &verifier)
}

/// One user-authorization flow against a single issuer.
///
/// Holds no shared mutable state; independent flows may run in parallel.
pub struct AuthorizationFlow<'a, H: ?Sized, K: ?Sized> {
    http: &'a H,
    config: &'a IssuerConfig,
    profile: &'a ProtocolProfile,
    attestation_key: &'a K,
    attestation: &'a WalletAttestation,
    redirect_uri: &'a Url,
    state: FlowState,
    pending: Option<PendingAuthorization>,
}

impl<'a, H, K> AuthorizationFlow<'a, H, K>
where
    H: AsyncHttpClient + ?Sized,
    K: KeyBinding + ?Sized,
{
    pub fn new(
        http: &'a H,
        config: &'a IssuerConfig,
        profile: &'a ProtocolProfile,
        attestation_key: &'a K,
        attestation: &'a WalletAttestation,
        redirect_uri: &'a Url,
    ) -> Self {
        Self {
            http,
            config,
            profile,
            attestation_key,
            attestation,
            redirect_uri,
            state: FlowState::Init,
            pending: None,
        }
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    /// Abandon the flow. No compensating network action is taken; a
    /// submitted PAR simply expires at the issuer.
    pub fn cancel(&mut self) {
        self.state = FlowState::Cancelled;
    }

    fn expect_state(&self, expected: FlowState) -> Result<(), Error> {
        if self.state != expected {
            return Err(Error::authorization(format!(
                "flow is in state {:?}, expected {expected:?}",
                self.state
            )));
        }
        Ok(())
    }

    fn fail(&mut self, error: Error) -> Error {
        self.state = FlowState::Failed;
        error
    }

    fn pending(&self) -> Result<&PendingAuthorization, Error> {
        self.pending
            .as_ref()
            .ok_or_else(|| Error::authorization("no pushed authorization request is pending"))
    }

    /// Select the response mode for a set of requested configurations.
    /// Person-identification credentials complete over a plain redirect
    /// query; everything else uses form_post.jwt.
    fn select_response_mode(&self, credential_configuration_ids: &[&str]) -> Result<ResponseMode, Error> {
        let mode = if credential_configuration_ids
            .iter()
            .any(|id| id.contains("PersonIdentificationData"))
        {
            ResponseMode::Query
        } else {
            ResponseMode::FormPostJwt
        };
        if !self.config.response_modes_supported.contains(&mode) {
            return Err(Error::validation(format!(
                "issuer does not support the {} response mode",
                mode.as_str()
            )));
        }
        Ok(mode)
    }

    /// Push the authorization request and return what the caller needs to
    /// run the interactive step.
    pub async fn start_user_authorization(
        &mut self,
        credential_configuration_ids: &[&str],
        mrtd: Option<&MrtdProofRequest>,
    ) -> Result<PendingAuthorization, Error> {
        self.expect_state(FlowState::Init)?;
        match self.submit_par(credential_configuration_ids, mrtd).await {
            Ok(pending) => {
                self.state = if pending.early_grant.is_some() {
                    FlowState::AuthorizationReceived
                } else {
                    FlowState::AwaitingUserAuthorization
                };
                Ok(self.pending.insert(pending).clone())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn submit_par(
        &self,
        credential_configuration_ids: &[&str],
        mrtd: Option<&MrtdProofRequest>,
    ) -> Result<PendingAuthorization, Error> {
        for id in credential_configuration_ids {
            if !self.config.credential_configurations_supported.contains_key(*id) {
                return Err(Error::validation(format!(
                    "unknown credential configuration: {id}"
                )));
            }
        }
        let response_mode = self.select_response_mode(credential_configuration_ids)?;

        let code_verifier = pkce_verifier();
        let state = Uuid::new_v4().to_string();

        let mut authorization_details: Vec<AuthorizationDetailRequest> =
            credential_configuration_ids
                .iter()
                .map(|id| AuthorizationDetailRequest::OpenIdCredential {
                    credential_configuration_id: (*id).to_owned(),
                })
                .collect();
        if let Some(mrtd) = mrtd {
            authorization_details.push(AuthorizationDetailRequest::DocumentProof {
                idphinting: mrtd.idp_hinting.clone(),
                challenge_method: "mrtd+ias".to_owned(),
                challenge_redirect_uri: self.redirect_uri.clone(),
            });
        }

        let audience = self.profile.par_audience_value(
            &self.config.pushed_authorization_request_endpoint,
            &self.config.credential_issuer,
        );
        let request_object = par_request_object(
            self.attestation_key,
            ParRequestParams {
                audience: &audience,
                client_id: &self.attestation.cnf_kid,
                state: &state,
                code_verifier: &code_verifier,
                redirect_uri: self.redirect_uri,
                response_mode: response_mode.as_str(),
                authorization_details: &authorization_details,
            },
        )
        .await?;
        let pop = wallet_attestation_pop(
            self.attestation_key,
            &Uuid::new_v4().to_string(),
            &audience,
            &self.attestation.cnf_kid,
        )
        .await?;

        let mut form: Vec<(&'static str, String)> = vec![
            ("client_id", self.attestation.cnf_kid.clone()),
            ("request", request_object),
        ];
        let mut builder = crate::core::util::base_request()
            .method("POST")
            .uri(self.config.pushed_authorization_request_endpoint.as_str())
            .header(
                http::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            );
        builder = self
            .profile
            .attach_attestation(builder, &mut form, &self.attestation.raw, &pop);
        let body = serde_urlencoded::to_string(&form)
            .map_err(|e| Error::validation_with("unable to encode PAR body", e))?;
        let request = builder
            .body(body.into_bytes())
            .map_err(|e| Error::validation_with("unable to build PAR request", e))?;

        debug!(
            endpoint = %self.config.pushed_authorization_request_endpoint,
            response_mode = response_mode.as_str(),
            "pushing authorization request"
        );
        let (status, body) = send(self.http, request)
            .await
            .map_err(|e| PAR_ENDPOINT_ERRORS.transport(format!("{e:#}")))?;
        if !(200..300).contains(&status) {
            return Err(PAR_ENDPOINT_ERRORS.error(status, body_text(&body)));
        }

        if let Ok(response) = serde_json::from_slice::<ParResponse>(&body) {
            return Ok(PendingAuthorization {
                request_uri: response.request_uri,
                expires_in: response.expires_in,
                response_mode,
                state,
                code_verifier,
                early_grant: None,
            });
        }
        // Pre-arranged grant shim, see PREARRANGED_REQUEST_URI.
        if let Ok(prearranged) = serde_json::from_slice::<PrearrangedParResponse>(&body) {
            warn!("PAR endpoint answered with a pre-arranged grant");
            return Ok(PendingAuthorization {
                request_uri: PREARRANGED_REQUEST_URI.to_owned(),
                expires_in: None,
                response_mode,
                state,
                code_verifier,
                early_grant: Some(AuthorizationGrant {
                    code: prearranged.code,
                    state: prearranged.state,
                    iss: None,
                }),
            });
        }
        Err(Error::validation("PAR response failed schema validation"))
    }

    /// `GET {authorization_endpoint}?{client_id, request_uri[, idphint]}`,
    /// to be opened in the user's agent.
    pub fn authorization_url(&self, idp_hint: Option<&str>) -> Result<Url, Error> {
        let pending = self.pending()?;
        let mut url = self.config.authorization_endpoint.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &self.attestation.cnf_kid)
            .append_pair("request_uri", &pending.request_uri);
        if let Some(hint) = idp_hint {
            url.query_pairs_mut().append_pair("idphint", hint);
        }
        Ok(url)
    }

    /// Complete a query-mode authorization from the redirect URL the
    /// caller's interactive step observed.
    pub fn complete_with_redirect(&mut self, redirect_url: &Url) -> Result<AuthorizationGrant, Error> {
        let result = (|| {
            if let Some(grant) = self.pending()?.early_grant.clone() {
                return Ok(grant);
            }
            self.expect_state(FlowState::AwaitingUserAuthorization)?;
            parse_authorization_response(&query_to_json(redirect_url))
        })();
        match result {
            Ok(grant) => {
                self.state = FlowState::AuthorizationReceived;
                Ok(grant)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// form_post.jwt mode: fetch and verify the issuer's request object and
    /// decide the next step.
    pub async fn fetch_request_object(&mut self) -> Result<UserAuthorizationStep, Error> {
        self.expect_state(FlowState::AwaitingUserAuthorization)?;
        match self.fetch_request_object_inner().await {
            Ok(step) => Ok(step),
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn fetch_request_object_inner(&self) -> Result<UserAuthorizationStep, Error> {
        let url = self.authorization_url(None)?;
        let request = crate::core::util::base_request()
            .method("GET")
            .uri(url.as_str())
            .body(Vec::new())
            .map_err(|e| Error::validation_with("unable to build authorization request", e))?;
        debug!(endpoint = %url, "fetching request object");
        let (status, body) = send(self.http, request)
            .await
            .map_err(|e| AUTHORIZATION_ENDPOINT_ERRORS.transport(format!("{e:#}")))?;
        if !(200..300).contains(&status) {
            return Err(AUTHORIZATION_ENDPOINT_ERRORS.error(status, body_text(&body)));
        }

        let jwt = String::from_utf8(body)
            .map_err(|e| Error::validation_with("request object is not text", e))?;
        let jwt = jwt.trim();
        let payload = verify_against_issuer_jwks(jwt, self.config)?;

        if payload.get("mrtd_auth_session").is_some() {
            let info = mrtd::ChallengeInfo::from_payload(payload, &self.attestation.cnf_kid)?;
            return Ok(UserAuthorizationStep::MrtdChallenge(info));
        }
        let request_object: RequestObject = serde_json::from_value(payload)
            .map_err(|e| Error::validation_with("request object failed schema validation", e))?;
        Ok(UserAuthorizationStep::PresentCredential(request_object))
    }

    /// Answer a request object by presenting an already-held credential,
    /// then follow the issuer's redirect back into a grant.
    pub async fn complete_with_presentation(
        &mut self,
        request_object: &RequestObject,
        presenter: &(dyn CredentialPresenter + '_),
    ) -> Result<AuthorizationGrant, Error> {
        self.expect_state(FlowState::AwaitingUserAuthorization)?;
        match self.complete_with_presentation_inner(request_object, presenter).await {
            Ok(grant) => {
                self.state = FlowState::AuthorizationReceived;
                Ok(grant)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn complete_with_presentation_inner(
        &self,
        request_object: &RequestObject,
        presenter: &(dyn CredentialPresenter + '_),
    ) -> Result<AuthorizationGrant, Error> {
        let vp_token = presenter
            .present(request_object)
            .await
            .map_err(|e| Error::authorization(format!("credential presentation failed: {e:#}")))?;

        let response_jwt = self.signed_authorization_response(request_object, &vp_token).await?;
        let (builder, bytes) = form_post_request(
            &request_object.response_uri,
            &[("response", response_jwt.as_str())],
        )
        .map_err(|e| Error::validation_with("unable to encode authorization response", e))?;
        let request = builder
            .body(bytes)
            .map_err(|e| Error::validation_with("unable to build authorization response", e))?;
        debug!(endpoint = %request_object.response_uri, "posting authorization response");
        let (status, body) = send(self.http, request)
            .await
            .map_err(|e| AUTHORIZATION_ENDPOINT_ERRORS.transport(format!("{e:#}")))?;
        if !(200..300).contains(&status) {
            return Err(AUTHORIZATION_ENDPOINT_ERRORS.error(status, body_text(&body)));
        }
        let result: ResponseUriResult = serde_json::from_slice(&body)
            .map_err(|e| Error::validation_with("response_uri result failed schema validation", e))?;

        // The redirect lands on a form-post page carrying the final signed
        // authorization response.
        let follow = crate::core::util::base_request()
            .method("GET")
            .uri(result.redirect_uri.as_str())
            .body(Vec::new())
            .map_err(|e| Error::validation_with("unable to build redirect request", e))?;
        let (status, body) = send(self.http, follow)
            .await
            .map_err(|e| AUTHORIZATION_ENDPOINT_ERRORS.transport(format!("{e:#}")))?;
        if !(200..300).contains(&status) {
            return Err(AUTHORIZATION_ENDPOINT_ERRORS.error(status, body_text(&body)));
        }
        let jwt = jwt_from_form_post(&body_text(&body))?;
        let payload = verify_against_issuer_jwks(&jwt, self.config)?;
        parse_authorization_response(&payload)
    }

    async fn signed_authorization_response(
        &self,
        request_object: &RequestObject,
        vp_token: &BTreeMap<String, String>,
    ) -> Result<String, Error> {
        #[derive(Serialize)]
        struct ResponseHeader<'h> {
            alg: &'static str,
            typ: &'static str,
            kid: &'h str,
        }

        #[derive(Serialize)]
        struct ResponsePayload<'p> {
            #[serde(skip_serializing_if = "Option::is_none")]
            state: Option<&'p str>,
            vp_token: &'p BTreeMap<String, String>,
            iat: i64,
            exp: i64,
        }

        let thumbprint = self
            .attestation_key
            .public_jwk()
            .map_err(Error::signing)?
            .thumbprint();
        let iat = Utc::now().timestamp();
        crate::core::proof::sign_compact(
            self.attestation_key,
            &ResponseHeader {
                alg: "ES256",
                typ: "jwt",
                kid: &thumbprint,
            },
            &ResponsePayload {
                state: request_object.state.as_deref(),
                vp_token,
                iat,
                exp: iat + 3600,
            },
        )
        .await
    }
}
