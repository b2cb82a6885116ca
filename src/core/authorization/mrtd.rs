//! MRTD proof-of-possession sub-flow.
//!
//! Some person-identification issuances require proof that the user holds
//! their physical identity document: the issuer hands out a challenge, the
//! wallet answers with data read from the document's chip (MRTD) plus the
//! chip's internal authentication (IAS), and the issuer verifies both
//! before user authorization continues. Every issuer step here answers
//! with HTTP 202 on success.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::core::crypto::KeyBinding;
use crate::core::metadata::IssuerConfig;
use crate::core::proof::{sign_compact, wallet_attestation_pop, WalletAttestation};
use crate::core::util::{body_text, json_post_request, send, AsyncHttpClient};
use crate::error::{Error, MRTD_ENDPOINT_ERRORS};

const VALIDATION_JWT_LIFETIME_SECS: i64 = 300;

/// The issuer's challenge-info JWT payload, after signature, audience and
/// time-window checks.
#[derive(Debug, Clone)]
pub struct ChallengeInfo {
    pub mrtd_auth_session: String,
    pub mrtd_pop_jwt_nonce: String,
    /// Where to initialize the challenge (`htu` claim).
    pub challenge_init_url: Url,
    pub state: Option<String>,
}

#[derive(Deserialize)]
struct ChallengeInfoWire {
    aud: String,
    iat: i64,
    exp: i64,
    mrtd_auth_session: String,
    mrtd_pop_jwt_nonce: String,
    htu: Url,
    state: Option<String>,
}

impl ChallengeInfo {
    /// Validate an already signature-checked challenge-info payload.
    pub(crate) fn from_payload(payload: Json, client_id: &str) -> Result<Self, Error> {
        let wire: ChallengeInfoWire = serde_json::from_value(payload)
            .map_err(|e| Error::validation_with("malformed challenge info", e))?;
        if wire.aud != client_id {
            return Err(Error::validation(
                "challenge info aud claim does not match client_id",
            ));
        }
        let now = Utc::now().timestamp();
        if wire.iat > now || wire.exp < now {
            return Err(Error::validation(
                "challenge info is issued in the future or expired",
            ));
        }
        Ok(Self {
            mrtd_auth_session: wire.mrtd_auth_session,
            mrtd_pop_jwt_nonce: wire.mrtd_pop_jwt_nonce,
            challenge_init_url: wire.htu,
            state: wire.state,
        })
    }
}

/// Verify a challenge-info JWT against the issuer JWKS and validate its
/// claims.
pub fn verify_and_parse_challenge_info(
    jwt: &str,
    config: &IssuerConfig,
    client_id: &str,
) -> Result<ChallengeInfo, Error> {
    let payload = super::verify_against_issuer_jwks(jwt, config)?;
    ChallengeInfo::from_payload(payload, client_id)
}

/// The challenge to answer with data read from the document chip.
#[derive(Debug, Clone, Deserialize)]
pub struct Challenge {
    pub challenge: String,
    pub mrtd_pop_nonce: String,
    /// Where to submit the validation (`htu` claim).
    pub htu: Url,
    pub mrz: Option<String>,
}

/// Outcome of a verified challenge, feeding the callback URL.
#[derive(Debug, Clone, Deserialize)]
pub struct VerificationResult {
    pub mrtd_val_pop_nonce: String,
    pub redirect_uri: Url,
}

async fn attested_json_post<H, K, T>(
    http: &H,
    config: &IssuerConfig,
    attestation_key: &K,
    attestation: &WalletAttestation,
    url: &Url,
    body: &T,
) -> Result<Vec<u8>, Error>
where
    H: AsyncHttpClient + ?Sized,
    K: KeyBinding + ?Sized,
    T: Serialize,
{
    let pop = wallet_attestation_pop(
        attestation_key,
        &Uuid::new_v4().to_string(),
        config.issuer_identifier(),
        &attestation.cnf_kid,
    )
    .await?;
    let (builder, bytes) = json_post_request(url, body)
        .map_err(|e| Error::validation_with("unable to encode challenge request", e))?;
    let request = builder
        .header("OAuth-Client-Attestation", &attestation.raw)
        .header("OAuth-Client-Attestation-PoP", &pop)
        .body(bytes)
        .map_err(|e| Error::validation_with("unable to build challenge request", e))?;

    debug!(endpoint = %url, "posting MRTD challenge request");
    let (status, body) = send(http, request)
        .await
        .map_err(|e| MRTD_ENDPOINT_ERRORS.transport(format!("{e:#}")))?;
    if status != 202 {
        return Err(MRTD_ENDPOINT_ERRORS.error(status, body_text(&body)));
    }
    Ok(body)
}

#[derive(Serialize)]
struct InitChallengeBody<'a> {
    mrtd_auth_session: &'a str,
    mrtd_pop_jwt_nonce: &'a str,
}

/// Initialize the challenge. The issuer answers 202 with a challenge JWT
/// whose payload carries the material to read from the document.
pub async fn init_challenge<H, K>(
    http: &H,
    config: &IssuerConfig,
    attestation_key: &K,
    attestation: &WalletAttestation,
    info: &ChallengeInfo,
) -> Result<Challenge, Error>
where
    H: AsyncHttpClient + ?Sized,
    K: KeyBinding + ?Sized,
{
    let body = attested_json_post(
        http,
        config,
        attestation_key,
        attestation,
        &info.challenge_init_url,
        &InitChallengeBody {
            mrtd_auth_session: &info.mrtd_auth_session,
            mrtd_pop_jwt_nonce: &info.mrtd_pop_jwt_nonce,
        },
    )
    .await?;

    let jwt = String::from_utf8(body)
        .map_err(|e| Error::validation_with("challenge response is not text", e))?;
    let (_, payload) = crate::core::proof::decode_unverified(jwt.trim())?;
    serde_json::from_value(payload)
        .map_err(|e| Error::validation_with("malformed challenge payload", e))
}

#[derive(Serialize)]
struct ValidationHeader<'a> {
    alg: &'static str,
    typ: &'static str,
    kid: &'a str,
}

#[derive(Serialize)]
struct ValidationPayload<'a> {
    iss: &'a str,
    aud: &'a str,
    document_type: &'a str,
    mrtd: &'a Json,
    ias: &'a Json,
    iat: i64,
    exp: i64,
}

#[derive(Serialize)]
struct ValidateChallengeBody<'a> {
    mrtd_validation_jwt: &'a str,
    mrtd_auth_session: &'a str,
    mrtd_pop_nonce: &'a str,
}

/// What the wallet read from the physical document.
#[derive(Debug, Clone)]
pub struct DocumentScan {
    pub document_type: String,
    pub mrtd: Json,
    pub ias: Json,
}

/// Submit the scanned-document payload for validation. The scan travels
/// inside an `mrtd-ias+jwt` signed with the wallet attestation key.
pub async fn validate_challenge<H, K>(
    http: &H,
    config: &IssuerConfig,
    attestation_key: &K,
    attestation: &WalletAttestation,
    info: &ChallengeInfo,
    challenge: &Challenge,
    scan: &DocumentScan,
) -> Result<VerificationResult, Error>
where
    H: AsyncHttpClient + ?Sized,
    K: KeyBinding + ?Sized,
{
    let thumbprint = attestation_key
        .public_jwk()
        .map_err(Error::signing)?
        .thumbprint();
    let iat = Utc::now().timestamp();
    let validation_jwt = sign_compact(
        attestation_key,
        &ValidationHeader {
            alg: "ES256",
            typ: "mrtd-ias+jwt",
            kid: &thumbprint,
        },
        &ValidationPayload {
            iss: &attestation.cnf_kid,
            aud: config.issuer_identifier(),
            document_type: &scan.document_type,
            mrtd: &scan.mrtd,
            ias: &scan.ias,
            iat,
            exp: iat + VALIDATION_JWT_LIFETIME_SECS,
        },
    )
    .await?;

    let body = attested_json_post(
        http,
        config,
        attestation_key,
        attestation,
        &challenge.htu,
        &ValidateChallengeBody {
            mrtd_validation_jwt: &validation_jwt,
            mrtd_auth_session: &info.mrtd_auth_session,
            mrtd_pop_nonce: &challenge.mrtd_pop_nonce,
        },
    )
    .await?;

    serde_json::from_slice(&body)
        .map_err(|e| Error::validation_with("malformed challenge verification result", e))
}

/// Where to send the user agent once the challenge is verified.
pub fn challenge_callback_url(result: &VerificationResult, info: &ChallengeInfo) -> Url {
    let mut url = result.redirect_uri.clone();
    url.query_pairs_mut()
        .append_pair("mrtd_val_pop_nonce", &result.mrtd_val_pop_nonce)
        .append_pair("mrtd_auth_session", &info.mrtd_auth_session);
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::credential::tests::{issuer_config, ScriptedClient};
    use crate::core::proof::tests::TestKey;
    use base64::prelude::*;
    use serde_json::json;

    fn challenge_info_payload(aud: &str, iat: i64, exp: i64) -> Json {
        json!({
            "iss": "https://issuer.example.org",
            "aud": aud,
            "iat": iat,
            "exp": exp,
            "status": "require_interaction",
            "type": "mrtd+ias",
            "mrtd_auth_session": "session-1",
            "state": "state-1",
            "mrtd_pop_jwt_nonce": "nonce-1",
            "htu": "https://issuer.example.org/mrtd/init",
            "htm": "POST",
        })
    }

    #[test]
    fn challenge_info_checks_audience_and_window() {
        let now = Utc::now().timestamp();

        let info =
            ChallengeInfo::from_payload(challenge_info_payload("client-1", now - 10, now + 60), "client-1")
                .unwrap();
        assert_eq!(info.mrtd_auth_session, "session-1");
        assert_eq!(
            info.challenge_init_url.as_str(),
            "https://issuer.example.org/mrtd/init"
        );

        let wrong_aud =
            ChallengeInfo::from_payload(challenge_info_payload("other", now - 10, now + 60), "client-1");
        assert!(matches!(wrong_aud, Err(Error::ValidationFailed { .. })));

        let expired =
            ChallengeInfo::from_payload(challenge_info_payload("client-1", now - 120, now - 60), "client-1");
        assert!(matches!(expired, Err(Error::ValidationFailed { .. })));
    }

    fn attestation_for(key: &TestKey) -> WalletAttestation {
        let mut jwk = key.public_jwk().unwrap();
        jwk.kid = Some(jwk.thumbprint());
        let header = BASE64_URL_SAFE_NO_PAD.encode(br#"{"alg":"ES256"}"#);
        let payload =
            BASE64_URL_SAFE_NO_PAD.encode(json!({"cnf": {"jwk": jwk}}).to_string().as_bytes());
        WalletAttestation::decode(format!("{header}.{payload}.sig")).unwrap()
    }

    fn info() -> ChallengeInfo {
        ChallengeInfo {
            mrtd_auth_session: "session-1".into(),
            mrtd_pop_jwt_nonce: "nonce-1".into(),
            challenge_init_url: "https://issuer.example.org/mrtd/init".parse().unwrap(),
            state: None,
        }
    }

    fn challenge_jwt() -> String {
        let header = BASE64_URL_SAFE_NO_PAD.encode(br#"{"alg":"ES256","typ":"mrtd-ias-pop+jwt"}"#);
        let payload = BASE64_URL_SAFE_NO_PAD.encode(
            json!({
                "challenge": "the-challenge",
                "mrtd_pop_nonce": "pop-nonce",
                "htu": "https://issuer.example.org/mrtd/verify",
                "htm": "POST",
            })
            .to_string()
            .as_bytes(),
        );
        format!("{header}.{payload}.c2ln")
    }

    #[tokio::test]
    async fn init_challenge_expects_202_with_jwt_body() {
        let client = ScriptedClient::new(vec![]);
        client
            .push_text_response(202, challenge_jwt());
        let key = TestKey::generate();
        let attestation = attestation_for(&key);
        let config = issuer_config(None);

        let challenge = init_challenge(&client, &config, &key, &attestation, &info())
            .await
            .unwrap();
        assert_eq!(challenge.challenge, "the-challenge");
        assert_eq!(challenge.mrtd_pop_nonce, "pop-nonce");

        let requests = client.requests.lock().unwrap();
        assert!(requests[0].headers().contains_key("OAuth-Client-Attestation"));
        assert!(requests[0].headers().contains_key("OAuth-Client-Attestation-PoP"));
        let body: Json = serde_json::from_slice(requests[0].body()).unwrap();
        assert_eq!(body["mrtd_auth_session"], "session-1");
        assert_eq!(body["mrtd_pop_jwt_nonce"], "nonce-1");
    }

    #[tokio::test]
    async fn non_202_maps_to_mrtd_challenge_failed() {
        use crate::error::IssuerResponseCode;

        let client = ScriptedClient::new(vec![(400, json!({"error": "bad_request"}))]);
        let key = TestKey::generate();
        let attestation = attestation_for(&key);
        let config = issuer_config(None);

        let err = init_challenge(&client, &config, &key, &attestation, &info())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::IssuerResponse {
                code: IssuerResponseCode::MrtdChallengeFailed,
                status: Some(400),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn validate_challenge_signs_scan_and_parses_result() {
        let client = ScriptedClient::new(vec![(
            202,
            json!({
                "mrtd_val_pop_nonce": "val-nonce",
                "redirect_uri": "https://issuer.example.org/continue",
            }),
        )]);
        let key = TestKey::generate();
        let attestation = attestation_for(&key);
        let config = issuer_config(None);
        let challenge = Challenge {
            challenge: "the-challenge".into(),
            mrtd_pop_nonce: "pop-nonce".into(),
            htu: "https://issuer.example.org/mrtd/verify".parse().unwrap(),
            mrz: None,
        };
        let scan = DocumentScan {
            document_type: "cie".into(),
            mrtd: json!({"dg1": "base64"}),
            ias: json!({"signature": "base64"}),
        };

        let result = validate_challenge(&client, &config, &key, &attestation, &info(), &challenge, &scan)
            .await
            .unwrap();
        assert_eq!(result.mrtd_val_pop_nonce, "val-nonce");

        let requests = client.requests.lock().unwrap();
        let body: Json = serde_json::from_slice(requests[0].body()).unwrap();
        assert_eq!(body["mrtd_pop_nonce"], "pop-nonce");
        let validation_jwt = body["mrtd_validation_jwt"].as_str().unwrap();
        let (header, payload) = crate::core::proof::decode_unverified(validation_jwt).unwrap();
        assert_eq!(header["typ"], "mrtd-ias+jwt");
        assert_eq!(payload["document_type"], "cie");
        assert_eq!(payload["mrtd"]["dg1"], "base64");

        let callback = challenge_callback_url(&result, &info());
        assert_eq!(
            callback.as_str(),
            "https://issuer.example.org/continue?mrtd_val_pop_nonce=val-nonce&mrtd_auth_session=session-1"
        );
    }
}
