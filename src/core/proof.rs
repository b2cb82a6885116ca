//! Proof-of-possession token builders.
//!
//! Each builder fetches the public key once, stamps `iat = now`, signs the
//! JWS input through the [`KeyBinding`] capability and returns a compact
//! JWS. A capability rejection surfaces as [`Error::SigningFailed`] and is
//! never retried.

use base64::prelude::*;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use sha2::{Digest, Sha256};
use url::Url;
use uuid::Uuid;

use crate::core::crypto::{decode_part, encode_part, split_jws, EphemeralKeys, Jwk, KeyBinding};
use crate::core::metadata::AuthorizationDetailRequest;
use crate::error::Error;

const DPOP_LIFETIME_SECS: i64 = 3600;
const POP_LIFETIME_SECS: i64 = 300;
const NONCE_PROOF_LIFETIME_SECS: i64 = 300;
const PAR_REQUEST_LIFETIME_SECS: i64 = 3600;

pub(crate) async fn sign_compact<K, H, P>(key: &K, header: &H, payload: &P) -> Result<String, Error>
where
    K: KeyBinding + ?Sized,
    H: Serialize,
    P: Serialize,
{
    let signing_input = format!("{}.{}", encode_part(header)?, encode_part(payload)?);
    let signature = key
        .sign(signing_input.as_bytes())
        .await
        .map_err(Error::signing)?;
    Ok(format!(
        "{signing_input}.{}",
        BASE64_URL_SAFE_NO_PAD.encode(signature)
    ))
}

/// base64url(SHA-256(access_token)), the `ath` claim of a resource-bound
/// DPoP proof.
pub(crate) fn access_token_hash(access_token: &str) -> String {
    BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(access_token.as_bytes()))
}

/// SHA-256 PKCE challenge for a code verifier.
pub(crate) fn code_challenge(code_verifier: &str) -> String {
    BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(code_verifier.as_bytes()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HttpMethod {
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "POST")]
    Post,
}

#[derive(Serialize)]
struct DpopHeader<'a> {
    alg: &'static str,
    typ: &'static str,
    jwk: &'a Jwk,
}

#[derive(Serialize)]
struct DpopPayload<'a> {
    jti: &'a str,
    htm: HttpMethod,
    htu: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    ath: Option<&'a str>,
    iat: i64,
    exp: i64,
}

/// Build a DPoP proof (RFC 9449) bound to `htm {htu}`.
///
/// `ath` binds the proof to an access token for resource requests.
pub async fn dpop_proof<K: KeyBinding + ?Sized>(
    key: &K,
    htm: HttpMethod,
    htu: &Url,
    jti: &str,
    ath: Option<&str>,
) -> Result<String, Error> {
    let jwk = key.public_jwk().map_err(Error::signing)?;
    let iat = Utc::now().timestamp();
    let header = DpopHeader {
        alg: "ES256",
        typ: "dpop+jwt",
        jwk: &jwk,
    };
    let payload = DpopPayload {
        jti,
        htm,
        htu: htu.as_str(),
        ath,
        iat,
        exp: iat + DPOP_LIFETIME_SECS,
    };
    sign_compact(key, &header, &payload).await
}

/// [`dpop_proof`] over a single-use key that is deleted before returning,
/// success or failure.
pub async fn dpop_proof_ephemeral<E: EphemeralKeys>(
    keys: &E,
    htm: HttpMethod,
    htu: &Url,
    jti: &str,
    ath: Option<&str>,
) -> Result<String, Error> {
    let key = keys.generate().await.map_err(Error::signing)?;
    let result = dpop_proof(&key, htm, htu, jti, ath).await;
    let deleted = keys.delete(&key).await;
    let token = result?;
    deleted.map_err(Error::signing)?;
    Ok(token)
}

#[derive(Serialize)]
struct PopHeader<'a> {
    alg: &'static str,
    typ: &'static str,
    kid: &'a str,
}

#[derive(Serialize)]
struct PopPayload<'a> {
    jti: &'a str,
    aud: &'a str,
    iss: &'a str,
    iat: i64,
    exp: i64,
}

/// Proof-of-possession over the wallet attestation key. `kid` is the
/// attestation key's RFC 7638 thumbprint so the verifier can match it
/// inside the attestation's key set.
pub async fn wallet_attestation_pop<K: KeyBinding + ?Sized>(
    key: &K,
    jti: &str,
    aud: &str,
    iss: &str,
) -> Result<String, Error> {
    let thumbprint = key.public_jwk().map_err(Error::signing)?.thumbprint();
    let iat = Utc::now().timestamp();
    let header = PopHeader {
        alg: "ES256",
        typ: "jwt-client-attestation-pop",
        kid: &thumbprint,
    };
    let payload = PopPayload {
        jti,
        aud,
        iss,
        iat,
        exp: iat + POP_LIFETIME_SECS,
    };
    sign_compact(key, &header, &payload).await
}

#[derive(Serialize)]
struct NonceProofHeader<'a> {
    alg: &'static str,
    typ: &'static str,
    jwk: &'a Jwk,
}

#[derive(Serialize)]
struct NonceProofPayload<'a> {
    nonce: &'a str,
    iss: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

/// Key-possession proof over an issuer-supplied `c_nonce`, bound to the
/// future credential key.
pub async fn credential_nonce_proof<K: KeyBinding + ?Sized>(
    key: &K,
    nonce: &str,
    issuer: &str,
    audience: &str,
) -> Result<String, Error> {
    let jwk = key.public_jwk().map_err(Error::signing)?;
    let iat = Utc::now().timestamp();
    let header = NonceProofHeader {
        alg: "ES256",
        typ: "openid4vci-proof+jwt",
        jwk: &jwk,
    };
    let payload = NonceProofPayload {
        nonce,
        iss: issuer,
        aud: audience,
        iat,
        exp: iat + NONCE_PROOF_LIFETIME_SECS,
    };
    sign_compact(key, &header, &payload).await
}

/// A wallet attestation in compact JWS form, decoded just far enough to
/// read the subject key id out of `cnf.jwk`.
#[derive(Debug, Clone)]
pub struct WalletAttestation {
    pub raw: String,
    /// `kid` of the attestation's confirmation key; doubles as the OAuth
    /// `client_id` / request-object `iss`.
    pub cnf_kid: String,
}

#[derive(Deserialize)]
struct AttestationPayload {
    cnf: AttestationCnf,
}

#[derive(Deserialize)]
struct AttestationCnf {
    jwk: Jwk,
}

impl WalletAttestation {
    pub fn decode(raw: String) -> Result<Self, Error> {
        let (_, payload, _) = split_jws(&raw)?;
        let payload: AttestationPayload = decode_part(payload)?;
        let cnf_kid = payload
            .cnf
            .jwk
            .kid
            .ok_or_else(|| Error::validation("wallet attestation cnf.jwk has no kid"))?;
        Ok(Self { raw, cnf_kid })
    }
}

#[derive(Serialize)]
struct ParRequestHeader<'a> {
    alg: &'static str,
    kid: &'a str,
}

#[derive(Serialize)]
struct ParRequestPayload<'a> {
    iss: &'a str,
    aud: &'a str,
    jti: String,
    response_type: &'static str,
    response_mode: &'a str,
    client_id: &'a str,
    state: &'a str,
    code_challenge: String,
    code_challenge_method: &'static str,
    redirect_uri: &'a str,
    authorization_details: &'a [AuthorizationDetailRequest],
    iat: i64,
    exp: i64,
}

pub struct ParRequestParams<'a> {
    pub audience: &'a str,
    pub client_id: &'a str,
    pub state: &'a str,
    pub code_verifier: &'a str,
    pub redirect_uri: &'a Url,
    pub response_mode: &'a str,
    pub authorization_details: &'a [AuthorizationDetailRequest],
}

/// Signed request object submitted through PAR. Signed with the wallet
/// attestation key; `kid` is its thumbprint.
pub async fn par_request_object<K: KeyBinding + ?Sized>(
    key: &K,
    params: ParRequestParams<'_>,
) -> Result<String, Error> {
    let thumbprint = key.public_jwk().map_err(Error::signing)?.thumbprint();
    let iat = Utc::now().timestamp();
    let header = ParRequestHeader {
        alg: "ES256",
        kid: &thumbprint,
    };
    let payload = ParRequestPayload {
        iss: params.client_id,
        aud: params.audience,
        jti: Uuid::new_v4().to_string(),
        response_type: "code",
        response_mode: params.response_mode,
        client_id: params.client_id,
        state: params.state,
        code_challenge: code_challenge(params.code_verifier),
        code_challenge_method: "S256",
        redirect_uri: params.redirect_uri.as_str(),
        authorization_details: params.authorization_details,
        iat,
        exp: iat + PAR_REQUEST_LIFETIME_SECS,
    };
    sign_compact(key, &header, &payload).await
}

/// Decode a compact JWS without verifying it, returning `(header, payload)`.
pub(crate) fn decode_unverified(jws: &str) -> Result<(Json, Json), Error> {
    let (header, payload, _) = split_jws(jws)?;
    Ok((decode_part(header)?, decode_part(payload)?))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::crypto::{Es256Verifier, JwsVerifier};
    use anyhow::Result;
    use async_trait::async_trait;
    use p256::ecdsa::signature::Signer as _;
    use p256::ecdsa::{Signature, SigningKey};

    pub(crate) struct TestKey(pub SigningKey);

    impl TestKey {
        pub(crate) fn generate() -> Self {
            Self(SigningKey::random(&mut rand::rngs::OsRng))
        }
    }

    #[async_trait]
    impl KeyBinding for TestKey {
        fn public_jwk(&self) -> Result<Jwk> {
            Ok(Jwk::from(self.0.verifying_key()))
        }

        async fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
            let signature: Signature = self.0.sign(data);
            Ok(signature.to_bytes().to_vec())
        }
    }

    #[tokio::test]
    async fn dpop_proof_embeds_key_and_binding() {
        let key = TestKey::generate();
        let htu: Url = "https://issuer.example.org/token".parse().unwrap();
        let jws = dpop_proof(&key, HttpMethod::Post, &htu, "jti-1", Some("ath-value"))
            .await
            .unwrap();

        let (header, payload) = decode_unverified(&jws).unwrap();
        assert_eq!(header["typ"], "dpop+jwt");
        assert_eq!(header["alg"], "ES256");
        assert_eq!(header["jwk"]["kty"], "EC");
        assert_eq!(payload["htm"], "POST");
        assert_eq!(payload["htu"], "https://issuer.example.org/token");
        assert_eq!(payload["ath"], "ath-value");
        assert_eq!(
            payload["exp"].as_i64().unwrap() - payload["iat"].as_i64().unwrap(),
            3600
        );

        // The embedded key verifies its own proof.
        let jwk: Jwk = serde_json::from_value(header["jwk"].clone()).unwrap();
        let verifier = Es256Verifier::from_jwk(&jwk).unwrap();
        let (h, p, s) = split_jws(&jws).unwrap();
        let sig = BASE64_URL_SAFE_NO_PAD.decode(s).unwrap();
        verifier
            .verify(format!("{h}.{p}").as_bytes(), &sig)
            .unwrap();
    }

    #[tokio::test]
    async fn attestation_pop_uses_thumbprint_kid() {
        let key = TestKey::generate();
        let jws = wallet_attestation_pop(&key, "jti-2", "https://issuer.example.org", "client-1")
            .await
            .unwrap();
        let (header, payload) = decode_unverified(&jws).unwrap();
        assert_eq!(header["typ"], "jwt-client-attestation-pop");
        assert_eq!(header["kid"], key.public_jwk().unwrap().thumbprint());
        assert_eq!(payload["aud"], "https://issuer.example.org");
        assert_eq!(payload["iss"], "client-1");
        assert_eq!(
            payload["exp"].as_i64().unwrap() - payload["iat"].as_i64().unwrap(),
            300
        );
    }

    #[tokio::test]
    async fn nonce_proof_carries_nonce_between_parties() {
        let key = TestKey::generate();
        let jws = credential_nonce_proof(&key, "issuer-nonce", "client-1", "https://issuer.example.org")
            .await
            .unwrap();
        let (header, payload) = decode_unverified(&jws).unwrap();
        assert_eq!(header["typ"], "openid4vci-proof+jwt");
        assert!(header["jwk"].is_object());
        assert_eq!(payload["nonce"], "issuer-nonce");
        assert_eq!(payload["iss"], "client-1");
        assert_eq!(payload["aud"], "https://issuer.example.org");
    }

    #[tokio::test]
    async fn par_request_object_shape() {
        let key = TestKey::generate();
        let redirect: Url = "https://wallet.example.org/cb".parse().unwrap();
        let details = [AuthorizationDetailRequest::OpenIdCredential {
            credential_configuration_id: "dc_sd_jwt_mDL".into(),
        }];
        let jws = par_request_object(
            &key,
            ParRequestParams {
                audience: "https://issuer.example.org",
                client_id: "client-1",
                state: "state-1",
                code_verifier: "a".repeat(64).as_str(),
                redirect_uri: &redirect,
                response_mode: "query",
                authorization_details: &details,
            },
        )
        .await
        .unwrap();

        let (header, payload) = decode_unverified(&jws).unwrap();
        assert_eq!(header["kid"], key.public_jwk().unwrap().thumbprint());
        assert_eq!(payload["response_type"], "code");
        assert_eq!(payload["code_challenge_method"], "S256");
        assert_eq!(
            payload["code_challenge"],
            code_challenge("a".repeat(64).as_str())
        );
        assert_eq!(payload["authorization_details"][0]["type"], "openid_credential");
        assert_eq!(payload["iss"], payload["client_id"]);
    }

    #[tokio::test]
    async fn ephemeral_dpop_key_is_deleted_after_use() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        #[derive(Default)]
        struct CountingKeys {
            generated: AtomicUsize,
            deleted: AtomicUsize,
        }

        #[async_trait]
        impl EphemeralKeys for CountingKeys {
            type Key = TestKey;

            async fn generate(&self) -> Result<TestKey> {
                self.generated.fetch_add(1, Ordering::SeqCst);
                Ok(TestKey::generate())
            }

            async fn delete(&self, _key: &TestKey) -> Result<()> {
                self.deleted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let keys = CountingKeys::default();
        let htu: Url = "https://issuer.example.org/par".parse().unwrap();
        let jws = dpop_proof_ephemeral(&keys, HttpMethod::Post, &htu, "jti-e", None)
            .await
            .unwrap();
        assert_eq!(keys.generated.load(Ordering::SeqCst), 1);
        assert_eq!(keys.deleted.load(Ordering::SeqCst), 1);

        let (header, _) = decode_unverified(&jws).unwrap();
        assert_eq!(header["typ"], "dpop+jwt");
    }

    #[tokio::test]
    async fn signing_rejection_is_terminal() {
        struct RejectingKey;

        #[async_trait]
        impl KeyBinding for RejectingKey {
            fn public_jwk(&self) -> Result<Jwk> {
                Ok(Jwk {
                    kty: "EC".into(),
                    crv: "P-256".into(),
                    x: "x".into(),
                    y: "y".into(),
                    kid: None,
                })
            }

            async fn sign(&self, _data: &[u8]) -> Result<Vec<u8>> {
                anyhow::bail!("keystore unavailable")
            }
        }

        let htu: Url = "https://issuer.example.org/token".parse().unwrap();
        let err = dpop_proof(&RejectingKey, HttpMethod::Post, &htu, "jti", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SigningFailed { .. }));
    }
}
