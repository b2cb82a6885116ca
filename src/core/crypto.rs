//! Key material and JWS primitives.
//!
//! The engine never holds raw private keys. Signing goes through the
//! [`KeyBinding`] capability so keys can live in a hardware-backed store,
//! while short-lived DPoP keys are managed through [`EphemeralKeys`].

use std::future::Future;
use std::pin::Pin;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::prelude::*;
use p256::ecdsa::signature::Verifier as _;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::elliptic_curve::sec1::FromEncodedPoint;
use p256::EncodedPoint;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Error;

/// An EC public key in JWK form. Only P-256 keys are supported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
}

impl Jwk {
    /// RFC 7638 thumbprint: SHA-256 over the canonical member ordering,
    /// base64url without padding.
    pub fn thumbprint(&self) -> String {
        let canonical = format!(
            r#"{{"crv":"{}","kty":"{}","x":"{}","y":"{}"}}"#,
            self.crv, self.kty, self.x, self.y
        );
        BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
    }

    pub(crate) fn verifying_key(&self) -> Result<VerifyingKey> {
        if self.kty != "EC" || self.crv != "P-256" {
            bail!("unsupported key type: {}/{}", self.kty, self.crv);
        }
        let x = BASE64_URL_SAFE_NO_PAD
            .decode(&self.x)
            .context("invalid x coordinate")?;
        let y = BASE64_URL_SAFE_NO_PAD
            .decode(&self.y)
            .context("invalid y coordinate")?;
        let point = EncodedPoint::from_affine_coordinates(
            x.as_slice().into(),
            y.as_slice().into(),
            false,
        );
        let Some(public_key) = Option::<p256::PublicKey>::from(p256::PublicKey::from_encoded_point(&point)) else {
            bail!("jwk coordinates are not a valid P-256 point");
        };
        Ok(VerifyingKey::from(&public_key))
    }
}

impl From<&VerifyingKey> for Jwk {
    fn from(key: &VerifyingKey) -> Self {
        let point = key.to_encoded_point(false);
        Self {
            kty: "EC".into(),
            crv: "P-256".into(),
            x: BASE64_URL_SAFE_NO_PAD.encode(point.x().map(|x| x.to_vec()).unwrap_or_default()),
            y: BASE64_URL_SAFE_NO_PAD.encode(point.y().map(|y| y.to_vec()).unwrap_or_default()),
            kid: None,
        }
    }
}

/// A signing capability bound to a device-held ES256 key.
///
/// `sign` returns the raw 64-byte `r || s` signature over the input.
#[async_trait]
pub trait KeyBinding: Send + Sync {
    fn public_jwk(&self) -> Result<Jwk>;
    async fn sign(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Managed short-lived keys. Callers must pair every `generate` with a
/// `delete`, which [`with_ephemeral_key`] enforces.
#[async_trait]
pub trait EphemeralKeys: Send + Sync {
    type Key: KeyBinding;

    async fn generate(&self) -> Result<Self::Key>;
    async fn delete(&self, key: &Self::Key) -> Result<()>;
}

/// Run `f` with a freshly generated key, deleting the key on every exit
/// path. A failure from `f` takes precedence over a deletion failure.
pub async fn with_ephemeral_key<E, F, T>(keys: &E, f: F) -> Result<T, Error>
where
    E: EphemeralKeys,
    F: for<'a> FnOnce(&'a E::Key) -> Pin<Box<dyn Future<Output = Result<T, Error>> + Send + 'a>>,
{
    let key = keys.generate().await.map_err(Error::signing)?;
    let result = f(&key).await;
    let deleted = keys.delete(&key).await;
    let value = result?;
    deleted.map_err(Error::signing)?;
    Ok(value)
}

/// Signature verification over a JWS signing input.
pub trait JwsVerifier {
    fn verify(&self, signing_input: &[u8], signature: &[u8]) -> Result<()>;
}

/// ES256 verifier over a P-256 public key.
#[derive(Debug, Clone)]
pub struct Es256Verifier(VerifyingKey);

impl Es256Verifier {
    pub fn from_jwk(jwk: &Jwk) -> Result<Self> {
        jwk.verifying_key().map(Self)
    }

    pub(crate) fn from_verifying_key(key: VerifyingKey) -> Self {
        Self(key)
    }
}

impl JwsVerifier for Es256Verifier {
    fn verify(&self, signing_input: &[u8], signature: &[u8]) -> Result<()> {
        let signature = Signature::from_slice(signature).context("invalid signature encoding")?;
        self.0
            .verify(signing_input, &signature)
            .context("signature verification failed")
    }
}

/// Split a compact JWS into its three base64url segments.
pub(crate) fn split_jws(jws: &str) -> Result<(&str, &str, &str), Error> {
    let mut parts = jws.split('.');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(header), Some(payload), Some(signature), None) => Ok((header, payload, signature)),
        _ => Err(Error::validation("token is not a compact JWS")),
    }
}

pub(crate) fn decode_part<T: DeserializeOwned>(part: &str) -> Result<T, Error> {
    let bytes = BASE64_URL_SAFE_NO_PAD
        .decode(part)
        .map_err(|e| Error::validation_with("invalid base64url segment", e.to_string()))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::validation_with("invalid JSON segment", e.to_string()))
}

pub(crate) fn encode_part<T: Serialize>(value: &T) -> Result<String, Error> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| Error::validation_with("unable to encode JSON segment", e.to_string()))?;
    Ok(BASE64_URL_SAFE_NO_PAD.encode(bytes))
}

/// Verify a compact JWS and return its decoded payload.
pub(crate) fn verify_compact_jws<T: DeserializeOwned, V: JwsVerifier>(
    jws: &str,
    verifier: &V,
) -> Result<T, Error> {
    let (header, payload, signature) = split_jws(jws)?;
    let signature_bytes = BASE64_URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|e| Error::validation_with("invalid signature encoding", e.to_string()))?;
    let signing_input = format!("{header}.{payload}");
    verifier
        .verify(signing_input.as_bytes(), &signature_bytes)
        .map_err(|e| Error::integrity(format!("signature verification failed: {e:#}")))?;
    decode_part(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::SigningKey;

    #[test]
    fn thumbprint_is_stable_and_ignores_kid() {
        let mut jwk = Jwk {
            kty: "EC".into(),
            crv: "P-256".into(),
            x: "WKn-ZIGevcwGIyyrzFoZNBdaq9_TsqzGl96oc0CWuis".into(),
            y: "y77t-RvAHRKTsSGdIYUfweuOvwrvDD-Q3Hv5J0fSKbE".into(),
            kid: None,
        };
        let bare = jwk.thumbprint();
        jwk.kid = Some("some-kid".into());
        assert_eq!(bare, jwk.thumbprint());
        // Known value from RFC 7638 style canonicalization.
        assert_eq!(bare.len(), 43);
    }

    #[test]
    fn jwk_round_trips_through_verifying_key() {
        let signing_key = SigningKey::random(&mut rand::rngs::OsRng);
        let jwk = Jwk::from(signing_key.verifying_key());
        let recovered = jwk.verifying_key().unwrap();
        assert_eq!(&recovered, signing_key.verifying_key());
    }

    #[test]
    fn rejects_non_p256_keys() {
        let jwk = Jwk {
            kty: "OKP".into(),
            crv: "Ed25519".into(),
            x: "abc".into(),
            y: String::new(),
            kid: None,
        };
        assert!(jwk.verifying_key().is_err());
    }

    #[tokio::test]
    async fn ephemeral_key_deleted_even_when_closure_fails() {
        use async_trait::async_trait;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        struct StubKey;

        #[async_trait]
        impl KeyBinding for StubKey {
            fn public_jwk(&self) -> Result<Jwk> {
                anyhow::bail!("not needed")
            }

            async fn sign(&self, _data: &[u8]) -> Result<Vec<u8>> {
                anyhow::bail!("not needed")
            }
        }

        #[derive(Default)]
        struct Keys {
            deleted: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl EphemeralKeys for Keys {
            type Key = StubKey;

            async fn generate(&self) -> Result<StubKey> {
                Ok(StubKey)
            }

            async fn delete(&self, _key: &StubKey) -> Result<()> {
                self.deleted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let keys = Keys::default();
        let outcome: Result<(), Error> = with_ephemeral_key(&keys, |_key| {
            Box::pin(async { Err(Error::validation("deliberate failure")) })
        })
        .await;
        assert!(outcome.is_err());
        assert_eq!(keys.deleted.load(Ordering::SeqCst), 1);

        let ok: Result<u8, Error> =
            with_ephemeral_key(&keys, |_key| Box::pin(async { Ok(7) })).await;
        assert_eq!(ok.unwrap(), 7);
        assert_eq!(keys.deleted.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn split_rejects_extra_segments() {
        assert!(split_jws("a.b.c.d").is_err());
        assert!(split_jws("a.b").is_err());
        assert!(split_jws("a.b.c").is_ok());
    }

    #[test]
    fn verify_compact_jws_detects_tampering() {
        use p256::ecdsa::signature::Signer as _;

        let signing_key = SigningKey::random(&mut rand::rngs::OsRng);
        let header = BASE64_URL_SAFE_NO_PAD.encode(br#"{"alg":"ES256"}"#);
        let payload = BASE64_URL_SAFE_NO_PAD.encode(br#"{"sub":"wallet"}"#);
        let signing_input = format!("{header}.{payload}");
        let signature: Signature = signing_key.sign(signing_input.as_bytes());
        let jws = format!(
            "{signing_input}.{}",
            BASE64_URL_SAFE_NO_PAD.encode(signature.to_bytes())
        );

        let verifier = Es256Verifier::from_verifying_key(*signing_key.verifying_key());
        let decoded: serde_json::Value = verify_compact_jws(&jws, &verifier).unwrap();
        assert_eq!(decoded["sub"], "wallet");

        let tampered_payload = BASE64_URL_SAFE_NO_PAD.encode(br#"{"sub":"mallory"}"#);
        let tampered = format!(
            "{header}.{tampered_payload}.{}",
            BASE64_URL_SAFE_NO_PAD.encode(signature.to_bytes())
        );
        assert!(matches!(
            verify_compact_jws::<serde_json::Value, _>(&tampered, &verifier),
            Err(Error::IntegrityViolation { .. })
        ));
    }
}
