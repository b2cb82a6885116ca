//! ISO 18013-5 mdoc decode, verification and parsing.
//!
//! The raw credential is base64 CBOR: an `IssuerSigned` structure whose
//! `nameSpaces` map each namespace to tag-24 wrapped issuer-signed items
//! and whose `issuerAuth` is a COSE_Sign1 over the mobile security object
//! (MSO). The issuer signature chains to a caller-supplied X.509 root
//! instead of a JWKS; item integrity comes from the MSO `valueDigests`.

use std::collections::BTreeMap;

use base64::prelude::*;
use chrono::DateTime;
use ciborium::value::Value as Cbor;
use p256::ecdsa::signature::Verifier as _;
use p256::ecdsa::{Signature, VerifyingKey};
use serde_json::Value as Json;
use sha2::{Digest, Sha256};
use x509_cert::der::{Decode, Encode};
use x509_cert::Certificate;

use crate::core::crypto::Jwk;
use crate::core::metadata::{ClaimMetadata, ClaimPathSegment};
use crate::core::verifier::{ClaimName, ParseOptions, ParsedClaim, ParsedCredential};
use crate::error::Error;

/// COSE unprotected-header label for the certificate chain.
const LABEL_X5CHAIN: i128 = 33;

#[derive(Debug, Clone)]
pub struct IssuerSignedItem {
    pub digest_id: u64,
    pub element_identifier: String,
    pub element_value: Cbor,
    /// The tag-24 wrapped encoding as transmitted, the digest input.
    tagged: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct CoseSign1 {
    pub protected: Vec<u8>,
    pub x5chain: Vec<Vec<u8>>,
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Mobile security object, the signed COSE payload.
#[derive(Debug, Clone)]
pub struct Mso {
    pub doc_type: String,
    pub value_digests: BTreeMap<String, BTreeMap<u64, Vec<u8>>>,
    pub device_key: Jwk,
    pub valid_until: Option<i64>,
    pub signed_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct DecodedMdoc {
    pub namespaces: BTreeMap<String, Vec<IssuerSignedItem>>,
    pub issuer_auth: CoseSign1,
    pub mso: Mso,
}

fn cbor_from_slice(bytes: &[u8]) -> Result<Cbor, Error> {
    ciborium::from_reader(bytes).map_err(|e| Error::validation_with("invalid CBOR", e))
}

fn cbor_to_vec(value: &Cbor) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out)
        .map_err(|e| Error::validation_with("unable to encode CBOR", e))?;
    Ok(out)
}

fn entry<'a>(map: &'a [(Cbor, Cbor)], key: &str) -> Option<&'a Cbor> {
    map.iter()
        .find(|(k, _)| matches!(k, Cbor::Text(t) if t == key))
        .map(|(_, v)| v)
}

fn int_entry<'a>(map: &'a [(Cbor, Cbor)], label: i128) -> Option<&'a Cbor> {
    map.iter()
        .find(|(k, _)| matches!(k, Cbor::Integer(i) if i128::from(*i) == label))
        .map(|(_, v)| v)
}

fn as_map<'a>(value: &'a Cbor, what: &str) -> Result<&'a [(Cbor, Cbor)], Error> {
    value
        .as_map()
        .map(Vec::as_slice)
        .ok_or_else(|| Error::validation(format!("{what} is not a CBOR map")))
}

fn as_bytes<'a>(value: &'a Cbor, what: &str) -> Result<&'a [u8], Error> {
    value
        .as_bytes()
        .map(Vec::as_slice)
        .ok_or_else(|| Error::validation(format!("{what} is not a CBOR byte string")))
}

fn as_text<'a>(value: &'a Cbor, what: &str) -> Result<&'a str, Error> {
    value
        .as_text()
        .ok_or_else(|| Error::validation(format!("{what} is not a CBOR text string")))
}

fn as_u64(value: &Cbor, what: &str) -> Result<u64, Error> {
    value
        .as_integer()
        .and_then(|i| u64::try_from(i128::from(i)).ok())
        .ok_or_else(|| Error::validation(format!("{what} is not an unsigned CBOR integer")))
}

/// Strip a leading semantic tag, keeping the inner value.
fn untag(value: &Cbor) -> &Cbor {
    match value {
        Cbor::Tag(_, inner) => untag(inner),
        other => other,
    }
}

fn decode_item(item: &Cbor) -> Result<IssuerSignedItem, Error> {
    let Cbor::Tag(24, inner) = item else {
        return Err(Error::validation("issuer-signed item is not tag-24 wrapped"));
    };
    let encoded = as_bytes(inner, "issuer-signed item")?;
    let fields = cbor_from_slice(encoded)?;
    let fields = as_map(&fields, "issuer-signed item")?;

    Ok(IssuerSignedItem {
        digest_id: as_u64(
            entry(fields, "digestID").ok_or_else(|| Error::validation("item has no digestID"))?,
            "digestID",
        )?,
        element_identifier: as_text(
            entry(fields, "elementIdentifier")
                .ok_or_else(|| Error::validation("item has no elementIdentifier"))?,
            "elementIdentifier",
        )?
        .to_owned(),
        element_value: entry(fields, "elementValue")
            .ok_or_else(|| Error::validation("item has no elementValue"))?
            .clone(),
        tagged: cbor_to_vec(item)?,
    })
}

fn decode_cose_sign1(value: &Cbor) -> Result<CoseSign1, Error> {
    let parts = untag(value)
        .as_array()
        .filter(|a| a.len() == 4)
        .ok_or_else(|| Error::validation("issuerAuth is not a COSE_Sign1"))?;

    let unprotected = as_map(&parts[1], "COSE_Sign1 unprotected header")?;
    let x5chain = match int_entry(unprotected, LABEL_X5CHAIN) {
        Some(Cbor::Bytes(der)) => vec![der.clone()],
        Some(Cbor::Array(certs)) => certs
            .iter()
            .map(|c| as_bytes(c, "x5chain entry").map(<[u8]>::to_vec))
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => return Err(Error::validation("x5chain has an unexpected shape")),
        None => Vec::new(),
    };

    Ok(CoseSign1 {
        protected: as_bytes(&parts[0], "COSE_Sign1 protected header")?.to_vec(),
        x5chain,
        payload: as_bytes(&parts[2], "COSE_Sign1 payload")?.to_vec(),
        signature: as_bytes(&parts[3], "COSE_Sign1 signature")?.to_vec(),
    })
}

fn decode_cose_key(value: &Cbor) -> Result<Jwk, Error> {
    let key = as_map(value, "deviceKey")?;
    let kty = int_entry(key, 1).map(untag);
    if !matches!(kty, Some(Cbor::Integer(i)) if i128::from(*i) == 2) {
        return Err(Error::validation("deviceKey is not an EC2 COSE key"));
    }
    let crv = int_entry(key, -1);
    if !matches!(crv.map(untag), Some(Cbor::Integer(i)) if i128::from(*i) == 1) {
        return Err(Error::validation("deviceKey curve is not P-256"));
    }
    let x = as_bytes(
        int_entry(key, -2).ok_or_else(|| Error::validation("deviceKey has no x coordinate"))?,
        "deviceKey x",
    )?;
    let y = as_bytes(
        int_entry(key, -3).ok_or_else(|| Error::validation("deviceKey has no y coordinate"))?,
        "deviceKey y",
    )?;

    Ok(Jwk {
        kty: "EC".to_owned(),
        crv: "P-256".to_owned(),
        x: BASE64_URL_SAFE_NO_PAD.encode(x),
        y: BASE64_URL_SAFE_NO_PAD.encode(y),
        kid: None,
    })
}

fn timestamp(map: &[(Cbor, Cbor)], key: &str) -> Result<Option<i64>, Error> {
    let Some(value) = entry(map, key) else {
        return Ok(None);
    };
    let text = as_text(untag(value), key)?;
    let parsed = DateTime::parse_from_rfc3339(text)
        .map_err(|e| Error::validation_with(format!("{key} is not an RFC 3339 date"), e))?;
    Ok(Some(parsed.timestamp()))
}

fn decode_mso(payload: &[u8]) -> Result<Mso, Error> {
    let wrapper = cbor_from_slice(payload)?;
    let Cbor::Tag(24, inner) = &wrapper else {
        return Err(Error::validation("MSO payload is not tag-24 wrapped"));
    };
    let mso = cbor_from_slice(as_bytes(inner, "MSO")?)?;
    let mso = as_map(&mso, "MSO")?;

    let mut value_digests = BTreeMap::new();
    let digests = as_map(
        entry(mso, "valueDigests").ok_or_else(|| Error::validation("MSO has no valueDigests"))?,
        "valueDigests",
    )?;
    for (namespace, per_id) in digests {
        let namespace = as_text(namespace, "valueDigests namespace")?;
        let mut expected = BTreeMap::new();
        for (digest_id, digest) in as_map(per_id, "valueDigests entry")? {
            expected.insert(
                as_u64(digest_id, "digestID")?,
                as_bytes(digest, "value digest")?.to_vec(),
            );
        }
        value_digests.insert(namespace.to_owned(), expected);
    }

    let device_key_info = as_map(
        entry(mso, "deviceKeyInfo")
            .ok_or_else(|| Error::validation("MSO has no deviceKeyInfo"))?,
        "deviceKeyInfo",
    )?;
    let device_key = decode_cose_key(
        entry(device_key_info, "deviceKey")
            .ok_or_else(|| Error::validation("deviceKeyInfo has no deviceKey"))?,
    )?;

    let (valid_until, signed_at) = match entry(mso, "validityInfo") {
        Some(info) => {
            let info = as_map(info, "validityInfo")?;
            (timestamp(info, "validUntil")?, timestamp(info, "signed")?)
        }
        None => (None, None),
    };

    Ok(Mso {
        doc_type: as_text(
            entry(mso, "docType").ok_or_else(|| Error::validation("MSO has no docType"))?,
            "docType",
        )?
        .to_owned(),
        value_digests,
        device_key,
        valid_until,
        signed_at,
    })
}

/// Decode a base64 CBOR credential into its issuer-signed structure.
pub fn decode(raw: &str) -> Result<DecodedMdoc, Error> {
    let bytes = BASE64_STANDARD
        .decode(raw)
        .or_else(|_| BASE64_URL_SAFE_NO_PAD.decode(raw))
        .map_err(|e| Error::validation_with("credential is not base64 CBOR", e))?;
    let top = cbor_from_slice(&bytes)?;

    // Accept either a bare IssuerSigned or a DeviceResponse wrapping one.
    let top_map = as_map(&top, "credential")?;
    let issuer_signed = match entry(top_map, "documents") {
        Some(documents) => {
            let first = documents
                .as_array()
                .and_then(|d| d.first())
                .ok_or_else(|| Error::validation("device response carries no documents"))?;
            entry(as_map(first, "document")?, "issuerSigned")
                .ok_or_else(|| Error::validation("document has no issuerSigned"))?
                .clone()
        }
        None => top.clone(),
    };
    let issuer_signed = as_map(&issuer_signed, "issuerSigned")?;

    let mut namespaces = BTreeMap::new();
    let spaces = as_map(
        entry(issuer_signed, "nameSpaces")
            .ok_or_else(|| Error::validation("issuerSigned has no nameSpaces"))?,
        "nameSpaces",
    )?;
    for (namespace, items) in spaces {
        let namespace = as_text(namespace, "namespace")?;
        let items = items
            .as_array()
            .ok_or_else(|| Error::validation("namespace items are not an array"))?
            .iter()
            .map(decode_item)
            .collect::<Result<Vec<_>, _>>()?;
        namespaces.insert(namespace.to_owned(), items);
    }

    let issuer_auth = decode_cose_sign1(
        entry(issuer_signed, "issuerAuth")
            .ok_or_else(|| Error::validation("issuerSigned has no issuerAuth"))?,
    )?;
    let mso = decode_mso(&issuer_auth.payload)?;

    Ok(DecodedMdoc {
        namespaces,
        issuer_auth,
        mso,
    })
}

fn verifying_key_from_certificate(certificate: &Certificate) -> Result<VerifyingKey, Error> {
    let spki = certificate
        .tbs_certificate
        .subject_public_key_info
        .subject_public_key
        .as_bytes()
        .ok_or_else(|| Error::validation("certificate public key has unused bits"))?;
    VerifyingKey::from_sec1_bytes(spki)
        .map_err(|e| Error::validation_with("certificate key is not a P-256 point", e))
}

fn verify_certificate_chain(auth: &CoseSign1, trust_root: &[u8]) -> Result<VerifyingKey, Error> {
    let leaf_der = auth
        .x5chain
        .first()
        .ok_or_else(|| Error::validation("issuerAuth carries no x5chain certificate"))?;
    let leaf = Certificate::from_der(leaf_der)
        .map_err(|e| Error::validation_with("x5chain leaf is not valid DER", e))?;
    let root = Certificate::from_der(trust_root)
        .map_err(|e| Error::validation_with("trust root is not valid DER", e))?;

    let tbs = leaf
        .tbs_certificate
        .to_der()
        .map_err(|e| Error::validation_with("unable to re-encode certificate", e))?;
    let signature = Signature::from_der(
        leaf.signature
            .as_bytes()
            .ok_or_else(|| Error::validation("certificate signature has unused bits"))?,
    )
    .map_err(|e| Error::validation_with("certificate signature is not DER ECDSA", e))?;
    verifying_key_from_certificate(&root)?
        .verify(&tbs, &signature)
        .map_err(|_| {
            Error::integrity("issuer certificate is not signed by the supplied trust root")
        })?;

    verifying_key_from_certificate(&leaf)
}

/// Check the COSE_Sign1 signature over the canonical Sig_structure.
pub(crate) fn verify_cose_signature(key: &VerifyingKey, auth: &CoseSign1) -> Result<(), Error> {
    let sig_structure = Cbor::Array(vec![
        Cbor::Text("Signature1".to_owned()),
        Cbor::Bytes(auth.protected.clone()),
        Cbor::Bytes(Vec::new()),
        Cbor::Bytes(auth.payload.clone()),
    ]);
    let signing_input = cbor_to_vec(&sig_structure)?;
    let signature = Signature::from_slice(&auth.signature)
        .map_err(|e| Error::validation_with("COSE signature has an unexpected length", e))?;
    key.verify(&signing_input, &signature)
        .map_err(|_| Error::integrity("issuerAuth signature verification failed"))
}

/// Recompute every item digest and compare it to the MSO declaration.
pub(crate) fn check_value_digests(decoded: &DecodedMdoc) -> Result<(), Error> {
    for (namespace, items) in &decoded.namespaces {
        let declared = decoded.mso.value_digests.get(namespace).ok_or_else(|| {
            Error::integrity(format!("MSO declares no digests for namespace {namespace}"))
        })?;
        for item in items {
            let expected = declared.get(&item.digest_id).ok_or_else(|| {
                Error::integrity(format!(
                    "MSO declares no digest for {namespace} item {}",
                    item.digest_id
                ))
            })?;
            let actual = Sha256::digest(&item.tagged);
            if actual[..] != expected[..] {
                return Err(Error::integrity(format!(
                    "digest mismatch for {namespace}:{}",
                    item.element_identifier
                )));
            }
        }
    }
    Ok(())
}

pub(crate) fn verify_with_key(
    decoded: &DecodedMdoc,
    issuer_key: &VerifyingKey,
    holder_jwk: &Jwk,
) -> Result<(), Error> {
    verify_cose_signature(issuer_key, &decoded.issuer_auth)?;
    check_value_digests(decoded)?;
    if decoded.mso.device_key.thumbprint() != holder_jwk.thumbprint() {
        return Err(Error::integrity(
            "holder binding mismatch: the mdoc deviceKey is a different key",
        ));
    }
    Ok(())
}

/// Verify the issuer signature (chained to `trust_root`), the per-item
/// digests and the holder binding.
pub fn verify(decoded: &DecodedMdoc, trust_root: &[u8], holder_jwk: &Jwk) -> Result<(), Error> {
    let issuer_key = verify_certificate_chain(&decoded.issuer_auth, trust_root)?;
    verify_with_key(decoded, &issuer_key, holder_jwk)
}

fn cbor_to_json(value: &Cbor) -> Json {
    match value {
        Cbor::Null => Json::Null,
        Cbor::Bool(b) => Json::Bool(*b),
        Cbor::Integer(i) => match i64::try_from(i128::from(*i)) {
            Ok(n) => Json::from(n),
            Err(_) => Json::String(i128::from(*i).to_string()),
        },
        Cbor::Float(f) => serde_json::Number::from_f64(*f).map_or(Json::Null, Json::Number),
        Cbor::Text(t) => Json::String(t.clone()),
        Cbor::Bytes(b) => Json::String(BASE64_URL_SAFE_NO_PAD.encode(b)),
        Cbor::Array(items) => Json::Array(items.iter().map(cbor_to_json).collect()),
        Cbor::Map(map) => Json::Object(
            map.iter()
                .map(|(k, v)| {
                    let key = match k {
                        Cbor::Text(t) => t.clone(),
                        other => format!("{other:?}"),
                    };
                    (key, cbor_to_json(v))
                })
                .collect(),
        ),
        Cbor::Tag(_, inner) => cbor_to_json(inner),
        _ => Json::Null,
    }
}

fn pair(path: &[ClaimPathSegment]) -> Option<(&str, &str)> {
    match path {
        [ClaimPathSegment::Key(namespace), ClaimPathSegment::Key(attribute), ..] => {
            Some((namespace, attribute))
        }
        _ => None,
    }
}

/// Match claim metadata `(namespace, attribute)` pairs against the decoded
/// items. Output keys are `namespace:attribute`.
pub fn parse(
    decoded: &DecodedMdoc,
    claims: &[ClaimMetadata],
    options: ParseOptions,
) -> Result<ParsedCredential, Error> {
    let flat: Vec<(&str, &str, &Cbor)> = decoded
        .namespaces
        .iter()
        .flat_map(|(namespace, items)| {
            items.iter().map(move |item| {
                (
                    namespace.as_str(),
                    item.element_identifier.as_str(),
                    &item.element_value,
                )
            })
        })
        .collect();

    if !options.ignore_missing_attributes {
        let missing: Vec<&str> = claims
            .iter()
            .filter(|c| c.mandatory)
            .filter_map(|c| pair(&c.path))
            .filter(|(namespace, attribute)| {
                !flat
                    .iter()
                    .any(|(ns, attr, _)| ns == namespace && attr == attribute)
            })
            .map(|(_, attribute)| attribute)
            .collect();
        if !missing.is_empty() {
            return Err(Error::MissingMandatoryClaim {
                missing: missing.join(", "),
                received: flat
                    .iter()
                    .map(|(_, attr, _)| *attr)
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }
    }

    let mut parsed = BTreeMap::new();
    for claim in claims {
        let Some((namespace, attribute)) = pair(&claim.path) else {
            continue;
        };
        let Some((_, _, value)) = flat
            .iter()
            .find(|(ns, attr, _)| *ns == namespace && *attr == attribute)
        else {
            continue;
        };
        let names = claim.localized_names();
        parsed.insert(
            format!("{namespace}:{attribute}"),
            ParsedClaim {
                value: cbor_to_json(value),
                name: if names.is_empty() {
                    ClaimName::Plain(attribute.to_owned())
                } else {
                    ClaimName::Localized(names)
                },
                mandatory: claim.mandatory,
            },
        );
    }

    if options.include_undefined_attributes {
        for (namespace, attribute, value) in &flat {
            let key = format!("{namespace}:{attribute}");
            parsed.entry(key).or_insert_with(|| ParsedClaim {
                value: cbor_to_json(value),
                name: ClaimName::Plain((*attribute).to_owned()),
                mandatory: false,
            });
        }
    }

    Ok(ParsedCredential {
        claims: parsed,
        expiration: decoded.mso.valid_until,
        issued_at: decoded.mso.signed_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::crypto::KeyBinding as _;
    use crate::core::proof::tests::TestKey;
    use ciborium::value::Integer;
    use p256::ecdsa::signature::Signer as _;
    use serde_json::json;

    const PID_NAMESPACE: &str = "eu.europa.ec.eudi.pid.1";

    fn text(s: &str) -> Cbor {
        Cbor::Text(s.to_owned())
    }

    fn cose_key_for(key: &TestKey) -> Cbor {
        let jwk = key.public_jwk().unwrap();
        Cbor::Map(vec![
            (Cbor::Integer(Integer::from(1)), Cbor::Integer(Integer::from(2))),
            (Cbor::Integer(Integer::from(-1)), Cbor::Integer(Integer::from(1))),
            (
                Cbor::Integer(Integer::from(-2)),
                Cbor::Bytes(BASE64_URL_SAFE_NO_PAD.decode(&jwk.x).unwrap()),
            ),
            (
                Cbor::Integer(Integer::from(-3)),
                Cbor::Bytes(BASE64_URL_SAFE_NO_PAD.decode(&jwk.y).unwrap()),
            ),
        ])
    }

    fn tagged_item(digest_id: u64, identifier: &str, value: Cbor) -> Cbor {
        let fields = Cbor::Map(vec![
            (text("digestID"), Cbor::Integer(Integer::from(digest_id))),
            (text("random"), Cbor::Bytes(vec![digest_id as u8; 16])),
            (text("elementIdentifier"), text(identifier)),
            (text("elementValue"), value),
        ]);
        let mut encoded = Vec::new();
        ciborium::into_writer(&fields, &mut encoded).unwrap();
        Cbor::Tag(24, Box::new(Cbor::Bytes(encoded)))
    }

    /// Build a signed credential with family_name and given_name in the
    /// PID namespace and return its base64 together with the issuer key.
    fn pid_credential(issuer: &TestKey, holder: &TestKey) -> String {
        let items = vec![
            tagged_item(0, "family_name", text("Rossi")),
            tagged_item(1, "given_name", text("Mario")),
        ];
        let digests: Vec<(Cbor, Cbor)> = items
            .iter()
            .enumerate()
            .map(|(id, item)| {
                let mut encoded = Vec::new();
                ciborium::into_writer(item, &mut encoded).unwrap();
                (
                    Cbor::Integer(Integer::from(id as u64)),
                    Cbor::Bytes(Sha256::digest(&encoded).to_vec()),
                )
            })
            .collect();

        let mso = Cbor::Map(vec![
            (text("version"), text("1.0")),
            (text("digestAlgorithm"), text("SHA-256")),
            (text("docType"), text("eu.europa.ec.eudi.pid.1")),
            (
                text("valueDigests"),
                Cbor::Map(vec![(text(PID_NAMESPACE), Cbor::Map(digests))]),
            ),
            (
                text("deviceKeyInfo"),
                Cbor::Map(vec![(text("deviceKey"), cose_key_for(holder))]),
            ),
            (
                text("validityInfo"),
                Cbor::Map(vec![
                    (
                        text("signed"),
                        Cbor::Tag(0, Box::new(text("2026-01-01T00:00:00Z"))),
                    ),
                    (
                        text("validUntil"),
                        Cbor::Tag(0, Box::new(text("2027-01-01T00:00:00Z"))),
                    ),
                ]),
            ),
        ]);
        let mut mso_bytes = Vec::new();
        ciborium::into_writer(&mso, &mut mso_bytes).unwrap();
        let mut payload = Vec::new();
        ciborium::into_writer(&Cbor::Tag(24, Box::new(Cbor::Bytes(mso_bytes))), &mut payload)
            .unwrap();

        let protected = {
            let mut out = Vec::new();
            ciborium::into_writer(
                &Cbor::Map(vec![(
                    Cbor::Integer(Integer::from(1)),
                    Cbor::Integer(Integer::from(-7)),
                )]),
                &mut out,
            )
            .unwrap();
            out
        };
        let sig_structure = Cbor::Array(vec![
            text("Signature1"),
            Cbor::Bytes(protected.clone()),
            Cbor::Bytes(Vec::new()),
            Cbor::Bytes(payload.clone()),
        ]);
        let mut signing_input = Vec::new();
        ciborium::into_writer(&sig_structure, &mut signing_input).unwrap();
        let signature: p256::ecdsa::Signature = issuer.0.sign(&signing_input);

        let issuer_signed = Cbor::Map(vec![
            (
                text("nameSpaces"),
                Cbor::Map(vec![(text(PID_NAMESPACE), Cbor::Array(items))]),
            ),
            (
                text("issuerAuth"),
                Cbor::Array(vec![
                    Cbor::Bytes(protected),
                    Cbor::Map(vec![]),
                    Cbor::Bytes(payload),
                    Cbor::Bytes(signature.to_bytes().to_vec()),
                ]),
            ),
        ]);
        let mut credential = Vec::new();
        ciborium::into_writer(&issuer_signed, &mut credential).unwrap();
        BASE64_STANDARD.encode(credential)
    }

    fn pid_claims() -> Vec<ClaimMetadata> {
        serde_json::from_value(json!([
            {
                "path": [PID_NAMESPACE, "family_name"],
                "mandatory": true,
                "display": [
                    {"name": "Family Name", "locale": "en-US"},
                    {"name": "Cognome", "locale": "it-IT"}
                ]
            },
            {
                "path": [PID_NAMESPACE, "given_name"],
                "mandatory": true,
                "display": [{"name": "Given Name", "locale": "en-US"}]
            }
        ]))
        .unwrap()
    }

    #[test]
    fn decode_verify_parse_pid() {
        let issuer = TestKey::generate();
        let holder = TestKey::generate();
        let raw = pid_credential(&issuer, &holder);

        let decoded = decode(&raw).unwrap();
        assert_eq!(decoded.mso.doc_type, "eu.europa.ec.eudi.pid.1");
        verify_with_key(
            &decoded,
            issuer.0.verifying_key(),
            &holder.public_jwk().unwrap(),
        )
        .unwrap();

        let parsed = parse(&decoded, &pid_claims(), ParseOptions::default()).unwrap();
        let family = &parsed.claims["eu.europa.ec.eudi.pid.1:family_name"];
        assert_eq!(family.value, json!("Rossi"));
        assert!(family.mandatory);
        assert!(matches!(
            &family.name,
            ClaimName::Localized(names) if names["it-IT"] == "Cognome"
        ));
        assert!(parsed.expiration.is_some());
    }

    #[test]
    fn tampered_item_fails_the_digest_check() {
        let issuer = TestKey::generate();
        let holder = TestKey::generate();
        let raw = pid_credential(&issuer, &holder);
        let mut decoded = decode(&raw).unwrap();

        let items = decoded.namespaces.get_mut(PID_NAMESPACE).unwrap();
        items[0].tagged = {
            let forged = tagged_item(0, "family_name", text("Bianchi"));
            let mut out = Vec::new();
            ciborium::into_writer(&forged, &mut out).unwrap();
            out
        };

        let err = check_value_digests(&decoded).unwrap_err();
        assert!(matches!(err, Error::IntegrityViolation { .. }));
    }

    #[test]
    fn wrong_issuer_key_is_rejected() {
        let issuer = TestKey::generate();
        let other = TestKey::generate();
        let holder = TestKey::generate();
        let raw = pid_credential(&issuer, &holder);
        let decoded = decode(&raw).unwrap();

        let err = verify_cose_signature(other.0.verifying_key(), &decoded.issuer_auth).unwrap_err();
        assert!(matches!(err, Error::IntegrityViolation { .. }));
    }

    #[test]
    fn device_key_binds_the_holder() {
        let issuer = TestKey::generate();
        let holder = TestKey::generate();
        let stranger = TestKey::generate();
        let raw = pid_credential(&issuer, &holder);
        let decoded = decode(&raw).unwrap();

        let err = verify_with_key(
            &decoded,
            issuer.0.verifying_key(),
            &stranger.public_jwk().unwrap(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::IntegrityViolation { .. }));
    }

    #[test]
    fn missing_mandatory_attribute_raises() {
        let issuer = TestKey::generate();
        let holder = TestKey::generate();
        let raw = pid_credential(&issuer, &holder);
        let decoded = decode(&raw).unwrap();

        let mut claims = pid_claims();
        claims.push(
            serde_json::from_value(json!({
                "path": [PID_NAMESPACE, "birth_date"],
                "mandatory": true,
                "display": []
            }))
            .unwrap(),
        );

        let err = parse(&decoded, &claims, ParseOptions::default()).unwrap_err();
        let Error::MissingMandatoryClaim { missing, received } = err else {
            panic!("expected MissingMandatoryClaim");
        };
        assert_eq!(missing, "birth_date");
        assert!(received.contains("family_name"));

        let relaxed = parse(
            &decoded,
            &claims,
            ParseOptions {
                ignore_missing_attributes: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(!relaxed
            .claims
            .contains_key("eu.europa.ec.eudi.pid.1:birth_date"));
    }

    #[test]
    fn undeclared_attributes_appear_only_on_request() {
        let issuer = TestKey::generate();
        let holder = TestKey::generate();
        let raw = pid_credential(&issuer, &holder);
        let decoded = decode(&raw).unwrap();

        let claims: Vec<ClaimMetadata> = serde_json::from_value(json!([{
            "path": [PID_NAMESPACE, "family_name"],
            "mandatory": true,
            "display": []
        }]))
        .unwrap();

        let narrow = parse(&decoded, &claims, ParseOptions::default()).unwrap();
        assert!(!narrow.claims.contains_key("eu.europa.ec.eudi.pid.1:given_name"));

        let wide = parse(
            &decoded,
            &claims,
            ParseOptions {
                include_undefined_attributes: true,
                ..Default::default()
            },
        )
        .unwrap();
        let given = &wide.claims["eu.europa.ec.eudi.pid.1:given_name"];
        assert_eq!(given.name, ClaimName::Plain("given_name".into()));
        assert!(!given.mandatory);
    }

    #[test]
    fn garbage_trust_root_is_a_validation_failure() {
        let issuer = TestKey::generate();
        let holder = TestKey::generate();
        let raw = pid_credential(&issuer, &holder);
        let decoded = decode(&raw).unwrap();

        // The fixture carries no x5chain, so chain verification cannot start.
        let err = verify(&decoded, b"not a certificate", &holder.public_jwk().unwrap()).unwrap_err();
        assert!(matches!(err, Error::ValidationFailed { .. }));
    }
}
