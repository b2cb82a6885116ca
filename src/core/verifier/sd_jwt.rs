//! SD-JWT decode, verification and selective-disclosure parsing.
//!
//! A raw credential is `jwt~disclosure~disclosure~…~`; each disclosure is
//! a base64url JSON triple `[salt, name, value]` (or `[salt, value]` for
//! array elements) referenced from the payload by the base64url SHA-256
//! digest of its encoded form, through `_sd` arrays for object keys and
//! `{"...": digest}` markers for array elements.

use std::collections::{BTreeMap, HashMap, HashSet};

use base64::prelude::*;
use serde_json::{Map, Value as Json};
use sha2::{Digest, Sha256};

use crate::core::crypto::{decode_part, split_jws, verify_compact_jws, Es256Verifier, Jwk};
use crate::core::metadata::{ClaimMetadata, ClaimPathSegment, JwkSet};
use crate::core::verifier::{ClaimName, ParseOptions, ParsedClaim, ParsedCredential};
use crate::error::Error;

/// A single selectively-disclosable claim blob.
#[derive(Debug, Clone)]
pub struct Disclosure {
    pub encoded: String,
    /// base64url(SHA-256(encoded)), the reference key inside the payload.
    pub digest: String,
    pub salt: String,
    /// `None` for array-element disclosures.
    pub name: Option<String>,
    pub value: Json,
}

#[derive(Debug, Clone)]
pub struct DecodedSdJwt {
    pub jwt: String,
    pub header: Json,
    pub payload: Json,
    pub disclosures: Vec<Disclosure>,
}

fn decode_disclosure(encoded: &str) -> Result<Disclosure, Error> {
    let digest = BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(encoded.as_bytes()));
    let bytes = BASE64_URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| Error::validation_with("disclosure is not base64url", e))?;
    let array: Vec<Json> = serde_json::from_slice(&bytes)
        .map_err(|e| Error::validation_with("disclosure is not a JSON array", e))?;

    let (salt, name, value) = match array.as_slice() {
        [salt, name, value] => (salt, Some(name), value),
        [salt, value] => (salt, None, value),
        _ => return Err(Error::validation("disclosure has an unexpected arity")),
    };
    let salt = salt
        .as_str()
        .ok_or_else(|| Error::validation("disclosure salt is not a string"))?
        .to_owned();
    let name = match name {
        Some(name) => Some(
            name.as_str()
                .ok_or_else(|| Error::validation("disclosure name is not a string"))?
                .to_owned(),
        ),
        None => None,
    };

    Ok(Disclosure {
        encoded: encoded.to_owned(),
        digest,
        salt,
        name,
        value: value.clone(),
    })
}

/// Collect every digest declared in `value`, at any nesting level: `_sd`
/// arrays and `{"...": digest}` array markers.
fn collect_declared_digests(value: &Json, out: &mut HashSet<String>) {
    match value {
        Json::Object(map) => {
            for (key, inner) in map {
                match (key.as_str(), inner) {
                    ("_sd", Json::Array(digests)) => {
                        out.extend(digests.iter().filter_map(|d| d.as_str().map(str::to_owned)));
                    }
                    ("...", Json::String(digest)) => {
                        out.insert(digest.clone());
                    }
                    _ => collect_declared_digests(inner, out),
                }
            }
        }
        Json::Array(items) => {
            for item in items {
                collect_declared_digests(item, out);
            }
        }
        _ => {}
    }
}

/// Split and decode a raw SD-JWT. Every disclosure's digest must be
/// declared somewhere in the credential, else the disclosure cannot be
/// trusted and decoding fails.
pub fn decode(raw: &str) -> Result<DecodedSdJwt, Error> {
    let mut segments = raw.split('~');
    let jwt = segments
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::validation("credential is empty"))?
        .to_owned();
    let disclosures = segments
        // A trailing key-binding JWT is not a disclosure.
        .filter(|s| !s.is_empty() && !s.contains('.'))
        .map(decode_disclosure)
        .collect::<Result<Vec<_>, _>>()?;

    let (header, payload, _) = split_jws(&jwt)?;
    let header: Json = decode_part(header)?;
    let payload: Json = decode_part(payload)?;

    let mut declared = HashSet::new();
    collect_declared_digests(&payload, &mut declared);
    for disclosure in &disclosures {
        collect_declared_digests(&disclosure.value, &mut declared);
    }
    for disclosure in &disclosures {
        if !declared.contains(&disclosure.digest) {
            return Err(Error::integrity(format!(
                "disclosure digest {} is not declared by the credential",
                disclosure.digest
            )));
        }
    }

    Ok(DecodedSdJwt {
        jwt,
        header,
        payload,
        disclosures,
    })
}

/// Verify the issuer signature against the issuer JWKS (kid-matched) and
/// the holder binding against the requesting key.
pub fn verify(decoded: &DecodedSdJwt, issuer_jwks: &JwkSet, holder_jwk: &Jwk) -> Result<(), Error> {
    let kid = decoded.header["kid"]
        .as_str()
        .ok_or_else(|| Error::validation("credential header has no kid"))?;
    let issuer_key = issuer_jwks
        .find(kid)
        .ok_or_else(|| Error::integrity(format!("no issuer key matches kid {kid}")))?;
    let verifier = Es256Verifier::from_jwk(issuer_key)
        .map_err(|e| Error::validation_with("issuer key is not usable", format!("{e:#}")))?;
    verify_compact_jws::<Json, _>(&decoded.jwt, &verifier)?;

    let bound_key: Jwk = serde_json::from_value(decoded.payload["cnf"]["jwk"].clone())
        .map_err(|e| Error::validation_with("credential carries no cnf.jwk", e))?;
    if bound_key.thumbprint() != holder_jwk.thumbprint() {
        return Err(Error::integrity(
            "holder binding mismatch: the credential is bound to a different key",
        ));
    }
    Ok(())
}

/// Resolve every digest reference reachable from the payload into its
/// disclosed value. Disclosures are looked up through a digest map, so
/// resolution is linear in the credential size.
fn resolve(value: &Json, by_digest: &HashMap<&str, &Disclosure>) -> Json {
    match value {
        Json::Object(map) => {
            let mut out = Map::new();
            for (key, inner) in map {
                match (key.as_str(), inner) {
                    ("_sd", Json::Array(digests)) => {
                        for digest in digests.iter().filter_map(Json::as_str) {
                            if let Some(disclosure) = by_digest.get(digest) {
                                if let Some(name) = &disclosure.name {
                                    out.insert(name.clone(), resolve(&disclosure.value, by_digest));
                                }
                            }
                        }
                    }
                    ("_sd_alg", _) => {}
                    _ => {
                        out.insert(key.clone(), resolve(inner, by_digest));
                    }
                }
            }
            Json::Object(out)
        }
        Json::Array(items) => Json::Array(
            items
                .iter()
                .filter_map(|item| {
                    if let Some(digest) = item.get("...").and_then(Json::as_str) {
                        // Undisclosed array elements stay undisclosed.
                        return by_digest
                            .get(digest)
                            .map(|d| resolve(&d.value, by_digest));
                    }
                    Some(resolve(item, by_digest))
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

fn path_matches(metadata_path: &[ClaimPathSegment], path: &[ClaimPathSegment]) -> bool {
    metadata_path == path
}

fn is_prefix(prefix: &[ClaimPathSegment], path: &[ClaimPathSegment]) -> bool {
    path.len() >= prefix.len() && &path[..prefix.len()] == prefix
}

fn display_for(claims: &[ClaimMetadata], path: &[ClaimPathSegment]) -> Option<BTreeMap<String, String>> {
    claims
        .iter()
        .find(|c| path_matches(&c.path, path))
        .map(ClaimMetadata::localized_names)
}

fn name_json(names: Option<BTreeMap<String, String>>, key: &str) -> Json {
    match names {
        Some(names) => serde_json::to_value(names).unwrap_or_else(|_| Json::String(key.to_owned())),
        None => Json::String(key.to_owned()),
    }
}

/// Build the `{name, value}` tree for one nesting level, mirroring the
/// claim metadata structure.
fn process_level(
    data: &Json,
    path: &mut Vec<ClaimPathSegment>,
    claims: &[ClaimMetadata],
    include_undefined: bool,
) -> Json {
    match data {
        Json::Array(items) => {
            path.push(ClaimPathSegment::All);
            let out = Json::Array(
                items
                    .iter()
                    .map(|item| process_level(item, path, claims, include_undefined))
                    .collect(),
            );
            path.pop();
            out
        }
        Json::Object(map) => {
            let mut out = Map::new();
            let mut processed = HashSet::new();

            for claim in claims {
                if !is_prefix(path, &claim.path) || claim.path.len() == path.len() {
                    continue;
                }
                let ClaimPathSegment::Key(key) = &claim.path[path.len()] else {
                    continue;
                };
                if processed.contains(key.as_str()) {
                    continue;
                }
                let Some(value) = map.get(key) else {
                    continue;
                };

                path.push(ClaimPathSegment::Key(key.clone()));
                let mut names = display_for(claims, path);
                if names.is_none() && value.is_array() {
                    path.push(ClaimPathSegment::All);
                    names = display_for(claims, path);
                    path.pop();
                }
                let entry = serde_json::json!({
                    "name": name_json(names, key),
                    "value": process_level(value, path, claims, include_undefined),
                });
                path.pop();

                out.insert(key.clone(), entry);
                processed.insert(key.clone());
            }

            if include_undefined {
                for (key, value) in map {
                    if !processed.contains(key.as_str()) {
                        out.insert(
                            key.clone(),
                            serde_json::json!({"name": key, "value": value}),
                        );
                    }
                }
            }
            Json::Object(out)
        }
        other => other.clone(),
    }
}

/// Parse a decoded credential against its claim metadata.
pub fn parse(
    decoded: &DecodedSdJwt,
    claims: &[ClaimMetadata],
    options: ParseOptions,
) -> Result<ParsedCredential, Error> {
    let by_digest: HashMap<&str, &Disclosure> = decoded
        .disclosures
        .iter()
        .map(|d| (d.digest.as_str(), d))
        .collect();
    let resolved = resolve(&decoded.payload, &by_digest);
    let resolved_map = resolved
        .as_object()
        .ok_or_else(|| Error::validation("credential payload is not an object"))?;

    if !options.ignore_missing_attributes {
        let mut missing = Vec::new();
        for claim in claims {
            if !claim.mandatory {
                continue;
            }
            let Some(ClaimPathSegment::Key(root)) = claim.path.first() else {
                continue;
            };
            if !resolved_map.contains_key(root) && !missing.contains(root) {
                missing.push(root.clone());
            }
        }
        if !missing.is_empty() {
            return Err(Error::MissingMandatoryClaim {
                missing: missing.join(", "),
                received: resolved_map
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }
    }

    let mut path = Vec::new();
    let tree = process_level(&resolved, &mut path, claims, options.include_undefined_attributes);
    let tree = match tree {
        Json::Object(map) => map,
        _ => Map::new(),
    };

    let mut parsed = BTreeMap::new();
    for (key, wrapper) in tree {
        let name = match &wrapper["name"] {
            Json::Object(names) => ClaimName::Localized(
                names
                    .iter()
                    .filter_map(|(locale, n)| Some((locale.clone(), n.as_str()?.to_owned())))
                    .collect(),
            ),
            _ => ClaimName::Plain(key.clone()),
        };
        let mandatory = claims.iter().any(|c| {
            c.mandatory && matches!(c.path.first(), Some(ClaimPathSegment::Key(root)) if *root == key)
        });
        parsed.insert(
            key,
            ParsedClaim {
                value: wrapper["value"].clone(),
                name,
                mandatory,
            },
        );
    }

    let expiration = decoded.payload["exp"]
        .as_i64()
        .ok_or_else(|| Error::validation("credential carries no exp claim"))?;

    Ok(ParsedCredential {
        claims: parsed,
        expiration: Some(expiration),
        issued_at: decoded.payload["iat"].as_i64(),
    })
}
