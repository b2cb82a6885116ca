//! This library provides the wallet side of an [OID4VCI]-style credential
//! issuance protocol: it acquires a cryptographically-bound digital
//! credential from a remote issuer and validates what it received before the
//! rest of the wallet is allowed to trust it.
//!
//! [OID4VCI]: <https://openid.net/specs/openid-4-verifiable-credential-issuance-1_0.html>
//!
//! # Flow Overview
//!
//! 1. *Pushed authorization*: the wallet signs a request object and submits
//!    it to the issuer's PAR endpoint together with its wallet attestation
//!    and a proof of possession of the attestation key, obtaining an opaque
//!    `request_uri`. See [`AuthorizationFlow::start_user_authorization`].
//! 2. *User authorization*: the user authenticates against the issuer's
//!    authorization endpoint. Depending on the credential being requested
//!    this completes with a plain redirect (`query` response mode) or with a
//!    signed form-post exchange that may require presenting an already-held
//!    credential or proving possession of a machine-readable travel document
//!    (`form_post.jwt` response mode).
//! 3. *Token exchange*: the authorization code is traded for a DPoP-bound
//!    access token. See [`authorize_access`].
//! 4. *Credential request*: the wallet fetches a fresh nonce, binds it to
//!    the future holder key with one or more proof JWTs, and requests the
//!    credential. See [`obtain_credential`].
//! 5. *Verification*: the raw credential (SD-JWT or ISO mdoc) is verified
//!    against the issuer's keys, checked for holder binding, and parsed into
//!    a claim tree under the issuer's claim metadata. See
//!    [`verify_and_parse_credential`].
//!
//! # Capabilities
//!
//! The engine owns no keys and opens no sockets of its own. Everything
//! environment-specific is a capability trait supplied by the caller:
//!
//! - [`KeyBinding`]: an opaque signing capability over a device-held key;
//!   private material never crosses the trait boundary.
//! - [`EphemeralKeys`]: generation and guaranteed deletion of single-use
//!   keys, scoped by [`with_ephemeral_key`].
//! - [`AsyncHttpClient`]: the transport, with a [`ReqwestClient`] default.
//! - [`CredentialPresenter`]: the out-of-scope presentation flow invoked
//!   when the issuer asks for an already-held credential during
//!   authorization.
//!
//! The engine is stateless between calls and holds no shared mutable state
//! across flows; independent acquisitions may run fully in parallel. Nothing
//! here is retried: every failure is terminal and surfaces as a structured
//! [`Error`] for the caller to act on.
//!
//! [`KeyBinding`]: crate::core::crypto::KeyBinding
//! [`EphemeralKeys`]: crate::core::crypto::EphemeralKeys
//! [`with_ephemeral_key`]: crate::core::crypto::with_ephemeral_key
//! [`AsyncHttpClient`]: crate::core::util::AsyncHttpClient
//! [`ReqwestClient`]: crate::core::util::ReqwestClient
//! [`CredentialPresenter`]: crate::core::authorization::CredentialPresenter
//! [`AuthorizationFlow::start_user_authorization`]: crate::core::authorization::AuthorizationFlow::start_user_authorization
//! [`authorize_access`]: crate::core::token::authorize_access
//! [`obtain_credential`]: crate::core::credential::obtain_credential
//! [`verify_and_parse_credential`]: crate::core::verifier::verify_and_parse_credential
//! [`Error`]: crate::error::Error

pub mod core;
pub mod error;

pub use error::{Error, IssuerResponseCode};
