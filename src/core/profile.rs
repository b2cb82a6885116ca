//! Protocol profile parameterization.
//!
//! Issuers in the field speak one of two profile revisions. The differences
//! are mechanical (where the wallet attestation travels, how credential
//! proofs are shaped, what the PAR request object is addressed to), so they
//! are captured as data here rather than branched on throughout the flow.

use url::Url;

/// How the wallet attestation and its proof-of-possession reach the issuer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttestationTransport {
    /// `client_assertion` and `client_assertion_type` form fields, the
    /// attestation and PoP joined with `~`.
    FormFields,
    /// `OAuth-Client-Attestation` and `OAuth-Client-Attestation-PoP`
    /// HTTP headers.
    Headers,
}

/// Shape of the proof section in a credential request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofShape {
    /// A single `proof: {proof_type, jwt}` object.
    Single,
    /// A `proofs: {jwt: [..]}` array sized to the issuer's batch limit.
    Batch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParAudience {
    /// The origin of the PAR endpoint itself.
    ParEndpointOrigin,
    /// The issuer identifier (`credential_issuer`).
    CredentialIssuer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolProfile {
    pub attestation_transport: AttestationTransport,
    pub proof_shape: ProofShape,
    pub par_audience: ParAudience,
}

pub const CLIENT_ASSERTION_TYPE: &str =
    "urn:ietf:params:oauth:client-assertion-type:jwt-client-attestation";

impl ProtocolProfile {
    /// The earlier profile revision still deployed by some issuers.
    pub const fn legacy() -> Self {
        Self {
            attestation_transport: AttestationTransport::FormFields,
            proof_shape: ProofShape::Single,
            par_audience: ParAudience::ParEndpointOrigin,
        }
    }

    /// The current profile revision.
    pub const fn current() -> Self {
        Self {
            attestation_transport: AttestationTransport::Headers,
            proof_shape: ProofShape::Batch,
            par_audience: ParAudience::CredentialIssuer,
        }
    }

    /// The audience the PAR request object is addressed to.
    pub(crate) fn par_audience_value(&self, par_endpoint: &Url, credential_issuer: &Url) -> String {
        match self.par_audience {
            ParAudience::ParEndpointOrigin => par_endpoint.origin().ascii_serialization(),
            ParAudience::CredentialIssuer => credential_issuer.as_str().trim_end_matches('/').to_owned(),
        }
    }

    /// Attach the wallet attestation and its PoP to an outgoing request,
    /// either as headers or as form fields depending on the profile.
    pub(crate) fn attach_attestation(
        &self,
        builder: http::request::Builder,
        form: &mut Vec<(&'static str, String)>,
        attestation: &str,
        pop: &str,
    ) -> http::request::Builder {
        match self.attestation_transport {
            AttestationTransport::Headers => builder
                .header("OAuth-Client-Attestation", attestation)
                .header("OAuth-Client-Attestation-PoP", pop),
            AttestationTransport::FormFields => {
                form.push(("client_assertion_type", CLIENT_ASSERTION_TYPE.to_owned()));
                form.push(("client_assertion", format!("{attestation}~{pop}")));
                builder
            }
        }
    }
}
