use alloy::primitives::Address;
use tracing::debug;

use crate::crypto::ecdsa::{
    address_from_create, address_from_create2, lowercase_address, parse_b256, parse_signature,
    recover_personal,
};
use crate::routes::{Announcement, RouteAnnouncement, PROOF_TYPE_CREATE, PROOF_TYPE_CREATE2};

/// Why a single route was rejected. Closed set; the tag is what gets reported
/// back to the prover in the failure confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RouteRejection {
    #[error("a required field for this proof type is missing or malformed")]
    MissingField,
    #[error("unknown proof type")]
    UnknownProofType,
    #[error("signature does not recover to any signer")]
    BadSignature,
    #[error("route signed by a different wallet than the announcement signer")]
    InconsistentSigner,
    #[error("announced address is not a deployment of the signer")]
    InvalidOwnership,
}

impl RouteRejection {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::MissingField => "MissingField",
            Self::UnknownProofType => "UnknownProofType",
            Self::BadSignature => "BadSignature",
            Self::InconsistentSigner => "InconsistentSigner",
            Self::InvalidOwnership => "InvalidOwnership",
        }
    }
}

/// A route that passed field, signature and ownership checks and is ready to
/// be challenged.
#[derive(Debug, Clone)]
pub struct ValidRoute {
    /// Lowercase `0x` contract address, the eventual route-table key.
    pub addr: String,
    pub url: String,
    pub aes_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RejectedRoute {
    pub addr: Option<String>,
    pub url: Option<String>,
    pub reason: RouteRejection,
}

#[derive(Debug, Default)]
pub struct Validation {
    pub valid: Vec<ValidRoute>,
    pub invalid: Vec<RejectedRoute>,
    /// The announcement signer, fixed by the first route whose signature
    /// recovers. All later routes must be signed by the same wallet.
    pub signer: Option<Address>,
}

/// Checks every route of an announcement independently. A failing route lands
/// in `invalid` with its tag and never blocks its siblings.
pub fn validate(announcement: &Announcement) -> Validation {
    let mut outcome = Validation::default();

    for route in &announcement.routes {
        match check_route(route, &mut outcome.signer) {
            Ok(valid) => outcome.valid.push(valid),
            Err(reason) => {
                debug!(addr = ?route.addr, ?reason, "rejecting announced route");
                outcome.invalid.push(RejectedRoute {
                    addr: route.addr.clone(),
                    url: route.url.clone(),
                    reason,
                });
            }
        }
    }

    outcome
}

fn check_route(
    route: &RouteAnnouncement,
    announcement_signer: &mut Option<Address>,
) -> Result<ValidRoute, RouteRejection> {
    let addr = route.addr.as_deref().ok_or(RouteRejection::MissingField)?;
    let proof_type = route
        .proof_type
        .as_deref()
        .ok_or(RouteRejection::MissingField)?;
    let url = route.url.as_deref().ok_or(RouteRejection::MissingField)?;
    let sig = route.sig.as_deref().ok_or(RouteRejection::MissingField)?;

    match proof_type {
        PROOF_TYPE_CREATE => {
            route.nonce.ok_or(RouteRejection::MissingField)?;
        }
        PROOF_TYPE_CREATE2 => {
            route.salt.as_deref().ok_or(RouteRejection::MissingField)?;
            route
                .init_code_hash
                .as_deref()
                .ok_or(RouteRejection::MissingField)?;
        }
        _ => return Err(RouteRejection::UnknownProofType),
    }

    let payload = route
        .signing_payload()
        .ok_or(RouteRejection::MissingField)?;
    let signature = parse_signature(sig).map_err(|_| RouteRejection::BadSignature)?;
    let signer =
        recover_personal(payload.as_bytes(), &signature).map_err(|_| RouteRejection::BadSignature)?;

    // The first recoverable route fixes the announcement signer.
    match announcement_signer {
        Some(existing) if *existing != signer => return Err(RouteRejection::InconsistentSigner),
        Some(_) => {}
        None => *announcement_signer = Some(signer),
    }

    let derived = match proof_type {
        PROOF_TYPE_CREATE => {
            let nonce = route.nonce.ok_or(RouteRejection::MissingField)?;
            address_from_create(signer, nonce)
        }
        _ => {
            let salt = route
                .salt
                .as_deref()
                .and_then(parse_b256)
                .ok_or(RouteRejection::MissingField)?;
            let init_code_hash = route
                .init_code_hash
                .as_deref()
                .and_then(parse_b256)
                .ok_or(RouteRejection::MissingField)?;
            address_from_create2(signer, salt, init_code_hash)
        }
    };

    let claimed = addr.trim_start_matches("0x").to_lowercase();
    let derived_lower = lowercase_address(derived);
    if derived_lower.trim_start_matches("0x") != claimed {
        return Err(RouteRejection::InvalidOwnership);
    }

    Ok(ValidRoute {
        addr: derived_lower,
        url: url.to_string(),
        aes_key: route.aes_key.clone(),
    })
}
