//! Announcement builders shared by validator and admission tests: they play
//! the prover side, deriving an owned contract address and signing the
//! canonical route string with a local wallet.

use alloy::{
    hex,
    primitives::keccak256,
    signers::{local::PrivateKeySigner, SignerSync},
};

use crate::crypto::ecdsa::{address_from_create, address_from_create2, lowercase_address};
use crate::routes::{RouteAnnouncement, PROOF_TYPE_CREATE, PROOF_TYPE_CREATE2};

pub(crate) fn signed_create_route(
    wallet: &PrivateKeySigner,
    nonce: u64,
    url: &str,
) -> RouteAnnouncement {
    let addr = lowercase_address(address_from_create(wallet.address(), nonce));
    let mut route = RouteAnnouncement {
        addr: Some(addr),
        proof_type: Some(PROOF_TYPE_CREATE.to_string()),
        nonce: Some(nonce),
        url: Some(url.to_string()),
        ..Default::default()
    };
    sign_route(wallet, &mut route);
    route
}

pub(crate) fn signed_create2_route(
    wallet: &PrivateKeySigner,
    salt: [u8; 32],
    init_code: &[u8],
    url: &str,
) -> RouteAnnouncement {
    let init_code_hash = keccak256(init_code);
    let derived = address_from_create2(wallet.address(), salt.into(), init_code_hash);
    let mut route = RouteAnnouncement {
        addr: Some(lowercase_address(derived)),
        proof_type: Some(PROOF_TYPE_CREATE2.to_string()),
        salt: Some(format!("0x{}", hex::encode(salt))),
        init_code_hash: Some(format!("0x{}", hex::encode(init_code_hash))),
        url: Some(url.to_string()),
        ..Default::default()
    };
    sign_route(wallet, &mut route);
    route
}

pub(crate) fn sign_route(wallet: &PrivateKeySigner, route: &mut RouteAnnouncement) {
    let payload = route.signing_payload().expect("signable route");
    let signature = wallet.sign_message_sync(payload.as_bytes()).unwrap();
    route.sig = Some(format!("0x{}", hex::encode(signature.as_bytes())));
}
