use alloy::{
    hex,
    primitives::{Address, PrimitiveSignature, B256},
};

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("signature must be 65 hex-encoded bytes")]
    Malformed,
    #[error("signer recovery failed")]
    Recovery,
}

/// Parses a 65-byte hex signature as announced on the wire. Wallets emit the
/// recovery byte as 27/28; alloy wants 0/1.
pub fn parse_signature(sig_hex: &str) -> Result<PrimitiveSignature, SignatureError> {
    let mut raw = hex::decode(sig_hex.trim_start_matches("0x"))
        .map_err(|_| SignatureError::Malformed)?;
    if raw.len() != 65 {
        return Err(SignatureError::Malformed);
    }
    if raw[64] >= 27 {
        raw[64] -= 27;
    }
    PrimitiveSignature::try_from(raw.as_slice()).map_err(|_| SignatureError::Malformed)
}

/// Recovers the Ethereum address that personal-signed `message` (EIP-191:
/// keccak over `"\x19Ethereum Signed Message:\n" + len + message`).
pub fn recover_personal(
    message: &[u8],
    signature: &PrimitiveSignature,
) -> Result<Address, SignatureError> {
    signature
        .recover_address_from_msg(message)
        .map_err(|_| SignatureError::Recovery)
}

/// Address of the contract deployed by `deployer` with the CREATE opcode at
/// the given account nonce.
pub fn address_from_create(deployer: Address, nonce: u64) -> Address {
    deployer.create(nonce)
}

/// Address of the contract deployed by `deployer` with CREATE2:
/// `keccak(0xff ++ deployer ++ salt ++ init_code_hash)[12..]`.
pub fn address_from_create2(deployer: Address, salt: B256, init_code_hash: B256) -> Address {
    deployer.create2(salt, init_code_hash)
}

pub fn parse_b256(value: &str) -> Option<B256> {
    let raw = hex::decode(value.trim_start_matches("0x")).ok()?;
    if raw.len() != 32 {
        return None;
    }
    Some(B256::from_slice(&raw))
}

/// Lowercase `0x`-prefixed rendering used for all route-table keys and
/// address comparisons.
pub fn lowercase_address(address: Address) -> String {
    format!("0x{}", hex::encode(address.as_slice()))
}
