use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use rsa::{
    pkcs1v15::{Signature as RsaSignature, SigningKey, VerifyingKey},
    pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding},
    signature::{SignatureEncoding, Signer, Verifier},
    Oaep, RsaPrivateKey, RsaPublicKey,
};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const RSA_BITS: usize = 2048;
pub const AES_KEY_LEN: usize = 32;
pub const AES_IV_LEN: usize = 16;

/// The only algorithm tag accepted on inbound envelopes. Envelopes without a
/// tag are accepted as well; anything else is rejected before decryption.
const ENVELOPE_ALGORITHM: &str = "RSA+AES";

#[derive(Debug, thiserror::Error)]
pub enum HybridError {
    #[error("not an RSA+AES envelope: {0}")]
    InvalidEnvelope(String),
    #[error("envelope decryption failed")]
    DecryptFailed,
}

/// Long-term RSA key pair of the relay, stored in PEM form. Generated once on
/// first startup and immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RsaKeyPair {
    #[serde(rename = "publicKey")]
    pub public_key: String,
    #[serde(rename = "privateKey")]
    pub private_key: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
}

/// Wire shape of a hybrid envelope: the AES key is RSA-OAEP wrapped, the
/// payload is AES-256-CBC encrypted, all three fields base64.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    key: String,
    iv: String,
    data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    algorithm: Option<String>,
}

pub fn generate_rsa_keypair() -> eyre::Result<RsaKeyPair> {
    let private = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_BITS)?;
    let public = private.to_public_key();

    let private_pem = private.to_pkcs8_pem(LineEnding::LF)?.to_string();
    let public_pem = public.to_public_key_pem(LineEnding::LF)?;

    Ok(RsaKeyPair {
        public_key: public_pem,
        private_key: private_pem,
        created_at: chrono::Utc::now().to_rfc3339(),
    })
}

/// Encrypts `plaintext` for the holder of `public_pem`. A fresh AES key and IV
/// are drawn per call. The output is always the raw JSON envelope. This is
/// the prover side of [`decrypt_hybrid`]; the relay itself only ever opens
/// envelopes.
#[allow(dead_code)]
pub fn encrypt_hybrid(public_pem: &str, plaintext: &[u8]) -> eyre::Result<String> {
    let public = RsaPublicKey::from_public_key_pem(public_pem)?;

    let mut key = [0u8; AES_KEY_LEN];
    let mut iv = [0u8; AES_IV_LEN];
    let mut rng = rand::thread_rng();
    rng.fill_bytes(&mut key);
    rng.fill_bytes(&mut iv);

    let cipher = Aes256CbcEnc::new_from_slices(&key, &iv)
        .map_err(|e| eyre::eyre!("AES init failed: {e}"))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let wrapped_key = public.encrypt(&mut rng, Oaep::new::<Sha256>(), &key)?;

    let envelope = Envelope {
        key: BASE64.encode(wrapped_key),
        iv: BASE64.encode(iv),
        data: BASE64.encode(ciphertext),
        algorithm: None,
    };

    Ok(serde_json::to_string(&envelope)?)
}

/// Opens a hybrid envelope. Accepts the raw JSON form and a single extra
/// base64 wrapping of the same JSON. Total: every failure maps to a
/// [`HybridError`], nothing panics.
pub fn decrypt_hybrid(private_pem: &str, payload: &[u8]) -> Result<Vec<u8>, HybridError> {
    let envelope = parse_envelope(payload)?;

    if let Some(algorithm) = &envelope.algorithm {
        if algorithm != ENVELOPE_ALGORITHM {
            return Err(HybridError::InvalidEnvelope(format!(
                "unsupported algorithm tag {algorithm:?}"
            )));
        }
    }

    let wrapped_key = BASE64
        .decode(&envelope.key)
        .map_err(|_| HybridError::DecryptFailed)?;
    let iv = BASE64
        .decode(&envelope.iv)
        .map_err(|_| HybridError::DecryptFailed)?;
    let ciphertext = BASE64
        .decode(&envelope.data)
        .map_err(|_| HybridError::DecryptFailed)?;

    let private =
        RsaPrivateKey::from_pkcs8_pem(private_pem).map_err(|_| HybridError::DecryptFailed)?;
    let key = private
        .decrypt(Oaep::new::<Sha256>(), &wrapped_key)
        .map_err(|_| HybridError::DecryptFailed)?;

    let cipher =
        Aes256CbcDec::new_from_slices(&key, &iv).map_err(|_| HybridError::DecryptFailed)?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| HybridError::DecryptFailed)
}

fn parse_envelope(payload: &[u8]) -> Result<Envelope, HybridError> {
    if let Ok(envelope) = serde_json::from_slice::<Envelope>(payload) {
        return Ok(envelope);
    }

    // Interop: some publishers base64-wrap the whole JSON envelope once more.
    let text = std::str::from_utf8(payload)
        .map_err(|_| HybridError::InvalidEnvelope("not UTF-8".to_string()))?;
    let unwrapped = BASE64
        .decode(text.trim())
        .map_err(|_| HybridError::InvalidEnvelope("not a JSON or base64 envelope".to_string()))?;

    serde_json::from_slice::<Envelope>(&unwrapped)
        .map_err(|e| HybridError::InvalidEnvelope(e.to_string()))
}

/// PKCS#1 v1.5 / SHA-256 signer over the relay's long-term key, used as
/// proof-of-origin on outbound challenges.
pub struct RsaSigner {
    key: SigningKey<Sha256>,
}

impl RsaSigner {
    pub fn new(private_pem: &str) -> eyre::Result<Self> {
        let private = RsaPrivateKey::from_pkcs8_pem(private_pem)?;
        Ok(Self {
            key: SigningKey::<Sha256>::new(private),
        })
    }

    pub fn sign_b64(&self, message: &[u8]) -> String {
        BASE64.encode(self.key.sign(message).to_bytes())
    }
}

/// Counterpart of [`RsaSigner::sign_b64`]; provers run this against the
/// relay's published public key.
#[allow(dead_code)]
pub fn rsa_verify_b64(public_pem: &str, message: &[u8], signature_b64: &str) -> bool {
    let Ok(public) = RsaPublicKey::from_public_key_pem(public_pem) else {
        return false;
    };
    let Ok(raw) = BASE64.decode(signature_b64) else {
        return false;
    };
    let Ok(signature) = RsaSignature::try_from(raw.as_slice()) else {
        return false;
    };
    VerifyingKey::<Sha256>::new(public)
        .verify(message, &signature)
        .is_ok()
}

/// AES-256-CBC session helpers for the optional end-to-end challenge wrap.
pub fn aes_encrypt(key: &[u8], plaintext: &[u8]) -> Result<(String, String), HybridError> {
    let mut iv = [0u8; AES_IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let cipher = Aes256CbcEnc::new_from_slices(key, &iv).map_err(|_| HybridError::DecryptFailed)?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    Ok((BASE64.encode(iv), BASE64.encode(ciphertext)))
}

pub fn aes_decrypt(key: &[u8], iv_b64: &str, data_b64: &str) -> Result<Vec<u8>, HybridError> {
    let iv = BASE64.decode(iv_b64).map_err(|_| HybridError::DecryptFailed)?;
    let ciphertext = BASE64
        .decode(data_b64)
        .map_err(|_| HybridError::DecryptFailed)?;

    let cipher = Aes256CbcDec::new_from_slices(key, &iv).map_err(|_| HybridError::DecryptFailed)?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| HybridError::DecryptFailed)
}

#[cfg(test)]
pub(crate) fn test_keypair() -> &'static RsaKeyPair {
    use std::sync::OnceLock;
    static KEYS: OnceLock<RsaKeyPair> = OnceLock::new();
    KEYS.get_or_init(|| generate_rsa_keypair().expect("test key generation"))
}
