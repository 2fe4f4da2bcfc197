use std::time::Duration;

use alloy::{hex, primitives::Address};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::crypto::ecdsa::{parse_signature, recover_personal};
use crate::crypto::hybrid::{aes_decrypt, aes_encrypt, RsaSigner, AES_KEY_LEN};
use crate::routes::validator::ValidRoute;

pub const CHALLENGE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ChallengeError {
    #[error("challenge request failed: {0}")]
    HttpError(String),
    #[error("challenge request timed out")]
    Timeout,
    #[error("malformed challenge response: {0}")]
    BadResponseFormat(String),
    #[error("response does not echo the challenge id")]
    ChallengeIdMismatch,
    #[error("response not signed by the announcement signer")]
    BadResponseSignature,
}

impl ChallengeError {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::HttpError(_) => "HttpError",
            Self::Timeout => "Timeout",
            Self::BadResponseFormat(_) => "BadResponseFormat",
            Self::ChallengeIdMismatch => "ChallengeIdMismatch",
            Self::BadResponseSignature => "BadResponseSignature",
        }
    }
}

/// What the prover has to sign. The canonical bytes are the JSON encoding of
/// this struct in declared field order; both sides serialise the same struct,
/// so the bytes match without a separate canonicaliser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Challenge {
    #[serde(rename = "challengeId")]
    pub challenge_id: String,
    pub url: String,
    #[serde(rename = "contractAddress")]
    pub contract_address: String,
    pub nonce: String,
    #[serde(rename = "issuedAt")]
    pub issued_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChallengePayload {
    pub challenge: Challenge,
    /// PKCS#1 v1.5 / SHA-256 signature over the canonical challenge bytes by
    /// the relay's RSA key, so the prover knows who is asking.
    pub signature: String,
}

#[derive(Debug, Deserialize)]
struct ChallengeResponse {
    #[serde(rename = "challengeId")]
    challenge_id: String,
    signature: String,
    #[serde(default)]
    #[allow(dead_code)]
    status: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AesEnvelope {
    pub iv: String,
    pub data: String,
}

/// Issues liveness challenges to candidate route URLs. One engine per relay;
/// per-call state stays on the stack so concurrent challenges do not share
/// anything.
pub struct ChallengeEngine {
    http: reqwest::Client,
    rsa: RsaSigner,
}

impl ChallengeEngine {
    pub fn new(private_pem: &str) -> eyre::Result<Self> {
        Ok(Self {
            http: reqwest::ClientBuilder::new()
                .user_agent("route-relay")
                .build()?,
            rsa: RsaSigner::new(private_pem)?,
        })
    }

    /// Single round-trip, no retries: POSTs a signed challenge to
    /// `url + "/challenge"` and requires the response to echo the challenge
    /// id and carry a personal-sign signature by `signer` over the exact
    /// challenge bytes.
    pub async fn challenge(
        &self,
        route: &ValidRoute,
        signer: Address,
    ) -> Result<(), ChallengeError> {
        let challenge = Challenge {
            challenge_id: random_hex(16),
            url: route.url.clone(),
            contract_address: route.addr.clone(),
            nonce: random_hex(32),
            issued_at: chrono::Utc::now().to_rfc3339(),
        };
        let canonical = serde_json::to_string(&challenge).expect("challenge serialization");
        let payload = ChallengePayload {
            signature: self.rsa.sign_b64(canonical.as_bytes()),
            challenge,
        };

        let session_key = route.aes_key.as_deref().and_then(decode_session_key);

        let request = self
            .http
            .post(format!("{}/challenge", route.url.trim_end_matches('/')))
            .timeout(CHALLENGE_TIMEOUT);
        let request = match &session_key {
            Some(key) => {
                let plain = serde_json::to_vec(&payload).expect("payload serialization");
                let (iv, data) = aes_encrypt(key, &plain)
                    .map_err(|e| ChallengeError::BadResponseFormat(e.to_string()))?;
                request.json(&AesEnvelope { iv, data })
            }
            None => request.json(&payload),
        };

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ChallengeError::Timeout
            } else {
                ChallengeError::HttpError(e.to_string())
            }
        })?;
        if !response.status().is_success() {
            return Err(ChallengeError::HttpError(format!(
                "status {}",
                response.status()
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| ChallengeError::HttpError(e.to_string()))?;

        let parsed = parse_response(&body, session_key.as_deref())?;

        if parsed.challenge_id != payload.challenge.challenge_id {
            return Err(ChallengeError::ChallengeIdMismatch);
        }

        let signature = parse_signature(&parsed.signature)
            .map_err(|_| ChallengeError::BadResponseFormat("signature field".to_string()))?;
        let recovered = recover_personal(canonical.as_bytes(), &signature)
            .map_err(|_| ChallengeError::BadResponseSignature)?;
        if recovered != signer {
            debug!(%recovered, expected = %signer, "challenge response signer mismatch");
            return Err(ChallengeError::BadResponseSignature);
        }

        Ok(())
    }
}

/// The return path is tried AES-wrapped first when a session is active, then
/// plain; provers are allowed to answer either way.
fn parse_response(body: &[u8], session_key: Option<&[u8]>) -> Result<ChallengeResponse, ChallengeError> {
    if let Some(key) = session_key {
        if let Ok(envelope) = serde_json::from_slice::<AesEnvelope>(body) {
            if let Ok(plain) = aes_decrypt(key, &envelope.iv, &envelope.data) {
                if let Ok(response) = serde_json::from_slice::<ChallengeResponse>(&plain) {
                    return Ok(response);
                }
            }
        }
    }
    serde_json::from_slice::<ChallengeResponse>(body)
        .map_err(|e| ChallengeError::BadResponseFormat(e.to_string()))
}

fn decode_session_key(aes_key_b64: &str) -> Option<Vec<u8>> {
    match BASE64.decode(aes_key_b64) {
        Ok(key) if key.len() == AES_KEY_LEN => Some(key),
        Ok(_) | Err(_) => {
            warn!("announced AES session key is unusable, continuing unwrapped");
            None
        }
    }
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}
