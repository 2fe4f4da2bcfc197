pub mod validator;

#[cfg(test)]
pub(crate) mod testutil;

use serde::{Deserialize, Serialize};

pub const PROOF_TYPE_CREATE: &str = "create";
pub const PROOF_TYPE_CREATE2: &str = "create2";

/// Decrypted announcement payload: `{"routes": [...]}`. Anything else on the
/// topic that decrypts but does not carry a routes array is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct Announcement {
    pub routes: Vec<RouteAnnouncement>,
}

/// One announced route. All fields are optional at the wire level; the
/// validator enforces which ones a given proof type requires.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteAnnouncement {
    pub addr: Option<String>,
    #[serde(rename = "proofType")]
    pub proof_type: Option<String>,
    pub url: Option<String>,
    pub sig: Option<String>,
    pub nonce: Option<u64>,
    pub salt: Option<String>,
    #[serde(rename = "initCodeHash")]
    pub init_code_hash: Option<String>,
    /// Optional per-route AES-256 session key (base64), announced when the
    /// prover wants the challenge exchange wrapped end-to-end.
    #[serde(rename = "aesKey")]
    pub aes_key: Option<String>,
}

impl RouteAnnouncement {
    /// The exact string the prover personal-signed for this route: the
    /// concatenation of `addr`, `proofType`, the proof parameter (decimal
    /// nonce for CREATE, the salt as announced for CREATE2) and `url`, with
    /// no separators. Byte-for-byte layout; any deviation breaks recovery.
    pub fn signing_payload(&self) -> Option<String> {
        let addr = self.addr.as_deref()?;
        let proof_type = self.proof_type.as_deref()?;
        let url = self.url.as_deref()?;
        let proof_param = match proof_type {
            PROOF_TYPE_CREATE => self.nonce?.to_string(),
            PROOF_TYPE_CREATE2 => self.salt.clone()?,
            _ => return None,
        };
        Some(format!("{addr}{proof_type}{proof_param}{url}"))
    }
}

pub fn parse_announcement(plaintext: &[u8]) -> Option<Announcement> {
    serde_json::from_slice(plaintext).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_routes_array() {
        let payload = br#"{"routes":[{"addr":"0xabc","proofType":"create","nonce":7,"url":"http://p:7546","sig":"0x00"}]}"#;
        let announcement = parse_announcement(payload).unwrap();
        assert_eq!(announcement.routes.len(), 1);
        assert_eq!(announcement.routes[0].nonce, Some(7));
    }

    #[test]
    fn ignores_other_json_shapes() {
        assert!(parse_announcement(b"{\"hello\":1}").is_none());
        assert!(parse_announcement(b"[1,2,3]").is_none());
        assert!(parse_announcement(b"not json").is_none());
    }

    #[test]
    fn signing_payload_layout_is_exact() {
        let route = RouteAnnouncement {
            addr: Some("0xCbd".to_string()),
            proof_type: Some("create".to_string()),
            nonce: Some(33),
            url: Some("http://p:7546".to_string()),
            sig: Some("0x00".to_string()),
            ..Default::default()
        };
        assert_eq!(route.signing_payload().unwrap(), "0xCbdcreate33http://p:7546");

        let route = RouteAnnouncement {
            addr: Some("0xCbd".to_string()),
            proof_type: Some("create2".to_string()),
            salt: Some("0x11".to_string()),
            url: Some("http://p:7546".to_string()),
            ..Default::default()
        };
        assert_eq!(route.signing_payload().unwrap(), "0xCbdcreate20x11http://p:7546");
    }

    #[test]
    fn signing_payload_requires_proof_parameter() {
        let route = RouteAnnouncement {
            addr: Some("0xCbd".to_string()),
            proof_type: Some("create".to_string()),
            url: Some("http://p:7546".to_string()),
            ..Default::default()
        };
        assert!(route.signing_payload().is_none());
    }
}
