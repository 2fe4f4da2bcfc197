pub mod challenge;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::crypto::ecdsa::lowercase_address;
use crate::crypto::hybrid::{decrypt_hybrid, RsaKeyPair};
use crate::metrics::RelayMetrics;
use crate::routes::validator::{validate, ValidRoute};
use crate::routes::parse_announcement;
use crate::store::{RouteStore, StoreError};
use crate::topic::TopicMessage;
use challenge::{ChallengeEngine, ChallengeError};

const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs one reassembled log message through the admission pipeline:
/// decrypt, parse, validate, challenge, commit, confirm. Every route is
/// handled in isolation; one failing route never blocks its siblings.
pub struct AdmissionCoordinator {
    store: Arc<RouteStore>,
    engine: ChallengeEngine,
    http: reqwest::Client,
    keys: RsaKeyPair,
}

/// Outbound per-route notification, POSTed to `url + "/confirmation"`.
#[derive(Debug, Serialize)]
struct Confirmation<'a> {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    addr: Option<&'a str>,
    url: &'a str,
    timestamp: String,
    #[serde(rename = "originalSigner", skip_serializing_if = "Option::is_none")]
    original_signer: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
}

impl AdmissionCoordinator {
    pub fn new(store: Arc<RouteStore>) -> eyre::Result<Self> {
        let keys = store.keypair();
        Ok(Self {
            engine: ChallengeEngine::new(&keys.private_key)?,
            http: reqwest::ClientBuilder::new()
                .user_agent("route-relay")
                .build()?,
            store,
            keys,
        })
    }

    /// Admits one message. Infallible except for store writes: a message
    /// that is not for us, carries no routes, or whose routes all fail is
    /// still a completed admission.
    pub async fn admit(&self, message: TopicMessage) -> Result<(), StoreError> {
        let seq = message.sequence_number;

        let plaintext = match decrypt_hybrid(&self.keys.private_key, &message.payload) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                debug!(seq, %err, "log message is not addressed to this relay");
                return Ok(());
            }
        };

        let Some(announcement) = parse_announcement(&plaintext) else {
            debug!(seq, "decrypted payload carries no routes array");
            return Ok(());
        };
        RelayMetrics::increment_announcements_count();
        info!(seq, routes = announcement.routes.len(), "processing route announcement");

        let outcome = validate(&announcement);
        let signer_hex = outcome.signer.map(lowercase_address);

        for rejected in &outcome.invalid {
            RelayMetrics::increment_rejected_routes_count(rejected.reason.tag());
            if let Some(url) = &rejected.url {
                self.send_confirmation(
                    url,
                    &Confirmation {
                        status: "failed",
                        addr: rejected.addr.as_deref(),
                        url,
                        timestamp: chrono::Utc::now().to_rfc3339(),
                        original_signer: signer_hex.as_deref(),
                        reason: Some(rejected.reason.tag()),
                    },
                )
                .await;
            }
        }

        let Some(signer) = outcome.signer else {
            return Ok(());
        };

        // challenge fan-out; the only concurrency inside an admission
        let results: Vec<(&ValidRoute, Result<(), ChallengeError>)> =
            futures::future::join_all(outcome.valid.iter().map(|route| async move {
                (route, self.engine.challenge(route, signer).await)
            }))
            .await;

        let mut admitted = Vec::new();
        let mut failed = Vec::new();
        for (route, result) in results {
            match result {
                Ok(()) => admitted.push(route),
                Err(err) => failed.push((route, err)),
            }
        }

        if !admitted.is_empty() {
            self.store
                .update_routes(admitted.iter().map(|r| (r.addr.clone(), r.url.clone())))?;
            RelayMetrics::increment_admitted_routes_count(admitted.len());
        }

        for route in &admitted {
            info!(addr = %route.addr, url = %route.url, "route admitted");
            self.send_confirmation(
                &route.url,
                &Confirmation {
                    status: "completed",
                    addr: Some(&route.addr),
                    url: &route.url,
                    timestamp: chrono::Utc::now().to_rfc3339(),
                    original_signer: signer_hex.as_deref(),
                    reason: None,
                },
            )
            .await;
        }

        for (route, err) in &failed {
            RelayMetrics::increment_challenges_failed_count(err.tag());
            warn!(addr = %route.addr, url = %route.url, %err, "route failed its challenge");
            self.send_confirmation(
                &route.url,
                &Confirmation {
                    status: "failed",
                    addr: Some(&route.addr),
                    url: &route.url,
                    timestamp: chrono::Utc::now().to_rfc3339(),
                    original_signer: signer_hex.as_deref(),
                    reason: Some(err.tag()),
                },
            )
            .await;
        }

        Ok(())
    }

    /// Best effort: a prover that cannot receive its confirmation is logged
    /// and forgotten, never retried.
    async fn send_confirmation(&self, url: &str, confirmation: &Confirmation<'_>) {
        let endpoint = format!("{}/confirmation", url.trim_end_matches('/'));
        let result = self
            .http
            .post(&endpoint)
            .timeout(CONFIRMATION_TIMEOUT)
            .json(confirmation)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                RelayMetrics::increment_confirmations_failed_count();
                warn!(endpoint, status = %response.status(), "confirmation rejected");
            }
            Err(err) => {
                RelayMetrics::increment_confirmations_failed_count();
                warn!(endpoint, %err, "confirmation delivery failed");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_prover {
    use std::sync::Arc;

    use alloy::{
        hex,
        signers::{local::PrivateKeySigner, SignerSync},
    };
    use axum::{body::Bytes, extract::State, http::StatusCode, routing::post, Json, Router};
    use parking_lot::Mutex;

    use crate::admission::challenge::{AesEnvelope, Challenge, ChallengePayload};
    use crate::crypto::hybrid::{aes_decrypt, aes_encrypt};

    #[derive(Clone)]
    pub(crate) enum ProverMode {
        Honest,
        WrongChallengeId,
        ServerError,
        Garbage,
        AesSession([u8; 32]),
        AesSessionPlainReply([u8; 32]),
    }

    #[derive(Clone)]
    struct ProverState {
        wallet: PrivateKeySigner,
        mode: ProverMode,
        confirmations: Arc<Mutex<Vec<serde_json::Value>>>,
    }

    pub(crate) struct ProverHarness {
        pub base_url: String,
        pub confirmations: Arc<Mutex<Vec<serde_json::Value>>>,
    }

    /// Loopback prover: answers challenges with the wallet it was given and
    /// records every confirmation it receives.
    pub(crate) async fn spawn_prover(wallet: PrivateKeySigner, mode: ProverMode) -> ProverHarness {
        let confirmations = Arc::new(Mutex::new(Vec::new()));
        let state = ProverState {
            wallet,
            mode,
            confirmations: confirmations.clone(),
        };

        let app = Router::new()
            .route("/challenge", post(handle_challenge))
            .route("/confirmation", post(handle_confirmation))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        ProverHarness {
            base_url: format!("http://{addr}"),
            confirmations,
        }
    }

    async fn handle_challenge(
        State(state): State<ProverState>,
        body: Bytes,
    ) -> (StatusCode, String) {
        match &state.mode {
            ProverMode::ServerError => {
                return (StatusCode::INTERNAL_SERVER_ERROR, "boom".to_string())
            }
            ProverMode::Garbage => return (StatusCode::OK, "not even json".to_string()),
            _ => {}
        }

        let payload: ChallengePayload = match &state.mode {
            ProverMode::AesSession(key) | ProverMode::AesSessionPlainReply(key) => {
                let envelope: AesEnvelope = serde_json::from_slice(&body).unwrap();
                let plain = aes_decrypt(key, &envelope.iv, &envelope.data).unwrap();
                serde_json::from_slice(&plain).unwrap()
            }
            _ => serde_json::from_slice(&body).unwrap(),
        };

        let response = sign_challenge(&state, &payload.challenge);
        let body = match &state.mode {
            ProverMode::AesSession(key) => {
                let (iv, data) = aes_encrypt(key, response.to_string().as_bytes()).unwrap();
                serde_json::to_string(&AesEnvelope { iv, data }).unwrap()
            }
            _ => response.to_string(),
        };
        (StatusCode::OK, body)
    }

    fn sign_challenge(state: &ProverState, challenge: &Challenge) -> serde_json::Value {
        let canonical = serde_json::to_string(challenge).unwrap();
        let signature = state.wallet.sign_message_sync(canonical.as_bytes()).unwrap();
        let challenge_id = match state.mode {
            ProverMode::WrongChallengeId => "deadbeefdeadbeefdeadbeefdeadbeef".to_string(),
            _ => challenge.challenge_id.clone(),
        };
        serde_json::json!({
            "challengeId": challenge_id,
            "signature": format!("0x{}", hex::encode(signature.as_bytes())),
            "status": "ok"
        })
    }

    async fn handle_confirmation(
        State(state): State<ProverState>,
        Json(body): Json<serde_json::Value>,
    ) -> StatusCode {
        state.confirmations.lock().push(body);
        StatusCode::OK
    }
}

#[cfg(test)]
mod tests {
    use super::test_prover::{spawn_prover, ProverMode};
    use super::*;
    use crate::crypto::hybrid::{encrypt_hybrid, test_keypair};
    use crate::routes::testutil::{sign_route, signed_create_route};
    use crate::routes::RouteAnnouncement;
    use crate::topic::testing::plain_message;
    use alloy::signers::local::PrivateKeySigner;

    fn seeded_store(dir: &std::path::Path) -> Arc<RouteStore> {
        let path = dir.join("store.json");
        let doc = serde_json::json!({
            "routes": {},
            "metadata": { "rsaKeys": test_keypair(), "sequences": {} }
        });
        std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();
        Arc::new(RouteStore::open(&path).unwrap())
    }

    fn encrypted_announcement(routes: &[RouteAnnouncement]) -> Vec<u8> {
        let payload = serde_json::json!({ "routes": routes });
        encrypt_hybrid(&test_keypair().public_key, payload.to_string().as_bytes())
            .unwrap()
            .into_bytes()
    }

    #[tokio::test]
    async fn commits_valid_create_announcement() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path());
        let coordinator = AdmissionCoordinator::new(store.clone()).unwrap();

        let wallet = PrivateKeySigner::random();
        let prover = spawn_prover(wallet.clone(), ProverMode::Honest).await;
        let route = signed_create_route(&wallet, 33, &prover.base_url);
        let addr = route.addr.clone().unwrap();

        let message = plain_message(2, &encrypted_announcement(&[route]));
        coordinator.admit(message).await.unwrap();

        assert_eq!(store.routes().get(&addr).unwrap(), &prover.base_url);
        let confirmations = prover.confirmations.lock();
        assert_eq!(confirmations.len(), 1);
        assert_eq!(confirmations[0]["status"], "completed");
        assert_eq!(confirmations[0]["addr"], addr.as_str());
        assert_eq!(
            confirmations[0]["originalSigner"],
            crate::crypto::ecdsa::lowercase_address(wallet.address())
        );
    }

    #[tokio::test]
    async fn wrong_address_route_fails_without_blocking_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path());
        let coordinator = AdmissionCoordinator::new(store.clone()).unwrap();

        let wallet = PrivateKeySigner::random();
        let good_prover = spawn_prover(wallet.clone(), ProverMode::Honest).await;
        let bad_prover = spawn_prover(wallet.clone(), ProverMode::Honest).await;

        let first = signed_create_route(&wallet, 33, &good_prover.base_url);
        let second = signed_create_route(&wallet, 34, &good_prover.base_url);
        let mut wrong = RouteAnnouncement {
            addr: Some(format!("0x{}", "12".repeat(20))),
            proof_type: Some("create".to_string()),
            nonce: Some(55),
            url: Some(bad_prover.base_url.clone()),
            ..Default::default()
        };
        sign_route(&wallet, &mut wrong);

        let message = plain_message(2, &encrypted_announcement(&[first, second, wrong]));
        coordinator.admit(message).await.unwrap();

        assert_eq!(store.routes().len(), 2);
        assert_eq!(good_prover.confirmations.lock().len(), 2);

        let failures = bad_prover.confirmations.lock();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0]["status"], "failed");
        assert_eq!(failures[0]["reason"], "InvalidOwnership");
    }

    #[tokio::test]
    async fn inconsistent_signer_rejects_only_the_second_route() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path());
        let coordinator = AdmissionCoordinator::new(store.clone()).unwrap();

        let first_wallet = PrivateKeySigner::random();
        let second_wallet = PrivateKeySigner::random();
        let first_prover = spawn_prover(first_wallet.clone(), ProverMode::Honest).await;
        let second_prover = spawn_prover(second_wallet.clone(), ProverMode::Honest).await;

        let routes = [
            signed_create_route(&first_wallet, 1, &first_prover.base_url),
            signed_create_route(&second_wallet, 2, &second_prover.base_url),
        ];
        let message = plain_message(2, &encrypted_announcement(&routes));
        coordinator.admit(message).await.unwrap();

        assert_eq!(store.routes().len(), 1);
        assert_eq!(first_prover.confirmations.lock()[0]["status"], "completed");

        let failures = second_prover.confirmations.lock();
        assert_eq!(failures[0]["status"], "failed");
        assert_eq!(failures[0]["reason"], "InconsistentSigner");
    }

    #[tokio::test]
    async fn failed_challenge_keeps_other_routes() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path());
        let coordinator = AdmissionCoordinator::new(store.clone()).unwrap();

        let wallet = PrivateKeySigner::random();
        let honest = spawn_prover(wallet.clone(), ProverMode::Honest).await;
        let broken = spawn_prover(wallet.clone(), ProverMode::WrongChallengeId).await;

        let good = signed_create_route(&wallet, 10, &honest.base_url);
        let good_addr = good.addr.clone().unwrap();
        let bad = signed_create_route(&wallet, 11, &broken.base_url);
        let bad_addr = bad.addr.clone().unwrap();

        let message = plain_message(3, &encrypted_announcement(&[good, bad]));
        coordinator.admit(message).await.unwrap();

        let routes = store.routes();
        assert!(routes.contains_key(&good_addr));
        assert!(!routes.contains_key(&bad_addr));

        let failures = broken.confirmations.lock();
        assert_eq!(failures[0]["status"], "failed");
        assert_eq!(failures[0]["reason"], "ChallengeIdMismatch");
    }

    #[tokio::test]
    async fn re_admission_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path());
        let coordinator = AdmissionCoordinator::new(store.clone()).unwrap();

        let wallet = PrivateKeySigner::random();
        let prover = spawn_prover(wallet.clone(), ProverMode::Honest).await;
        let route = signed_create_route(&wallet, 33, &prover.base_url);

        let payload = encrypted_announcement(&[route]);
        coordinator.admit(plain_message(2, &payload)).await.unwrap();
        let after_first = store.routes();
        coordinator.admit(plain_message(2, &payload)).await.unwrap();

        assert_eq!(store.routes(), after_first);
    }

    #[tokio::test]
    async fn foreign_payloads_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path());
        let coordinator = AdmissionCoordinator::new(store.clone()).unwrap();

        coordinator
            .admit(plain_message(5, b"\x00\x01\x02 not an envelope"))
            .await
            .unwrap();

        // decrypts fine but carries no routes array
        let other = encrypt_hybrid(&test_keypair().public_key, br#"{"hello": 1}"#)
            .unwrap()
            .into_bytes();
        coordinator.admit(plain_message(6, &other)).await.unwrap();

        assert!(store.routes().is_empty());
    }
}
