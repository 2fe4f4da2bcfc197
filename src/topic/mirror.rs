use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

use crate::topic::{ConsensusLog, LogError, TopicId, TopicMessage};

const FETCH_TIMEOUT: Duration = Duration::from_secs(5);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Consensus-log access over HTTP: reads go to the public mirror-node REST
/// API, writes to an operator-configured submit gateway (the substrate's
/// account credentials live behind that gateway, not here).
#[derive(Debug, Clone)]
pub struct MirrorNodeClient {
    http: reqwest::Client,
    mirror_base: String,
    submit_base: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesPage {
    #[serde(default)]
    messages: Vec<TopicMessage>,
}

#[derive(Debug, Deserialize)]
struct SubmitReceipt {
    sequence_number: u64,
}

#[derive(Debug, Deserialize)]
struct CreatedTopic {
    topic_id: String,
}

impl MirrorNodeClient {
    pub fn new(mirror_url: &Url, submit_url: Option<&Url>) -> eyre::Result<Self> {
        let http = reqwest::ClientBuilder::new()
            .user_agent("route-relay")
            .build()?;
        Ok(Self {
            http,
            mirror_base: mirror_url.as_str().trim_end_matches('/').to_string(),
            submit_base: submit_url.map(|u| u.as_str().trim_end_matches('/').to_string()),
        })
    }

    fn submit_base(&self) -> Result<&str, LogError> {
        self.submit_base
            .as_deref()
            .ok_or(LogError::SubmitUnavailable)
    }
}

fn transport_error(err: reqwest::Error) -> LogError {
    if err.is_timeout() {
        LogError::Timeout
    } else {
        LogError::Transport(err.to_string())
    }
}

#[async_trait]
impl ConsensusLog for MirrorNodeClient {
    async fn topic_exists(&self, topic: &str) -> Result<bool, LogError> {
        let response = self
            .http
            .get(format!("{}/api/v1/topics/{topic}", self.mirror_base))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(LogError::Status(status.as_u16())),
        }
    }

    async fn messages_after(
        &self,
        topic: &str,
        after: u64,
        limit: u32,
    ) -> Result<Vec<TopicMessage>, LogError> {
        let response = self
            .http
            .get(format!(
                "{}/api/v1/topics/{topic}/messages", self.mirror_base
            ))
            .query(&[
                ("sequencenumber", format!("gt:{after}")),
                ("limit", limit.to_string()),
                ("order", "asc".to_string()),
            ])
            .timeout(FETCH_TIMEOUT)
            .send()
            .await
            .map_err(transport_error)?;

        // 404 on the messages endpoint means "no messages yet"
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(LogError::Status(response.status().as_u16()));
        }

        let page: MessagesPage = response
            .json()
            .await
            .map_err(|e| LogError::Decode(e.to_string()))?;
        Ok(page.messages)
    }

    async fn message_at(&self, topic: &str, seq: u64) -> Result<Option<TopicMessage>, LogError> {
        let response = self
            .http
            .get(format!(
                "{}/api/v1/topics/{topic}/messages/{seq}", self.mirror_base
            ))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(transport_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(LogError::Status(response.status().as_u16()));
        }

        response
            .json::<TopicMessage>()
            .await
            .map(Some)
            .map_err(|e| LogError::Decode(e.to_string()))
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<u64, LogError> {
        let base = self.submit_base()?;
        let response = self
            .http
            .post(format!("{base}/api/v1/topics/{topic}/messages"))
            .timeout(PUBLISH_TIMEOUT)
            .json(&serde_json::json!({ "message": BASE64.encode(payload) }))
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(LogError::Status(response.status().as_u16()));
        }

        let receipt: SubmitReceipt = response
            .json()
            .await
            .map_err(|e| LogError::Decode(e.to_string()))?;
        Ok(receipt.sequence_number)
    }

    async fn create_topic(&self) -> Result<TopicId, LogError> {
        let base = self.submit_base()?;
        let response = self
            .http
            .post(format!("{base}/api/v1/topics"))
            .timeout(PUBLISH_TIMEOUT)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(LogError::Status(response.status().as_u16()));
        }

        let created: CreatedTopic = response
            .json()
            .await
            .map_err(|e| LogError::Decode(e.to_string()))?;
        Ok(created.topic_id)
    }
}
