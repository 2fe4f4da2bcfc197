use eyre::{bail, WrapErr};
use tracing::info;

use crate::store::RouteStore;
use crate::topic::{ConsensusLog, TopicId};

/// Makes sure the topic exists and that its first message is the relay's RSA
/// public key, which is how provers learn the encryption key. Every failure
/// here is fatal: without a provable sequence 1 the relay must not start
/// consuming.
pub async fn ensure_topic(
    log: &dyn ConsensusLog,
    store: &RouteStore,
    configured: Option<TopicId>,
) -> eyre::Result<TopicId> {
    let public_key = store.keypair().public_key;

    let Some(topic) = configured else {
        let topic = log
            .create_topic()
            .await
            .wrap_err("failed to create a consensus topic")?;
        let seq = log
            .publish(&topic, public_key.as_bytes())
            .await
            .wrap_err("failed to publish the public key to the new topic")?;
        info!(topic, seq, "created topic and published the relay public key");
        return Ok(topic);
    };

    let exists = log
        .topic_exists(&topic)
        .await
        .wrap_err("topic existence probe failed")?;
    if !exists {
        bail!("configured topic {topic} does not exist");
    }

    match log
        .message_at(&topic, 1)
        .await
        .wrap_err("probe for the topic's first message failed")?
    {
        Some(_) => {
            info!(topic, "topic already carries a first message, leaving it as-is");
        }
        None => {
            let seq = log
                .publish(&topic, public_key.as_bytes())
                .await
                .wrap_err("failed to publish the public key as the first message")?;
            info!(topic, seq, "published the relay public key");
        }
    }

    Ok(topic)
}
