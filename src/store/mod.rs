use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::crypto::hybrid::{generate_rsa_keypair, RsaKeyPair};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("store document is corrupt: {0}")]
    Corrupt(String),
    #[error("RSA key generation failed: {0}")]
    KeyGen(String),
}

/// On-disk document. The nested shape is load-bearing for upgrades:
/// `{routes, metadata: {rsaKeys, sequences}}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    routes: BTreeMap<String, String>,
    #[serde(default)]
    metadata: Metadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Metadata {
    #[serde(rename = "rsaKeys", default)]
    rsa_keys: Option<RsaKeyPair>,
    #[serde(default)]
    sequences: BTreeMap<String, u64>,
}

/// Durable home of the route table, the relay's RSA key pair and the
/// per-topic consumer cursors. One write path: every mutation rewrites the
/// whole document through an atomic rename.
#[derive(Debug)]
pub struct RouteStore {
    path: PathBuf,
    doc: RwLock<Document>,
}

const CURSOR_KEY_PREFIX: &str = "lastSequence_";

/// Cursors start at 1 so that sequence 1, the published public key, is never
/// admitted.
pub const INITIAL_CURSOR: u64 = 1;

impl RouteStore {
    /// Loads the document (migrating a legacy flat layout if found) and
    /// generates the RSA key pair on first ever startup.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        let mut doc = if path.exists() {
            let raw = fs::read(&path)?;
            parse_document(&raw)?
        } else {
            Document::default()
        };

        let mut dirty = false;
        if doc.metadata.rsa_keys.is_none() {
            info!("no RSA key pair on disk, generating one");
            let keys = generate_rsa_keypair().map_err(|e| StoreError::KeyGen(e.to_string()))?;
            doc.metadata.rsa_keys = Some(keys);
            dirty = true;
        }

        let store = Self {
            path,
            doc: RwLock::new(doc),
        };
        if dirty {
            store.persist()?;
        }
        Ok(store)
    }

    /// The relay's long-term key pair. Present from `open` onwards.
    pub fn keypair(&self) -> RsaKeyPair {
        self.doc
            .read()
            .metadata
            .rsa_keys
            .clone()
            .expect("key pair generated at open")
    }

    pub fn routes(&self) -> BTreeMap<String, String> {
        self.doc.read().routes.clone()
    }

    /// The upstream for `addr`, or `default` when no route is committed.
    /// Comparison is on the lowercase address.
    #[allow(dead_code)]
    pub fn target_for(&self, addr: &str, default: &str) -> String {
        self.doc
            .read()
            .routes
            .get(&addr.to_lowercase())
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    /// Case-insensitive merge into the route table; last committed write for
    /// an address wins.
    pub fn update_routes(
        &self,
        entries: impl IntoIterator<Item = (String, String)>,
    ) -> Result<(), StoreError> {
        {
            let mut doc = self.doc.write();
            for (addr, url) in entries {
                doc.routes.insert(addr.to_lowercase(), url);
            }
        }
        self.persist()
    }

    pub fn cursor(&self, topic: &str) -> u64 {
        self.doc
            .read()
            .metadata
            .sequences
            .get(&cursor_key(topic))
            .copied()
            .unwrap_or(INITIAL_CURSOR)
    }

    /// Advances the persisted cursor. Never moves backwards.
    pub fn set_cursor(&self, topic: &str, seq: u64) -> Result<(), StoreError> {
        {
            let mut doc = self.doc.write();
            let entry = doc
                .metadata
                .sequences
                .entry(cursor_key(topic))
                .or_insert(INITIAL_CURSOR);
            if seq <= *entry {
                return Ok(());
            }
            *entry = seq;
        }
        self.persist()
    }

    fn persist(&self) -> Result<(), StoreError> {
        let serialized = {
            let doc = self.doc.read();
            serde_json::to_vec_pretty(&*doc).map_err(|e| StoreError::Corrupt(e.to_string()))?
        };

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serialized)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn cursor_key(topic: &str) -> String {
    format!("{CURSOR_KEY_PREFIX}{topic}")
}

fn parse_document(raw: &[u8]) -> Result<Document, StoreError> {
    let value: serde_json::Value =
        serde_json::from_slice(raw).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let serde_json::Value::Object(map) = value else {
        return Err(StoreError::Corrupt("document root is not an object".to_string()));
    };

    if map.contains_key("metadata") {
        return serde_json::from_value(serde_json::Value::Object(map))
            .map_err(|e| StoreError::Corrupt(e.to_string()));
    }

    // Legacy flat layout: route entries at the root, mixed with `rsaKeys` and
    // `lastSequence_*` keys. Migrated in memory here; the nested layout hits
    // disk on the next write.
    warn!("legacy flat store layout detected, migrating");
    let mut doc = Document::default();
    for (key, value) in map {
        if key == "rsaKeys" {
            doc.metadata.rsa_keys = serde_json::from_value(value)
                .map_err(|e| StoreError::Corrupt(format!("bad rsaKeys entry: {e}")))?;
        } else if key.starts_with(CURSOR_KEY_PREFIX) {
            let seq = value
                .as_u64()
                .ok_or_else(|| StoreError::Corrupt(format!("bad cursor entry {key}")))?;
            doc.metadata.sequences.insert(key, seq);
        } else if let serde_json::Value::String(url) = value {
            doc.routes.insert(key.to_lowercase(), url);
        } else {
            warn!(key, "dropping unrecognized legacy store entry");
        }
    }
    Ok(doc)
}
