use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use url::Url;

/// Default port for the status surface exposed to provers.
pub const DEFAULT_STATUS_PORT: u16 = 3000;

/// Default port for the Prometheus metrics listener.
pub const DEFAULT_METRICS_PORT: u16 = 9091;

/// Default cadence of the per-topic poll loop.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

const DEFAULT_MIRROR_URL: &str = "https://testnet.mirrornode.hedera.com";
const DEFAULT_STORE_PATH: &str = "routes-store.json";

/// Command-line options for the relay
#[derive(Parser, Debug)]
pub struct Opts {
    /// Base URL of the mirror node used for all topic reads
    #[clap(short = 'm', long, env = "MIRROR_NODE_URL")]
    pub(super) mirror_url: Option<String>,
    /// Base URL of the submit gateway used to publish topic messages.
    /// Without it the relay can consume but never create topics or publish
    /// its public key.
    #[clap(short = 's', long, env = "SUBMIT_GATEWAY_URL")]
    pub(super) submit_url: Option<String>,
    /// Consensus topic carrying route announcements. When absent a new topic
    /// is created at startup.
    #[clap(short = 't', long, env = "RELAY_TOPIC_ID")]
    pub(super) topic_id: Option<String>,
    /// Hedera network name reported on the status surface
    #[clap(short = 'n', long, env = "HEDERA_NETWORK")]
    pub(super) network: Option<String>,
    /// Operator account id reported on the status surface
    #[clap(short = 'a', long, env = "OPERATOR_ACCOUNT_ID")]
    pub(super) account_id: Option<String>,
    /// Port to serve the status endpoints on
    #[clap(short = 'p', long)]
    pub(super) status_port: Option<u16>,
    /// Port to serve Prometheus metrics on
    #[clap(long)]
    pub(super) metrics_port: Option<u16>,
    /// Seconds between topic polls
    #[clap(short = 'i', long)]
    pub(super) poll_interval_secs: Option<u64>,
    /// Path of the persistent route store document
    #[clap(short = 'd', long, env = "RELAY_STORE_PATH")]
    pub(super) store_path: Option<PathBuf>,
}

/// Configuration options for the relay. These are parsed from command-line
/// options in the form of [`Opts`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the mirror node used for all topic reads
    pub mirror_url: Url,
    /// Base URL of the submit gateway used to publish topic messages
    pub submit_url: Option<Url>,
    /// Consensus topic carrying route announcements
    pub topic_id: Option<String>,
    /// Hedera network name reported on the status surface
    pub network: String,
    /// Operator account id reported on the status surface
    pub account_id: String,
    /// Port to serve the status endpoints on
    pub status_port: u16,
    /// Port to serve Prometheus metrics on
    pub metrics_port: u16,
    /// Cadence of the per-topic poll loop
    pub poll_interval: Duration,
    /// Path of the persistent route store document
    pub store_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mirror_url: DEFAULT_MIRROR_URL.parse().expect("Valid URL"),
            submit_url: None,
            topic_id: None,
            network: "testnet".to_string(),
            account_id: String::new(),
            status_port: DEFAULT_STATUS_PORT,
            metrics_port: DEFAULT_METRICS_PORT,
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            store_path: PathBuf::from(DEFAULT_STORE_PATH),
        }
    }
}

impl Config {
    /// Parse the command-line options and return a new [`Config`] instance
    pub fn parse_from_cli() -> eyre::Result<Self> {
        let opts = Opts::parse();
        Self::try_from(opts)
    }
}

impl TryFrom<Opts> for Config {
    type Error = eyre::Report;

    fn try_from(opts: Opts) -> Result<Self, Self::Error> {
        let mut config = Config::default();

        if let Some(mirror_url) = opts.mirror_url {
            config.mirror_url = mirror_url.parse()?;
        }
        config.submit_url = opts.submit_url.map(|u| u.parse()).transpose()?;
        config.topic_id = opts.topic_id;

        if let Some(network) = opts.network {
            config.network = network;
        }
        if let Some(account_id) = opts.account_id {
            config.account_id = account_id;
        }
        if let Some(port) = opts.status_port {
            config.status_port = port;
        }
        if let Some(port) = opts.metrics_port {
            config.metrics_port = port;
        }
        if let Some(secs) = opts.poll_interval_secs {
            if secs == 0 {
                eyre::bail!("poll interval must be at least one second");
            }
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(path) = opts.store_path {
            config.store_path = path;
        }

        Ok(config)
    }
}
