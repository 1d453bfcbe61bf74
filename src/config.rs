//! Node configuration.
//!
//! [`NodeConfig`] deserializes from any serde format with every field
//! optional (`#[serde(default)]`), so a config file only needs the values it
//! changes. The binary builds one from command-line flags.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::NodeError;
use crate::handshake::HandshakeKind;
use crate::identity::PuzzleParams;
use crate::routing::DEFAULT_K;

/// Default Kademlia concurrency factor (parallel queries per lookup round).
pub const DEFAULT_ALPHA: usize = 3;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address the listener binds, `host:port`.
    pub bind_addr: String,
    /// Address announced to peers; defaults to the bound address.
    pub advertise_addr: Option<String>,
    pub puzzle: PuzzleParams,
    pub handshake: HandshakeKind,
    /// Bucket capacity (k).
    pub bucket_size: usize,
    /// Parallel queries per lookup round (α).
    pub alpha: usize,
    pub handshake_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub dial_timeout_ms: u64,
    /// Deadline for a liveness probe of a full bucket's oldest entry.
    pub probe_timeout_ms: u64,
    /// Deadline for a single query inside an iterative lookup.
    pub lookup_query_timeout_ms: u64,
    pub max_lookup_rounds: usize,
    /// Interval between stale-bucket refresh passes; `0` disables refresh.
    pub refresh_interval_secs: u64,
    /// A bucket untouched for this long is refreshed.
    pub bucket_stale_secs: u64,
    /// Peers to connect to at startup, `host:port`.
    pub bootstrap: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:0".to_string(),
            advertise_addr: None,
            puzzle: PuzzleParams::default(),
            handshake: HandshakeKind::default(),
            bucket_size: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            handshake_timeout_ms: 5_000,
            request_timeout_ms: 10_000,
            dial_timeout_ms: 5_000,
            probe_timeout_ms: 2_000,
            lookup_query_timeout_ms: 3_000,
            max_lookup_rounds: 20,
            refresh_interval_secs: 30 * 60,
            bucket_stale_secs: 30 * 60,
            bootstrap: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// Loopback listener, cheap puzzle, no background refresh.
    pub fn local(static_difficulty: u32, dynamic_difficulty: u32) -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            puzzle: PuzzleParams {
                static_difficulty,
                dynamic_difficulty,
            },
            refresh_interval_secs: 0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), NodeError> {
        self.puzzle.validate()?;
        if self.bucket_size == 0 {
            return Err(NodeError::Config("bucket_size must be at least 1".into()));
        }
        if self.alpha == 0 {
            return Err(NodeError::Config("alpha must be at least 1".into()));
        }
        if self.max_lookup_rounds == 0 {
            return Err(NodeError::Config("max_lookup_rounds must be at least 1".into()));
        }
        let timeouts = [
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("request_timeout_ms", self.request_timeout_ms),
            ("dial_timeout_ms", self.dial_timeout_ms),
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("lookup_query_timeout_ms", self.lookup_query_timeout_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, v)| *v == 0) {
            return Err(NodeError::Config(format!("{name} must be positive")));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn lookup_query_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_query_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval_secs > 0).then(|| Duration::from_secs(self.refresh_interval_secs))
    }

    pub fn bucket_stale_threshold(&self) -> Duration {
        Duration::from_secs(self.bucket_stale_secs)
    }
}
