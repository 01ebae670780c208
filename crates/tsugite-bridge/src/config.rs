//! Bridge configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_capacity() -> usize {
    1024
}

fn default_timeout() -> Option<Duration> {
    Some(Duration::from_secs(30))
}

/// Tunables for a [`CommandEventBridge`](crate::bridge::CommandEventBridge).
///
/// Both timeouts accept `None` for an unbounded wait; production hosts
/// should keep a bound so a silent kernel cannot hang a handler forever.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Per-subscriber buffer capacity for the inbound and outbound streams.
    #[serde(default = "default_capacity")]
    pub channel_capacity: usize,

    /// Bound on waits for correlated replies to command requests.
    #[serde(default = "default_timeout")]
    pub reply_timeout: Option<Duration>,

    /// Bound on the value-adapter comm handshake wait.
    #[serde(default = "default_timeout")]
    pub handshake_timeout: Option<Duration>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_capacity(),
            reply_timeout: default_timeout(),
            handshake_timeout: default_timeout(),
        }
    }
}
