use std::time::Duration;

use bon::Builder;

use crate::codec::DEFAULT_MAX_MESSAGE_SIZE;

/// Configuration for the RPC server.
#[derive(Debug, Clone, Builder)]
pub struct RpcServerConfig {
    /// Upper bound on a single message in either direction.
    #[builder(default = DEFAULT_MAX_MESSAGE_SIZE)]
    pub max_message_size: usize,

    /// Input elements buffered per streaming call. A call whose handler leaves more
    /// than this unread fails with INPUT_OVERFLOW; the channel reader never waits on it.
    #[builder(default = 32)]
    pub input_buffer: usize,

    /// Outbound messages buffered per channel before handlers wait on the writer.
    #[builder(default = 64)]
    pub output_buffer: usize,

    /// Stop calls that run longer than this with a TIMEOUT error.
    /// No deadline if not set.
    pub call_timeout: Option<Duration>,

    /// How long a cancelled channel keeps writing its final replies to a peer that is
    /// not reading them before they are dropped.
    #[builder(default = Duration::from_secs(1))]
    pub shutdown_grace: Duration,
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
