use std::time::Duration;

use bon::Builder;

use crate::codec::DEFAULT_MAX_MESSAGE_SIZE;

/// Configuration for the RPC client.
#[derive(Debug, Clone, Builder)]
pub struct RpcClientConfig {
    /// Upper bound on a single message in either direction.
    #[builder(default = DEFAULT_MAX_MESSAGE_SIZE)]
    pub max_message_size: usize,

    /// Outbound messages buffered per call before writers wait.
    #[builder(default = 32)]
    pub write_buffer: usize,

    /// Deadline for single-value results (unary and client-stream calls).
    /// The call is cancelled when it expires. No deadline if not set.
    pub call_timeout: Option<Duration>,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
