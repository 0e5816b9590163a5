//! # Connector Configuration

use std::time::Duration;

/// Target origin used when a window-like transport needs one and none was
/// configured.
pub const DEFAULT_TARGET_ORIGIN: &str = "*";

/// How long to wait before reopening a port after a failed open.
pub const RECONNECT_DELAY_SECS: u64 = 3;

/// What happens to in-flight calls when the transport under them is lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PendingPolicy {
    /// Reject every pending call with [`crate::CallError::Disconnected`].
    #[default]
    RejectOnDisconnect,
    /// Leave them pending; a response may still arrive if the same callee
    /// is reached again. Callers must bring their own timeout.
    Keep,
}

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Logical channel; only envelopes with the same tag are processed.
    pub channel: Option<String>,
    /// Recipient origin for window-like transports.
    pub target_origin: String,
    /// When set, inbound frames from any other origin are ignored.
    pub expected_origin: Option<String>,
    pub pending_policy: PendingPolicy,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            channel: None,
            target_origin: DEFAULT_TARGET_ORIGIN.to_owned(),
            expected_origin: None,
            pending_policy: PendingPolicy::default(),
        }
    }
}

impl ConnectorConfig {
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_target_origin(mut self, origin: impl Into<String>) -> Self {
        self.target_origin = origin.into();
        self
    }

    pub fn with_expected_origin(mut self, origin: impl Into<String>) -> Self {
        self.expected_origin = Some(origin.into());
        self
    }

    pub fn with_pending_policy(mut self, policy: PendingPolicy) -> Self {
        self.pending_policy = policy;
        self
    }
}

/// Settings for [`crate::PortAdapter`].
#[derive(Debug, Clone)]
pub struct PortAdapterConfig {
    /// Name every relay port is opened with.
    pub port_name: String,
    /// Delay between failed open attempts.
    pub reconnect_delay: Duration,
    pub connector: ConnectorConfig,
}

impl PortAdapterConfig {
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            reconnect_delay: Duration::from_secs(RECONNECT_DELAY_SECS),
            connector: ConnectorConfig::default(),
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_connector(mut self, connector: ConnectorConfig) -> Self {
        self.connector = connector;
        self
    }
}
