use bridge_protocol::{ErrorPayload, TransportError};

/// An error synthesized from what the remote context reported.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct RemoteError {
    pub message: String,
    /// Stack trace captured in the remote context, if it sent one.
    pub stack: Option<String>,
}

impl From<ErrorPayload> for RemoteError {
    fn from(payload: ErrorPayload) -> Self {
        Self {
            message: payload.message,
            stack: payload.stack,
        }
    }
}

/// Why a call's deferred result did not resolve to a value.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// The remote method failed.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The transport was lost before a response arrived.
    #[error("transport lost before the call settled")]
    Disconnected,

    /// The connector was destroyed before a response arrived.
    #[error("connector destroyed before the call settled")]
    Destroyed,
}

/// Failure to hand a message to the transport.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("connector has been destroyed")]
    Destroyed,
}

impl ConnectorError {
    /// `true` when the failure means the port under the connector is dead.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ConnectorError::Transport(TransportError::Disconnected))
    }
}
