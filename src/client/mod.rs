//! Broker Client
//!
//! The gateway talks to the broker through two narrow traits:
//! [`Connector`] establishes authenticated sessions and [`BrokerConnection`]
//! publishes over one. Lifecycle notifications flow back through the three
//! hooks carried in [`ConnectOptions`].
//!
//! [`MqttConnector`] is the production implementation.

mod codec;
mod mqtt;

#[cfg(test)]
pub(crate) mod mock;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

pub use codec::{
    CodecError, ConnAck, Connect, Decoder, Disconnect, Encoder, Packet, ProtocolVersion, PubAck,
    Publish, QoS,
};
pub use mqtt::{ConnectionStatus, MqttClientConfig, MqttConnection, MqttConnector};

pub(crate) use mqtt::parse_url;

/// Error type for broker client operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The broker rejected the presented credentials
    Authorization(String),
    /// The broker refused the operation for another reason
    Rejected(String),
    /// Connection to the broker failed or was lost
    ConnectionLost(String),
    /// Operation timed out
    Timeout,
    /// The connection has been closed
    Closed,
    /// The broker URL could not be used
    InvalidUrl(String),
    /// The broker sent something we could not understand
    Protocol(String),
}

impl ClientError {
    /// Whether this error means the broker refused the credentials
    pub fn is_authorization(&self) -> bool {
        matches!(self, ClientError::Authorization(_))
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Authorization(msg) => write!(f, "authorization violation: {}", msg),
            ClientError::Rejected(msg) => write!(f, "rejected by broker: {}", msg),
            ClientError::ConnectionLost(msg) => write!(f, "connection lost: {}", msg),
            ClientError::Timeout => write!(f, "operation timed out"),
            ClientError::Closed => write!(f, "connection closed"),
            ClientError::InvalidUrl(msg) => write!(f, "invalid broker url: {}", msg),
            ClientError::Protocol(msg) => write!(f, "protocol error: {}", msg),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<CodecError> for ClientError {
    fn from(e: CodecError) -> Self {
        ClientError::Protocol(e.to_string())
    }
}

/// Username/password pair presented to the broker
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Called after the session is (re)established
pub type ConnectHook = Arc<dyn Fn() + Send + Sync>;
/// Called once when the session is lost for good
pub type DisconnectHook = Arc<dyn Fn(&ClientError) + Send + Sync>;
/// Called once when the connection is closed, by either side
pub type CloseHook = Arc<dyn Fn() + Send + Sync>;

/// Lifecycle hooks invoked from the connection's own task
#[derive(Clone, Default)]
pub struct LifecycleHooks {
    pub on_connect: Option<ConnectHook>,
    pub on_disconnect: Option<DisconnectHook>,
    pub on_close: Option<CloseHook>,
}

impl LifecycleHooks {
    pub(crate) fn connected(&self) {
        if let Some(ref hook) = self.on_connect {
            hook();
        }
    }

    pub(crate) fn disconnected(&self, err: &ClientError) {
        if let Some(ref hook) = self.on_disconnect {
            hook(err);
        }
    }

    pub(crate) fn closed(&self) {
        if let Some(ref hook) = self.on_close {
            hook();
        }
    }
}

impl fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_close", &self.on_close.is_some())
            .finish()
    }
}

/// Options for establishing a broker session
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Display name of this client
    pub name: String,
    /// Credentials, or `None` for anonymous access
    pub credentials: Option<Credentials>,
    /// Lifecycle hooks
    pub hooks: LifecycleHooks,
}

impl ConnectOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn on_connect<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.hooks.on_connect = Some(Arc::new(hook));
        self
    }

    pub fn on_disconnect<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ClientError) + Send + Sync + 'static,
    {
        self.hooks.on_disconnect = Some(Arc::new(hook));
        self
    }

    pub fn on_close<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.hooks.on_close = Some(Arc::new(hook));
        self
    }
}

/// An established broker session
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Publish a payload to a subject
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), ClientError>;

    /// Close the session. Calling this more than once is a no-op.
    async fn close(&self);

    /// Whether the session has been closed
    fn is_closed(&self) -> bool;
}

/// Establishes broker sessions
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        options: ConnectOptions,
    ) -> Result<Arc<dyn BrokerConnection>, ClientError>;
}
