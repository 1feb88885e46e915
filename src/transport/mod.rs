mod mqtt;

pub use mqtt::MqttSession;

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Broker did not acknowledge the connection within {0:?}")]
    ConnectTimeout(Duration),
    #[error("Broker refused the connection: {0}")]
    ConnectionRefused(String),
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("Transport session is closed")]
    Closed,
}

/// A message delivered on one of the subscribed channels.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub channel: String,
    pub payload: Bytes,
}

/// Publish side of a pub/sub session.
///
/// Inbound messages are not part of the trait: a session hands out a
/// receiver at connect time and delivers into it from a background task.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    async fn subscribe(&self, channel: &str) -> Result<(), TransportError>;

    /// Drops the private subscription and disconnects. Calling it again is a no-op.
    async fn close(&self) -> Result<(), TransportError>;
}
