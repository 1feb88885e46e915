use crate::identity::ClientIdentity;
use crate::transport::{Transport, TransportError};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{Duration, Instant};
use tracing::instrument;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Failed to publish request: {0}")]
    Publish(#[from] TransportError),
}

/// Request published on the shared request channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub client_id: String,
    pub image_b64: String,
}

impl RequestEnvelope {
    pub fn new(identity: &ClientIdentity, image_bytes: &[u8]) -> Self {
        Self {
            client_id: identity.as_str().to_string(),
            image_b64: STANDARD.encode(image_bytes),
        }
    }
}

pub struct RequestDispatcher<T: Transport> {
    transport: Arc<T>,
    identity: ClientIdentity,
    request_channel: String,
}

impl<T: Transport> RequestDispatcher<T> {
    pub fn new(transport: Arc<T>, identity: ClientIdentity, request_channel: &str) -> Self {
        Self {
            transport,
            identity,
            request_channel: request_channel.to_string(),
        }
    }

    /// Publishes one frame without waiting for any response.
    #[instrument(skip(self, frame_bytes), fields(bytes = frame_bytes.len()))]
    pub async fn submit(&self, frame_bytes: &[u8]) -> Result<(), DispatchError> {
        let envelope = RequestEnvelope::new(&self.identity, frame_bytes);
        let payload = serde_json::to_vec(&envelope)?;
        self.transport.publish(&self.request_channel, payload).await?;
        Ok(())
    }
}

/// Enforces a minimum interval between submissions.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    min_interval: Duration,
    last: Option<Instant>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
        }
    }

    /// Returns true and records `now` when a submission is allowed.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        let ready = match self.last {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.min_interval,
        };
        if ready {
            self.last = Some(now);
        }
        ready
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    pub struct MockTransport {
        pub published: Mutex<Vec<(String, Vec<u8>)>>,
        pub fail_publish: bool,
        pub closes: Mutex<usize>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), TransportError> {
            if self.fail_publish {
                return Err(TransportError::Closed);
            }
            self.published.lock().push((channel.to_string(), payload));
            Ok(())
        }

        async fn subscribe(&self, _channel: &str) -> Result<(), TransportError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), TransportError> {
            *self.closes.lock() += 1;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_submit_publishes_envelope() {
        let transport = Arc::new(MockTransport::default());
        let dispatcher = RequestDispatcher::new(
            transport.clone(),
            ClientIdentity::from("abc"),
            "yolo/detect/request",
        );

        dispatcher.submit(b"jpeg-bytes").await.unwrap();

        let published = transport.published.lock();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "yolo/detect/request");

        let envelope: RequestEnvelope = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(envelope.client_id, "abc");
        assert_eq!(STANDARD.decode(envelope.image_b64).unwrap(), b"jpeg-bytes");
    }

    #[tokio::test]
    async fn test_submit_surfaces_publish_errors() {
        let transport = Arc::new(MockTransport {
            fail_publish: true,
            ..Default::default()
        });
        let dispatcher =
            RequestDispatcher::new(transport, ClientIdentity::from("abc"), "yolo/detect/request");

        let result = dispatcher.submit(b"x").await;
        assert!(matches!(result, Err(DispatchError::Publish(_))));
    }

    #[test]
    fn test_rate_limiter_never_admits_within_interval() {
        let interval = Duration::from_millis(50);
        let mut limiter = RateLimiter::new(interval);
        let start = Instant::now();

        let mut admitted = Vec::new();
        // capture every 7ms for one second
        for i in 0..143u64 {
            let now = start + Duration::from_millis(i * 7);
            if limiter.try_acquire(now) {
                admitted.push(now);
            }
        }

        assert!(admitted.len() > 1);
        for pair in admitted.windows(2) {
            assert!(pair[1] - pair[0] >= interval);
        }
    }

    #[test]
    fn test_rate_limiter_first_call_is_admitted() {
        let mut limiter = RateLimiter::new(Duration::from_secs(10));
        let now = Instant::now();
        assert!(limiter.try_acquire(now));
        assert!(!limiter.try_acquire(now + Duration::from_secs(9)));
        assert!(limiter.try_acquire(now + Duration::from_secs(10)));
    }
}
