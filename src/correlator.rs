use crate::detection::decode_detections;
use crate::slot::LatestResponseSlot;
use crate::transport::InboundMessage;
use std::sync::Arc;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};

/// Outcome of handling one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlation {
    Stored { detections: usize },
    ForeignChannel,
    Malformed,
}

/// Moves responses arriving on the private channel into the latest-response slot.
pub struct ResponseCorrelator {
    response_channel: String,
    slot: Arc<LatestResponseSlot>,
}

impl ResponseCorrelator {
    pub fn new(response_channel: impl Into<String>, slot: Arc<LatestResponseSlot>) -> Self {
        Self {
            response_channel: response_channel.into(),
            slot,
        }
    }

    pub fn handle(&self, message: &InboundMessage) -> Correlation {
        if message.channel != self.response_channel {
            tracing::debug!("Ignoring message on foreign channel {}", message.channel);
            return Correlation::ForeignChannel;
        }

        match decode_detections(&message.payload) {
            Ok(detections) => {
                let count = detections.len();
                if self.slot.put(detections) {
                    tracing::debug!("Unread response overwritten by a newer one");
                }
                Correlation::Stored { detections: count }
            }
            Err(e) => {
                tracing::warn!(
                    "Discarding malformed response ({} bytes): {}",
                    message.payload.len(),
                    e
                );
                Correlation::Malformed
            }
        }
    }

    /// Spawns the correlator; it stops when the inbound channel closes or on shutdown.
    pub fn spawn(
        self,
        mut inbound_rx: mpsc::Receiver<InboundMessage>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = inbound_rx.recv() => match message {
                        Some(message) => {
                            self.handle(&message);
                        }
                        None => {
                            tracing::debug!("Inbound channel closed");
                            break;
                        }
                    },
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Correlator received shutdown signal");
                        break;
                    }
                }
            }
            tracing::info!("Correlator stopped");
        })
    }
}
