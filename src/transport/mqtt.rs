use super::{InboundMessage, Transport, TransportError};
use crate::config::BrokerConfig;
use crate::identity::{channel_for, ClientIdentity};
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS,
};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
    time::{sleep, timeout, Duration},
};
use tracing::instrument;

const REQUEST_QUEUE_CAPACITY: usize = 64;
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(50);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(1);
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

pub struct MqttSession {
    client: AsyncClient,
    response_channel: String,
    shutdown_tx: broadcast::Sender<()>,
    event_loop_handle: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl MqttSession {
    /// Connects to the broker and subscribes the private response channel,
    /// which is subscribed again after every reconnect.
    ///
    /// Fails with `ConnectTimeout` when no successful CONNACK arrives within
    /// the configured timeout. The returned receiver yields every message
    /// delivered on the session's subscriptions.
    pub async fn connect(
        broker: &BrokerConfig,
        identity: &ClientIdentity,
    ) -> Result<(Self, mpsc::Receiver<InboundMessage>), TransportError> {
        let response_channel = channel_for(&broker.response_topic_prefix, identity);

        let mut options = MqttOptions::new(identity.as_str(), broker.host.clone(), broker.port);
        options.set_keep_alive(broker.keep_alive());
        if let (Some(username), Some(password)) = (&broker.username, &broker.password) {
            options.set_credentials(username.clone(), password.clone());
        }

        let (client, event_loop) = AsyncClient::new(options, REQUEST_QUEUE_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(broker.inbound_capacity.max(1));
        let (connected_tx, connected_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        tracing::info!(
            "Connecting to MQTT broker {} as {}",
            broker.get_address(),
            identity
        );

        let handle = tokio::spawn(drive_event_loop(
            event_loop,
            client.clone(),
            response_channel.clone(),
            inbound_tx,
            connected_tx,
            shutdown_rx,
        ));

        let connect_timeout = broker.connect_timeout();
        let outcome = timeout(connect_timeout, connected_rx).await;

        let result = match outcome {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::ConnectTimeout(connect_timeout)),
        };

        if let Err(e) = result {
            let _ = shutdown_tx.send(());
            let _ = handle.await;
            return Err(e);
        }

        let session = Self {
            client,
            response_channel,
            shutdown_tx,
            event_loop_handle: Mutex::new(Some(handle)),
            closed: AtomicBool::new(false),
        };

        if let Err(e) = session.subscribe(&session.response_channel).await {
            let _ = session.close().await;
            return Err(e);
        }
        tracing::info!("Connected, listening on {}", session.response_channel);

        Ok((session, inbound_rx))
    }

    pub fn response_channel(&self) -> &str {
        &self.response_channel
    }
}

#[async_trait]
impl Transport for MqttSession {
    #[instrument(skip(self, payload), fields(bytes = payload.len()))]
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        // Never wait on a full request queue; the frame is lost instead.
        self.client.try_publish(channel, QoS::AtMostOnce, false, payload)?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.client.subscribe(channel, QoS::AtMostOnce).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        tracing::info!("Closing MQTT session");
        // Queue without waiting: a lost broker never drains a full request queue.
        let unsubscribed = self.client.try_unsubscribe(self.response_channel.clone());
        let disconnected = self.client.try_disconnect();

        let handle = self.event_loop_handle.lock().take();
        if let Some(mut handle) = handle {
            if timeout(DISCONNECT_GRACE, &mut handle).await.is_err() {
                tracing::warn!("Event loop did not stop after disconnect, forcing shutdown");
                let _ = self.shutdown_tx.send(());
                let _ = handle.await;
            }
        }

        unsubscribed?;
        disconnected?;
        Ok(())
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

async fn drive_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    response_channel: String,
    inbound_tx: mpsc::Sender<InboundMessage>,
    connected_tx: oneshot::Sender<Result<(), TransportError>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut connected_tx = Some(connected_tx);
    let mut retry_delay = INITIAL_RETRY_DELAY;
    let mut connected_once = false;

    loop {
        let event = tokio::select! {
            event = event_loop.poll() => event,
            _ = shutdown_rx.recv() => {
                tracing::debug!("MQTT event loop received shutdown signal");
                break;
            }
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    retry_delay = INITIAL_RETRY_DELAY;
                    // The first subscription is made by `connect`; clean sessions drop it on reconnect.
                    if connected_once {
                        tracing::info!("Reconnected, resubscribing {}", response_channel);
                        let subscribed = client.try_subscribe(response_channel.as_str(), QoS::AtMostOnce);
                        if let Err(e) = subscribed {
                            tracing::error!("Failed to subscribe {}: {:?}", response_channel, e);
                        }
                    }
                    connected_once = true;
                    if let Some(tx) = connected_tx.take() {
                        let _ = tx.send(Ok(()));
                    }
                } else {
                    tracing::error!("Connection refused: {:?}", ack.code);
                    if let Some(tx) = connected_tx.take() {
                        let _ = tx.send(Err(TransportError::ConnectionRefused(format!(
                            "{:?}",
                            ack.code
                        ))));
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage {
                    channel: publish.topic,
                    payload: publish.payload,
                };
                if inbound_tx.send(message).await.is_err() {
                    tracing::debug!("Inbound receiver dropped, discarding message");
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                tracing::debug!("Disconnect sent, stopping event loop");
                break;
            }
            Ok(_) => {}
            Err(ConnectionError::ConnectionRefused(code)) if connected_tx.is_some() => {
                tracing::error!("Connection refused: {:?}", code);
                if let Some(tx) = connected_tx.take() {
                    let _ = tx.send(Err(TransportError::ConnectionRefused(format!(
                        "{:?}",
                        code
                    ))));
                }
                break;
            }
            Err(e) => {
                tracing::error!("MQTT connection error: {:?}", e);
                let jitter = rand::random::<f32>() * 0.2 + 0.9;
                tokio::select! {
                    _ = sleep(retry_delay.mul_f32(jitter)) => {},
                    _ = shutdown_rx.recv() => break,
                }
                retry_delay = (retry_delay * 2).min(MAX_RETRY_DELAY);
            }
        }
    }

    tracing::info!("MQTT event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const CONNACK: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

    fn broker_config(port: u16, connect_timeout_ms: u64) -> BrokerConfig {
        BrokerConfig {
            host: "127.0.0.1".to_string(),
            port,
            keep_alive_secs: 60,
            connect_timeout_ms,
            username: None,
            password: None,
            request_topic: "yolo/detect/request".to_string(),
            response_topic_prefix: "yolo/detect/response/".to_string(),
            inbound_capacity: 8,
        }
    }

    async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
        let header = stream.read_u8().await?;
        let mut remaining = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await?;
            remaining |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; remaining];
        stream.read_exact(&mut body).await?;
        Ok((header, body))
    }

    fn publish_packet(topic: &str, payload: &[u8]) -> Vec<u8> {
        let mut remaining = 2 + topic.len() + payload.len();
        let mut packet = vec![0x30];
        loop {
            let mut byte = (remaining % 128) as u8;
            remaining /= 128;
            if remaining > 0 {
                byte |= 0x80;
            }
            packet.push(byte);
            if remaining == 0 {
                break;
            }
        }
        packet.extend_from_slice(&(topic.len() as u16).to_be_bytes());
        packet.extend_from_slice(topic.as_bytes());
        packet.extend_from_slice(payload);
        packet
    }

    async fn accept_connect(listener: &TcpListener) -> TcpStream {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (header, _) = read_packet(&mut stream).await.unwrap();
        assert_eq!(header, 0x10, "expected CONNECT");
        stream.write_all(&CONNACK).await.unwrap();
        stream
    }

    #[tokio::test]
    async fn test_connect_times_out_without_broker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let identity = ClientIdentity::generate();
        let result = timeout(
            Duration::from_secs(5),
            MqttSession::connect(&broker_config(port, 300), &identity),
        )
        .await
        .unwrap();

        match result {
            Err(TransportError::ConnectTimeout(waited)) => {
                assert_eq!(waited, Duration::from_millis(300))
            }
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("connected without a broker"),
        }
    }

    #[tokio::test]
    async fn test_subscribes_private_channel_and_forwards_publishes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let broker = tokio::spawn(async move {
            let mut stream = accept_connect(&listener).await;

            let (header, body) = read_packet(&mut stream).await.unwrap();
            assert_eq!(header, 0x82, "expected SUBSCRIBE");
            let topic_len = u16::from_be_bytes([body[2], body[3]]) as usize;
            let topic = String::from_utf8(body[4..4 + topic_len].to_vec()).unwrap();
            stream
                .write_all(&[0x90, 0x03, body[0], body[1], 0x00])
                .await
                .unwrap();
            stream
                .write_all(&publish_packet(&topic, b"[]"))
                .await
                .unwrap();

            // Drain until the client releases the connection.
            while read_packet(&mut stream).await.is_ok() {}
            topic
        });

        let identity = ClientIdentity::from("test-client");
        let (session, mut inbound_rx) =
            MqttSession::connect(&broker_config(port, 2000), &identity)
                .await
                .unwrap();
        assert_eq!(session.response_channel(), "yolo/detect/response/test-client");

        let message = timeout(Duration::from_secs(5), inbound_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.channel, session.response_channel());
        assert_eq!(&message.payload[..], b"[]");

        session.close().await.unwrap();
        session.close().await.unwrap();
        assert!(matches!(
            session.publish("yolo/detect/request", vec![1]).await,
            Err(TransportError::Closed)
        ));

        let subscribed = timeout(Duration::from_secs(5), broker)
            .await
            .expect("connection was not released")
            .unwrap();
        assert_eq!(subscribed, "yolo/detect/response/test-client");
    }

    #[tokio::test]
    async fn test_close_returns_after_broker_loss_with_full_queue() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let broker = tokio::spawn(async move {
            let mut stream = accept_connect(&listener).await;
            // Take the subscription, then vanish together with the listener.
            let _ = read_packet(&mut stream).await;
        });

        let identity = ClientIdentity::generate();
        let (session, _inbound_rx) = MqttSession::connect(&broker_config(port, 2000), &identity)
            .await
            .unwrap();
        broker.await.unwrap();

        for _ in 0..(REQUEST_QUEUE_CAPACITY * 2) {
            let _ = session.publish("yolo/detect/request", vec![0; 16]).await;
        }

        let closed = timeout(Duration::from_secs(5), session.close()).await;
        assert!(closed.is_ok(), "close did not return after the broker went away");
        assert!(session.event_loop_handle.lock().is_none());
    }
}
