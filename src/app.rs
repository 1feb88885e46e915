use crate::cli::{Args, Mode};
use crate::config::Config;
use crate::correlator::ResponseCorrelator;
use crate::dispatcher::RequestDispatcher;
use crate::identity::ClientIdentity;
use crate::presentation::{PresentationLoop, SingleImageOutcome};
use crate::render::AnnotatedImageWriter;
use crate::slot::LatestResponseSlot;
use crate::source::{open_still_image, open_stream_source};
use crate::transport::{MqttSession, Transport};

use std::sync::Arc;
use tokio::{signal, sync::broadcast};

pub async fn start_app(config: Config, args: Args) -> anyhow::Result<()> {
    let identity = ClientIdentity::generate();

    let (session, inbound_rx) = match MqttSession::connect(&config.broker, &identity).await {
        Ok(connected) => connected,
        Err(e) => {
            tracing::error!("Failed to connect to the MQTT broker: {}", e);
            return Err(e.into());
        }
    };
    let session = Arc::new(session);
    let slot = Arc::new(LatestResponseSlot::new());

    let (shutdown_tx, _) = broadcast::channel(1);
    let correlator_shutdown_rx = shutdown_tx.subscribe();
    let presentation_shutdown_rx = shutdown_tx.subscribe();

    let correlator_handle = ResponseCorrelator::new(session.response_channel(), slot.clone())
        .spawn(inbound_rx, correlator_shutdown_rx);

    tokio::spawn({
        let shutdown_tx = shutdown_tx.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, stopping.");
            let _ = shutdown_tx.send(());
        }
    });

    let dispatcher =
        RequestDispatcher::new(session.clone(), identity, &config.broker.request_topic);
    let result = run_mode(&config, &args, dispatcher, slot, presentation_shutdown_rx).await;

    if let Err(e) = session.close().await {
        tracing::warn!("Failed to close MQTT session cleanly: {}", e);
    }
    let _ = shutdown_tx.send(());
    let _ = correlator_handle.await;
    tracing::info!("Client stopped.");

    result
}

async fn run_mode(
    config: &Config,
    args: &Args,
    dispatcher: RequestDispatcher<MqttSession>,
    slot: Arc<LatestResponseSlot>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let output_dir = args
        .output
        .clone()
        .unwrap_or_else(|| config.render.output_dir.clone());
    let font_path = config.render.font_path.as_deref();

    match args.mode {
        Mode::Image => {
            let frame = open_still_image(&args.source).inspect_err(|e| {
                tracing::error!("Cannot read image {}: {}", args.source, e);
            })?;
            let renderer = AnnotatedImageWriter::new(&output_dir, "result.jpg", font_path)?;
            let result_path = renderer.path().to_path_buf();

            let mut presentation = PresentationLoop::new(
                dispatcher,
                slot,
                renderer,
                config.single_image.clone(),
                config.streaming.clone(),
            );

            tracing::info!("Connected. Sending image {}", args.source);
            tokio::select! {
                outcome = presentation.run_single_image(&frame) => match outcome? {
                    SingleImageOutcome::Delivered => {
                        tracing::info!("Annotated result written to {}", result_path.display());
                    }
                    SingleImageOutcome::TimedOut => {
                        tracing::warn!("No response received from the server.");
                    }
                },
                _ = shutdown_rx.recv() => {
                    tracing::info!("Interrupted while waiting for a response.");
                }
            }
        }
        Mode::Video => {
            let mut source = open_stream_source(&args.source).inspect_err(|e| {
                tracing::error!("Cannot open video source {}: {}", args.source, e);
            })?;
            let renderer = AnnotatedImageWriter::new(&output_dir, "latest.jpg", font_path)?;
            tracing::info!("Rendering frames to {}", renderer.path().display());

            let mut presentation = PresentationLoop::new(
                dispatcher,
                slot,
                renderer,
                config.single_image.clone(),
                config.streaming.clone(),
            );

            presentation
                .run_streaming(source.as_mut(), &mut shutdown_rx)
                .await;
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
