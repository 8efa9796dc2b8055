use simplesip::{CallState, ClientConfig, ClientEvent, SipClient};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Usage: simplesip [config-file] [destination] [seconds]
///
/// Registers, optionally calls `destination` and streams silence for
/// `seconds` (default 10), then hangs up.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let config_path = args.next().map(PathBuf::from);
    let destination = args.next();
    let seconds: u64 = args.next().and_then(|s| s.parse().ok()).unwrap_or(10);

    let config = ClientConfig::load(config_path.as_deref())?;
    info!("Starting simplesip {} for {}@{}", env!("CARGO_PKG_VERSION"), config.username, config.server);

    let client = SipClient::connect(config).await?;
    let mut events = client.events();

    client.register().await?;
    if !client.wait_for_state(CallState::Idle, Duration::from_secs(35)).await
        || !client.status().await.registered
    {
        warn!("Registration did not complete: {:?}", client.status().await.last_error);
    }

    if let Some(destination) = destination {
        let call_id = client.make_call(&destination).await?;
        info!("Dialing {} ({})", destination, call_id);

        if client.wait_for_state(CallState::Connected, Duration::from_secs(35)).await {
            let status = client.status().await;
            info!(
                "Connected: {:?} to {:?}",
                status.negotiated_codec, status.remote_media_address
            );

            let samples = status.negotiated_codec.map_or(160, |c| c.samples_per_frame());
            let silence = vec![0i16; samples];
            let mut ticker = tokio::time::interval(Duration::from_millis(20));
            let deadline = tokio::time::Instant::now() + Duration::from_secs(seconds);

            while tokio::time::Instant::now() < deadline && client.current_state().in_call() {
                ticker.tick().await;
                if let Err(e) = client.send_audio(&silence).await {
                    warn!("send_audio: {}", e);
                }
                while client.read_audio().await.is_some() {}
            }

            if client.current_state().in_call() {
                client.hangup().await?;
            }
        } else {
            warn!("Call not answered: {:?}", client.status().await.last_error);
            if client.current_state().in_call() {
                client.hangup().await?;
            }
        }
    }

    client.disconnect().await?;

    if let Some(events) = events.as_mut() {
        while let Ok(notification) = events.try_recv() {
            if let ClientEvent::CallFailed { reason, .. } = &notification.event {
                warn!("Call failed: {}", reason);
            }
        }
    }

    info!("simplesip stopped");
    Ok(())
}
