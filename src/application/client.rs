//! SIP Client
//!
//! Owns the sockets and the background tasks. Public calls lock the
//! [`UserAgentCore`], collect its actions and perform them before the lock is
//! released; the dispatch loop does the same for inbound datagrams and the
//! periodic timeout sweep. Published state, the RTP context and outgoing
//! datagrams therefore always follow the order the core produced them in.

use super::core::{Action, UserAgentCore};
use super::error::Result;
use crate::config::ClientConfig;
use crate::domain::call::CallState;
use crate::domain::shared::{ClientEvent, ClientNotification};
use crate::infrastructure::media::{AudioCallback, Codec, MediaEngine, MediaError};
use crate::infrastructure::protocols::sip::transport::{advertised_ip, resolve_server};
use crate::infrastructure::protocols::sip::{
    IncomingMessage, OutgoingMessage, SipError, Transport, UdpTransport,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Snapshot of everything a caller may want to poll
#[derive(Debug, Clone, PartialEq)]
pub struct CallStatus {
    pub state: CallState,
    pub call_id: Option<String>,
    pub negotiated_codec: Option<Codec>,
    pub payload_type: Option<u8>,
    pub remote_media_address: Option<SocketAddr>,
    pub pending_media_buffer_depth: usize,
    pub registered: bool,
    pub last_error: Option<String>,
    /// INVITE to answer, for the current or most recent call
    pub setup_duration: Option<Duration>,
    /// Answer to hangup, or to now while the call is up
    pub call_duration: Option<Duration>,
}

/// Performs core actions. Shared by the API surface and the dispatch loop.
#[derive(Clone)]
struct Executor {
    transport: Arc<dyn Transport>,
    media: Arc<MediaEngine>,
    state_tx: Arc<watch::Sender<CallState>>,
    events_tx: mpsc::UnboundedSender<ClientNotification>,
}

impl Executor {
    async fn execute(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send { data, destination } => {
                    if let Err(e) = self.transport.send(OutgoingMessage { data, destination }).await {
                        error!("Signaling send to {} failed: {}", destination, e);
                    }
                }
                Action::StartMedia {
                    remote,
                    codec,
                    payload_type,
                } => self.media.start(remote, codec, payload_type).await,
                Action::StopMedia => self.media.stop().await,
                Action::Emit(event) => {
                    if let ClientEvent::StateChanged { to, .. } = &event {
                        self.state_tx.send_replace(*to);
                    }
                    debug!("Event: {}", event.name());
                    // Nobody listening is fine
                    let _ = self.events_tx.send(ClientNotification::new(event));
                }
            }
        }
    }
}

pub struct SipClient {
    core: Arc<Mutex<UserAgentCore>>,
    executor: Executor,
    state_rx: watch::Receiver<CallState>,
    events_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<ClientNotification>>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    local_addr: SocketAddr,
    media_addr: SocketAddr,
}

impl SipClient {
    /// Bind both sockets and start the dispatch and media tasks
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let server_addr = resolve_server(&config.server, config.server_port).await?;
        let advertised: IpAddr = match &config.local_address {
            Some(address) => address
                .parse()
                .map_err(|_| SipError::Encoding(format!("invalid local_address: {}", address)))?,
            None => advertised_ip(server_addr),
        };

        let mut transport = UdpTransport::new(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            config.local_port,
        ));
        transport.start().await?;
        let receiver = transport
            .take_receiver()
            .ok_or_else(|| SipError::Transport("transport receiver already taken".to_string()))?;
        let local_addr = SocketAddr::new(advertised, transport.local_addr()?.port());

        let media = Arc::new(
            MediaEngine::bind(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                config.media_port,
            ))
            .await?,
        );
        let media_addr = SocketAddr::new(advertised, media.local_addr()?.port());

        info!(
            "SIP client {}@{} up: signaling {}, media {}, server {}",
            config.username, config.server, local_addr, media_addr, server_addr
        );

        let poll_interval = config.timers.poll_interval();
        let core = Arc::new(Mutex::new(UserAgentCore::new(
            config,
            server_addr,
            local_addr,
            media_addr,
        )));

        let (state_tx, state_rx) = watch::channel(CallState::Idle);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let executor = Executor {
            transport: Arc::new(transport),
            media: media.clone(),
            state_tx: Arc::new(state_tx),
            events_tx,
        };

        let shutdown = CancellationToken::new();
        let dispatch = tokio::spawn(dispatch_loop(
            core.clone(),
            executor.clone(),
            receiver,
            poll_interval,
            shutdown.clone(),
        ));
        let media_task = tokio::spawn(media.run(shutdown.clone()));

        Ok(Self {
            core,
            executor,
            state_rx,
            events_rx: std::sync::Mutex::new(Some(events_rx)),
            shutdown,
            tasks: Mutex::new(vec![dispatch, media_task]),
            local_addr,
            media_addr,
        })
    }

    /// Advertised signaling address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Advertised RTP address
    pub fn media_addr(&self) -> SocketAddr {
        self.media_addr
    }

    /// Event stream. Returns `Some` only on the first call.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<ClientNotification>> {
        self.events_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    pub fn current_state(&self) -> CallState {
        *self.state_rx.borrow()
    }

    /// Wait until the call state equals `state`
    pub async fn wait_for_state(&self, state: CallState, timeout: Duration) -> bool {
        let mut rx = self.state_rx.clone();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == state))
            .await
            .map_or(false, |r| r.is_ok())
    }

    pub async fn register(&self) -> Result<()> {
        apply(&self.core, &self.executor, |core| {
            Ok(((), core.register(Instant::now())?))
        })
        .await
    }

    /// Place a call. Returns its Call-ID once the INVITE is out.
    pub async fn make_call(&self, destination: &str) -> Result<String> {
        apply(&self.core, &self.executor, |core| {
            core.make_call(destination, Instant::now())
        })
        .await
    }

    /// Answer the ringing inbound call
    pub async fn answer(&self) -> Result<()> {
        apply(&self.core, &self.executor, |core| Ok(((), core.answer()?))).await
    }

    pub async fn hangup(&self) -> Result<()> {
        apply(&self.core, &self.executor, |core| {
            Ok(((), core.hangup(Instant::now())?))
        })
        .await
    }

    /// Ask the registrar which methods it allows
    pub async fn query_capabilities(&self) -> Result<()> {
        apply(&self.core, &self.executor, |core| {
            Ok(((), core.query_capabilities(Instant::now())?))
        })
        .await
    }

    /// Methods from the last OPTIONS answer
    pub async fn server_capabilities(&self) -> Vec<String> {
        self.core.lock().await.capabilities().to_vec()
    }

    /// Encode and send one PCM frame.
    ///
    /// Returns `Ok(false)` when no call is connected. The first frame sent
    /// moves the call to streaming.
    pub async fn send_audio(&self, pcm: &[i16]) -> Result<bool> {
        let state = self.current_state();
        if !state.media_allowed() {
            debug!("send_audio while {}, frame dropped", state);
            return Ok(false);
        }

        match self.executor.media.send_audio(pcm).await {
            Ok(true) => {
                if state == CallState::Connected {
                    apply(&self.core, &self.executor, |core| Ok(((), core.media_flowing())))
                        .await?;
                }
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(MediaError::Transport(e)) => {
                warn!("RTP send failed: {}", e);
                Err(MediaError::Transport(e).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Deliver decoded inbound audio to `callback` instead of the queue
    pub async fn set_audio_callback(&self, callback: Option<AudioCallback>) {
        self.executor.media.set_audio_callback(callback).await;
    }

    /// Pop the oldest queued inbound frame
    pub async fn read_audio(&self) -> Option<Vec<i16>> {
        self.executor.media.read_audio().await
    }

    pub async fn status(&self) -> CallStatus {
        let (state, call_id, media, registered, last_error, stats) = {
            let core = self.core.lock().await;
            (
                core.state(),
                core.call().map(|c| c.call_id.clone()),
                core.media().cloned(),
                core.is_registered(),
                core.last_error().map(str::to_string),
                core.call_stats().clone(),
            )
        };

        CallStatus {
            state,
            call_id,
            negotiated_codec: media.as_ref().map(|m| m.codec),
            payload_type: media.as_ref().map(|m| m.payload_type),
            remote_media_address: media.as_ref().map(|m| m.remote_address),
            pending_media_buffer_depth: self.executor.media.pending_frames().await,
            registered,
            last_error,
            setup_duration: stats.setup_duration(),
            call_duration: stats.call_duration(),
        }
    }

    /// Hang up any call, stop the background tasks and release the sockets
    pub async fn disconnect(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        info!("Disconnecting SIP client");

        apply(&self.core, &self.executor, |core| {
            Ok(((), core.shutdown(Instant::now())))
        })
        .await?;

        self.shutdown.cancel();
        self.executor.media.stop().await;
        self.executor.transport.stop().await?;

        for task in self.tasks.lock().await.drain(..) {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        Ok(())
    }
}

impl Drop for SipClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Run one core operation and perform its actions while the core is locked
async fn apply<T>(
    core: &Mutex<UserAgentCore>,
    executor: &Executor,
    op: impl FnOnce(&mut UserAgentCore) -> Result<(T, Vec<Action>)>,
) -> Result<T> {
    let mut core = core.lock().await;
    let (value, actions) = op(&mut *core)?;
    executor.execute(actions).await;
    Ok(value)
}

async fn handle_incoming(core: &Mutex<UserAgentCore>, executor: &Executor, incoming: IncomingMessage) {
    let mut core = core.lock().await;
    let actions = core.handle_message(&incoming.message, incoming.source, Instant::now());
    executor.execute(actions).await;
}

async fn sweep(core: &Mutex<UserAgentCore>, executor: &Executor) {
    let mut core = core.lock().await;
    let actions = core.on_timeout_sweep(Instant::now());
    executor.execute(actions).await;
}

async fn dispatch_loop(
    core: Arc<Mutex<UserAgentCore>>,
    executor: Executor,
    mut receiver: mpsc::Receiver<IncomingMessage>,
    poll_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => sweep(&core, &executor).await,
            incoming = receiver.recv() => match incoming {
                Some(incoming) => handle_incoming(&core, &executor, incoming).await,
                None => break,
            },
        }
    }

    info!("SIP dispatch loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::{parse_message, ResponseBuilder, SDP_CONTENT_TYPE};
    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::sync::Notify;

    /// Records datagrams; an ACK is held until `ack_gate` is notified
    #[derive(Default)]
    struct GatedTransport {
        sent: std::sync::Mutex<Vec<Bytes>>,
        ack_gate: Notify,
    }

    #[async_trait]
    impl Transport for GatedTransport {
        async fn start(&mut self) -> std::result::Result<(), SipError> {
            Ok(())
        }

        async fn stop(&self) -> std::result::Result<(), SipError> {
            Ok(())
        }

        async fn send(&self, message: OutgoingMessage) -> std::result::Result<(), SipError> {
            if message.data.starts_with(b"ACK ") {
                self.ack_gate.notified().await;
            }
            self.sent.lock().unwrap().push(message.data);
            Ok(())
        }

        fn take_receiver(&mut self) -> Option<mpsc::Receiver<IncomingMessage>> {
            None
        }

        fn local_addr(&self) -> std::result::Result<SocketAddr, SipError> {
            Ok("127.0.0.1:5060".parse().unwrap())
        }
    }

    fn sent_methods(transport: &GatedTransport) -> Vec<String> {
        transport
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|data| {
                String::from_utf8_lossy(data)
                    .split(' ')
                    .next()
                    .unwrap_or_default()
                    .to_string()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_hangup_waits_for_answer_in_progress() {
        let server: SocketAddr = "127.0.0.1:5070".parse().unwrap();
        let media = Arc::new(MediaEngine::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
        let transport = Arc::new(GatedTransport::default());
        let (state_tx, state_rx) = watch::channel(CallState::Idle);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let executor = Executor {
            transport: transport.clone(),
            media: media.clone(),
            state_tx: Arc::new(state_tx),
            events_tx,
        };
        let core = Arc::new(Mutex::new(UserAgentCore::new(
            ClientConfig::new("1001", "secret", "127.0.0.1"),
            server,
            "127.0.0.1:5060".parse().unwrap(),
            media.local_addr().unwrap(),
        )));

        apply(&core, &executor, |core| core.make_call("1002", Instant::now()))
            .await
            .unwrap();
        let invite = parse_message(&transport.sent.lock().unwrap()[0]).unwrap();
        let sdp = Bytes::from_static(
            b"v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nc=IN IP4 127.0.0.1\r\nt=0 0\r\n\
              m=audio 30000 RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n",
        );
        let ok = ResponseBuilder::ok()
            .to_tag("callee")
            .body(SDP_CONTENT_TYPE, sdp)
            .build_for_request(&invite)
            .unwrap();
        let incoming = IncomingMessage {
            message: parse_message(&ok).unwrap(),
            source: server,
        };

        // The 200 OK parks on its ACK with the core locked
        let answered = tokio::spawn({
            let (core, executor) = (core.clone(), executor.clone());
            async move { handle_incoming(&core, &executor, incoming).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let hangup = tokio::spawn({
            let (core, executor) = (core.clone(), executor.clone());
            async move {
                apply(&core, &executor, |core| Ok(((), core.hangup(Instant::now())?))).await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!hangup.is_finished());

        transport.ack_gate.notify_one();
        answered.await.unwrap();
        hangup.await.unwrap().unwrap();

        assert_eq!(core.lock().await.state(), CallState::Idle);
        assert_eq!(*state_rx.borrow(), CallState::Idle);
        assert!(!media.is_active().await);
        assert_eq!(sent_methods(&transport), vec!["INVITE", "ACK", "BYE"]);
    }
}
