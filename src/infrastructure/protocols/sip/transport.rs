//! SIP transport layer - UDP signaling socket

use super::message::{parse_message, ParsedMessage, SipError};
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const RECEIVE_BUFFER_SIZE: usize = 65535;

/// Incoming SIP message with source information
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message: ParsedMessage,
    pub source: SocketAddr,
}

/// Outgoing SIP message with destination information
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub data: Bytes,
    pub destination: SocketAddr,
}

/// Transport layer trait
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Start the transport
    async fn start(&mut self) -> Result<(), SipError>;

    /// Stop the transport
    async fn stop(&self) -> Result<(), SipError>;

    /// Send a message
    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError>;

    /// Hand over the receiver for incoming messages. Yields `Some` once.
    fn take_receiver(&mut self) -> Option<mpsc::Receiver<IncomingMessage>>;

    /// Address the socket is bound to
    fn local_addr(&self) -> Result<SocketAddr, SipError>;
}

/// UDP transport implementation
pub struct UdpTransport {
    bind_addr: SocketAddr,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    local_addr: Option<SocketAddr>,
    shutdown: CancellationToken,
    tx: mpsc::Sender<IncomingMessage>,
    rx: Option<mpsc::Receiver<IncomingMessage>>,
}

impl UdpTransport {
    pub fn new(bind_addr: SocketAddr) -> Self {
        let (tx, rx) = mpsc::channel(1000);
        Self {
            bind_addr,
            socket: RwLock::new(None),
            local_addr: None,
            shutdown: CancellationToken::new(),
            tx,
            rx: Some(rx),
        }
    }

    async fn receive_loop(
        socket: Arc<UdpSocket>,
        tx: mpsc::Sender<IncomingMessage>,
        shutdown: CancellationToken,
    ) {
        let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];

        loop {
            let (size, source) = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = socket.recv_from(&mut buf) => match result {
                    Ok(received) => received,
                    Err(e) => {
                        // ICMP port unreachable surfaces here on some platforms
                        warn!("Failed to receive UDP packet: {}", e);
                        continue;
                    }
                }
            };

            debug!(
                "Received {} bytes from {} via UDP:\n{}",
                size,
                source,
                String::from_utf8_lossy(&buf[..size])
            );

            match parse_message(&buf[..size]) {
                Ok(message) => {
                    if tx.send(IncomingMessage { message, source }).await.is_err() {
                        debug!("Incoming message channel closed");
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to parse SIP message from {}: {}", source, e);
                }
            }
        }

        info!("UDP receive loop stopped");
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    async fn start(&mut self) -> Result<(), SipError> {
        info!("Starting UDP transport on {}", self.bind_addr);

        let socket = UdpSocket::bind(self.bind_addr)
            .await
            .map_err(|e| SipError::Transport(format!("Failed to bind UDP socket: {}", e)))?;
        let local_addr = socket.local_addr()?;
        info!("UDP transport listening on {}", local_addr);

        let socket = Arc::new(socket);
        *self.socket.write().await = Some(socket.clone());
        self.local_addr = Some(local_addr);

        tokio::spawn(Self::receive_loop(
            socket,
            self.tx.clone(),
            self.shutdown.clone(),
        ));

        Ok(())
    }

    async fn stop(&self) -> Result<(), SipError> {
        info!("Stopping UDP transport");
        self.shutdown.cancel();
        *self.socket.write().await = None;
        Ok(())
    }

    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError> {
        let socket = self
            .socket
            .read()
            .await
            .clone()
            .ok_or_else(|| SipError::Transport("Socket not initialized".to_string()))?;

        debug!(
            "Sending {} bytes to {} via UDP:\n{}",
            message.data.len(),
            message.destination,
            String::from_utf8_lossy(&message.data)
        );

        socket
            .send_to(&message.data, message.destination)
            .await
            .map_err(|e| {
                error!("Failed to send UDP packet to {}: {}", message.destination, e);
                SipError::Transport(format!("Failed to send UDP packet: {}", e))
            })?;

        Ok(())
    }

    fn take_receiver(&mut self) -> Option<mpsc::Receiver<IncomingMessage>> {
        self.rx.take()
    }

    fn local_addr(&self) -> Result<SocketAddr, SipError> {
        self.local_addr
            .ok_or_else(|| SipError::Transport("Transport not started".to_string()))
    }
}

/// Resolve the registrar's host name to a socket address
pub async fn resolve_server(host: &str, port: u16) -> Result<SocketAddr, SipError> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| SipError::Transport(format!("Failed to resolve {}: {}", host, e)))?;
    addrs
        .find(|a| a.is_ipv4())
        .ok_or_else(|| SipError::Transport(format!("No IPv4 address for {}", host)))
}

/// Local IP the OS would route toward `server`.
///
/// Connecting a UDP socket sends nothing; it only selects a route. Falls back
/// to loopback when no route is found or the result is unspecified.
pub fn advertised_ip(server: SocketAddr) -> IpAddr {
    let routed = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| socket.connect(server).map(|_| socket))
        .and_then(|socket| socket.local_addr());

    match routed {
        Ok(addr) if !addr.ip().is_unspecified() => addr.ip(),
        Ok(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        Err(e) => {
            warn!("Could not determine local address toward {}: {}", server, e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}
