//! Media Engine
//!
//! Owns the RTP socket, the active stream context and the inbound audio
//! path. Runs its own receive task, independent of SIP signaling.

use super::codec::Codec;
use super::rtp::{MediaError, RtpStats, RtpStreamContext};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Inbound frames kept when no callback is registered
pub const INBOUND_QUEUE_CAPACITY: usize = 50;

/// Receives decoded PCM (16-bit little-endian) and the codec name
pub type AudioCallback = Arc<dyn Fn(&[u8], &str) + Send + Sync>;

/// Snapshot of the active stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub codec: Codec,
    pub payload_type: u8,
    pub remote: SocketAddr,
    pub ssrc: u32,
    pub stats: RtpStats,
}

pub struct MediaEngine {
    socket: Arc<UdpSocket>,
    context: Mutex<Option<RtpStreamContext>>,
    callback: RwLock<Option<AudioCallback>>,
    inbound: Mutex<VecDeque<Vec<i16>>>,
}

impl MediaEngine {
    /// Bind the RTP socket
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!("RTP socket bound to {}", socket.local_addr()?);

        Ok(Self {
            socket: Arc::new(socket),
            context: Mutex::new(None),
            callback: RwLock::new(None),
            inbound: Mutex::new(VecDeque::with_capacity(INBOUND_QUEUE_CAPACITY)),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Create the stream context for a newly connected call
    pub async fn start(&self, remote: SocketAddr, codec: Codec, payload_type: u8) {
        let context = RtpStreamContext::new(remote, codec, payload_type);
        info!(
            "Media started: {} (PT {}) to {}, ssrc={:08x}",
            codec,
            payload_type,
            remote,
            context.ssrc()
        );
        *self.context.lock().await = Some(context);
    }

    /// Tear down the stream context and drop queued audio
    pub async fn stop(&self) {
        if let Some(context) = self.context.lock().await.take() {
            let stats = context.stats();
            info!(
                "Media stopped: sent={} received={} dropped={}",
                stats.packets_sent, stats.packets_received, stats.packets_dropped
            );
        }
        self.inbound.lock().await.clear();
    }

    pub async fn is_active(&self) -> bool {
        self.context.lock().await.is_some()
    }

    pub async fn stream_info(&self) -> Option<StreamInfo> {
        self.context.lock().await.as_ref().map(|ctx| StreamInfo {
            codec: ctx.codec(),
            payload_type: ctx.payload_type(),
            remote: ctx.remote(),
            ssrc: ctx.ssrc(),
            stats: ctx.stats().clone(),
        })
    }

    pub async fn set_audio_callback(&self, callback: Option<AudioCallback>) {
        *self.callback.write().await = callback;
    }

    /// Encode and send one PCM frame.
    ///
    /// Returns `Ok(false)` without sending when no stream is active.
    pub async fn send_audio(&self, pcm: &[i16]) -> Result<bool, MediaError> {
        let (data, remote) = {
            let mut guard = self.context.lock().await;
            let Some(context) = guard.as_mut() else {
                debug!("No active media stream, dropping outbound frame");
                return Ok(false);
            };
            let packet = context.packetize(pcm)?;
            (packet.serialize(), context.remote())
        };

        self.socket
            .send_to(&data, remote)
            .await
            .map_err(|e| MediaError::Transport(e.to_string()))?;
        metrics::counter!("rtp_packets_sent_total").increment(1);
        Ok(true)
    }

    /// Decode one received datagram and deliver its audio.
    ///
    /// Returns true when audio was delivered.
    pub async fn handle_datagram(&self, data: &[u8], source: SocketAddr) -> bool {
        let (pcm, codec) = {
            let mut guard = self.context.lock().await;
            let Some(context) = guard.as_mut() else {
                debug!("RTP from {} with no active stream, ignoring", source);
                return false;
            };
            match context.depacketize(data) {
                Ok(pcm) => (pcm, context.codec()),
                Err(e) => {
                    debug!("Dropping RTP from {}: {}", source, e);
                    metrics::counter!("rtp_packets_dropped_total").increment(1);
                    return false;
                }
            }
        };
        metrics::counter!("rtp_packets_received_total").increment(1);

        if let Some(callback) = self.callback.read().await.as_ref() {
            let bytes: Vec<u8> = pcm.iter().flat_map(|s| s.to_le_bytes()).collect();
            callback(&bytes, codec.name());
            return true;
        }

        let mut queue = self.inbound.lock().await;
        if queue.len() >= INBOUND_QUEUE_CAPACITY {
            queue.pop_front();
            metrics::counter!("rtp_packets_dropped_total").increment(1);
        }
        queue.push_back(pcm);
        true
    }

    /// Pop the oldest queued inbound frame
    pub async fn read_audio(&self) -> Option<Vec<i16>> {
        self.inbound.lock().await.pop_front()
    }

    /// Number of queued inbound frames
    pub async fn pending_frames(&self) -> usize {
        self.inbound.lock().await.len()
    }

    /// Receive loop. Runs until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut buf = vec![0u8; 2048];

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok((len, source)) => {
                        self.handle_datagram(&buf[..len], source).await;
                    }
                    Err(e) => {
                        warn!("RTP recv error: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        }

        info!("RTP receiver stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::media::rtp::RtpPacket;
    use bytes::Bytes;

    async fn engine() -> MediaEngine {
        MediaEngine::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap()
    }

    fn pcmu_packet(sequence: u16) -> Bytes {
        RtpPacket::new(0, sequence, 0, 1, Bytes::from(vec![0xFFu8; 160])).serialize()
    }

    #[tokio::test]
    async fn test_send_without_stream_is_noop() {
        let media = engine().await;
        assert!(!media.send_audio(&[0i16; 160]).await.unwrap());
    }

    #[tokio::test]
    async fn test_send_reaches_remote() {
        let media = engine().await;
        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        media
            .start(remote.local_addr().unwrap(), Codec::Pcmu, 0)
            .await;

        assert!(media.send_audio(&[0i16; 160]).await.unwrap());

        let mut buf = [0u8; 512];
        let (len, _) = remote.recv_from(&mut buf).await.unwrap();
        let packet = RtpPacket::parse(&buf[..len]).unwrap();
        assert_eq!(packet.payload_type, 0);
        assert_eq!(packet.payload.len(), 160);
    }

    #[tokio::test]
    async fn test_wrong_frame_size_rejected() {
        let media = engine().await;
        media
            .start("127.0.0.1:9".parse().unwrap(), Codec::Pcmu, 0)
            .await;

        let err = media.send_audio(&[0i16; 10]).await.unwrap_err();
        assert!(matches!(err, MediaError::Codec(_)));
    }

    #[tokio::test]
    async fn test_inbound_queue_drops_oldest() {
        let media = engine().await;
        let source: SocketAddr = "127.0.0.1:9".parse().unwrap();
        media.start(source, Codec::Pcmu, 0).await;

        for seq in 0..(INBOUND_QUEUE_CAPACITY as u16 + 5) {
            assert!(media.handle_datagram(&pcmu_packet(seq), source).await);
        }
        assert_eq!(media.pending_frames().await, INBOUND_QUEUE_CAPACITY);

        let frame = media.read_audio().await.unwrap();
        assert_eq!(frame.len(), 160);
        assert_eq!(media.pending_frames().await, INBOUND_QUEUE_CAPACITY - 1);
    }

    #[tokio::test]
    async fn test_callback_receives_little_endian_pcm() {
        let media = engine().await;
        let source: SocketAddr = "127.0.0.1:9".parse().unwrap();
        media.start(source, Codec::Pcmu, 0).await;

        let received = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = received.clone();
        media
            .set_audio_callback(Some(Arc::new(move |pcm: &[u8], codec: &str| {
                sink.lock().unwrap().push((pcm.len(), codec.to_string()));
            })))
            .await;

        assert!(media.handle_datagram(&pcmu_packet(1), source).await);
        assert_eq!(media.pending_frames().await, 0);
        assert_eq!(received.lock().unwrap().as_slice(), &[(320, "PCMU".to_string())]);
    }

    #[tokio::test]
    async fn test_stop_clears_stream_and_queue() {
        let media = engine().await;
        let source: SocketAddr = "127.0.0.1:9".parse().unwrap();
        media.start(source, Codec::Pcmu, 0).await;
        media.handle_datagram(&pcmu_packet(1), source).await;

        media.stop().await;
        assert!(!media.is_active().await);
        assert_eq!(media.pending_frames().await, 0);
        assert!(!media.handle_datagram(&pcmu_packet(2), source).await);
    }
}
