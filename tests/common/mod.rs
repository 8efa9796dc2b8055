//! Fake SIP peer shared by the integration tests

#![allow(dead_code)]

use simplesip::infrastructure::protocols::sip::{parse_message, MessageKind, ParsedMessage, ResponseBuilder, SipMethod};
use simplesip::ClientConfig;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;

pub struct FakePeer {
    pub socket: UdpSocket,
}

impl FakePeer {
    pub async fn bind() -> Self {
        Self {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    /// Client config pointing at this peer with short timers
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new("1001", "secret", "127.0.0.1");
        config.server_port = self.addr().port();
        config.local_address = Some("127.0.0.1".to_string());
        config.local_port = 0;
        config.media_port = 0;
        config.timers.retry_interval_ms = 500;
        config.timers.transaction_timeout_ms = 3000;
        config.timers.poll_interval_ms = 50;
        config
    }

    pub async fn recv(&self) -> Option<(ParsedMessage, SocketAddr)> {
        let mut buf = vec![0u8; 65535];
        let (len, source) = tokio::time::timeout(Duration::from_secs(3), self.socket.recv_from(&mut buf))
            .await
            .ok()?
            .ok()?;
        Some((parse_message(&buf[..len]).unwrap(), source))
    }

    /// Next request with the given method, skipping anything else
    pub async fn expect_request(&self, method: SipMethod) -> (ParsedMessage, SocketAddr) {
        loop {
            let (message, source) = self
                .recv()
                .await
                .unwrap_or_else(|| panic!("no {} received", method));
            if message.kind == MessageKind::Request(method) {
                return (message, source);
            }
        }
    }

    /// Next response with the given status code
    pub async fn expect_response(&self, code: u16) -> ParsedMessage {
        loop {
            let (message, _) = self
                .recv()
                .await
                .unwrap_or_else(|| panic!("no {} response received", code));
            if message.status_code() == Some(code) {
                return message;
            }
        }
    }

    pub async fn reply(&self, request: &ParsedMessage, to: SocketAddr, builder: ResponseBuilder) {
        let data = builder.build_for_request(request).unwrap();
        self.socket.send_to(&data, to).await.unwrap();
    }

    pub async fn send(&self, data: &[u8], to: SocketAddr) {
        self.socket.send_to(data, to).await.unwrap();
    }
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
