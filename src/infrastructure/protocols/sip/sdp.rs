//! Simple SDP (Session Description Protocol) handling
//!
//! Audio-only offers and answers over RTP/AVP, plus the negotiation step that
//! turns a remote description into a codec, payload type and media address.

use super::message::SipError;
use crate::infrastructure::media::codec::{Codec, CodecInfo, CodecNegotiator};
use crate::infrastructure::media::rtp::TELEPHONE_EVENT_PAYLOAD_TYPE;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

pub const SDP_CONTENT_TYPE: &str = "application/sdp";

/// Simple SDP session
#[derive(Debug, Clone)]
pub struct SdpSession {
    pub version: u32,
    pub origin: SdpOrigin,
    pub session_name: String,
    pub connection: Option<SdpConnection>,
    pub media: Vec<SdpMedia>,
}

#[derive(Debug, Clone)]
pub struct SdpOrigin {
    pub username: String,
    pub session_id: String,
    pub session_version: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpConnection {
    pub address_type: String,
    pub address: String,
}

impl SdpConnection {
    fn for_ip(ip: IpAddr) -> Self {
        Self {
            address_type: if ip.is_ipv4() { "IP4" } else { "IP6" }.to_string(),
            address: ip.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SdpMedia {
    pub media_type: String,
    pub port: u16,
    pub protocol: String,
    pub formats: Vec<u8>,
    /// (payload type, "NAME/rate[/channels]")
    pub rtpmap: Vec<(u8, String)>,
    pub fmtp: Vec<(u8, String)>,
    pub connection: Option<SdpConnection>,
    pub attributes: Vec<String>,
}

impl SdpMedia {
    /// Offered formats in `m=` order, resolved through rtpmap or the static table
    pub fn codec_infos(&self) -> Vec<CodecInfo> {
        self.formats
            .iter()
            .filter_map(|pt| match self.rtpmap.iter().find(|(p, _)| p == pt) {
                Some((_, encoding)) => parse_rtpmap_encoding(*pt, encoding),
                None => CodecInfo::from_static(*pt),
            })
            .collect()
    }
}

fn parse_rtpmap_encoding(payload_type: u8, encoding: &str) -> Option<CodecInfo> {
    let mut parts = encoding.split('/');
    let name = parts.next()?.trim();
    let clock_rate = parts.next()?.trim().parse().ok()?;
    let mut info = CodecInfo::new(payload_type, name.to_string(), clock_rate);
    if let Some(channels) = parts.next().and_then(|c| c.trim().parse().ok()) {
        info.channels = channels;
    }
    Some(info)
}

impl SdpSession {
    /// Create an audio session advertising `codecs` in preference order
    pub fn audio(local: SocketAddr, codecs: &[Codec], telephone_events: bool) -> Self {
        let connection = SdpConnection::for_ip(local.ip());

        let mut formats: Vec<u8> = codecs.iter().map(|c| c.payload_type()).collect();
        let mut rtpmap: Vec<(u8, String)> = codecs
            .iter()
            .map(|c| (c.payload_type(), format!("{}/{}", c.name(), c.clock_rate())))
            .collect();
        let fmtp = codecs
            .iter()
            .filter(|c| **c == Codec::G722)
            .map(|c| (c.payload_type(), format!("bitrate={}", c.bitrate())))
            .collect();

        if telephone_events {
            formats.push(TELEPHONE_EVENT_PAYLOAD_TYPE);
            rtpmap.push((TELEPHONE_EVENT_PAYLOAD_TYPE, "telephone-event/8000".to_string()));
        }

        Self {
            version: 0,
            origin: SdpOrigin {
                username: "simplesip".to_string(),
                session_id: chrono::Utc::now().timestamp().to_string(),
                session_version: "1".to_string(),
                address: connection.address.clone(),
            },
            session_name: "simplesip".to_string(),
            connection: Some(connection),
            media: vec![SdpMedia {
                media_type: "audio".to_string(),
                port: local.port(),
                protocol: "RTP/AVP".to_string(),
                formats,
                rtpmap,
                fmtp,
                connection: None,
                attributes: vec!["ptime:20".to_string(), "sendrecv".to_string()],
            }],
        }
    }

    /// Parse SDP from string
    pub fn parse(body: &str) -> Result<Self, SipError> {
        let mut version = 0;
        let mut origin: Option<SdpOrigin> = None;
        let mut session_name = String::new();
        let mut connection: Option<SdpConnection> = None;
        let mut media: Vec<SdpMedia> = Vec::new();

        for line in body.lines() {
            let line = line.trim();
            let Some((field, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();

            match field {
                "v" => version = value.parse().unwrap_or(0),
                "o" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 6 {
                        origin = Some(SdpOrigin {
                            username: parts[0].to_string(),
                            session_id: parts[1].to_string(),
                            session_version: parts[2].to_string(),
                            address: parts[5].to_string(),
                        });
                    }
                }
                "s" => session_name = value.to_string(),
                "c" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 3 {
                        // Strip any multicast TTL suffix
                        let address = parts[2].split('/').next().unwrap_or(parts[2]);
                        let conn = SdpConnection {
                            address_type: parts[1].to_string(),
                            address: address.to_string(),
                        };
                        match media.last_mut() {
                            Some(m) => m.connection = Some(conn),
                            None => connection = Some(conn),
                        }
                    }
                }
                "m" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() < 3 {
                        return Err(SipError::Parse(format!("malformed m= line: {}", value)));
                    }
                    // "port/count" is allowed; only the base port matters
                    let port = parts[1]
                        .split('/')
                        .next()
                        .and_then(|p| p.parse::<u16>().ok())
                        .ok_or_else(|| SipError::Parse(format!("invalid media port: {}", parts[1])))?;
                    media.push(SdpMedia {
                        media_type: parts[0].to_string(),
                        port,
                        protocol: parts[2].to_string(),
                        formats: parts[3..].iter().filter_map(|f| f.parse().ok()).collect(),
                        rtpmap: Vec::new(),
                        fmtp: Vec::new(),
                        connection: None,
                        attributes: Vec::new(),
                    });
                }
                "a" => {
                    let Some(current) = media.last_mut() else {
                        continue;
                    };
                    if let Some(rest) = value.strip_prefix("rtpmap:") {
                        if let Some((pt, encoding)) = rest.split_once(' ') {
                            if let Ok(pt) = pt.parse() {
                                current.rtpmap.push((pt, encoding.trim().to_string()));
                            }
                        }
                    } else if let Some(rest) = value.strip_prefix("fmtp:") {
                        if let Some((pt, params)) = rest.split_once(' ') {
                            if let Ok(pt) = pt.parse() {
                                current.fmtp.push((pt, params.trim().to_string()));
                            }
                        }
                    } else {
                        current.attributes.push(value.to_string());
                    }
                }
                _ => {}
            }
        }

        let origin = origin.unwrap_or(SdpOrigin {
            username: "-".to_string(),
            session_id: "0".to_string(),
            session_version: "0".to_string(),
            address: String::new(),
        });

        Ok(Self {
            version,
            origin,
            session_name,
            connection,
            media,
        })
    }

    /// Get media description for audio
    pub fn audio_media(&self) -> Option<&SdpMedia> {
        self.media.iter().find(|m| m.media_type == "audio")
    }

    /// Remote RTP endpoint of the audio stream; media-level c= wins over session-level
    pub fn audio_address(&self) -> Result<SocketAddr, SipError> {
        let media = self
            .audio_media()
            .ok_or_else(|| SipError::Parse("no audio media description".to_string()))?;
        if media.port == 0 {
            return Err(SipError::Parse("audio stream is disabled (port 0)".to_string()));
        }
        let connection = media
            .connection
            .as_ref()
            .or(self.connection.as_ref())
            .ok_or_else(|| SipError::Parse("no connection address".to_string()))?;
        let ip: IpAddr = connection.address.parse().map_err(|_| {
            SipError::Parse(format!("invalid connection address: {}", connection.address))
        })?;
        Ok(SocketAddr::new(ip, media.port))
    }
}

impl fmt::Display for SdpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v={}\r\n", self.version)?;
        let origin_type = self
            .connection
            .as_ref()
            .map(|c| c.address_type.as_str())
            .unwrap_or("IP4");
        write!(
            f,
            "o={} {} {} IN {} {}\r\n",
            self.origin.username,
            self.origin.session_id,
            self.origin.session_version,
            origin_type,
            self.origin.address
        )?;
        write!(f, "s={}\r\n", self.session_name)?;
        if let Some(conn) = &self.connection {
            write!(f, "c=IN {} {}\r\n", conn.address_type, conn.address)?;
        }
        write!(f, "t=0 0\r\n")?;

        for media in &self.media {
            let formats: Vec<String> = media.formats.iter().map(|p| p.to_string()).collect();
            write!(
                f,
                "m={} {} {} {}\r\n",
                media.media_type,
                media.port,
                media.protocol,
                formats.join(" ")
            )?;
            if let Some(conn) = &media.connection {
                write!(f, "c=IN {} {}\r\n", conn.address_type, conn.address)?;
            }
            for (pt, encoding) in &media.rtpmap {
                write!(f, "a=rtpmap:{} {}\r\n", pt, encoding)?;
            }
            for (pt, params) in &media.fmtp {
                write!(f, "a=fmtp:{} {}\r\n", pt, params)?;
            }
            for attribute in &media.attributes {
                write!(f, "a={}\r\n", attribute)?;
            }
        }
        Ok(())
    }
}

/// Result of negotiating against a remote description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedMedia {
    pub remote_address: SocketAddr,
    pub codec: Codec,
    pub payload_type: u8,
}

/// Build the local offer.
///
/// With `diagnostic` set, every codec the transcoder knows is offered along
/// with telephone-event, regardless of the configured list.
pub fn generate_session_description(local: SocketAddr, codecs: &[Codec], diagnostic: bool) -> String {
    if diagnostic {
        SdpSession::audio(local, &Codec::ALL, true).to_string()
    } else {
        SdpSession::audio(local, codecs, false).to_string()
    }
}

/// Build an answer carrying only the negotiated codec
pub fn generate_answer(local: SocketAddr, codec: Codec) -> String {
    SdpSession::audio(local, &[codec], false).to_string()
}

/// Extract the remote media endpoint and pick the codec.
///
/// The first remote-offered codec we support wins.
pub fn parse_session_description(
    body: &[u8],
    negotiator: &CodecNegotiator,
) -> Result<NegotiatedMedia, SipError> {
    let text = std::str::from_utf8(body)
        .map_err(|_| SipError::Parse("session description is not UTF-8".to_string()))?;
    let session = SdpSession::parse(text)?;
    let remote_address = session.audio_address()?;

    let offered = session
        .audio_media()
        .map(|m| m.codec_infos())
        .unwrap_or_default();
    let selected = negotiator.select_best(&offered).ok_or_else(|| {
        let names: Vec<String> = offered.iter().map(|c| c.encoding()).collect();
        SipError::Negotiation(format!("no common codec in offer [{}]", names.join(", ")))
    })?;

    Ok(NegotiatedMedia {
        remote_address,
        codec: selected.codec,
        payload_type: selected.payload_type,
    })
}
