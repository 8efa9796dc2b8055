//! The dialog side of a call: identifiers, tags and negotiated media

use crate::infrastructure::media::codec::Codec;
use crate::infrastructure::protocols::sip::ParsedMessage;
use std::net::SocketAddr;

/// Who sent the INVITE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    /// We received the INVITE
    Inbound,
    /// We sent the INVITE
    Outbound,
}

/// Media parameters agreed for the call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaParameters {
    pub codec: Codec,
    pub payload_type: u8,
    pub remote_address: SocketAddr,
}

/// One call. Exists from dial (or inbound INVITE) until release.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub call_id: String,
    pub direction: CallDirection,
    pub local_tag: String,
    pub remote_tag: Option<String>,
    /// Remote party URI, e.g. `sip:1002@pbx.example.com`
    pub remote_uri: String,
    /// CSeq number of the last INVITE we sent
    pub invite_cseq: u32,
    /// Branch of the last INVITE we sent, reused by CANCEL
    pub invite_branch: String,
    /// Last CSeq number seen from the remote side
    pub remote_cseq: Option<u32>,
    /// INVITE for inbound calls, kept to answer it later
    pub remote_invite: Option<ParsedMessage>,
    /// Where the remote INVITE came from
    pub remote_signaling: Option<SocketAddr>,
    pub media: Option<MediaParameters>,
    /// A final response has been sent or received
    pub confirmed: bool,
}

impl CallSession {
    pub fn outbound(call_id: String, local_tag: String, remote_uri: String) -> Self {
        Self {
            call_id,
            direction: CallDirection::Outbound,
            local_tag,
            remote_tag: None,
            remote_uri,
            invite_cseq: 0,
            invite_branch: String::new(),
            remote_cseq: None,
            remote_invite: None,
            remote_signaling: None,
            media: None,
            confirmed: false,
        }
    }

    pub fn inbound(
        call_id: String,
        local_tag: String,
        remote_uri: String,
        remote_tag: Option<String>,
        invite: ParsedMessage,
        source: SocketAddr,
    ) -> Self {
        Self {
            call_id,
            direction: CallDirection::Inbound,
            local_tag,
            remote_tag,
            remote_uri,
            invite_cseq: 0,
            invite_branch: String::new(),
            remote_cseq: None,
            remote_invite: Some(invite),
            remote_signaling: Some(source),
            media: None,
            confirmed: false,
        }
    }

    pub fn is_outbound(&self) -> bool {
        self.direction == CallDirection::Outbound
    }

    /// Outbound call that has not seen a final response yet
    pub fn is_early_outbound(&self) -> bool {
        self.is_outbound() && !self.confirmed
    }
}
