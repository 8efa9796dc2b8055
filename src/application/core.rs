//! User Agent Core
//!
//! All signaling state of the client: the call state machine, the current
//! call, the transaction store and the last challenge. Nothing here touches a
//! socket. Every operation returns the [`Action`]s the caller must perform,
//! so the core can be driven from a dispatch loop or straight from a test.

use super::error::Result;
use crate::config::ClientConfig;
use crate::domain::call::{
    CallEvent, CallSession, CallState, CallStateMachine, CallStats, MediaParameters,
};
use crate::domain::shared::{ClientEvent, DomainError};
use crate::infrastructure::media::codec::{Codec, CodecNegotiator};
use crate::infrastructure::protocols::sip::auth::{authorization_value, ingest_challenge};
use crate::infrastructure::protocols::sip::message::{header_param, header_uri};
use crate::infrastructure::protocols::sip::{
    build_request, generate_answer, generate_branch, generate_session_description,
    parse_session_description, AuthChallenge, AuthError, CorrelationId, MessageKind,
    ParsedMessage, RequestHeaders, RequestTemplate, ResponseBuilder, SdpSession, SipError,
    SipMethod, SweepAction, Transaction, TransactionKind, TransactionStore, ALLOWED_METHODS,
    SDP_CONTENT_TYPE,
};
use bytes::Bytes;
use rand::Rng;
use std::net::SocketAddr;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Side effect requested by the core
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Send a datagram on the signaling socket
    Send { data: Bytes, destination: SocketAddr },
    /// Create the RTP stream context
    StartMedia {
        remote: SocketAddr,
        codec: Codec,
        payload_type: u8,
    },
    /// Tear down the RTP stream context
    StopMedia,
    /// Publish an event
    Emit(ClientEvent),
}

fn generate_tag() -> String {
    let tag: u32 = rand::thread_rng().gen();
    format!("{:08x}", tag)
}

pub struct UserAgentCore {
    config: ClientConfig,
    server_addr: SocketAddr,
    /// Advertised signaling address, used in Via and Contact
    local_addr: SocketAddr,
    /// Advertised RTP address, used in session descriptions
    media_addr: SocketAddr,
    negotiator: CodecNegotiator,
    machine: CallStateMachine,
    call: Option<CallSession>,
    transactions: TransactionStore,
    challenge: Option<AuthChallenge>,
    cseq: u32,
    register_call_id: String,
    register_tag: String,
    registered: bool,
    capabilities: Vec<String>,
    last_error: Option<String>,
}

impl UserAgentCore {
    pub fn new(
        config: ClientConfig,
        server_addr: SocketAddr,
        local_addr: SocketAddr,
        media_addr: SocketAddr,
    ) -> Self {
        let register_call_id = format!("{}@{}", uuid::Uuid::new_v4().simple(), local_addr.ip());
        Self {
            negotiator: CodecNegotiator::new(config.codecs.clone()),
            transactions: TransactionStore::new(config.retry_policy()),
            config,
            server_addr,
            local_addr,
            media_addr,
            machine: CallStateMachine::new(),
            call: None,
            challenge: None,
            cseq: 1,
            register_call_id,
            register_tag: generate_tag(),
            registered: false,
            capabilities: Vec::new(),
            last_error: None,
        }
    }

    pub fn state(&self) -> CallState {
        self.machine.state()
    }

    /// Timing of the current or most recent call
    pub fn call_stats(&self) -> &CallStats {
        self.machine.stats()
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn call(&self) -> Option<&CallSession> {
        self.call.as_ref()
    }

    pub fn media(&self) -> Option<&MediaParameters> {
        self.call.as_ref().and_then(|c| c.media.as_ref())
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn challenge(&self) -> Option<&AuthChallenge> {
        self.challenge.as_ref()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn media_addr(&self) -> SocketAddr {
        self.media_addr
    }

    fn next_cseq(&mut self) -> u32 {
        let cseq = self.cseq;
        self.cseq = self.cseq.wrapping_add(1).max(1);
        cseq
    }

    fn server_uri(&self) -> String {
        format!("sip:{}", self.config.server)
    }

    fn aor(&self) -> String {
        format!("sip:{}@{}", self.config.username, self.config.server)
    }

    fn contact(&self) -> String {
        format!("<sip:{}@{}>", self.config.username, self.local_addr)
    }

    fn common_headers(&self) -> Vec<(String, String)> {
        vec![("User-Agent".to_string(), self.config.user_agent.clone())]
    }

    /// Destination number, user@host or full URI to a request URI
    fn destination_uri(&self, destination: &str) -> String {
        if destination.starts_with("sip:") || destination.starts_with("sips:") {
            destination.to_string()
        } else if destination.contains('@') {
            format!("sip:{}", destination)
        } else {
            format!("sip:{}@{}", destination, self.config.server)
        }
    }

    fn transition(&mut self, event: CallEvent, actions: &mut Vec<Action>) -> bool {
        let from = self.machine.state();
        match self.machine.process_event(event) {
            Ok(to) => {
                if from != to {
                    info!("Call state {} -> {} on {:?}", from, to, event);
                    actions.push(Action::Emit(ClientEvent::StateChanged { from, to }));
                }
                true
            }
            Err(e) => {
                debug!("Ignoring {:?} in state {}: {}", event, from, e);
                false
            }
        }
    }

    // ========== Outbound requests ==========

    fn render(&self, tx: &Transaction, authenticate: bool) -> Result<Bytes> {
        let authorization = match (&self.challenge, authenticate) {
            (Some(challenge), true) => Some((
                challenge.origin.authorization_header(),
                authorization_value(
                    &self.config.username,
                    &self.config.password,
                    tx.method().as_str(),
                    &tx.request.target,
                    challenge,
                )?,
            )),
            _ => None,
        };

        let headers = RequestHeaders {
            username: self.config.username.clone(),
            server: self.config.server.clone(),
            local_address: self.local_addr.to_string(),
            branch: tx.branch.clone(),
            local_tag: tx.request.local_tag.clone(),
            to_uri: tx.request.to_uri.clone(),
            to_tag: tx.request.to_tag.clone(),
            call_id: tx.id.call_id.clone(),
            cseq: tx.cseq,
            authorization,
            content_type: tx.request.content_type.clone(),
            extra: tx.request.extra.clone(),
        };
        Ok(build_request(
            tx.method(),
            &tx.request.target,
            &headers,
            &tx.request.body,
        )?)
    }

    /// Render the current attempt of a transaction and queue it
    fn send_transaction(
        &mut self,
        id: &CorrelationId,
        authenticate: bool,
        actions: &mut Vec<Action>,
    ) -> Result<()> {
        let Some(tx) = self.transactions.get(id) else {
            return Ok(());
        };
        let data = self.render(tx, authenticate)?;
        let destination = tx.request.destination.unwrap_or(self.server_addr);
        let (cseq, branch) = (tx.cseq, tx.branch.clone());

        if id.method == SipMethod::Invite {
            if let Some(call) = self.call.as_mut().filter(|c| c.call_id == id.call_id) {
                call.invite_cseq = cseq;
                call.invite_branch = branch;
            }
        }

        metrics::counter!("sip_requests_sent_total", "method" => id.method.as_str()).increment(1);
        actions.push(Action::Send { data, destination });
        Ok(())
    }

    fn start_transaction(
        &mut self,
        id: CorrelationId,
        request: RequestTemplate,
        now: Instant,
        actions: &mut Vec<Action>,
    ) -> Result<()> {
        let cseq = self.next_cseq();
        self.transactions.start(id.clone(), cseq, request, now);
        if let Err(e) = self.send_transaction(&id, false, actions) {
            self.transactions.resolve(&id);
            return Err(e);
        }
        Ok(())
    }

    /// Request built from a response we received, e.g. ACK or a BYE for a stray 2xx
    fn request_from_response(
        &self,
        method: SipMethod,
        response: &ParsedMessage,
        branch: String,
        cseq: u32,
    ) -> std::result::Result<Bytes, SipError> {
        let to = response
            .header("to")
            .ok_or_else(|| SipError::Parse("response has no To header".to_string()))?;
        let call_id = response
            .call_id()
            .ok_or_else(|| SipError::Parse("response has no Call-ID".to_string()))?;
        let to_uri = header_uri(to).to_string();
        let target = match (method, response.header("contact")) {
            (SipMethod::Ack | SipMethod::Bye, Some(contact)) if response.status_code().map_or(false, |c| c < 300) => {
                header_uri(contact).to_string()
            }
            _ => to_uri.clone(),
        };

        let headers = RequestHeaders {
            username: self.config.username.clone(),
            server: self.config.server.clone(),
            local_address: self.local_addr.to_string(),
            branch,
            local_tag: response.from_tag().unwrap_or_default().to_string(),
            to_uri,
            to_tag: response.to_tag().map(str::to_string),
            call_id: call_id.to_string(),
            cseq,
            authorization: None,
            content_type: None,
            extra: self.common_headers(),
        };
        build_request(method, &target, &headers, b"")
    }

    /// ACK a final response to INVITE. Non-2xx ACKs reuse the INVITE branch.
    fn ack_response(&self, response: &ParsedMessage, actions: &mut Vec<Action>) {
        let success = response.status_code().map_or(false, |c| (200..300).contains(&c));
        let branch = if success {
            generate_branch()
        } else {
            response
                .via_branch()
                .map(str::to_string)
                .unwrap_or_else(generate_branch)
        };
        let cseq = response.cseq().map(|(n, _)| n).unwrap_or_default();

        match self.request_from_response(SipMethod::Ack, response, branch, cseq) {
            Ok(data) => actions.push(Action::Send {
                data,
                destination: self.server_addr,
            }),
            Err(e) => warn!("Failed to build ACK: {}", e),
        }
    }

    /// Hang up a dialog we no longer track, straight from its 2xx
    fn bye_from_response(&mut self, response: &ParsedMessage, actions: &mut Vec<Action>) {
        let cseq = self.next_cseq();
        match self.request_from_response(SipMethod::Bye, response, generate_branch(), cseq) {
            Ok(data) => actions.push(Action::Send {
                data,
                destination: self.server_addr,
            }),
            Err(e) => warn!("Failed to build BYE: {}", e),
        }
    }

    fn respond(
        &self,
        request: &ParsedMessage,
        builder: ResponseBuilder,
        destination: SocketAddr,
        actions: &mut Vec<Action>,
    ) {
        match builder.build_for_request(request) {
            Ok(data) => actions.push(Action::Send { data, destination }),
            Err(e) => warn!("Failed to build response: {}", e),
        }
    }

    // ========== Public operations ==========

    /// Send REGISTER. Drives the state machine only when no call is up.
    pub fn register(&mut self, now: Instant) -> Result<Vec<Action>> {
        self.config.validate()?;
        let mut actions = Vec::new();

        if self.machine.state() == CallState::Idle {
            self.transition(CallEvent::Register, &mut actions);
        }

        let mut extra = self.common_headers();
        extra.push(("Expires".to_string(), self.config.expires.to_string()));
        let request = RequestTemplate {
            target: self.server_uri(),
            local_tag: self.register_tag.clone(),
            to_uri: self.aor(),
            extra,
            ..Default::default()
        };

        info!("Registering {} with {}", self.aor(), self.server_addr);
        let id = CorrelationId::new(self.register_call_id.clone(), SipMethod::Register);
        if let Err(e) = self.start_transaction(id, request, now, &mut actions) {
            if self.machine.state() == CallState::Registering {
                self.transition(CallEvent::RegistrationFailed, &mut actions);
            }
            return Err(e);
        }
        Ok(actions)
    }

    /// Send INVITE with our offer. Returns the new call's Call-ID.
    pub fn make_call(&mut self, destination: &str, now: Instant) -> Result<(String, Vec<Action>)> {
        self.config.validate()?;
        if destination.trim().is_empty() {
            return Err(SipError::Encoding("destination is empty".to_string()).into());
        }
        if self.machine.state() != CallState::Idle {
            return Err(DomainError::InvalidOperation(format!(
                "cannot place a call while {}",
                self.machine.state()
            ))
            .into());
        }

        let remote_uri = self.destination_uri(destination.trim());
        let call_id = format!("{}@{}", uuid::Uuid::new_v4().simple(), self.local_addr.ip());
        let local_tag = generate_tag();
        let offer = generate_session_description(
            self.media_addr,
            &self.config.codecs,
            self.config.diagnostic_offer,
        );

        let mut extra = self.common_headers();
        extra.push(("Allow".to_string(), ALLOWED_METHODS.to_string()));
        let request = RequestTemplate {
            target: remote_uri.clone(),
            local_tag: local_tag.clone(),
            to_uri: remote_uri.clone(),
            to_tag: None,
            content_type: Some(SDP_CONTENT_TYPE.to_string()),
            body: Bytes::from(offer),
            extra,
            destination: None,
        };

        let mut actions = Vec::new();
        self.call = Some(CallSession::outbound(
            call_id.clone(),
            local_tag,
            remote_uri.clone(),
        ));
        self.last_error = None;
        self.transition(CallEvent::Dial, &mut actions);

        info!("Calling {} (Call-ID {})", remote_uri, call_id);
        let id = CorrelationId::new(call_id.clone(), SipMethod::Invite);
        if let Err(e) = self.start_transaction(id, request, now, &mut actions) {
            self.end_call(CallEvent::Failure, Some(e.to_string()), &mut actions);
            return Err(e);
        }
        Ok((call_id, actions))
    }

    /// Accept the ringing inbound call.
    ///
    /// A failed negotiation answers 488 and ends the call; the reason is
    /// left in [`last_error`](Self::last_error).
    pub fn answer(&mut self) -> Result<Vec<Action>> {
        let Some(call) = self
            .call
            .as_ref()
            .filter(|c| !c.is_outbound() && !c.confirmed && self.machine.can_answer())
        else {
            return Err(DomainError::InvalidOperation("no inbound call to answer".to_string()).into());
        };
        let Some(invite) = call.remote_invite.clone() else {
            return Err(DomainError::InvalidOperation("inbound call has no INVITE".to_string()).into());
        };
        let destination = call.remote_signaling.unwrap_or(self.server_addr);
        let local_tag = call.local_tag.clone();
        let mut actions = Vec::new();

        let media = match parse_session_description(&invite.body, &self.negotiator) {
            Ok(media) => media,
            Err(e) => {
                warn!("Cannot answer {}: {}", call.call_id, e);
                self.respond(
                    &invite,
                    ResponseBuilder::new(488).to_tag(&local_tag),
                    destination,
                    &mut actions,
                );
                self.end_call(CallEvent::Failure, Some(e.to_string()), &mut actions);
                return Ok(actions);
            }
        };

        let answer = generate_answer(self.media_addr, media.codec);
        self.respond(
            &invite,
            ResponseBuilder::ok()
                .to_tag(&local_tag)
                .header("Contact", self.contact())
                .header("Allow", ALLOWED_METHODS)
                .body(SDP_CONTENT_TYPE, Bytes::from(answer)),
            destination,
            &mut actions,
        );

        if let Some(call) = self.call.as_mut() {
            call.confirmed = true;
            call.media = Some(MediaParameters {
                codec: media.codec,
                payload_type: media.payload_type,
                remote_address: media.remote_address,
            });
        }
        self.start_media(media.remote_address, media.codec, media.payload_type, &mut actions);
        self.transition(CallEvent::Accept, &mut actions);
        Ok(actions)
    }

    /// End the current call the way its phase requires: CANCEL before an
    /// outbound call is answered, 603 for an unanswered inbound call, BYE
    /// once the dialog is up.
    pub fn hangup(&mut self, now: Instant) -> Result<Vec<Action>> {
        let mut actions = Vec::new();
        if self.machine.state() == CallState::Terminating {
            return Ok(actions);
        }
        let Some(call) = self.call.as_ref() else {
            return Err(DomainError::InvalidOperation("no active call".to_string()).into());
        };

        let mut bye = None;
        if call.is_early_outbound() {
            let headers = RequestHeaders {
                username: self.config.username.clone(),
                server: self.config.server.clone(),
                local_address: self.local_addr.to_string(),
                branch: call.invite_branch.clone(),
                local_tag: call.local_tag.clone(),
                to_uri: call.remote_uri.clone(),
                to_tag: None,
                call_id: call.call_id.clone(),
                cseq: call.invite_cseq,
                authorization: None,
                content_type: None,
                extra: self.common_headers(),
            };
            info!("Cancelling call {}", call.call_id);
            let data = build_request(SipMethod::Cancel, &call.remote_uri, &headers, b"")?;
            actions.push(Action::Send {
                data,
                destination: self.server_addr,
            });
        } else if !call.confirmed {
            if let Some(invite) = &call.remote_invite {
                info!("Declining call {}", call.call_id);
                self.respond(
                    invite,
                    ResponseBuilder::new(603).to_tag(&call.local_tag),
                    call.remote_signaling.unwrap_or(self.server_addr),
                    &mut actions,
                );
            }
        } else {
            info!("Hanging up call {}", call.call_id);
            bye = Some((
                CorrelationId::new(call.call_id.clone(), SipMethod::Bye),
                RequestTemplate {
                    target: call.remote_uri.clone(),
                    local_tag: call.local_tag.clone(),
                    to_uri: call.remote_uri.clone(),
                    to_tag: call.remote_tag.clone(),
                    extra: self.common_headers(),
                    destination: call.remote_signaling,
                    ..Default::default()
                },
            ));
        }

        self.end_call(CallEvent::Hangup, None, &mut actions);

        // Tracked after teardown so the BYE outlives the call
        if let Some((id, request)) = bye {
            self.start_transaction(id, request, now, &mut actions)?;
        }
        Ok(actions)
    }

    /// Send OPTIONS to the registrar
    pub fn query_capabilities(&mut self, now: Instant) -> Result<Vec<Action>> {
        self.config.validate()?;
        let call_id = format!("{}@{}", uuid::Uuid::new_v4().simple(), self.local_addr.ip());
        let mut extra = self.common_headers();
        extra.push(("Accept".to_string(), SDP_CONTENT_TYPE.to_string()));
        let request = RequestTemplate {
            target: self.server_uri(),
            local_tag: generate_tag(),
            to_uri: self.server_uri(),
            extra,
            ..Default::default()
        };

        let mut actions = Vec::new();
        self.start_transaction(
            CorrelationId::new(call_id, SipMethod::Options),
            request,
            now,
            &mut actions,
        )?;
        Ok(actions)
    }

    /// First media frame went out
    pub fn media_flowing(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.machine.state() == CallState::Connected {
            self.transition(CallEvent::MediaFlowing, &mut actions);
        }
        actions
    }

    /// Hang up any live call and forget all pending transactions
    pub fn shutdown(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.call.is_some() {
            match self.hangup(now) {
                Ok(mut hangup) => actions.append(&mut hangup),
                Err(e) => warn!("Hangup during shutdown failed: {}", e),
            }
        }
        if self.machine.state() == CallState::Registering {
            self.transition(CallEvent::RegistrationFailed, &mut actions);
        }
        self.transactions.clear();
        self.registered = false;
        actions
    }

    // ========== Call teardown ==========

    fn start_media(
        &mut self,
        remote: SocketAddr,
        codec: Codec,
        payload_type: u8,
        actions: &mut Vec<Action>,
    ) {
        actions.push(Action::StartMedia {
            remote,
            codec,
            payload_type,
        });
        actions.push(Action::Emit(ClientEvent::MediaStarted { codec, remote }));
    }

    /// Drive the call to terminating, release its resources and return to idle
    fn end_call(&mut self, event: CallEvent, failure: Option<String>, actions: &mut Vec<Action>) {
        self.transition(event, actions);

        if let Some(call) = self.call.take() {
            let removed = self.transactions.remove_call(&call.call_id);
            debug!(
                "Released call {} ({} pending transactions dropped)",
                call.call_id, removed
            );
            if call.media.is_some() {
                actions.push(Action::StopMedia);
            }
            if let Some(reason) = failure {
                warn!("Call {} failed: {}", call.call_id, reason);
                self.last_error = Some(reason.clone());
                actions.push(Action::Emit(ClientEvent::CallFailed {
                    call_id: call.call_id.clone(),
                    reason,
                }));
            }
            actions.push(Action::Emit(ClientEvent::CallEnded {
                call_id: call.call_id,
            }));
        }

        if self.machine.state() == CallState::Terminating {
            self.transition(CallEvent::Release, actions);
        }
    }

    /// A transaction ended without success
    fn transaction_failed(
        &mut self,
        tx: Transaction,
        reason: String,
        event: CallEvent,
        actions: &mut Vec<Action>,
    ) {
        match tx.kind {
            TransactionKind::Register => {
                warn!("Registration failed: {}", reason);
                self.registered = false;
                self.last_error = Some(reason.clone());
                if self.machine.state() == CallState::Registering {
                    self.transition(CallEvent::RegistrationFailed, actions);
                }
                actions.push(Action::Emit(ClientEvent::RegistrationFailed { reason }));
            }
            TransactionKind::Invite => {
                if self.call.as_ref().map_or(false, |c| c.call_id == tx.id.call_id) {
                    self.end_call(event, Some(reason), actions);
                } else {
                    debug!("INVITE {} failed after its call ended: {}", tx.id, reason);
                }
            }
            TransactionKind::Other => {
                warn!("{} failed: {}", tx.id, reason);
            }
        }
    }

    fn fail_transaction(
        &mut self,
        id: &CorrelationId,
        reason: String,
        event: CallEvent,
        actions: &mut Vec<Action>,
    ) {
        if let Some(tx) = self.transactions.resolve(id) {
            self.transaction_failed(tx, reason, event, actions);
        }
    }

    // ========== Timer sweep ==========

    /// Retry or expire pending transactions as of `now`
    pub fn on_timeout_sweep(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();

        for sweep in self.transactions.on_timeout_sweep(now) {
            match sweep {
                SweepAction::Retry(id) => {
                    let cseq = self.next_cseq();
                    let Some(tx) = self.transactions.get_mut(&id) else {
                        continue;
                    };
                    tx.cseq = cseq;
                    info!("Retransmitting {} (attempt {})", id, tx.retry_count);
                    metrics::counter!("sip_retransmissions_total", "method" => id.method.as_str())
                        .increment(1);

                    let authenticate = self.challenge.is_some();
                    if let Err(e) = self.send_transaction(&id, authenticate, &mut actions) {
                        self.fail_transaction(&id, e.to_string(), CallEvent::Failure, &mut actions);
                    }
                }
                SweepAction::Expired(tx) => {
                    metrics::counter!("sip_transaction_timeouts_total").increment(1);
                    let reason = SipError::Timeout(format!(
                        "{} got no final response after {} retries",
                        tx.id, tx.retry_count
                    ))
                    .to_string();
                    self.transaction_failed(tx, reason, CallEvent::Timeout, &mut actions);
                }
            }
        }

        actions
    }

    // ========== Inbound dispatch ==========

    /// React to one parsed datagram
    pub fn handle_message(
        &mut self,
        message: &ParsedMessage,
        source: SocketAddr,
        now: Instant,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        if message.is_request() {
            self.handle_request(message, source, &mut actions);
        } else {
            self.handle_response(message, now, &mut actions);
        }
        actions
    }

    fn handle_response(&mut self, response: &ParsedMessage, now: Instant, actions: &mut Vec<Action>) {
        let Some(id) = CorrelationId::from_response(response) else {
            warn!("Dropping response without Call-ID or CSeq");
            return;
        };
        debug!("Received {:?} for {}", response.kind, id);

        if self.transactions.get(&id).is_none() {
            self.handle_stray_response(&id, response, actions);
            return;
        }

        match response.kind {
            MessageKind::Provisional(_) | MessageKind::Ringing(_) => {
                self.on_provisional(&id, response, actions)
            }
            MessageKind::Unauthorized | MessageKind::ProxyAuthRequired => {
                self.on_challenge(&id, response, now, actions)
            }
            MessageKind::Success(_) => self.on_success(&id, response, actions),
            MessageKind::Failure(code) => self.on_failure(&id, code, response, actions),
            MessageKind::Request(_) | MessageKind::UnknownRequest(_) => {}
        }
    }

    fn on_provisional(&mut self, id: &CorrelationId, response: &ParsedMessage, actions: &mut Vec<Action>) {
        if id.method != SipMethod::Invite {
            return;
        }
        if let Some(tx) = self.transactions.get_mut(id) {
            tx.provisional_received = true;
        }
        if matches!(response.kind, MessageKind::Ringing(_)) {
            if let Some(call) = self.call.as_mut().filter(|c| c.call_id == id.call_id) {
                if call.remote_tag.is_none() {
                    call.remote_tag = response.to_tag().map(str::to_string);
                }
                self.transition(CallEvent::Ringing, actions);
            }
        }
    }

    fn on_challenge(
        &mut self,
        id: &CorrelationId,
        response: &ParsedMessage,
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        if id.method == SipMethod::Invite {
            self.ack_response(response, actions);
        }

        let attempted = self
            .transactions
            .get(id)
            .map_or(false, |tx| tx.auth_attempted);
        if attempted {
            let reason = SipError::Auth(AuthError::Rejected).to_string();
            self.fail_transaction(id, reason, CallEvent::Failure, actions);
            return;
        }

        let challenge = match ingest_challenge(response) {
            Ok(challenge) => challenge,
            Err(e) => {
                self.fail_transaction(id, SipError::Auth(e).to_string(), CallEvent::Failure, actions);
                return;
            }
        };
        info!("Answering {} challenge for {} (realm {})", challenge.origin.challenge_header(), id, challenge.realm);
        self.challenge = Some(challenge);

        match id.method {
            SipMethod::Register if self.machine.state() == CallState::Registering => {
                self.transition(CallEvent::Challenge, actions);
            }
            SipMethod::Invite => {
                self.transition(CallEvent::Challenge, actions);
            }
            _ => {}
        }

        let cseq = self.next_cseq();
        if let Some(tx) = self.transactions.get_mut(id) {
            tx.auth_attempted = true;
            tx.mark_resent(cseq, now);
        }
        if let Err(e) = self.send_transaction(id, true, actions) {
            self.fail_transaction(id, e.to_string(), CallEvent::Failure, actions);
        }
    }

    fn on_success(&mut self, id: &CorrelationId, response: &ParsedMessage, actions: &mut Vec<Action>) {
        match id.method {
            SipMethod::Register => {
                self.transactions.resolve(id);
                let expires = response
                    .header("contact")
                    .and_then(|c| header_param(c, "expires"))
                    .or_else(|| response.header("expires"))
                    .and_then(|e| e.trim().parse().ok())
                    .unwrap_or(self.config.expires);
                info!("Registered {} for {}s", self.aor(), expires);
                self.registered = true;
                if self.machine.state() == CallState::Registering {
                    self.transition(CallEvent::Registered, actions);
                }
                actions.push(Action::Emit(ClientEvent::Registered { expires }));
            }
            SipMethod::Invite => self.on_invite_success(id, response, actions),
            SipMethod::Options => {
                self.transactions.resolve(id);
                self.capabilities = response
                    .header("allow")
                    .map(|allow| {
                        allow
                            .split(',')
                            .map(|m| m.trim().to_string())
                            .filter(|m| !m.is_empty())
                            .collect()
                    })
                    .unwrap_or_default();
                info!("Server allows: {}", self.capabilities.join(", "));
                if !response.body.is_empty() {
                    if let Some(audio) = std::str::from_utf8(&response.body)
                        .ok()
                        .and_then(|body| SdpSession::parse(body).ok())
                        .and_then(|sdp| sdp.audio_media().cloned())
                    {
                        let codecs: Vec<String> =
                            audio.codec_infos().iter().map(|c| c.encoding()).collect();
                        info!("Server codecs: {}", codecs.join(", "));
                    }
                }
                actions.push(Action::Emit(ClientEvent::CapabilitiesReceived {
                    allow: self.capabilities.clone(),
                }));
            }
            _ => {
                self.transactions.resolve(id);
                debug!("{} completed", id);
            }
        }
    }

    /// 2xx to INVITE, whether or not its transaction is still live
    fn on_invite_success(&mut self, id: &CorrelationId, response: &ParsedMessage, actions: &mut Vec<Action>) {
        self.transactions.resolve(id);
        self.ack_response(response, actions);

        let Some(call) = self.call.as_mut().filter(|c| c.call_id == id.call_id) else {
            info!("2xx for ended call {}, sending BYE", id.call_id);
            self.bye_from_response(response, actions);
            return;
        };
        if call.confirmed {
            debug!("Re-acknowledged 2xx retransmission for {}", id.call_id);
            return;
        }
        call.confirmed = true;
        call.remote_tag = response.to_tag().map(str::to_string);

        match parse_session_description(&response.body, &self.negotiator) {
            Ok(media) => {
                call.media = Some(MediaParameters {
                    codec: media.codec,
                    payload_type: media.payload_type,
                    remote_address: media.remote_address,
                });
                info!(
                    "Call {} answered: {} (PT {}) to {}",
                    id.call_id, media.codec, media.payload_type, media.remote_address
                );
                self.start_media(media.remote_address, media.codec, media.payload_type, actions);
                self.transition(CallEvent::Answered, actions);
            }
            Err(e) => {
                self.bye_from_response(response, actions);
                self.end_call(CallEvent::Failure, Some(e.to_string()), actions);
            }
        }
    }

    fn on_failure(&mut self, id: &CorrelationId, code: u16, response: &ParsedMessage, actions: &mut Vec<Action>) {
        if id.method == SipMethod::Invite {
            self.ack_response(response, actions);
        }
        let reason = format!(
            "{} rejected: {} {}",
            id.method,
            code,
            response.reason_phrase().unwrap_or_default()
        );
        self.fail_transaction(id, reason, CallEvent::Failure, actions);
    }

    fn handle_stray_response(&mut self, id: &CorrelationId, response: &ParsedMessage, actions: &mut Vec<Action>) {
        match (id.method, response.status_code()) {
            (SipMethod::Invite, Some(code)) if (200..300).contains(&code) => {
                self.on_invite_success(id, response, actions);
            }
            (SipMethod::Invite, Some(code)) if code >= 300 => {
                debug!("ACKing {} for finished INVITE {}", code, id.call_id);
                self.ack_response(response, actions);
            }
            _ => debug!("No transaction for response {:?} to {}", response.kind, id),
        }
    }

    fn handle_request(&mut self, request: &ParsedMessage, source: SocketAddr, actions: &mut Vec<Action>) {
        let method = match &request.kind {
            MessageKind::Request(method) => *method,
            MessageKind::UnknownRequest(name) => {
                debug!("Unsupported request {} from {}", name, source);
                self.respond(request, ResponseBuilder::new(501), source, actions);
                return;
            }
            _ => return,
        };
        let Some(call_id) = request.call_id().map(str::to_string) else {
            warn!("Dropping {} without Call-ID from {}", method, source);
            return;
        };
        let current = self
            .call
            .as_ref()
            .filter(|c| c.call_id == call_id)
            .map(|c| (c.is_outbound(), c.confirmed, c.local_tag.clone()));

        match method {
            SipMethod::Invite => self.on_inbound_invite(request, call_id, current, source, actions),
            SipMethod::Ack => debug!("ACK for {}", call_id),
            SipMethod::Bye => {
                if current.is_some() {
                    info!("Remote hung up {}", call_id);
                    self.respond(request, ResponseBuilder::ok(), source, actions);
                    self.end_call(CallEvent::Bye, None, actions);
                } else {
                    self.respond(request, ResponseBuilder::new(481), source, actions);
                }
            }
            SipMethod::Cancel => match current {
                Some((false, false, local_tag)) => {
                    info!("Caller cancelled {}", call_id);
                    self.respond(request, ResponseBuilder::ok(), source, actions);
                    if let Some(invite) = self.call.as_ref().and_then(|c| c.remote_invite.clone()) {
                        self.respond(
                            &invite,
                            ResponseBuilder::new(487).to_tag(&local_tag),
                            source,
                            actions,
                        );
                    }
                    self.end_call(CallEvent::Bye, None, actions);
                }
                Some(_) => self.respond(request, ResponseBuilder::ok(), source, actions),
                None => self.respond(request, ResponseBuilder::new(481), source, actions),
            },
            SipMethod::Options => {
                self.respond(
                    request,
                    ResponseBuilder::ok()
                        .to_tag(&generate_tag())
                        .header("Allow", ALLOWED_METHODS)
                        .header("Accept", SDP_CONTENT_TYPE),
                    source,
                    actions,
                );
            }
            _ => self.respond(request, ResponseBuilder::new(501), source, actions),
        }
    }

    fn on_inbound_invite(
        &mut self,
        request: &ParsedMessage,
        call_id: String,
        current: Option<(bool, bool, String)>,
        source: SocketAddr,
        actions: &mut Vec<Action>,
    ) {
        match current {
            Some((false, false, local_tag)) => {
                debug!("INVITE retransmission for {}", call_id);
                self.respond(
                    request,
                    ResponseBuilder::new(180)
                        .to_tag(&local_tag)
                        .header("Contact", self.contact()),
                    source,
                    actions,
                );
                return;
            }
            Some(_) => {
                debug!("Ignoring INVITE within established call {}", call_id);
                return;
            }
            None => {}
        }

        if self.machine.state() != CallState::Idle {
            info!("Busy, rejecting INVITE {} from {}", call_id, source);
            self.respond(
                request,
                ResponseBuilder::new(486).to_tag(&generate_tag()),
                source,
                actions,
            );
            return;
        }

        let from = request
            .header("from")
            .map(|f| header_uri(f).to_string())
            .unwrap_or_default();
        let local_tag = generate_tag();
        let mut session = CallSession::inbound(
            call_id.clone(),
            local_tag.clone(),
            from.clone(),
            request.from_tag().map(str::to_string),
            request.clone(),
            source,
        );
        session.remote_cseq = request.cseq().map(|(n, _)| n);
        self.call = Some(session);
        self.last_error = None;

        info!("Incoming call {} from {}", call_id, from);
        self.respond(
            request,
            ResponseBuilder::new(180)
                .to_tag(&local_tag)
                .header("Contact", self.contact()),
            source,
            actions,
        );
        self.transition(CallEvent::Incoming, actions);
        actions.push(Action::Emit(ClientEvent::IncomingCall { call_id, from }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::error::SipClientError;
    use crate::infrastructure::protocols::sip::parse_message;
    use std::time::Duration;

    const SERVER: &str = "10.0.0.1:5060";
    const PEER: &str = "10.0.0.7:5060";

    fn server() -> SocketAddr {
        SERVER.parse().unwrap()
    }

    fn core() -> UserAgentCore {
        let config = ClientConfig::new("1001", "secret", "10.0.0.1");
        UserAgentCore::new(
            config,
            server(),
            "10.0.0.2:5060".parse().unwrap(),
            "10.0.0.2:10000".parse().unwrap(),
        )
    }

    fn sent(actions: &[Action]) -> Vec<ParsedMessage> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send { data, .. } => Some(parse_message(data).unwrap()),
                _ => None,
            })
            .collect()
    }

    fn events(actions: &[Action]) -> Vec<ClientEvent> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Emit(event) => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    fn reply(request: &ParsedMessage, builder: ResponseBuilder) -> ParsedMessage {
        parse_message(&builder.build_for_request(request).unwrap()).unwrap()
    }

    fn answer_sdp() -> Bytes {
        Bytes::from_static(
            b"v=0\r\no=- 1 1 IN IP4 10.0.0.9\r\ns=-\r\nc=IN IP4 10.0.0.9\r\nt=0 0\r\n\
              m=audio 30000 RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n",
        )
    }

    fn inbound_invite(call_id: &str, body: &str) -> ParsedMessage {
        let text = format!(
            "INVITE sip:1001@10.0.0.2:5060 SIP/2.0\r\n\
             Via: SIP/2.0/UDP 10.0.0.7:5060;branch=z9hG4bKin1\r\n\
             From: <sip:1002@10.0.0.1>;tag=caller\r\n\
             To: <sip:1001@10.0.0.1>\r\n\
             Call-ID: {}\r\n\
             CSeq: 1 INVITE\r\n\
             Content-Type: application/sdp\r\n\
             Content-Length: {}\r\n\r\n{}",
            call_id,
            body.len(),
            body
        );
        parse_message(text.as_bytes()).unwrap()
    }

    fn inbound_request(method: &str, call_id: &str) -> ParsedMessage {
        let text = format!(
            "{} sip:1001@10.0.0.2:5060 SIP/2.0\r\n\
             Via: SIP/2.0/UDP 10.0.0.7:5060;branch=z9hG4bK{}\r\n\
             From: <sip:1002@10.0.0.1>;tag=caller\r\n\
             To: <sip:1001@10.0.0.1>\r\n\
             Call-ID: {}\r\n\
             CSeq: 2 {}\r\n\r\n",
            method,
            method.to_lowercase(),
            call_id,
            method
        );
        parse_message(text.as_bytes()).unwrap()
    }

    fn auth_param<'a>(header: &'a str, name: &str) -> &'a str {
        let start = header.find(&format!("{}=\"", name)).unwrap() + name.len() + 2;
        let end = header[start..].find('"').unwrap() + start;
        &header[start..end]
    }

    /// Drive a fresh outbound call to connected; returns the INVITE
    fn connected_call(core: &mut UserAgentCore, now: Instant) -> ParsedMessage {
        let (_, actions) = core.make_call("1002", now).unwrap();
        let invite = sent(&actions).remove(0);
        let ok = reply(
            &invite,
            ResponseBuilder::ok()
                .to_tag("callee")
                .body(SDP_CONTENT_TYPE, answer_sdp()),
        );
        core.handle_message(&ok, server(), now);
        assert_eq!(core.state(), CallState::Connected);
        invite
    }

    #[test]
    fn test_register_digest_flow() {
        let mut core = core();
        let now = Instant::now();

        let actions = core.register(now).unwrap();
        assert_eq!(core.state(), CallState::Registering);
        let register = sent(&actions).remove(0);
        assert_eq!(register.request_uri(), Some("sip:10.0.0.1"));
        assert_eq!(register.header("expires"), Some("3600"));
        assert!(register.header("authorization").is_none());

        let challenge = reply(
            &register,
            ResponseBuilder::new(401)
                .to_tag("srv")
                .header("WWW-Authenticate", r#"Digest realm="test", nonce="abc123""#),
        );
        let actions = core.handle_message(&challenge, server(), now);
        assert_eq!(core.state(), CallState::Registering);

        let retry = sent(&actions).remove(0);
        assert_eq!(retry.call_id(), register.call_id());
        assert_ne!(retry.via_branch(), register.via_branch());
        assert!(retry.cseq().unwrap().0 > register.cseq().unwrap().0);

        let authorization = retry.header("authorization").unwrap();
        let ha1 = format!("{:x}", md5::compute("1001:test:secret"));
        let ha2 = format!("{:x}", md5::compute("REGISTER:sip:10.0.0.1"));
        let expected = format!("{:x}", md5::compute(format!("{}:abc123:{}", ha1, ha2)));
        assert_eq!(auth_param(authorization, "response"), expected);
        assert_eq!(auth_param(authorization, "realm"), "test");
        assert_eq!(auth_param(authorization, "nonce"), "abc123");
        assert_eq!(auth_param(authorization, "uri"), "sip:10.0.0.1");

        let ok = reply(
            &retry,
            ResponseBuilder::ok().header("Contact", "<sip:1001@10.0.0.2:5060>;expires=1800"),
        );
        let actions = core.handle_message(&ok, server(), now);
        assert_eq!(core.state(), CallState::Idle);
        assert!(core.is_registered());
        assert!(events(&actions).contains(&ClientEvent::Registered { expires: 1800 }));
        assert_eq!(core.transaction_count(), 0);
    }

    #[test]
    fn test_second_challenge_is_terminal() {
        let mut core = core();
        let now = Instant::now();
        let register = sent(&core.register(now).unwrap()).remove(0);

        let challenge = ResponseBuilder::new(401)
            .header("WWW-Authenticate", r#"Digest realm="test", nonce="abc123""#);
        let retry = sent(&core.handle_message(&reply(&register, challenge), server(), now)).remove(0);

        let again = ResponseBuilder::new(401)
            .header("WWW-Authenticate", r#"Digest realm="test", nonce="def456""#);
        let actions = core.handle_message(&reply(&retry, again), server(), now);

        assert!(sent(&actions).is_empty());
        assert_eq!(core.state(), CallState::Idle);
        assert!(!core.is_registered());
        assert_eq!(core.transaction_count(), 0);
        assert!(matches!(
            events(&actions).last(),
            Some(ClientEvent::RegistrationFailed { .. })
        ));
        assert!(core.last_error().unwrap().contains("rejected"));
    }

    #[test]
    fn test_challenge_without_nonce_fails() {
        let mut core = core();
        let now = Instant::now();
        let register = sent(&core.register(now).unwrap()).remove(0);

        let challenge = ResponseBuilder::new(401).header("WWW-Authenticate", r#"Digest realm="test""#);
        let actions = core.handle_message(&reply(&register, challenge), server(), now);
        assert!(sent(&actions).is_empty());
        assert_eq!(core.state(), CallState::Idle);
        assert_eq!(core.transaction_count(), 0);
    }

    #[test]
    fn test_proxy_challenge_on_invite() {
        let mut core = core();
        let now = Instant::now();
        let (_, actions) = core.make_call("1002", now).unwrap();
        let invite = sent(&actions).remove(0);

        let challenge = reply(
            &invite,
            ResponseBuilder::new(407).to_tag("proxy").header(
                "Proxy-Authenticate",
                r#"Digest realm="test", nonce="n1", qop="auth""#,
            ),
        );
        let actions = core.handle_message(&challenge, server(), now);
        let messages = sent(&actions);
        assert_eq!(messages.len(), 2);

        // ACK for the 407 on the INVITE's branch
        assert_eq!(messages[0].kind, MessageKind::Request(SipMethod::Ack));
        assert_eq!(messages[0].via_branch(), invite.via_branch());
        assert_eq!(messages[0].cseq().unwrap().0, invite.cseq().unwrap().0);

        let retry = &messages[1];
        assert_eq!(retry.kind, MessageKind::Request(SipMethod::Invite));
        let authorization = retry.header("proxy-authorization").unwrap();
        assert!(authorization.contains("qop=auth"));
        assert!(authorization.contains("nc=00000001"));
        assert_eq!(core.state(), CallState::Calling);
        assert!(!retry.body.is_empty());
    }

    #[test]
    fn test_invite_retry_then_timeout() {
        let mut core = core();
        let start = Instant::now();
        let (call_id, actions) = core.make_call("1002", start).unwrap();
        assert_eq!(core.state(), CallState::Calling);
        let invite = sent(&actions).remove(0);
        assert_eq!(invite.request_uri(), Some("sip:1002@10.0.0.1"));

        assert!(core.on_timeout_sweep(start + Duration::from_secs(1)).is_empty());

        assert!(core.on_timeout_sweep(start + Duration::from_secs(2)).is_empty());
        let actions = core.on_timeout_sweep(start + Duration::from_millis(2100));
        let retries = sent(&actions);
        assert_eq!(retries.len(), 1);
        assert_eq!(retries[0].call_id(), Some(call_id.as_str()));
        assert_ne!(retries[0].via_branch(), invite.via_branch());
        assert!(core.on_timeout_sweep(start + Duration::from_secs(3)).is_empty());

        let actions = core.on_timeout_sweep(start + Duration::from_secs(31));
        let events = events(&actions);
        assert!(events.contains(&ClientEvent::StateChanged {
            from: CallState::Calling,
            to: CallState::Terminating
        }));
        assert!(events.contains(&ClientEvent::StateChanged {
            from: CallState::Terminating,
            to: CallState::Idle
        }));
        assert!(matches!(&events[1], ClientEvent::CallFailed { call_id: id, .. } if *id == call_id));
        assert_eq!(core.state(), CallState::Idle);
        assert_eq!(core.transaction_count(), 0);
        assert!(core.last_error().unwrap().contains("timed out"));
    }

    #[test]
    fn test_register_timeout_returns_to_idle() {
        let mut core = core();
        let start = Instant::now();
        core.register(start).unwrap();

        let actions = core.on_timeout_sweep(start + Duration::from_secs(31));
        assert_eq!(core.state(), CallState::Idle);
        assert!(matches!(
            events(&actions).last(),
            Some(ClientEvent::RegistrationFailed { .. })
        ));
    }

    #[test]
    fn test_outbound_call_lifecycle() {
        let mut core = core();
        let now = Instant::now();
        let (_, actions) = core.make_call("1002", now).unwrap();
        let invite = sent(&actions).remove(0);
        assert_eq!(invite.content_type(), Some(SDP_CONTENT_TYPE));

        let ringing = reply(&invite, ResponseBuilder::new(180).to_tag("callee"));
        core.handle_message(&ringing, server(), now);
        assert_eq!(core.state(), CallState::Ringing);

        // Provisional stops retransmission
        assert!(core.on_timeout_sweep(now + Duration::from_secs(5)).is_empty());

        let ok = reply(
            &invite,
            ResponseBuilder::ok()
                .to_tag("callee")
                .body(SDP_CONTENT_TYPE, answer_sdp()),
        );
        let actions = core.handle_message(&ok, server(), now);
        let messages = sent(&actions);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, MessageKind::Request(SipMethod::Ack));
        assert_eq!(messages[0].to_tag(), Some("callee"));
        assert_eq!(messages[0].cseq(), Some((invite.cseq().unwrap().0, SipMethod::Ack)));
        assert!(actions.contains(&Action::StartMedia {
            remote: "10.0.0.9:30000".parse().unwrap(),
            codec: Codec::Pcmu,
            payload_type: 0,
        }));
        assert_eq!(core.state(), CallState::Connected);
        assert_eq!(core.media().unwrap().codec, Codec::Pcmu);
        assert_eq!(core.transaction_count(), 0);
        assert!(core.call_stats().setup_duration().is_some());
        assert_eq!(core.call_stats().provisional_count, 1);

        // 2xx retransmission is re-ACKed only
        let actions = core.handle_message(&ok, server(), now);
        assert_eq!(sent(&actions).len(), 1);
        assert!(!actions.iter().any(|a| matches!(a, Action::StartMedia { .. })));

        core.media_flowing();
        assert_eq!(core.state(), CallState::Streaming);

        let actions = core.hangup(now).unwrap();
        let bye = sent(&actions).remove(0);
        assert_eq!(bye.kind, MessageKind::Request(SipMethod::Bye));
        assert_eq!(bye.to_tag(), Some("callee"));
        assert!(actions.contains(&Action::StopMedia));
        assert_eq!(core.state(), CallState::Idle);
        assert_eq!(core.transaction_count(), 1);
        assert!(core.call_stats().ended_at.is_some());

        core.handle_message(&reply(&bye, ResponseBuilder::ok()), server(), now);
        assert_eq!(core.transaction_count(), 0);
    }

    #[test]
    fn test_answer_without_common_codec() {
        let mut core = core();
        let now = Instant::now();
        let (_, actions) = core.make_call("1002", now).unwrap();
        let invite = sent(&actions).remove(0);

        let sdp = Bytes::from_static(
            b"v=0\r\nc=IN IP4 10.0.0.9\r\nm=audio 30000 RTP/AVP 18\r\na=rtpmap:18 G729/8000\r\n",
        );
        let ok = reply(&invite, ResponseBuilder::ok().to_tag("callee").body(SDP_CONTENT_TYPE, sdp));
        let actions = core.handle_message(&ok, server(), now);

        let methods: Vec<MessageKind> = sent(&actions).into_iter().map(|m| m.kind).collect();
        assert_eq!(
            methods,
            vec![
                MessageKind::Request(SipMethod::Ack),
                MessageKind::Request(SipMethod::Bye)
            ]
        );
        assert!(!actions.iter().any(|a| matches!(a, Action::StartMedia { .. })));
        assert_eq!(core.state(), CallState::Idle);
        assert!(core.last_error().unwrap().contains("Negotiation"));
    }

    #[test]
    fn test_busy_response_ends_call() {
        let mut core = core();
        let now = Instant::now();
        let (_, actions) = core.make_call("1002", now).unwrap();
        let invite = sent(&actions).remove(0);

        let busy = reply(&invite, ResponseBuilder::new(486).to_tag("callee"));
        let actions = core.handle_message(&busy, server(), now);
        let ack = sent(&actions).remove(0);
        assert_eq!(ack.kind, MessageKind::Request(SipMethod::Ack));
        assert_eq!(ack.via_branch(), invite.via_branch());
        assert_eq!(core.state(), CallState::Idle);
        assert!(core.last_error().unwrap().contains("486"));
    }

    #[test]
    fn test_hangup_while_calling_sends_cancel() {
        let mut core = core();
        let now = Instant::now();
        let (_, actions) = core.make_call("1002", now).unwrap();
        let invite = sent(&actions).remove(0);

        let actions = core.hangup(now).unwrap();
        let cancel = sent(&actions).remove(0);
        assert_eq!(cancel.kind, MessageKind::Request(SipMethod::Cancel));
        assert_eq!(cancel.via_branch(), invite.via_branch());
        assert_eq!(cancel.cseq().unwrap().0, invite.cseq().unwrap().0);
        assert_eq!(core.state(), CallState::Idle);
        assert_eq!(core.transaction_count(), 0);

        // Late 487 is still ACKed
        let terminated = reply(&invite, ResponseBuilder::new(487).to_tag("callee"));
        let actions = core.handle_message(&terminated, server(), now);
        assert_eq!(sent(&actions)[0].kind, MessageKind::Request(SipMethod::Ack));
    }

    #[test]
    fn test_make_call_requires_idle() {
        let mut core = core();
        let now = Instant::now();
        core.make_call("1002", now).unwrap();
        assert!(matches!(
            core.make_call("1003", now),
            Err(SipClientError::Domain(DomainError::InvalidOperation(_)))
        ));
        assert!(core.hangup(now).is_ok());
        assert!(core.hangup(now).is_err());
    }

    #[test]
    fn test_empty_credentials_rejected() {
        let mut core = UserAgentCore::new(
            ClientConfig::new("", "secret", "10.0.0.1"),
            server(),
            "10.0.0.2:5060".parse().unwrap(),
            "10.0.0.2:10000".parse().unwrap(),
        );
        assert!(matches!(
            core.register(Instant::now()),
            Err(SipClientError::Sip(SipError::Encoding(_)))
        ));
        assert_eq!(core.state(), CallState::Idle);
    }

    #[test]
    fn test_register_during_call_keeps_call_state() {
        let mut core = core();
        let now = Instant::now();
        connected_call(&mut core, now);

        let register = sent(&core.register(now).unwrap()).remove(0);
        assert_eq!(core.state(), CallState::Connected);
        core.handle_message(&reply(&register, ResponseBuilder::ok()), server(), now);
        assert_eq!(core.state(), CallState::Connected);
        assert!(core.is_registered());
    }

    #[test]
    fn test_inbound_call_answer_and_remote_bye() {
        let mut core = core();
        let now = Instant::now();
        let peer: SocketAddr = PEER.parse().unwrap();
        let offer = "v=0\r\no=- 1 1 IN IP4 10.0.0.7\r\ns=-\r\nc=IN IP4 10.0.0.7\r\nt=0 0\r\n\
                     m=audio 40000 RTP/AVP 8 0\r\n";

        let actions = core.handle_message(&inbound_invite("in-1", offer), peer, now);
        let ringing = sent(&actions).remove(0);
        assert_eq!(ringing.status_code(), Some(180));
        let local_tag = ringing.to_tag().unwrap().to_string();
        assert_eq!(core.state(), CallState::Ringing);
        assert!(events(&actions).contains(&ClientEvent::IncomingCall {
            call_id: "in-1".to_string(),
            from: "sip:1002@10.0.0.1".to_string(),
        }));

        let actions = core.answer().unwrap();
        let ok = sent(&actions).remove(0);
        assert_eq!(ok.status_code(), Some(200));
        assert_eq!(ok.to_tag(), Some(local_tag.as_str()));
        let body = std::str::from_utf8(&ok.body).unwrap();
        assert!(body.contains("m=audio 10000 RTP/AVP 8\r\n"));
        assert!(actions.contains(&Action::StartMedia {
            remote: "10.0.0.7:40000".parse().unwrap(),
            codec: Codec::Pcma,
            payload_type: 8,
        }));
        assert_eq!(core.state(), CallState::Connected);

        let actions = core.handle_message(&inbound_request("BYE", "in-1"), peer, now);
        assert_eq!(sent(&actions)[0].status_code(), Some(200));
        assert!(actions.contains(&Action::StopMedia));
        assert_eq!(core.state(), CallState::Idle);

        // Unknown dialog now
        let actions = core.handle_message(&inbound_request("BYE", "in-1"), peer, now);
        assert_eq!(sent(&actions)[0].status_code(), Some(481));
    }

    #[test]
    fn test_inbound_cancel() {
        let mut core = core();
        let now = Instant::now();
        let peer: SocketAddr = PEER.parse().unwrap();
        core.handle_message(&inbound_invite("in-2", ""), peer, now);

        let actions = core.handle_message(&inbound_request("CANCEL", "in-2"), peer, now);
        let codes: Vec<Option<u16>> = sent(&actions).iter().map(|m| m.status_code()).collect();
        assert_eq!(codes, vec![Some(200), Some(487)]);
        assert_eq!(core.state(), CallState::Idle);
    }

    #[test]
    fn test_inbound_busy_and_decline() {
        let mut core = core();
        let now = Instant::now();
        let peer: SocketAddr = PEER.parse().unwrap();
        core.handle_message(&inbound_invite("in-3", ""), peer, now);

        let actions = core.handle_message(&inbound_invite("in-4", ""), peer, now);
        assert_eq!(sent(&actions)[0].status_code(), Some(486));
        assert_eq!(core.call().unwrap().call_id, "in-3");

        let actions = core.hangup(now).unwrap();
        assert_eq!(sent(&actions)[0].status_code(), Some(603));
        assert_eq!(core.state(), CallState::Idle);
    }

    #[test]
    fn test_answer_rejects_unusable_offer() {
        let mut core = core();
        let now = Instant::now();
        let peer: SocketAddr = PEER.parse().unwrap();
        core.handle_message(&inbound_invite("in-5", "v=0\r\n"), peer, now);

        let actions = core.answer().unwrap();
        assert_eq!(sent(&actions)[0].status_code(), Some(488));
        assert_eq!(core.state(), CallState::Idle);
        assert!(core.last_error().is_some());
    }

    #[test]
    fn test_options_and_unknown_requests() {
        let mut core = core();
        let now = Instant::now();
        let peer: SocketAddr = PEER.parse().unwrap();

        let actions = core.handle_message(&inbound_request("OPTIONS", "o-1"), peer, now);
        let ok = sent(&actions).remove(0);
        assert_eq!(ok.status_code(), Some(200));
        assert_eq!(ok.header("allow"), Some(ALLOWED_METHODS));

        let actions = core.handle_message(&inbound_request("INFO", "o-2"), peer, now);
        assert_eq!(sent(&actions)[0].status_code(), Some(501));

        let actions = core.handle_message(&inbound_request("FOO", "o-3"), peer, now);
        assert_eq!(sent(&actions)[0].status_code(), Some(501));
    }

    #[test]
    fn test_query_capabilities() {
        let mut core = core();
        let now = Instant::now();
        let options = sent(&core.query_capabilities(now).unwrap()).remove(0);
        assert_eq!(options.kind, MessageKind::Request(SipMethod::Options));

        let ok = reply(&options, ResponseBuilder::ok().header("Allow", "INVITE, ACK, BYE"));
        let actions = core.handle_message(&ok, server(), now);
        assert_eq!(core.capabilities(), &["INVITE", "ACK", "BYE"]);
        assert!(matches!(
            events(&actions)[0],
            ClientEvent::CapabilitiesReceived { .. }
        ));
        assert_eq!(core.transaction_count(), 0);
    }

    #[test]
    fn test_shutdown_hangs_up() {
        let mut core = core();
        let now = Instant::now();
        connected_call(&mut core, now);

        let actions = core.shutdown(now);
        assert_eq!(sent(&actions)[0].kind, MessageKind::Request(SipMethod::Bye));
        assert_eq!(core.state(), CallState::Idle);
        assert_eq!(core.transaction_count(), 0);
    }
}
