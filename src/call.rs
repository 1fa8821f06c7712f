use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::core::Context;
use crate::timer::is_due;
use crate::{
    generate_tag, CallDirection, CallId, CallState, CoreEvent, ErrorInfo, MediaDirection,
    MediaParams, MessageBody, Reason, Result, SdpNegotiator, SipError, SipMessage,
    SipMessageBuilder, SipMethod, SipUri,
};

// INVITE client transaction, initial or re-INVITE
#[derive(Debug, Clone)]
struct InviteTransaction {
    cseq: u32,
    /// Cleared by a provisional response on the initial INVITE.
    deadline: Option<Instant>,
    /// Direction offered by a re-INVITE; `None` for the initial INVITE.
    direction: Option<MediaDirection>,
}

// Call structure
#[derive(Debug)]
pub struct Call {
    id: CallId,
    direction: CallDirection,
    state: CallState,
    local: SipUri,
    remote: SipUri,
    /// Where in-dialog requests go; learnt from the peer's messages.
    remote_target: SipUri,
    local_tag: String,
    remote_tag: Option<String>,
    local_cseq: u32,
    /// The initial INVITE: ours when outgoing, the peer's when incoming.
    invite: Option<SipMessage>,
    /// Our offer when outgoing, our answer when incoming.
    local_media: Option<MediaParams>,
    remote_media: Option<MediaParams>,
    negotiated: Option<MediaParams>,
    reason: Reason,
    error_info: Option<Arc<ErrorInfo>>,
    history: Vec<CallState>,
    start_time: DateTime<Utc>,
    connect_time: Option<DateTime<Utc>>,
    // Tick at which the current state was entered
    entered_at: u64,
    transaction: Option<InviteTransaction>,
    no_answer_deadline: Option<Instant>,
    media_attempts: u32,
    media_running: bool,
}

impl Call {
    fn new(id: CallId, direction: CallDirection, local: SipUri, remote: SipUri, tick: u64) -> Self {
        Call {
            id,
            direction,
            state: CallState::Idle,
            local,
            remote_target: remote.clone(),
            remote,
            local_tag: generate_tag(),
            remote_tag: None,
            local_cseq: 0,
            invite: None,
            local_media: None,
            remote_media: None,
            negotiated: None,
            reason: Reason::None,
            error_info: None,
            history: vec![CallState::Idle],
            start_time: Utc::now(),
            connect_time: None,
            entered_at: tick,
            transaction: None,
            no_answer_deadline: None,
            media_attempts: 0,
            media_running: false,
        }
    }

    pub(crate) fn outgoing(
        ctx: &mut Context,
        id: CallId,
        local: SipUri,
        remote: SipUri,
        offer: MediaParams,
    ) -> Self {
        let mut call = Call::new(id, CallDirection::Outgoing, local, remote, ctx.tick);
        call.local_media = Some(offer);
        call.transition(ctx, CallState::OutgoingInit, "Starting outgoing call");
        call
    }

    /// Creates the callee side of `invite` and starts ringing.
    pub(crate) fn incoming(ctx: &mut Context, invite: &SipMessage, answer: MediaParams) -> Self {
        let mut call = Call::new(
            CallId(invite.call_id.clone()),
            CallDirection::Incoming,
            invite.to.clone(),
            invite.from.clone(),
            ctx.tick,
        );
        call.remote_target = invite.reply_target();
        call.remote_tag = invite.from_tag.clone();
        call.remote_media = invite.media().cloned();
        call.local_media = Some(answer);
        call.invite = Some(invite.clone());

        call.transition(ctx, CallState::IncomingReceived, "Incoming call");
        call.no_answer_deadline = Some(ctx.now + ctx.config.timers.incoming_call_timeout);
        if let Err(err) = call.respond_to_invite(ctx, 180, None) {
            warn!(call_id = %call.id, %err, "could not send 180");
        }
        call
    }

    pub fn id(&self) -> &CallId {
        &self.id
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn local_address(&self) -> &SipUri {
        &self.local
    }

    pub fn remote_address(&self) -> &SipUri {
        &self.remote
    }

    pub fn reason(&self) -> Reason {
        self.reason
    }

    pub fn error_info(&self) -> Option<&Arc<ErrorInfo>> {
        self.error_info.as_ref()
    }

    /// Every state entered so far, starting with `Idle`.
    pub fn history(&self) -> &[CallState] {
        &self.history
    }

    pub fn negotiated_media(&self) -> Option<&MediaParams> {
        self.negotiated.as_ref()
    }

    pub fn remote_media(&self) -> Option<&MediaParams> {
        self.remote_media.as_ref()
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn connect_time(&self) -> Option<DateTime<Utc>> {
        self.connect_time
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.connect_time.map(|connected| Utc::now() - connected)
    }

    pub fn is_live(&self) -> bool {
        !self.state.is_terminal()
    }

    pub(crate) fn is_released(&self) -> bool {
        self.state == CallState::Released
    }

    fn set_state(&mut self, ctx: &mut Context, next: CallState, message: &str) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(SipError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }

        info!(call_id = %self.id, from = ?self.state, to = ?next, "{}", message);
        self.state = next;
        self.entered_at = ctx.tick;
        self.history.push(next);

        match next {
            CallState::Connected => {
                self.connect_time = Some(Utc::now());
                self.no_answer_deadline = None;
            }
            CallState::End | CallState::Error => {
                self.transaction = None;
                self.no_answer_deadline = None;
                if self.media_running {
                    ctx.media.stop_streams(&self.id);
                    self.media_running = false;
                }
            }
            _ => {}
        }

        ctx.emit(CoreEvent::CallStateChanged {
            call_id: self.id.clone(),
            state: next,
            reason: self.reason,
            error_info: self.error_info.clone(),
            message: message.to_string(),
        });
        Ok(())
    }

    // An impossible transition aborts the call instead of the core
    fn transition(&mut self, ctx: &mut Context, next: CallState, message: &str) {
        if let Err(err) = self.set_state(ctx, next, message) {
            error!(call_id = %self.id, %err, "aborting call");
            if !self.state.is_terminal() {
                self.reason = Reason::Unknown;
                self.error_info = Some(ErrorInfo::local(Reason::Unknown, &err.to_string()).shared());
                let _ = self.set_state(ctx, CallState::Error, "Internal error");
            }
        }
    }

    fn fail(&mut self, ctx: &mut Context, info: ErrorInfo) {
        warn!(call_id = %self.id, error = %info, "call failed");
        self.reason = info.reason();
        let message = info.phrase().to_string();
        self.error_info = Some(info.shared());
        self.transition(ctx, CallState::Error, &message);
    }

    /// Fails a call that never got going, e.g. an invite refused by the core.
    /// With `release_now` it skips the tick-deferred release.
    pub(crate) fn abort(&mut self, ctx: &mut Context, info: ErrorInfo, release_now: bool) {
        self.fail(ctx, info);
        if release_now {
            self.transition(ctx, CallState::Released, "Call released");
        }
    }

    fn end(&mut self, ctx: &mut Context, reason: Reason, message: &str) {
        self.reason = reason;
        self.transition(ctx, CallState::End, message);
    }

    /// Runs once per tick: deferred sends, media start, timers and release.
    pub(crate) fn tick(&mut self, ctx: &mut Context) {
        let next_tick = ctx.tick > self.entered_at;

        match self.state {
            CallState::OutgoingInit if next_tick => self.send_invite(ctx),
            CallState::Connected if next_tick => self.start_media(ctx),
            CallState::End | CallState::Error if next_tick => {
                self.transition(ctx, CallState::Released, "Call released")
            }
            _ => {}
        }

        if is_due(self.no_answer_deadline, ctx.now) {
            self.no_answer_deadline = None;
            if matches!(
                self.state,
                CallState::IncomingReceived | CallState::IncomingEarlyMedia
            ) {
                let _ = self.respond_to_invite(ctx, 408, None);
                self.end(ctx, Reason::NotAnswered, "Call not answered");
            }
        }

        if is_due(self.transaction.as_ref().and_then(|t| t.deadline), ctx.now) {
            self.transaction = None;
            if self.state.is_established() {
                let _ = self.send_bye(ctx);
            }
            self.fail(ctx, ErrorInfo::local(Reason::NoResponse, "INVITE timed out"));
        }
    }

    fn start_media(&mut self, ctx: &mut Context) {
        let Some(media) = self.negotiated.clone() else {
            self.fail(ctx, ErrorInfo::local(Reason::Media, "No negotiated media"));
            return;
        };

        match ctx.media.start_streams(&self.id, &media) {
            Ok(()) => {
                self.media_running = true;
                self.transition(ctx, CallState::StreamsRunning, "Streams running");
            }
            Err(err) => {
                self.media_attempts += 1;
                if self.media_attempts < 2 {
                    warn!(call_id = %self.id, %err, "media start failed, retrying");
                    return;
                }
                let _ = self.send_bye(ctx);
                self.fail(
                    ctx,
                    ErrorInfo::local(Reason::Media, &format!("Media start failed: {}", err)),
                );
            }
        }
    }

    pub(crate) fn accept(&mut self, ctx: &mut Context) -> Result<()> {
        self.expect_incoming_ringing("accept")?;
        let answer = self.local_media.clone();

        if let Err(err) = self.respond_to_invite(ctx, 200, answer.clone()) {
            self.fail(ctx, ErrorInfo::local(Reason::IoError, &err.to_string()));
            return Err(err);
        }
        self.negotiated = answer;
        self.transition(ctx, CallState::Connected, "Connected");
        Ok(())
    }

    pub(crate) fn accept_early_media(&mut self, ctx: &mut Context) -> Result<()> {
        if self.state != CallState::IncomingReceived {
            return Err(self.invalid_state("accept early media"));
        }
        let answer = self.local_media.clone();

        if let Err(err) = self.respond_to_invite(ctx, 183, answer.clone()) {
            self.fail(ctx, ErrorInfo::local(Reason::IoError, &err.to_string()));
            return Err(err);
        }
        self.negotiated = answer;
        self.transition(ctx, CallState::IncomingEarlyMedia, "Early media");
        Ok(())
    }

    pub(crate) fn decline(&mut self, ctx: &mut Context, reason: Reason) -> Result<()> {
        self.expect_incoming_ringing("decline")?;

        let status = match reason.to_status() {
            status if status >= 300 => status,
            _ => Reason::Declined.to_status(),
        };
        if let Err(err) = self.respond_to_invite(ctx, status, None) {
            warn!(call_id = %self.id, %err, "could not send decline");
        }
        self.end(ctx, reason, "Call declined");
        Ok(())
    }

    /// Ends the call from any live state; a terminal call is left alone.
    pub(crate) fn terminate(&mut self, ctx: &mut Context) -> Result<()> {
        match self.state {
            CallState::End | CallState::Error | CallState::Released => return Ok(()),
            CallState::Idle | CallState::OutgoingInit => {}
            CallState::OutgoingProgress
            | CallState::OutgoingRinging
            | CallState::OutgoingEarlyMedia => {
                if let Err(err) = self.send_cancel(ctx) {
                    warn!(call_id = %self.id, %err, "could not send CANCEL");
                }
            }
            CallState::IncomingReceived | CallState::IncomingEarlyMedia => {
                return self.decline(ctx, Reason::Declined);
            }
            _ => {
                if let Err(err) = self.send_bye(ctx) {
                    warn!(call_id = %self.id, %err, "could not send BYE");
                }
            }
        }

        self.end(ctx, Reason::None, "Call terminated");
        Ok(())
    }

    pub(crate) fn pause(&mut self, ctx: &mut Context) -> Result<()> {
        match self.state {
            CallState::StreamsRunning => {
                self.send_reinvite(ctx, MediaDirection::SendOnly)?;
                self.transition(ctx, CallState::Pausing, "Pausing call");
            }
            // Already on hold by the peer; Paused once it accepts
            CallState::PausedByRemote => self.send_reinvite(ctx, MediaDirection::Inactive)?,
            _ => return Err(self.invalid_state("pause")),
        }
        Ok(())
    }

    pub(crate) fn resume(&mut self, ctx: &mut Context) -> Result<()> {
        if self.state != CallState::Paused {
            return Err(self.invalid_state("resume"));
        }
        self.send_reinvite(ctx, MediaDirection::SendRecv)?;
        self.transition(ctx, CallState::Resuming, "Resuming call");
        Ok(())
    }

    fn expect_incoming_ringing(&self, operation: &str) -> Result<()> {
        match self.state {
            CallState::IncomingReceived | CallState::IncomingEarlyMedia => Ok(()),
            _ => Err(self.invalid_state(operation)),
        }
    }

    fn invalid_state(&self, operation: &str) -> SipError {
        SipError::InvalidState(format!(
            "cannot {} call {} in state {:?}",
            operation, self.id, self.state
        ))
    }

    pub(crate) fn handle_response(&mut self, ctx: &mut Context, response: &SipMessage) {
        let Some(status) = response.status_code() else {
            return;
        };

        match response.cseq.method {
            SipMethod::Invite => self.handle_invite_response(ctx, response, status),
            method => debug!(call_id = %self.id, %method, status, "in-dialog response"),
        }
    }

    fn handle_invite_response(&mut self, ctx: &mut Context, response: &SipMessage, status: u16) {
        let transaction = match self.transaction {
            Some(ref t) if t.cseq == response.cseq.sequence => t.clone(),
            _ => {
                // Final response after CANCEL or a retransmission
                if status >= 200 {
                    let _ = self.send_ack(ctx, response.cseq.sequence);
                    if status < 300 && self.state.is_terminal() {
                        let _ = self.send_bye(ctx);
                    }
                }
                return;
            }
        };

        if let Some(ref tag) = response.to_tag {
            self.remote_tag = Some(tag.clone());
        }
        if let Some(ref source) = response.source {
            self.remote_target = source.clone();
        }

        if status < 200 {
            if transaction.direction.is_none() {
                self.handle_provisional(ctx, status);
            }
            return;
        }

        self.transaction = None;
        let _ = self.send_ack(ctx, response.cseq.sequence);

        match transaction.direction {
            Some(direction) => self.handle_reinvite_result(ctx, response, status, direction),
            None if status < 300 => {
                let accepted = match (self.local_media.as_ref(), response.media()) {
                    (Some(offer), Some(answer)) => SdpNegotiator::accept_answer(offer, answer),
                    _ => None,
                };
                match accepted {
                    Some(media) => {
                        self.remote_media = response.media().cloned();
                        self.negotiated = Some(media);
                        self.transition(ctx, CallState::Connected, "Connected");
                    }
                    None => {
                        let _ = self.send_bye(ctx);
                        self.fail(
                            ctx,
                            ErrorInfo::new(Reason::NotAcceptable, 488, "Incompatible media answer"),
                        );
                    }
                }
            }
            None => self.fail(ctx, ErrorInfo::from_status(status, response.reason_phrase())),
        }
    }

    fn handle_provisional(&mut self, ctx: &mut Context, status: u16) {
        match (status, self.state) {
            (180, CallState::OutgoingProgress) => {
                self.clear_invite_deadline();
                self.transition(ctx, CallState::OutgoingRinging, "Remote ringing");
            }
            (183, CallState::OutgoingProgress | CallState::OutgoingRinging) => {
                self.clear_invite_deadline();
                self.transition(ctx, CallState::OutgoingEarlyMedia, "Early media");
            }
            _ => {}
        }
    }

    fn clear_invite_deadline(&mut self) {
        if let Some(ref mut transaction) = self.transaction {
            transaction.deadline = None;
        }
    }

    fn handle_reinvite_result(
        &mut self,
        ctx: &mut Context,
        response: &SipMessage,
        status: u16,
        direction: MediaDirection,
    ) {
        if status >= 300 {
            // 481 and 408 mean the dialog is gone; anything else (491 glare
            // included) leaves the call where it was so the request can be retried
            let dialog_lost = status == 481 || status == 408;
            match self.state {
                CallState::Pausing if !dialog_lost => {
                    warn!(call_id = %self.id, status, "pause refused by peer");
                    self.transition(ctx, CallState::StreamsRunning, "Pause refused");
                }
                CallState::Resuming if !dialog_lost => {
                    warn!(call_id = %self.id, status, "resume refused by peer");
                    self.transition(ctx, CallState::Paused, "Resume refused");
                }
                CallState::PausedByRemote if !dialog_lost => {
                    warn!(call_id = %self.id, status, "pause refused by peer");
                }
                _ => {
                    let _ = self.send_bye(ctx);
                    self.fail(ctx, ErrorInfo::from_status(status, response.reason_phrase()));
                }
            }
            return;
        }

        if let Some(media) = response.media() {
            self.negotiated = Some(media.clone());
        }
        if let Err(err) = ctx.media.update_streams(&self.id, direction) {
            warn!(call_id = %self.id, %err, "could not update streams");
        }

        match self.state {
            CallState::Pausing => self.transition(ctx, CallState::Paused, "Call paused"),
            CallState::Resuming => self.transition(ctx, CallState::StreamsRunning, "Streams running"),
            CallState::PausedByRemote if direction.is_hold() => {
                self.transition(ctx, CallState::Paused, "Call paused")
            }
            _ => {}
        }
    }

    pub(crate) fn handle_request(&mut self, ctx: &mut Context, request: &SipMessage) {
        match request.method() {
            Some(SipMethod::Invite) => self.handle_reinvite(ctx, request),
            Some(SipMethod::Ack) => debug!(call_id = %self.id, "ACK received"),
            Some(SipMethod::Bye) => {
                self.respond(ctx, request, 200);
                if self.is_live() {
                    self.end(ctx, Reason::None, "Call ended by remote");
                }
            }
            Some(SipMethod::Cancel) => {
                self.respond(ctx, request, 200);
                if matches!(
                    self.state,
                    CallState::IncomingReceived | CallState::IncomingEarlyMedia
                ) {
                    let _ = self.respond_to_invite(ctx, 487, None);
                    self.end(ctx, Reason::None, "Call canceled by remote");
                }
            }
            _ => self.respond(ctx, request, 405),
        }
    }

    fn handle_reinvite(&mut self, ctx: &mut Context, request: &SipMessage) {
        if !self.state.is_established() {
            self.respond(ctx, request, 491);
            return;
        }
        // Glare with our own pending re-INVITE
        if self.transaction.is_some() {
            self.respond(ctx, request, 491);
            return;
        }

        let answer = request
            .media()
            .and_then(|offer| SdpNegotiator::create_answer(offer, ctx.codecs));
        let (Some(offer), Some(answer)) = (request.media(), answer) else {
            self.respond(ctx, request, 488);
            return;
        };

        let response = request
            .response(200)
            .with_contact(ctx.local.clone())
            .with_body(MessageBody::Media(answer.clone()));
        if let Err(err) = ctx.send(&response, &request.reply_target()) {
            warn!(call_id = %self.id, %err, "could not answer re-INVITE");
            return;
        }

        self.remote_target = request.reply_target();
        self.remote_media = Some(offer.clone());
        self.negotiated = Some(answer.clone());
        if let Err(err) = ctx.media.update_streams(&self.id, answer.direction) {
            warn!(call_id = %self.id, %err, "could not update streams");
        }

        match (self.state, offer.direction.is_hold()) {
            (CallState::StreamsRunning, true) => {
                self.transition(ctx, CallState::PausedByRemote, "Paused by remote")
            }
            (CallState::PausedByRemote, false) => {
                self.transition(ctx, CallState::StreamsRunning, "Resumed by remote")
            }
            _ => {}
        }
    }

    fn respond(&self, ctx: &mut Context, request: &SipMessage, status: u16) {
        let response = request.response(status);
        if let Err(err) = ctx.send(&response, &request.reply_target()) {
            warn!(call_id = %self.id, %err, status, "could not send response");
        }
    }

    fn respond_to_invite(
        &self,
        ctx: &mut Context,
        status: u16,
        media: Option<MediaParams>,
    ) -> Result<()> {
        let invite = self
            .invite
            .as_ref()
            .ok_or_else(|| SipError::InvalidState(format!("call {} has no INVITE", self.id)))?;

        let mut response = invite.response(status).with_to_tag(&self.local_tag);
        if (180..300).contains(&status) {
            response = response.with_contact(ctx.local.clone());
        }
        if let Some(media) = media {
            response = response.with_body(MessageBody::Media(media));
        }
        ctx.send(&response, &self.remote_target)
    }

    fn next_cseq(&mut self) -> u32 {
        self.local_cseq += 1;
        self.local_cseq
    }

    fn dialog_request(&self, ctx: &Context, method: SipMethod, cseq: u32) -> Result<SipMessage> {
        SipMessageBuilder::request(method, self.remote_target.clone())
            .call_id(self.id.as_str())
            .cseq(cseq)
            .from(self.local.clone(), Some(&self.local_tag))
            .to(self.remote.clone(), self.remote_tag.as_deref())
            .contact(ctx.local.clone())
            .user_agent(&ctx.config.user_agent)
            .build()
    }

    fn send_invite(&mut self, ctx: &mut Context) {
        let cseq = self.next_cseq();
        let invite = SipMessageBuilder::request(SipMethod::Invite, self.remote.clone())
            .call_id(self.id.as_str())
            .cseq(cseq)
            .from(self.local.clone(), Some(&self.local_tag))
            .to(self.remote.clone(), None)
            .contact(ctx.local.clone())
            .user_agent(&ctx.config.user_agent)
            .body(self.local_media.clone().map(MessageBody::Media))
            .build();

        let sent = invite.and_then(|invite| {
            ctx.send(&invite, &self.remote)?;
            Ok(invite)
        });
        match sent {
            Ok(invite) => {
                self.invite = Some(invite);
                self.transaction = Some(InviteTransaction {
                    cseq,
                    deadline: Some(ctx.now + ctx.config.timers.transaction_timeout),
                    direction: None,
                });
                self.transition(ctx, CallState::OutgoingProgress, "Outgoing call in progress");
            }
            Err(err) => self.fail(ctx, ErrorInfo::local(Reason::IoError, &err.to_string())),
        }
    }

    fn send_reinvite(&mut self, ctx: &mut Context, direction: MediaDirection) -> Result<()> {
        if self.transaction.is_some() {
            return Err(SipError::InvalidState(format!(
                "call {} already has a pending INVITE",
                self.id
            )));
        }
        let media = self
            .negotiated
            .clone()
            .ok_or_else(|| SipError::Media("no negotiated media".to_string()))?
            .with_direction(direction);

        let cseq = self.next_cseq();
        let mut reinvite = self.dialog_request(ctx, SipMethod::Invite, cseq)?;
        reinvite.body = Some(MessageBody::Media(media));
        ctx.send(&reinvite, &self.remote_target)?;

        self.transaction = Some(InviteTransaction {
            cseq,
            deadline: Some(ctx.now + ctx.config.timers.transaction_timeout),
            direction: Some(direction),
        });
        Ok(())
    }

    fn send_ack(&self, ctx: &mut Context, cseq: u32) -> Result<()> {
        let ack = self.dialog_request(ctx, SipMethod::Ack, cseq)?;
        ctx.send(&ack, &self.remote_target)
    }

    fn send_bye(&mut self, ctx: &mut Context) -> Result<()> {
        let cseq = self.next_cseq();
        let bye = self.dialog_request(ctx, SipMethod::Bye, cseq)?;
        ctx.send(&bye, &self.remote_target)
    }

    fn send_cancel(&self, ctx: &mut Context) -> Result<()> {
        let invite = self
            .invite
            .as_ref()
            .ok_or_else(|| SipError::InvalidState(format!("call {} has no INVITE", self.id)))?;

        // CANCEL matches the INVITE it cancels, outside the dialog
        let cancel = SipMessageBuilder::request(SipMethod::Cancel, self.remote.clone())
            .call_id(self.id.as_str())
            .cseq(invite.cseq.sequence)
            .from(self.local.clone(), Some(&self.local_tag))
            .to(self.remote.clone(), None)
            .build()?;
        ctx.send(&cancel, &self.remote)
    }
}
