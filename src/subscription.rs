use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::core::Context;
use crate::timer::{is_due, Backoff};
use crate::{
    generate_call_id, generate_tag, CoreEvent, ErrorInfo, MessageBody, Reason, Result, SipError,
    SipMessage, SipMessageBuilder, SipMethod, SipUri, SubscribePolicy, SubscriptionDirection,
    SubscriptionId, SubscriptionState, SubscriptionStatus,
};

pub(crate) const DEFAULT_CONTENT_TYPE: &str = "application/pidf+xml";

#[derive(Debug, Clone, Copy)]
struct SubscribeTransaction {
    cseq: u32,
    deadline: Instant,
    expires: u32,
}

/// One side of a SUBSCRIBE/NOTIFY dialog for an event package.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    direction: SubscriptionDirection,
    state: SubscriptionState,
    event: String,
    local: SipUri,
    /// Notifier for outgoing subscriptions, subscriber for incoming ones.
    remote: SipUri,
    remote_target: SipUri,
    call_id: String,
    local_tag: String,
    remote_tag: Option<String>,
    cseq: u32,
    expires: u32,
    expires_at: Option<Instant>,
    refresh_at: Option<Instant>,
    transaction: Option<SubscribeTransaction>,
    backoff: Backoff,
    next_attempt: Option<Instant>,
    suspended: bool,
    reason: Reason,
    error_info: Option<Arc<ErrorInfo>>,
    last_body: Option<String>,
}

impl Subscription {
    pub(crate) fn outgoing(
        ctx: &Context,
        id: SubscriptionId,
        resource: SipUri,
        event: &str,
        expires: u32,
    ) -> Self {
        Subscription {
            id,
            direction: SubscriptionDirection::Outgoing,
            state: SubscriptionState::None,
            event: event.to_string(),
            local: ctx.identity.clone(),
            remote_target: resource.clone(),
            call_id: generate_call_id(&resource.host),
            remote: resource,
            local_tag: generate_tag(),
            remote_tag: None,
            cseq: 0,
            expires,
            expires_at: None,
            refresh_at: None,
            transaction: None,
            backoff: Backoff::new(ctx.config.retry.clone()),
            next_attempt: Some(ctx.now),
            suspended: false,
            reason: Reason::None,
            error_info: None,
            last_body: None,
        }
    }

    /// Accepts, parks or denies a new SUBSCRIBE according to `policy`.
    pub(crate) fn incoming(
        ctx: &mut Context,
        request: &SipMessage,
        policy: SubscribePolicy,
    ) -> Self {
        let expires = request.expires.unwrap_or(3600);
        let mut subscription = Subscription {
            id: SubscriptionId::generate(),
            direction: SubscriptionDirection::Incoming,
            state: SubscriptionState::None,
            event: request.event.clone().unwrap_or_else(|| "presence".to_string()),
            local: request.to.clone(),
            remote: request.from.clone(),
            remote_target: request.reply_target(),
            call_id: request.call_id.clone(),
            local_tag: generate_tag(),
            remote_tag: request.from_tag.clone(),
            cseq: 0,
            expires,
            expires_at: Some(ctx.now + Duration::from_secs(u64::from(expires))),
            refresh_at: None,
            transaction: None,
            backoff: Backoff::new(ctx.config.retry.clone()),
            next_attempt: None,
            suspended: false,
            reason: Reason::None,
            error_info: None,
            last_body: None,
        };

        subscription.set_state(ctx, SubscriptionState::IncomingReceived, None);
        match policy {
            SubscribePolicy::Accept => {
                subscription.respond(ctx, request, 200);
                subscription.send_notify(ctx, SubscriptionStatus::Active, None);
                subscription.set_state(ctx, SubscriptionState::Active, None);
            }
            SubscribePolicy::Wait => {
                subscription.respond(ctx, request, 202);
                subscription.send_notify(ctx, SubscriptionStatus::Pending, None);
                subscription.set_state(ctx, SubscriptionState::Pending, None);
            }
            SubscribePolicy::Deny => {
                subscription.respond(ctx, request, 603);
                subscription.set_state(
                    ctx,
                    SubscriptionState::Terminated,
                    Some(ErrorInfo::from_status(603, "Decline")),
                );
            }
        }
        subscription
    }

    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    pub fn direction(&self) -> SubscriptionDirection {
        self.direction
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    pub fn event(&self) -> &str {
        &self.event
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

    /// Body of the last NOTIFY received or sent.
    pub fn last_body(&self) -> Option<&str> {
        self.last_body.as_deref()
    }

    pub(crate) fn matches(&self, message: &SipMessage) -> bool {
        message.call_id == self.call_id
    }

    /// Terminated records and errors that will not be retried.
    pub(crate) fn is_finished(&self) -> bool {
        match self.state {
            SubscriptionState::Terminated => true,
            SubscriptionState::Error => self.next_attempt.is_none(),
            _ => false,
        }
    }

    fn set_state(&mut self, ctx: &mut Context, state: SubscriptionState, error_info: Option<ErrorInfo>) {
        let reason = error_info.as_ref().map_or(Reason::None, ErrorInfo::reason);
        if state == self.state && reason == self.reason {
            return;
        }

        info!(subscription_id = %self.id, event = %self.event, from = ?self.state, to = ?state, "subscription state changed");
        self.state = state;
        self.reason = reason;
        self.error_info = error_info.map(ErrorInfo::shared);

        if state == SubscriptionState::Terminated {
            self.transaction = None;
            self.next_attempt = None;
            self.refresh_at = None;
            self.expires_at = None;
        }

        ctx.emit(CoreEvent::SubscriptionStateChanged {
            subscription_id: self.id.clone(),
            direction: self.direction,
            state,
            reason,
            error_info: self.error_info.clone(),
        });
    }

    pub(crate) fn tick(&mut self, ctx: &mut Context) {
        if !ctx.reachable {
            return;
        }

        if let Some(transaction) = self.transaction {
            if transaction.deadline <= ctx.now {
                self.transaction = None;
                self.failure(ctx, ErrorInfo::local(Reason::NoResponse, "SUBSCRIBE timed out"));
            }
            return;
        }

        match self.direction {
            SubscriptionDirection::Outgoing => {
                if is_due(self.next_attempt, ctx.now) {
                    self.next_attempt = None;
                    self.send_subscribe(ctx, self.expires);
                } else if is_due(self.refresh_at, ctx.now) {
                    self.refresh_at = None;
                    // A pending subscription stays pending across refreshes
                    if self.state == SubscriptionState::Active {
                        self.set_state(ctx, SubscriptionState::Expiring, None);
                    }
                    self.send_subscribe(ctx, self.expires);
                }
            }
            SubscriptionDirection::Incoming => {
                if is_due(self.expires_at, ctx.now) {
                    debug!(subscription_id = %self.id, "subscription expired");
                    self.send_notify(ctx, SubscriptionStatus::Terminated, None);
                    self.set_state(ctx, SubscriptionState::Terminated, None);
                }
            }
        }
    }

    fn send_subscribe(&mut self, ctx: &mut Context, expires: u32) {
        // A fresh dialog after a failure
        if matches!(self.state, SubscriptionState::None | SubscriptionState::Error) {
            self.call_id = generate_call_id(&self.remote.host);
            self.local_tag = generate_tag();
            self.remote_tag = None;
            self.remote_target = self.remote.clone();
        }

        self.cseq += 1;
        let request = SipMessageBuilder::request(SipMethod::Subscribe, self.remote_target.clone())
            .call_id(&self.call_id)
            .cseq(self.cseq)
            .from(self.local.clone(), Some(&self.local_tag))
            .to(self.remote.clone(), self.remote_tag.as_deref())
            .contact(ctx.local.clone())
            .event(&self.event)
            .expires(expires)
            .user_agent(&ctx.config.user_agent)
            .build();
        let sent = request.and_then(|request| ctx.send(&request, &self.remote_target));

        match sent {
            Ok(()) => {
                debug!(subscription_id = %self.id, expires, "SUBSCRIBE sent");
                self.suspended = false;
                self.transaction = Some(SubscribeTransaction {
                    cseq: self.cseq,
                    deadline: ctx.now + ctx.config.timers.transaction_timeout,
                    expires,
                });
                if matches!(self.state, SubscriptionState::None | SubscriptionState::Error) {
                    self.set_state(ctx, SubscriptionState::OutgoingProgress, None);
                }
            }
            Err(err) => self.failure(ctx, ErrorInfo::local(Reason::IoError, &err.to_string())),
        }
    }

    fn failure(&mut self, ctx: &mut Context, info: ErrorInfo) {
        let reason = info.reason();
        warn!(subscription_id = %self.id, error = %info, "subscription failed");
        if self.direction == SubscriptionDirection::Incoming {
            self.set_state(ctx, SubscriptionState::Terminated, Some(info));
            return;
        }

        self.refresh_at = None;
        self.next_attempt = reason
            .is_retryable()
            .then(|| ctx.now + self.backoff.next_delay());
        self.set_state(ctx, SubscriptionState::Error, Some(info));
    }

    pub(crate) fn handle_response(&mut self, ctx: &mut Context, response: &SipMessage) {
        let Some(status) = response.status_code() else {
            return;
        };

        // Answers to our NOTIFYs
        if response.cseq.method == SipMethod::Notify {
            if status == 481 && self.state != SubscriptionState::Terminated {
                self.set_state(
                    ctx,
                    SubscriptionState::Terminated,
                    Some(ErrorInfo::from_status(status, response.reason_phrase())),
                );
            }
            return;
        }

        let transaction = match self.transaction {
            Some(t) if t.cseq == response.cseq.sequence => t,
            _ => return,
        };
        if status < 200 {
            return;
        }
        self.transaction = None;

        if status >= 300 {
            self.failure(ctx, ErrorInfo::from_status(status, response.reason_phrase()));
            return;
        }

        if transaction.expires == 0 {
            self.set_state(ctx, SubscriptionState::Terminated, None);
            return;
        }

        if let Some(ref tag) = response.to_tag {
            self.remote_tag = Some(tag.clone());
        }
        if let Some(ref source) = response.source {
            self.remote_target = source.clone();
        }
        self.backoff.reset();

        let granted = response.expires.unwrap_or(transaction.expires).max(1);
        self.expires_at = Some(ctx.now + Duration::from_secs(u64::from(granted)));
        self.refresh_at =
            Some(ctx.now + Duration::from_secs_f64(f64::from(granted) * ctx.config.refresh_ratio));

        match (status, self.state) {
            (202, SubscriptionState::OutgoingProgress) => {
                self.set_state(ctx, SubscriptionState::Pending, None)
            }
            (_, SubscriptionState::Pending) => {}
            _ => self.set_state(ctx, SubscriptionState::Active, None),
        }
    }

    pub(crate) fn handle_request(&mut self, ctx: &mut Context, request: &SipMessage) {
        match (self.direction, request.method()) {
            (SubscriptionDirection::Outgoing, Some(SipMethod::Notify)) => {
                self.handle_notify(ctx, request)
            }
            (SubscriptionDirection::Incoming, Some(SipMethod::Subscribe)) => {
                self.handle_refresh(ctx, request)
            }
            _ => self.respond(ctx, request, 405),
        }
    }

    fn handle_notify(&mut self, ctx: &mut Context, request: &SipMessage) {
        if self.state == SubscriptionState::Terminated {
            self.respond(ctx, request, 481);
            return;
        }
        self.respond(ctx, request, 200);

        if self.remote_tag.is_none() {
            self.remote_tag = request.from_tag.clone();
        }
        let body = request
            .body
            .as_ref()
            .and_then(MessageBody::as_text)
            .map(str::to_string);
        self.last_body = body.clone();
        ctx.emit(CoreEvent::NotifyReceived {
            subscription_id: self.id.clone(),
            event: self.event.clone(),
            body,
        });

        match request.subscription_state {
            Some(SubscriptionStatus::Active) => {
                if matches!(
                    self.state,
                    SubscriptionState::OutgoingProgress | SubscriptionState::Pending
                ) {
                    self.set_state(ctx, SubscriptionState::Active, None);
                }
            }
            Some(SubscriptionStatus::Pending) => {
                if self.state == SubscriptionState::OutgoingProgress {
                    self.set_state(ctx, SubscriptionState::Pending, None);
                }
            }
            Some(SubscriptionStatus::Terminated) => {
                self.set_state(ctx, SubscriptionState::Terminated, None)
            }
            None => {}
        }
    }

    fn handle_refresh(&mut self, ctx: &mut Context, request: &SipMessage) {
        let expires = request.expires.unwrap_or(self.expires);
        self.respond(ctx, request, 200);

        if expires == 0 {
            self.send_notify(ctx, SubscriptionStatus::Terminated, None);
            self.set_state(ctx, SubscriptionState::Terminated, None);
            return;
        }
        self.expires = expires;
        self.expires_at = Some(ctx.now + Duration::from_secs(u64::from(expires)));
    }

    pub(crate) fn accept(&mut self, ctx: &mut Context) -> Result<()> {
        self.expect_incoming(SubscriptionState::Pending, "accept")?;
        self.send_notify(ctx, SubscriptionStatus::Active, self.last_body.clone());
        self.set_state(ctx, SubscriptionState::Active, None);
        Ok(())
    }

    pub(crate) fn decline(&mut self, ctx: &mut Context) -> Result<()> {
        self.expect_incoming(SubscriptionState::Pending, "decline")?;
        self.send_notify(ctx, SubscriptionStatus::Terminated, None);
        self.set_state(
            ctx,
            SubscriptionState::Terminated,
            Some(ErrorInfo::local(Reason::Declined, "Subscription declined")),
        );
        Ok(())
    }

    pub(crate) fn notify(&mut self, ctx: &mut Context, body: &str) -> Result<()> {
        self.expect_incoming(SubscriptionState::Active, "notify")?;
        self.last_body = Some(body.to_string());
        self.send_notify(ctx, SubscriptionStatus::Active, Some(body.to_string()));
        Ok(())
    }

    pub(crate) fn terminate(&mut self, ctx: &mut Context) {
        if self.state == SubscriptionState::Terminated {
            return;
        }

        match self.direction {
            SubscriptionDirection::Incoming => {
                self.send_notify(ctx, SubscriptionStatus::Terminated, None)
            }
            SubscriptionDirection::Outgoing if self.remote_tag.is_some() => {
                self.cseq += 1;
                let request =
                    SipMessageBuilder::request(SipMethod::Subscribe, self.remote_target.clone())
                        .call_id(&self.call_id)
                        .cseq(self.cseq)
                        .from(self.local.clone(), Some(&self.local_tag))
                        .to(self.remote.clone(), self.remote_tag.as_deref())
                        .event(&self.event)
                        .expires(0)
                        .build();
                if let Err(err) =
                    request.and_then(|request| ctx.send(&request, &self.remote_target))
                {
                    warn!(subscription_id = %self.id, %err, "could not unsubscribe");
                }
            }
            SubscriptionDirection::Outgoing => {}
        }
        self.set_state(ctx, SubscriptionState::Terminated, None);
    }

    fn expect_incoming(&self, state: SubscriptionState, operation: &str) -> Result<()> {
        if self.direction == SubscriptionDirection::Incoming && self.state == state {
            return Ok(());
        }
        Err(SipError::InvalidState(format!(
            "cannot {} subscription {} in state {:?}",
            operation, self.id, self.state
        )))
    }

    fn respond(&self, ctx: &mut Context, request: &SipMessage, status: u16) {
        let mut response = request.response(status);
        if self.direction == SubscriptionDirection::Incoming {
            response = response.with_to_tag(&self.local_tag);
            if status < 300 {
                response = response.with_expires(self.expires);
            }
        }
        if let Err(err) = ctx.send(&response, &request.reply_target()) {
            warn!(subscription_id = %self.id, %err, status, "could not send response");
        }
    }

    fn send_notify(&mut self, ctx: &mut Context, status: SubscriptionStatus, body: Option<String>) {
        self.cseq += 1;
        let request = SipMessageBuilder::request(SipMethod::Notify, self.remote_target.clone())
            .call_id(&self.call_id)
            .cseq(self.cseq)
            .from(self.local.clone(), Some(&self.local_tag))
            .to(self.remote.clone(), self.remote_tag.as_deref())
            .contact(ctx.local.clone())
            .event(&self.event)
            .subscription_state(status)
            .body(body.map(|b| MessageBody::text(DEFAULT_CONTENT_TYPE, &b)))
            .build();

        if let Err(err) = request.and_then(|request| ctx.send(&request, &self.remote_target)) {
            warn!(subscription_id = %self.id, %err, "could not send NOTIFY");
        }
    }

    pub(crate) fn on_network_lost(&mut self) {
        if self.transaction.take().is_some() {
            debug!(subscription_id = %self.id, "SUBSCRIBE suspended");
            self.suspended = true;
        }
    }

    pub(crate) fn on_network_restored(&mut self, now: Instant) {
        if self.direction == SubscriptionDirection::Incoming {
            return;
        }
        if self.suspended || self.next_attempt.is_some() {
            self.suspended = false;
            self.next_attempt = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::Harness;

    fn presence(harness: &mut Harness) -> Subscription {
        harness.with_context(|ctx| {
            Subscription::outgoing(
                ctx,
                SubscriptionId::generate(),
                SipUri::with_user("bob", "example.com"),
                "presence",
                600,
            )
        })
    }

    fn notify(request: &SipMessage, status: SubscriptionStatus, body: &str) -> SipMessage {
        SipMessageBuilder::request(SipMethod::Notify, request.from.clone())
            .call_id(&request.call_id)
            .cseq(1)
            .from(request.to.clone(), Some("n1"))
            .to(request.from.clone(), request.from_tag.as_deref())
            .event("presence")
            .subscription_state(status)
            .body(Some(MessageBody::text(DEFAULT_CONTENT_TYPE, body)))
            .build()
            .unwrap()
    }

    #[test]
    fn test_outgoing_subscription_refresh_loop() {
        let mut harness = Harness::new();
        let mut sub = presence(&mut harness);

        harness.with_context(|ctx| sub.tick(ctx));
        assert_eq!(sub.state(), SubscriptionState::OutgoingProgress);
        let request = harness.sent().pop().unwrap();
        assert_eq!(request.event.as_deref(), Some("presence"));

        let mut ok = request.response(200).with_to_tag("n1");
        ok.expires = Some(600);
        harness.with_context(|ctx| sub.handle_response(ctx, &ok));
        assert_eq!(sub.state(), SubscriptionState::Active);

        harness.with_context(|ctx| {
            sub.handle_request(ctx, &notify(&request, SubscriptionStatus::Active, "open"))
        });
        assert_eq!(sub.last_body(), Some("open"));
        assert_eq!(harness.sent().pop().and_then(|m| m.status_code()), Some(200));

        harness.advance(Duration::from_secs(300));
        harness.with_context(|ctx| sub.tick(ctx));
        assert_eq!(sub.state(), SubscriptionState::Expiring);
        let refresh = harness.sent().pop().unwrap();
        assert_eq!(refresh.call_id, request.call_id);
        assert_eq!(refresh.to_tag.as_deref(), Some("n1"));

        harness.with_context(|ctx| sub.handle_response(ctx, &refresh.response(200)));
        assert_eq!(sub.state(), SubscriptionState::Active);

        let states: Vec<_> = harness
            .events
            .iter()
            .filter_map(|e| e.subscription_state().map(|(_, s)| s))
            .collect();
        assert_eq!(
            states,
            vec![
                SubscriptionState::OutgoingProgress,
                SubscriptionState::Active,
                SubscriptionState::Expiring,
                SubscriptionState::Active,
            ]
        );
    }

    #[test]
    fn test_pending_then_active_by_notify() {
        let mut harness = Harness::new();
        let mut sub = presence(&mut harness);
        harness.with_context(|ctx| sub.tick(ctx));
        let request = harness.sent().pop().unwrap();

        harness.with_context(|ctx| sub.handle_response(ctx, &request.response(202)));
        assert_eq!(sub.state(), SubscriptionState::Pending);
        harness.with_context(|ctx| {
            sub.handle_request(ctx, &notify(&request, SubscriptionStatus::Active, "open"))
        });
        assert_eq!(sub.state(), SubscriptionState::Active);

        harness.with_context(|ctx| {
            sub.handle_request(ctx, &notify(&request, SubscriptionStatus::Terminated, ""))
        });
        assert_eq!(sub.state(), SubscriptionState::Terminated);
        assert!(sub.is_finished());
    }

    #[test]
    fn test_pending_subscription_is_refreshed() {
        let mut harness = Harness::new();
        let mut sub = presence(&mut harness);
        harness.with_context(|ctx| sub.tick(ctx));
        let request = harness.sent().pop().unwrap();

        let mut accepted = request.response(202).with_to_tag("n1");
        accepted.expires = Some(600);
        harness.with_context(|ctx| sub.handle_response(ctx, &accepted));
        assert_eq!(sub.state(), SubscriptionState::Pending);

        harness.advance(Duration::from_secs(299));
        harness.with_context(|ctx| sub.tick(ctx));
        assert!(harness.sent().is_empty());

        harness.advance(Duration::from_secs(1));
        harness.with_context(|ctx| sub.tick(ctx));
        let refresh = harness.sent().pop().unwrap();
        assert_eq!(refresh.call_id, request.call_id);
        assert_eq!(refresh.expires, Some(600));
        assert_eq!(sub.state(), SubscriptionState::Pending);

        let mut again = refresh.response(202);
        again.expires = Some(600);
        harness.with_context(|ctx| sub.handle_response(ctx, &again));
        assert_eq!(sub.state(), SubscriptionState::Pending);

        harness.advance(Duration::from_secs(299));
        harness.with_context(|ctx| sub.tick(ctx));
        assert!(harness.sent().is_empty());
        harness.advance(Duration::from_secs(1));
        harness.with_context(|ctx| sub.tick(ctx));
        assert_eq!(harness.sent().len(), 1);
    }

    #[test]
    fn test_subscribe_waits_for_network() {
        let mut harness = Harness::new();
        let mut sub = presence(&mut harness);
        harness.reachable = false;
        harness.with_context(|ctx| sub.tick(ctx));
        assert!(harness.sent().is_empty());
        assert_eq!(sub.state(), SubscriptionState::None);

        harness.reachable = true;
        harness.with_context(|ctx| sub.tick(ctx));
        let first = harness.sent().pop().unwrap();
        assert_eq!(sub.state(), SubscriptionState::OutgoingProgress);

        // In flight when the link drops
        sub.on_network_lost();
        harness.reachable = false;
        harness.advance(Duration::from_secs(60));
        harness.with_context(|ctx| sub.tick(ctx));
        assert!(harness.sent().is_empty());
        assert_eq!(sub.state(), SubscriptionState::OutgoingProgress);

        harness.reachable = true;
        sub.on_network_restored(harness.now());
        harness.with_context(|ctx| sub.tick(ctx));
        let resent = harness.sent().pop().unwrap();
        assert_eq!(resent.call_id, first.call_id);
        assert_eq!(resent.expires, Some(600));
    }

    #[test]
    fn test_retryable_failure_opens_new_dialog() {
        let mut harness = Harness::new();
        let mut sub = presence(&mut harness);
        harness.with_context(|ctx| sub.tick(ctx));
        let first = harness.sent().pop().unwrap();

        harness.with_context(|ctx| sub.handle_response(ctx, &first.response(503)));
        assert_eq!(sub.state(), SubscriptionState::Error);
        assert!(!sub.is_finished());

        harness.advance(Duration::from_secs(1));
        harness.with_context(|ctx| sub.tick(ctx));
        let retry = harness.sent().pop().unwrap();
        assert_ne!(retry.call_id, first.call_id);
        assert_eq!(sub.state(), SubscriptionState::OutgoingProgress);
    }

    #[test]
    fn test_declined_subscription_is_final() {
        let mut harness = Harness::new();
        let mut sub = presence(&mut harness);
        harness.with_context(|ctx| sub.tick(ctx));
        let first = harness.sent().pop().unwrap();

        harness.with_context(|ctx| sub.handle_response(ctx, &first.response(603)));
        assert_eq!(sub.reason(), Reason::Declined);
        assert!(sub.is_finished());
    }

    fn subscribe_request() -> SipMessage {
        SipMessageBuilder::request(SipMethod::Subscribe, SipUri::with_user("alice", "example.com"))
            .call_id("sub-1")
            .from(SipUri::with_user("bob", "example.com"), Some("b1"))
            .event("presence")
            .expires(120)
            .build()
            .unwrap()
    }

    #[test]
    fn test_incoming_policies() {
        let mut harness = Harness::new();
        let request = subscribe_request();

        let accepted =
            harness.with_context(|ctx| Subscription::incoming(ctx, &request, SubscribePolicy::Accept));
        assert_eq!(accepted.state(), SubscriptionState::Active);
        let sent: Vec<_> = harness.sent().drain(..).collect();
        assert_eq!(sent[0].status_code(), Some(200));
        assert_eq!(sent[1].subscription_state, Some(SubscriptionStatus::Active));

        let denied =
            harness.with_context(|ctx| Subscription::incoming(ctx, &request, SubscribePolicy::Deny));
        assert_eq!(denied.state(), SubscriptionState::Terminated);
        assert_eq!(harness.sent().pop().and_then(|m| m.status_code()), Some(603));
    }

    #[test]
    fn test_waiting_subscription_accept_and_expire() {
        let mut harness = Harness::new();
        let request = subscribe_request();
        let mut sub =
            harness.with_context(|ctx| Subscription::incoming(ctx, &request, SubscribePolicy::Wait));
        assert_eq!(sub.state(), SubscriptionState::Pending);
        assert!(harness.with_context(|ctx| sub.notify(ctx, "busy")).is_err());

        harness.with_context(|ctx| sub.accept(ctx)).unwrap();
        assert_eq!(sub.state(), SubscriptionState::Active);
        harness.with_context(|ctx| sub.notify(ctx, "busy")).unwrap();
        let sent = harness.sent().pop().unwrap();
        assert_eq!(sent.body.as_ref().and_then(MessageBody::as_text), Some("busy"));

        harness.advance(Duration::from_secs(120));
        harness.with_context(|ctx| sub.tick(ctx));
        assert_eq!(sub.state(), SubscriptionState::Terminated);
    }
}
