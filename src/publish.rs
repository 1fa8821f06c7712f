use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::core::Context;
use crate::subscription::DEFAULT_CONTENT_TYPE;
use crate::timer::{is_due, Backoff};
use crate::{
    generate_call_id, generate_tag, CoreEvent, ErrorInfo, MessageBody, PublishId, PublishState,
    Reason, Result, SipError, SipMessage, SipMessageBuilder, SipMethod, SipUri,
};

#[derive(Debug, Clone, Copy)]
struct PublishTransaction {
    cseq: u32,
    deadline: Instant,
    expires: u32,
    with_body: bool,
}

/// Event state published to a presence server (RFC 3903 style).
#[derive(Debug)]
pub struct Publish {
    id: PublishId,
    state: PublishState,
    event: String,
    local: SipUri,
    resource: SipUri,
    body: String,
    expires: u32,
    etag: Option<String>,
    call_id: String,
    from_tag: String,
    cseq: u32,
    transaction: Option<PublishTransaction>,
    refresh_at: Option<Instant>,
    next_attempt: Option<Instant>,
    backoff: Backoff,
    /// Transaction interrupted by a network loss, resent as it was.
    suspended: Option<PublishTransaction>,
    unpublishing: bool,
    reason: Reason,
    error_info: Option<Arc<ErrorInfo>>,
}

impl Publish {
    pub(crate) fn new(
        ctx: &Context,
        id: PublishId,
        resource: SipUri,
        event: &str,
        body: &str,
        expires: u32,
    ) -> Self {
        Publish {
            id,
            state: PublishState::None,
            event: event.to_string(),
            local: ctx.identity.clone(),
            call_id: generate_call_id(&resource.host),
            resource,
            body: body.to_string(),
            expires,
            etag: None,
            from_tag: generate_tag(),
            cseq: 0,
            transaction: None,
            refresh_at: None,
            next_attempt: Some(ctx.now),
            backoff: Backoff::new(ctx.config.retry.clone()),
            suspended: None,
            unpublishing: false,
            reason: Reason::None,
            error_info: None,
        }
    }

    pub fn id(&self) -> &PublishId {
        &self.id
    }

    pub fn state(&self) -> PublishState {
        self.state
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn resource(&self) -> &SipUri {
        &self.resource
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Entity tag assigned by the server to the current publication.
    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    pub fn reason(&self) -> Reason {
        self.reason
    }

    pub fn error_info(&self) -> Option<&Arc<ErrorInfo>> {
        self.error_info.as_ref()
    }

    pub(crate) fn matches(&self, message: &SipMessage) -> bool {
        message.call_id == self.call_id
    }

    pub(crate) fn is_finished(&self) -> bool {
        match self.state {
            PublishState::Cleared => true,
            PublishState::Error => self.next_attempt.is_none(),
            _ => false,
        }
    }

    fn set_state(&mut self, ctx: &mut Context, state: PublishState, error_info: Option<ErrorInfo>) {
        let reason = error_info.as_ref().map_or(Reason::None, ErrorInfo::reason);
        if state == self.state && reason == self.reason {
            return;
        }

        info!(publish_id = %self.id, event = %self.event, from = ?self.state, to = ?state, "publish state changed");
        self.state = state;
        self.reason = reason;
        self.error_info = error_info.map(ErrorInfo::shared);
        ctx.emit(CoreEvent::PublishStateChanged {
            publish_id: self.id.clone(),
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
                if transaction.expires == 0 {
                    self.set_state(ctx, PublishState::Cleared, None);
                } else {
                    self.failure(ctx, ErrorInfo::local(Reason::NoResponse, "PUBLISH timed out"));
                }
            }
            return;
        }

        if is_due(self.next_attempt, ctx.now) {
            self.next_attempt = None;
            match self.suspended.take() {
                Some(suspended) => self.send_publish(ctx, suspended.expires, suspended.with_body),
                None if self.unpublishing => self.send_publish(ctx, 0, false),
                None => self.send_publish(ctx, self.expires, true),
            }
        } else if self.state == PublishState::Ok && is_due(self.refresh_at, ctx.now) {
            self.refresh_at = None;
            self.set_state(ctx, PublishState::Expiring, None);
            // A refresh carries no body, only the entity tag
            self.send_publish(ctx, self.expires, false);
        }
    }

    fn send_publish(&mut self, ctx: &mut Context, expires: u32, with_body: bool) {
        self.cseq += 1;
        let body = (with_body && expires > 0)
            .then(|| MessageBody::text(DEFAULT_CONTENT_TYPE, &self.body));
        let request = SipMessageBuilder::request(SipMethod::Publish, self.resource.clone())
            .call_id(&self.call_id)
            .cseq(self.cseq)
            .from(self.local.clone(), Some(&self.from_tag))
            .to(self.resource.clone(), None)
            .event(&self.event)
            .expires(expires)
            .if_match(self.etag.clone())
            .user_agent(&ctx.config.user_agent)
            .body(body)
            .build();
        // Publications are handled by the presence server of the resource's domain
        let server = self.resource.domain_uri();
        let sent = request.and_then(|request| ctx.send(&request, &server));

        match sent {
            Ok(()) => {
                debug!(publish_id = %self.id, expires, etag = ?self.etag, "PUBLISH sent");
                self.transaction = Some(PublishTransaction {
                    cseq: self.cseq,
                    deadline: ctx.now + ctx.config.timers.transaction_timeout,
                    expires,
                    with_body,
                });
                if matches!(self.state, PublishState::None | PublishState::Error) {
                    self.set_state(ctx, PublishState::Progress, None);
                }
            }
            Err(err) if expires == 0 => {
                warn!(publish_id = %self.id, %err, "could not unpublish");
                self.set_state(ctx, PublishState::Cleared, None);
            }
            Err(err) => self.failure(ctx, ErrorInfo::local(Reason::IoError, &err.to_string())),
        }
    }

    fn failure(&mut self, ctx: &mut Context, info: ErrorInfo) {
        warn!(publish_id = %self.id, error = %info, "publish failed");
        self.refresh_at = None;
        self.next_attempt = info
            .reason()
            .is_retryable()
            .then(|| ctx.now + self.backoff.next_delay());
        self.set_state(ctx, PublishState::Error, Some(info));
    }

    pub(crate) fn handle_response(&mut self, ctx: &mut Context, response: &SipMessage) {
        let Some(status) = response.status_code() else {
            return;
        };
        let transaction = match self.transaction {
            Some(t) if t.cseq == response.cseq.sequence => t,
            _ => return,
        };
        if status < 200 {
            return;
        }
        self.transaction = None;

        if transaction.expires == 0 {
            self.etag = None;
            self.set_state(ctx, PublishState::Cleared, None);
            return;
        }

        match status {
            200..=299 => {
                if let Some(ref etag) = response.etag {
                    self.etag = Some(etag.clone());
                }
                self.backoff.reset();
                let granted = response.expires.unwrap_or(transaction.expires).max(1);
                self.refresh_at = Some(
                    ctx.now + Duration::from_secs_f64(f64::from(granted) * ctx.config.refresh_ratio),
                );
                self.set_state(ctx, PublishState::Ok, None);
            }
            412 => {
                // The server forgot our entity; start over with a full body
                debug!(publish_id = %self.id, "conditional PUBLISH refused, republishing");
                self.etag = None;
                self.send_publish(ctx, self.expires, true);
            }
            _ => self.failure(ctx, ErrorInfo::from_status(status, response.reason_phrase())),
        }
    }

    pub(crate) fn update(&mut self, ctx: &mut Context, body: &str) -> Result<()> {
        if self.state == PublishState::Cleared || self.unpublishing {
            return Err(SipError::InvalidState(format!(
                "publish {} is cleared",
                self.id
            )));
        }
        self.body = body.to_string();
        if let Some(ref mut suspended) = self.suspended {
            // The resent PUBLISH carries the new body
            suspended.with_body = true;
        } else if self.transaction.is_none() && self.next_attempt.is_none() && ctx.reachable {
            self.send_publish(ctx, self.expires, true);
        } else {
            // Picked up by the pending attempt, or once the network is back
            self.next_attempt = self.next_attempt.or(Some(ctx.now));
        }
        Ok(())
    }

    pub(crate) fn unpublish(&mut self, ctx: &mut Context) {
        self.next_attempt = None;
        self.refresh_at = None;
        self.transaction = None;
        self.suspended = None;

        if self.etag.is_none() {
            self.set_state(ctx, PublishState::Cleared, None);
            return;
        }
        self.unpublishing = true;
        if ctx.reachable {
            self.send_publish(ctx, 0, false);
        } else {
            debug!(publish_id = %self.id, "unpublish deferred until the network is back");
            self.next_attempt = Some(ctx.now);
        }
    }

    /// Fire-and-forget removal before the record is dropped.
    pub(crate) fn release(&mut self, ctx: &mut Context) {
        if self.state == PublishState::Cleared {
            return;
        }
        if self.etag.is_some() && ctx.reachable {
            self.send_publish(ctx, 0, false);
        }
        self.transaction = None;
        self.set_state(ctx, PublishState::Cleared, None);
    }

    pub(crate) fn on_network_lost(&mut self) {
        if let Some(transaction) = self.transaction.take() {
            debug!(publish_id = %self.id, expires = transaction.expires, "PUBLISH suspended");
            self.suspended = Some(transaction);
        }
    }

    pub(crate) fn on_network_restored(&mut self, now: Instant) {
        if self.suspended.is_some() || self.next_attempt.is_some() {
            self.next_attempt = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::Harness;

    fn publish(harness: &mut Harness) -> Publish {
        harness.with_context(|ctx| {
            Publish::new(
                ctx,
                PublishId::generate(),
                SipUri::with_user("alice", "example.com"),
                "presence",
                "open",
                600,
            )
        })
    }

    fn ok(request: &SipMessage, etag: &str) -> SipMessage {
        let mut response = request.response(200);
        response.etag = Some(etag.to_string());
        response.expires = request.expires;
        response
    }

    #[test]
    fn test_publish_refresh_uses_etag() {
        let mut harness = Harness::new();
        let mut publication = publish(&mut harness);

        harness.with_context(|ctx| publication.tick(ctx));
        assert_eq!(publication.state(), PublishState::Progress);
        let first = harness.sent().pop().unwrap();
        assert!(first.if_match.is_none());
        assert_eq!(first.body.as_ref().and_then(MessageBody::as_text), Some("open"));

        harness.with_context(|ctx| publication.handle_response(ctx, &ok(&first, "e1")));
        assert_eq!(publication.state(), PublishState::Ok);
        assert_eq!(publication.etag(), Some("e1"));

        harness.advance(Duration::from_secs(300));
        harness.with_context(|ctx| publication.tick(ctx));
        assert_eq!(publication.state(), PublishState::Expiring);
        let refresh = harness.sent().pop().unwrap();
        assert_eq!(refresh.if_match.as_deref(), Some("e1"));
        assert!(refresh.body.is_none());

        harness.with_context(|ctx| publication.handle_response(ctx, &ok(&refresh, "e2")));
        assert_eq!(publication.state(), PublishState::Ok);
        assert_eq!(publication.etag(), Some("e2"));
    }

    #[test]
    fn test_conditional_failure_republishes() {
        let mut harness = Harness::new();
        let mut publication = publish(&mut harness);
        harness.with_context(|ctx| publication.tick(ctx));
        let first = harness.sent().pop().unwrap();
        harness.with_context(|ctx| publication.handle_response(ctx, &ok(&first, "e1")));

        harness.with_context(|ctx| publication.update(ctx, "busy")).unwrap();
        let update = harness.sent().pop().unwrap();
        assert_eq!(update.if_match.as_deref(), Some("e1"));

        harness.with_context(|ctx| publication.handle_response(ctx, &update.response(412)));
        let fresh = harness.sent().pop().unwrap();
        assert!(fresh.if_match.is_none());
        assert_eq!(fresh.body.as_ref().and_then(MessageBody::as_text), Some("busy"));
    }

    #[test]
    fn test_failure_backs_off_then_unpublish() {
        let mut harness = Harness::new();
        let mut publication = publish(&mut harness);
        harness.with_context(|ctx| publication.tick(ctx));
        let first = harness.sent().pop().unwrap();

        harness.with_context(|ctx| publication.handle_response(ctx, &first.response(500)));
        assert_eq!(publication.state(), PublishState::Error);
        assert!(!publication.is_finished());

        harness.with_context(|ctx| publication.tick(ctx));
        assert!(harness.sent().is_empty());
        harness.advance(Duration::from_secs(1));
        harness.with_context(|ctx| publication.tick(ctx));
        let retry = harness.sent().pop().unwrap();
        harness.with_context(|ctx| publication.handle_response(ctx, &ok(&retry, "e9")));

        harness.with_context(|ctx| publication.unpublish(ctx));
        let removal = harness.sent().pop().unwrap();
        assert_eq!(removal.expires, Some(0));
        assert_eq!(removal.if_match.as_deref(), Some("e9"));
        harness.with_context(|ctx| publication.handle_response(ctx, &removal.response(200)));
        assert_eq!(publication.state(), PublishState::Cleared);
        assert!(publication.is_finished());
    }

    fn published(harness: &mut Harness) -> Publish {
        let mut publication = publish(harness);
        harness.with_context(|ctx| publication.tick(ctx));
        let first = harness.sent().pop().unwrap();
        harness.with_context(|ctx| publication.handle_response(ctx, &ok(&first, "e1")));
        assert_eq!(publication.state(), PublishState::Ok);
        publication
    }

    fn restore(harness: &mut Harness, publication: &mut Publish) {
        harness.reachable = true;
        publication.on_network_restored(harness.now());
        harness.with_context(|ctx| publication.tick(ctx));
    }

    #[test]
    fn test_unpublish_resent_after_network_loss() {
        let mut harness = Harness::new();
        let mut publication = published(&mut harness);

        harness.with_context(|ctx| publication.unpublish(ctx));
        let removal = harness.sent().pop().unwrap();
        assert_eq!(removal.expires, Some(0));

        publication.on_network_lost();
        harness.reachable = false;
        restore(&mut harness, &mut publication);

        let resent = harness.sent().pop().unwrap();
        assert_eq!(resent.expires, Some(0));
        assert!(resent.body.is_none());
        assert_eq!(resent.if_match.as_deref(), Some("e1"));
        harness.with_context(|ctx| publication.handle_response(ctx, &resent.response(200)));
        assert_eq!(publication.state(), PublishState::Cleared);
    }

    #[test]
    fn test_update_waits_for_network() {
        let mut harness = Harness::new();
        let mut publication = published(&mut harness);

        harness.reachable = false;
        harness.with_context(|ctx| publication.update(ctx, "busy")).unwrap();
        assert!(harness.sent().is_empty());
        assert_eq!(publication.state(), PublishState::Ok);

        restore(&mut harness, &mut publication);
        let update = harness.sent().pop().unwrap();
        assert_eq!(update.if_match.as_deref(), Some("e1"));
        assert_eq!(update.expires, Some(600));
        assert_eq!(update.body.as_ref().and_then(MessageBody::as_text), Some("busy"));
    }

    #[test]
    fn test_update_during_suspended_refresh_carries_body() {
        let mut harness = Harness::new();
        let mut publication = published(&mut harness);

        harness.advance(Duration::from_secs(300));
        harness.with_context(|ctx| publication.tick(ctx));
        let refresh = harness.sent().pop().unwrap();
        assert!(refresh.body.is_none());

        publication.on_network_lost();
        harness.reachable = false;
        harness.with_context(|ctx| publication.update(ctx, "busy")).unwrap();
        restore(&mut harness, &mut publication);
        let resent = harness.sent().pop().unwrap();
        assert_eq!(resent.body.as_ref().and_then(MessageBody::as_text), Some("busy"));
    }

    #[test]
    fn test_unpublish_waits_for_network() {
        let mut harness = Harness::new();
        let mut publication = published(&mut harness);

        harness.reachable = false;
        harness.with_context(|ctx| publication.unpublish(ctx));
        assert!(harness.sent().is_empty());
        assert_eq!(publication.state(), PublishState::Ok);
        assert!(harness.with_context(|ctx| publication.update(ctx, "busy")).is_err());

        restore(&mut harness, &mut publication);
        let removal = harness.sent().pop().unwrap();
        assert_eq!(removal.expires, Some(0));
        harness.with_context(|ctx| publication.handle_response(ctx, &removal.response(200)));
        assert_eq!(publication.state(), PublishState::Cleared);
        assert!(publication.is_finished());
    }

    #[test]
    fn test_not_found_is_final() {
        let mut harness = Harness::new();
        let mut publication = publish(&mut harness);
        harness.with_context(|ctx| publication.tick(ctx));
        let first = harness.sent().pop().unwrap();
        harness.with_context(|ctx| publication.handle_response(ctx, &first.response(404)));
        assert_eq!(publication.reason(), Reason::NotFound);
        assert!(publication.is_finished());
    }
}
