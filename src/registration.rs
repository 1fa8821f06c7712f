use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::auth::AuthContext;
use crate::core::Context;
use crate::timer::{is_due, Backoff};
use crate::{
    generate_call_id, generate_tag, AccountConfig, AccountId, CoreEvent, Credentials,
    DigestChallenge, ErrorInfo, Reason, RegistrationState, Result, SipMessage, SipMessageBuilder,
    SipMethod, SipUri,
};

#[derive(Debug, Clone, Copy)]
struct RegisterTransaction {
    cseq: u32,
    deadline: Instant,
    expires: u32,
    authorized: bool,
}

/// Registration of one account with its registrar.
#[derive(Debug)]
pub struct Registration {
    id: AccountId,
    config: AccountConfig,
    identity: SipUri,
    registrar: SipUri,
    state: RegistrationState,
    reason: Reason,
    error_info: Option<Arc<ErrorInfo>>,
    /// Cleared by `unregister`; a disabled account never retries.
    enabled: bool,
    auth: Option<AuthContext>,
    challenge: Option<DigestChallenge>,
    awaiting_credentials: bool,
    backoff: Backoff,
    next_attempt: Option<Instant>,
    refresh_at: Option<Instant>,
    keep_alive_at: Option<Instant>,
    transaction: Option<RegisterTransaction>,
    /// An in-flight REGISTER was dropped because the network went away.
    suspended: bool,
    /// An un-REGISTER is owed to the registrar.
    unregistering: bool,
    call_id: String,
    from_tag: String,
    cseq: u32,
    granted_expires: Option<u32>,
}

impl Registration {
    pub(crate) fn new(ctx: &Context, id: AccountId, config: AccountConfig) -> Result<Self> {
        let identity = config.identity()?;
        let registrar = config.registrar_uri()?;
        let auth = config.credentials().as_ref().map(AuthContext::new);
        let enabled = config.register_on_add;

        Ok(Registration {
            id,
            identity,
            registrar: registrar.clone(),
            config,
            state: RegistrationState::None,
            reason: Reason::None,
            error_info: None,
            enabled,
            auth,
            challenge: None,
            awaiting_credentials: false,
            backoff: Backoff::new(ctx.config.retry.clone()),
            next_attempt: enabled.then_some(ctx.now),
            refresh_at: None,
            keep_alive_at: None,
            transaction: None,
            suspended: false,
            unregistering: false,
            call_id: generate_call_id(&registrar.host),
            from_tag: generate_tag(),
            cseq: 0,
            granted_expires: None,
        })
    }

    pub fn id(&self) -> &AccountId {
        &self.id
    }

    pub fn config(&self) -> &AccountConfig {
        &self.config
    }

    pub fn identity(&self) -> &SipUri {
        &self.identity
    }

    pub fn state(&self) -> RegistrationState {
        self.state
    }

    pub fn reason(&self) -> Reason {
        self.reason
    }

    pub fn error_info(&self) -> Option<&Arc<ErrorInfo>> {
        self.error_info.as_ref()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_waiting_for_credentials(&self) -> bool {
        self.awaiting_credentials
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn granted_expires(&self) -> Option<u32> {
        self.granted_expires
    }

    pub(crate) fn matches(&self, message: &SipMessage) -> bool {
        message.call_id == self.call_id
    }

    fn set_state(
        &mut self,
        ctx: &mut Context,
        state: RegistrationState,
        error_info: Option<ErrorInfo>,
        message: &str,
    ) {
        let reason = error_info.as_ref().map_or(Reason::None, ErrorInfo::reason);
        if state == self.state && reason == self.reason {
            return;
        }

        info!(account_id = %self.id, from = ?self.state, to = ?state, ?reason, "{}", message);
        self.state = state;
        self.reason = reason;
        self.error_info = error_info.map(ErrorInfo::shared);

        ctx.emit(CoreEvent::RegistrationStateChanged {
            account_id: self.id.clone(),
            state,
            reason,
            error_info: self.error_info.clone(),
            message: message.to_string(),
        });
    }

    pub(crate) fn tick(&mut self, ctx: &mut Context) {
        // Suspended: nothing fires and nothing is sent
        if !ctx.reachable {
            return;
        }

        if self.state == RegistrationState::Ok && is_due(self.keep_alive_at, ctx.now) {
            if let Err(err) = ctx.transport.send_keep_alive(&self.registrar) {
                warn!(account_id = %self.id, %err, "keep-alive failed");
            }
            self.keep_alive_at = Some(ctx.now + ctx.config.timers.keep_alive_interval);
        }

        if let Some(transaction) = self.transaction {
            if transaction.deadline <= ctx.now {
                self.transaction = None;
                if transaction.expires == 0 {
                    self.set_state(ctx, RegistrationState::Cleared, None, "Unregistered");
                } else {
                    self.failure(ctx, ErrorInfo::local(Reason::NoResponse, "REGISTER timed out"));
                }
            }
            return;
        }

        if !self.enabled {
            if self.unregistering && is_due(self.next_attempt, ctx.now) {
                self.next_attempt = None;
                self.send_register(ctx, 0);
            }
            return;
        }

        let refresh_due =
            self.state == RegistrationState::Ok && is_due(self.refresh_at, ctx.now);
        if is_due(self.next_attempt, ctx.now) || refresh_due {
            self.next_attempt = None;
            self.refresh_at = None;
            self.send_register(ctx, self.config.expire_seconds);
        }
    }

    fn build_register(&mut self, ctx: &Context, expires: u32) -> Result<SipMessage> {
        self.cseq += 1;
        let mut request = SipMessageBuilder::request(SipMethod::Register, self.registrar.clone())
            .call_id(&self.call_id)
            .cseq(self.cseq)
            .from(self.identity.clone(), Some(&self.from_tag))
            .to(self.identity.clone(), None)
            .contact(ctx.local.clone())
            .expires(expires)
            .user_agent(&ctx.config.user_agent)
            .build()?;

        if let (Some(challenge), Some(auth)) = (self.challenge.as_ref(), self.auth.as_mut()) {
            request.authorization = Some(auth.authorize(challenge, &request)?);
        }
        Ok(request)
    }

    fn send_register(&mut self, ctx: &mut Context, expires: u32) {
        let sent = self.build_register(ctx, expires).and_then(|request| {
            ctx.send(&request, &self.registrar)?;
            Ok(request)
        });

        match sent {
            Ok(request) => {
                debug!(account_id = %self.id, expires, "REGISTER sent");
                self.suspended = false;
                self.transaction = Some(RegisterTransaction {
                    cseq: request.cseq.sequence,
                    deadline: ctx.now + ctx.config.timers.transaction_timeout,
                    expires,
                    authorized: request.authorization.is_some(),
                });
                self.set_state(ctx, RegistrationState::Progress, None, "Registration in progress");
            }
            Err(err) if expires == 0 => {
                warn!(account_id = %self.id, %err, "could not unregister");
                self.set_state(ctx, RegistrationState::Cleared, None, "Unregistered");
            }
            Err(err) => self.failure(ctx, ErrorInfo::local(Reason::IoError, &err.to_string())),
        }
    }

    pub(crate) fn handle_response(&mut self, ctx: &mut Context, response: &SipMessage) {
        let Some(status) = response.status_code() else {
            return;
        };
        let transaction = match self.transaction {
            Some(t) if t.cseq == response.cseq.sequence => t,
            _ => {
                debug!(account_id = %self.id, status, "stale REGISTER response");
                return;
            }
        };
        if status < 200 {
            return;
        }
        self.transaction = None;

        if transaction.expires == 0 {
            self.unregistering = false;
            self.set_state(ctx, RegistrationState::Cleared, None, "Unregistered");
            return;
        }

        match status {
            200..=299 => {
                let granted = response.expires.unwrap_or(transaction.expires).max(1);
                self.granted_expires = Some(granted);
                self.backoff.reset();
                self.awaiting_credentials = false;
                self.refresh_at = Some(
                    ctx.now + Duration::from_secs_f64(f64::from(granted) * ctx.config.refresh_ratio),
                );
                self.keep_alive_at = Some(ctx.now + ctx.config.timers.keep_alive_interval);
                self.set_state(ctx, RegistrationState::Ok, None, "Registration successful");
            }
            401 | 407 => {
                let info = ErrorInfo::from_status(status, response.reason_phrase());
                if let Some(ref challenge) = response.www_authenticate {
                    self.challenge = Some(challenge.clone());
                }

                if transaction.authorized {
                    // Our credentials were just refused
                    self.failure(
                        ctx,
                        ErrorInfo::new(Reason::BadCredentials, status, response.reason_phrase())
                            .with_sub(info),
                    );
                } else if self.auth.is_some() && self.challenge.is_some() {
                    self.send_register(ctx, transaction.expires);
                } else {
                    self.failure(ctx, info);
                }
            }
            _ => self.failure(ctx, ErrorInfo::from_status(status, response.reason_phrase())),
        }
    }

    fn failure(&mut self, ctx: &mut Context, info: ErrorInfo) {
        let reason = info.reason();
        let message = format!("Registration failed: {}", info.phrase());
        self.set_state(ctx, RegistrationState::Failed, Some(info), &message);

        if matches!(reason, Reason::BadCredentials | Reason::Unauthorized) {
            self.awaiting_credentials = true;
            self.next_attempt = None;
            ctx.emit(CoreEvent::AuthenticationRequested {
                account_id: self.id.clone(),
                realm: self
                    .challenge
                    .as_ref()
                    .map_or_else(|| self.config.domain.clone(), |c| c.realm.clone()),
                username: self.config.username.clone(),
            });
        } else {
            let delay = self.backoff.next_delay();
            warn!(account_id = %self.id, ?reason, ?delay, "registration retry scheduled");
            self.next_attempt = Some(ctx.now + delay);
        }
    }

    pub(crate) fn set_credentials(&mut self, now: Instant, credentials: &Credentials) {
        self.auth = Some(AuthContext::new(credentials));
        self.awaiting_credentials = false;
        self.backoff.reset();
        if self.enabled {
            self.next_attempt = Some(now);
        }
    }

    pub(crate) fn register(&mut self, now: Instant) {
        self.enabled = true;
        self.unregistering = false;
        self.awaiting_credentials = false;
        self.next_attempt = Some(now);
    }

    pub(crate) fn refresh(&mut self, now: Instant) {
        if self.enabled && !self.awaiting_credentials && self.transaction.is_none() {
            self.next_attempt = Some(now);
        }
    }

    pub(crate) fn unregister(&mut self, ctx: &mut Context) {
        self.enabled = false;
        self.next_attempt = None;
        self.refresh_at = None;
        self.keep_alive_at = None;

        let was_registered = self.state == RegistrationState::Ok && self.transaction.is_none();
        self.transaction = None;
        self.suspended = false;
        if !was_registered {
            self.set_state(ctx, RegistrationState::Cleared, None, "Unregistered");
            return;
        }

        self.unregistering = true;
        if ctx.reachable {
            self.send_register(ctx, 0);
        } else {
            debug!(account_id = %self.id, "un-REGISTER deferred until the network is back");
            self.next_attempt = Some(ctx.now);
        }
    }

    /// Fire-and-forget un-REGISTER before the record is dropped.
    pub(crate) fn release(&mut self, ctx: &mut Context) {
        if self.state == RegistrationState::Ok && ctx.reachable {
            match self.build_register(ctx, 0) {
                Ok(request) => {
                    if let Err(err) = ctx.send(&request, &self.registrar) {
                        warn!(account_id = %self.id, %err, "could not unregister");
                    }
                }
                Err(err) => warn!(account_id = %self.id, %err, "could not unregister"),
            }
            self.set_state(ctx, RegistrationState::Cleared, None, "Unregistered");
        }
        self.transaction = None;
    }

    pub(crate) fn on_network_lost(&mut self) {
        if self.transaction.take().is_some() {
            debug!(account_id = %self.id, "REGISTER suspended");
            self.suspended = true;
        }
    }

    /// One immediate attempt, bypassing backoff.
    pub(crate) fn on_network_restored(&mut self, now: Instant, keep_alive_interval: Duration) {
        self.suspended = false;
        if self.unregistering || (self.enabled && !self.awaiting_credentials) {
            self.next_attempt = Some(now);
        }
        if self.state == RegistrationState::Ok {
            self.keep_alive_at = Some(now + keep_alive_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::Harness;
    use crate::{DigestChallenge, RetryPolicy};

    fn account() -> AccountConfig {
        AccountConfig::new("alice", "example.com").password("secret")
    }

    fn registration(harness: &mut Harness, config: AccountConfig) -> Registration {
        harness.with_context(|ctx| Registration::new(ctx, AccountId::generate(), config)).unwrap()
    }

    fn last_register(harness: &mut Harness) -> SipMessage {
        harness.sent().pop().unwrap()
    }

    fn challenge(request: &SipMessage) -> SipMessage {
        let mut response = request.response(401);
        response.www_authenticate = Some(DigestChallenge::new("example.com", "n1"));
        response
    }

    #[test]
    fn test_challenge_answered_with_digest() {
        let mut harness = Harness::new();
        let mut reg = registration(&mut harness, account());

        harness.with_context(|ctx| reg.tick(ctx));
        let first = last_register(&mut harness);
        assert!(first.authorization.is_none());
        assert_eq!(reg.state(), RegistrationState::Progress);

        harness.with_context(|ctx| reg.handle_response(ctx, &challenge(&first)));
        let second = last_register(&mut harness);
        assert!(second.authorization.is_some());
        assert_eq!(second.cseq.sequence, first.cseq.sequence + 1);

        let mut ok = second.response(200);
        ok.expires = Some(600);
        harness.with_context(|ctx| reg.handle_response(ctx, &ok));
        assert_eq!(reg.state(), RegistrationState::Ok);
        assert_eq!(reg.granted_expires(), Some(600));

        // Refresh at half the granted expiry
        harness.advance(Duration::from_secs(299));
        harness.with_context(|ctx| reg.tick(ctx));
        assert!(harness.sent().iter().all(|m| m.method() != Some(SipMethod::Register)));
        harness.advance(Duration::from_secs(1));
        harness.with_context(|ctx| reg.tick(ctx));
        assert_eq!(last_register(&mut harness).expires, Some(3600));
    }

    #[test]
    fn test_challenge_without_credentials() {
        let mut harness = Harness::new();
        let mut reg = registration(&mut harness, AccountConfig::new("bob", "example.com"));

        harness.with_context(|ctx| reg.tick(ctx));
        let request = last_register(&mut harness);
        harness.with_context(|ctx| reg.handle_response(ctx, &challenge(&request)));

        assert_eq!(reg.state(), RegistrationState::Failed);
        assert_eq!(reg.reason(), Reason::Unauthorized);
        assert!(reg.is_waiting_for_credentials());
        assert!(harness.events.iter().any(|e| matches!(
            e,
            CoreEvent::AuthenticationRequested { realm, .. } if realm == "example.com"
        )));

        harness.advance(Duration::from_secs(600));
        harness.with_context(|ctx| reg.tick(ctx));
        assert!(harness.sent().is_empty());

        let now = harness.now();
        reg.set_credentials(now, &Credentials::new("bob", "pw"));
        harness.with_context(|ctx| reg.tick(ctx));
        assert!(last_register(&mut harness).authorization.is_some());
    }

    #[test]
    fn test_rejected_credentials_do_not_retry() {
        let mut harness = Harness::new();
        let mut reg = registration(&mut harness, account());

        harness.with_context(|ctx| reg.tick(ctx));
        let first = last_register(&mut harness);
        harness.with_context(|ctx| reg.handle_response(ctx, &challenge(&first)));
        let second = last_register(&mut harness);
        harness.with_context(|ctx| reg.handle_response(ctx, &second.response(403)));

        assert_eq!(reg.reason(), Reason::BadCredentials);
        harness.advance(Duration::from_secs(3600));
        harness.with_context(|ctx| reg.tick(ctx));
        assert!(harness.sent().is_empty());
    }

    #[test]
    fn test_server_error_backs_off() {
        let mut harness = Harness::new();
        harness.config.retry = RetryPolicy {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(8),
            multiplier: 2,
        };
        let mut reg = registration(&mut harness, account());

        for expected in [2u64, 4, 8, 8] {
            harness.with_context(|ctx| reg.tick(ctx));
            let request = last_register(&mut harness);
            harness.with_context(|ctx| reg.handle_response(ctx, &request.response(503)));
            assert_eq!(reg.state(), RegistrationState::Failed);
            assert_eq!(reg.reason(), Reason::IoError);

            harness.advance(Duration::from_secs(expected - 1));
            harness.with_context(|ctx| reg.tick(ctx));
            assert!(harness.sent().is_empty(), "retried before {}s", expected);
            harness.advance(Duration::from_secs(1));
        }
    }

    #[test]
    fn test_network_loss_suspends_transaction() {
        let mut harness = Harness::new();
        let mut reg = registration(&mut harness, account());
        harness.with_context(|ctx| reg.tick(ctx));
        let request = last_register(&mut harness);

        harness.reachable = false;
        reg.on_network_lost();
        assert!(reg.is_suspended());
        harness.advance(Duration::from_secs(120));
        harness.with_context(|ctx| reg.tick(ctx));
        assert!(harness.sent().is_empty());
        assert_eq!(reg.state(), RegistrationState::Progress);

        // A late answer to the dropped transaction is ignored
        harness.with_context(|ctx| reg.handle_response(ctx, &request.response(200)));
        assert_eq!(reg.state(), RegistrationState::Progress);

        harness.reachable = true;
        let now = harness.now();
        reg.on_network_restored(now, Duration::from_secs(30));
        harness.with_context(|ctx| reg.tick(ctx));
        assert_eq!(harness.sent().len(), 1);
    }

    #[test]
    fn test_keep_alive_while_registered() {
        let mut harness = Harness::new();
        let mut reg = registration(&mut harness, account());
        harness.with_context(|ctx| reg.tick(ctx));
        let request = last_register(&mut harness);
        harness.with_context(|ctx| reg.handle_response(ctx, &request.response(200)));

        harness.advance(Duration::from_secs(29));
        harness.with_context(|ctx| reg.tick(ctx));
        assert_eq!(harness.keep_alives(), 0);
        harness.advance(Duration::from_secs(1));
        harness.with_context(|ctx| reg.tick(ctx));
        assert_eq!(harness.keep_alives(), 1);

        // Nothing goes out while the network is down
        harness.reachable = false;
        harness.advance(Duration::from_secs(60));
        harness.with_context(|ctx| reg.tick(ctx));
        assert_eq!(harness.keep_alives(), 1);
    }

    #[test]
    fn test_unregister_clears() {
        let mut harness = Harness::new();
        let mut reg = registration(&mut harness, account());
        harness.with_context(|ctx| reg.tick(ctx));
        let request = last_register(&mut harness);
        harness.with_context(|ctx| reg.handle_response(ctx, &request.response(200)));

        harness.with_context(|ctx| reg.unregister(ctx));
        let unregister = last_register(&mut harness);
        assert_eq!(unregister.expires, Some(0));
        harness.with_context(|ctx| reg.handle_response(ctx, &unregister.response(200)));
        assert_eq!(reg.state(), RegistrationState::Cleared);
        assert!(!reg.is_enabled());
    }

    #[test]
    fn test_unregister_resent_after_network_loss() {
        let mut harness = Harness::new();
        let mut reg = registration(&mut harness, account());
        harness.with_context(|ctx| reg.tick(ctx));
        let request = last_register(&mut harness);
        harness.with_context(|ctx| reg.handle_response(ctx, &request.response(200)));

        harness.with_context(|ctx| reg.unregister(ctx));
        assert_eq!(last_register(&mut harness).expires, Some(0));
        reg.on_network_lost();
        harness.reachable = false;
        harness.advance(Duration::from_secs(3600));
        harness.with_context(|ctx| reg.tick(ctx));
        assert!(harness.sent().is_empty());
        assert_eq!(reg.state(), RegistrationState::Progress);

        harness.reachable = true;
        reg.on_network_restored(harness.now(), Duration::from_secs(30));
        harness.with_context(|ctx| reg.tick(ctx));
        let resent = last_register(&mut harness);
        assert_eq!(resent.expires, Some(0));
        harness.with_context(|ctx| reg.handle_response(ctx, &resent.response(200)));
        assert_eq!(reg.state(), RegistrationState::Cleared);
    }

    #[test]
    fn test_unregister_waits_for_network() {
        let mut harness = Harness::new();
        let mut reg = registration(&mut harness, account());
        harness.with_context(|ctx| reg.tick(ctx));
        let request = last_register(&mut harness);
        harness.with_context(|ctx| reg.handle_response(ctx, &request.response(200)));

        harness.reachable = false;
        harness.with_context(|ctx| reg.unregister(ctx));
        assert!(harness.sent().is_empty());
        assert_eq!(reg.state(), RegistrationState::Ok);

        harness.reachable = true;
        reg.on_network_restored(harness.now(), Duration::from_secs(30));
        harness.with_context(|ctx| reg.tick(ctx));
        let removal = last_register(&mut harness);
        assert_eq!(removal.expires, Some(0));
        harness.with_context(|ctx| reg.handle_response(ctx, &removal.response(200)));
        assert_eq!(reg.state(), RegistrationState::Cleared);
        assert!(!reg.is_enabled());
    }
}
