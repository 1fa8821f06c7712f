//! The [`Core`]: owner of every call, registration, subscription and
//! publication, advanced one tick at a time by [`Core::iterate`].
//!
//! A core is single-threaded. It is driven through `&mut Core` on the
//! thread that owns it; other threads talk to it through a [`CoreHandle`],
//! whose commands are executed at the start of the next tick.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::reachability::{ReachabilityChange, ReachabilityMonitor};
use crate::timer::{Clock, SystemClock};
use crate::{
    AccountConfig, AccountId, Call, CallHandle, CallId, CallState, Codec, ConfiguringState,
    CoreConfig, CoreEvent, Credentials, ErrorInfo, EventBus, GlobalState, MediaBackend,
    MediaParams, NullMediaBackend, Publish, PublishId, Reason, Registration, Result,
    SdpNegotiator, SipError, SipMessage, SipMethod, SipUri, StartupError, SubscribePolicy,
    Subscription, SubscriptionId, Transport,
};

/// What a state machine may touch while it runs: the clock reading of the
/// current operation, configuration, the transport, the media backend and
/// the event queue.
pub(crate) struct Context<'a> {
    pub(crate) tick: u64,
    pub(crate) now: Instant,
    pub(crate) reachable: bool,
    pub(crate) config: &'a CoreConfig,
    /// Address of record used as From.
    pub(crate) identity: &'a SipUri,
    /// Where peers reach this core; used as Contact.
    pub(crate) local: &'a SipUri,
    pub(crate) codecs: &'a [Codec],
    pub(crate) transport: &'a mut dyn Transport,
    pub(crate) media: &'a mut dyn MediaBackend,
    pub(crate) events: &'a mut VecDeque<CoreEvent>,
}

impl Context<'_> {
    /// Sends through the transport; nothing leaves while unreachable.
    pub(crate) fn send(&mut self, message: &SipMessage, target: &SipUri) -> Result<()> {
        if !self.reachable {
            return Err(SipError::NetworkUnreachable);
        }
        self.transport.send(message, target)
    }

    pub(crate) fn emit(&mut self, event: CoreEvent) {
        self.events.push_back(event);
    }
}

// Borrows only the fields a Context needs, so the object maps stay free
macro_rules! context {
    ($core:ident) => {
        Context {
            tick: $core.tick,
            now: $core.now,
            reachable: $core.reachability.is_reachable(),
            config: &$core.config,
            identity: &$core.identity,
            local: &$core.local,
            codecs: &$core.codecs,
            transport: &mut *$core.transport,
            media: &mut *$core.media,
            events: &mut $core.pending_events,
        }
    };
}

/// Work posted to a core from another thread through a [`CoreHandle`].
#[derive(Debug)]
pub enum CoreCommand {
    Start,
    Stop,
    SetNetworkReachable(bool),
    Invite { id: CallId, remote: SipUri },
    Accept(CallHandle),
    Decline(CallHandle, Reason),
    Terminate(CallHandle),
    Pause(CallHandle),
    Resume(CallHandle),
    AddAccount { id: AccountId, config: AccountConfig },
    RemoveAccount(AccountId),
    SetCredentials(AccountId, Credentials),
    EnterBackground,
    EnterForeground,
    PushNotification,
    AudioFocusLost,
}

/// Cloneable, thread-safe handle posting commands to a [`Core`].
#[derive(Debug, Clone)]
pub struct CoreHandle {
    commands: mpsc::UnboundedSender<CoreCommand>,
}

impl CoreHandle {
    fn post(&self, command: CoreCommand) -> Result<()> {
        self.commands.send(command).map_err(|_| SipError::CoreGone)
    }

    pub fn start(&self) -> Result<()> {
        self.post(CoreCommand::Start)
    }

    pub fn stop(&self) -> Result<()> {
        self.post(CoreCommand::Stop)
    }

    pub fn set_network_reachable(&self, reachable: bool) -> Result<()> {
        self.post(CoreCommand::SetNetworkReachable(reachable))
    }

    /// The call id is allocated here; the INVITE leaves once the core has
    /// picked up the command.
    pub fn invite(&self, address: &str) -> Result<CallHandle> {
        let remote = SipUri::parse(address)?;
        let id = CallId::generate();
        self.post(CoreCommand::Invite {
            id: id.clone(),
            remote,
        })?;
        Ok(CallHandle(id))
    }

    pub fn accept(&self, call: &CallHandle) -> Result<()> {
        self.post(CoreCommand::Accept(call.clone()))
    }

    pub fn decline(&self, call: &CallHandle, reason: Reason) -> Result<()> {
        self.post(CoreCommand::Decline(call.clone(), reason))
    }

    pub fn terminate(&self, call: &CallHandle) -> Result<()> {
        self.post(CoreCommand::Terminate(call.clone()))
    }

    pub fn pause(&self, call: &CallHandle) -> Result<()> {
        self.post(CoreCommand::Pause(call.clone()))
    }

    pub fn resume(&self, call: &CallHandle) -> Result<()> {
        self.post(CoreCommand::Resume(call.clone()))
    }

    pub fn add_account(&self, config: AccountConfig) -> Result<AccountId> {
        config.identity()?;
        let id = AccountId::generate();
        self.post(CoreCommand::AddAccount {
            id: id.clone(),
            config,
        })?;
        Ok(id)
    }

    pub fn remove_account(&self, account: &AccountId) -> Result<()> {
        self.post(CoreCommand::RemoveAccount(account.clone()))
    }

    pub fn set_credentials(&self, account: &AccountId, credentials: Credentials) -> Result<()> {
        self.post(CoreCommand::SetCredentials(account.clone(), credentials))
    }

    pub fn enter_background(&self) -> Result<()> {
        self.post(CoreCommand::EnterBackground)
    }

    pub fn enter_foreground(&self) -> Result<()> {
        self.post(CoreCommand::EnterForeground)
    }

    pub fn process_push_notification(&self) -> Result<()> {
        self.post(CoreCommand::PushNotification)
    }

    pub fn audio_focus_lost(&self) -> Result<()> {
        self.post(CoreCommand::AudioFocusLost)
    }
}

// Core builder
pub struct CoreBuilder {
    config: CoreConfig,
    transport: Option<Box<dyn Transport>>,
    clock: Option<Box<dyn Clock>>,
    media: Option<Box<dyn MediaBackend>>,
}

impl Default for CoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CoreBuilder {
    pub fn new() -> Self {
        CoreBuilder {
            config: CoreConfig::default(),
            transport: None,
            clock: None,
            media: None,
        }
    }

    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn identity(mut self, identity: &str) -> Self {
        self.config.identity = identity.to_string();
        self
    }

    pub fn user_agent(mut self, user_agent: &str) -> Self {
        self.config.user_agent = user_agent.to_string();
        self
    }

    pub fn max_calls(mut self, max_calls: usize) -> Self {
        self.config.max_calls = max_calls;
        self
    }

    pub fn subscribe_policy(mut self, policy: SubscribePolicy) -> Self {
        self.config.subscribe_policy = policy;
        self
    }

    pub fn account(mut self, account: AccountConfig) -> Self {
        self.config.accounts.push(account);
        self
    }

    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Box::new(clock));
        self
    }

    pub fn media_backend(mut self, media: impl MediaBackend + 'static) -> Self {
        self.media = Some(Box::new(media));
        self
    }

    pub fn build(self) -> Result<Core> {
        self.config.validate()?;
        let transport = self
            .transport
            .ok_or_else(|| SipError::Config("a transport is required".to_string()))?;
        let identity = self.config.identity_uri()?;
        let codecs = self.config.media.codecs()?;
        let clock = self.clock.unwrap_or_else(|| Box::new(SystemClock));
        let media = self.media.unwrap_or_else(|| Box::new(NullMediaBackend));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let account_configs = self
            .config
            .accounts
            .iter()
            .map(|account| (AccountId::generate(), account.clone()))
            .collect();

        Ok(Core {
            state: GlobalState::Off,
            identity,
            local: transport.local_uri().clone(),
            codecs,
            now: clock.now(),
            tick: 0,
            reachability: ReachabilityMonitor::default(),
            calls: HashMap::new(),
            account_configs,
            registrations: HashMap::new(),
            subscriptions: HashMap::new(),
            publishes: HashMap::new(),
            pending_events: VecDeque::new(),
            events: Arc::new(EventBus::new()),
            commands_tx,
            commands_rx,
            background: false,
            fast_until: None,
            config: self.config,
            transport,
            media,
            clock,
        })
    }
}

// Main core structure
pub struct Core {
    config: CoreConfig,
    state: GlobalState,
    identity: SipUri,
    local: SipUri,
    codecs: Vec<Codec>,
    transport: Box<dyn Transport>,
    media: Box<dyn MediaBackend>,
    clock: Box<dyn Clock>,
    now: Instant,
    tick: u64,
    reachability: ReachabilityMonitor,
    calls: HashMap<CallId, Call>,
    /// Survive stop/start; registrations are rebuilt from them.
    account_configs: Vec<(AccountId, AccountConfig)>,
    registrations: HashMap<AccountId, Registration>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    publishes: HashMap<PublishId, Publish>,
    pending_events: VecDeque<CoreEvent>,
    events: Arc<EventBus>,
    commands_tx: mpsc::UnboundedSender<CoreCommand>,
    commands_rx: mpsc::UnboundedReceiver<CoreCommand>,
    background: bool,
    fast_until: Option<Instant>,
}

impl Core {
    pub fn builder() -> CoreBuilder {
        CoreBuilder::new()
    }

    pub fn new(config: CoreConfig, transport: impl Transport + 'static) -> Result<Core> {
        CoreBuilder::new().config(config).transport(transport).build()
    }

    pub fn global_state(&self) -> GlobalState {
        self.state
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn identity(&self) -> &SipUri {
        &self.identity
    }

    /// Number of `iterate()` passes so far.
    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    pub fn handle(&self) -> CoreHandle {
        CoreHandle {
            commands: self.commands_tx.clone(),
        }
    }

    pub fn is_network_reachable(&self) -> bool {
        self.reachability.is_reachable()
    }

    pub fn call(&self, call: &CallHandle) -> Option<&Call> {
        self.calls.get(call.id())
    }

    pub fn calls(&self) -> impl Iterator<Item = &Call> {
        self.calls.values()
    }

    pub fn accounts(&self) -> impl Iterator<Item = (&AccountId, &AccountConfig)> {
        self.account_configs.iter().map(|(id, config)| (id, config))
    }

    pub fn registration(&self, account: &AccountId) -> Option<&Registration> {
        self.registrations.get(account)
    }

    pub fn subscription(&self, subscription: &SubscriptionId) -> Option<&Subscription> {
        self.subscriptions.get(subscription)
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.values()
    }

    pub fn publication(&self, publish: &PublishId) -> Option<&Publish> {
        self.publishes.get(publish)
    }

    fn set_global_state(&mut self, state: GlobalState, message: &str) {
        info!(from = ?self.state, to = ?state, "{}", message);
        self.state = state;
        self.pending_events.push_back(CoreEvent::GlobalStateChanged {
            state,
            message: message.to_string(),
        });
    }

    fn ensure_running(&self, operation: &str) -> Result<()> {
        if self.state.is_running() {
            Ok(())
        } else {
            Err(SipError::InvalidState(format!(
                "cannot {} while the core is {:?}",
                operation, self.state
            )))
        }
    }

    fn live_calls(&self) -> usize {
        self.calls.values().filter(|call| call.is_live()).count()
    }

    // Lifecycle

    pub fn start(&mut self) -> std::result::Result<(), StartupError> {
        if self.state != GlobalState::Off {
            return Err(StartupError::AlreadyStarted(self.state));
        }
        if self.codecs.is_empty() {
            return Err(StartupError::InvalidConfig("no codecs configured".to_string()));
        }

        self.now = self.clock.now();
        self.set_global_state(GlobalState::Startup, "Starting up");
        self.open_fast_window();
        Ok(())
    }

    // Startup -> Configuring -> On, within a single tick
    fn configure(&mut self) {
        self.set_global_state(GlobalState::Configuring, "Configuring");

        let mut ctx = context!(self);
        for (id, config) in &self.account_configs {
            if self.registrations.contains_key(id) {
                continue;
            }
            match Registration::new(&ctx, id.clone(), config.clone()) {
                Ok(registration) => {
                    self.registrations.insert(id.clone(), registration);
                }
                Err(err) => warn!(account_id = %id, %err, "account skipped"),
            }
        }
        ctx.emit(CoreEvent::ConfiguringStatus {
            status: ConfiguringState::Skipped,
            message: Some("no remote provisioning".to_string()),
        });

        self.set_global_state(GlobalState::On, "Core ready");
    }

    /// Ends every call and record, then returns to `Off`. Queued events are
    /// delivered before this returns.
    pub fn stop(&mut self) {
        if self.state == GlobalState::Off {
            return;
        }

        self.now = self.clock.now();
        self.set_global_state(GlobalState::Shutdown, "Shutting down");
        {
            let mut ctx = context!(self);
            for call in self.calls.values_mut().filter(|call| call.is_live()) {
                if let Err(err) = call.terminate(&mut ctx) {
                    warn!(call_id = %call.id(), %err, "could not terminate call");
                }
            }
            for (_, mut registration) in self.registrations.drain() {
                registration.release(&mut ctx);
            }
            for (_, mut subscription) in self.subscriptions.drain() {
                subscription.terminate(&mut ctx);
            }
            for (_, mut publish) in self.publishes.drain() {
                publish.release(&mut ctx);
            }
        }

        // Ended calls are released one tick later
        self.tick += 1;
        {
            let mut ctx = context!(self);
            for call in self.calls.values_mut() {
                call.tick(&mut ctx);
            }
        }
        self.calls.clear();

        self.set_global_state(GlobalState::Off, "Off");
        self.flush_events();
    }

    /// One pass: commands, inbound messages, timers, then event delivery.
    /// Never blocks.
    pub fn iterate(&mut self) {
        self.tick += 1;
        self.now = self.clock.now();
        self.drain_commands();

        match self.state {
            GlobalState::Off => {
                self.flush_events();
                return;
            }
            GlobalState::Startup => self.configure(),
            _ => {}
        }

        while let Some(message) = self.transport.recv() {
            self.dispatch(message);
        }

        {
            let mut ctx = context!(self);
            for call in self.calls.values_mut() {
                call.tick(&mut ctx);
            }
            for registration in self.registrations.values_mut() {
                registration.tick(&mut ctx);
            }
            for subscription in self.subscriptions.values_mut() {
                subscription.tick(&mut ctx);
            }
            for publish in self.publishes.values_mut() {
                publish.tick(&mut ctx);
            }
        }

        self.flush_events();
        self.calls.retain(|_, call| !call.is_released());
        self.subscriptions.retain(|_, subscription| !subscription.is_finished());
        self.publishes.retain(|_, publish| !publish.is_finished());
    }

    fn flush_events(&mut self) {
        while let Some(event) = self.pending_events.pop_front() {
            self.events.emit(&event);
        }
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands_rx.try_recv() {
            debug!(?command, "command received");
            self.execute(command);
        }
    }

    fn execute(&mut self, command: CoreCommand) {
        let result = match command {
            CoreCommand::Start => self
                .start()
                .map_err(|err| SipError::InvalidState(err.to_string())),
            CoreCommand::Stop => {
                self.stop();
                Ok(())
            }
            CoreCommand::SetNetworkReachable(reachable) => {
                self.set_network_reachable(reachable);
                Ok(())
            }
            CoreCommand::Invite { id, remote } => {
                match self.invite_with_id(id.clone(), remote.clone()) {
                    Ok(_) => Ok(()),
                    Err(err) => {
                        self.abort_invite(id, remote, &err);
                        Err(err)
                    }
                }
            }
            CoreCommand::Accept(call) => self.accept(&call),
            CoreCommand::Decline(call, reason) => self.decline(&call, reason),
            CoreCommand::Terminate(call) => self.terminate(&call),
            CoreCommand::Pause(call) => self.pause(&call),
            CoreCommand::Resume(call) => self.resume(&call),
            CoreCommand::AddAccount { id, config } => self.add_account_with_id(id, config),
            CoreCommand::RemoveAccount(account) => self.remove_account(&account),
            CoreCommand::SetCredentials(account, credentials) => {
                self.set_credentials(&account, credentials)
            }
            CoreCommand::EnterBackground => {
                self.enter_background();
                Ok(())
            }
            CoreCommand::EnterForeground => {
                self.enter_foreground();
                Ok(())
            }
            CoreCommand::PushNotification => {
                self.process_push_notification();
                Ok(())
            }
            CoreCommand::AudioFocusLost => {
                self.audio_focus_lost();
                Ok(())
            }
        };

        if let Err(err) = result {
            warn!(%err, "command failed");
        }
    }

    // Inbound routing

    fn dispatch(&mut self, message: SipMessage) {
        debug!(%message, "received");
        let mut ctx = context!(self);

        if message.is_response() {
            match message.cseq.method {
                SipMethod::Invite | SipMethod::Bye | SipMethod::Cancel | SipMethod::Ack => {
                    if let Some(call) = self.calls.get_mut(&CallId(message.call_id.clone())) {
                        call.handle_response(&mut ctx, &message);
                    }
                }
                SipMethod::Register => {
                    if let Some(registration) =
                        self.registrations.values_mut().find(|r| r.matches(&message))
                    {
                        registration.handle_response(&mut ctx, &message);
                    }
                }
                SipMethod::Subscribe | SipMethod::Notify => {
                    if let Some(subscription) =
                        self.subscriptions.values_mut().find(|s| s.matches(&message))
                    {
                        subscription.handle_response(&mut ctx, &message);
                    }
                }
                SipMethod::Publish => {
                    if let Some(publish) = self.publishes.values_mut().find(|p| p.matches(&message))
                    {
                        publish.handle_response(&mut ctx, &message);
                    }
                }
            }
            return;
        }

        let Some(method) = message.method() else {
            return;
        };
        let call_id = CallId(message.call_id.clone());
        match method {
            SipMethod::Invite => {
                if let Some(call) = self.calls.get_mut(&call_id) {
                    call.handle_request(&mut ctx, &message);
                    return;
                }

                let live = self.calls.values().filter(|call| call.is_live()).count();
                let answer = message
                    .media()
                    .and_then(|offer| SdpNegotiator::create_answer(offer, &self.codecs));
                match answer {
                    _ if !self.state.is_running() => reply(&mut ctx, &message, 503),
                    _ if live >= self.config.max_calls => reply(&mut ctx, &message, 486),
                    None => reply(&mut ctx, &message, 488),
                    Some(answer) => {
                        let call = Call::incoming(&mut ctx, &message, answer);
                        self.calls.insert(call_id, call);
                    }
                }
            }
            SipMethod::Ack | SipMethod::Bye | SipMethod::Cancel => {
                match self.calls.get_mut(&call_id) {
                    Some(call) => call.handle_request(&mut ctx, &message),
                    None if method != SipMethod::Ack => reply(&mut ctx, &message, 481),
                    None => {}
                }
            }
            SipMethod::Subscribe => {
                if let Some(subscription) =
                    self.subscriptions.values_mut().find(|s| s.matches(&message))
                {
                    subscription.handle_request(&mut ctx, &message);
                } else if self.state.is_running() {
                    let subscription =
                        Subscription::incoming(&mut ctx, &message, self.config.subscribe_policy);
                    self.subscriptions
                        .insert(subscription.id().clone(), subscription);
                } else {
                    reply(&mut ctx, &message, 503);
                }
            }
            SipMethod::Notify => {
                match self.subscriptions.values_mut().find(|s| s.matches(&message)) {
                    Some(subscription) => subscription.handle_request(&mut ctx, &message),
                    None => reply(&mut ctx, &message, 481),
                }
            }
            // Not a registrar or presence server
            SipMethod::Register | SipMethod::Publish => reply(&mut ctx, &message, 501),
        }
    }

    // Reachability and platform signals

    pub fn set_network_reachable(&mut self, reachable: bool) {
        let Some(change) = self.reachability.update(reachable) else {
            return;
        };
        self.now = self.clock.now();

        match change {
            ReachabilityChange::Lost => {
                for registration in self.registrations.values_mut() {
                    registration.on_network_lost();
                }
                for subscription in self.subscriptions.values_mut() {
                    subscription.on_network_lost();
                }
                for publish in self.publishes.values_mut() {
                    publish.on_network_lost();
                }
            }
            ReachabilityChange::Restored => {
                let keep_alive = self.config.timers.keep_alive_interval;
                for registration in self.registrations.values_mut() {
                    registration.on_network_restored(self.now, keep_alive);
                }
                for subscription in self.subscriptions.values_mut() {
                    subscription.on_network_restored(self.now);
                }
                for publish in self.publishes.values_mut() {
                    publish.on_network_restored(self.now);
                }
                self.open_fast_window();
            }
        }
        self.pending_events
            .push_back(CoreEvent::NetworkReachable(reachable));
    }

    fn open_fast_window(&mut self) {
        self.fast_until = Some(self.clock.now() + self.config.iterate.fast_window);
    }

    pub fn enter_background(&mut self) {
        debug!("entering background");
        self.background = true;
    }

    pub fn enter_foreground(&mut self) {
        debug!("entering foreground");
        self.background = false;
    }

    pub fn is_background(&self) -> bool {
        self.background
    }

    /// How long the embedding layer should wait before the next `iterate()`.
    pub fn next_iterate_interval(&self) -> Duration {
        let schedule = &self.config.iterate;
        let fast = self.state == GlobalState::Startup
            || self.fast_until.is_some_and(|until| self.clock.now() < until);

        if fast {
            schedule.fast_interval
        } else if self.background {
            schedule.background_interval
        } else {
            schedule.foreground_interval
        }
    }

    /// A push woke the application: iterate fast and refresh registrations.
    pub fn process_push_notification(&mut self) {
        info!("push notification received");
        self.open_fast_window();
        self.refresh_registers();
    }

    pub fn audio_focus_lost(&mut self) {
        self.now = self.clock.now();
        let mut ctx = context!(self);
        for call in self
            .calls
            .values_mut()
            .filter(|call| call.state() == CallState::StreamsRunning)
        {
            if let Err(err) = call.pause(&mut ctx) {
                warn!(call_id = %call.id(), %err, "could not pause on audio focus loss");
            }
        }
    }

    // Calls

    /// Starts an outgoing call; the INVITE is sent on the next tick.
    pub fn invite(&mut self, address: &str) -> Result<CallHandle> {
        let remote = SipUri::parse(address)?;
        self.invite_with_id(CallId::generate(), remote)
    }

    fn invite_with_id(&mut self, id: CallId, remote: SipUri) -> Result<CallHandle> {
        self.ensure_running("invite")?;
        if self.live_calls() >= self.config.max_calls {
            return Err(SipError::InvalidState(format!(
                "maximum of {} calls reached",
                self.config.max_calls
            )));
        }

        self.now = self.clock.now();
        let offer = MediaParams::new(self.codecs.clone());
        let mut ctx = context!(self);
        let call = Call::outgoing(&mut ctx, id.clone(), self.identity.clone(), remote, offer);
        self.calls.insert(id.clone(), call);
        Ok(CallHandle(id))
    }

    // A refused handle invite still shows up as a failed call
    fn abort_invite(&mut self, id: CallId, remote: SipUri, err: &SipError) {
        let running = self.state.is_running();
        let reason = if running { Reason::Busy } else { Reason::IoError };

        self.now = self.clock.now();
        let offer = MediaParams::new(self.codecs.clone());
        let mut ctx = context!(self);
        let mut call = Call::outgoing(&mut ctx, id.clone(), self.identity.clone(), remote, offer);
        // No tick will come to release it while the core is down
        call.abort(&mut ctx, ErrorInfo::local(reason, &err.to_string()), !running);
        if running {
            self.calls.insert(id, call);
        }
    }

    fn with_call<R>(
        &mut self,
        handle: &CallHandle,
        f: impl FnOnce(&mut Call, &mut Context<'_>) -> Result<R>,
    ) -> Result<R> {
        self.now = self.clock.now();
        let call = self
            .calls
            .get_mut(handle.id())
            .ok_or_else(|| SipError::CallNotFound(handle.id().to_string()))?;
        let mut ctx = context!(self);
        f(call, &mut ctx)
    }

    pub fn accept(&mut self, call: &CallHandle) -> Result<()> {
        self.with_call(call, |call, ctx| call.accept(ctx))
    }

    pub fn accept_early_media(&mut self, call: &CallHandle) -> Result<()> {
        self.with_call(call, |call, ctx| call.accept_early_media(ctx))
    }

    pub fn decline(&mut self, call: &CallHandle, reason: Reason) -> Result<()> {
        self.with_call(call, |call, ctx| call.decline(ctx, reason))
    }

    pub fn terminate(&mut self, call: &CallHandle) -> Result<()> {
        self.with_call(call, |call, ctx| call.terminate(ctx))
    }

    pub fn pause(&mut self, call: &CallHandle) -> Result<()> {
        self.with_call(call, |call, ctx| call.pause(ctx))
    }

    pub fn resume(&mut self, call: &CallHandle) -> Result<()> {
        self.with_call(call, |call, ctx| call.resume(ctx))
    }

    // Accounts

    /// Registers the account now when running, otherwise once the core is
    /// configured.
    pub fn add_account(&mut self, config: AccountConfig) -> Result<AccountId> {
        let id = AccountId::generate();
        self.add_account_with_id(id.clone(), config)?;
        Ok(id)
    }

    fn add_account_with_id(&mut self, id: AccountId, config: AccountConfig) -> Result<()> {
        config.identity()?;
        config.registrar_uri()?;
        if self.account_configs.len() >= self.config.max_accounts {
            return Err(SipError::Config(format!(
                "maximum of {} accounts reached",
                self.config.max_accounts
            )));
        }

        if self.state.is_running() {
            self.now = self.clock.now();
            let ctx = context!(self);
            let registration = Registration::new(&ctx, id.clone(), config.clone())?;
            self.registrations.insert(id.clone(), registration);
        }
        info!(account_id = %id, identity = ?config.identity().ok(), "account added");
        self.account_configs.push((id, config));
        Ok(())
    }

    /// Drops the account; a registered account is unregistered on the way out.
    pub fn remove_account(&mut self, account: &AccountId) -> Result<()> {
        let index = self
            .account_configs
            .iter()
            .position(|(id, _)| id == account)
            .ok_or_else(|| SipError::AccountNotFound(account.to_string()))?;
        self.account_configs.remove(index);

        if let Some(mut registration) = self.registrations.remove(account) {
            self.now = self.clock.now();
            let mut ctx = context!(self);
            registration.release(&mut ctx);
        }
        info!(account_id = %account, "account removed");
        Ok(())
    }

    /// Answer to [`CoreEvent::AuthenticationRequested`]; retries at once.
    pub fn set_credentials(&mut self, account: &AccountId, credentials: Credentials) -> Result<()> {
        let (_, config) = self
            .account_configs
            .iter_mut()
            .find(|(id, _)| id == account)
            .ok_or_else(|| SipError::AccountNotFound(account.to_string()))?;
        config.password = Some(credentials.password.clone());

        if let Some(registration) = self.registrations.get_mut(account) {
            registration.set_credentials(self.clock.now(), &credentials);
        }
        Ok(())
    }

    fn account_config_mut(&mut self, account: &AccountId) -> Result<&mut AccountConfig> {
        self.account_configs
            .iter_mut()
            .find(|(id, _)| id == account)
            .map(|(_, config)| config)
            .ok_or_else(|| SipError::AccountNotFound(account.to_string()))
    }

    pub fn register(&mut self, account: &AccountId) -> Result<()> {
        self.account_config_mut(account)?.register_on_add = true;
        let now = self.clock.now();
        if let Some(registration) = self.registrations.get_mut(account) {
            registration.register(now);
        }
        Ok(())
    }

    pub fn unregister(&mut self, account: &AccountId) -> Result<()> {
        self.account_config_mut(account)?.register_on_add = false;
        self.now = self.clock.now();
        if let Some(registration) = self.registrations.get_mut(account) {
            let mut ctx = context!(self);
            registration.unregister(&mut ctx);
        }
        Ok(())
    }

    pub fn refresh_registers(&mut self) {
        let now = self.clock.now();
        for registration in self.registrations.values_mut() {
            registration.refresh(now);
        }
    }

    // Subscriptions and publications

    pub fn subscribe(&mut self, resource: &str, event: &str, expires: u32) -> Result<SubscriptionId> {
        self.ensure_running("subscribe")?;
        let resource = SipUri::parse(resource)?;
        let id = SubscriptionId::generate();

        self.now = self.clock.now();
        let ctx = context!(self);
        let subscription = Subscription::outgoing(&ctx, id.clone(), resource, event, expires);
        self.subscriptions.insert(id.clone(), subscription);
        Ok(id)
    }

    fn with_subscription<R>(
        &mut self,
        subscription: &SubscriptionId,
        f: impl FnOnce(&mut Subscription, &mut Context<'_>) -> Result<R>,
    ) -> Result<R> {
        self.now = self.clock.now();
        let record = self
            .subscriptions
            .get_mut(subscription)
            .ok_or_else(|| SipError::SubscriptionNotFound(subscription.to_string()))?;
        let mut ctx = context!(self);
        f(record, &mut ctx)
    }

    pub fn terminate_subscription(&mut self, subscription: &SubscriptionId) -> Result<()> {
        self.with_subscription(subscription, |record, ctx| {
            record.terminate(ctx);
            Ok(())
        })
    }

    pub fn accept_subscription(&mut self, subscription: &SubscriptionId) -> Result<()> {
        self.with_subscription(subscription, |record, ctx| record.accept(ctx))
    }

    pub fn decline_subscription(&mut self, subscription: &SubscriptionId) -> Result<()> {
        self.with_subscription(subscription, |record, ctx| record.decline(ctx))
    }

    /// Sends `body` to the subscriber of an active incoming subscription.
    pub fn notify(&mut self, subscription: &SubscriptionId, body: &str) -> Result<()> {
        self.with_subscription(subscription, |record, ctx| record.notify(ctx, body))
    }

    pub fn publish(
        &mut self,
        resource: &str,
        event: &str,
        body: &str,
        expires: u32,
    ) -> Result<PublishId> {
        self.ensure_running("publish")?;
        let resource = SipUri::parse(resource)?;
        let id = PublishId::generate();

        self.now = self.clock.now();
        let ctx = context!(self);
        let publish = Publish::new(&ctx, id.clone(), resource, event, body, expires);
        self.publishes.insert(id.clone(), publish);
        Ok(id)
    }

    fn with_publish<R>(
        &mut self,
        publish: &PublishId,
        f: impl FnOnce(&mut Publish, &mut Context<'_>) -> Result<R>,
    ) -> Result<R> {
        self.now = self.clock.now();
        let record = self
            .publishes
            .get_mut(publish)
            .ok_or_else(|| SipError::PublishNotFound(publish.to_string()))?;
        let mut ctx = context!(self);
        f(record, &mut ctx)
    }

    pub fn update_publish(&mut self, publish: &PublishId, body: &str) -> Result<()> {
        self.with_publish(publish, |record, ctx| record.update(ctx, body))
    }

    pub fn unpublish(&mut self, publish: &PublishId) -> Result<()> {
        self.with_publish(publish, |record, ctx| {
            record.unpublish(ctx);
            Ok(())
        })
    }
}

// Answers a request no state machine owns
fn reply(ctx: &mut Context, request: &SipMessage, status: u16) {
    debug!(status, %request, "answering unowned request");
    if let Err(err) = ctx.send(&request.response(status), &request.reply_target()) {
        warn!(%err, status, "could not send response");
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::ManualClock;
    use crate::{LoopbackNetwork, LoopbackTransport};

    struct Node {
        core: Core,
        events: mpsc::UnboundedReceiver<CoreEvent>,
    }

    impl Node {
        fn drain(&mut self) -> Vec<CoreEvent> {
            std::iter::from_fn(|| self.events.try_recv().ok()).collect()
        }
    }

    fn node(network: &LoopbackNetwork, clock: &ManualClock, user: &str) -> Node {
        let identity = SipUri::with_user(user, "example.com");
        let core = Core::builder()
            .identity(&identity.to_string())
            .transport(network.attach(identity))
            .clock(clock.clone())
            .build()
            .unwrap();
        let events = core.events().subscribe();
        Node { core, events }
    }

    fn global_states(events: &[CoreEvent]) -> Vec<GlobalState> {
        events.iter().filter_map(CoreEvent::global_state).collect()
    }

    #[test]
    fn test_builder_requires_transport() {
        assert!(matches!(
            Core::builder().build(),
            Err(SipError::Config(_))
        ));
    }

    #[test]
    fn test_start_iterate_stop() {
        let network = LoopbackNetwork::new();
        let clock = ManualClock::new();
        let mut alice = node(&network, &clock, "alice");

        // Stopping an Off core does nothing
        alice.core.stop();
        alice.core.iterate();
        assert!(alice.drain().is_empty());

        alice.core.start().unwrap();
        assert_eq!(
            alice.core.start(),
            Err(StartupError::AlreadyStarted(GlobalState::Startup))
        );
        assert_eq!(alice.core.next_iterate_interval(), Duration::from_millis(20));
        alice.core.iterate();

        let events = alice.drain();
        assert_eq!(
            global_states(&events),
            vec![GlobalState::Startup, GlobalState::Configuring, GlobalState::On]
        );
        assert!(events.iter().any(|e| matches!(
            e,
            CoreEvent::ConfiguringStatus {
                status: ConfiguringState::Skipped,
                ..
            }
        )));

        alice.core.iterate();
        assert!(global_states(&alice.drain()).is_empty());

        alice.core.stop();
        assert_eq!(
            global_states(&alice.drain()),
            vec![GlobalState::Shutdown, GlobalState::Off]
        );
        assert_eq!(alice.core.global_state(), GlobalState::Off);
    }

    #[test]
    fn test_add_then_remove_sends_nothing() {
        let network = LoopbackNetwork::new();
        let clock = ManualClock::new();
        let mut alice = node(&network, &clock, "alice");
        let _registrar = network.attach(SipUri::new("example.com"));
        alice.core.start().unwrap();
        alice.core.iterate();

        let account = alice
            .core
            .add_account(AccountConfig::new("alice", "example.com"))
            .unwrap();
        alice.core.remove_account(&account).unwrap();
        alice.core.iterate();

        let identity = SipUri::with_user("alice", "example.com");
        assert_eq!(network.requests_sent(&identity, SipMethod::Register), 0);
        assert!(alice.core.registration(&account).is_none());
        assert!(matches!(
            alice.core.remove_account(&account),
            Err(SipError::AccountNotFound(_))
        ));
    }

    #[test]
    fn test_accounts_survive_restart() {
        let network = LoopbackNetwork::new();
        let clock = ManualClock::new();
        let mut alice = node(&network, &clock, "alice");

        let account = alice
            .core
            .add_account(AccountConfig::new("alice", "example.com"))
            .unwrap();
        assert!(alice.core.registration(&account).is_none());

        alice.core.start().unwrap();
        alice.core.iterate();
        assert!(alice.core.registration(&account).is_some());

        alice.core.stop();
        assert!(alice.core.registration(&account).is_none());
        alice.core.start().unwrap();
        alice.core.iterate();
        assert!(alice.core.registration(&account).is_some());
        assert_eq!(alice.core.accounts().count(), 1);
    }

    #[test]
    fn test_incoming_invite_refused_when_full() {
        let network = LoopbackNetwork::new();
        let clock = ManualClock::new();
        let identity = SipUri::with_user("bob", "example.com");
        let mut bob = Core::builder()
            .identity(&identity.to_string())
            .max_calls(1)
            .transport(network.attach(identity.clone()))
            .clock(clock.clone())
            .build()
            .unwrap();
        let mut alice = node(&network, &clock, "alice");
        let mut carol = node(&network, &clock, "carol");
        for core in [&mut bob, &mut alice.core, &mut carol.core] {
            core.start().unwrap();
            core.iterate();
        }

        alice.core.invite("sip:bob@example.com").unwrap();
        let from_carol = carol.core.invite("sip:bob@example.com").unwrap();
        alice.core.iterate();
        bob.iterate();
        carol.core.iterate();
        bob.iterate();
        carol.core.iterate();

        assert_eq!(bob.calls().count(), 1);
        let carol_call = carol.core.call(&from_carol).unwrap();
        assert_eq!(carol_call.state(), CallState::Error);
        assert_eq!(carol_call.reason(), Reason::Busy);
    }

    #[test]
    fn test_unknown_dialog_bye_gets_481() {
        let network = LoopbackNetwork::new();
        let clock = ManualClock::new();
        let mut alice = node(&network, &clock, "alice");
        alice.core.start().unwrap();
        alice.core.iterate();

        let peer_uri = SipUri::with_user("mallory", "example.com");
        let mut peer: LoopbackTransport = network.attach(peer_uri.clone());
        let bye = crate::SipMessageBuilder::request(SipMethod::Bye, alice.core.identity().clone())
            .call_id("nope")
            .from(peer_uri, Some("m"))
            .build()
            .unwrap();
        peer.send(&bye, alice.core.identity()).unwrap();

        alice.core.iterate();
        assert_eq!(peer.recv().and_then(|m| m.status_code()), Some(481));
    }

    #[test]
    fn test_handle_invite_before_start_surfaces_error() {
        let network = LoopbackNetwork::new();
        let clock = ManualClock::new();
        let mut alice = node(&network, &clock, "alice");
        let handle = alice.core.handle();

        let call = handle.invite("sip:bob@example.com").unwrap();
        alice.core.iterate();

        let events = alice.drain();
        let states: Vec<_> = events
            .iter()
            .filter_map(|e| e.call_state())
            .filter(|(id, _)| *id == call.id())
            .map(|(_, state)| state)
            .collect();
        assert_eq!(
            states,
            vec![CallState::OutgoingInit, CallState::Error, CallState::Released]
        );
        let failed = events.iter().find_map(|event| match event {
            CoreEvent::CallStateChanged {
                state: CallState::Error,
                reason,
                ..
            } => Some(*reason),
            _ => None,
        });
        assert_eq!(failed, Some(Reason::IoError));
        assert!(alice.core.call(&call).is_none());
        assert_eq!(alice.core.calls().count(), 0);
    }

    #[test]
    fn test_handle_commands_run_on_next_tick() {
        let network = LoopbackNetwork::new();
        let clock = ManualClock::new();
        let mut alice = node(&network, &clock, "alice");
        let handle = alice.core.handle();

        let worker = std::thread::spawn(move || {
            handle.start().unwrap();
            handle.enter_background().unwrap();
            handle.set_network_reachable(false).unwrap();
        });
        worker.join().unwrap();
        assert_eq!(alice.core.global_state(), GlobalState::Off);

        alice.core.iterate();
        assert_eq!(alice.core.global_state(), GlobalState::On);
        assert!(alice.core.is_background());
        assert!(!alice.core.is_network_reachable());
        assert!(alice
            .drain()
            .contains(&CoreEvent::NetworkReachable(false)));
    }

    #[test]
    fn test_iterate_schedule() {
        let network = LoopbackNetwork::new();
        let clock = ManualClock::new();
        let mut alice = node(&network, &clock, "alice");
        let schedule = alice.core.config().iterate.clone();

        alice.core.start().unwrap();
        alice.core.iterate();
        assert_eq!(alice.core.next_iterate_interval(), schedule.fast_interval);

        clock.advance(schedule.fast_window);
        assert_eq!(alice.core.next_iterate_interval(), schedule.foreground_interval);
        alice.core.enter_background();
        assert_eq!(alice.core.next_iterate_interval(), schedule.background_interval);

        alice.core.process_push_notification();
        assert_eq!(alice.core.next_iterate_interval(), schedule.fast_interval);
    }

    #[test]
    fn test_reachability_edges_only() {
        let network = LoopbackNetwork::new();
        let clock = ManualClock::new();
        let mut alice = node(&network, &clock, "alice");

        alice.core.set_network_reachable(true);
        alice.core.set_network_reachable(false);
        alice.core.set_network_reachable(false);
        alice.core.set_network_reachable(true);
        alice.core.iterate();

        assert_eq!(
            alice.drain(),
            vec![
                CoreEvent::NetworkReachable(false),
                CoreEvent::NetworkReachable(true)
            ]
        );
    }
}
