// Shared fixtures for the integration scenarios: user agents on a loopback
// network, all driven by one manual clock.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use rs_sipcore::{
    AccountId, CallId, CallState, Core, CoreBuilder, CoreEvent, LoopbackNetwork,
    LoopbackRegistrar, ManualClock, MediaBackend, MediaDirection, MediaParams, PublishId,
    PublishState, RegistrationState, Result, SipError, SipUri, SubscriptionId,
    SubscriptionState,
};
use tokio::sync::mpsc;

pub const DOMAIN: &str = "example.com";

pub struct Agent {
    pub core: Core,
    pub uri: SipUri,
    pub log: Vec<CoreEvent>,
    events: mpsc::UnboundedReceiver<CoreEvent>,
}

impl Agent {
    /// A started agent reachable at `sip:<user>@example.com`.
    pub fn new(network: &LoopbackNetwork, clock: &ManualClock, user: &str) -> Self {
        Self::custom(network, clock, user, DOMAIN, |builder| builder)
    }

    /// Reachable at `sip:<user>@<host>` with `sip:<user>@example.com` as
    /// identity, so requests for the identity go through the registrar.
    pub fn custom(
        network: &LoopbackNetwork,
        clock: &ManualClock,
        user: &str,
        host: &str,
        configure: impl FnOnce(CoreBuilder) -> CoreBuilder,
    ) -> Self {
        let uri = SipUri::with_user(user, host);
        let identity = SipUri::with_user(user, DOMAIN);
        let builder = Core::builder()
            .identity(&identity.to_string())
            .transport(network.attach(uri.clone()))
            .clock(clock.clone());
        let mut core = configure(builder).build().unwrap();
        let events = core.events().subscribe();
        core.start().unwrap();
        core.iterate();

        let mut agent = Agent {
            core,
            uri,
            log: Vec::new(),
            events,
        };
        agent.collect();
        agent
    }

    pub fn collect(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.log.push(event);
        }
    }

    pub fn iterate(&mut self) {
        self.core.iterate();
        self.collect();
    }

    pub fn call_states(&self, call: &CallId) -> Vec<CallState> {
        self.log
            .iter()
            .filter_map(CoreEvent::call_state)
            .filter(|(id, _)| *id == call)
            .map(|(_, state)| state)
            .collect()
    }

    pub fn call_state(&self, call: &CallId) -> Option<CallState> {
        self.call_states(call).last().copied()
    }

    pub fn registration_states(&self, account: &AccountId) -> Vec<RegistrationState> {
        self.log
            .iter()
            .filter_map(CoreEvent::registration_state)
            .filter(|(id, _)| *id == account)
            .map(|(_, state)| state)
            .collect()
    }

    pub fn subscription_states(&self, subscription: &SubscriptionId) -> Vec<SubscriptionState> {
        self.log
            .iter()
            .filter_map(CoreEvent::subscription_state)
            .filter(|(id, _)| *id == subscription)
            .map(|(_, state)| state)
            .collect()
    }

    pub fn publish_states(&self, publish: &PublishId) -> Vec<PublishState> {
        self.log
            .iter()
            .filter_map(CoreEvent::publish_state)
            .filter(|(id, _)| *id == publish)
            .map(|(_, state)| state)
            .collect()
    }

    pub fn notify_bodies(&self) -> Vec<Option<String>> {
        self.log
            .iter()
            .filter_map(|event| match event {
                CoreEvent::NotifyReceived { body, .. } => Some(body.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Iterates every agent `rounds` times, in order.
pub fn pump(agents: &mut [&mut Agent], rounds: usize) {
    for _ in 0..rounds {
        for agent in agents.iter_mut() {
            agent.iterate();
        }
    }
}

/// Like [`pump`], letting the registrar answer after every round.
pub fn pump_with(registrar: &mut LoopbackRegistrar, agents: &mut [&mut Agent], rounds: usize) {
    for _ in 0..rounds {
        for agent in agents.iter_mut() {
            agent.iterate();
        }
        registrar.process();
    }
}

/// Asserts that consecutive states follow the call transition graph.
pub fn assert_valid_path(states: &[CallState]) {
    for pair in states.windows(2) {
        assert!(
            pair[0].can_transition_to(pair[1]),
            "invalid transition {:?} -> {:?} in {:?}",
            pair[0],
            pair[1],
            states
        );
    }
    if let Some(index) = states.iter().position(|s| *s == CallState::Released) {
        assert_eq!(index, states.len() - 1, "state after Released in {:?}", states);
    }
}

/// Media backend whose first `failures` starts fail.
#[derive(Debug, Clone, Default)]
pub struct FlakyMedia {
    failures: Arc<AtomicU32>,
    started: Arc<AtomicU32>,
}

impl FlakyMedia {
    pub fn failing(failures: u32) -> Self {
        FlakyMedia {
            failures: Arc::new(AtomicU32::new(failures)),
            started: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn started(&self) -> u32 {
        self.started.load(Ordering::SeqCst)
    }
}

impl MediaBackend for FlakyMedia {
    fn start_streams(&mut self, _call_id: &CallId, _media: &MediaParams) -> Result<()> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(SipError::Media("audio device busy".to_string()));
        }
        self.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn update_streams(&mut self, _call_id: &CallId, _direction: MediaDirection) -> Result<()> {
        Ok(())
    }

    fn stop_streams(&mut self, _call_id: &CallId) {}
}
