//! Event delivery for a [`Core`](crate::Core).
//!
//! Every observable change is a [`CoreEvent`]. The core queues events while a
//! tick runs and hands them to its [`EventBus`] at the end of `iterate()`
//! (and during `stop()`), on the core thread.
//!
//! Two ways to listen:
//! - handlers registered with [`EventBus::on`] run synchronously, in
//!   registration order;
//! - channel subscribers ([`EventBus::subscribe`], [`EventBus::stream`])
//!   receive owned clones and may live on other threads or tasks.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::{Mutex, RwLock};
#[cfg(feature = "serialization")]
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{
    AccountId, CallId, CallState, ConfiguringState, ErrorInfo, GlobalState, PublishId,
    PublishState, Reason, RegistrationState, SubscriptionDirection, SubscriptionId,
    SubscriptionState,
};

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serialization", serde(tag = "type"))]
pub enum CoreEvent {
    GlobalStateChanged {
        state: GlobalState,
        message: String,
    },
    ConfiguringStatus {
        status: ConfiguringState,
        message: Option<String>,
    },
    CallStateChanged {
        call_id: CallId,
        state: CallState,
        reason: Reason,
        error_info: Option<Arc<ErrorInfo>>,
        message: String,
    },
    RegistrationStateChanged {
        account_id: AccountId,
        state: RegistrationState,
        reason: Reason,
        error_info: Option<Arc<ErrorInfo>>,
        message: String,
    },
    /// Answer with [`Core::set_credentials`](crate::Core::set_credentials).
    AuthenticationRequested {
        account_id: AccountId,
        realm: String,
        username: String,
    },
    SubscriptionStateChanged {
        subscription_id: SubscriptionId,
        direction: SubscriptionDirection,
        state: SubscriptionState,
        reason: Reason,
        error_info: Option<Arc<ErrorInfo>>,
    },
    NotifyReceived {
        subscription_id: SubscriptionId,
        event: String,
        body: Option<String>,
    },
    PublishStateChanged {
        publish_id: PublishId,
        state: PublishState,
        reason: Reason,
        error_info: Option<Arc<ErrorInfo>>,
    },
    NetworkReachable(bool),
}

impl CoreEvent {
    pub fn call_state(&self) -> Option<(&CallId, CallState)> {
        match self {
            CoreEvent::CallStateChanged { call_id, state, .. } => Some((call_id, *state)),
            _ => None,
        }
    }

    pub fn global_state(&self) -> Option<GlobalState> {
        match self {
            CoreEvent::GlobalStateChanged { state, .. } => Some(*state),
            _ => None,
        }
    }

    pub fn registration_state(&self) -> Option<(&AccountId, RegistrationState)> {
        match self {
            CoreEvent::RegistrationStateChanged {
                account_id, state, ..
            } => Some((account_id, *state)),
            _ => None,
        }
    }

    pub fn subscription_state(&self) -> Option<(&SubscriptionId, SubscriptionState)> {
        match self {
            CoreEvent::SubscriptionStateChanged {
                subscription_id,
                state,
                ..
            } => Some((subscription_id, *state)),
            _ => None,
        }
    }

    pub fn publish_state(&self) -> Option<(&PublishId, PublishState)> {
        match self {
            CoreEvent::PublishStateChanged {
                publish_id, state, ..
            } => Some((publish_id, *state)),
            _ => None,
        }
    }
}

/// Type alias for boxed event handlers
pub type EventHandler = Arc<dyn Fn(&CoreEvent) + Send + Sync>;

/// Handler ID for unsubscribing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(usize);

/// Event bus for managing and dispatching core events
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<Vec<(HandlerId, EventHandler)>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<CoreEvent>>>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, called for every event on the core thread
    pub fn on<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&CoreEvent) + Send + Sync + 'static,
    {
        let handler_id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((handler_id, Arc::new(handler)));
        handler_id
    }

    /// Register a handler removed again when the returned guard is dropped
    pub fn on_auto<F>(self: &Arc<Self>, handler: F) -> AutoUnsubscribe
    where
        F: Fn(&CoreEvent) + Send + Sync + 'static,
    {
        let handler_id = self.on(handler);
        AutoUnsubscribe {
            bus: Arc::downgrade(self),
            handler_id,
        }
    }

    /// Remove a handler by ID
    pub fn off(&self, handler_id: HandlerId) {
        self.handlers.write().retain(|(id, _)| *id != handler_id);
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<CoreEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn stream(&self) -> EventStream {
        EventStream {
            receiver: self.subscribe(),
        }
    }

    /// Dispatch one event to handlers then channel subscribers.
    pub fn emit(&self, event: &CoreEvent) {
        // Handlers may call `off` on this bus, so run them on a snapshot
        let handlers: Vec<EventHandler> =
            self.handlers.read().iter().map(|(_, h)| h.clone()).collect();
        for handler in handlers {
            handler(event);
        }

        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn clear_all(&self) {
        self.handlers.write().clear();
        self.subscribers.lock().clear();
    }
}

/// A handle that automatically unsubscribes when dropped
pub struct AutoUnsubscribe {
    bus: Weak<EventBus>,
    handler_id: HandlerId,
}

impl AutoUnsubscribe {
    pub fn id(&self) -> HandlerId {
        self.handler_id
    }
}

impl Drop for AutoUnsubscribe {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.off(self.handler_id);
        }
    }
}

/// `Stream` of core events; ends once the bus is cleared or dropped.
pub struct EventStream {
    receiver: mpsc::UnboundedReceiver<CoreEvent>,
}

impl EventStream {
    /// Next event already delivered, without waiting.
    pub fn try_next(&mut self) -> Option<CoreEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for EventStream {
    type Item = CoreEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<CoreEvent>> {
        self.receiver.poll_recv(cx)
    }
}

/// Macro to register event handlers more easily
#[macro_export]
macro_rules! on {
    ($bus:expr, $pattern:pat => $body:expr) => {
        $bus.on(move |event: &$crate::CoreEvent| {
            if let $pattern = event {
                $body
            }
        })
    };
}
