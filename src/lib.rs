// lib.rs - Main library module for rs_sipcore
//
// A SIP user-agent core: calls, registrations, presence subscriptions and
// publications owned by a single-threaded `Core` advanced by `iterate()`.

pub mod auth;
mod call;
mod config;
mod core;
mod error;
pub mod event_system;
mod media;
mod message;
mod publish;
mod reachability;
mod registrar;
mod registration;
mod subscription;
pub mod timer;
mod transport;
mod types;

// Re-export core types
pub use crate::auth::{AuthContext, DigestChallenge, DigestCredentials};
pub use crate::call::*;
pub use crate::config::*;
pub use crate::core::*;
pub use crate::error::*;
pub use crate::event_system::*;
pub use crate::media::*;
pub use crate::message::*;
pub use crate::publish::*;
pub use crate::reachability::*;
pub use crate::registrar::*;
pub use crate::registration::*;
pub use crate::subscription::*;
pub use crate::timer::{Clock, ManualClock, SystemClock};
pub use crate::transport::*;
pub use crate::types::*;

// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        AccountConfig,
        // IDs
        AccountId,
        Call,
        CallHandle,
        CallId,

        // States
        CallState,
        // Main API
        Core,
        CoreBuilder,
        // Configuration
        CoreConfig,
        // Events
        CoreEvent,
        CoreHandle,
        Credentials,
        EventBus,
        GlobalState,
        // Transport
        LoopbackNetwork,
        LoopbackRegistrar,
        PublishId,
        PublishState,
        Reason,
        RegistrationState,

        // Core types
        Result,
        SipError,
        SipUri,
        StartupError,
        SubscriptionId,
        SubscriptionState,
        Transport,
    };
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
