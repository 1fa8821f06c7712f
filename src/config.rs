// Configuration types
use std::time::Duration;

#[cfg(feature = "serialization")]
use serde::{Deserialize, Serialize};

use crate::{Codec, Result, SipError, SipUri};

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serialization", serde(default))]
pub struct CoreConfig {
    /// Address this core is reachable at; also the From of outgoing calls.
    pub identity: String,
    pub user_agent: String,
    pub max_calls: usize,
    pub max_accounts: usize,
    /// Fraction of a granted expiry after which registrations,
    /// subscriptions and publications are refreshed.
    pub refresh_ratio: f64,
    pub subscribe_policy: SubscribePolicy,
    pub timers: TimerConfig,
    pub retry: RetryPolicy,
    pub iterate: IterateSchedule,
    pub media: MediaConfig,
    pub accounts: Vec<AccountConfig>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            identity: "sip:anonymous@localhost".to_string(),
            user_agent: "RustSIP/1.0".to_string(),
            max_calls: 100,
            max_accounts: 10,
            refresh_ratio: 0.5,
            subscribe_policy: SubscribePolicy::Wait,
            timers: TimerConfig::default(),
            retry: RetryPolicy::default(),
            iterate: IterateSchedule::default(),
            media: MediaConfig::default(),
            accounts: vec![],
        }
    }
}

impl CoreConfig {
    pub fn new(identity: &str) -> Self {
        CoreConfig {
            identity: identity.to_string(),
            ..CoreConfig::default()
        }
    }

    pub fn identity_uri(&self) -> Result<SipUri> {
        SipUri::parse(&self.identity)
    }

    pub fn validate(&self) -> Result<()> {
        self.identity_uri()?;
        if !(self.refresh_ratio > 0.0 && self.refresh_ratio <= 1.0) {
            return Err(SipError::Config(format!(
                "refresh_ratio must be in (0, 1], got {}",
                self.refresh_ratio
            )));
        }
        if self.max_calls == 0 {
            return Err(SipError::Config("max_calls must be at least 1".to_string()));
        }
        if self.retry.initial_delay.is_zero() || self.retry.max_delay < self.retry.initial_delay {
            return Err(SipError::Config("retry delays are inconsistent".to_string()));
        }
        self.media.codecs()?;
        for account in &self.accounts {
            account.identity()?;
            account.registrar_uri()?;
        }
        Ok(())
    }

    #[cfg(feature = "serialization")]
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: CoreConfig =
            serde_json::from_str(json).map_err(|e| SipError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

/// How incoming SUBSCRIBE requests are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub enum SubscribePolicy {
    /// Park the subscription in Pending until the application decides.
    Wait,
    Deny,
    Accept,
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serialization", serde(default))]
pub struct TimerConfig {
    /// Lifetime of a client transaction without a response (64*T1).
    pub transaction_timeout: Duration,
    /// An unanswered incoming call is ended after this delay.
    pub incoming_call_timeout: Duration,
    pub keep_alive_interval: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        TimerConfig {
            transaction_timeout: Duration::from_millis(32_000),
            incoming_call_timeout: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serialization", serde(default))]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2,
        }
    }
}

/// Intervals at which the embedding layer should call `iterate()`.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serialization", serde(default))]
pub struct IterateSchedule {
    /// Used during startup and after reachability or push events.
    pub fast_interval: Duration,
    pub foreground_interval: Duration,
    pub background_interval: Duration,
    /// How long a fast window lasts once opened.
    pub fast_window: Duration,
}

impl Default for IterateSchedule {
    fn default() -> Self {
        IterateSchedule {
            fast_interval: Duration::from_millis(20),
            foreground_interval: Duration::from_millis(100),
            background_interval: Duration::from_millis(500),
            fast_window: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serialization", serde(default))]
pub struct MediaConfig {
    /// `name/clock_rate` entries in preference order.
    pub codecs: Vec<String>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        MediaConfig {
            codecs: vec![
                "opus/48000".to_string(),
                "PCMU/8000".to_string(),
                "PCMA/8000".to_string(),
            ],
        }
    }
}

impl MediaConfig {
    pub fn codecs(&self) -> Result<Vec<Codec>> {
        self.codecs.iter().map(|c| c.parse()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: &str, password: &str) -> Self {
        Credentials {
            username: username.to_string(),
            password: password.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub struct AccountConfig {
    pub display_name: String,
    pub username: String,
    pub domain: String,
    pub password: Option<String>,
    /// Registrar URI; defaults to the account's domain.
    pub registrar: Option<String>,
    pub expire_seconds: u32,
    pub register_on_add: bool,
}

impl AccountConfig {
    pub fn new(username: &str, domain: &str) -> Self {
        AccountConfig {
            display_name: username.to_string(),
            username: username.to_string(),
            domain: domain.to_string(),
            password: None,
            registrar: None,
            expire_seconds: 3600,
            register_on_add: true,
        }
    }

    pub fn password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    pub fn registrar(mut self, registrar: &str) -> Self {
        self.registrar = Some(registrar.to_string());
        self
    }

    pub fn expire_seconds(mut self, expires: u32) -> Self {
        self.expire_seconds = expires;
        self
    }

    pub fn identity(&self) -> Result<SipUri> {
        SipUri::parse(&format!("sip:{}@{}", self.username, self.domain))
    }

    pub fn registrar_uri(&self) -> Result<SipUri> {
        match self.registrar {
            Some(ref registrar) => SipUri::parse(registrar),
            None => Ok(SipUri::new(&self.domain)),
        }
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.password
            .as_ref()
            .map(|password| Credentials::new(&self.username, password))
    }
}
