// Shared value types: identifiers, addresses, state enums and failure reasons.
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[cfg(feature = "serialization")]
use serde::{Deserialize, Serialize};

use crate::{Result, SipError};

// SIP address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub struct SipUri {
    pub scheme: String,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl SipUri {
    pub fn new(host: &str) -> Self {
        SipUri {
            scheme: "sip".to_string(),
            user: None,
            host: host.to_string(),
            port: None,
        }
    }

    pub fn with_user(user: &str, host: &str) -> Self {
        SipUri {
            user: Some(user.to_string()),
            ..SipUri::new(host)
        }
    }

    pub fn parse(uri: &str) -> Result<Self> {
        let uri = uri.trim();
        let uri = uri
            .strip_prefix('<')
            .and_then(|u| u.strip_suffix('>'))
            .unwrap_or(uri);

        let scheme_end = uri
            .find(':')
            .ok_or_else(|| SipError::InvalidUri(format!("no scheme in {:?}", uri)))?;
        let scheme = uri[..scheme_end].to_lowercase();
        if scheme != "sip" && scheme != "sips" {
            return Err(SipError::InvalidUri(format!("invalid scheme: {}", scheme)));
        }

        // Parameters and headers are not carried by this core
        let rest = &uri[scheme_end + 1..];
        let rest = rest.split([';', '?']).next().unwrap_or_default();

        let (user, host_part) = match rest.rsplit_once('@') {
            Some((user_info, host)) => {
                // Passwords in URIs are deprecated; keep only the user part
                let user = user_info.split(':').next().unwrap_or_default();
                if user.is_empty() {
                    return Err(SipError::InvalidUri(format!("empty user in {:?}", uri)));
                }
                (Some(user.to_string()), host)
            }
            None => (None, rest),
        };

        let (host, port) = if let Some(v6) = host_part.strip_prefix('[') {
            let end = v6
                .find(']')
                .ok_or_else(|| SipError::InvalidUri("unterminated IPv6 reference".to_string()))?;
            let port = match v6[end + 1..].strip_prefix(':') {
                Some(p) => Some(parse_port(p)?),
                None => None,
            };
            (v6[..end].to_string(), port)
        } else {
            match host_part.split_once(':') {
                Some((h, p)) => (h.to_string(), Some(parse_port(p)?)),
                None => (host_part.to_string(), None),
            }
        };

        if host.is_empty() {
            return Err(SipError::InvalidUri(format!("missing host in {:?}", uri)));
        }

        Ok(SipUri {
            scheme,
            user,
            host: host.to_lowercase(),
            port,
        })
    }

    /// `user@host` (or just `host`), used to route and match addresses.
    pub fn address_of_record(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    /// The domain part of this address as a bare `sip:host` URI.
    pub fn domain_uri(&self) -> SipUri {
        SipUri {
            scheme: self.scheme.clone(),
            user: None,
            host: self.host.clone(),
            port: self.port,
        }
    }
}

fn parse_port(port: &str) -> Result<u16> {
    port.parse()
        .map_err(|_| SipError::InvalidUri(format!("invalid port: {}", port)))
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(ref user) = self.user {
            write!(f, "{}@", user)?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            write!(f, "{}", self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

impl FromStr for SipUri {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self> {
        SipUri::parse(s)
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
        pub struct $name(pub String);

        impl $name {
            pub fn generate() -> Self {
                $name(uuid::Uuid::new_v4().simple().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Doubles as the SIP Call-ID of the call's dialog.
    CallId
);
string_id!(AccountId);
string_id!(SubscriptionId);
string_id!(PublishId);

/// Typed handle to a call owned by a [`Core`](crate::Core).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallHandle(pub CallId);

impl CallHandle {
    pub fn id(&self) -> &CallId {
        &self.0
    }
}

// Global states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub enum GlobalState {
    Off,
    Startup,
    Configuring,
    On,
    Shutdown,
    /// Readiness marker mirrored from the bindings; treated like `On`.
    Ready,
}

impl GlobalState {
    pub fn is_running(&self) -> bool {
        matches!(self, GlobalState::On | GlobalState::Ready)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub enum ConfiguringState {
    Successful,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

// Call states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub enum CallState {
    Idle,
    OutgoingInit,
    OutgoingProgress,
    OutgoingRinging,
    OutgoingEarlyMedia,
    IncomingReceived,
    IncomingEarlyMedia,
    Connected,
    StreamsRunning,
    Pausing,
    Paused,
    Resuming,
    PausedByRemote,
    End,
    Error,
    Released,
}

impl CallState {
    /// End, Error and Released: the dialog is over.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::End | CallState::Error | CallState::Released)
    }

    pub fn is_established(&self) -> bool {
        matches!(
            self,
            CallState::Connected
                | CallState::StreamsRunning
                | CallState::Pausing
                | CallState::Paused
                | CallState::Resuming
                | CallState::PausedByRemote
        )
    }

    pub fn can_transition_to(&self, next: CallState) -> bool {
        use CallState::*;

        match (*self, next) {
            (Released, _) => false,
            (End | Error, Released) => true,
            (End | Error, _) => false,
            (Idle, OutgoingInit | IncomingReceived) => true,
            (Idle, _) => false,
            (_, End | Error) => true,
            (OutgoingInit, OutgoingProgress) => true,
            (OutgoingProgress, OutgoingRinging | OutgoingEarlyMedia | Connected) => true,
            (OutgoingRinging, OutgoingEarlyMedia | Connected) => true,
            (OutgoingEarlyMedia, Connected) => true,
            (IncomingReceived, IncomingEarlyMedia | Connected) => true,
            (IncomingEarlyMedia, Connected) => true,
            (Connected, StreamsRunning) => true,
            (StreamsRunning, Pausing | PausedByRemote) => true,
            (Pausing, Paused | StreamsRunning) => true,
            (Paused, Resuming | PausedByRemote) => true,
            (Resuming, StreamsRunning | Paused) => true,
            (PausedByRemote, StreamsRunning | Paused) => true,
            _ => false,
        }
    }
}

// Registration states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub enum RegistrationState {
    None,
    Progress,
    Ok,
    Cleared,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub enum SubscriptionState {
    None,
    OutgoingProgress,
    IncomingReceived,
    Pending,
    Active,
    Expiring,
    Terminated,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub enum SubscriptionDirection {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub enum PublishState {
    None,
    Progress,
    Ok,
    Expiring,
    Error,
    Cleared,
}

/// Failure cause attached to calls, registrations, subscriptions and publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub enum Reason {
    None,
    NoResponse,
    BadCredentials,
    Declined,
    NotFound,
    NotAnswered,
    Busy,
    Media,
    IoError,
    DoNotDisturb,
    Unauthorized,
    NotAcceptable,
    NoMatch,
    MovedPermanently,
    Gone,
    TemporarilyUnavailable,
    AddressIncomplete,
    NotImplemented,
    BadGateway,
    ServerTimeout,
    Unknown,
}

impl Reason {
    pub fn from_status(status: u16) -> Reason {
        match status {
            100..=299 => Reason::None,
            301 => Reason::MovedPermanently,
            401 | 407 => Reason::Unauthorized,
            403 => Reason::BadCredentials,
            404 => Reason::NotFound,
            408 => Reason::NotAnswered,
            410 => Reason::Gone,
            415 => Reason::Media,
            480 => Reason::TemporarilyUnavailable,
            481 => Reason::NoMatch,
            484 => Reason::AddressIncomplete,
            486 => Reason::Busy,
            488 | 606 => Reason::NotAcceptable,
            501 => Reason::NotImplemented,
            502 => Reason::BadGateway,
            503 => Reason::IoError,
            504 => Reason::ServerTimeout,
            600 => Reason::DoNotDisturb,
            603 => Reason::Declined,
            _ => Reason::Unknown,
        }
    }

    pub fn to_status(&self) -> u16 {
        match self {
            Reason::None => 200,
            Reason::NoResponse => 408,
            Reason::BadCredentials => 403,
            Reason::Declined => 603,
            Reason::NotFound => 404,
            Reason::NotAnswered => 408,
            Reason::Busy => 486,
            Reason::Media => 415,
            Reason::IoError => 503,
            Reason::DoNotDisturb => 600,
            Reason::Unauthorized => 401,
            Reason::NotAcceptable => 488,
            Reason::NoMatch => 481,
            Reason::MovedPermanently => 301,
            Reason::Gone => 410,
            Reason::TemporarilyUnavailable => 480,
            Reason::AddressIncomplete => 484,
            Reason::NotImplemented => 501,
            Reason::BadGateway => 502,
            Reason::ServerTimeout => 504,
            Reason::Unknown => 400,
        }
    }

    /// Non-retryable failures wait for the application to act.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Reason::BadCredentials | Reason::Unauthorized | Reason::Declined | Reason::NotFound
        )
    }
}

/// Immutable description of a failure. Shared as `Arc<ErrorInfo>` once attached.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub struct ErrorInfo {
    protocol: String,
    reason: Reason,
    status: u16,
    phrase: String,
    sub: Option<Box<ErrorInfo>>,
}

impl ErrorInfo {
    pub fn new(reason: Reason, status: u16, phrase: &str) -> Self {
        ErrorInfo {
            protocol: "SIP".to_string(),
            reason,
            status,
            phrase: phrase.to_string(),
            sub: None,
        }
    }

    /// Failure detected locally (timeouts, transport), not reported by a peer.
    pub fn local(reason: Reason, phrase: &str) -> Self {
        ErrorInfo {
            protocol: "local".to_string(),
            ..ErrorInfo::new(reason, 0, phrase)
        }
    }

    pub fn from_status(status: u16, phrase: &str) -> Self {
        ErrorInfo::new(Reason::from_status(status), status, phrase)
    }

    pub fn with_sub(mut self, sub: ErrorInfo) -> Self {
        self.sub = Some(Box::new(sub));
        self
    }

    pub fn shared(self) -> Arc<ErrorInfo> {
        Arc::new(self)
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn reason(&self) -> Reason {
        self.reason
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn phrase(&self) -> &str {
        &self.phrase
    }

    pub fn sub(&self) -> Option<&ErrorInfo> {
        self.sub.as_deref()
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({} {} {})", self.reason, self.protocol, self.status, self.phrase)?;
        if let Some(ref sub) = self.sub {
            write!(f, " <- {}", sub)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_parsing() {
        let uri = SipUri::parse("sip:alice@Example.com:5070;transport=udp").unwrap();
        assert_eq!(uri.user.as_deref(), Some("alice"));
        assert_eq!(uri.host, "example.com");
        assert_eq!(uri.port, Some(5070));
        assert_eq!(uri.to_string(), "sip:alice@example.com:5070");
        assert_eq!(uri.address_of_record(), "alice@example.com");

        let v6 = SipUri::parse("<sips:[::1]:5061>").unwrap();
        assert_eq!(v6.host, "::1");
        assert_eq!(v6.to_string(), "sips:[::1]:5061");

        assert!(SipUri::parse("tel:+33123").is_err());
        assert!(SipUri::parse("sip:bob@").is_err());
        assert!(SipUri::parse("sip:host:notaport").is_err());
    }

    #[test]
    fn test_call_transition_graph() {
        use CallState::*;

        assert!(Idle.can_transition_to(OutgoingInit));
        assert!(IncomingReceived.can_transition_to(Connected));
        assert!(IncomingReceived.can_transition_to(End));
        assert!(!IncomingReceived.can_transition_to(Released));
        assert!(!Idle.can_transition_to(End));
        assert!(Error.can_transition_to(Released));
        assert!(!End.can_transition_to(Error));
        assert!(!Connected.can_transition_to(Paused));
        for next in [Idle, Connected, End, Error, Released] {
            assert!(!Released.can_transition_to(next));
        }
    }

    #[test]
    fn test_reason_status_mapping() {
        for reason in [
            Reason::BadCredentials,
            Reason::Declined,
            Reason::NotFound,
            Reason::Busy,
            Reason::IoError,
            Reason::NotAcceptable,
            Reason::ServerTimeout,
        ] {
            assert_eq!(Reason::from_status(reason.to_status()), reason);
        }
        assert_eq!(Reason::from_status(407), Reason::Unauthorized);
        assert_eq!(Reason::from_status(599), Reason::Unknown);
        assert!(!Reason::Declined.is_retryable());
        assert!(Reason::NoResponse.is_retryable());
    }

    #[test]
    fn test_error_info_chain() {
        let info = ErrorInfo::from_status(503, "Service Unavailable")
            .with_sub(ErrorInfo::local(Reason::IoError, "connection reset"));
        assert_eq!(info.reason(), Reason::IoError);
        assert_eq!(info.sub().map(|s| s.protocol()), Some("local"));
        assert!(info.to_string().contains("connection reset"));
    }
}
