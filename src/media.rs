// Media parameters, offer/answer and the stream backend seam.
use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serialization")]
use serde::{Deserialize, Serialize};

use crate::{CallId, Result, SipError};

// RTP codec representation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub struct Codec {
    pub encoding_name: String,
    pub clock_rate: u32,
}

impl Codec {
    pub fn new(encoding_name: &str, clock_rate: u32) -> Self {
        Codec {
            encoding_name: encoding_name.to_string(),
            clock_rate,
        }
    }

    pub fn pcmu() -> Self {
        Codec::new("PCMU", 8000)
    }

    pub fn pcma() -> Self {
        Codec::new("PCMA", 8000)
    }

    pub fn opus() -> Self {
        Codec::new("opus", 48000)
    }

    /// Encoding names compare case-insensitively, as in SDP rtpmap lines.
    pub fn matches(&self, other: &Codec) -> bool {
        self.clock_rate == other.clock_rate
            && self.encoding_name.eq_ignore_ascii_case(&other.encoding_name)
    }
}

impl FromStr for Codec {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self> {
        let (name, rate) = s
            .split_once('/')
            .ok_or_else(|| SipError::Config(format!("codec {:?} is not name/rate", s)))?;
        let clock_rate = rate
            .parse()
            .map_err(|_| SipError::Config(format!("invalid clock rate in {:?}", s)))?;
        if name.is_empty() {
            return Err(SipError::Config(format!("empty codec name in {:?}", s)));
        }
        Ok(Codec::new(name, clock_rate))
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.encoding_name, self.clock_rate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub enum MediaDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl MediaDirection {
    /// Direction to answer with when the peer offers `self`.
    pub fn answer(&self) -> MediaDirection {
        match self {
            MediaDirection::SendRecv => MediaDirection::SendRecv,
            MediaDirection::SendOnly => MediaDirection::RecvOnly,
            MediaDirection::RecvOnly => MediaDirection::SendOnly,
            MediaDirection::Inactive => MediaDirection::Inactive,
        }
    }

    /// True when an offer in this direction puts the offerer on hold.
    pub fn is_hold(&self) -> bool {
        matches!(self, MediaDirection::SendOnly | MediaDirection::Inactive)
    }
}

/// Session description carried in INVITE/2xx bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub struct MediaParams {
    pub codecs: Vec<Codec>,
    pub direction: MediaDirection,
}

impl MediaParams {
    pub fn new(codecs: Vec<Codec>) -> Self {
        MediaParams {
            codecs,
            direction: MediaDirection::SendRecv,
        }
    }

    pub fn with_direction(mut self, direction: MediaDirection) -> Self {
        self.direction = direction;
        self
    }
}

pub struct SdpNegotiator;

impl SdpNegotiator {
    /// Keeps the offered codecs we support, in the offerer's order.
    pub fn create_answer(offer: &MediaParams, local: &[Codec]) -> Option<MediaParams> {
        let codecs: Vec<Codec> = offer
            .codecs
            .iter()
            .filter(|c| local.iter().any(|l| l.matches(c)))
            .cloned()
            .collect();

        if codecs.is_empty() {
            return None;
        }

        Some(MediaParams {
            codecs,
            direction: offer.direction.answer(),
        })
    }

    /// Checks an answer against the offer it replies to.
    pub fn accept_answer(offer: &MediaParams, answer: &MediaParams) -> Option<MediaParams> {
        let codecs: Vec<Codec> = answer
            .codecs
            .iter()
            .filter(|c| offer.codecs.iter().any(|o| o.matches(c)))
            .cloned()
            .collect();

        if codecs.is_empty() {
            return None;
        }

        Some(MediaParams {
            codecs,
            direction: answer.direction,
        })
    }
}

/// The media stack a core drives. Streams are started once a call is
/// connected and stopped when it ends.
pub trait MediaBackend: Send {
    fn start_streams(&mut self, call_id: &CallId, media: &MediaParams) -> Result<()>;

    fn update_streams(&mut self, call_id: &CallId, direction: MediaDirection) -> Result<()>;

    fn stop_streams(&mut self, call_id: &CallId);
}

/// Backend without real streams; every operation succeeds.
#[derive(Debug, Default)]
pub struct NullMediaBackend;

impl MediaBackend for NullMediaBackend {
    fn start_streams(&mut self, _call_id: &CallId, _media: &MediaParams) -> Result<()> {
        Ok(())
    }

    fn update_streams(&mut self, _call_id: &CallId, _direction: MediaDirection) -> Result<()> {
        Ok(())
    }

    fn stop_streams(&mut self, _call_id: &CallId) {}
}
