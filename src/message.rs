// Typed SIP messages exchanged between cores over a `Transport`.
use std::fmt;

#[cfg(feature = "serialization")]
use serde::{Deserialize, Serialize};

use crate::{DigestChallenge, DigestCredentials, MediaParams, Result, SipError, SipUri};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub enum SipMethod {
    Invite,
    Ack,
    Bye,
    Cancel,
    Register,
    Subscribe,
    Notify,
    Publish,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Bye => "BYE",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Register => "REGISTER",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Publish => "PUBLISH",
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub enum StartLine {
    Request { method: SipMethod, uri: SipUri },
    Response { status: u16, reason_phrase: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub struct CSeq {
    pub sequence: u32,
    pub method: SipMethod,
}

/// Value of the Subscription-State header carried by NOTIFY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub enum SubscriptionStatus {
    Active,
    Pending,
    Terminated,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub enum MessageBody {
    Media(MediaParams),
    Text { content_type: String, content: String },
}

impl MessageBody {
    pub fn text(content_type: &str, content: &str) -> Self {
        MessageBody::Text {
            content_type: content_type.to_string(),
            content: content.to_string(),
        }
    }

    pub fn as_media(&self) -> Option<&MediaParams> {
        match self {
            MessageBody::Media(media) => Some(media),
            MessageBody::Text { .. } => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageBody::Text { content, .. } => Some(content),
            MessageBody::Media(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub struct SipMessage {
    pub start_line: StartLine,
    pub call_id: String,
    pub cseq: CSeq,
    pub from: SipUri,
    pub from_tag: Option<String>,
    pub to: SipUri,
    pub to_tag: Option<String>,
    pub contact: Option<SipUri>,
    pub expires: Option<u32>,
    pub event: Option<String>,
    pub subscription_state: Option<SubscriptionStatus>,
    pub etag: Option<String>,
    pub if_match: Option<String>,
    pub authorization: Option<DigestCredentials>,
    pub www_authenticate: Option<DigestChallenge>,
    pub user_agent: Option<String>,
    pub body: Option<MessageBody>,
    /// Set by the receiving transport: where the message came from.
    pub source: Option<SipUri>,
}

impl SipMessage {
    pub fn is_request(&self) -> bool {
        matches!(self.start_line, StartLine::Request { .. })
    }

    pub fn is_response(&self) -> bool {
        matches!(self.start_line, StartLine::Response { .. })
    }

    pub fn method(&self) -> Option<SipMethod> {
        match self.start_line {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    pub fn request_uri(&self) -> Option<&SipUri> {
        match self.start_line {
            StartLine::Request { ref uri, .. } => Some(uri),
            StartLine::Response { .. } => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self.start_line {
            StartLine::Response { status, .. } => Some(status),
            StartLine::Request { .. } => None,
        }
    }

    pub fn reason_phrase(&self) -> &str {
        match self.start_line {
            StartLine::Response { ref reason_phrase, .. } => reason_phrase,
            StartLine::Request { .. } => "",
        }
    }

    pub fn media(&self) -> Option<&MediaParams> {
        self.body.as_ref().and_then(MessageBody::as_media)
    }

    /// Where a reply to this message should be sent.
    pub fn reply_target(&self) -> SipUri {
        self.source
            .clone()
            .or_else(|| self.contact.clone())
            .unwrap_or_else(|| self.from.clone())
    }

    /// Builds a response to this request, copying the dialog headers.
    /// A To-tag is added to final responses that lack one.
    pub fn response(&self, status: u16) -> SipMessage {
        let to_tag = match self.to_tag {
            Some(ref tag) => Some(tag.clone()),
            None if status >= 200 || status == 180 || status == 183 => Some(generate_tag()),
            None => None,
        };

        SipMessage {
            start_line: StartLine::Response {
                status,
                reason_phrase: reason_phrase(status).to_string(),
            },
            call_id: self.call_id.clone(),
            cseq: self.cseq,
            from: self.from.clone(),
            from_tag: self.from_tag.clone(),
            to: self.to.clone(),
            to_tag,
            contact: None,
            expires: None,
            event: self.event.clone(),
            subscription_state: None,
            etag: None,
            if_match: None,
            authorization: None,
            www_authenticate: None,
            user_agent: None,
            body: None,
            source: None,
        }
    }

    pub fn with_to_tag(mut self, tag: &str) -> Self {
        self.to_tag = Some(tag.to_string());
        self
    }

    pub fn with_contact(mut self, contact: SipUri) -> Self {
        self.contact = Some(contact);
        self
    }

    pub fn with_expires(mut self, expires: u32) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn with_body(mut self, body: MessageBody) -> Self {
        self.body = Some(body);
        self
    }
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.start_line {
            StartLine::Request { method, ref uri } => {
                write!(f, "{} {} ({} {})", method, uri, self.cseq.sequence, self.call_id)
            }
            StartLine::Response { status, ref reason_phrase } => write!(
                f,
                "{} {} ({} {} {})",
                status, reason_phrase, self.cseq.sequence, self.cseq.method, self.call_id
            ),
        }
    }
}

pub struct SipMessageBuilder {
    method: SipMethod,
    uri: SipUri,
    call_id: Option<String>,
    cseq: u32,
    from: Option<(SipUri, Option<String>)>,
    to: Option<(SipUri, Option<String>)>,
    contact: Option<SipUri>,
    expires: Option<u32>,
    event: Option<String>,
    subscription_state: Option<SubscriptionStatus>,
    etag: Option<String>,
    if_match: Option<String>,
    authorization: Option<DigestCredentials>,
    user_agent: Option<String>,
    body: Option<MessageBody>,
}

impl SipMessageBuilder {
    pub fn request(method: SipMethod, uri: SipUri) -> Self {
        SipMessageBuilder {
            method,
            uri,
            call_id: None,
            cseq: 1,
            from: None,
            to: None,
            contact: None,
            expires: None,
            event: None,
            subscription_state: None,
            etag: None,
            if_match: None,
            authorization: None,
            user_agent: None,
            body: None,
        }
    }

    pub fn call_id(mut self, call_id: &str) -> Self {
        self.call_id = Some(call_id.to_string());
        self
    }

    pub fn cseq(mut self, sequence: u32) -> Self {
        self.cseq = sequence;
        self
    }

    pub fn from(mut self, uri: SipUri, tag: Option<&str>) -> Self {
        self.from = Some((uri, tag.map(str::to_string)));
        self
    }

    pub fn to(mut self, uri: SipUri, tag: Option<&str>) -> Self {
        self.to = Some((uri, tag.map(str::to_string)));
        self
    }

    pub fn contact(mut self, contact: SipUri) -> Self {
        self.contact = Some(contact);
        self
    }

    pub fn expires(mut self, expires: u32) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn event(mut self, event: &str) -> Self {
        self.event = Some(event.to_string());
        self
    }

    pub fn subscription_state(mut self, state: SubscriptionStatus) -> Self {
        self.subscription_state = Some(state);
        self
    }

    pub fn etag(mut self, etag: Option<String>) -> Self {
        self.etag = etag;
        self
    }

    pub fn if_match(mut self, etag: Option<String>) -> Self {
        self.if_match = etag;
        self
    }

    pub fn authorization(mut self, credentials: Option<DigestCredentials>) -> Self {
        self.authorization = credentials;
        self
    }

    pub fn user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = Some(user_agent.to_string());
        self
    }

    pub fn body(mut self, body: Option<MessageBody>) -> Self {
        self.body = body;
        self
    }

    pub fn build(self) -> Result<SipMessage> {
        let call_id = self
            .call_id
            .ok_or_else(|| SipError::InvalidState(format!("{} without Call-ID", self.method)))?;
        let (from, from_tag) = self
            .from
            .ok_or_else(|| SipError::InvalidState(format!("{} without From", self.method)))?;
        let (to, to_tag) = self.to.unwrap_or_else(|| (self.uri.clone(), None));

        Ok(SipMessage {
            start_line: StartLine::Request {
                method: self.method,
                uri: self.uri,
            },
            call_id,
            cseq: CSeq {
                sequence: self.cseq,
                method: self.method,
            },
            from,
            from_tag,
            to,
            to_tag,
            contact: self.contact,
            expires: self.expires,
            event: self.event,
            subscription_state: self.subscription_state,
            etag: self.etag,
            if_match: self.if_match,
            authorization: self.authorization,
            www_authenticate: None,
            user_agent: self.user_agent,
            body: self.body,
            source: None,
        })
    }
}

pub fn generate_call_id(host: &str) -> String {
    format!("{}@{}", uuid::Uuid::new_v4().simple(), host)
}

pub fn generate_tag() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..10].to_string()
}

// Response reason phrases
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        183 => "Session Progress",
        200 => "OK",
        202 => "Accepted",
        301 => "Moved Permanently",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        410 => "Gone",
        412 => "Conditional Request Failed",
        415 => "Unsupported Media Type",
        480 => "Temporarily Unavailable",
        481 => "Call/Transaction Does Not Exist",
        484 => "Address Incomplete",
        486 => "Busy Here",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        489 => "Bad Event",
        491 => "Request Pending",
        500 => "Server Internal Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Server Time-out",
        600 => "Busy Everywhere",
        603 => "Decline",
        606 => "Not Acceptable",
        _ => "Unknown",
    }
}
